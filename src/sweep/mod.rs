//! Sweep parameters, results, the sequential sweep runner, nested series and
//! resistance monitoring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod monitor;
pub mod params;
pub mod result;
pub mod runner;
pub mod series;

pub use monitor::{run_monitor, MonitorConfig};
pub use params::{
    DifferentialConfig, DifferentialParameters, HallConfig, HallParameters, IvSweepConfig,
    IvSweepParameters, SweepAxis, SweepKind, SweepParameters, TemperatureSweepConfig,
    TemperatureSweepParameters,
};
pub use result::{Columns, MeasurementResult, MeasurementRow};
pub use runner::{run_sweep, SweepError, SweepPlan};
pub use series::{
    validate_series, FieldPlane, OuterAxis, SeriesPoint, SeriesPosition, SeriesRunner,
    SweepSeries,
};

/// Cooperative cancellation handle.
///
/// Clones share one flag. The runner checks it before each setpoint, so a
/// raised stop takes effect at the next setpoint boundary.
#[derive(Debug, Clone, Default)]
pub struct EmergencyStop {
    raised: Arc<AtomicBool>,
}

impl EmergencyStop {
    /// New, lowered stop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// True once [`raise`](Self::raise) was called on any clone.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Lowers the stop so the handle can be reused for the next sweep.
    pub fn reset(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }
}
