//! Sweep parameter records.
//!
//! Each measurement type has a plain `*Config` struct (public fields, serde,
//! defaults) and an immutable `*Parameters` record produced by
//! `Config::build()`. Deserializing a `*Parameters` goes through the same
//! validation, so an invalid record cannot exist.
//!
//! Construction checks shape (finite values, `num_points >= 2`,
//! `start != stop`) and the rated maxima of the instrument class the
//! measurement drives. Station-specific safety limits are a separate,
//! later check (see [`crate::safety::validate_sweep`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::instrument::{FieldAxis, InstrumentModel};

/// Lock-in settling, in time constants, before a reading is trusted.
pub const LOCKIN_SETTLE_TIME_CONSTANTS: f64 = 5.0;

/// Measurement type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    /// Current-voltage characteristic.
    Iv,
    /// Differential conductance dI/dV.
    Differential,
    /// Hall resistance versus field.
    Hall,
    /// Resistance versus temperature.
    Temperature,
    /// Resistance versus time at a fixed excitation.
    Monitor,
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepKind::Iv => "iv",
            SweepKind::Differential => "differential",
            SweepKind::Hall => "hall",
            SweepKind::Temperature => "temperature",
            SweepKind::Monitor => "monitor",
        };
        f.write_str(name)
    }
}

/// Linear sweep axis, both endpoints inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepAxis {
    start: f64,
    stop: f64,
    num_points: usize,
}

impl SweepAxis {
    /// Validates and creates an axis.
    pub fn new(start: f64, stop: f64, num_points: usize) -> AppResult<Self> {
        require_finite("start", start)?;
        require_finite("stop", stop)?;
        if num_points < 2 {
            return Err(DaqError::Configuration(format!(
                "num_points must be at least 2, got {}",
                num_points
            )));
        }
        if start == stop {
            return Err(DaqError::Configuration(format!(
                "start and stop must differ, both are {}",
                start
            )));
        }
        Ok(Self {
            start,
            stop,
            num_points,
        })
    }

    /// First setpoint.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Last setpoint.
    pub fn stop(&self) -> f64 {
        self.stop
    }

    /// Number of setpoints.
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    /// Signed distance between consecutive setpoints.
    pub fn step(&self) -> f64 {
        (self.stop - self.start) / (self.num_points - 1) as f64
    }

    /// Largest magnitude reached on the axis.
    pub fn peak_magnitude(&self) -> f64 {
        self.start.abs().max(self.stop.abs())
    }

    /// Smallest and largest setpoint.
    pub fn bounds(&self) -> (f64, f64) {
        (self.start.min(self.stop), self.start.max(self.stop))
    }

    /// Setpoints from `start` to `stop`, inclusive, evenly spaced.
    pub fn setpoints(&self) -> Vec<f64> {
        let step = self.step();
        let last = self.num_points - 1;
        (0..self.num_points)
            .map(|i| if i == last { self.stop } else { self.start + step * i as f64 })
            .collect()
    }

    fn with_return(&self, bidirectional: bool) -> Vec<f64> {
        let mut points = self.setpoints();
        if bidirectional {
            let reverse: Vec<f64> = points.iter().rev().copied().collect();
            points.extend(reverse);
        }
        points
    }
}

pub(crate) fn require_finite(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "{} must be a finite number, got {}",
            name, value
        )))
    }
}

pub(crate) fn require_positive(name: &str, value: f64) -> AppResult<()> {
    require_finite(name, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "{} must be positive, got {}",
            name, value
        )))
    }
}

fn require_rated(name: &str, value: f64, rated: Option<f64>, model: InstrumentModel) -> AppResult<()> {
    match rated {
        Some(max) if value.abs() > max => Err(DaqError::Configuration(format!(
            "{} = {} exceeds the {} rating of {}",
            name, value, model, max
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn require_averages(averages: u32) -> AppResult<()> {
    if averages == 0 {
        return Err(DaqError::Configuration(
            "averages must be at least 1".to_string(),
        ));
    }
    Ok(())
}

// =============================================================================
// I-V
// =============================================================================

fn default_compliance_voltage() -> f64 {
    10.0
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_one() -> u32 {
    1
}

/// Editable description of an I-V sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvSweepConfig {
    /// First source current (A).
    pub start_current: f64,
    /// Last source current (A).
    pub stop_current: f64,
    /// Number of setpoints per direction.
    pub num_points: usize,
    /// Current source compliance (V).
    #[serde(default = "default_compliance_voltage")]
    pub compliance_voltage: f64,
    /// Fixed source range (A), auto-range when absent.
    #[serde(default)]
    pub current_range: Option<f64>,
    /// Wait after each setpoint.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Readings averaged per setpoint.
    #[serde(default = "default_one")]
    pub averages: u32,
    /// Sweep back to `start_current` after reaching `stop_current`.
    #[serde(default)]
    pub bidirectional: bool,
}

impl IvSweepConfig {
    /// Config with station defaults for everything but the axis.
    pub fn new(start_current: f64, stop_current: f64, num_points: usize) -> Self {
        Self {
            start_current,
            stop_current,
            num_points,
            compliance_voltage: default_compliance_voltage(),
            current_range: None,
            settle_delay: default_settle_delay(),
            averages: 1,
            bidirectional: false,
        }
    }

    /// Validates into immutable parameters.
    pub fn build(self) -> AppResult<IvSweepParameters> {
        IvSweepParameters::try_from(self)
    }
}

/// Validated I-V sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "IvSweepConfig", into = "IvSweepConfig")]
pub struct IvSweepParameters {
    axis: SweepAxis,
    compliance_voltage: f64,
    current_range: Option<f64>,
    settle_delay: Duration,
    averages: u32,
    bidirectional: bool,
}

impl TryFrom<IvSweepConfig> for IvSweepParameters {
    type Error = DaqError;

    fn try_from(c: IvSweepConfig) -> AppResult<Self> {
        let model = InstrumentModel::Keithley6221;
        let rating = model.rating();
        let axis = SweepAxis::new(c.start_current, c.stop_current, c.num_points)?;
        require_rated("start_current", axis.start, rating.max_current, model)?;
        require_rated("stop_current", axis.stop, rating.max_current, model)?;
        require_positive("compliance_voltage", c.compliance_voltage)?;
        require_rated("compliance_voltage", c.compliance_voltage, rating.max_voltage, model)?;
        if let Some(range) = c.current_range {
            require_positive("current_range", range)?;
            require_rated("current_range", range, rating.max_current, model)?;
            if axis.peak_magnitude() > range {
                return Err(DaqError::Configuration(format!(
                    "current_range {} is smaller than the sweep peak {}",
                    range,
                    axis.peak_magnitude()
                )));
            }
        }
        require_averages(c.averages)?;
        Ok(Self {
            axis,
            compliance_voltage: c.compliance_voltage,
            current_range: c.current_range,
            settle_delay: c.settle_delay,
            averages: c.averages,
            bidirectional: c.bidirectional,
        })
    }
}

impl From<IvSweepParameters> for IvSweepConfig {
    fn from(p: IvSweepParameters) -> Self {
        Self {
            start_current: p.axis.start,
            stop_current: p.axis.stop,
            num_points: p.axis.num_points,
            compliance_voltage: p.compliance_voltage,
            current_range: p.current_range,
            settle_delay: p.settle_delay,
            averages: p.averages,
            bidirectional: p.bidirectional,
        }
    }
}

impl IvSweepParameters {
    /// Current axis (A).
    pub fn axis(&self) -> &SweepAxis {
        &self.axis
    }

    /// Compliance voltage (V).
    pub fn compliance_voltage(&self) -> f64 {
        self.compliance_voltage
    }

    /// Fixed source range (A).
    pub fn current_range(&self) -> Option<f64> {
        self.current_range
    }

    /// Settle delay per setpoint.
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }
}

// =============================================================================
// Differential conductance
// =============================================================================

fn default_ac_amplitude() -> f64 {
    0.001
}

fn default_frequency() -> f64 {
    1000.0
}

fn default_time_constant() -> f64 {
    0.03
}

fn default_five() -> u32 {
    5
}

fn default_current_compliance() -> f64 {
    1e-6
}

/// Editable description of a dI/dV sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialConfig {
    /// First DC bias (V).
    pub start_voltage: f64,
    /// Last DC bias (V).
    pub stop_voltage: f64,
    /// Number of setpoints per direction.
    pub num_points: usize,
    /// Lock-in modulation amplitude (V).
    #[serde(default = "default_ac_amplitude")]
    pub ac_amplitude: f64,
    /// Modulation frequency (Hz).
    #[serde(default = "default_frequency")]
    pub frequency: f64,
    /// Lock-in time constant (s).
    #[serde(default = "default_time_constant")]
    pub time_constant: f64,
    /// Bias source current compliance (A).
    #[serde(default = "default_current_compliance")]
    pub current_compliance: f64,
    /// Lock-in readings averaged per setpoint.
    #[serde(default = "default_five")]
    pub averages: u32,
    /// Wait after each setpoint, before lock-in settling.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Sweep back after reaching `stop_voltage`.
    #[serde(default)]
    pub bidirectional: bool,
}

impl DifferentialConfig {
    /// Config with station defaults for everything but the axis.
    pub fn new(start_voltage: f64, stop_voltage: f64, num_points: usize) -> Self {
        Self {
            start_voltage,
            stop_voltage,
            num_points,
            ac_amplitude: default_ac_amplitude(),
            frequency: default_frequency(),
            time_constant: default_time_constant(),
            current_compliance: default_current_compliance(),
            averages: default_five(),
            settle_delay: default_settle_delay(),
            bidirectional: false,
        }
    }

    /// Validates into immutable parameters.
    pub fn build(self) -> AppResult<DifferentialParameters> {
        DifferentialParameters::try_from(self)
    }
}

/// Validated dI/dV sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DifferentialConfig", into = "DifferentialConfig")]
pub struct DifferentialParameters {
    axis: SweepAxis,
    ac_amplitude: f64,
    frequency: f64,
    time_constant: f64,
    current_compliance: f64,
    averages: u32,
    settle_delay: Duration,
    bidirectional: bool,
}

impl TryFrom<DifferentialConfig> for DifferentialParameters {
    type Error = DaqError;

    fn try_from(c: DifferentialConfig) -> AppResult<Self> {
        let smu = InstrumentModel::Keithley2636b;
        let lockin = InstrumentModel::ZurichMfli;
        let axis = SweepAxis::new(c.start_voltage, c.stop_voltage, c.num_points)?;
        require_rated("start_voltage", axis.start, smu.rating().max_voltage, smu)?;
        require_rated("stop_voltage", axis.stop, smu.rating().max_voltage, smu)?;
        require_positive("ac_amplitude", c.ac_amplitude)?;
        require_rated("ac_amplitude", c.ac_amplitude, lockin.rating().max_voltage, lockin)?;
        require_positive("frequency", c.frequency)?;
        require_positive("time_constant", c.time_constant)?;
        require_positive("current_compliance", c.current_compliance)?;
        require_rated(
            "current_compliance",
            c.current_compliance,
            smu.rating().max_current,
            smu,
        )?;
        require_averages(c.averages)?;
        Ok(Self {
            axis,
            ac_amplitude: c.ac_amplitude,
            frequency: c.frequency,
            time_constant: c.time_constant,
            current_compliance: c.current_compliance,
            averages: c.averages,
            settle_delay: c.settle_delay,
            bidirectional: c.bidirectional,
        })
    }
}

impl From<DifferentialParameters> for DifferentialConfig {
    fn from(p: DifferentialParameters) -> Self {
        Self {
            start_voltage: p.axis.start,
            stop_voltage: p.axis.stop,
            num_points: p.axis.num_points,
            ac_amplitude: p.ac_amplitude,
            frequency: p.frequency,
            time_constant: p.time_constant,
            current_compliance: p.current_compliance,
            averages: p.averages,
            settle_delay: p.settle_delay,
            bidirectional: p.bidirectional,
        }
    }
}

impl DifferentialParameters {
    /// Bias voltage axis (V).
    pub fn axis(&self) -> &SweepAxis {
        &self.axis
    }

    /// Lock-in modulation amplitude (V).
    pub fn ac_amplitude(&self) -> f64 {
        self.ac_amplitude
    }

    /// Modulation frequency (Hz).
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Lock-in time constant (s).
    pub fn time_constant(&self) -> f64 {
        self.time_constant
    }

    /// Bias source current compliance (A).
    pub fn current_compliance(&self) -> f64 {
        self.current_compliance
    }
}

// =============================================================================
// Hall
// =============================================================================

fn default_excitation_current() -> f64 {
    1e-6
}

fn default_field_ramp_rate() -> f64 {
    0.1
}

fn default_measurement_delay() -> Duration {
    Duration::from_secs(1)
}

/// Editable description of a Hall field sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallConfig {
    /// First field (T).
    pub start_field: f64,
    /// Last field (T).
    pub stop_field: f64,
    /// Number of field points per direction.
    pub num_points: usize,
    /// Magnet axis to sweep.
    #[serde(default)]
    pub field_axis: FieldAxis,
    /// DC excitation current (A).
    #[serde(default = "default_excitation_current")]
    pub excitation_current: f64,
    /// Magnet ramp rate (T/min).
    #[serde(default = "default_field_ramp_rate")]
    pub ramp_rate: f64,
    /// Wait after the magnet reaches each field.
    #[serde(default = "default_measurement_delay", with = "humantime_serde")]
    pub measurement_delay: Duration,
    /// Voltmeter readings averaged per field point.
    #[serde(default = "default_five")]
    pub averages: u32,
    /// Sweep back after reaching `stop_field`.
    #[serde(default)]
    pub bidirectional: bool,
}

impl HallConfig {
    /// Config with station defaults for everything but the axis.
    pub fn new(start_field: f64, stop_field: f64, num_points: usize) -> Self {
        Self {
            start_field,
            stop_field,
            num_points,
            field_axis: FieldAxis::default(),
            excitation_current: default_excitation_current(),
            ramp_rate: default_field_ramp_rate(),
            measurement_delay: default_measurement_delay(),
            averages: default_five(),
            bidirectional: false,
        }
    }

    /// Validates into immutable parameters.
    pub fn build(self) -> AppResult<HallParameters> {
        HallParameters::try_from(self)
    }
}

/// Validated Hall sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "HallConfig", into = "HallConfig")]
pub struct HallParameters {
    axis: SweepAxis,
    field_axis: FieldAxis,
    excitation_current: f64,
    ramp_rate: f64,
    measurement_delay: Duration,
    averages: u32,
    bidirectional: bool,
}

impl TryFrom<HallConfig> for HallParameters {
    type Error = DaqError;

    fn try_from(c: HallConfig) -> AppResult<Self> {
        let magnet = InstrumentModel::Ami430;
        let source = InstrumentModel::Keithley6221;
        let axis = SweepAxis::new(c.start_field, c.stop_field, c.num_points)?;
        require_rated("start_field", axis.start, magnet.rating().max_field, magnet)?;
        require_rated("stop_field", axis.stop, magnet.rating().max_field, magnet)?;
        require_positive("ramp_rate", c.ramp_rate)?;
        require_rated(
            "ramp_rate",
            c.ramp_rate,
            magnet.rating().max_field_ramp_rate,
            magnet,
        )?;
        require_finite("excitation_current", c.excitation_current)?;
        if c.excitation_current == 0.0 {
            return Err(DaqError::Configuration(
                "excitation_current must be non-zero".to_string(),
            ));
        }
        require_rated(
            "excitation_current",
            c.excitation_current,
            source.rating().max_current,
            source,
        )?;
        require_averages(c.averages)?;
        Ok(Self {
            axis,
            field_axis: c.field_axis,
            excitation_current: c.excitation_current,
            ramp_rate: c.ramp_rate,
            measurement_delay: c.measurement_delay,
            averages: c.averages,
            bidirectional: c.bidirectional,
        })
    }
}

impl From<HallParameters> for HallConfig {
    fn from(p: HallParameters) -> Self {
        Self {
            start_field: p.axis.start,
            stop_field: p.axis.stop,
            num_points: p.axis.num_points,
            field_axis: p.field_axis,
            excitation_current: p.excitation_current,
            ramp_rate: p.ramp_rate,
            measurement_delay: p.measurement_delay,
            averages: p.averages,
            bidirectional: p.bidirectional,
        }
    }
}

impl HallParameters {
    /// Field axis (T).
    pub fn axis(&self) -> &SweepAxis {
        &self.axis
    }

    /// Swept magnet axis.
    pub fn field_axis(&self) -> FieldAxis {
        self.field_axis
    }

    /// DC excitation current (A).
    pub fn excitation_current(&self) -> f64 {
        self.excitation_current
    }

    /// Commanded magnet ramp rate (T/min).
    pub fn ramp_rate(&self) -> f64 {
        self.ramp_rate
    }
}

// =============================================================================
// Temperature
// =============================================================================

fn default_temperature_ramp_rate() -> f64 {
    1.0
}

fn default_settle_time() -> Duration {
    Duration::from_secs(300)
}

fn default_tolerance() -> f64 {
    0.01
}

fn default_ten() -> u32 {
    10
}

/// Editable description of a resistance-versus-temperature sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSweepConfig {
    /// First temperature setpoint (K).
    pub start_temperature: f64,
    /// Last temperature setpoint (K).
    pub stop_temperature: f64,
    /// Number of temperature points per direction.
    pub num_points: usize,
    /// DC excitation current (A).
    #[serde(default = "default_excitation_current")]
    pub excitation_current: f64,
    /// Heater ramp rate (K/min).
    #[serde(default = "default_temperature_ramp_rate")]
    pub ramp_rate: f64,
    /// Wait at each temperature after the ramp.
    #[serde(default = "default_settle_time", with = "humantime_serde")]
    pub settle_time: Duration,
    /// Stability tolerance (K), recorded with the data.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Voltmeter readings averaged per temperature.
    #[serde(default = "default_ten")]
    pub averages: u32,
}

impl TemperatureSweepConfig {
    /// Config with station defaults for everything but the axis.
    pub fn new(start_temperature: f64, stop_temperature: f64, num_points: usize) -> Self {
        Self {
            start_temperature,
            stop_temperature,
            num_points,
            excitation_current: default_excitation_current(),
            ramp_rate: default_temperature_ramp_rate(),
            settle_time: default_settle_time(),
            tolerance: default_tolerance(),
            averages: default_ten(),
        }
    }

    /// Validates into immutable parameters.
    pub fn build(self) -> AppResult<TemperatureSweepParameters> {
        TemperatureSweepParameters::try_from(self)
    }
}

/// Validated temperature sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TemperatureSweepConfig", into = "TemperatureSweepConfig")]
pub struct TemperatureSweepParameters {
    axis: SweepAxis,
    excitation_current: f64,
    ramp_rate: f64,
    settle_time: Duration,
    tolerance: f64,
    averages: u32,
}

impl TryFrom<TemperatureSweepConfig> for TemperatureSweepParameters {
    type Error = DaqError;

    fn try_from(c: TemperatureSweepConfig) -> AppResult<Self> {
        let controller = InstrumentModel::Lakeshore372;
        let source = InstrumentModel::Keithley6221;
        let axis = SweepAxis::new(c.start_temperature, c.stop_temperature, c.num_points)?;
        if axis.bounds().0 <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "temperatures must be above 0 K, got {}",
                axis.bounds().0
            )));
        }
        require_rated(
            "stop_temperature",
            axis.bounds().1,
            controller.rating().max_temperature,
            controller,
        )?;
        require_finite("excitation_current", c.excitation_current)?;
        if c.excitation_current == 0.0 {
            return Err(DaqError::Configuration(
                "excitation_current must be non-zero".to_string(),
            ));
        }
        require_rated(
            "excitation_current",
            c.excitation_current,
            source.rating().max_current,
            source,
        )?;
        require_positive("ramp_rate", c.ramp_rate)?;
        require_positive("tolerance", c.tolerance)?;
        require_averages(c.averages)?;
        Ok(Self {
            axis,
            excitation_current: c.excitation_current,
            ramp_rate: c.ramp_rate,
            settle_time: c.settle_time,
            tolerance: c.tolerance,
            averages: c.averages,
        })
    }
}

impl From<TemperatureSweepParameters> for TemperatureSweepConfig {
    fn from(p: TemperatureSweepParameters) -> Self {
        Self {
            start_temperature: p.axis.start,
            stop_temperature: p.axis.stop,
            num_points: p.axis.num_points,
            excitation_current: p.excitation_current,
            ramp_rate: p.ramp_rate,
            settle_time: p.settle_time,
            tolerance: p.tolerance,
            averages: p.averages,
        }
    }
}

impl TemperatureSweepParameters {
    /// Temperature axis (K).
    pub fn axis(&self) -> &SweepAxis {
        &self.axis
    }

    /// DC excitation current (A).
    pub fn excitation_current(&self) -> f64 {
        self.excitation_current
    }

    /// Heater ramp rate (K/min).
    pub fn ramp_rate(&self) -> f64 {
        self.ramp_rate
    }

    /// Stability tolerance (K).
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }
}

// =============================================================================
// SweepParameters
// =============================================================================

/// Any validated sweep request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SweepParameters {
    /// I-V characteristic.
    Iv(IvSweepParameters),
    /// Differential conductance.
    Differential(DifferentialParameters),
    /// Hall field sweep.
    Hall(HallParameters),
    /// Temperature sweep.
    Temperature(TemperatureSweepParameters),
}

impl From<IvSweepParameters> for SweepParameters {
    fn from(p: IvSweepParameters) -> Self {
        SweepParameters::Iv(p)
    }
}

impl From<DifferentialParameters> for SweepParameters {
    fn from(p: DifferentialParameters) -> Self {
        SweepParameters::Differential(p)
    }
}

impl From<HallParameters> for SweepParameters {
    fn from(p: HallParameters) -> Self {
        SweepParameters::Hall(p)
    }
}

impl From<TemperatureSweepParameters> for SweepParameters {
    fn from(p: TemperatureSweepParameters) -> Self {
        SweepParameters::Temperature(p)
    }
}

impl SweepParameters {
    /// Measurement type.
    pub fn kind(&self) -> SweepKind {
        match self {
            SweepParameters::Iv(_) => SweepKind::Iv,
            SweepParameters::Differential(_) => SweepKind::Differential,
            SweepParameters::Hall(_) => SweepKind::Hall,
            SweepParameters::Temperature(_) => SweepKind::Temperature,
        }
    }

    /// Swept axis.
    pub fn axis(&self) -> &SweepAxis {
        match self {
            SweepParameters::Iv(p) => &p.axis,
            SweepParameters::Differential(p) => &p.axis,
            SweepParameters::Hall(p) => &p.axis,
            SweepParameters::Temperature(p) => &p.axis,
        }
    }

    /// Ordered setpoints, including the return leg of bidirectional sweeps.
    pub fn setpoints(&self) -> Vec<f64> {
        let bidirectional = match self {
            SweepParameters::Iv(p) => p.bidirectional,
            SweepParameters::Differential(p) => p.bidirectional,
            SweepParameters::Hall(p) => p.bidirectional,
            SweepParameters::Temperature(_) => false,
        };
        self.axis().with_return(bidirectional)
    }

    /// Readings averaged per setpoint.
    pub fn averages(&self) -> u32 {
        match self {
            SweepParameters::Iv(p) => p.averages,
            SweepParameters::Differential(p) => p.averages,
            SweepParameters::Hall(p) => p.averages,
            SweepParameters::Temperature(p) => p.averages,
        }
    }

    /// Fixed wait after each setpoint, excluding ramp time.
    pub fn settle_delay(&self) -> Duration {
        match self {
            SweepParameters::Iv(p) => p.settle_delay,
            SweepParameters::Differential(p) => {
                p.settle_delay
                    + Duration::from_secs_f64(p.time_constant * LOCKIN_SETTLE_TIME_CONSTANTS)
            }
            SweepParameters::Hall(p) => p.measurement_delay,
            SweepParameters::Temperature(p) => p.settle_time,
        }
    }

    /// Ramp rate of the swept source in units per second, for sources that
    /// ramp instead of jumping.
    pub fn ramp_rate_per_second(&self) -> Option<f64> {
        match self {
            SweepParameters::Hall(p) => Some(p.ramp_rate / 60.0),
            SweepParameters::Temperature(p) => Some(p.ramp_rate / 60.0),
            _ => None,
        }
    }
}
