//! Continuous resistance monitoring.
//!
//! Holds the current source at a fixed excitation and reads the voltmeter at a
//! fixed interval until a duration elapses, a point count is reached or the
//! emergency stop is raised. Rows use elapsed seconds as the setpoint column.
//! A run with neither `duration` nor `max_points` only ends on the stop.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::params::{require_averages, require_positive};
use super::{EmergencyStop, MeasurementResult, SweepError, SweepKind};
use crate::error::{AppResult, DaqError};
use crate::instrument::{InstrumentRole, InstrumentStatus};
use crate::safety::{SafetyBound, SafetyLimits};
use crate::station::{InstrumentLease, Station};

fn default_excitation() -> f64 {
    1e-6
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_one() -> u32 {
    1
}

/// Resistance monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Source current (A).
    #[serde(default = "default_excitation")]
    pub excitation_current: f64,
    /// Time between readings.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Stop after this long.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,
    /// Stop after this many rows.
    #[serde(default)]
    pub max_points: Option<usize>,
    /// Readings averaged per row.
    #[serde(default = "default_one")]
    pub averages: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            excitation_current: default_excitation(),
            interval: default_interval(),
            duration: None,
            max_points: None,
            averages: 1,
        }
    }
}

impl MonitorConfig {
    /// Checks shape and the station current limit.
    pub fn validate(&self, limits: &SafetyLimits) -> AppResult<()> {
        require_positive("excitation_current", self.excitation_current)?;
        limits.check(SafetyBound::MaxCurrent, self.excitation_current)?;
        require_averages(self.averages)?;
        if self.max_points == Some(0) {
            return Err(DaqError::Configuration(
                "max_points must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

const ROLES: [InstrumentRole; 2] = [InstrumentRole::CurrentSource, InstrumentRole::Voltmeter];

/// Runs the monitor on `station`.
///
/// Errors follow [`run_sweep`](super::run_sweep): a rejection commands
/// nothing, a failure returns the rows taken so far, and the current source is
/// parked at zero either way once it was driven.
pub async fn run_monitor(
    station: &Station,
    config: &MonitorConfig,
    stop: &EmergencyStop,
) -> Result<MeasurementResult, SweepError> {
    let mut result = MeasurementResult::new(SweepKind::Monitor);

    let lease = match config
        .validate(station.limits())
        .and_then(|_| station.acquire(&ROLES))
    {
        Ok(lease) => lease,
        Err(source) => {
            warn!(error = %source, "monitor rejected before start");
            result.finish(false);
            return Err(SweepError {
                partial: result,
                source,
            });
        }
    };

    info!(
        run_id = %result.run_id(),
        excitation = config.excitation_current,
        interval_ms = config.interval.as_millis() as u64,
        "monitor started"
    );

    let outcome = sample(&lease, config, stop, &mut result).await;
    if let Ok(source) = lease.driver(InstrumentRole::CurrentSource) {
        if let Err(e) = source.set_output(0.0).await {
            warn!(error = %e, "failed to park current source");
        }
    }
    drop(lease);

    match outcome {
        Ok(cancelled) => {
            result.finish(cancelled);
            info!(run_id = %result.run_id(), rows = result.len(), cancelled, "monitor finished");
            Ok(result)
        }
        Err(source) => {
            result.finish(false);
            warn!(run_id = %result.run_id(), rows = result.len(), error = %source, "monitor aborted");
            Err(SweepError {
                partial: result,
                source,
            })
        }
    }
}

async fn sample(
    lease: &InstrumentLease,
    config: &MonitorConfig,
    stop: &EmergencyStop,
    result: &mut MeasurementResult,
) -> AppResult<bool> {
    for role in ROLES {
        if lease.driver(role)?.get_status().await? == InstrumentStatus::Fault {
            return Err(DaqError::InstrumentFault(lease.name(role)?.to_string()));
        }
    }

    let source = lease.driver(InstrumentRole::CurrentSource)?;
    let meter = lease.driver(InstrumentRole::Voltmeter)?;
    let current = config.excitation_current;
    source.set_output(current).await?;

    let started = Instant::now();
    loop {
        if stop.is_raised() {
            return Ok(true);
        }

        let mut sum = 0.0;
        for _ in 0..config.averages {
            sum += meter.read_measurement().await?;
        }
        let voltage = sum / f64::from(config.averages);
        let elapsed = started.elapsed().as_secs_f64();
        let resistance = voltage / current;
        debug!(elapsed, voltage, resistance, "monitor reading");
        result.push(elapsed, voltage, resistance.is_finite().then_some(resistance));

        if config.max_points.is_some_and(|max| result.len() >= max) {
            return Ok(false);
        }
        if config
            .duration
            .is_some_and(|limit| started.elapsed() + config.interval > limit)
        {
            return Ok(false);
        }
        tokio::time::sleep(config.interval).await;
    }
}
