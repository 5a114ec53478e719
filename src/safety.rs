//! Safety interlocks.
//!
//! Pure pre-flight checks of sweep requests against explicit [`SafetyLimits`].
//! Nothing in here talks to hardware or reads global state; the limits are
//! always passed in by the caller (normally the [`Station`](crate::station::Station)
//! that owns them).
//!
//! All bounds are inclusive: a value equal to its limit passes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::sweep::SweepParameters;

/// Field change between consecutive sweeps above which a warning is raised (T).
pub const FIELD_JUMP_WARNING: f64 = 1.0;

/// Temperature change between consecutive sweeps above which a warning is raised (K).
pub const TEMPERATURE_JUMP_WARNING: f64 = 10.0;

/// Named safety bound, used to report which interlock tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyBound {
    /// Field magnitude (T).
    MaxField,
    /// Magnet ramp rate (T/min).
    MaxFieldRampRate,
    /// Source current (A).
    MaxCurrent,
    /// Source or compliance voltage (V).
    MaxVoltage,
    /// Upper temperature (K).
    MaxTemperature,
    /// Lower temperature (K).
    MinTemperature,
    /// Heater ramp rate (K/min).
    MaxTemperatureRampRate,
}

impl SafetyBound {
    /// Configuration key of the bound.
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyBound::MaxField => "max_field",
            SafetyBound::MaxFieldRampRate => "max_field_ramp_rate",
            SafetyBound::MaxCurrent => "max_current",
            SafetyBound::MaxVoltage => "max_voltage",
            SafetyBound::MaxTemperature => "max_temperature",
            SafetyBound::MinTemperature => "min_temperature",
            SafetyBound::MaxTemperatureRampRate => "max_temperature_ramp_rate",
        }
    }
}

impl fmt::Display for SafetyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Station safety limits.
///
/// Loaded from the `[safety]` table of the station configuration; any field
/// left out takes its default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// Maximum field magnitude (T).
    pub max_field: f64,
    /// Maximum magnet ramp rate (T/min).
    pub max_field_ramp_rate: f64,
    /// Maximum source current magnitude (A).
    pub max_current: f64,
    /// Maximum source or compliance voltage magnitude (V).
    pub max_voltage: f64,
    /// Maximum temperature setpoint (K).
    pub max_temperature: f64,
    /// Minimum temperature setpoint (K).
    pub min_temperature: f64,
    /// Maximum heater ramp rate (K/min).
    pub max_temperature_ramp_rate: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_field: 9.0,
            max_field_ramp_rate: 1.0,
            max_current: 0.1,
            max_voltage: 200.0,
            max_temperature: 400.0,
            min_temperature: 0.01,
            max_temperature_ramp_rate: 5.0,
        }
    }
}

impl SafetyLimits {
    /// Checks the limits themselves are usable.
    pub fn validate(&self) -> AppResult<()> {
        let bounds = [
            (SafetyBound::MaxField, self.max_field),
            (SafetyBound::MaxFieldRampRate, self.max_field_ramp_rate),
            (SafetyBound::MaxCurrent, self.max_current),
            (SafetyBound::MaxVoltage, self.max_voltage),
            (SafetyBound::MaxTemperature, self.max_temperature),
            (SafetyBound::MinTemperature, self.min_temperature),
            (SafetyBound::MaxTemperatureRampRate, self.max_temperature_ramp_rate),
        ];
        for (bound, value) in bounds {
            if !value.is_finite() || value <= 0.0 {
                return Err(DaqError::Configuration(format!(
                    "safety limit {} must be a positive finite number, got {}",
                    bound, value
                )));
            }
        }
        if self.min_temperature >= self.max_temperature {
            return Err(DaqError::Configuration(format!(
                "min_temperature {} must be below max_temperature {}",
                self.min_temperature, self.max_temperature
            )));
        }
        Ok(())
    }

    fn limit(&self, bound: SafetyBound) -> f64 {
        match bound {
            SafetyBound::MaxField => self.max_field,
            SafetyBound::MaxFieldRampRate => self.max_field_ramp_rate,
            SafetyBound::MaxCurrent => self.max_current,
            SafetyBound::MaxVoltage => self.max_voltage,
            SafetyBound::MaxTemperature => self.max_temperature,
            SafetyBound::MinTemperature => self.min_temperature,
            SafetyBound::MaxTemperatureRampRate => self.max_temperature_ramp_rate,
        }
    }

    /// Checks a single value against one bound.
    ///
    /// Upper bounds compare the magnitude of `value`; the temperature floor
    /// compares the signed value.
    pub fn check(&self, bound: SafetyBound, value: f64) -> AppResult<()> {
        if !value.is_finite() {
            return Err(DaqError::Configuration(format!(
                "{} check received non-finite value {}",
                bound, value
            )));
        }
        let limit = self.limit(bound);
        let violated = match bound {
            SafetyBound::MinTemperature => value < limit,
            SafetyBound::MaxTemperature => value > limit,
            _ => value.abs() > limit,
        };
        if violated {
            return Err(DaqError::LimitExceeded {
                bound,
                value,
                limit,
            });
        }
        Ok(())
    }
}

/// Validates a sweep request against the limits before anything is commanded.
pub fn validate_sweep(params: &SweepParameters, limits: &SafetyLimits) -> AppResult<()> {
    let axis = params.axis();
    let endpoints = [axis.start(), axis.stop()];

    match params {
        SweepParameters::Iv(p) => {
            for current in endpoints {
                limits.check(SafetyBound::MaxCurrent, current)?;
            }
            if let Some(range) = p.current_range() {
                limits.check(SafetyBound::MaxCurrent, range)?;
            }
            limits.check(SafetyBound::MaxVoltage, p.compliance_voltage())?;
        }
        SweepParameters::Differential(p) => {
            for bias in endpoints {
                limits.check(SafetyBound::MaxVoltage, bias)?;
                limits.check(SafetyBound::MaxVoltage, bias.abs() + p.ac_amplitude())?;
            }
            limits.check(SafetyBound::MaxCurrent, p.current_compliance())?;
        }
        SweepParameters::Hall(p) => {
            for field in endpoints {
                limits.check(SafetyBound::MaxField, field)?;
            }
            limits.check(SafetyBound::MaxFieldRampRate, p.ramp_rate())?;
            limits.check(SafetyBound::MaxCurrent, p.excitation_current())?;
        }
        SweepParameters::Temperature(p) => {
            for temperature in endpoints {
                limits.check(SafetyBound::MaxTemperature, temperature)?;
                limits.check(SafetyBound::MinTemperature, temperature)?;
            }
            limits.check(SafetyBound::MaxTemperatureRampRate, p.ramp_rate())?;
            limits.check(SafetyBound::MaxCurrent, p.excitation_current())?;
        }
    }
    Ok(())
}

/// Checks the magnitude of a field vector against `max_field`.
pub fn check_field_vector(x: f64, y: f64, z: f64, limits: &SafetyLimits) -> AppResult<f64> {
    for (axis, component) in [("x", x), ("y", y), ("z", z)] {
        if !component.is_finite() {
            return Err(DaqError::Configuration(format!(
                "field component {} is not finite: {}",
                axis, component
            )));
        }
    }
    let magnitude = (x * x + y * y + z * z).sqrt();
    limits.check(SafetyBound::MaxField, magnitude)?;
    Ok(magnitude)
}

/// Expected wall time of a sweep.
///
/// Counts the settle delay of every setpoint plus the ramp time of sources
/// that ramp. Hall sweeps also count the ramp from zero field to the first
/// setpoint. Instrument I/O time is not included.
pub fn estimate_duration(params: &SweepParameters) -> Duration {
    let setpoints = params.setpoints();
    let mut seconds = params.settle_delay().as_secs_f64() * setpoints.len() as f64;

    if let Some(rate) = params.ramp_rate_per_second() {
        let traversal: f64 = setpoints.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        let approach = match params {
            SweepParameters::Hall(_) => setpoints.first().map(|f| f.abs()).unwrap_or(0.0),
            _ => 0.0,
        };
        seconds += (traversal + approach) / rate;
    }

    Duration::from_secs_f64(seconds)
}

/// Non-fatal finding from [`validate_sequence`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceWarning {
    /// Index of the sweep that starts with the jump.
    pub index: usize,
    /// What was found.
    pub message: String,
}

impl fmt::Display for SequenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sweep {}: {}", self.index, self.message)
    }
}

/// Validates every sweep of a run plan and reports large jumps between them.
///
/// Fails on the first sweep that violates a limit. Field jumps are tracked
/// across Hall sweeps and temperature jumps across temperature sweeps, from
/// the last setpoint of one to the first setpoint of the next.
pub fn validate_sequence(
    sweeps: &[SweepParameters],
    limits: &SafetyLimits,
) -> AppResult<Vec<SequenceWarning>> {
    let mut warnings = Vec::new();
    let mut last_field: Option<f64> = None;
    let mut last_temperature: Option<f64> = None;

    for (index, sweep) in sweeps.iter().enumerate() {
        validate_sweep(sweep, limits).map_err(|e| match e {
            DaqError::Configuration(msg) => {
                DaqError::Configuration(format!("sweep {}: {}", index, msg))
            }
            other => other,
        })?;

        let setpoints = sweep.setpoints();
        let (Some(&first), Some(&last)) = (setpoints.first(), setpoints.last()) else {
            continue;
        };

        let previous = match sweep {
            SweepParameters::Hall(_) => last_field.replace(last),
            SweepParameters::Temperature(_) => last_temperature.replace(last),
            _ => continue,
        };
        let threshold = match sweep {
            SweepParameters::Hall(_) => FIELD_JUMP_WARNING,
            _ => TEMPERATURE_JUMP_WARNING,
        };
        if let Some(previous) = previous {
            let jump = (first - previous).abs();
            if jump > threshold {
                let unit = if matches!(sweep, SweepParameters::Hall(_)) { "T" } else { "K" };
                warnings.push(SequenceWarning {
                    index,
                    message: format!(
                        "large {} change of {:.3} {} from the previous sweep",
                        sweep.kind(),
                        jump,
                        unit
                    ),
                });
            }
        }
    }

    Ok(warnings)
}
