//! Sequential sweep runner.
//!
//! One loop serves all measurement types. A [`SweepPlan`] says which role is
//! swept, which one is read and which one (if any) carries a fixed
//! excitation. Before the loop every sweep-wide setting (compliance, range,
//! lock-in filter, ramp rate) is pushed to its instrument; the loop itself is
//! always:
//!
//! 1. check the emergency stop
//! 2. command the source
//! 3. wait the settle delay (plus ramp time for magnets and heaters)
//! 4. read the meter `averages` times and average
//! 5. append the row
//!
//! Waits are awaited inline, so setpoints never interleave. Any instrument
//! error aborts the sweep; the rows completed so far come back inside
//! [`SweepError`].

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{EmergencyStop, MeasurementResult, SweepParameters};
use crate::error::{AppResult, DaqError};
use crate::instrument::{FieldAxis, InstrumentRole, InstrumentSetting, InstrumentStatus, SettingKind};
use crate::safety::{check_field_vector, validate_sweep};
use crate::station::{InstrumentLease, Station};

/// A sweep that stopped on an error, with the rows completed before it.
#[derive(Debug, Error)]
#[error("sweep aborted after {} completed rows: {}", .partial.len(), .source)]
pub struct SweepError {
    /// Rows completed before the failure.
    pub partial: MeasurementResult,
    /// What went wrong.
    #[source]
    pub source: DaqError,
}

impl SweepError {
    /// Splits the error into its parts.
    pub fn into_parts(self) -> (MeasurementResult, DaqError) {
        (self.partial, self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Derived {
    /// `measured / setpoint`.
    OverSetpoint,
    /// `measured / excitation`.
    OverExcitation(f64),
    /// `amplitude / measured`.
    AmplitudeOverMeasured(f64),
}

/// Roles and derived quantity of one measurement type.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    /// Role that receives the setpoints.
    pub source: InstrumentRole,
    /// Role that is read after each setpoint.
    pub meter: InstrumentRole,
    /// Role held at a fixed output for the whole sweep.
    pub excitation: Option<(InstrumentRole, f64)>,
    /// Settings applied once before the first setpoint.
    pub settings: Vec<(InstrumentRole, InstrumentSetting)>,
    derived: Derived,
}

impl SweepPlan {
    /// Plan for a validated parameter record.
    pub fn for_params(params: &SweepParameters) -> Self {
        match params {
            SweepParameters::Iv(p) => {
                let source = InstrumentRole::CurrentSource;
                let mut settings = vec![(
                    source,
                    InstrumentSetting::new(SettingKind::ComplianceVoltage, p.compliance_voltage()),
                )];
                if let Some(range) = p.current_range() {
                    settings.push((source, InstrumentSetting::new(SettingKind::CurrentRange, range)));
                }
                SweepPlan {
                    source,
                    meter: InstrumentRole::Voltmeter,
                    excitation: None,
                    settings,
                    derived: Derived::OverSetpoint,
                }
            }
            SweepParameters::Differential(p) => SweepPlan {
                source: InstrumentRole::BiasSource,
                meter: InstrumentRole::LockIn,
                excitation: Some((InstrumentRole::LockIn, p.ac_amplitude())),
                settings: vec![
                    (
                        InstrumentRole::BiasSource,
                        InstrumentSetting::new(SettingKind::ComplianceCurrent, p.current_compliance()),
                    ),
                    (
                        InstrumentRole::LockIn,
                        InstrumentSetting::new(SettingKind::Frequency, p.frequency()),
                    ),
                    (
                        InstrumentRole::LockIn,
                        InstrumentSetting::new(SettingKind::TimeConstant, p.time_constant()),
                    ),
                ],
                derived: Derived::AmplitudeOverMeasured(p.ac_amplitude()),
            },
            SweepParameters::Hall(p) => {
                let source = InstrumentRole::magnet(p.field_axis());
                SweepPlan {
                    source,
                    meter: InstrumentRole::Voltmeter,
                    excitation: Some((InstrumentRole::CurrentSource, p.excitation_current())),
                    settings: vec![(source, InstrumentSetting::new(SettingKind::RampRate, p.ramp_rate()))],
                    derived: Derived::OverExcitation(p.excitation_current()),
                }
            }
            SweepParameters::Temperature(p) => SweepPlan {
                source: InstrumentRole::TemperatureController,
                meter: InstrumentRole::Voltmeter,
                excitation: Some((InstrumentRole::CurrentSource, p.excitation_current())),
                settings: vec![(
                    InstrumentRole::TemperatureController,
                    InstrumentSetting::new(SettingKind::RampRate, p.ramp_rate()),
                )],
                derived: Derived::OverExcitation(p.excitation_current()),
            },
        }
    }

    /// Every role the sweep needs, without duplicates.
    pub fn roles(&self) -> Vec<InstrumentRole> {
        let mut roles = vec![self.source, self.meter];
        if let Some((role, _)) = self.excitation {
            roles.push(role);
        }
        roles.sort();
        roles.dedup();
        roles
    }

    /// Magnet axes other than the swept one that are registered on `station`.
    ///
    /// They are leased for the whole sweep and read during preflight so the
    /// total field vector is checked, not just the swept component.
    pub fn held_field_axes(&self, station: &Station) -> Vec<InstrumentRole> {
        let Some(swept) = self.source.field_axis() else {
            return Vec::new();
        };
        FieldAxis::ALL
            .into_iter()
            .filter(|axis| *axis != swept)
            .map(InstrumentRole::magnet)
            .filter(|role| station.instrument(*role).is_some())
            .collect()
    }

    /// Derived column value for one row, `None` where undefined.
    pub fn derive(&self, setpoint: f64, measured: f64) -> Option<f64> {
        let value = match self.derived {
            Derived::OverSetpoint => ratio(measured, setpoint),
            Derived::OverExcitation(current) => ratio(measured, current),
            Derived::AmplitudeOverMeasured(amplitude) => ratio(amplitude, measured),
        }?;
        value.is_finite().then_some(value)
    }

    /// Roles driven to their safe output when the sweep ends.
    ///
    /// Magnet axes are left at field; ramping them down is an explicit
    /// station-level emergency action.
    fn parked_roles(&self) -> Vec<InstrumentRole> {
        self.roles()
            .into_iter()
            .filter(|role| {
                role.safe_output().is_some()
                    && !matches!(
                        role,
                        InstrumentRole::MagnetX | InstrumentRole::MagnetY | InstrumentRole::MagnetZ
                    )
            })
            .collect()
    }
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 {
        None
    } else {
        Some(numerator / denominator)
    }
}

/// Runs one sweep on `station`.
///
/// Safety limits are checked before any instrument is leased or commanded.
/// A raised `stop` ends the sweep at the next setpoint boundary and returns
/// `Ok` with the result marked cancelled.
pub async fn run_sweep(
    station: &Station,
    params: &SweepParameters,
    stop: &EmergencyStop,
) -> Result<MeasurementResult, SweepError> {
    let mut result = MeasurementResult::new(params.kind());
    let plan = SweepPlan::for_params(params);

    let lease = match preflight(station, params, &plan).await {
        Ok(lease) => lease,
        Err(source) => {
            warn!(kind = %params.kind(), error = %source, "sweep rejected before start");
            result.finish(false);
            return Err(SweepError {
                partial: result,
                source,
            });
        }
    };

    info!(
        run_id = %result.run_id(),
        kind = %params.kind(),
        points = params.setpoints().len(),
        source = %plan.source,
        meter = %plan.meter,
        "sweep started"
    );

    let outcome = execute(&lease, params, &plan, stop, &mut result).await;
    park(&lease, &plan).await;
    drop(lease);

    match outcome {
        Ok(cancelled) => {
            result.finish(cancelled);
            if cancelled {
                warn!(run_id = %result.run_id(), rows = result.len(), "sweep cancelled by emergency stop");
            } else {
                info!(run_id = %result.run_id(), rows = result.len(), "sweep completed");
            }
            Ok(result)
        }
        Err(source) => {
            result.finish(false);
            warn!(run_id = %result.run_id(), rows = result.len(), error = %source, "sweep aborted");
            Err(SweepError {
                partial: result,
                source,
            })
        }
    }
}

async fn preflight(
    station: &Station,
    params: &SweepParameters,
    plan: &SweepPlan,
) -> AppResult<InstrumentLease> {
    validate_sweep(params, station.limits())?;

    let held = plan.held_field_axes(station);
    let mut roles = plan.roles();
    roles.extend(held.iter().copied());
    let lease = station.acquire(&roles)?;

    for (role, setting) in &plan.settings {
        if !lease.driver(*role)?.supports_setting(setting.kind) {
            return Err(DaqError::SettingUnsupported(format!(
                "'{}' cannot apply {}",
                lease.name(*role)?,
                setting.kind
            )));
        }
    }

    if let Some(swept) = plan.source.field_axis() {
        let mut field = [0.0; 3];
        for role in &held {
            if let Some(axis) = role.field_axis() {
                field[axis.index()] = lease.driver(*role)?.read_measurement().await?;
            }
        }
        for endpoint in [params.axis().start(), params.axis().stop()] {
            field[swept.index()] = endpoint;
            check_field_vector(field[0], field[1], field[2], station.limits())?;
        }
    }

    Ok(lease)
}

/// Returns `Ok(true)` when the stop ended the loop early.
async fn execute(
    lease: &InstrumentLease,
    params: &SweepParameters,
    plan: &SweepPlan,
    stop: &EmergencyStop,
    result: &mut MeasurementResult,
) -> AppResult<bool> {
    for role in plan.roles() {
        let status = lease.driver(role)?.get_status().await?;
        if status == InstrumentStatus::Fault {
            return Err(DaqError::InstrumentFault(lease.name(role)?.to_string()));
        }
    }

    for (role, setting) in &plan.settings {
        debug!(%role, %setting, "applying setting");
        lease.driver(*role)?.configure(*setting).await?;
    }

    if let Some((role, value)) = plan.excitation {
        debug!(%role, value, "applying excitation");
        lease.driver(role)?.set_output(value).await?;
    }

    let source = lease.driver(plan.source)?;
    let meter = lease.driver(plan.meter)?;
    let averages = params.averages().max(1);
    let settle = params.settle_delay();
    let ramp_rate = params.ramp_rate_per_second();

    // Ramping sources start wherever the previous sweep left them.
    let mut previous = match ramp_rate {
        Some(_) => Some(source.read_measurement().await?),
        None => None,
    };

    for (index, setpoint) in params.setpoints().into_iter().enumerate() {
        if stop.is_raised() {
            info!(index, "emergency stop raised");
            return Ok(true);
        }

        source.set_output(setpoint).await?;

        let mut wait = settle;
        if let (Some(rate), Some(from)) = (ramp_rate, previous) {
            wait += Duration::from_secs_f64((setpoint - from).abs() / rate);
            previous = Some(setpoint);
        }
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let mut sum = 0.0;
        for _ in 0..averages {
            sum += meter.read_measurement().await?;
        }
        let measured = sum / f64::from(averages);

        debug!(index, setpoint, measured, "setpoint complete");
        result.push(setpoint, measured, plan.derive(setpoint, measured));
    }

    Ok(false)
}

async fn park(lease: &InstrumentLease, plan: &SweepPlan) {
    for role in plan.parked_roles() {
        let Some(value) = role.safe_output() else {
            continue;
        };
        let outcome = match lease.driver(role) {
            Ok(driver) => driver.set_output(value).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            warn!(%role, error = %e, "failed to park instrument at safe output");
        }
    }
}
