//! Station registry.
//!
//! A [`Station`] holds one instrument per [`InstrumentRole`] together with the
//! safety limits that apply to every sweep run on it. It is built once per
//! session, either from [`Settings`] through a [`DriverResolver`] or by
//! registering drivers directly (tests, scripts).
//!
//! Sweeps lease the roles they need. A role that is already leased makes the
//! new sweep fail fast with [`DaqError::InstrumentBusy`]; the lease is released
//! when the [`InstrumentLease`] is dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::instrument::{
    DriverReport, DriverResolver, InstrumentDriver, InstrumentModel, InstrumentRole,
    InstrumentStatus,
};
use crate::safety::SafetyLimits;
use crate::sweep::{EmergencyStop, MeasurementResult, SweepError, SweepParameters};

/// A registered instrument.
#[derive(Clone)]
pub struct InstrumentHandle {
    name: String,
    role: InstrumentRole,
    model: InstrumentModel,
    driver: Arc<dyn InstrumentDriver>,
    report: DriverReport,
    busy: Arc<AtomicBool>,
}

impl InstrumentHandle {
    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role in the station.
    pub fn role(&self) -> InstrumentRole {
        self.role
    }

    /// Instrument model.
    pub fn model(&self) -> InstrumentModel {
        self.model
    }

    /// Active driver.
    pub fn driver(&self) -> &Arc<dyn InstrumentDriver> {
        &self.driver
    }

    /// True while a sweep holds the instrument.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Exclusive use of a set of roles for one sweep.
///
/// Dropping the lease releases every role.
pub struct InstrumentLease {
    handles: Vec<InstrumentHandle>,
}

impl InstrumentLease {
    fn handle(&self, role: InstrumentRole) -> AppResult<&InstrumentHandle> {
        self.handles
            .iter()
            .find(|h| h.role == role)
            .ok_or_else(|| DaqError::InstrumentNotConfigured(role.to_string()))
    }

    /// Driver leased for `role`.
    pub fn driver(&self, role: InstrumentRole) -> AppResult<&Arc<dyn InstrumentDriver>> {
        self.handle(role).map(|h| &h.driver)
    }

    /// Name of the instrument leased for `role`.
    pub fn name(&self, role: InstrumentRole) -> AppResult<&str> {
        self.handle(role).map(|h| h.name.as_str())
    }

    /// Leased roles.
    pub fn roles(&self) -> Vec<InstrumentRole> {
        self.handles.iter().map(|h| h.role).collect()
    }
}

impl Drop for InstrumentLease {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.busy.store(false, Ordering::Release);
        }
    }
}

/// Configured instruments keyed by role, plus the station safety limits.
pub struct Station {
    limits: SafetyLimits,
    instruments: BTreeMap<InstrumentRole, InstrumentHandle>,
}

impl Station {
    /// Empty station with validated `limits`.
    pub fn new(limits: SafetyLimits) -> AppResult<Self> {
        limits.validate()?;
        Ok(Self {
            limits,
            instruments: BTreeMap::new(),
        })
    }

    /// Builds a station from configuration, resolving a driver for every
    /// configured instrument.
    pub async fn from_settings(settings: &Settings, resolver: &DriverResolver) -> AppResult<Self> {
        let mut station = Self::new(settings.safety)?;
        for config in &settings.instruments {
            let resolved = resolver.resolve(config).await?;
            station.register(
                config.name.clone(),
                config.role,
                config.model,
                resolved.driver,
                resolved.report,
            )?;
        }
        info!(instruments = station.instruments.len(), "station ready");
        Ok(station)
    }

    /// Registers a driver under `role`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        role: InstrumentRole,
        model: InstrumentModel,
        driver: Arc<dyn InstrumentDriver>,
        report: DriverReport,
    ) -> AppResult<()> {
        let name = name.into();
        if !model.supports(role) {
            return Err(DaqError::Configuration(format!(
                "{} '{}' cannot act as {}",
                model, name, role
            )));
        }
        if let Some(existing) = self.instruments.get(&role) {
            return Err(DaqError::Configuration(format!(
                "role {} already taken by '{}'",
                role, existing.name
            )));
        }
        self.instruments.insert(
            role,
            InstrumentHandle {
                name,
                role,
                model,
                driver,
                report,
                busy: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(())
    }

    /// Safety limits every sweep on this station is checked against.
    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Instrument registered for `role`.
    pub fn instrument(&self, role: InstrumentRole) -> Option<&InstrumentHandle> {
        self.instruments.get(&role)
    }

    /// Leases `roles` for one sweep, all or nothing.
    pub fn acquire(&self, roles: &[InstrumentRole]) -> AppResult<InstrumentLease> {
        let mut lease = InstrumentLease {
            handles: Vec::with_capacity(roles.len()),
        };
        for role in roles {
            let handle = self
                .instruments
                .get(role)
                .ok_or_else(|| DaqError::InstrumentNotConfigured(role.to_string()))?;
            if handle
                .busy
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                // Roles leased so far are released when `lease` drops.
                return Err(DaqError::InstrumentBusy(handle.name.clone()));
            }
            lease.handles.push(handle.clone());
        }
        Ok(lease)
    }

    /// Runs one sweep; see [`crate::sweep::run_sweep`].
    pub async fn run_sweep(
        &self,
        params: &SweepParameters,
        stop: &EmergencyStop,
    ) -> Result<MeasurementResult, SweepError> {
        crate::sweep::run_sweep(self, params, stop).await
    }

    /// Active driver per instrument, in role order.
    pub fn driver_report(&self) -> Vec<DriverReport> {
        self.instruments.values().map(|h| h.report.clone()).collect()
    }

    /// Status of every instrument. Query failures are reported as `Fault`.
    pub async fn system_status(&self) -> BTreeMap<InstrumentRole, InstrumentStatus> {
        let mut status = BTreeMap::new();
        for (role, handle) in &self.instruments {
            let value = match handle.driver.get_status().await {
                Ok(value) => value,
                Err(e) => {
                    warn!(instrument = %handle.name, error = %e, "status query failed");
                    InstrumentStatus::Fault
                }
            };
            status.insert(*role, value);
        }
        status
    }

    /// Drives every role with a safe output to it, magnets included.
    ///
    /// Runs regardless of leases and keeps going past failures; the first
    /// failure is returned once every instrument was tried.
    pub async fn emergency_stop(&self) -> AppResult<()> {
        warn!("driving station to safe state");
        let mut first_error = None;
        for (role, handle) in &self.instruments {
            let Some(value) = role.safe_output() else {
                continue;
            };
            if let Err(e) = handle.driver.set_output(value).await {
                warn!(instrument = %handle.name, error = %e, "safe state command failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SimulatedBench;

    fn station(bench: &SimulatedBench) -> Station {
        let mut station = Station::new(SafetyLimits::default()).unwrap();
        for (name, role, model) in [
            ("k6221", InstrumentRole::CurrentSource, InstrumentModel::Keithley6221),
            ("k2182a", InstrumentRole::Voltmeter, InstrumentModel::Keithley2182a),
            ("ami_z", InstrumentRole::MagnetZ, InstrumentModel::Ami430),
        ] {
            station
                .register(
                    name,
                    role,
                    model,
                    Arc::new(bench.instrument(name, role)),
                    DriverReport::direct(name, role, model, "simulated"),
                )
                .unwrap();
        }
        station
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn sweep_logs_completion() {
        let bench = SimulatedBench::default();
        let station = station(&bench);
        let mut config = crate::sweep::IvSweepConfig::new(1e-6, 2e-6, 2);
        config.settle_delay = std::time::Duration::ZERO;
        let params: SweepParameters = config.build().unwrap().into();

        let result = station
            .run_sweep(&params, &EmergencyStop::new())
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert!(logs_contain("sweep started"));
        assert!(logs_contain("sweep completed"));
    }

    #[test]
    fn busy_roles_are_refused() {
        let bench = SimulatedBench::default();
        let station = station(&bench);

        let lease = station
            .acquire(&[InstrumentRole::CurrentSource, InstrumentRole::Voltmeter])
            .unwrap();
        let err = station.acquire(&[InstrumentRole::Voltmeter]).err().unwrap();
        assert!(matches!(err, DaqError::InstrumentBusy(name) if name == "k2182a"));

        drop(lease);
        assert!(station.acquire(&[InstrumentRole::Voltmeter]).is_ok());
    }

    #[test]
    fn failed_acquire_releases_partial_lease() {
        let bench = SimulatedBench::default();
        let station = station(&bench);
        let _held = station.acquire(&[InstrumentRole::Voltmeter]).unwrap();

        assert!(station
            .acquire(&[InstrumentRole::CurrentSource, InstrumentRole::Voltmeter])
            .is_err());
        assert!(!station
            .instrument(InstrumentRole::CurrentSource)
            .unwrap()
            .is_busy());
    }

    #[test]
    fn missing_role() {
        let bench = SimulatedBench::default();
        let station = station(&bench);
        let err = station.acquire(&[InstrumentRole::LockIn]).err().unwrap();
        assert!(matches!(err, DaqError::InstrumentNotConfigured(_)));
    }

    #[test]
    fn register_checks_model_and_duplicates() {
        let bench = SimulatedBench::default();
        let mut station = station(&bench);
        let role = InstrumentRole::Voltmeter;
        let model = InstrumentModel::Keithley2182a;
        assert!(station
            .register(
                "other",
                role,
                model,
                Arc::new(bench.instrument("other", role)),
                DriverReport::direct("other", role, model, "simulated"),
            )
            .is_err());

        let role = InstrumentRole::LockIn;
        assert!(station
            .register(
                "wrong",
                role,
                model,
                Arc::new(bench.instrument("wrong", role)),
                DriverReport::direct("wrong", role, model, "simulated"),
            )
            .is_err());
    }

    #[tokio::test]
    async fn emergency_stop_zeroes_sources_and_magnets() {
        let bench = SimulatedBench::default();
        let station = station(&bench);
        let source = station.instrument(InstrumentRole::CurrentSource).unwrap();
        source.driver().set_output(1e-3).await.unwrap();
        let magnet = station.instrument(InstrumentRole::MagnetZ).unwrap();
        magnet.driver().set_output(3.0).await.unwrap();

        station.emergency_stop().await.unwrap();
        assert_eq!(bench.output(InstrumentRole::CurrentSource), Some(0.0));
        assert_eq!(bench.output(InstrumentRole::MagnetZ), Some(0.0));
    }

    #[tokio::test]
    async fn system_status_lists_every_role() {
        let bench = SimulatedBench::default();
        let station = station(&bench);
        let status = station.system_status().await;
        assert_eq!(status.len(), 3);
        assert!(status.values().all(|s| *s == InstrumentStatus::Ok));
    }
}
