//! Simulated instruments
//!
//! Provides in-process stand-ins for every role so a station can be exercised
//! without hardware. All simulated instruments created from one
//! [`SimulatedBench`] share a physical model of the sample:
//!
//! - voltmeter: `V = I * (R + R_H * B_z)` where `I` is the current source output
//! - bias source readback: `I = V_bias / R`
//! - lock-in: `r = amplitude * divider_ratio`
//! - magnet axes and temperature loop read back their last setpoint
//!
//! Sweep-wide settings are accepted for the roles they belong to and recorded
//! on the bench so tests can check what a sweep configured.
//!
//! Faults can be injected per instrument to exercise abort paths.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{InstrumentDriver, InstrumentRole, InstrumentSetting, InstrumentStatus, SettingKind};
use crate::error::{AppResult, DaqError};

/// Shared sample model for simulated instruments.
#[derive(Clone)]
pub struct SimulatedBench {
    inner: Arc<Mutex<BenchState>>,
}

struct BenchState {
    outputs: HashMap<InstrumentRole, f64>,
    settings: HashMap<(InstrumentRole, SettingKind), f64>,
    resistance_ohm: f64,
    hall_ohm_per_tesla: f64,
    divider_ratio: f64,
    noise_volts: f64,
    rng: StdRng,
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl SimulatedBench {
    /// Bench with an ohmic sample of `resistance_ohm`, no Hall term and no noise.
    pub fn new(resistance_ohm: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BenchState {
                outputs: HashMap::new(),
                settings: HashMap::new(),
                resistance_ohm,
                hall_ohm_per_tesla: 0.0,
                divider_ratio: 0.5,
                noise_volts: 0.0,
                rng: StdRng::seed_from_u64(0x5eed),
            })),
        }
    }

    /// Adds a Hall term `R_H` (ohm per tesla of z field).
    pub fn with_hall_coefficient(self, ohm_per_tesla: f64) -> Self {
        self.update(|s| s.hall_ohm_per_tesla = ohm_per_tesla);
        self
    }

    /// Adds uniform voltmeter noise of +/- `volts`.
    pub fn with_noise(self, volts: f64) -> Self {
        self.update(|s| s.noise_volts = volts.abs());
        self
    }

    /// Creates an instrument in `role` attached to this bench.
    pub fn instrument(&self, name: impl Into<String>, role: InstrumentRole) -> SimulatedInstrument {
        SimulatedInstrument {
            name: name.into(),
            role,
            bench: self.clone(),
            reads: AtomicUsize::new(0),
            fail_read_at: None,
            fault_status: false,
        }
    }

    /// Last output commanded on `role`, if any.
    pub fn output(&self, role: InstrumentRole) -> Option<f64> {
        self.inner
            .lock()
            .ok()
            .and_then(|s| s.outputs.get(&role).copied())
    }

    /// Last value of `kind` configured on `role`, if any.
    pub fn setting(&self, role: InstrumentRole, kind: SettingKind) -> Option<f64> {
        self.inner
            .lock()
            .ok()
            .and_then(|s| s.settings.get(&(role, kind)).copied())
    }

    fn update(&self, f: impl FnOnce(&mut BenchState)) {
        if let Ok(mut state) = self.inner.lock() {
            f(&mut state);
        }
    }

    fn respond(&self, role: InstrumentRole) -> AppResult<f64> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| DaqError::communication(role.as_str(), "simulated bench poisoned"))?;
        let state: &mut BenchState = &mut guard;

        let value = match role {
            InstrumentRole::Voltmeter => {
                let current = state.output(InstrumentRole::CurrentSource);
                let field = state.output(InstrumentRole::MagnetZ);
                let ideal = current * (state.resistance_ohm + state.hall_ohm_per_tesla * field);
                let noise = if state.noise_volts > 0.0 {
                    let amplitude = state.noise_volts;
                    state.rng.gen_range(-amplitude..=amplitude)
                } else {
                    0.0
                };
                ideal + noise
            }
            InstrumentRole::BiasSource => {
                state.output(InstrumentRole::BiasSource) / state.resistance_ohm
            }
            InstrumentRole::LockIn => state.output(InstrumentRole::LockIn) * state.divider_ratio,
            other => state.output(other),
        };
        Ok(value)
    }
}

impl BenchState {
    fn output(&self, role: InstrumentRole) -> f64 {
        self.outputs.get(&role).copied().unwrap_or(0.0)
    }
}

/// One simulated instrument.
pub struct SimulatedInstrument {
    name: String,
    role: InstrumentRole,
    bench: SimulatedBench,
    reads: AtomicUsize,
    fail_read_at: Option<usize>,
    fault_status: bool,
}

impl SimulatedInstrument {
    /// Make the `index`-th call to `read_measurement` (0-based) and every later
    /// one fail with a communication error.
    pub fn fail_read_at(mut self, index: usize) -> Self {
        self.fail_read_at = Some(index);
        self
    }

    /// Report `FAULT` from `get_status`.
    pub fn with_fault_status(mut self) -> Self {
        self.fault_status = true;
        self
    }

    /// Number of `read_measurement` calls so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstrumentDriver for SimulatedInstrument {
    async fn set_output(&self, value: f64) -> AppResult<()> {
        if self.role == InstrumentRole::Voltmeter {
            return Err(DaqError::Configuration(format!(
                "'{}' is registered as {} and has no output",
                self.name, self.role
            )));
        }
        self.bench.update(|s| {
            s.outputs.insert(self.role, value);
        });
        Ok(())
    }

    async fn read_measurement(&self) -> AppResult<f64> {
        let index = self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(fail_at) = self.fail_read_at {
            if index >= fail_at {
                return Err(DaqError::communication(
                    &self.name,
                    format!("simulated read timeout at read #{}", index),
                ));
            }
        }
        self.bench.respond(self.role)
    }

    async fn get_status(&self) -> AppResult<InstrumentStatus> {
        Ok(if self.fault_status {
            InstrumentStatus::Fault
        } else {
            InstrumentStatus::Ok
        })
    }

    fn supports_setting(&self, kind: SettingKind) -> bool {
        kind.applies_to(self.role)
    }

    async fn configure(&self, setting: InstrumentSetting) -> AppResult<()> {
        if !self.supports_setting(setting.kind) {
            return Err(DaqError::SettingUnsupported(format!(
                "'{}' ({}) cannot apply {}",
                self.name, self.role, setting.kind
            )));
        }
        self.bench.update(|s| {
            s.settings.insert((self.role, setting.kind), setting.value);
        });
        Ok(())
    }
}
