//! Core library for the cryo_daq application.
//!
//! Thin orchestration for DC and AC transport measurements on a dilution
//! refrigerator station: sweep requests are validated against explicit safety
//! limits, a driver is resolved for every configured instrument, and I-V,
//! dI/dV, Hall and temperature sweeps run strictly sequentially through one
//! generic runner. Results are persisted as CSV or JSON with run metadata.
//!
//! ```no_run
//! use cryo_daq::instrument::{DriverResolver, SimulatedBench};
//! use cryo_daq::{config::Settings, station::Station, sweep::{EmergencyStop, IvSweepConfig, SweepParameters}};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = Settings::load_from("config/station.toml")?;
//! let resolver = DriverResolver::with_builtin(SimulatedBench::default());
//! let station = Station::from_settings(&settings, &resolver).await?;
//!
//! let params: SweepParameters = IvSweepConfig::new(-1e-6, 1e-6, 101).build()?.into();
//! let result = station.run_sweep(&params, &EmergencyStop::new()).await?;
//! println!("{} rows", result.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod instrument;
pub mod metadata;
pub mod plan;
pub mod safety;
pub mod session;
pub mod station;
pub mod storage;
pub mod sweep;

pub use error::{AppResult, DaqError};
