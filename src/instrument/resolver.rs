//! Driver resolution.
//!
//! Every configured instrument lists the driver sources to try, in order:
//!
//! ```toml
//! [[instruments]]
//! name = "k2182a"
//! role = "voltmeter"
//! model = "keithley2182a"
//! address = "GPIB0::7::INSTR"
//! drivers = ["visa", "socket", "simulated"]
//! ```
//!
//! The resolver walks that list and asks the factory registered under each
//! source name for a driver. A factory answering
//! [`DaqError::DriverUnavailable`] is skipped; any other error stops
//! resolution. The first entry of the list is the preferred variant, every
//! later entry a fallback, and the outcome is kept in a [`DriverReport`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::scpi::{CommandSet, ScpiDriver};
use super::transport::TcpTransport;
use super::{visa, InstrumentAddress, InstrumentDriver, InstrumentModel, InstrumentRole, SimulatedBench};
use crate::config::InstrumentConfig;
use crate::error::{AppResult, DaqError};

/// Name of a driver source (`visa`, `socket`, `simulated`, or a name chosen
/// by whoever registers an external factory).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverSource(String);

impl DriverSource {
    /// VISA session through the system VISA library.
    pub const VISA: &'static str = "visa";
    /// Raw SCPI over TCP.
    pub const SOCKET: &'static str = "socket";
    /// In-process simulation.
    pub const SIMULATED: &'static str = "simulated";

    /// Source name, lower-cased.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_ascii_lowercase())
    }

    /// The source name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DriverSource {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for DriverSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the active driver came from the first configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverVariant {
    /// First entry of the precedence list.
    Preferred,
    /// Any later entry.
    Fallback,
}

impl fmt::Display for DriverVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverVariant::Preferred => f.write_str("preferred"),
            DriverVariant::Fallback => f.write_str("fallback"),
        }
    }
}

/// A source that was tried and skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedSource {
    /// Source name.
    pub source: DriverSource,
    /// Why it was unavailable.
    pub reason: String,
}

/// Which driver is active for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverReport {
    /// Instrument name.
    pub instrument: String,
    /// Role the instrument fills.
    pub role: InstrumentRole,
    /// Instrument model.
    pub model: InstrumentModel,
    /// Source that produced the active driver.
    pub source: DriverSource,
    /// Preferred or fallback.
    pub variant: DriverVariant,
    /// Sources tried before `source`.
    pub skipped: Vec<SkippedSource>,
}

impl DriverReport {
    /// Report for a driver registered directly, without resolution.
    pub fn direct(
        instrument: impl Into<String>,
        role: InstrumentRole,
        model: InstrumentModel,
        source: impl Into<DriverSource>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            role,
            model,
            source: source.into(),
            variant: DriverVariant::Preferred,
            skipped: Vec::new(),
        }
    }
}

/// Driver plus the report describing how it was chosen.
pub struct ResolvedDriver {
    /// The driver.
    pub driver: Arc<dyn InstrumentDriver>,
    /// Resolution outcome.
    pub report: DriverReport,
}

/// Builds drivers for one source.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Builds a driver, or returns [`DaqError::DriverUnavailable`] when this
    /// source cannot serve the instrument.
    async fn build(&self, config: &InstrumentConfig) -> AppResult<Arc<dyn InstrumentDriver>>;
}

/// Maps driver source names to factories.
#[derive(Clone)]
pub struct DriverResolver {
    factories: HashMap<DriverSource, Arc<dyn DriverFactory>>,
}

impl Default for DriverResolver {
    fn default() -> Self {
        Self::with_builtin(SimulatedBench::default())
    }
}

impl DriverResolver {
    /// Resolver without any factory.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Resolver with the `visa`, `socket` and `simulated` factories. Simulated
    /// instruments are attached to `bench`.
    pub fn with_builtin(bench: SimulatedBench) -> Self {
        let mut resolver = Self::new();
        resolver.register(DriverSource::VISA, Arc::new(VisaFactory));
        resolver.register(DriverSource::SOCKET, Arc::new(SocketFactory));
        resolver.register(DriverSource::SIMULATED, Arc::new(SimulatedFactory { bench }));
        resolver
    }

    /// Registers (or replaces) the factory for `source`.
    pub fn register(&mut self, source: impl Into<DriverSource>, factory: Arc<dyn DriverFactory>) {
        self.factories.insert(source.into(), factory);
    }

    /// Registered source names, sorted.
    pub fn sources(&self) -> Vec<DriverSource> {
        let mut sources: Vec<_> = self.factories.keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Walks the configured precedence list of `config`.
    pub async fn resolve(&self, config: &InstrumentConfig) -> AppResult<ResolvedDriver> {
        if config.drivers.is_empty() {
            return Err(DaqError::Configuration(format!(
                "instrument '{}' lists no driver sources",
                config.name
            )));
        }

        let mut skipped = Vec::new();
        for (position, source) in config.drivers.iter().enumerate() {
            let attempt = match self.factories.get(source) {
                Some(factory) => factory.build(config).await,
                None => Err(DaqError::DriverUnavailable(format!(
                    "no factory registered for source '{}'",
                    source
                ))),
            };

            match attempt {
                Ok(driver) => {
                    let variant = if position == 0 {
                        DriverVariant::Preferred
                    } else {
                        DriverVariant::Fallback
                    };
                    info!(
                        instrument = %config.name,
                        role = %config.role,
                        %source,
                        %variant,
                        "driver resolved"
                    );
                    return Ok(ResolvedDriver {
                        driver,
                        report: DriverReport {
                            instrument: config.name.clone(),
                            role: config.role,
                            model: config.model,
                            source: source.clone(),
                            variant,
                            skipped,
                        },
                    });
                }
                Err(DaqError::DriverUnavailable(reason)) => {
                    debug!(instrument = %config.name, %source, %reason, "driver source skipped");
                    skipped.push(SkippedSource {
                        source: source.clone(),
                        reason,
                    });
                }
                Err(other) => return Err(other),
            }
        }

        let reasons: Vec<String> = skipped
            .iter()
            .map(|s| format!("{}: {}", s.source, s.reason))
            .collect();
        warn!(instrument = %config.name, "no driver source available");
        Err(DaqError::DriverUnavailable(format!(
            "no driver available for '{}' ({})",
            config.name,
            reasons.join("; ")
        )))
    }
}

fn require_command_set(config: &InstrumentConfig) -> AppResult<()> {
    match CommandSet::for_model(config.model, config.role) {
        Some(_) => Ok(()),
        None => Err(DaqError::DriverUnavailable(format!(
            "{} has no SCPI command set for role {}",
            config.model, config.role
        ))),
    }
}

struct VisaFactory;

#[async_trait]
impl DriverFactory for VisaFactory {
    async fn build(&self, config: &InstrumentConfig) -> AppResult<Arc<dyn InstrumentDriver>> {
        let resource = match config.parsed_address()? {
            InstrumentAddress::Visa(resource) => resource,
            InstrumentAddress::Socket { .. } => config.address.trim().to_string(),
            other => {
                return Err(DaqError::DriverUnavailable(format!(
                    "address {:?} is not a VISA resource",
                    other
                )))
            }
        };
        require_command_set(config)?;
        let transport = visa::open_transport(&config.name, &resource, config.timeout()).await?;
        let driver = ScpiDriver::new(
            config.name.clone(),
            config.model,
            config.role,
            config.channel.as_deref(),
            transport,
        )?;
        Ok(Arc::new(driver))
    }
}

struct SocketFactory;

#[async_trait]
impl DriverFactory for SocketFactory {
    async fn build(&self, config: &InstrumentConfig) -> AppResult<Arc<dyn InstrumentDriver>> {
        let InstrumentAddress::Socket { host, port } = config.parsed_address()? else {
            return Err(DaqError::DriverUnavailable(format!(
                "address '{}' is not a TCPIP socket address",
                config.address
            )));
        };
        require_command_set(config)?;
        let transport = TcpTransport::connect(&config.name, &host, port, config.timeout()).await?;
        let driver = ScpiDriver::new(
            config.name.clone(),
            config.model,
            config.role,
            config.channel.as_deref(),
            Box::new(transport),
        )?;
        Ok(Arc::new(driver))
    }
}

struct SimulatedFactory {
    bench: SimulatedBench,
}

#[async_trait]
impl DriverFactory for SimulatedFactory {
    async fn build(&self, config: &InstrumentConfig) -> AppResult<Arc<dyn InstrumentDriver>> {
        Ok(Arc::new(self.bench.instrument(config.name.clone(), config.role)))
    }
}
