//! Station configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `CRYODAQ_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore, so keys that contain a
//! single underscore stay intact:
//!
//! ```text
//! CRYODAQ_APPLICATION__LOG_LEVEL=debug
//! CRYODAQ_SAFETY__MAX_FIELD=6.0
//! CRYODAQ_STORAGE__OUTPUT_DIR=/data/run42
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "Fridge 2"
//! log_level = "info"
//!
//! [safety]
//! max_field = 6.0
//!
//! [storage]
//! output_dir = "data"
//! format = "csv"
//!
//! [[instruments]]
//! name = "k6221"
//! role = "current_source"
//! model = "keithley6221"
//! address = "TCPIP::192.168.1.100::1394::SOCKET"
//! drivers = ["visa", "socket"]
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::instrument::{DriverSource, InstrumentAddress, InstrumentModel, InstrumentRole};
use crate::safety::SafetyLimits;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CRYODAQ_";

/// Top-level station configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Safety interlock limits
    #[serde(default)]
    pub safety: SafetyLimits,
    /// Result persistence
    #[serde(default)]
    pub storage: StorageConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, recorded in result metadata
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Result file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    /// CSV with a commented JSON metadata header.
    #[default]
    Csv,
    /// Single JSON document.
    Json,
}

impl StorageFormat {
    /// File extension.
    pub fn extension(&self) -> &'static str {
        match self {
            StorageFormat::Csv => "csv",
            StorageFormat::Json => "json",
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for result files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// File format
    #[serde(default)]
    pub format: StorageFormat,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            format: StorageFormat::default(),
        }
    }
}

/// One physical instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Unique instrument name
    pub name: String,
    /// Role the instrument fills in the station
    pub role: InstrumentRole,
    /// Instrument model
    pub model: InstrumentModel,
    /// VISA resource, `TCPIP::host::port::SOCKET`, device id or `SIM`
    pub address: String,
    /// SMU channel letter, Lakeshore input or loop
    #[serde(default)]
    pub channel: Option<String>,
    /// Driver sources to try, in order of precedence
    pub drivers: Vec<DriverSource>,
    /// I/O timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl InstrumentConfig {
    /// I/O timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Parsed `address`.
    pub fn parsed_address(&self) -> AppResult<InstrumentAddress> {
        InstrumentAddress::parse(&self.address)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "cryo_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_timeout_ms() -> u64 {
    5000
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a TOML file and `CRYODAQ_` environment variables.
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Safety limits are positive and finite
    /// - Instrument names and roles are unique
    /// - Each model can fill its role
    /// - Each instrument has a parseable address and at least one driver source
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.safety.validate()?;

        let mut names = HashSet::new();
        let mut roles = HashSet::new();
        for instrument in &self.instruments {
            if !names.insert(instrument.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate instrument name: '{}'",
                    instrument.name
                )));
            }
            if !roles.insert(instrument.role) {
                return Err(DaqError::Configuration(format!(
                    "Role '{}' is assigned to more than one instrument",
                    instrument.role
                )));
            }
            self.validate_instrument(instrument)?;
        }

        Ok(())
    }

    fn validate_instrument(&self, instrument: &InstrumentConfig) -> AppResult<()> {
        if instrument.name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "instrument name cannot be empty".to_string(),
            ));
        }
        if !instrument.model.supports(instrument.role) {
            return Err(DaqError::Configuration(format!(
                "Instrument '{}': {} cannot act as {}",
                instrument.name, instrument.model, instrument.role
            )));
        }
        if instrument.drivers.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Instrument '{}': 'drivers' must list at least one source",
                instrument.name
            )));
        }
        if instrument.timeout_ms == 0 {
            return Err(DaqError::Configuration(format!(
                "Instrument '{}': 'timeout_ms' must be > 0",
                instrument.name
            )));
        }
        instrument.parsed_address()?;
        Ok(())
    }

    /// Instrument configured for `role`.
    pub fn instrument_for(&self, role: InstrumentRole) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|i| i.role == role)
    }
}
