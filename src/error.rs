//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures a measurement session can run into, from malformed
//! sweep requests to instruments that stop answering mid-sweep.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: malformed or out-of-range sweep parameters, safety limits or
//!   station configuration. Always raised before any hardware interaction.
//! - **`LimitExceeded`**: a safety-interlock rejection. Names the violated bound, the
//!   requested value and the configured limit.
//! - **`InstrumentCommunication`**: propagated from a driver. Never retried by this
//!   crate; the sweep runner attaches the partial result (see [`SweepError`]).
//! - **`InstrumentFault`**: an instrument reported `FAULT` from its status query.
//!   The runner only queries status before the first command, so this is a
//!   preflight rejection.
//! - **`SettingUnsupported`**: a driver cannot apply a compliance, range, filter or
//!   ramp setting the sweep needs. Also detected before the first command.
//! - **`InstrumentBusy`**: the instrument is already leased by a running sweep.
//! - **`DriverUnavailable`**: a driver source cannot be constructed in this build or
//!   for this instrument. The resolver treats it as "try the next source".
//!
//! Cancellation through the emergency stop is not an error: the runner returns a
//! [`MeasurementResult`](crate::sweep::MeasurementResult) with its `cancelled` flag set.
//!
//! [`SweepError`]: crate::sweep::SweepError

use crate::safety::SafetyBound;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type of the crate.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Semantically invalid configuration or sweep request.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Safety interlock rejected a requested value.
    #[error("Safety limit exceeded: {bound} requested {value}, limit is {limit}")]
    LimitExceeded {
        /// The violated bound.
        bound: SafetyBound,
        /// The offending value.
        value: f64,
        /// The configured limit.
        limit: f64,
    },

    /// Communication with an instrument failed.
    #[error("Instrument '{instrument}' communication error: {message}")]
    InstrumentCommunication {
        /// Instrument name as registered in the station.
        instrument: String,
        /// Driver-level description.
        message: String,
    },

    /// Instrument reported a fault status.
    #[error("Instrument '{0}' reports FAULT status")]
    InstrumentFault(String),

    /// Instrument is leased by another sweep.
    #[error("Instrument '{0}' is busy with another sweep")]
    InstrumentBusy(String),

    /// No instrument is registered for the requested role.
    #[error("No instrument configured for role '{0}'")]
    InstrumentNotConfigured(String),

    /// A driver cannot apply a sweep-wide setting the sweep needs.
    #[error("Setting not supported: {0}")]
    SettingUnsupported(String),

    /// A driver source cannot be used for this instrument.
    #[error("Driver unavailable: {0}")]
    DriverUnavailable(String),

    /// A cargo feature needed for the operation is not compiled in.
    #[error("Feature '{0}' is not enabled")]
    FeatureNotEnabled(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Builds an [`DaqError::InstrumentCommunication`] error.
    pub fn communication(instrument: impl Into<String>, message: impl std::fmt::Display) -> Self {
        DaqError::InstrumentCommunication {
            instrument: instrument.into(),
            message: message.to_string(),
        }
    }

    /// True for errors raised before any instrument was commanded.
    ///
    /// A `FAULT` status counts: status is only queried during the pre-check.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            DaqError::Config(_)
                | DaqError::Configuration(_)
                | DaqError::LimitExceeded { .. }
                | DaqError::InstrumentBusy(_)
                | DaqError::InstrumentNotConfigured(_)
                | DaqError::InstrumentFault(_)
                | DaqError::SettingUnsupported(_)
        )
    }
}
