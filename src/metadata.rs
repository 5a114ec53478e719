//! Run metadata.
//!
//! Every persisted result carries a [`Metadata`] record describing the run:
//!
//! - **`experiment_name`** and **`sample`**: what was measured.
//! - **`annotations`**: free-text operator notes.
//! - **`run_id`**, **`kind`**, **`started_at`**: copied from the result.
//! - **`parameters`**: the sweep parameters exactly as validated.
//! - **`series`**: the outer point, for sweeps run inside a series.
//! - **`safety`**: the limits the sweep was checked against.
//! - **`drivers`**: which driver source was active for every instrument.
//! - **`software_version`**: version of this crate.
//!
//! CSV files carry it as a commented JSON header, JSON files embed it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppResult, DaqError};
use crate::instrument::DriverReport;
use crate::safety::SafetyLimits;
use crate::sweep::{MeasurementResult, MonitorConfig, SeriesPosition, SweepKind, SweepParameters};

/// Driver resolution outcome as recorded in metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverEntry {
    /// Instrument name.
    pub instrument: String,
    /// Role in the station.
    pub role: String,
    /// Model.
    pub model: String,
    /// Active driver source.
    pub source: String,
    /// `preferred` or `fallback`.
    pub variant: String,
}

impl From<&DriverReport> for DriverEntry {
    fn from(report: &DriverReport) -> Self {
        Self {
            instrument: report.instrument.clone(),
            role: report.role.to_string(),
            model: report.model.to_string(),
            source: report.source.to_string(),
            variant: report.variant.to_string(),
        }
    }
}

/// Describes one sweep run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// The name of the experiment.
    pub experiment_name: String,
    /// Sample identifier.
    pub sample: String,
    /// Operator notes.
    pub annotations: String,
    /// Run id of the result.
    pub run_id: Option<Uuid>,
    /// Measurement type.
    pub kind: Option<SweepKind>,
    /// Time the sweep started.
    pub started_at: Option<DateTime<Utc>>,
    /// True if the emergency stop ended the run.
    pub cancelled: bool,
    /// Sweep parameters.
    pub parameters: serde_json::Value,
    /// Outer point when the sweep belongs to a series.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<SeriesPosition>,
    /// Safety limits in force.
    pub safety: Option<SafetyLimits>,
    /// Active drivers.
    pub drivers: Vec<DriverEntry>,
    /// Version of the acquisition software.
    pub software_version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            experiment_name: "Default Experiment".to_string(),
            sample: String::new(),
            annotations: String::new(),
            run_id: None,
            kind: None,
            started_at: None,
            cancelled: false,
            parameters: serde_json::Value::Null,
            series: None,
            safety: None,
            drivers: Vec::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A builder for constructing `Metadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    /// Starts from [`Metadata::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Experiment name.
    pub fn experiment_name(mut self, name: &str) -> Self {
        self.inner.experiment_name = name.to_string();
        self
    }

    /// Sample identifier.
    pub fn sample(mut self, sample: &str) -> Self {
        self.inner.sample = sample.to_string();
        self
    }

    /// Operator notes.
    pub fn annotations(mut self, annotations: &str) -> Self {
        self.inner.annotations = annotations.to_string();
        self
    }

    /// Copies run id, kind, start time and cancel flag from `result`.
    pub fn result(mut self, result: &MeasurementResult) -> Self {
        self.inner.run_id = Some(result.run_id());
        self.inner.kind = Some(result.kind());
        self.inner.started_at = Some(result.started_at());
        self.inner.cancelled = result.cancelled();
        self
    }

    /// Sweep parameters.
    pub fn parameters(mut self, params: &SweepParameters) -> AppResult<Self> {
        self.inner.parameters = serde_json::to_value(params).map_err(|e| {
            DaqError::Configuration(format!("sweep parameters are not serializable: {}", e))
        })?;
        Ok(self)
    }

    /// Monitor settings, recorded in place of sweep parameters.
    pub fn monitor(mut self, config: &MonitorConfig) -> AppResult<Self> {
        self.inner.parameters = serde_json::to_value(config).map_err(|e| {
            DaqError::Configuration(format!("monitor settings are not serializable: {}", e))
        })?;
        Ok(self)
    }

    /// Outer point of a series.
    pub fn series(mut self, position: Option<SeriesPosition>) -> Self {
        self.inner.series = position;
        self
    }

    /// Safety limits.
    pub fn safety(mut self, limits: &SafetyLimits) -> Self {
        self.inner.safety = Some(*limits);
        self
    }

    /// Driver report of the station.
    pub fn drivers(mut self, reports: &[DriverReport]) -> Self {
        self.inner.drivers = reports.iter().map(DriverEntry::from).collect();
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> Metadata {
        self.inner
    }
}

impl Metadata {
    /// Validates the metadata.
    pub fn validate(&self) -> AppResult<()> {
        if self.experiment_name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "Experiment name cannot be empty.".to_string(),
            ));
        }
        Ok(())
    }
}
