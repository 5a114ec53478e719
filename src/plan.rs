//! Run plan files.
//!
//! A run plan is a TOML file listing the sweeps to run in order:
//!
//! ```toml
//! [experiment]
//! name = "Hall at base temperature"
//! sample = "S17-B"
//!
//! [[sweeps]]
//! kind = "iv"
//! start_current = -1e-6
//! stop_current = 1e-6
//! num_points = 101
//! settle_delay = "50ms"
//!
//! [[sweeps]]
//! kind = "hall"
//! start_field = -2.0
//! stop_field = 2.0
//! num_points = 81
//! ramp_rate = 0.2
//!
//! [[series]]
//! [series.outer]
//! kind = "field_angle"
//! magnitude = 0.5
//! start_angle = 0.0
//! stop_angle = 90.0
//! num_points = 7
//!
//! [series.sweep]
//! kind = "iv"
//! start_current = -1e-6
//! stop_current = 1e-6
//! num_points = 51
//! ```
//!
//! Every sweep is validated while the file is parsed. Series run after the
//! plain sweeps.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppResult, DaqError};
use crate::sweep::{SweepParameters, SweepSeries};

/// Description of the experiment a plan belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentInfo {
    /// Experiment name.
    #[serde(default = "default_experiment_name")]
    pub name: String,
    /// Sample identifier.
    #[serde(default)]
    pub sample: String,
    /// Operator notes.
    #[serde(default)]
    pub notes: String,
}

impl Default for ExperimentInfo {
    fn default() -> Self {
        Self {
            name: default_experiment_name(),
            sample: String::new(),
            notes: String::new(),
        }
    }
}

fn default_experiment_name() -> String {
    "Default Experiment".to_string()
}

/// Ordered list of sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    /// Experiment description.
    #[serde(default)]
    pub experiment: ExperimentInfo,
    /// Sweeps, run in order.
    #[serde(default)]
    pub sweeps: Vec<SweepParameters>,
    /// Nested sweeps, run in order after `sweeps`.
    #[serde(default)]
    pub series: Vec<SweepSeries>,
}

impl RunPlan {
    /// Parses a plan from TOML text.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let plan: RunPlan = toml::from_str(text)
            .map_err(|e| DaqError::Configuration(format!("invalid run plan: {}", e)))?;
        if plan.sweeps.is_empty() && plan.series.is_empty() {
            return Err(DaqError::Configuration(
                "run plan contains no sweeps or series".to_string(),
            ));
        }
        Ok(plan)
    }

    /// Reads and parses a plan file.
    pub async fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&text)
    }
}
