//! Run plan execution.
//!
//! Runs the sweeps of a [`RunPlan`] in order, then its series, and persists
//! every result that got past preflight. After a failed or cancelled sweep the
//! station is driven to its safe state before the result is written; a
//! problem reaching the safe state is logged and never prevents the write.
//!
//! A preflight rejection commands nothing, so it neither triggers the safe
//! state nor produces a file.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::StorageConfig;
use crate::metadata::MetadataBuilder;
use crate::plan::RunPlan;
use crate::safety::validate_sequence;
use crate::station::Station;
use crate::storage::persist_result;
use crate::sweep::{
    validate_series, EmergencyStop, MeasurementResult, SeriesPosition, SeriesRunner, SweepError,
    SweepParameters,
};

/// What a plan run produced.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Files written, in run order.
    pub saved: Vec<PathBuf>,
    /// True when the emergency stop ended the run early.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Executes `plan` on `station`, writing results under `storage`.
pub async fn run_plan(
    station: &Station,
    plan: &RunPlan,
    storage: &StorageConfig,
    stop: &EmergencyStop,
) -> Result<RunSummary> {
    for warning in validate_sequence(&plan.sweeps, station.limits())? {
        warn!(%warning, "run plan warning");
    }
    for (index, series) in plan.series.iter().enumerate() {
        validate_series(series, station.limits()).with_context(|| format!("series {}", index))?;
    }

    let session = Session {
        station,
        plan,
        storage,
        stop,
    };
    let mut summary = RunSummary::default();

    for (index, sweep) in plan.sweeps.iter().enumerate() {
        info!(index, kind = %sweep.kind(), "starting sweep");
        let outcome = station.run_sweep(sweep, stop).await;
        let flow = session
            .conclude(sweep, None, outcome, &mut summary)
            .await
            .with_context(|| format!("sweep {} failed", index))?;
        if flow == Flow::Stop {
            return Ok(summary);
        }
    }

    for (index, series) in plan.series.iter().enumerate() {
        info!(index, kind = %series.sweep.kind(), "starting series");
        let flow = session
            .run_series(index, &mut summary)
            .await
            .with_context(|| format!("series {} failed", index))?;
        if flow == Flow::Stop {
            break;
        }
    }

    Ok(summary)
}

struct Session<'a> {
    station: &'a Station,
    plan: &'a RunPlan,
    storage: &'a StorageConfig,
    stop: &'a EmergencyStop,
}

impl Session<'_> {
    async fn run_series(&self, series_index: usize, summary: &mut RunSummary) -> Result<Flow> {
        let series = &self.plan.series[series_index];
        let mut runner = match SeriesRunner::start(self.station, &series.outer).await {
            Ok(runner) => runner,
            Err(e) => {
                if e.is_preflight() {
                    error!(error = %e, "series rejected before any instrument was commanded");
                } else {
                    error!(error = %e, "series setup failed, driving station to safe state");
                    self.safe_state().await;
                }
                return Err(e.into());
            }
        };

        for (index, point) in series.outer.points().into_iter().enumerate() {
            if self.stop.is_raised() {
                warn!(index, "series cancelled before outer point");
                summary.cancelled = true;
                self.safe_state().await;
                return Ok(Flow::Stop);
            }
            info!(index, %point, "moving to outer point");
            if let Err(e) = runner.move_to(&point).await {
                error!(error = %e, "outer axis move failed, driving station to safe state");
                self.safe_state().await;
                return Err(e).context(format!("outer point {} ({})", index, point));
            }

            let outcome = self.station.run_sweep(&series.sweep, self.stop).await;
            let position = SeriesPosition { index, point };
            let flow = self
                .conclude(&series.sweep, Some(position), outcome, summary)
                .await
                .with_context(|| format!("sweep at outer point {}", index))?;
            if flow == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Logs, reaches the safe state where needed and persists one sweep outcome.
    async fn conclude(
        &self,
        params: &SweepParameters,
        position: Option<SeriesPosition>,
        outcome: std::result::Result<MeasurementResult, SweepError>,
        summary: &mut RunSummary,
    ) -> Result<Flow> {
        let (result, failure) = match outcome {
            Ok(result) => (result, None),
            Err(e) => {
                let (partial, source) = e.into_parts();
                if source.is_preflight() {
                    error!(error = %source, "sweep rejected before any instrument was commanded");
                    return Err(source.into());
                }
                (partial, Some(source))
            }
        };

        if let Some(source) = &failure {
            error!(error = %source, "sweep failed, driving station to safe state");
            self.safe_state().await;
        } else if result.cancelled() {
            warn!(rows = result.len(), "run cancelled, driving station to safe state");
            self.safe_state().await;
        }

        match self.persist(params, position, &result).await {
            Ok(path) => {
                info!(path = %path.display(), rows = result.len(), "result saved");
                summary.saved.push(path);
            }
            Err(e) if failure.is_some() => {
                error!(error = %e, "failed to persist partial result");
            }
            Err(e) => return Err(e),
        }

        if let Some(source) = failure {
            return Err(source.into());
        }
        if result.cancelled() {
            summary.cancelled = true;
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }

    async fn persist(
        &self,
        params: &SweepParameters,
        position: Option<SeriesPosition>,
        result: &MeasurementResult,
    ) -> Result<PathBuf> {
        let experiment = &self.plan.experiment;
        let metadata = MetadataBuilder::new()
            .experiment_name(&experiment.name)
            .sample(&experiment.sample)
            .annotations(&experiment.notes)
            .result(result)
            .parameters(params)?
            .series(position)
            .safety(self.station.limits())
            .drivers(&self.station.driver_report())
            .build();
        persist_result(self.storage, &metadata, result)
            .await
            .context("Failed to persist sweep result")
    }

    async fn safe_state(&self) {
        if let Err(e) = self.station.emergency_stop().await {
            error!(error = %e, "safe state incomplete");
        }
    }
}
