//! Measurement result table.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::SweepKind;

/// Names and units of the three data columns of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Columns {
    /// Commanded quantity.
    pub setpoint: &'static str,
    /// Unit of the setpoint.
    pub setpoint_unit: &'static str,
    /// Meter quantity.
    pub measured: &'static str,
    /// Unit of the meter reading.
    pub measured_unit: &'static str,
    /// Quantity computed from setpoint and reading.
    pub derived: &'static str,
    /// Unit of the derived quantity.
    pub derived_unit: &'static str,
}

impl Columns {
    /// Column layout used by a measurement type.
    pub fn for_kind(kind: SweepKind) -> Self {
        match kind {
            SweepKind::Iv => Columns {
                setpoint: "current",
                setpoint_unit: "A",
                measured: "voltage",
                measured_unit: "V",
                derived: "resistance",
                derived_unit: "Ohm",
            },
            SweepKind::Differential => Columns {
                setpoint: "bias_voltage",
                setpoint_unit: "V",
                measured: "lockin_r",
                measured_unit: "V",
                derived: "differential_conductance",
                derived_unit: "a.u.",
            },
            SweepKind::Hall => Columns {
                setpoint: "field",
                setpoint_unit: "T",
                measured: "hall_voltage",
                measured_unit: "V",
                derived: "hall_resistance",
                derived_unit: "Ohm",
            },
            SweepKind::Temperature => Columns {
                setpoint: "temperature",
                setpoint_unit: "K",
                measured: "voltage",
                measured_unit: "V",
                derived: "resistance",
                derived_unit: "Ohm",
            },
            SweepKind::Monitor => Columns {
                setpoint: "elapsed",
                setpoint_unit: "s",
                measured: "voltage",
                measured_unit: "V",
                derived: "resistance",
                derived_unit: "Ohm",
            },
        }
    }
}

/// One completed setpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRow {
    /// Position in the setpoint sequence, from 0.
    pub index: usize,
    /// Commanded value.
    pub setpoint: f64,
    /// Averaged meter reading.
    pub measured: f64,
    /// Derived quantity, absent when undefined (e.g. zero current).
    pub derived: Option<f64>,
    /// Time the reading completed.
    pub timestamp: DateTime<Utc>,
}

/// Ordered table of completed setpoints.
///
/// Rows are only ever appended by the sweep runner; callers get read access.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementResult {
    run_id: Uuid,
    kind: SweepKind,
    columns: Columns,
    rows: Vec<MeasurementRow>,
    cancelled: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl MeasurementResult {
    pub(crate) fn new(kind: SweepKind) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            kind,
            columns: Columns::for_kind(kind),
            rows: Vec::new(),
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn push(&mut self, setpoint: f64, measured: f64, derived: Option<f64>) {
        let index = self.rows.len();
        self.rows.push(MeasurementRow {
            index,
            setpoint,
            measured,
            derived,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn finish(&mut self, cancelled: bool) {
        self.cancelled = cancelled;
        self.finished_at = Some(Utc::now());
    }

    /// Unique id of the run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Measurement type.
    pub fn kind(&self) -> SweepKind {
        self.kind
    }

    /// Column names and units.
    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// Completed rows in setpoint order.
    pub fn rows(&self) -> &[MeasurementRow] {
        &self.rows
    }

    /// Number of completed rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if no setpoint completed.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True if the emergency stop ended the sweep early.
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Time the runner created the result.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time the runner stopped appending, `None` while running.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Setpoint column.
    pub fn setpoints(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.setpoint).collect()
    }

    /// Measured column.
    pub fn measured(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.measured).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_indexed_in_order() {
        let mut result = MeasurementResult::new(SweepKind::Iv);
        result.push(-1e-6, -1e-4, Some(100.0));
        result.push(0.0, 0.0, None);
        result.finish(false);

        assert_eq!(result.len(), 2);
        assert_eq!(result.rows()[1].index, 1);
        assert_eq!(result.setpoints(), vec![-1e-6, 0.0]);
        assert!(!result.cancelled());
        assert!(result.finished_at().is_some());
        assert_eq!(result.columns().derived, "resistance");
    }
}
