//! Nested sweeps.
//!
//! A [`SweepSeries`] repeats one inner sweep at every point of an outer axis:
//! a list of field vectors, field angles at a fixed magnitude in one plane, or
//! a list of temperatures. The outer instruments stay leased for the whole
//! series, so no other sweep can move them between points.
//!
//! Field points command every registered magnet axis. Axes that shrink are
//! moved first, then the ones that grow, so the field magnitude never exceeds
//! the larger of the two endpoints while the magnets ramp.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use super::params::{require_finite, require_positive};
use super::SweepParameters;
use crate::error::{AppResult, DaqError};
use crate::instrument::{
    FieldAxis, InstrumentRole, InstrumentSetting, InstrumentStatus, SettingKind,
};
use crate::safety::{
    check_field_vector, estimate_duration, validate_sweep, SafetyBound, SafetyLimits,
};
use crate::station::{InstrumentLease, Station};

fn default_field_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_field_ramp_rate() -> f64 {
    0.1
}

fn default_temperature_settle() -> Duration {
    Duration::from_secs(300)
}

fn default_temperature_ramp_rate() -> f64 {
    1.0
}

/// Plane a field angle is measured in, from the first axis towards the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldPlane {
    /// From x towards y.
    #[default]
    Xy,
    /// From x towards z.
    Xz,
    /// From y towards z.
    Yz,
}

impl FieldPlane {
    fn axes(&self) -> (FieldAxis, FieldAxis) {
        match self {
            FieldPlane::Xy => (FieldAxis::X, FieldAxis::Y),
            FieldPlane::Xz => (FieldAxis::X, FieldAxis::Z),
            FieldPlane::Yz => (FieldAxis::Y, FieldAxis::Z),
        }
    }
}

/// Outer axis of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OuterAxis {
    /// Explicit field vectors `[x, y, z]` (T).
    FieldVectors {
        /// Points, in order.
        vectors: Vec<[f64; 3]>,
        /// Wait after the magnets reach a point.
        #[serde(default = "default_field_settle", with = "humantime_serde")]
        settle: Duration,
        /// Magnet ramp rate (T/min).
        #[serde(default = "default_field_ramp_rate")]
        ramp_rate: f64,
    },
    /// Field of fixed magnitude rotated through a plane.
    FieldAngle {
        /// Field magnitude (T).
        magnitude: f64,
        /// Rotation plane.
        #[serde(default)]
        plane: FieldPlane,
        /// First angle (degrees).
        start_angle: f64,
        /// Last angle (degrees).
        stop_angle: f64,
        /// Number of angles, both ends inclusive.
        num_points: usize,
        /// Wait after the magnets reach a point.
        #[serde(default = "default_field_settle", with = "humantime_serde")]
        settle: Duration,
        /// Magnet ramp rate (T/min).
        #[serde(default = "default_field_ramp_rate")]
        ramp_rate: f64,
    },
    /// Temperature setpoints (K).
    Temperature {
        /// Points, in order.
        temperatures: Vec<f64>,
        /// Wait after the ramp completes.
        #[serde(default = "default_temperature_settle", with = "humantime_serde")]
        settle: Duration,
        /// Heater ramp rate (K/min).
        #[serde(default = "default_temperature_ramp_rate")]
        ramp_rate: f64,
    },
}

/// One point of an outer axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "axis", rename_all = "snake_case")]
pub enum SeriesPoint {
    /// Field vector (T).
    Field {
        /// x component.
        x: f64,
        /// y component.
        y: f64,
        /// z component.
        z: f64,
    },
    /// Temperature (K).
    Temperature {
        /// Setpoint.
        kelvin: f64,
    },
}

impl SeriesPoint {
    fn field(components: [f64; 3]) -> Self {
        SeriesPoint::Field {
            x: components[0],
            y: components[1],
            z: components[2],
        }
    }
}

impl fmt::Display for SeriesPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesPoint::Field { x, y, z } => write!(f, "B = ({:.4}, {:.4}, {:.4}) T", x, y, z),
            SeriesPoint::Temperature { kelvin } => write!(f, "T = {:.4} K", kelvin),
        }
    }
}

/// Where in a series a result was taken. Recorded in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPosition {
    /// Index of the outer point, from 0.
    pub index: usize,
    /// The outer point.
    pub point: SeriesPoint,
}

impl OuterAxis {
    /// Outer points in order.
    pub fn points(&self) -> Vec<SeriesPoint> {
        match self {
            OuterAxis::FieldVectors { vectors, .. } => {
                vectors.iter().copied().map(SeriesPoint::field).collect()
            }
            OuterAxis::FieldAngle {
                magnitude,
                plane,
                start_angle,
                stop_angle,
                num_points,
                ..
            } => {
                let (first, second) = plane.axes();
                let step = if *num_points > 1 {
                    (stop_angle - start_angle) / (*num_points - 1) as f64
                } else {
                    0.0
                };
                (0..*num_points)
                    .map(|i| {
                        let angle = (start_angle + step * i as f64).to_radians();
                        let mut field = [0.0; 3];
                        field[first.index()] = magnitude * angle.cos();
                        field[second.index()] = magnitude * angle.sin();
                        SeriesPoint::field(field)
                    })
                    .collect()
            }
            OuterAxis::Temperature { temperatures, .. } => temperatures
                .iter()
                .map(|&kelvin| SeriesPoint::Temperature { kelvin })
                .collect(),
        }
    }

    fn is_field(&self) -> bool {
        !matches!(self, OuterAxis::Temperature { .. })
    }

    fn settle(&self) -> Duration {
        match self {
            OuterAxis::FieldVectors { settle, .. }
            | OuterAxis::FieldAngle { settle, .. }
            | OuterAxis::Temperature { settle, .. } => *settle,
        }
    }

    /// Ramp rate per minute.
    fn ramp_rate(&self) -> f64 {
        match self {
            OuterAxis::FieldVectors { ramp_rate, .. }
            | OuterAxis::FieldAngle { ramp_rate, .. }
            | OuterAxis::Temperature { ramp_rate, .. } => *ramp_rate,
        }
    }

    /// Field axes that take a non-zero component at some point.
    fn driven_axes(&self) -> Vec<FieldAxis> {
        let points = self.points();
        FieldAxis::ALL
            .into_iter()
            .filter(|axis| {
                points.iter().any(|point| match point {
                    SeriesPoint::Field { x, y, z } => [*x, *y, *z][axis.index()] != 0.0,
                    SeriesPoint::Temperature { .. } => false,
                })
            })
            .collect()
    }

    /// Roles the series holds on `station`.
    ///
    /// Field series hold every registered magnet axis and fail with
    /// [`DaqError::InstrumentNotConfigured`] when a driven axis is missing.
    pub fn roles(&self, station: &Station) -> AppResult<Vec<InstrumentRole>> {
        if !self.is_field() {
            return Ok(vec![InstrumentRole::TemperatureController]);
        }
        let driven = self.driven_axes();
        let mut roles = Vec::new();
        for axis in FieldAxis::ALL {
            let role = InstrumentRole::magnet(axis);
            if station.instrument(role).is_some() {
                roles.push(role);
            } else if driven.contains(&axis) {
                return Err(DaqError::InstrumentNotConfigured(role.to_string()));
            }
        }
        Ok(roles)
    }
}

/// An inner sweep repeated at every point of an outer axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSeries {
    /// Outer axis.
    pub outer: OuterAxis,
    /// Sweep run at every outer point.
    pub sweep: SweepParameters,
}

impl SweepSeries {
    /// Expected wall time: every inner sweep, every outer settle and the outer
    /// ramps between consecutive points. The approach to the first point is
    /// not counted since the starting position is only known at run time.
    pub fn estimated_duration(&self) -> Duration {
        let points = self.outer.points();
        let per_point = estimate_duration(&self.sweep) + self.outer.settle();
        let travel: f64 = points
            .windows(2)
            .map(|pair| match (pair[0], pair[1]) {
                (
                    SeriesPoint::Field { x, y, z },
                    SeriesPoint::Field {
                        x: x2,
                        y: y2,
                        z: z2,
                    },
                ) => (x2 - x).abs().max((y2 - y).abs()).max((z2 - z).abs()),
                (SeriesPoint::Temperature { kelvin }, SeriesPoint::Temperature { kelvin: next }) => {
                    (next - kelvin).abs()
                }
                _ => 0.0,
            })
            .sum();
        let rate = self.outer.ramp_rate();
        let ramping = if rate > 0.0 { travel * 60.0 / rate } else { 0.0 };
        per_point * points.len() as u32 + Duration::from_secs_f64(ramping)
    }
}

/// Validates a series against the limits before anything is commanded.
pub fn validate_series(series: &SweepSeries, limits: &SafetyLimits) -> AppResult<()> {
    let outer = &series.outer;
    match (outer.is_field(), &series.sweep) {
        (true, SweepParameters::Hall(_)) => {
            return Err(DaqError::Configuration(
                "a Hall sweep cannot run inside a field series".to_string(),
            ))
        }
        (false, SweepParameters::Temperature(_)) => {
            return Err(DaqError::Configuration(
                "a temperature sweep cannot run inside a temperature series".to_string(),
            ))
        }
        _ => {}
    }

    let points = outer.points();
    if points.is_empty() {
        return Err(DaqError::Configuration(
            "series outer axis has no points".to_string(),
        ));
    }
    if let OuterAxis::FieldAngle {
        magnitude,
        start_angle,
        stop_angle,
        ..
    } = outer
    {
        require_finite("start_angle", *start_angle)?;
        require_finite("stop_angle", *stop_angle)?;
        require_positive("magnitude", *magnitude)?;
    }

    require_positive("ramp_rate", outer.ramp_rate())?;
    if outer.is_field() {
        limits.check(SafetyBound::MaxFieldRampRate, outer.ramp_rate())?;
    } else {
        limits.check(SafetyBound::MaxTemperatureRampRate, outer.ramp_rate())?;
    }

    for point in &points {
        match *point {
            SeriesPoint::Field { x, y, z } => {
                check_field_vector(x, y, z, limits)?;
            }
            SeriesPoint::Temperature { kelvin } => {
                limits.check(SafetyBound::MaxTemperature, kelvin)?;
                limits.check(SafetyBound::MinTemperature, kelvin)?;
            }
        }
    }

    validate_sweep(&series.sweep, limits)
}

/// Holds the outer instruments of a series and moves them between points.
pub struct SeriesRunner {
    lease: InstrumentLease,
    settle: Duration,
    rate_per_second: f64,
    /// Last known output per held role.
    position: Vec<(InstrumentRole, f64)>,
}

impl SeriesRunner {
    /// Leases the outer roles, applies the ramp rate and reads where they are.
    pub async fn start(station: &Station, outer: &OuterAxis) -> AppResult<Self> {
        let roles = outer.roles(station)?;
        let lease = station.acquire(&roles)?;
        let ramp = InstrumentSetting::new(SettingKind::RampRate, outer.ramp_rate());

        for role in &roles {
            let driver = lease.driver(*role)?;
            if !driver.supports_setting(ramp.kind) {
                return Err(DaqError::SettingUnsupported(format!(
                    "'{}' cannot apply {}",
                    lease.name(*role)?,
                    ramp.kind
                )));
            }
        }

        let mut position = Vec::with_capacity(roles.len());
        for role in &roles {
            let driver = lease.driver(*role)?;
            if driver.get_status().await? == InstrumentStatus::Fault {
                return Err(DaqError::InstrumentFault(lease.name(*role)?.to_string()));
            }
            driver.configure(ramp).await?;
            position.push((*role, driver.read_measurement().await?));
        }

        info!(roles = ?roles, ramp_rate = outer.ramp_rate(), "series outer axis held");
        Ok(Self {
            lease,
            settle: outer.settle(),
            rate_per_second: outer.ramp_rate() / 60.0,
            position,
        })
    }

    /// Drives the outer instruments to `point` and waits for the ramp and settle.
    pub async fn move_to(&mut self, point: &SeriesPoint) -> AppResult<()> {
        let targets: Vec<(InstrumentRole, f64)> = self
            .position
            .iter()
            .map(|&(role, _)| {
                let target = match (*point, role.field_axis()) {
                    (SeriesPoint::Field { x, y, z }, Some(axis)) => [x, y, z][axis.index()],
                    (SeriesPoint::Temperature { kelvin }, None) => kelvin,
                    _ => 0.0,
                };
                (role, target)
            })
            .collect();

        // Shrinking components first, growing ones second.
        let (shrinking, growing): (Vec<_>, Vec<_>) = targets.into_iter().partition(|(role, target)| {
            target.abs() <= self.current(*role).abs()
        });
        for phase in [shrinking, growing] {
            self.ramp(&phase).await?;
        }

        debug!(%point, settle_ms = self.settle.as_millis() as u64, "outer point reached, settling");
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        Ok(())
    }

    fn current(&self, role: InstrumentRole) -> f64 {
        self.position
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, value)| *value)
            .unwrap_or(0.0)
    }

    async fn ramp(&mut self, moves: &[(InstrumentRole, f64)]) -> AppResult<()> {
        let mut longest: f64 = 0.0;
        for &(role, target) in moves {
            let from = self.current(role);
            if from == target {
                continue;
            }
            self.lease.driver(role)?.set_output(target).await?;
            longest = longest.max((target - from).abs());
            if let Some(entry) = self.position.iter_mut().find(|(r, _)| *r == role) {
                entry.1 = target;
            }
        }
        if longest > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(longest / self.rate_per_second)).await;
        }
        Ok(())
    }
}
