//! Instrument capability boundary.
//!
//! Every driver, whatever talks to the hardware underneath, is consumed through
//! exactly three operations: [`InstrumentDriver::set_output`],
//! [`InstrumentDriver::read_measurement`] and [`InstrumentDriver::get_status`].
//! What "output" and "measurement" mean is fixed by the [`InstrumentRole`] the
//! instrument is registered under in the [`Station`](crate::station::Station):
//!
//! | Role                     | `set_output`               | `read_measurement`      |
//! |--------------------------|----------------------------|-------------------------|
//! | `current_source`         | source current (A)         | programmed current (A)  |
//! | `voltmeter`              | unsupported                | DC voltage (V)          |
//! | `bias_source`            | DC bias voltage (V)        | measured current (A)    |
//! | `lock_in`                | oscillator amplitude (V)   | demodulated R (V)       |
//! | `magnet_x/y/z`           | target field (T)           | field (T)               |
//! | `temperature_controller` | temperature setpoint (K)   | temperature (K)         |
//!
//! Sweep-wide settings (compliance, range, lock-in filter, ramp rate) are
//! applied once before the first setpoint through
//! [`InstrumentDriver::configure`]. A driver advertises what it can apply with
//! [`InstrumentDriver::supports_setting`]; the runner refuses a sweep whose
//! settings some driver cannot apply before anything is commanded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppResult, DaqError};

pub mod resolver;
pub mod scpi;
pub mod simulated;
pub mod transport;
pub mod visa;

pub use resolver::{
    DriverFactory, DriverReport, DriverResolver, DriverSource, DriverVariant, ResolvedDriver,
    SkippedSource,
};
pub use simulated::{SimulatedBench, SimulatedInstrument};

/// Status reported by an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentStatus {
    /// Ready to be commanded.
    Ok,
    /// Hardware or firmware fault (quench, error queue not empty, overload).
    Fault,
}

/// Kind of a sweep-wide instrument setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKind {
    /// Voltage compliance of a current source (V).
    ComplianceVoltage,
    /// Fixed source range of a current source (A).
    CurrentRange,
    /// Current compliance of a voltage source (A).
    ComplianceCurrent,
    /// Lock-in reference frequency (Hz).
    Frequency,
    /// Lock-in filter time constant (s).
    TimeConstant,
    /// Ramp rate of a magnet axis (T/min) or temperature loop (K/min).
    RampRate,
}

impl SettingKind {
    /// Roles a setting of this kind is meaningful for.
    pub fn applies_to(&self, role: InstrumentRole) -> bool {
        use InstrumentRole::*;
        match self {
            SettingKind::ComplianceVoltage | SettingKind::CurrentRange => role == CurrentSource,
            SettingKind::ComplianceCurrent => role == BiasSource,
            SettingKind::Frequency | SettingKind::TimeConstant => role == LockIn,
            SettingKind::RampRate => {
                matches!(role, MagnetX | MagnetY | MagnetZ | TemperatureController)
            }
        }
    }
}

impl fmt::Display for SettingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingKind::ComplianceVoltage => "compliance_voltage",
            SettingKind::CurrentRange => "current_range",
            SettingKind::ComplianceCurrent => "compliance_current",
            SettingKind::Frequency => "frequency",
            SettingKind::TimeConstant => "time_constant",
            SettingKind::RampRate => "ramp_rate",
        };
        f.write_str(name)
    }
}

/// A sweep-wide setting with its value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSetting {
    /// What is set.
    pub kind: SettingKind,
    /// Value in the unit of `kind`.
    pub value: f64,
}

impl InstrumentSetting {
    /// Setting of `kind` to `value`.
    pub fn new(kind: SettingKind, value: f64) -> Self {
        Self { kind, value }
    }
}

impl fmt::Display for InstrumentSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.kind, self.value)
    }
}

/// The collaborator boundary every instrument driver implements.
#[async_trait]
pub trait InstrumentDriver: Send + Sync {
    /// Command the instrument output (meaning depends on the role).
    async fn set_output(&self, value: f64) -> AppResult<()>;

    /// Read the primary measurement value.
    async fn read_measurement(&self) -> AppResult<f64>;

    /// Query the instrument health.
    async fn get_status(&self) -> AppResult<InstrumentStatus>;

    /// True if [`configure`](Self::configure) can apply settings of `kind`.
    fn supports_setting(&self, _kind: SettingKind) -> bool {
        false
    }

    /// Apply a sweep-wide setting.
    async fn configure(&self, setting: InstrumentSetting) -> AppResult<()> {
        Err(DaqError::SettingUnsupported(setting.kind.to_string()))
    }
}

/// Magnet axis selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldAxis {
    /// In-plane x axis.
    X,
    /// In-plane y axis.
    Y,
    /// Out-of-plane axis.
    #[default]
    Z,
}

/// Capability role an instrument fills in the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentRole {
    /// DC/delta-mode current source.
    CurrentSource,
    /// Nanovoltmeter.
    Voltmeter,
    /// SMU channel used as DC bias voltage source.
    BiasSource,
    /// Lock-in amplifier.
    LockIn,
    /// Magnet power supply, x axis.
    MagnetX,
    /// Magnet power supply, y axis.
    MagnetY,
    /// Magnet power supply, z axis.
    MagnetZ,
    /// Temperature control loop.
    TemperatureController,
}

impl FieldAxis {
    /// The three axes in x, y, z order.
    pub const ALL: [FieldAxis; 3] = [FieldAxis::X, FieldAxis::Y, FieldAxis::Z];

    /// Position of the axis in an `[x, y, z]` vector.
    pub fn index(&self) -> usize {
        match self {
            FieldAxis::X => 0,
            FieldAxis::Y => 1,
            FieldAxis::Z => 2,
        }
    }
}

impl InstrumentRole {
    /// Magnet role for a field axis.
    pub fn magnet(axis: FieldAxis) -> Self {
        match axis {
            FieldAxis::X => InstrumentRole::MagnetX,
            FieldAxis::Y => InstrumentRole::MagnetY,
            FieldAxis::Z => InstrumentRole::MagnetZ,
        }
    }

    /// Output value of the emergency safe state, `None` if the role is left alone.
    ///
    /// Temperature loops are never touched: dropping the setpoint of a
    /// dilution unit is not a safe action.
    pub fn safe_output(&self) -> Option<f64> {
        match self {
            InstrumentRole::Voltmeter | InstrumentRole::TemperatureController => None,
            _ => Some(0.0),
        }
    }

    /// Field axis of a magnet role.
    pub fn field_axis(&self) -> Option<FieldAxis> {
        match self {
            InstrumentRole::MagnetX => Some(FieldAxis::X),
            InstrumentRole::MagnetY => Some(FieldAxis::Y),
            InstrumentRole::MagnetZ => Some(FieldAxis::Z),
            _ => None,
        }
    }

    /// Configuration key of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentRole::CurrentSource => "current_source",
            InstrumentRole::Voltmeter => "voltmeter",
            InstrumentRole::BiasSource => "bias_source",
            InstrumentRole::LockIn => "lock_in",
            InstrumentRole::MagnetX => "magnet_x",
            InstrumentRole::MagnetY => "magnet_y",
            InstrumentRole::MagnetZ => "magnet_z",
            InstrumentRole::TemperatureController => "temperature_controller",
        }
    }
}

impl fmt::Display for InstrumentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instrument models found on the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentModel {
    /// Keithley 6221 AC/DC current source.
    Keithley6221,
    /// Keithley 2182A nanovoltmeter.
    Keithley2182a,
    /// Keithley 2636B dual-channel SMU.
    Keithley2636b,
    /// Zurich Instruments MFLI lock-in amplifier.
    ZurichMfli,
    /// American Magnetics 430 magnet power supply.
    Ami430,
    /// Lakeshore 372 AC resistance bridge / temperature controller.
    Lakeshore372,
}

/// Rated maxima of an instrument class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentRating {
    /// Maximum output current (A).
    pub max_current: Option<f64>,
    /// Maximum output or compliance voltage (V).
    pub max_voltage: Option<f64>,
    /// Maximum field (T).
    pub max_field: Option<f64>,
    /// Maximum field ramp rate (T/min).
    pub max_field_ramp_rate: Option<f64>,
    /// Maximum temperature (K).
    pub max_temperature: Option<f64>,
}

impl InstrumentRating {
    const NONE: InstrumentRating = InstrumentRating {
        max_current: None,
        max_voltage: None,
        max_field: None,
        max_field_ramp_rate: None,
        max_temperature: None,
    };
}

impl InstrumentModel {
    /// Vendor rating of the model.
    pub fn rating(&self) -> InstrumentRating {
        match self {
            InstrumentModel::Keithley6221 => InstrumentRating {
                max_current: Some(0.105),
                max_voltage: Some(105.0),
                ..InstrumentRating::NONE
            },
            InstrumentModel::Keithley2182a => InstrumentRating {
                max_voltage: Some(100.0),
                ..InstrumentRating::NONE
            },
            InstrumentModel::Keithley2636b => InstrumentRating {
                max_current: Some(1.5),
                max_voltage: Some(200.0),
                ..InstrumentRating::NONE
            },
            InstrumentModel::ZurichMfli => InstrumentRating {
                max_voltage: Some(10.0),
                ..InstrumentRating::NONE
            },
            InstrumentModel::Ami430 => InstrumentRating {
                max_field: Some(9.0),
                max_field_ramp_rate: Some(1.0),
                ..InstrumentRating::NONE
            },
            InstrumentModel::Lakeshore372 => InstrumentRating {
                max_temperature: Some(400.0),
                ..InstrumentRating::NONE
            },
        }
    }

    /// Roles the model can fill.
    pub fn supports(&self, role: InstrumentRole) -> bool {
        use InstrumentRole::*;
        match self {
            InstrumentModel::Keithley6221 => role == CurrentSource,
            InstrumentModel::Keithley2182a => role == Voltmeter,
            InstrumentModel::Keithley2636b => matches!(role, BiasSource | CurrentSource),
            InstrumentModel::ZurichMfli => role == LockIn,
            InstrumentModel::Ami430 => matches!(role, MagnetX | MagnetY | MagnetZ),
            InstrumentModel::Lakeshore372 => role == TemperatureController,
        }
    }
}

impl fmt::Display for InstrumentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentModel::Keithley6221 => "Keithley 6221",
            InstrumentModel::Keithley2182a => "Keithley 2182A",
            InstrumentModel::Keithley2636b => "Keithley 2636B",
            InstrumentModel::ZurichMfli => "Zurich MFLI",
            InstrumentModel::Ami430 => "AMI 430",
            InstrumentModel::Lakeshore372 => "Lakeshore 372",
        };
        f.write_str(name)
    }
}

/// Parsed instrument address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentAddress {
    /// Raw SCPI socket, `TCPIP[n]::host::port::SOCKET`.
    Socket {
        /// Host name or IP.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Any other VISA resource string (GPIB, USB, LXI `::INSTR`).
    Visa(String),
    /// Vendor device id (e.g. `dev1234` for Zurich instruments).
    DeviceId(String),
    /// In-process simulation, `SIM` or `sim://...`.
    Simulated,
}

impl InstrumentAddress {
    /// Parses an address string from configuration.
    pub fn parse(address: &str) -> AppResult<Self> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(DaqError::Configuration(
                "instrument address cannot be empty".to_string(),
            ));
        }
        if trimmed.eq_ignore_ascii_case("sim") || trimmed.starts_with("sim://") {
            return Ok(InstrumentAddress::Simulated);
        }

        let parts: Vec<&str> = trimmed.split("::").collect();
        let is_tcpip = parts
            .first()
            .map(|p| p.to_ascii_uppercase().starts_with("TCPIP"))
            .unwrap_or(false);

        if is_tcpip && parts.len() == 4 && parts[3].eq_ignore_ascii_case("SOCKET") {
            let port = parts[2].parse::<u16>().map_err(|_| {
                DaqError::Configuration(format!(
                    "invalid socket port '{}' in address '{}'",
                    parts[2], trimmed
                ))
            })?;
            return Ok(InstrumentAddress::Socket {
                host: parts[1].to_string(),
                port,
            });
        }

        if parts.len() > 1 {
            return Ok(InstrumentAddress::Visa(trimmed.to_string()));
        }

        Ok(InstrumentAddress::DeviceId(trimmed.to_string()))
    }
}
