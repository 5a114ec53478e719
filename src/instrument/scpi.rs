//! Minimal SCPI driver.
//!
//! This is the custom fallback driver: just enough of each instrument's command
//! language to drive the three-operation boundary. Commands are templates
//! formatted with `strfmt`; `{value}` is the commanded output and `{channel}`
//! the configured channel (SMU channel letter, Lakeshore input or loop).
//!
//! Sweep-wide settings map to their own templates. A setting without a
//! template is reported as unsupported, so the runner refuses the sweep
//! instead of running with whatever the instrument had configured before.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::transport::ScpiTransport;
use super::{
    InstrumentDriver, InstrumentModel, InstrumentRole, InstrumentSetting, InstrumentStatus,
    SettingKind,
};
use crate::error::{AppResult, DaqError};

/// How to interpret the response of the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCheck {
    /// `SYST:ERR?` style: `0,"No error"` means OK.
    ErrorQueue,
    /// Integer count of queued errors, `0` means OK.
    ErrorCount,
    /// Lakeshore reading status bit field, `0` means OK.
    ReadingStatus,
}

impl StatusCheck {
    fn evaluate(&self, response: &str) -> InstrumentStatus {
        let ok = match self {
            StatusCheck::ErrorQueue => response
                .split(',')
                .next()
                .and_then(|code| code.trim().parse::<i64>().ok())
                .map(|code| code == 0)
                .unwrap_or(false),
            StatusCheck::ErrorCount | StatusCheck::ReadingStatus => response
                .trim()
                .parse::<f64>()
                .map(|v| v == 0.0)
                .unwrap_or(false),
        };
        if ok {
            InstrumentStatus::Ok
        } else {
            InstrumentStatus::Fault
        }
    }
}

/// Command templates for one model in one role.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    /// Commands sent for `set_output`, in order. Empty for read-only roles.
    pub set_output: Vec<&'static str>,
    /// Query returning the measurement.
    pub read: &'static str,
    /// Query returning the status.
    pub status: &'static str,
    /// Interpretation of the status response.
    pub status_check: StatusCheck,
    /// Commands applying each supported sweep-wide setting.
    pub settings: Vec<(SettingKind, Vec<&'static str>)>,
}

impl CommandSet {
    /// Command set for a model/role pair, `None` when the model has no SCPI
    /// interface for that role.
    pub fn for_model(model: InstrumentModel, role: InstrumentRole) -> Option<Self> {
        use InstrumentRole::*;
        let set = match (model, role) {
            (InstrumentModel::Keithley6221, CurrentSource) => CommandSet {
                set_output: vec!["SOUR:CURR {value}"],
                read: "SOUR:CURR?",
                status: "SYST:ERR?",
                status_check: StatusCheck::ErrorQueue,
                settings: vec![
                    (SettingKind::ComplianceVoltage, vec!["SOUR:CURR:COMP {value}"]),
                    (
                        SettingKind::CurrentRange,
                        vec!["SOUR:CURR:RANG:AUTO OFF", "SOUR:CURR:RANG {value}"],
                    ),
                ],
            },
            (InstrumentModel::Keithley2182a, Voltmeter) => CommandSet {
                set_output: Vec::new(),
                read: "READ?",
                status: "SYST:ERR?",
                status_check: StatusCheck::ErrorQueue,
                settings: Vec::new(),
            },
            (InstrumentModel::Keithley2636b, BiasSource) => CommandSet {
                set_output: vec!["smu{channel}.source.levelv = {value}"],
                read: "print(smu{channel}.measure.i())",
                status: "print(errorqueue.count)",
                status_check: StatusCheck::ErrorCount,
                settings: vec![(
                    SettingKind::ComplianceCurrent,
                    vec!["smu{channel}.source.limiti = {value}"],
                )],
            },
            (InstrumentModel::Keithley2636b, CurrentSource) => CommandSet {
                set_output: vec!["smu{channel}.source.leveli = {value}"],
                read: "print(smu{channel}.measure.v())",
                status: "print(errorqueue.count)",
                status_check: StatusCheck::ErrorCount,
                settings: vec![
                    (
                        SettingKind::ComplianceVoltage,
                        vec!["smu{channel}.source.limitv = {value}"],
                    ),
                    (
                        SettingKind::CurrentRange,
                        vec![
                            "smu{channel}.source.autorangei = smu{channel}.AUTORANGE_OFF",
                            "smu{channel}.source.rangei = {value}",
                        ],
                    ),
                ],
            },
            (InstrumentModel::Ami430, MagnetX | MagnetY | MagnetZ) => CommandSet {
                set_output: vec!["CONF:FIELD:TARG {value}", "RAMP"],
                read: "FIELD:MAG?",
                status: "SYST:ERR?",
                status_check: StatusCheck::ErrorQueue,
                // Tesla, per minute, one segment up to the rated field.
                settings: vec![(
                    SettingKind::RampRate,
                    vec![
                        "CONF:FIELD:UNITS 1",
                        "CONF:RAMP:RATE:UNITS 1",
                        "CONF:RAMP:RATE:SEG 1",
                        "CONF:RAMP:RATE:FIELD 1,{value},9.0",
                    ],
                )],
            },
            (InstrumentModel::Lakeshore372, TemperatureController) => CommandSet {
                set_output: vec!["SETP {channel},{value}"],
                read: "RDGK? {channel}",
                status: "RDGST? {channel}",
                status_check: StatusCheck::ReadingStatus,
                // K/min on the control loop.
                settings: vec![(SettingKind::RampRate, vec!["RAMP {channel},1,{value}"])],
            },
            _ => return None,
        };
        Some(set)
    }
}

/// Generic SCPI driver over any [`ScpiTransport`].
pub struct ScpiDriver {
    name: String,
    role: InstrumentRole,
    channel: String,
    commands: CommandSet,
    transport: Box<dyn ScpiTransport>,
}

impl ScpiDriver {
    /// Creates a driver for `model` in `role`.
    ///
    /// Fails with [`DaqError::DriverUnavailable`] when the model has no SCPI
    /// command set for the role.
    pub fn new(
        name: impl Into<String>,
        model: InstrumentModel,
        role: InstrumentRole,
        channel: Option<&str>,
        transport: Box<dyn ScpiTransport>,
    ) -> AppResult<Self> {
        let commands = CommandSet::for_model(model, role).ok_or_else(|| {
            DaqError::DriverUnavailable(format!("{} has no SCPI command set for role {}", model, role))
        })?;
        let name = name.into();
        debug!(instrument = %name, %role, transport = %transport.describe(), "SCPI driver created");
        Ok(Self {
            name,
            role,
            channel: channel.unwrap_or(default_channel(model)).to_string(),
            commands,
            transport,
        })
    }

    fn render(&self, template: &str, value: Option<f64>) -> AppResult<String> {
        let mut vars = HashMap::new();
        vars.insert("channel".to_string(), self.channel.clone());
        if let Some(value) = value {
            vars.insert("value".to_string(), format!("{:e}", value));
        }
        strfmt::strfmt(template, &vars).map_err(|e| {
            DaqError::Configuration(format!(
                "command template '{}' for '{}' is invalid: {}",
                template, self.name, e
            ))
        })
    }
}

fn default_channel(model: InstrumentModel) -> &'static str {
    match model {
        InstrumentModel::Keithley2636b => "a",
        _ => "1",
    }
}

#[async_trait]
impl InstrumentDriver for ScpiDriver {
    async fn set_output(&self, value: f64) -> AppResult<()> {
        if self.commands.set_output.is_empty() {
            return Err(DaqError::Configuration(format!(
                "'{}' is registered as {} and has no output",
                self.name, self.role
            )));
        }
        for template in &self.commands.set_output {
            let command = self.render(template, Some(value))?;
            self.transport.write(&command).await?;
        }
        Ok(())
    }

    async fn read_measurement(&self) -> AppResult<f64> {
        let query = self.render(self.commands.read, None)?;
        let response = self.transport.query(&query).await?;
        // 2182A and 6221 may append units or extra comma-separated fields.
        let first = response.split(',').next().unwrap_or_default().trim();
        let numeric = first.trim_end_matches(|c: char| c.is_ascii_alphabetic());
        numeric.parse::<f64>().map_err(|_| {
            DaqError::communication(
                &self.name,
                format!("unparseable response '{}' to '{}'", response, query),
            )
        })
    }

    async fn get_status(&self) -> AppResult<InstrumentStatus> {
        let query = self.render(self.commands.status, None)?;
        let response = self.transport.query(&query).await?;
        let status = self.commands.status_check.evaluate(&response);
        if status == InstrumentStatus::Fault {
            warn!(instrument = %self.name, %response, "status query reports fault");
        }
        Ok(status)
    }

    fn supports_setting(&self, kind: SettingKind) -> bool {
        self.commands.settings.iter().any(|(k, _)| *k == kind)
    }

    async fn configure(&self, setting: InstrumentSetting) -> AppResult<()> {
        let templates = self
            .commands
            .settings
            .iter()
            .find(|(kind, _)| *kind == setting.kind)
            .map(|(_, templates)| templates)
            .ok_or_else(|| {
                DaqError::SettingUnsupported(format!("'{}' cannot apply {}", self.name, setting.kind))
            })?;
        for template in templates {
            let command = self.render(template, Some(setting.value))?;
            self.transport.write(&command).await?;
        }
        debug!(instrument = %self.name, %setting, "setting applied");
        Ok(())
    }
}
