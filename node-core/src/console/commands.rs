//! Console command executor.
//!
//! Turns parsed [`Command`]s into configuration changes and typed outcomes.
//! Front-ends render outcomes with [`status::write_outcome`] and carry out
//! any restart request themselves.

use core::fmt::{self, Write};

use heapless::String;
use log::info;

use super::catalog::{self, CommandSpec};
use super::grammar::{self, Command, OtaTarget, ParseError};
use super::status::{self, NodeStatus};
use crate::config::{ConfigStore, DeviceConfig, SettingError, SettingKey};
use crate::orchestrator::RestartReason;
use crate::storage::{KeyValueStore, StoreError};
use crate::version::FirmwareVersion;

/// Command execution successes.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsoleOutcome {
    Config,
    SettingChanged(SettingKey),
    Saved,
    LowPower {
        enabled: bool,
    },
    UpdateTarget {
        target: Option<FirmwareVersion>,
        changed: bool,
    },
    Status(NodeStatus),
    Help(Option<&'static CommandSpec>),
    /// The platform must restart the node.
    Restart(RestartReason),
}

/// Errors surfaced while executing a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleError<'a> {
    Parse(ParseError<'a>),
    Setting(SettingError),
    Storage(StoreError),
    UnknownTopic(&'a str),
}

impl<'a> From<ParseError<'a>> for ConsoleError<'a> {
    fn from(error: ParseError<'a>) -> Self {
        Self::Parse(error)
    }
}

impl From<SettingError> for ConsoleError<'_> {
    fn from(error: SettingError) -> Self {
        Self::Setting(error)
    }
}

impl From<StoreError> for ConsoleError<'_> {
    fn from(error: StoreError) -> Self {
        Self::Storage(error)
    }
}

impl fmt::Display for ConsoleError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleError::Parse(err) => err.fmt(f),
            ConsoleError::Setting(err) => err.fmt(f),
            ConsoleError::Storage(err) => write!(f, "storage: {err}"),
            ConsoleError::UnknownTopic(topic) => write!(f, "no help for `{topic}`"),
        }
    }
}

/// Applies console commands to the node configuration.
pub struct ConsoleExecutor<'a, S> {
    config: &'a mut ConfigStore<S>,
    status: NodeStatus,
}

impl<'a, S> ConsoleExecutor<'a, S> {
    pub fn new(config: &'a mut ConfigStore<S>, status: NodeStatus) -> Self {
        Self { config, status }
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        self.config.config()
    }
}

impl<S> ConsoleExecutor<'_, S>
where
    S: KeyValueStore,
{
    /// Parses and runs one line.
    pub fn execute<'l>(&mut self, line: &'l str) -> Result<ConsoleOutcome, ConsoleError<'l>> {
        let command = grammar::parse(line)?;
        self.run(command)
    }

    /// Runs one line and writes the response or error text to `writer`.
    ///
    /// Returns the restart the platform must perform, if any.
    pub fn respond<W: Write>(
        &mut self,
        line: &str,
        writer: &mut W,
    ) -> Result<Option<RestartReason>, fmt::Error> {
        match self.execute(line) {
            Ok(outcome) => {
                status::write_outcome(writer, &outcome, self.config.config())?;
                Ok(match outcome {
                    ConsoleOutcome::Restart(reason) => Some(reason),
                    _ => None,
                })
            }
            Err(err) => {
                write!(writer, "error: {err}")?;
                Ok(None)
            }
        }
    }

    fn run<'l>(&mut self, command: Command<'l>) -> Result<ConsoleOutcome, ConsoleError<'l>> {
        match command {
            Command::Show => Ok(ConsoleOutcome::Config),
            Command::Set { key, value } => {
                self.config.set(key, value)?;
                info!("console set {key}");
                Ok(ConsoleOutcome::SettingChanged(key))
            }
            Command::Save => {
                self.config.save()?;
                Ok(ConsoleOutcome::Saved)
            }
            Command::Reset => {
                self.config.clear()?;
                Ok(ConsoleOutcome::Restart(RestartReason::ConfigReset))
            }
            Command::NoSleep => self.set_low_power(false),
            Command::Sleep => self.set_low_power(true),
            Command::Reboot => Ok(ConsoleOutcome::Restart(RestartReason::Requested)),
            Command::OtaVersion(None) => Ok(ConsoleOutcome::UpdateTarget {
                target: self.current_target(),
                changed: false,
            }),
            Command::OtaVersion(Some(target)) => self.set_update_target(target),
            Command::Status => {
                let config = self.config.config();
                self.status.low_power_enabled = config.low_power_enabled;
                self.status.chemistry = config.chemistry;
                Ok(ConsoleOutcome::Status(self.status.clone()))
            }
            Command::Help { topic: None } => Ok(ConsoleOutcome::Help(None)),
            Command::Help { topic: Some(topic) } => catalog::find(topic)
                .map(|spec| ConsoleOutcome::Help(Some(spec)))
                .ok_or(ConsoleError::UnknownTopic(topic)),
        }
    }

    fn set_low_power<'l>(&mut self, enabled: bool) -> Result<ConsoleOutcome, ConsoleError<'l>> {
        let previous = self.config.config().low_power_enabled;
        self.config.config_mut().low_power_enabled = enabled;
        if let Err(err) = self.config.save_key(SettingKey::LowPower) {
            self.config.config_mut().low_power_enabled = previous;
            return Err(err.into());
        }
        info!("low-power suspend {}", if enabled { "enabled" } else { "disabled" });
        Ok(ConsoleOutcome::LowPower { enabled })
    }

    fn set_update_target<'l>(
        &mut self,
        target: OtaTarget,
    ) -> Result<ConsoleOutcome, ConsoleError<'l>> {
        let previous = self.config.config().update_target_version.clone();
        let mut rendered: String<16> = String::new();
        let version = match target {
            OtaTarget::Set(version) => {
                write!(rendered, "{version}").map_err(|_| SettingError::InvalidVersion)?;
                Some(version)
            }
            OtaTarget::Clear => None,
        };

        self.config.config_mut().set_update_target(&rendered)?;
        if let Err(err) = self.config.save_key(SettingKey::UpdateTarget) {
            self.config.config_mut().update_target_version = previous;
            return Err(err.into());
        }
        Ok(ConsoleOutcome::UpdateTarget {
            target: version,
            changed: true,
        })
    }

    fn current_target(&self) -> Option<FirmwareVersion> {
        FirmwareVersion::parse(&self.config.config().update_target_version).ok()
    }
}
