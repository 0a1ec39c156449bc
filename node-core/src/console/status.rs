//! Text rendering for console responses.
//!
//! [`StatusFormatter`] and [`ConfigView`] keep the wording identical across
//! the firmware serial console and the emulator.

use core::fmt;

use super::catalog::{self, CommandSpec};
use super::commands::ConsoleOutcome;
use crate::config::{DeviceConfig, SettingKey};
use crate::orchestrator::RestartReason;
use crate::telemetry::{BatteryStatus, Chemistry};
use crate::trigger::TriggerRecord;
use crate::update::UpdateState;
use crate::version::FirmwareVersion;

const MASK: &str = "********";

/// Snapshot of node state surfaced by the `status` command.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeStatus {
    pub firmware: FirmwareVersion,
    pub boot_count: u32,
    pub last_voltage: Option<f32>,
    pub chemistry: Chemistry,
    pub low_power_enabled: bool,
    pub trigger: TriggerRecord,
    pub update_state: UpdateState,
}

/// Renders a [`NodeStatus`] into human-readable lines.
#[derive(Clone, Copy, Debug)]
pub struct StatusFormatter<'a> {
    status: &'a NodeStatus,
}

impl<'a> StatusFormatter<'a> {
    #[must_use]
    pub const fn new(status: &'a NodeStatus) -> Self {
        Self { status }
    }

    /// Writes e.g. `node firmware=1.2.0 boots=14 low-power=on`.
    pub fn write_node_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(
            writer,
            "node firmware={} boots={} low-power={}",
            self.status.firmware,
            self.status.boot_count,
            if self.status.low_power_enabled { "on" } else { "off" }
        )
    }

    /// Writes e.g. `battery 12.61V status=good chemistry=Lead-Acid`.
    pub fn write_battery_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        writer.write_str("battery ")?;
        match self.status.last_voltage {
            Some(voltage) => write!(
                writer,
                "{voltage:.2}V status={}",
                BatteryStatus::classify(voltage, self.status.chemistry)
            )?,
            None => writer.write_str("n/a")?,
        }
        write!(writer, " chemistry={}", self.status.chemistry)
    }

    /// Writes e.g. `update state=idle trigger=armed file=v1.3.0/firmware-agm.bin`.
    pub fn write_update_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        writer.write_str("update state=")?;
        writer.write_str(match self.status.update_state {
            UpdateState::Idle => "idle",
            UpdateState::ArmedPending => "armed",
            UpdateState::Attempting => "attempting",
            UpdateState::Applied => "applied",
            UpdateState::FailedBackToIdle => "failed",
        })?;

        let trigger = &self.status.trigger;
        if !trigger.pending {
            return writer.write_str(" trigger=clear");
        }
        if trigger.filename.is_empty() {
            writer.write_str(" trigger=armed mode=push")
        } else {
            write!(writer, " trigger=armed file={}", trigger.filename)
        }
    }
}

/// Configuration listing with secrets masked.
#[derive(Clone, Copy, Debug)]
pub struct ConfigView<'a> {
    config: &'a DeviceConfig,
}

impl<'a> ConfigView<'a> {
    #[must_use]
    pub const fn new(config: &'a DeviceConfig) -> Self {
        Self { config }
    }

    /// Writes one `name = value` line for `key`.
    pub fn write_setting<W: fmt::Write>(&self, key: SettingKey, writer: &mut W) -> fmt::Result {
        write!(writer, "{:<16}= ", key.name())?;
        match key {
            SettingKey::LowPower => writer.write_str(if self.config.low_power_enabled {
                "on"
            } else {
                "off"
            }),
            SettingKey::Chemistry => writer.write_str(self.config.chemistry.display_name()),
            _ => {
                let mut probe = EmptyProbe::default();
                self.config.write_value(key, &mut probe)?;
                if probe.empty {
                    writer.write_str("(unset)")
                } else if key.is_secret() {
                    writer.write_str(MASK)
                } else {
                    self.config.write_value(key, writer)
                }
            }
        }
    }
}

impl fmt::Display for ConfigView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, key) in SettingKey::ALL.into_iter().enumerate() {
            if index > 0 {
                f.write_str("\n")?;
            }
            self.write_setting(key, f)?;
        }
        Ok(())
    }
}

struct EmptyProbe {
    empty: bool,
}

impl Default for EmptyProbe {
    fn default() -> Self {
        Self { empty: true }
    }
}

impl fmt::Write for EmptyProbe {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.empty &= s.is_empty();
        Ok(())
    }
}

/// Writes the command list, or usage for a single command.
pub fn write_help<W: fmt::Write>(writer: &mut W, topic: Option<&CommandSpec>) -> fmt::Result {
    let Some(spec) = topic else {
        writer.write_str("commands:")?;
        for spec in catalog::commands() {
            write!(writer, "\n  {:<34}{}", spec.usage, spec.summary)?;
        }
        return Ok(());
    };

    write!(writer, "{}\n  {}", spec.usage, spec.summary)?;
    if !spec.aliases.is_empty() {
        writer.write_str("\n  aliases:")?;
        for alias in spec.aliases {
            write!(writer, " {alias}")?;
        }
    }
    if spec.tag == catalog::CommandTag::Set {
        writer.write_str("\n  keys:")?;
        for key in SettingKey::ALL {
            write!(writer, " {}", key.name())?;
        }
    }
    Ok(())
}

/// Renders the response for a completed console command.
pub fn write_outcome<W: fmt::Write>(
    writer: &mut W,
    outcome: &ConsoleOutcome,
    config: &DeviceConfig,
) -> fmt::Result {
    match outcome {
        ConsoleOutcome::Config => write!(writer, "{}", ConfigView::new(config)),
        ConsoleOutcome::SettingChanged(key) => write!(
            writer,
            "{} updated; run `save` to persist",
            key.name()
        ),
        ConsoleOutcome::Saved => writer.write_str("configuration saved"),
        ConsoleOutcome::LowPower { enabled: true } => {
            writer.write_str("low-power suspend enabled and saved")
        }
        ConsoleOutcome::LowPower { enabled: false } => {
            writer.write_str("low-power suspend disabled and saved")
        }
        ConsoleOutcome::UpdateTarget { target: None, .. } => {
            writer.write_str("automatic update target: (unset)")
        }
        ConsoleOutcome::UpdateTarget {
            target: Some(version),
            changed,
        } => write!(
            writer,
            "automatic update target: {version}{}",
            if *changed { " (saved)" } else { "" }
        ),
        ConsoleOutcome::Status(status) => {
            let formatter = StatusFormatter::new(status);
            formatter.write_node_line(writer)?;
            writer.write_char('\n')?;
            formatter.write_battery_line(writer)?;
            writer.write_char('\n')?;
            formatter.write_update_line(writer)
        }
        ConsoleOutcome::Help(topic) => write_help(writer, *topic),
        ConsoleOutcome::Restart(RestartReason::ConfigReset) => {
            writer.write_str("configuration erased; restarting")
        }
        ConsoleOutcome::Restart(_) => writer.write_str("restarting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::String;

    fn status() -> NodeStatus {
        NodeStatus {
            firmware: FirmwareVersion::new(1, 2, 0),
            boot_count: 14,
            last_voltage: Some(12.61),
            chemistry: Chemistry::LeadAcid,
            low_power_enabled: true,
            trigger: TriggerRecord::idle(),
            update_state: UpdateState::Idle,
        }
    }

    #[test]
    fn formats_status_lines() {
        let status = status();
        let formatter = StatusFormatter::new(&status);
        let mut line: String<96> = String::new();
        formatter.write_node_line(&mut line).expect("fits");
        assert_eq!(line.as_str(), "node firmware=1.2.0 boots=14 low-power=on");

        line.clear();
        formatter.write_battery_line(&mut line).expect("fits");
        assert!(line.starts_with("battery 12.61V status="));

        line.clear();
        formatter.write_update_line(&mut line).expect("fits");
        assert_eq!(line.as_str(), "update state=idle trigger=clear");
    }

    #[test]
    fn pending_push_trigger_is_described() {
        let mut status = status();
        status.trigger.pending = true;
        status.update_state = UpdateState::ArmedPending;
        let mut line: String<96> = String::new();
        StatusFormatter::new(&status)
            .write_update_line(&mut line)
            .expect("fits");
        assert_eq!(line.as_str(), "update state=armed trigger=armed mode=push");
    }

    #[test]
    fn secrets_are_masked_and_empty_values_marked() {
        let mut config = DeviceConfig::default();
        config
            .set(SettingKey::WifiPassword, "hunter2")
            .expect("valid");
        let view = ConfigView::new(&config);

        let mut line: String<64> = String::new();
        view.write_setting(SettingKey::WifiPassword, &mut line)
            .expect("fits");
        assert!(line.ends_with(MASK));
        assert!(!line.contains("hunter2"));

        line.clear();
        view.write_setting(SettingKey::BrokerPassword, &mut line)
            .expect("fits");
        assert!(line.ends_with("(unset)"));

        line.clear();
        view.write_setting(SettingKey::ClientId, &mut line)
            .expect("fits");
        assert!(line.ends_with("battery-monitor"));
    }

    #[test]
    fn help_lists_every_command() {
        let mut text: String<2048> = String::new();
        write_help(&mut text, None).expect("fits");
        for spec in catalog::commands() {
            assert!(text.contains(spec.usage));
        }
    }
}
