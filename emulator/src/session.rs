use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant as HostInstant};

use log::info;

use node_core::channel::CommandLink;
use node_core::orchestrator::{CycleOutcome, RestartReason, WakeCycleOrchestrator, WakeReason};
use node_core::retained::RetainedCell;
use node_core::version::FirmwareVersion;

use crate::sim::{self, HostPlatform, SimClock, World};

const MAX_CYCLES_PER_COMMAND: u32 = 48;

pub const EMULATOR_HELP: &[(&str, &str)] = &[
    ("wake [count]", "run one or more wake cycles"),
    ("inject <topic> [payload]", "publish a retained command; empty clears it"),
    ("retained", "list retained messages held by the broker"),
    ("wifi up|down", "toggle network reachability"),
    ("broker up|down", "toggle broker reachability"),
    ("fetch ok|fail", "choose the outcome of image downloads"),
    ("push ok|timeout", "choose whether a pushed image arrives"),
    ("volts <value>", "set the simulated battery voltage"),
    ("powerloss", "drop power: lose retained state and reload from disk"),
    ("journal", "events from the last cycle"),
    ("store", "committed contents of both durable stores"),
    ("exit", "close the session (also `quit` or end of input)"),
];

/// Startup parameters taken from the command line.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub state_dir: PathBuf,
    pub transcript: Option<PathBuf>,
    pub firmware: FirmwareVersion,
}

/// Output of one session command.
#[derive(Debug, Default)]
pub struct Reply {
    pub lines: Vec<String>,
    /// The host asked to end the session.
    pub close: bool,
}

/// Interactive simulated device.
pub struct Session {
    node: WakeCycleOrchestrator<HostPlatform>,
    world: World,
    clock: SimClock,
    retained: RetainedCell,
    next_wake: WakeReason,
    state_dir: PathBuf,
    firmware: FirmwareVersion,
    transcript: Option<TranscriptLogger>,
    started_at: HostInstant,
    cycles: u32,
}

impl Session {
    pub fn new(options: SessionOptions) -> io::Result<Self> {
        let transcript = options
            .transcript
            .as_deref()
            .map(TranscriptLogger::new)
            .transpose()?;
        let world = World::default();
        let clock = SimClock::default();
        let node = sim::boot(&options.state_dir, &world, &clock, options.firmware)?;

        Ok(Self {
            node,
            world,
            clock,
            retained: RetainedCell::new(),
            next_wake: WakeReason::ColdBoot,
            state_dir: options.state_dir,
            firmware: options.firmware,
            transcript,
            started_at: HostInstant::now(),
            cycles: 0,
        })
    }

    #[must_use]
    pub fn banner(&self) -> String {
        format!(
            "Battery node emulator: firmware {}, state in {}. Type `help` for commands or `exit` to quit.",
            self.firmware,
            self.state_dir.display()
        )
    }

    /// Prompt showing the running firmware and the retained boot count.
    #[must_use]
    pub fn prompt(&self) -> String {
        let wake = self.retained.load();
        format!("node {} #{}> ", self.firmware, wake.boot_count)
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Reply> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Reply::default());
        }

        let elapsed = self.started_at.elapsed();
        self.record(elapsed, TranscriptRole::Host, trimmed)?;

        let (word, rest) = trimmed
            .split_once(char::is_whitespace)
            .map_or((trimmed, ""), |(word, rest)| (word, rest.trim()));
        let mut close = false;
        let lines = match word.to_ascii_lowercase().as_str() {
            "exit" | "quit" if rest.is_empty() => {
                close = true;
                vec![format!(
                    "Session closed after {} cycle(s); state kept in {}",
                    self.cycles,
                    self.state_dir.display()
                )]
            }
            "wake" => self.handle_wake(rest)?,
            "inject" => self.handle_inject(rest),
            "retained" => self.list_retained(),
            "wifi" => self.toggle(rest, "up", "down", |world, on| world.network_up = on),
            "broker" => self.toggle(rest, "up", "down", |world, on| world.broker_up = on),
            "fetch" => self.toggle(rest, "ok", "fail", |world, on| world.fetch_ok = on),
            "push" => self.toggle(rest, "ok", "timeout", |world, on| world.push_ok = on),
            "volts" => self.set_voltage(rest),
            "powerloss" => self.power_loss()?,
            "journal" => self.journal_lines(),
            "store" => self.store_lines(),
            "help" if rest.is_empty() => {
                let mut lines = self.console(trimmed)?;
                lines.push("emulator:".to_owned());
                lines.extend(
                    EMULATOR_HELP
                        .iter()
                        .map(|(usage, summary)| format!("  {usage:<34}{summary}")),
                );
                lines
            }
            _ => self.console(trimmed)?,
        };

        for line in &lines {
            self.record(elapsed, TranscriptRole::Emulator, line)?;
        }
        Ok(Reply { lines, close })
    }

    fn handle_wake(&mut self, rest: &str) -> io::Result<Vec<String>> {
        let count = if rest.is_empty() {
            1
        } else {
            match rest.parse::<u32>() {
                Ok(count) if (1..=MAX_CYCLES_PER_COMMAND).contains(&count) => count,
                _ => {
                    return Ok(vec![format!(
                        "ERR wake count must be 1..={MAX_CYCLES_PER_COMMAND}"
                    )]);
                }
            }
        };

        let mut lines = Vec::new();
        for _ in 0..count {
            let reason = self.next_wake;
            let mut wake = self.retained.load();
            let outcome = self.node.run_cycle(&mut wake, reason);
            self.retained.store(&wake);
            self.cycles += 1;

            let mut summary = format!(
                "cycle {} boot={} ->",
                wake_label(reason),
                wake.boot_count
            );
            for event in self.node.journal().events().skip(1) {
                let _ = write!(summary, " {event}");
            }
            lines.push(summary);

            match outcome {
                CycleOutcome::Suspend { wake_after } => {
                    lines.push(format!("suspend {}s", wake_after.as_secs()));
                    self.clock.advance(wake_after);
                    self.next_wake = WakeReason::Timer;
                }
                CycleOutcome::StayAwake { delay } => {
                    lines.push(format!("stay awake; next tick in {}s", delay.as_secs()));
                    self.clock.advance(delay);
                    self.next_wake = WakeReason::AwakeTick;
                }
                CycleOutcome::Restart(reason) => {
                    lines.push(self.restart(reason)?);
                    break;
                }
            }
        }
        Ok(lines)
    }

    fn handle_inject(&self, rest: &str) -> Vec<String> {
        let (suffix, payload) = rest
            .split_once(char::is_whitespace)
            .map_or((rest, ""), |(suffix, payload)| (suffix, payload.trim()));
        if suffix.is_empty() {
            return vec!["ERR usage: inject <topic> [payload]".to_owned()];
        }

        let topic = format!("{}/{suffix}", self.node.channel().topics().base());
        let mut world = self.world.borrow_mut();
        if payload.is_empty() {
            world.retained.remove(&topic);
            vec![format!("cleared {topic}")]
        } else {
            world.retained.insert(topic.clone(), payload.as_bytes().to_vec());
            vec![format!("retained {topic} <- {payload}")]
        }
    }

    fn list_retained(&self) -> Vec<String> {
        let world = self.world.borrow();
        if world.retained.is_empty() {
            return vec!["no retained messages".to_owned()];
        }
        world
            .retained
            .iter()
            .map(|(topic, payload)| format!("{topic} = {}", String::from_utf8_lossy(payload)))
            .collect()
    }

    fn toggle<F>(&self, rest: &str, on: &str, off: &str, apply: F) -> Vec<String>
    where
        F: FnOnce(&mut sim::SimWorld, bool),
    {
        let enabled = if rest.eq_ignore_ascii_case(on) {
            true
        } else if rest.eq_ignore_ascii_case(off) {
            false
        } else {
            return vec![format!("ERR expected `{on}` or `{off}`")];
        };
        apply(&mut self.world.borrow_mut(), enabled);
        vec![format!("ok ({})", if enabled { on } else { off })]
    }

    fn set_voltage(&self, rest: &str) -> Vec<String> {
        match rest.parse::<f32>() {
            Ok(volts) if volts.is_finite() && volts >= 0.0 => {
                self.world.borrow_mut().voltage = volts;
                vec![format!("battery now {volts:.2}V")]
            }
            _ => vec!["ERR expected a voltage, e.g. `volts 12.4`".to_owned()],
        }
    }

    fn power_loss(&mut self) -> io::Result<Vec<String>> {
        self.retained.invalidate();
        self.node = sim::boot(&self.state_dir, &self.world, &self.clock, self.firmware)?;
        self.next_wake = WakeReason::ColdBoot;
        Ok(vec!["power lost; retained state cleared".to_owned()])
    }

    fn journal_lines(&self) -> Vec<String> {
        let lines: Vec<String> = self
            .node
            .journal()
            .oldest_first()
            .map(|record| {
                format!(
                    "#{:<3} +{:>8} ms  {}",
                    record.id,
                    record.timestamp.as_millis(),
                    record.event
                )
            })
            .collect();
        if lines.is_empty() {
            vec!["no cycle has run yet".to_owned()]
        } else {
            lines
        }
    }

    fn store_lines(&self) -> Vec<String> {
        let config = self.node.config().store();
        let trigger = self.node.updates().trigger().store();
        let mut lines = Vec::new();
        for store in [config, trigger] {
            lines.push(format!("{}:", store.path().display()));
            lines.extend(
                store
                    .entries()
                    .map(|(key, value)| format!("  {key} = {value:?}")),
            );
        }
        lines
    }

    fn console(&mut self, line: &str) -> io::Result<Vec<String>> {
        let wake = self.retained.load();
        let mut response = String::new();
        let restart = self
            .node
            .console(&wake)
            .respond(line, &mut response)
            .map_err(io::Error::other)?;

        let mut lines: Vec<String> = response.lines().map(str::to_owned).collect();
        if let Some(reason) = restart {
            lines.push(self.restart(reason)?);
        }
        Ok(lines)
    }

    /// Reloads the node from disk. A newly written image named `v<version>/...`
    /// becomes the running firmware.
    fn restart(&mut self, reason: RestartReason) -> io::Result<String> {
        if reason == RestartReason::UpdateApplied
            && let Some(version) = self.world.borrow().fetched.last().and_then(|url| image_version(url))
        {
            self.firmware = version;
        }
        info!("restarting node ({reason:?})");
        self.node = sim::boot(&self.state_dir, &self.world, &self.clock, self.firmware)?;
        self.next_wake = WakeReason::ColdBoot;
        Ok(format!("restarted ({}) firmware={}", restart_label(reason), self.firmware))
    }

    fn record(&mut self, elapsed: Duration, role: TranscriptRole, line: &str) -> io::Result<()> {
        match self.transcript.as_mut() {
            Some(transcript) => transcript.append_line(elapsed, role, line),
            None => Ok(()),
        }
    }
}

fn image_version(url: &str) -> Option<FirmwareVersion> {
    url.split('/')
        .filter(|segment| segment.starts_with(['v', 'V']))
        .find_map(|segment| FirmwareVersion::parse(segment).ok())
}

fn wake_label(reason: WakeReason) -> &'static str {
    match reason {
        WakeReason::ColdBoot => "cold-boot",
        WakeReason::Timer => "timer",
        WakeReason::AwakeTick => "awake-tick",
    }
}

fn restart_label(reason: RestartReason) -> &'static str {
    match reason {
        RestartReason::UpdateApplied => "update applied",
        RestartReason::ConfigReset => "configuration reset",
        RestartReason::Requested => "requested",
    }
}

struct TranscriptLogger {
    writer: BufWriter<fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        logger.write_header()?;
        Ok(logger)
    }

    fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.writer, "# Battery node emulator transcript")?;
        writeln!(
            self.writer,
            "# Timestamps are milliseconds since session start"
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

#[derive(Clone, Copy)]
enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}
