//! Wake-cycle orchestration shared between firmware and host targets.
//!
//! A cycle runs from wake to the next suspend decision: sample the battery,
//! resume or check for updates, publish, listen for commands, and finally
//! report a [`CycleOutcome`] that the platform carries out. The platform owns
//! the retained region and threads a [`WakeState`] through every call.

use core::ops::ControlFlow;
use core::time::Duration;

use log::{debug, info, warn};

use crate::channel::{BrokerSession, CommandChannel, NetworkLink, TopicSet};
use crate::clock::Clock;
use crate::config::{ConfigStore, DeviceConfig, LoadSource};
use crate::console::{ConsoleExecutor, NodeStatus};
use crate::dispatch::{Action, CommandDispatcher, DispatchOutcome, ResetHandler};
use crate::journal::{CycleEvent, CycleJournal};
use crate::retained::WakeState;
use crate::storage::KeyValueStore;
use crate::telemetry::{Reading, SensorSource};
use crate::trigger::PersistentTrigger;
use crate::update::{
    FirmwareFetcher, PushUpdateService, UpdateContext, UpdateCoordinator, UpdateOutcome,
    UpdateRequest, UpdateTimings,
};
use crate::version::FirmwareVersion;

pub const DEFAULT_COMMAND_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_SUSPEND_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_STAY_AWAKE_DELAY: Duration = Duration::from_secs(10);

/// Concrete collaborators supplied by a target.
pub trait Platform {
    type ConfigStorage: KeyValueStore;
    /// Kept separate from configuration so a reset never clears a pending update.
    type TriggerStorage: KeyValueStore;
    type Network: NetworkLink;
    type Broker: BrokerSession;
    type Sensor: SensorSource;
    type Fetcher: FirmwareFetcher;
    type Push: PushUpdateService;
    type Clock: Clock;
    type Reset: ResetHandler<Self::ConfigStorage>;
}

/// Instances handed to [`WakeCycleOrchestrator::new`].
pub struct PlatformParts<P: Platform> {
    pub config_storage: P::ConfigStorage,
    pub trigger_storage: P::TriggerStorage,
    pub network: P::Network,
    pub broker: P::Broker,
    pub sensor: P::Sensor,
    pub fetcher: P::Fetcher,
    pub push: P::Push,
    pub clock: P::Clock,
    pub reset: P::Reset,
}

/// Tunable windows for one cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleTimings {
    /// How long inbound commands are serviced after publishing.
    pub command_window: Duration,
    /// Low-power suspend duration.
    pub suspend_interval: Duration,
    /// Delay between cycles when low power is disabled.
    pub stay_awake_delay: Duration,
}

impl Default for CycleTimings {
    fn default() -> Self {
        Self {
            command_window: DEFAULT_COMMAND_WINDOW,
            suspend_interval: DEFAULT_SUSPEND_INTERVAL,
            stay_awake_delay: DEFAULT_STAY_AWAKE_DELAY,
        }
    }
}

/// Why a cycle is starting.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WakeReason {
    /// Power-on or restart; the retained region is fresh.
    ColdBoot,
    /// Resumed from low-power suspend.
    Timer,
    /// Next iteration while staying awake. Does not count as a boot.
    AwakeTick,
}

/// Why the platform must restart.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RestartReason {
    UpdateApplied,
    ConfigReset,
    /// Requested from the local console.
    Requested,
}

/// What the platform does once a cycle finishes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CycleOutcome {
    Suspend { wake_after: Duration },
    StayAwake { delay: Duration },
    Restart(RestartReason),
}

/// Drives wake cycles against a [`Platform`].
pub struct WakeCycleOrchestrator<P: Platform> {
    config: ConfigStore<P::ConfigStorage>,
    updates: UpdateCoordinator<P::TriggerStorage>,
    channel: CommandChannel<P::Network, P::Broker>,
    sensor: P::Sensor,
    fetcher: P::Fetcher,
    push: P::Push,
    clock: P::Clock,
    reset: P::Reset,
    journal: CycleJournal<<P::Clock as Clock>::Instant>,
    timings: CycleTimings,
    defaults: DeviceConfig,
    firmware: FirmwareVersion,
    last_reading: Option<Reading>,
}

impl<P: Platform> WakeCycleOrchestrator<P> {
    pub fn new(parts: PlatformParts<P>, firmware: FirmwareVersion) -> Self {
        Self {
            config: ConfigStore::new(parts.config_storage),
            updates: UpdateCoordinator::new(PersistentTrigger::new(parts.trigger_storage)),
            channel: CommandChannel::new(parts.network, parts.broker, TopicSet::default()),
            sensor: parts.sensor,
            fetcher: parts.fetcher,
            push: parts.push,
            clock: parts.clock,
            reset: parts.reset,
            journal: CycleJournal::new(),
            timings: CycleTimings::default(),
            defaults: DeviceConfig::default(),
            firmware,
            last_reading: None,
        }
    }

    #[must_use]
    pub fn with_timings(mut self, timings: CycleTimings, update_timings: UpdateTimings) -> Self {
        self.timings = timings;
        self.updates = self.updates.with_timings(update_timings);
        self
    }

    /// Compiled-in configuration used on first boot and after a reset.
    #[must_use]
    pub fn with_defaults(mut self, defaults: DeviceConfig) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub fn with_topics(mut self, topics: TopicSet) -> Self {
        self.channel.set_topics(topics);
        self
    }

    /// Loads configuration from storage. Runs automatically on non-tick wakes.
    pub fn load_config(&mut self) -> LoadSource {
        let source = self.config.load(self.defaults.clone());
        debug!("configuration loaded: {source:?}");
        source
    }

    pub fn config(&self) -> &ConfigStore<P::ConfigStorage> {
        &self.config
    }

    pub fn updates(&self) -> &UpdateCoordinator<P::TriggerStorage> {
        &self.updates
    }

    pub fn channel(&self) -> &CommandChannel<P::Network, P::Broker> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut CommandChannel<P::Network, P::Broker> {
        &mut self.channel
    }

    pub fn clock(&self) -> &P::Clock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut P::Clock {
        &mut self.clock
    }

    /// Events recorded by the most recent cycle.
    pub fn journal(&self) -> &CycleJournal<<P::Clock as Clock>::Instant> {
        &self.journal
    }

    #[must_use]
    pub fn firmware(&self) -> FirmwareVersion {
        self.firmware
    }

    #[must_use]
    pub fn last_reading(&self) -> Option<&Reading> {
        self.last_reading.as_ref()
    }

    /// Snapshot for status displays.
    #[must_use]
    pub fn status(&self, wake: &WakeState) -> NodeStatus {
        NodeStatus {
            firmware: self.firmware,
            boot_count: wake.boot_count,
            last_voltage: wake.last_reading,
            chemistry: self.config.config().chemistry,
            low_power_enabled: self.config.config().low_power_enabled,
            trigger: self.updates.trigger().peek(),
            update_state: self.updates.state(),
        }
    }

    /// Local command session over the current configuration.
    pub fn console(&mut self, wake: &WakeState) -> ConsoleExecutor<'_, P::ConfigStorage> {
        let status = self.status(wake);
        ConsoleExecutor::new(&mut self.config, status)
    }

    /// Runs one wake cycle and reports what the platform should do next.
    pub fn run_cycle(&mut self, wake: &mut WakeState, reason: WakeReason) -> CycleOutcome {
        self.journal.clear();
        if reason != WakeReason::AwakeTick {
            wake.boot_count = wake.boot_count.wrapping_add(1);
            self.load_config();
        }
        info!("wake ({reason:?}), boot #{}", wake.boot_count);
        self.record(CycleEvent::WakeStarted {
            boot_count: wake.boot_count,
        });

        self.take_reading(wake);

        // At most one update attempt per cycle.
        let attempted = if let Some(request) = self.updates.check_pending_from_boot() {
            self.record(CycleEvent::PendingUpdateFound);
            if !self.bring_up_network() {
                self.updates.defer(&request);
                return self.finish();
            }
            if self.attempt(&request) == UpdateOutcome::Applied {
                return self.restart(RestartReason::UpdateApplied);
            }
            true
        } else if self.bring_up_network() {
            self.check_automatic_update();
            false
        } else {
            return self.finish();
        };

        if self.channel.connect_broker(self.config.config()) {
            self.record(CycleEvent::BrokerUp);
            self.publish(wake.boot_count);
            if self.service_commands() {
                return self.restart(RestartReason::ConfigReset);
            }
        } else {
            self.record(CycleEvent::BrokerUnavailable);
        }

        if let Some(request) = self.updates.take_armed() {
            if attempted {
                info!(
                    "update {:?} stays armed until the next cycle",
                    request.filename.as_str()
                );
                self.updates.defer(&request);
            } else {
                self.channel.disconnect_broker();
                if self.attempt(&request) == UpdateOutcome::Applied {
                    return self.restart(RestartReason::UpdateApplied);
                }
            }
        }

        self.finish()
    }

    fn check_automatic_update(&mut self) {
        let firmware = self.firmware;
        match self
            .updates
            .check_for_automatic_update(self.config.config(), firmware)
        {
            Ok(true) => self.record(CycleEvent::TriggerArmed),
            Ok(false) => {}
            Err(err) => warn!("automatic update not armed: {err}"),
        }
    }

    fn record(&mut self, event: CycleEvent) {
        self.journal.record(event, self.clock.now());
    }

    fn take_reading(&mut self, wake: &mut WakeState) {
        let voltage = self.sensor.sample_voltage();
        let reading = Reading::from_voltage(
            voltage,
            self.config.config().chemistry,
            self.sensor.uptime_ms(),
        );
        info!(
            "battery {:.2} V, {:.1}% ({})",
            reading.voltage, reading.percentage, reading.status
        );
        wake.last_reading = Some(voltage);
        self.last_reading = Some(reading);
        self.record(CycleEvent::ReadingTaken);
    }

    fn bring_up_network(&mut self) -> bool {
        if self.channel.is_network_up() {
            return true;
        }
        if self.channel.connect_network(self.config.config()) {
            self.record(CycleEvent::NetworkUp);
            true
        } else {
            self.record(CycleEvent::NetworkUnavailable);
            false
        }
    }

    fn publish(&mut self, boot_count: u32) {
        let Some(reading) = self.last_reading.as_ref() else {
            return;
        };
        let report =
            self.channel
                .publish_reading(reading, boot_count, self.config.config().chemistry);
        let failed = u8::try_from(report.failed.len()).unwrap_or(u8::MAX);
        self.record(CycleEvent::Published { failed });
    }

    /// Pumps inbound commands. Returns `true` when a configuration reset ran.
    fn service_commands(&mut self) -> bool {
        let Self {
            config,
            updates,
            channel,
            clock,
            reset,
            journal,
            timings,
            ..
        } = self;

        let mut reset_done = false;
        let handled = channel.pump(clock, timings.command_window, |link, message, now| {
            let mut dispatcher = CommandDispatcher::new(config, updates, reset);
            let outcome = dispatcher.dispatch(link, message);
            let event = match outcome {
                DispatchOutcome::Ignored(_) => CycleEvent::CommandIgnored,
                DispatchOutcome::Rejected(_) => CycleEvent::CommandRejected,
                DispatchOutcome::Applied(Action::UpdateArmed(_)) => CycleEvent::TriggerArmed,
                DispatchOutcome::Applied(Action::ChemistryChanged(_)) => {
                    CycleEvent::ChemistryChanged
                }
                DispatchOutcome::Applied(Action::ConfigReset) => {
                    reset_done = true;
                    CycleEvent::ConfigReset
                }
            };
            journal.record(event, now);

            if outcome.ends_session() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        debug!("{handled} inbound message(s) handled");
        reset_done
    }

    fn attempt(&mut self, request: &UpdateRequest) -> UpdateOutcome {
        let mut context = UpdateContext {
            fetcher: &mut self.fetcher,
            push: &mut self.push,
            clock: &mut self.clock,
            journal: &mut self.journal,
            hostname: &self.config.config().client_id,
        };
        self.updates.apply(request, &mut context)
    }

    fn restart(&mut self, reason: RestartReason) -> CycleOutcome {
        self.channel.disconnect();
        self.record(CycleEvent::Disconnected);
        self.record(CycleEvent::Restarting);
        info!("restarting ({reason:?})");
        CycleOutcome::Restart(reason)
    }

    fn finish(&mut self) -> CycleOutcome {
        self.channel.disconnect();
        self.record(CycleEvent::Disconnected);

        if self.config.config().low_power_enabled {
            let wake_after = self.timings.suspend_interval;
            self.record(CycleEvent::Suspending);
            info!("suspending for {}s", wake_after.as_secs());
            CycleOutcome::Suspend { wake_after }
        } else {
            let delay = self.timings.stay_awake_delay;
            self.record(CycleEvent::StayingAwake);
            info!("low power disabled; next cycle in {}s", delay.as_secs());
            CycleOutcome::StayAwake { delay }
        }
    }
}
