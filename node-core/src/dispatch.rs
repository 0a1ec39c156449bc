//! Routing of inbound broker messages to configuration, reset, and update
//! actions.

use core::fmt;
use core::time::Duration;

use log::{info, warn};

use crate::channel::{CommandLink, InboundMessage, Topic};
use crate::config::{ConfigStore, SettingKey};
use crate::storage::{KeyValueStore, StoreError};
use crate::telemetry::Chemistry;
use crate::trigger::TriggerError;
use crate::update::{FilenameError, UpdateCoordinator, UpdateMode, UpdateRequest, UpdateSource};

/// Bounded wait for the retained-message clear to leave the device.
pub const RETAINED_CLEAR_FLUSH: Duration = Duration::from_millis(50);

const UPLOAD_WAIT_WORDS: [&str; 2] = ["update", "ota"];
const RESET_WORDS: [&str; 2] = ["nvs", "config"];

/// Why a message was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    NotUtf8,
    Filename(FilenameError),
    UnknownChemistry,
    Trigger(TriggerError),
    Storage(StoreError),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotUtf8 => f.write_str("payload is not UTF-8"),
            RejectReason::Filename(err) => write!(f, "invalid filename: {err}"),
            RejectReason::UnknownChemistry => f.write_str("unknown battery chemistry"),
            RejectReason::Trigger(err) => write!(f, "cannot arm update: {err}"),
            RejectReason::Storage(err) => write!(f, "cannot persist: {err}"),
        }
    }
}

/// Why a message was dropped without effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Empty payload, usually the echo of a cleared retained message.
    EmptyPayload,
    UnknownTopic,
    UnrecognisedReset,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::EmptyPayload => f.write_str("empty payload"),
            IgnoreReason::UnknownTopic => f.write_str("topic not handled"),
            IgnoreReason::UnrecognisedReset => f.write_str("unrecognised reset payload"),
        }
    }
}

/// Effect of an accepted command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    UpdateArmed(UpdateMode),
    ConfigReset,
    ChemistryChanged(Chemistry),
}

/// Result of dispatching one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ignored(IgnoreReason),
    Rejected(RejectReason),
    Applied(Action),
}

impl DispatchOutcome {
    /// Whether the command session must end after this message.
    #[must_use]
    pub fn ends_session(&self) -> bool {
        matches!(self, DispatchOutcome::Applied(Action::ConfigReset))
    }
}

/// Platform hook run for a configuration reset command.
pub trait ResetHandler<S> {
    fn reset(&mut self, config: &mut ConfigStore<S>) -> Result<(), StoreError>;
}

/// Default reset: erase all stored configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClearConfiguration;

impl<S> ResetHandler<S> for ClearConfiguration
where
    S: KeyValueStore,
{
    fn reset(&mut self, config: &mut ConfigStore<S>) -> Result<(), StoreError> {
        config.clear()
    }
}

/// Interprets a trimmed, non-empty update payload.
///
/// `update` or `ota` waits for a pushed image; anything else names an image
/// to download.
pub fn parse_update_payload(payload: &str) -> Result<UpdateRequest, FilenameError> {
    if UPLOAD_WAIT_WORDS
        .iter()
        .any(|word| word.eq_ignore_ascii_case(payload))
    {
        return Ok(UpdateRequest::upload_wait(UpdateSource::RemoteCommand));
    }
    UpdateRequest::direct_download(UpdateSource::RemoteCommand, payload)
}

/// Applies inbound commands against the node's state for one session.
pub struct CommandDispatcher<'a, S, T, H> {
    config: &'a mut ConfigStore<S>,
    updates: &'a mut UpdateCoordinator<T>,
    reset: &'a mut H,
}

impl<'a, S, T, H> CommandDispatcher<'a, S, T, H>
where
    S: KeyValueStore,
    T: KeyValueStore,
    H: ResetHandler<S>,
{
    pub fn new(
        config: &'a mut ConfigStore<S>,
        updates: &'a mut UpdateCoordinator<T>,
        reset: &'a mut H,
    ) -> Self {
        Self {
            config,
            updates,
            reset,
        }
    }

    /// Handles one message. Acknowledgements are published through `link`.
    pub fn dispatch<L>(&mut self, link: &mut L, message: &InboundMessage) -> DispatchOutcome
    where
        L: CommandLink,
    {
        let outcome = match link.topics().classify(&message.topic) {
            Some(Topic::Update) => self.on_update(link, &message.payload),
            Some(Topic::Reset) => self.on_reset(&message.payload),
            Some(Topic::Chemistry) => self.on_chemistry(link, &message.payload),
            _ => DispatchOutcome::Ignored(IgnoreReason::UnknownTopic),
        };

        match outcome {
            DispatchOutcome::Rejected(reason) => warn!("{}: rejected ({reason})", message.topic),
            DispatchOutcome::Ignored(reason) => info!("{}: ignored ({reason})", message.topic),
            DispatchOutcome::Applied(_) => {}
        }
        outcome
    }

    fn on_update<L>(&mut self, link: &mut L, raw: &[u8]) -> DispatchOutcome
    where
        L: CommandLink,
    {
        if raw.trim_ascii().is_empty() {
            return DispatchOutcome::Ignored(IgnoreReason::EmptyPayload);
        }

        // Clear the retained command so it is not redelivered on the next wake.
        if let Err(err) = link.publish_to(Topic::Update, b"", true) {
            warn!("could not clear retained update command: {err}");
        }
        link.flush(RETAINED_CLEAR_FLUSH);

        let Ok(payload) = core::str::from_utf8(raw) else {
            return DispatchOutcome::Rejected(RejectReason::NotUtf8);
        };
        let request = match parse_update_payload(payload.trim()) {
            Ok(request) => request,
            Err(err) => return DispatchOutcome::Rejected(RejectReason::Filename(err)),
        };

        let mode = request.mode;
        info!(
            "update requested ({:?}) for {:?}",
            mode,
            request.filename.as_str()
        );
        match self.updates.request_update(request) {
            Ok(()) => DispatchOutcome::Applied(Action::UpdateArmed(mode)),
            Err(err) => DispatchOutcome::Rejected(RejectReason::Trigger(err)),
        }
    }

    fn on_reset(&mut self, raw: &[u8]) -> DispatchOutcome {
        let Ok(payload) = core::str::from_utf8(raw) else {
            return DispatchOutcome::Rejected(RejectReason::NotUtf8);
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return DispatchOutcome::Ignored(IgnoreReason::EmptyPayload);
        }
        if !RESET_WORDS
            .iter()
            .any(|word| word.eq_ignore_ascii_case(payload))
        {
            return DispatchOutcome::Ignored(IgnoreReason::UnrecognisedReset);
        }

        warn!("configuration reset requested over the broker");
        match self.reset.reset(self.config) {
            Ok(()) => DispatchOutcome::Applied(Action::ConfigReset),
            Err(err) => DispatchOutcome::Rejected(RejectReason::Storage(err)),
        }
    }

    fn on_chemistry<L>(&mut self, link: &mut L, raw: &[u8]) -> DispatchOutcome
    where
        L: CommandLink,
    {
        let Ok(payload) = core::str::from_utf8(raw) else {
            return DispatchOutcome::Rejected(RejectReason::NotUtf8);
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return DispatchOutcome::Ignored(IgnoreReason::EmptyPayload);
        }
        let Some(chemistry) = Chemistry::from_alias(payload) else {
            return DispatchOutcome::Rejected(RejectReason::UnknownChemistry);
        };

        let previous = self.config.config().chemistry;
        self.config.config_mut().chemistry = chemistry;
        if let Err(err) = self.config.save_key(SettingKey::Chemistry) {
            self.config.config_mut().chemistry = previous;
            return DispatchOutcome::Rejected(RejectReason::Storage(err));
        }

        info!("battery chemistry set to {chemistry}");
        if let Err(err) = link.publish_to(
            Topic::ChemistryState,
            chemistry.display_name().as_bytes(),
            true,
        ) {
            warn!("chemistry acknowledgement not published: {err}");
        }
        DispatchOutcome::Applied(Action::ChemistryChanged(chemistry))
    }
}
