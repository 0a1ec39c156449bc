//! Firmware update coordination.
//!
//! Requests are made durable through the [`PersistentTrigger`] before any
//! transfer, and the trigger is cleared before an attempt starts. A failed or
//! interrupted attempt therefore falls back to normal operation instead of
//! repeating forever.
//!
//! State machine:
//!
//! ```text
//! Idle ──request_update──▶ ArmedPending ──apply──▶ Attempting ──▶ Applied
//!   ▲                                                  │
//!   └──────────────── FailedBackToIdle ◀───────────────┘
//! ```

use core::fmt::{self, Write};
use core::time::Duration;

use heapless::String;
use log::{debug, error, info, warn};

use crate::clock::{Clock, Deadline};
use crate::config::DeviceConfig;
use crate::journal::{CycleEvent, CycleJournal};
use crate::storage::KeyValueStore;
use crate::trigger::{Filename, MAX_FILENAME_LEN, PersistentTrigger, TriggerError};
use crate::version::FirmwareVersion;

/// Base URL that direct-download filenames are appended to.
///
/// Overridable at build time through `NODE_UPDATE_BASE_URL`.
pub const UPDATE_BASE_URL: &str = match option_env!("NODE_UPDATE_BASE_URL") {
    Some(url) => url,
    None => "https://github.com/battery-node/firmware/releases/download/",
};

pub const MAX_URL_LEN: usize = 192;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_PUSH_WINDOW: Duration = Duration::from_secs(180);
pub const DEFAULT_PUSH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where an update request came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateSource {
    RemoteCommand,
    AutoVersionCheck,
    /// Resumed from a trigger left armed by a previous boot.
    PendingTrigger,
}

/// How the new image reaches the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    /// Fetch `UPDATE_BASE_URL + filename`.
    DirectDownload,
    /// Open a local service and wait for an image to be pushed.
    NetworkUploadWait,
}

/// Filename validation failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilenameError {
    Empty,
    TooLong,
    ForbiddenCharacter(char),
    AbsolutePath,
    ParentSegment,
}

impl fmt::Display for FilenameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilenameError::Empty => f.write_str("filename is empty"),
            FilenameError::TooLong => write!(f, "filename longer than {MAX_FILENAME_LEN} bytes"),
            FilenameError::ForbiddenCharacter(ch) => {
                write!(f, "filename contains forbidden character {ch:?}")
            }
            FilenameError::AbsolutePath => f.write_str("filename must be relative"),
            FilenameError::ParentSegment => f.write_str("filename must not contain `..`"),
        }
    }
}

/// Checks that `filename` is a safe relative path under the update base URL.
pub fn validate_filename(filename: &str) -> Result<(), FilenameError> {
    if filename.is_empty() {
        return Err(FilenameError::Empty);
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(FilenameError::TooLong);
    }
    if let Some(ch) = filename
        .chars()
        .find(|ch| matches!(ch, '\\' | ':') || ch.is_control() || ch.is_whitespace())
    {
        return Err(FilenameError::ForbiddenCharacter(ch));
    }
    if filename.starts_with('/') {
        return Err(FilenameError::AbsolutePath);
    }
    if filename.split('/').any(|segment| segment == "..") {
        return Err(FilenameError::ParentSegment);
    }
    Ok(())
}

/// A single update intent; consumed exactly once by [`UpdateCoordinator::apply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateRequest {
    pub source: UpdateSource,
    pub mode: UpdateMode,
    /// Relative image name; empty for [`UpdateMode::NetworkUploadWait`].
    pub filename: Filename,
}

impl UpdateRequest {
    /// Builds a validated direct-download request.
    pub fn direct_download(source: UpdateSource, filename: &str) -> Result<Self, FilenameError> {
        validate_filename(filename)?;
        let mut owned = Filename::new();
        owned
            .push_str(filename)
            .map_err(|_| FilenameError::TooLong)?;
        Ok(Self {
            source,
            mode: UpdateMode::DirectDownload,
            filename: owned,
        })
    }

    #[must_use]
    pub fn upload_wait(source: UpdateSource) -> Self {
        Self {
            source,
            mode: UpdateMode::NetworkUploadWait,
            filename: Filename::new(),
        }
    }

    fn resumed(filename: Filename) -> Self {
        let mode = if filename.is_empty() {
            UpdateMode::NetworkUploadWait
        } else {
            UpdateMode::DirectDownload
        };
        Self {
            source: UpdateSource::PendingTrigger,
            mode,
            filename,
        }
    }
}

/// Coordinator states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    ArmedPending,
    Attempting,
    Applied,
    /// The last attempt failed; behaves like `Idle` for new requests.
    FailedBackToIdle,
}

/// Failures from the transfer portion of an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchError {
    Timeout,
    /// Server answered with a non-success status code.
    Status(u16),
    Transport,
    /// The downloaded image failed verification and was not activated.
    Image,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Timeout => f.write_str("fetch timed out"),
            FetchError::Status(code) => write!(f, "server returned status {code}"),
            FetchError::Transport => f.write_str("transport error"),
            FetchError::Image => f.write_str("image rejected"),
        }
    }
}

/// Downloads an image from a URL and stages it for the next boot.
pub trait FirmwareFetcher {
    fn fetch_and_apply(&mut self, url: &str, timeout: Duration) -> Result<(), FetchError>;
}

/// Push-update service failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushError {
    Unavailable,
    Aborted,
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Unavailable => f.write_str("push service unavailable"),
            PushError::Aborted => f.write_str("push transfer aborted"),
        }
    }
}

/// Progress reported by [`PushUpdateService::poll`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushProgress {
    Waiting,
    Receiving,
    /// An image was received and staged for the next boot.
    Completed,
}

/// Local service that accepts an image pushed over the network.
pub trait PushUpdateService {
    fn open(&mut self, hostname: &str) -> Result<(), PushError>;

    /// Services the connection once without blocking for long.
    fn poll(&mut self) -> Result<PushProgress, PushError>;

    fn close(&mut self);
}

/// Why an attempt did not apply a new image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateFailure {
    InvalidFilename(FilenameError),
    UrlTooLong,
    Fetch(FetchError),
    Push(PushError),
    PushWindowElapsed,
}

impl fmt::Display for UpdateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateFailure::InvalidFilename(err) => err.fmt(f),
            UpdateFailure::UrlTooLong => write!(f, "update url longer than {MAX_URL_LEN} bytes"),
            UpdateFailure::Fetch(err) => err.fmt(f),
            UpdateFailure::Push(err) => err.fmt(f),
            UpdateFailure::PushWindowElapsed => f.write_str("no image pushed before the window closed"),
        }
    }
}

/// Result of [`UpdateCoordinator::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new image is staged; the platform must restart.
    Applied,
    /// The attempt ran and failed; the trigger is already clear.
    Failed(UpdateFailure),
    /// The trigger could not be cleared, so no transfer was started.
    Abandoned(TriggerError),
}

/// Tunable windows for update attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateTimings {
    pub fetch_timeout: Duration,
    pub push_window: Duration,
    pub push_poll_interval: Duration,
}

impl Default for UpdateTimings {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            push_window: DEFAULT_PUSH_WINDOW,
            push_poll_interval: DEFAULT_PUSH_POLL_INTERVAL,
        }
    }
}

/// Collaborators borrowed for the duration of one attempt.
pub struct UpdateContext<'a, F, P, C>
where
    C: Clock,
{
    pub fetcher: &'a mut F,
    pub push: &'a mut P,
    pub clock: &'a mut C,
    pub journal: &'a mut CycleJournal<C::Instant>,
    /// Name the push service advertises itself under.
    pub hostname: &'a str,
}

/// Owns the durable trigger and drives update attempts.
pub struct UpdateCoordinator<S> {
    trigger: PersistentTrigger<S>,
    state: UpdateState,
    armed: Option<UpdateRequest>,
    timings: UpdateTimings,
}

impl<S> UpdateCoordinator<S> {
    pub fn new(trigger: PersistentTrigger<S>) -> Self {
        Self {
            trigger,
            state: UpdateState::Idle,
            armed: None,
            timings: UpdateTimings::default(),
        }
    }

    #[must_use]
    pub fn with_timings(mut self, timings: UpdateTimings) -> Self {
        self.timings = timings;
        self
    }

    #[must_use]
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Request armed during this cycle and not yet attempted.
    #[must_use]
    pub fn armed(&self) -> Option<&UpdateRequest> {
        self.armed.as_ref()
    }

    pub fn trigger(&self) -> &PersistentTrigger<S> {
        &self.trigger
    }

    pub fn trigger_mut(&mut self) -> &mut PersistentTrigger<S> {
        &mut self.trigger
    }

    pub fn into_inner(self) -> PersistentTrigger<S> {
        self.trigger
    }

    /// Removes the armed request so it can be handed to [`apply`](Self::apply).
    pub fn take_armed(&mut self) -> Option<UpdateRequest> {
        self.armed.take()
    }
}

impl<S> UpdateCoordinator<S>
where
    S: KeyValueStore,
{
    /// Arms the durable trigger for `request`. The most recent request wins.
    pub fn request_update(&mut self, request: UpdateRequest) -> Result<(), TriggerError> {
        if self.state == UpdateState::Attempting {
            warn!("update request ignored while an attempt is running");
            return Ok(());
        }

        self.trigger.arm(&request.filename)?;
        if let Some(previous) = self.armed.replace(request) {
            debug!("replacing armed update {:?}", previous.filename.as_str());
        }
        self.state = UpdateState::ArmedPending;
        Ok(())
    }

    /// Resumes an update left armed by a previous boot.
    ///
    /// Returns the request to attempt, moving to `Attempting`, when the
    /// trigger is pending. No broker traffic is involved.
    pub fn check_pending_from_boot(&mut self) -> Option<UpdateRequest> {
        self.armed = None;
        let record = self.trigger.peek();
        if !record.pending {
            self.state = UpdateState::Idle;
            return None;
        }

        info!("pending update found for {:?}", record.filename.as_str());
        self.state = UpdateState::Attempting;
        Some(UpdateRequest::resumed(record.filename))
    }

    /// Leaves a resumed request armed when it cannot be attempted this cycle.
    pub fn defer(&mut self, request: &UpdateRequest) {
        debug!("deferring update {:?} to a later cycle", request.filename.as_str());
        self.state = UpdateState::ArmedPending;
    }

    /// Arms a download when the configured target is newer than `current`.
    ///
    /// Returns `Ok(true)` when a request was armed.
    pub fn check_for_automatic_update(
        &mut self,
        config: &DeviceConfig,
        current: FirmwareVersion,
    ) -> Result<bool, TriggerError> {
        let target_text = config.update_target_version.as_str();
        if target_text.is_empty() {
            return Ok(false);
        }

        let Ok(target) = FirmwareVersion::parse(target_text) else {
            warn!("update target {target_text:?} is not a version; skipping check");
            return Ok(false);
        };
        if target <= current {
            debug!("running {current}, target {target}: up to date");
            return Ok(false);
        }

        let mut filename = Filename::new();
        if write!(filename, "v{target}/firmware-{}.bin", config.chemistry.slug()).is_err() {
            warn!("image name for {target} does not fit; skipping update");
            return Ok(false);
        }
        info!("running {current}, target {target}: requesting {filename}");

        let request = UpdateRequest {
            source: UpdateSource::AutoVersionCheck,
            mode: UpdateMode::DirectDownload,
            filename,
        };
        self.request_update(request)?;
        Ok(true)
    }

    /// Attempts `request`, disarming the trigger before any transfer starts.
    pub fn apply<F, P, C>(
        &mut self,
        request: &UpdateRequest,
        context: &mut UpdateContext<'_, F, P, C>,
    ) -> UpdateOutcome
    where
        F: FirmwareFetcher,
        P: PushUpdateService,
        C: Clock,
    {
        self.state = UpdateState::Attempting;
        self.armed = None;

        if let Err(err) = self.trigger.disarm() {
            error!("cannot clear update trigger ({err}); not attempting update");
            self.state = UpdateState::ArmedPending;
            context
                .journal
                .record(CycleEvent::UpdateAbandoned, context.clock.now());
            return UpdateOutcome::Abandoned(err);
        }
        context
            .journal
            .record(CycleEvent::TriggerDisarmed, context.clock.now());

        let result = match request.mode {
            UpdateMode::DirectDownload => self.direct_download(&request.filename, context),
            UpdateMode::NetworkUploadWait => self.await_push(context),
        };

        match result {
            Ok(()) => {
                info!("update applied; restart required");
                self.state = UpdateState::Applied;
                context
                    .journal
                    .record(CycleEvent::UpdateApplied, context.clock.now());
                UpdateOutcome::Applied
            }
            Err(failure) => {
                warn!("update failed: {failure}; continuing normal operation");
                self.state = UpdateState::FailedBackToIdle;
                context
                    .journal
                    .record(CycleEvent::UpdateFailed, context.clock.now());
                UpdateOutcome::Failed(failure)
            }
        }
    }

    fn direct_download<F, P, C>(
        &self,
        filename: &str,
        context: &mut UpdateContext<'_, F, P, C>,
    ) -> Result<(), UpdateFailure>
    where
        F: FirmwareFetcher,
        C: Clock,
    {
        validate_filename(filename).map_err(UpdateFailure::InvalidFilename)?;

        let mut url: String<MAX_URL_LEN> = String::new();
        write!(url, "{UPDATE_BASE_URL}{filename}").map_err(|_| UpdateFailure::UrlTooLong)?;

        info!("fetching {url}");
        context
            .journal
            .record(CycleEvent::FetchStarted, context.clock.now());
        context
            .fetcher
            .fetch_and_apply(&url, self.timings.fetch_timeout)
            .map_err(UpdateFailure::Fetch)
    }

    fn await_push<F, P, C>(
        &self,
        context: &mut UpdateContext<'_, F, P, C>,
    ) -> Result<(), UpdateFailure>
    where
        P: PushUpdateService,
        C: Clock,
    {
        context
            .push
            .open(context.hostname)
            .map_err(UpdateFailure::Push)?;
        info!(
            "waiting up to {}s for a pushed image as {}",
            self.timings.push_window.as_secs(),
            context.hostname
        );
        context
            .journal
            .record(CycleEvent::PushWindowOpened, context.clock.now());

        let deadline = Deadline::after(context.clock.now(), self.timings.push_window);
        let result = loop {
            match context.push.poll() {
                Ok(PushProgress::Completed) => break Ok(()),
                Ok(PushProgress::Waiting | PushProgress::Receiving) => {}
                Err(err) => break Err(UpdateFailure::Push(err)),
            }
            if deadline.expired(context.clock.now()) {
                break Err(UpdateFailure::PushWindowElapsed);
            }
            context.clock.delay(self.timings.push_poll_interval);
        };

        context.push.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::trigger::TriggerRecord;
    use core::ops::Add;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct MockInstant(u64);

    impl Add<Duration> for MockInstant {
        type Output = Self;

        fn add(self, rhs: Duration) -> Self::Output {
            Self(self.0 + rhs.as_millis() as u64)
        }
    }

    #[derive(Default)]
    struct MockClock {
        now_ms: u64,
    }

    impl Clock for MockClock {
        type Instant = MockInstant;

        fn now(&self) -> MockInstant {
            MockInstant(self.now_ms)
        }

        fn delay(&mut self, duration: Duration) {
            self.now_ms += duration.as_millis() as u64;
        }
    }

    struct MockFetcher {
        result: Result<(), FetchError>,
        urls: heapless::Vec<String<MAX_URL_LEN>, 4>,
    }

    impl MockFetcher {
        fn returning(result: Result<(), FetchError>) -> Self {
            Self {
                result,
                urls: heapless::Vec::new(),
            }
        }
    }

    impl FirmwareFetcher for MockFetcher {
        fn fetch_and_apply(&mut self, url: &str, timeout: Duration) -> Result<(), FetchError> {
            assert_eq!(timeout, DEFAULT_FETCH_TIMEOUT);
            let mut owned = String::new();
            owned.push_str(url).expect("url fits");
            self.urls.push(owned).expect("room");
            self.result
        }
    }

    struct MockPush {
        complete_after: Option<u32>,
        polls: u32,
        opened: bool,
        closed: bool,
    }

    impl MockPush {
        fn new(complete_after: Option<u32>) -> Self {
            Self {
                complete_after,
                polls: 0,
                opened: false,
                closed: false,
            }
        }
    }

    impl PushUpdateService for MockPush {
        fn open(&mut self, hostname: &str) -> Result<(), PushError> {
            assert_eq!(hostname, "node-1");
            self.opened = true;
            Ok(())
        }

        fn poll(&mut self) -> Result<PushProgress, PushError> {
            self.polls += 1;
            match self.complete_after {
                Some(limit) if self.polls >= limit => Ok(PushProgress::Completed),
                Some(_) => Ok(PushProgress::Receiving),
                None => Ok(PushProgress::Waiting),
            }
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn coordinator() -> UpdateCoordinator<MemoryStore<4>> {
        UpdateCoordinator::new(PersistentTrigger::new(MemoryStore::new()))
    }

    fn run_apply(
        coordinator: &mut UpdateCoordinator<MemoryStore<4>>,
        request: &UpdateRequest,
        fetcher: &mut MockFetcher,
        push: &mut MockPush,
        clock: &mut MockClock,
        journal: &mut CycleJournal<MockInstant>,
    ) -> UpdateOutcome {
        let mut context = UpdateContext {
            fetcher,
            push,
            clock,
            journal,
            hostname: "node-1",
        };
        coordinator.apply(request, &mut context)
    }

    #[test]
    fn filenames_are_validated() {
        assert_eq!(validate_filename("v1.0.2/firmware-a.bin"), Ok(()));
        assert_eq!(
            validate_filename("bad:name"),
            Err(FilenameError::ForbiddenCharacter(':'))
        );
        assert_eq!(
            validate_filename("dir\\file.bin"),
            Err(FilenameError::ForbiddenCharacter('\\'))
        );
        assert_eq!(validate_filename("/etc/passwd"), Err(FilenameError::AbsolutePath));
        assert_eq!(
            validate_filename("v1/../../secret.bin"),
            Err(FilenameError::ParentSegment)
        );
        assert_eq!(validate_filename(""), Err(FilenameError::Empty));
    }

    #[test]
    fn request_arms_trigger_and_last_wins() {
        let mut coordinator = coordinator();
        let first = UpdateRequest::direct_download(UpdateSource::RemoteCommand, "a.bin")
            .expect("valid");
        let second = UpdateRequest::upload_wait(UpdateSource::RemoteCommand);
        coordinator.request_update(first).expect("arm");
        coordinator.request_update(second.clone()).expect("arm");

        assert_eq!(coordinator.state(), UpdateState::ArmedPending);
        assert_eq!(coordinator.armed(), Some(&second));
        let record = coordinator.trigger().peek();
        assert!(record.pending);
        assert!(record.filename.is_empty());
    }

    #[test]
    fn pending_trigger_resumes_without_broker() {
        let mut trigger = PersistentTrigger::new(MemoryStore::<4>::new());
        trigger.arm("v2.0.0/firmware-lifepo4.bin").expect("arm");
        let mut coordinator = UpdateCoordinator::new(trigger);

        let request = coordinator
            .check_pending_from_boot()
            .expect("pending request");
        assert_eq!(coordinator.state(), UpdateState::Attempting);
        assert_eq!(request.source, UpdateSource::PendingTrigger);
        assert_eq!(request.mode, UpdateMode::DirectDownload);
        assert_eq!(request.filename.as_str(), "v2.0.0/firmware-lifepo4.bin");
    }

    #[test]
    fn empty_pending_filename_resumes_as_upload_wait() {
        let mut trigger = PersistentTrigger::new(MemoryStore::<4>::new());
        trigger.arm("").expect("arm");
        let mut coordinator = UpdateCoordinator::new(trigger);
        let request = coordinator
            .check_pending_from_boot()
            .expect("pending request");
        assert_eq!(request.mode, UpdateMode::NetworkUploadWait);
    }

    #[test]
    fn automatic_check_builds_chemistry_image_name() {
        let mut coordinator = coordinator();
        let mut config = DeviceConfig::default();
        config.set_update_target("1.3.0").expect("version");
        config.chemistry = crate::telemetry::Chemistry::LiFePo4;

        assert_eq!(
            coordinator.check_for_automatic_update(&config, FirmwareVersion::new(1, 2, 9)),
            Ok(true)
        );
        let armed = coordinator.armed().expect("armed");
        assert_eq!(armed.source, UpdateSource::AutoVersionCheck);
        assert_eq!(armed.filename.as_str(), "v1.3.0/firmware-lifepo4.bin");
    }

    #[test]
    fn automatic_check_skips_equal_or_unset_target() {
        let mut coordinator = coordinator();
        let mut config = DeviceConfig::default();
        assert_eq!(
            coordinator.check_for_automatic_update(&config, FirmwareVersion::new(1, 0, 0)),
            Ok(false)
        );

        config.set_update_target("1.0.0").expect("version");
        assert_eq!(
            coordinator.check_for_automatic_update(&config, FirmwareVersion::new(1, 0, 0)),
            Ok(false)
        );
        assert_eq!(coordinator.trigger().peek(), TriggerRecord::idle());
        assert_eq!(coordinator.state(), UpdateState::Idle);
    }

    #[test]
    fn direct_download_disarms_before_fetching() {
        let mut coordinator = coordinator();
        let request =
            UpdateRequest::direct_download(UpdateSource::RemoteCommand, "v1.0.2/firmware-a.bin")
                .expect("valid");
        coordinator.request_update(request.clone()).expect("arm");

        let mut fetcher = MockFetcher::returning(Ok(()));
        let mut push = MockPush::new(None);
        let mut clock = MockClock::default();
        let mut journal = CycleJournal::new();
        let outcome = run_apply(
            &mut coordinator,
            &request,
            &mut fetcher,
            &mut push,
            &mut clock,
            &mut journal,
        );

        assert_eq!(outcome, UpdateOutcome::Applied);
        assert_eq!(coordinator.state(), UpdateState::Applied);
        assert_eq!(coordinator.trigger().peek(), TriggerRecord::idle());
        assert!(fetcher.urls[0].ends_with("v1.0.2/firmware-a.bin"));
        assert!(fetcher.urls[0].starts_with(UPDATE_BASE_URL));
        assert!(
            journal.position(CycleEvent::TriggerDisarmed)
                < journal.position(CycleEvent::FetchStarted)
        );
    }

    #[test]
    fn failed_fetch_leaves_trigger_clear() {
        let mut coordinator = coordinator();
        let request = UpdateRequest::direct_download(UpdateSource::RemoteCommand, "f.bin")
            .expect("valid");
        coordinator.request_update(request.clone()).expect("arm");

        let mut fetcher = MockFetcher::returning(Err(FetchError::Status(404)));
        let mut push = MockPush::new(None);
        let mut clock = MockClock::default();
        let mut journal = CycleJournal::new();
        let outcome = run_apply(
            &mut coordinator,
            &request,
            &mut fetcher,
            &mut push,
            &mut clock,
            &mut journal,
        );

        assert_eq!(
            outcome,
            UpdateOutcome::Failed(UpdateFailure::Fetch(FetchError::Status(404)))
        );
        assert_eq!(coordinator.state(), UpdateState::FailedBackToIdle);
        assert_eq!(coordinator.trigger().peek(), TriggerRecord::idle());
        assert!(journal.contains(CycleEvent::UpdateFailed));
    }

    #[test]
    fn undisarmable_trigger_abandons_without_fetch() {
        let mut coordinator = coordinator();
        let request = UpdateRequest::direct_download(UpdateSource::RemoteCommand, "f.bin")
            .expect("valid");
        coordinator.request_update(request.clone()).expect("arm");
        coordinator.trigger_mut().store_mut().set_available(false);

        let mut fetcher = MockFetcher::returning(Ok(()));
        let mut push = MockPush::new(None);
        let mut clock = MockClock::default();
        let mut journal = CycleJournal::new();
        let outcome = run_apply(
            &mut coordinator,
            &request,
            &mut fetcher,
            &mut push,
            &mut clock,
            &mut journal,
        );

        assert!(matches!(outcome, UpdateOutcome::Abandoned(_)));
        assert!(fetcher.urls.is_empty());
        assert!(!journal.contains(CycleEvent::FetchStarted));
    }

    #[test]
    fn push_window_completes_when_image_arrives() {
        let mut coordinator = coordinator();
        let request = UpdateRequest::upload_wait(UpdateSource::RemoteCommand);
        coordinator.request_update(request.clone()).expect("arm");

        let mut fetcher = MockFetcher::returning(Ok(()));
        let mut push = MockPush::new(Some(3));
        let mut clock = MockClock::default();
        let mut journal = CycleJournal::new();
        let outcome = run_apply(
            &mut coordinator,
            &request,
            &mut fetcher,
            &mut push,
            &mut clock,
            &mut journal,
        );

        assert_eq!(outcome, UpdateOutcome::Applied);
        assert!(push.opened && push.closed);
        assert!(fetcher.urls.is_empty());
    }

    #[test]
    fn push_window_elapses_back_to_idle() {
        let mut coordinator = coordinator();
        let request = UpdateRequest::upload_wait(UpdateSource::RemoteCommand);
        coordinator.request_update(request.clone()).expect("arm");

        let mut fetcher = MockFetcher::returning(Ok(()));
        let mut push = MockPush::new(None);
        let mut clock = MockClock::default();
        let mut journal = CycleJournal::new();
        let outcome = run_apply(
            &mut coordinator,
            &request,
            &mut fetcher,
            &mut push,
            &mut clock,
            &mut journal,
        );

        assert_eq!(
            outcome,
            UpdateOutcome::Failed(UpdateFailure::PushWindowElapsed)
        );
        assert!(push.closed);
        assert!(clock.now_ms >= DEFAULT_PUSH_WINDOW.as_millis() as u64);
        assert_eq!(coordinator.trigger().peek(), TriggerRecord::idle());
    }
}
