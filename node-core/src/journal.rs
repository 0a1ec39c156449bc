//! Bounded record of what happened during the current wake cycle.
//!
//! The journal complements the log sink: it keeps typed events in a ring so
//! tests and the console can inspect ordering (for example that the update
//! trigger was disarmed before a transfer began) without parsing text.

use core::fmt;

use heapless::HistoryBuf;

/// Number of events retained per cycle.
pub const JOURNAL_CAPACITY: usize = 48;

/// Monotonic identifier assigned to each recorded event.
pub type EventId = u16;

/// Events recorded while a wake cycle runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CycleEvent {
    WakeStarted { boot_count: u32 },
    ReadingTaken,
    PendingUpdateFound,
    NetworkUp,
    NetworkUnavailable,
    BrokerUp,
    BrokerUnavailable,
    Published { failed: u8 },
    CommandIgnored,
    CommandRejected,
    TriggerArmed,
    TriggerDisarmed,
    UpdateAbandoned,
    FetchStarted,
    PushWindowOpened,
    UpdateApplied,
    UpdateFailed,
    ChemistryChanged,
    ConfigReset,
    Disconnected,
    Suspending,
    StayingAwake,
    Restarting,
}

impl fmt::Display for CycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleEvent::WakeStarted { boot_count } => write!(f, "wake-started boot={boot_count}"),
            CycleEvent::ReadingTaken => f.write_str("reading-taken"),
            CycleEvent::PendingUpdateFound => f.write_str("pending-update-found"),
            CycleEvent::NetworkUp => f.write_str("network-up"),
            CycleEvent::NetworkUnavailable => f.write_str("network-unavailable"),
            CycleEvent::BrokerUp => f.write_str("broker-up"),
            CycleEvent::BrokerUnavailable => f.write_str("broker-unavailable"),
            CycleEvent::Published { failed } => write!(f, "published failed={failed}"),
            CycleEvent::CommandIgnored => f.write_str("command-ignored"),
            CycleEvent::CommandRejected => f.write_str("command-rejected"),
            CycleEvent::TriggerArmed => f.write_str("trigger-armed"),
            CycleEvent::TriggerDisarmed => f.write_str("trigger-disarmed"),
            CycleEvent::UpdateAbandoned => f.write_str("update-abandoned"),
            CycleEvent::FetchStarted => f.write_str("fetch-started"),
            CycleEvent::PushWindowOpened => f.write_str("push-window-opened"),
            CycleEvent::UpdateApplied => f.write_str("update-applied"),
            CycleEvent::UpdateFailed => f.write_str("update-failed"),
            CycleEvent::ChemistryChanged => f.write_str("chemistry-changed"),
            CycleEvent::ConfigReset => f.write_str("config-reset"),
            CycleEvent::Disconnected => f.write_str("disconnected"),
            CycleEvent::Suspending => f.write_str("suspending"),
            CycleEvent::StayingAwake => f.write_str("staying-awake"),
            CycleEvent::Restarting => f.write_str("restarting"),
        }
    }
}

/// Journal entry stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JournalRecord<Instant>
where
    Instant: Copy,
{
    pub id: EventId,
    pub timestamp: Instant,
    pub event: CycleEvent,
}

/// Records cycle events into a fixed-size ring buffer.
pub struct CycleJournal<Instant, const CAPACITY: usize = JOURNAL_CAPACITY>
where
    Instant: Copy,
{
    ring: HistoryBuf<JournalRecord<Instant>, CAPACITY>,
    next_event_id: EventId,
}

impl<Instant, const CAPACITY: usize> CycleJournal<Instant, CAPACITY>
where
    Instant: Copy,
{
    /// Creates an empty journal.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Records `event` at `timestamp` and returns its identifier.
    pub fn record(&mut self, event: CycleEvent, timestamp: Instant) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);
        self.ring.write(JournalRecord {
            id,
            timestamp,
            event,
        });
        id
    }

    /// Iterates over retained records in chronological order.
    pub fn oldest_first(&self) -> impl Iterator<Item = &JournalRecord<Instant>> + '_ {
        self.ring.oldest_ordered()
    }

    /// Iterates over retained events in chronological order.
    pub fn events(&self) -> impl Iterator<Item = CycleEvent> + '_ {
        self.oldest_first().map(|record| record.event)
    }

    /// Returns the most recent record, if any.
    pub fn latest(&self) -> Option<&JournalRecord<Instant>> {
        self.ring.recent()
    }

    /// Returns `true` when `event` was recorded this cycle.
    pub fn contains(&self, event: CycleEvent) -> bool {
        self.events().any(|candidate| candidate == event)
    }

    /// Position of the first occurrence of `event` among retained records.
    pub fn position(&self, event: CycleEvent) -> Option<usize> {
        self.events().position(|candidate| candidate == event)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Drops every record, keeping the identifier sequence running.
    pub fn clear(&mut self) {
        self.ring.clear();
    }
}

impl<Instant, const CAPACITY: usize> Default for CycleJournal<Instant, CAPACITY>
where
    Instant: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}
