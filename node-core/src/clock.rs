//! Monotonic time seam shared by the broker pump and the update windows.

use core::ops::Add;
use core::time::Duration;

/// Platform clock driving every bounded wait in a wake cycle.
///
/// Implementations may be backed by a hardware timer or a virtual clock; the
/// core only compares instants and asks the platform to block for a while.
pub trait Clock {
    type Instant: Copy + Ord + Add<Duration, Output = Self::Instant>;

    /// Returns the current instant.
    fn now(&self) -> Self::Instant;

    /// Blocks (or advances virtual time) for `duration`.
    fn delay(&mut self, duration: Duration);
}

/// Absolute point in time after which a bounded operation is abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline<Instant> {
    at: Instant,
}

impl<Instant> Deadline<Instant>
where
    Instant: Copy + Ord + Add<Duration, Output = Instant>,
{
    /// Creates a deadline `window` after `start`.
    #[must_use]
    pub fn after(start: Instant, window: Duration) -> Self {
        Self { at: start + window }
    }

    /// Returns `true` once `now` has reached the deadline.
    #[must_use]
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.at
    }

    #[must_use]
    pub fn at(&self) -> Instant {
        self.at
    }
}
