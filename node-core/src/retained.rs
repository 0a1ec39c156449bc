//! Carry-over state kept in memory that survives low-power suspend.
//!
//! The platform places a [`RetainedCell`] in its suspend-preserved region and
//! threads the decoded [`WakeState`] through each cycle explicitly. Nothing here
//! survives a power loss; the marker word distinguishes a warm wake from
//! whatever the region held at power-on.

use portable_atomic::{AtomicU32, Ordering};

const VALID_MARKER: u32 = 0x5741_4B45;
const NO_READING: u32 = u32::MAX;

/// Per-suspend carry-over values.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WakeState {
    pub boot_count: u32,
    pub last_reading: Option<f32>,
}

/// Atomic backing store for [`WakeState`].
pub struct RetainedCell {
    marker: AtomicU32,
    boot_count: AtomicU32,
    /// Raw `f32` bits of the last voltage (`u32::MAX` == none).
    last_reading: AtomicU32,
}

impl RetainedCell {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            marker: AtomicU32::new(0),
            boot_count: AtomicU32::new(0),
            last_reading: AtomicU32::new(NO_READING),
        }
    }

    /// Decodes the retained values, or a fresh state after power loss.
    #[must_use]
    pub fn load(&self) -> WakeState {
        if self.marker.load(Ordering::Acquire) != VALID_MARKER {
            return WakeState::default();
        }

        let raw = self.last_reading.load(Ordering::Relaxed);
        WakeState {
            boot_count: self.boot_count.load(Ordering::Relaxed),
            last_reading: (raw != NO_READING).then(|| f32::from_bits(raw)),
        }
    }

    pub fn store(&self, state: &WakeState) {
        self.boot_count.store(state.boot_count, Ordering::Relaxed);
        self.last_reading.store(
            state.last_reading.map_or(NO_READING, f32::to_bits),
            Ordering::Relaxed,
        );
        self.marker.store(VALID_MARKER, Ordering::Release);
    }

    /// Forgets the retained values, as a power loss would.
    pub fn invalidate(&self) {
        self.marker.store(0, Ordering::Release);
    }
}

impl Default for RetainedCell {
    fn default() -> Self {
        Self::new()
    }
}
