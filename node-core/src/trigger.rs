//! Durable single-slot record of a pending firmware update.
//!
//! The record lives in its own store so that clearing configuration never
//! touches it. It is armed before any transfer begins and disarmed strictly
//! before an attempt starts, so an interrupted attempt is never repeated.

use core::fmt;

use heapless::String;
use log::{info, warn};

use crate::storage::{KeyValueStore, StoreError, read_str};

pub const PENDING_KEY: &str = "pending";
pub const FILENAME_KEY: &str = "filename";
pub const MAX_FILENAME_LEN: usize = 64;

/// Bounded firmware image name relative to the update base URL.
pub type Filename = String<MAX_FILENAME_LEN>;

/// Snapshot of the durable trigger.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriggerRecord {
    pub pending: bool,
    pub filename: Filename,
}

impl TriggerRecord {
    #[must_use]
    pub fn idle() -> Self {
        Self::default()
    }
}

/// Failures while changing the trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerError {
    FilenameTooLong,
    Store(StoreError),
}

impl From<StoreError> for TriggerError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerError::FilenameTooLong => {
                write!(f, "filename longer than {MAX_FILENAME_LEN} bytes")
            }
            TriggerError::Store(err) => write!(f, "trigger storage: {err}"),
        }
    }
}

/// Durable "update pending for filename X" flag.
pub struct PersistentTrigger<S> {
    store: S,
}

impl<S> PersistentTrigger<S> {
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> PersistentTrigger<S>
where
    S: KeyValueStore,
{
    /// Durably records that `filename` must be attempted at the next opportunity.
    ///
    /// An empty filename means "wait for a pushed image".
    pub fn arm(&mut self, filename: &str) -> Result<(), TriggerError> {
        if filename.len() > MAX_FILENAME_LEN {
            return Err(TriggerError::FilenameTooLong);
        }
        self.write(true, filename)?;
        info!("update trigger armed for {filename:?}");
        Ok(())
    }

    /// Durably clears the trigger. Idempotent.
    pub fn disarm(&mut self) -> Result<(), TriggerError> {
        self.write(false, "")?;
        info!("update trigger disarmed");
        Ok(())
    }

    /// Reads the committed record; storage failures read as "not pending".
    #[must_use]
    pub fn peek(&self) -> TriggerRecord {
        match self.try_peek() {
            Ok(record) => record,
            Err(err) => {
                warn!("update trigger unreadable ({err}); treating as idle");
                TriggerRecord::idle()
            }
        }
    }

    fn try_peek(&self) -> Result<TriggerRecord, StoreError> {
        let mut buffer = [0u8; MAX_FILENAME_LEN];
        let pending = matches!(read_str(&self.store, PENDING_KEY, &mut buffer)?, Some("1"));
        if !pending {
            return Ok(TriggerRecord::idle());
        }

        let mut filename = Filename::new();
        if let Some(stored) = read_str(&self.store, FILENAME_KEY, &mut buffer)? {
            filename.push_str(stored).map_err(|_| StoreError::Corrupt)?;
        }
        Ok(TriggerRecord { pending, filename })
    }

    fn write(&mut self, pending: bool, filename: &str) -> Result<(), StoreError> {
        self.store
            .stage(PENDING_KEY, if pending { b"1" } else { b"0" })?;
        self.store.stage(FILENAME_KEY, filename.as_bytes())?;
        self.store.commit()
    }
}
