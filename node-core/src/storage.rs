//! Durable key/value storage seam.
//!
//! Writes are staged and only become visible once [`KeyValueStore::commit`]
//! succeeds, matching the commit semantics of flash-backed namespaces. A power
//! loss between staging and commit leaves the previously committed values
//! untouched.

use core::fmt;

use heapless::{LinearMap, String, Vec};

/// Longest key accepted by the store (flash namespaces cap keys at 15 bytes).
pub const MAX_KEY_LEN: usize = 15;
/// Longest value accepted by the store.
pub const MAX_VALUE_LEN: usize = 96;

/// Failures surfaced by a durable store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The backing medium could not be opened or accessed.
    Unavailable,
    /// A stored value could not be decoded.
    Corrupt,
    /// No room remains for another key.
    Full,
    KeyTooLong,
    ValueTooLarge,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable => f.write_str("storage unavailable"),
            StoreError::Corrupt => f.write_str("stored value corrupt"),
            StoreError::Full => f.write_str("storage full"),
            StoreError::KeyTooLong => write!(f, "key longer than {MAX_KEY_LEN} bytes"),
            StoreError::ValueTooLarge => write!(f, "value larger than {MAX_VALUE_LEN} bytes"),
        }
    }
}

/// Durable, commit-based key/value storage provided by the platform.
pub trait KeyValueStore {
    /// Copies the committed value for `key` into `buffer` and returns its length,
    /// or `None` when the key has never been committed.
    fn read(&self, key: &str, buffer: &mut [u8]) -> Result<Option<usize>, StoreError>;

    /// Stages `value` under `key`; invisible to readers until [`commit`](Self::commit).
    fn stage(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Stages removal of every key; takes effect at the next commit.
    fn erase_all(&mut self) -> Result<(), StoreError>;

    /// Atomically applies every staged change.
    fn commit(&mut self) -> Result<(), StoreError>;
}

/// Reads `key` as UTF-8 text into `buffer`.
pub fn read_str<'b, S>(store: &S, key: &str, buffer: &'b mut [u8]) -> Result<Option<&'b str>, StoreError>
where
    S: KeyValueStore + ?Sized,
{
    match store.read(key, buffer)? {
        Some(len) => {
            let bytes = buffer.get(..len).ok_or(StoreError::Corrupt)?;
            core::str::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::Corrupt)
        }
        None => Ok(None),
    }
}

type Key = String<MAX_KEY_LEN>;
type Value = Vec<u8, MAX_VALUE_LEN>;

/// Bounded RAM-backed store used by tests and as a volatile fallback.
///
/// [`MemoryStore::power_loss`] discards staged writes the way an interrupted
/// flash commit would.
#[derive(Clone, Debug)]
pub struct MemoryStore<const ENTRIES: usize = 16> {
    committed: LinearMap<Key, Value, ENTRIES>,
    staged: LinearMap<Key, Value, ENTRIES>,
    erase_pending: bool,
    available: bool,
    commits: u32,
}

impl<const ENTRIES: usize> MemoryStore<ENTRIES> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            committed: LinearMap::new(),
            staged: LinearMap::new(),
            erase_pending: false,
            available: true,
            commits: 0,
        }
    }

    /// Drops every staged change, keeping only committed state.
    pub fn power_loss(&mut self) {
        self.staged.clear();
        self.erase_pending = false;
    }

    /// Makes every subsequent operation fail with [`StoreError::Unavailable`].
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    /// Number of successful commits since creation.
    #[must_use]
    pub fn commit_count(&self) -> u32 {
        self.commits
    }

    /// Number of committed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Committed state with the staged batch applied.
    fn merged(&self) -> Result<LinearMap<Key, Value, ENTRIES>, StoreError> {
        self.ensure_available()?;
        let mut next = if self.erase_pending {
            LinearMap::new()
        } else {
            self.committed.clone()
        };
        for (key, value) in &self.staged {
            next.insert(key.clone(), value.clone())
                .map_err(|_| StoreError::Full)?;
        }
        Ok(next)
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

impl<const ENTRIES: usize> Default for MemoryStore<ENTRIES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const ENTRIES: usize> KeyValueStore for MemoryStore<ENTRIES> {
    fn read(&self, key: &str, buffer: &mut [u8]) -> Result<Option<usize>, StoreError> {
        self.ensure_available()?;
        let Some(value) = self.committed.iter().find(|(k, _)| k.as_str() == key).map(|(_, v)| v)
        else {
            return Ok(None);
        };

        let target = buffer
            .get_mut(..value.len())
            .ok_or(StoreError::ValueTooLarge)?;
        target.copy_from_slice(value);
        Ok(Some(value.len()))
    }

    fn stage(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.ensure_available()?;
        let key = Key::try_from(key).map_err(|_| StoreError::KeyTooLong)?;
        let value = Value::from_slice(value).map_err(|_| StoreError::ValueTooLarge)?;
        self.staged
            .insert(key, value)
            .map(|_| ())
            .map_err(|_| StoreError::Full)
    }

    fn erase_all(&mut self) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.staged.clear();
        self.erase_pending = true;
        Ok(())
    }

    /// A failed commit drops the staged batch; committed state is unchanged.
    fn commit(&mut self) -> Result<(), StoreError> {
        let result = self.merged();
        self.staged.clear();
        self.erase_pending = false;

        self.committed = result?;
        self.commits = self.commits.wrapping_add(1);
        Ok(())
    }
}
