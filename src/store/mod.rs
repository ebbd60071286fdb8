//! Coordination Store Abstraction
//!
//! Capability interface over an external strongly-consistent key-value
//! service with lease-backed entries and ordered directory watches. The
//! election core depends only on this trait, so any store offering
//! linearizable reads after a successful write, monotonic key ordering, and
//! lease-based expiry can back it.

use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::Result;

mod memory;
pub use memory::MemoryStore;

/// Store-assigned key, strictly increasing within a directory
pub type SequenceKey = u64;

/// Position in the store's global change history
pub type StoreIndex = u64;

/// Opaque token used to refresh or release an entry's lease
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseHandle(pub Uuid);

impl std::fmt::Display for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live entry under an election directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Store-assigned sequence key
    pub key: SequenceKey,
    /// Value supplied at creation time
    pub value: String,
}

/// Full directory listing plus the store index it was taken at
#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    /// Live entries ordered by sequence key ascending
    pub entries: Vec<DirectoryEntry>,
    /// Index to resume watching from
    pub index: StoreIndex,
}

/// A single change to a watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// An entry appeared under the directory
    Added { key: SequenceKey, value: String },
    /// An entry was deleted or its lease expired
    Removed { key: SequenceKey },
}

/// A change event plus the store index it was committed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchItem {
    pub index: StoreIndex,
    pub event: WatchEvent,
}

/// Entry creation result: the assigned sequence key, its lease, and the
/// store index the creation committed at
#[derive(Debug, Clone)]
pub struct CreatedEntry {
    pub key: SequenceKey,
    pub lease: LeaseHandle,
    pub index: StoreIndex,
}

/// Lazy, infinite stream of directory change events.
///
/// Cancelled by dropping the stream. An `Error::HistoryGap` item means the
/// subscriber fell behind the store's retained history and must re-list;
/// no further items follow it.
pub type WatchStream = ReceiverStream<Result<WatchItem>>;

/// Capability contract consumed by the election core.
///
/// One store instance is shared by all elections in a process; logical
/// operations from different elections are multiplexed without
/// interference.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Atomically create an entry under `prefix` with a store-assigned
    /// sequence key and a lease of `ttl`
    async fn create_with_lease(
        &self,
        prefix: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<CreatedEntry>;

    /// Extend a lease. Fails with `LeaseExpired` if the store no longer
    /// holds it.
    async fn refresh_lease(&self, lease: &LeaseHandle, ttl: Duration) -> Result<()>;

    /// Delete an entry. Deleting an entry that no longer exists is not an
    /// error.
    async fn delete(&self, prefix: &str, key: SequenceKey) -> Result<()>;

    /// List the live entries under `prefix`, ordered by sequence key
    async fn list_sorted(&self, prefix: &str) -> Result<DirectorySnapshot>;

    /// Subscribe to changes under `prefix` occurring after `from_index`.
    ///
    /// Fails with `HistoryGap` if `from_index` is older than the store's
    /// retained history; the caller must re-list and subscribe from the
    /// fresh snapshot's index.
    async fn watch(&self, prefix: &str, from_index: StoreIndex) -> Result<WatchStream>;
}
