//! In-Memory Coordination Store
//!
//! A single-process store implementing the full capability contract: lease
//! expiry, ordered watches with a bounded history window, and gap signaling
//! for subscribers that fall behind. Used for deterministic tests and by
//! the local election simulator.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::{
    CoordinationStore, CreatedEntry, DirectoryEntry, DirectorySnapshot, LeaseHandle, SequenceKey,
    StoreIndex, WatchEvent, WatchItem, WatchStream,
};
use crate::error::{Error, Result};

/// Change events retained for late watch subscribers
const HISTORY_WINDOW: usize = 1024;

/// Per-subscriber delivery buffer; a subscriber this far behind is gapped
const WATCH_BUFFER: usize = 256;

/// How often expired leases are reclaimed
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// A live directory entry
struct EntryRecord {
    value: String,
    lease: Uuid,
}

/// A lease granted at entry creation
struct LeaseRecord {
    prefix: String,
    key: SequenceKey,
    expires_at: Instant,
}

/// A registered watch subscriber
struct Watcher {
    prefix: String,
    tx: mpsc::Sender<Result<WatchItem>>,
}

#[derive(Default)]
struct Inner {
    /// Live entries per directory, ordered by sequence key
    dirs: HashMap<String, BTreeMap<SequenceKey, EntryRecord>>,
    /// Outstanding leases by id
    leases: HashMap<Uuid, LeaseRecord>,
    /// Last sequence key handed out
    next_key: SequenceKey,
    /// Index of the most recent change
    index: StoreIndex,
    /// Highest index pruned from the history window
    pruned_through: StoreIndex,
    /// Retained change events: (index, directory, event)
    history: VecDeque<(StoreIndex, String, WatchEvent)>,
    watchers: Vec<Watcher>,
}

/// In-memory coordination store.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create a new empty store and start its lease sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LEASE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let mut inner = inner.lock().await;
                sweep_expired(&mut inner);
            }
        });

        Self { inner }
    }

    /// Force-expire an entry's lease, as if its owner had stalled and the
    /// TTL ran out. Simulation/test control.
    pub async fn expire(&self, prefix: &str, key: SequenceKey) {
        let mut inner = self.inner.lock().await;
        let removed = inner.dirs.get_mut(prefix).and_then(|dir| dir.remove(&key));
        if let Some(record) = removed {
            inner.leases.remove(&record.lease);
            tracing::debug!("Forcing lease expiry for entry {} under {}", key, prefix);
            publish(&mut inner, prefix, WatchEvent::Removed { key });
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove every entry whose lease has run out and notify watchers
fn sweep_expired(inner: &mut Inner) {
    let now = Instant::now();
    let expired: Vec<Uuid> = inner
        .leases
        .iter()
        .filter(|(_, lease)| lease.expires_at <= now)
        .map(|(id, _)| *id)
        .collect();

    for id in expired {
        if let Some(lease) = inner.leases.remove(&id) {
            let removed = inner
                .dirs
                .get_mut(&lease.prefix)
                .and_then(|dir| dir.remove(&lease.key));
            if removed.is_some() {
                tracing::debug!(
                    "Lease {} expired, reclaiming entry {} under {}",
                    id,
                    lease.key,
                    lease.prefix
                );
                publish(inner, &lease.prefix, WatchEvent::Removed { key: lease.key });
            }
        }
    }
}

/// Record a change and fan it out to subscribers of the directory.
///
/// A subscriber whose buffer is full receives a terminal `HistoryGap` item
/// once its channel drains and is dropped from the registry.
fn publish(inner: &mut Inner, prefix: &str, event: WatchEvent) {
    inner.index += 1;
    inner
        .history
        .push_back((inner.index, prefix.to_string(), event.clone()));
    while inner.history.len() > HISTORY_WINDOW {
        if let Some((idx, _, _)) = inner.history.pop_front() {
            inner.pruned_through = idx;
        }
    }

    let item = WatchItem {
        index: inner.index,
        event,
    };
    let gap_index = inner.index;
    inner.watchers.retain_mut(|watcher| {
        if watcher.prefix != prefix {
            return true;
        }
        match watcher.tx.try_send(Ok(item.clone())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let tx = watcher.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(Err(Error::HistoryGap(gap_index))).await;
                });
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    });
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_with_lease(
        &self,
        prefix: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<CreatedEntry> {
        let mut inner = self.inner.lock().await;

        inner.next_key += 1;
        let key = inner.next_key;
        let lease_id = Uuid::new_v4();

        inner.dirs.entry(prefix.to_string()).or_default().insert(
            key,
            EntryRecord {
                value: value.to_string(),
                lease: lease_id,
            },
        );
        inner.leases.insert(
            lease_id,
            LeaseRecord {
                prefix: prefix.to_string(),
                key,
                expires_at: Instant::now() + ttl,
            },
        );

        publish(
            &mut inner,
            prefix,
            WatchEvent::Added {
                key,
                value: value.to_string(),
            },
        );

        Ok(CreatedEntry {
            key,
            lease: LeaseHandle(lease_id),
            index: inner.index,
        })
    }

    async fn refresh_lease(&self, lease: &LeaseHandle, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.leases.get_mut(&lease.0) {
            Some(record) => {
                record.expires_at = Instant::now() + ttl;
                Ok(())
            }
            None => Err(Error::LeaseExpired(lease.to_string())),
        }
    }

    async fn delete(&self, prefix: &str, key: SequenceKey) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let removed = inner.dirs.get_mut(prefix).and_then(|dir| dir.remove(&key));
        if let Some(record) = removed {
            inner.leases.remove(&record.lease);
            publish(&mut inner, prefix, WatchEvent::Removed { key });
        }
        Ok(())
    }

    async fn list_sorted(&self, prefix: &str) -> Result<DirectorySnapshot> {
        let inner = self.inner.lock().await;
        let entries = inner
            .dirs
            .get(prefix)
            .map(|dir| {
                dir.iter()
                    .map(|(key, record)| DirectoryEntry {
                        key: *key,
                        value: record.value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(DirectorySnapshot {
            entries,
            index: inner.index,
        })
    }

    async fn watch(&self, prefix: &str, from_index: StoreIndex) -> Result<WatchStream> {
        let mut inner = self.inner.lock().await;

        if from_index < inner.pruned_through {
            return Err(Error::HistoryGap(inner.pruned_through));
        }

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        for (idx, dir, event) in inner.history.iter() {
            if *idx <= from_index || dir != prefix {
                continue;
            }
            let item = WatchItem {
                index: *idx,
                event: event.clone(),
            };
            if tx.try_send(Ok(item)).is_err() {
                return Err(Error::HistoryGap(*idx));
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(ReceiverStream::new(rx))
    }
}
