//! Directory Observation
//!
//! Maintains an ordered view of the live candidacy entries under an
//! election directory and delivers every change to the election task.
//! Strictly read-only with respect to the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use super::backoff::Backoff;
use crate::error::Error;
use crate::store::{CoordinationStore, DirectorySnapshot, SequenceKey, StoreIndex, WatchEvent};

/// Ordered snapshot of the live entries in an election directory.
///
/// The entry with the lowest sequence key, if any, designates the master.
/// Carries the store index it is current through, so consumers can tell a
/// stale view from one that postdates their own writes.
#[derive(Debug, Clone, Default)]
pub struct DirectoryView {
    entries: BTreeMap<SequenceKey, String>,
    index: StoreIndex,
}

impl DirectoryView {
    /// Build a view from a full directory listing
    pub fn from_snapshot(snapshot: &DirectorySnapshot) -> Self {
        Self {
            entries: snapshot
                .entries
                .iter()
                .map(|entry| (entry.key, entry.value.clone()))
                .collect(),
            index: snapshot.index,
        }
    }

    /// Apply a single change event committed at `index`
    pub fn apply(&mut self, index: StoreIndex, event: &WatchEvent) {
        self.index = index;
        match event {
            WatchEvent::Added { key, value } => {
                self.entries.insert(*key, value.clone());
            }
            WatchEvent::Removed { key } => {
                self.entries.remove(key);
            }
        }
    }

    /// Store index this view is current through
    pub fn index(&self) -> StoreIndex {
        self.index
    }

    /// Lowest live sequence key
    pub fn min_key(&self) -> Option<SequenceKey> {
        self.entries.keys().next().copied()
    }

    /// Value of the entry currently designating the master
    pub fn master_value(&self) -> Option<&str> {
        self.entries.values().next().map(String::as_str)
    }

    /// Whether `key` is live in this view
    pub fn contains(&self, key: SequenceKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Watches one election directory and streams view updates to the election
/// task.
pub struct DirectoryObserver {
    store: Arc<dyn CoordinationStore>,
    directory: String,
    updates: mpsc::Sender<DirectoryView>,
}

impl DirectoryObserver {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        directory: String,
        updates: mpsc::Sender<DirectoryView>,
    ) -> Self {
        Self {
            store,
            directory,
            updates,
        }
    }

    /// Spawn the watch loop.
    ///
    /// Cancelled by aborting the returned handle or dropping the update
    /// receiver.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut backoff = Backoff::new();

        loop {
            // Seed the view with a full read, then follow the change stream
            // from the snapshot's index.
            let snapshot = match self.store.list_sorted(&self.directory).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Listing {} failed: {}", self.directory, e);
                    backoff.sleep().await;
                    continue;
                }
            };

            let mut view = DirectoryView::from_snapshot(&snapshot);
            if self.updates.send(view.clone()).await.is_err() {
                return;
            }

            let mut stream = match self.store.watch(&self.directory, snapshot.index).await {
                Ok(stream) => stream,
                Err(Error::HistoryGap(_)) => continue, // re-list immediately
                Err(e) => {
                    tracing::warn!("Watch subscription on {} failed: {}", self.directory, e);
                    backoff.sleep().await;
                    continue;
                }
            };
            backoff.reset();

            loop {
                match stream.next().await {
                    Some(Ok(item)) => {
                        view.apply(item.index, &item.event);
                        if self.updates.send(view.clone()).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(Error::HistoryGap(index))) => {
                        // An incremental picture past a gap cannot be
                        // trusted; start over from a full read.
                        tracing::debug!(
                            "Watch on {} fell behind at index {}, re-reading",
                            self.directory,
                            index
                        );
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Watch on {} failed: {}", self.directory, e);
                        backoff.sleep().await;
                        break;
                    }
                    None => {
                        tracing::warn!("Watch stream on {} closed, resubscribing", self.directory);
                        backoff.sleep().await;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const DIR: &str = "/election/observer-test";
    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_view_tracks_directory_changes() {
        let store = MemoryStore::new();
        let first = store.create_with_lease(DIR, "a", TTL).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let observer = DirectoryObserver::new(Arc::new(store.clone()), DIR.to_string(), tx);
        let handle = observer.spawn();

        // Seeded view contains the pre-existing entry
        let view = rx.recv().await.unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view.min_key(), Some(first.key));
        assert!(view.index() >= first.index);

        let second = store.create_with_lease(DIR, "b", TTL).await.unwrap();
        let view = rx.recv().await.unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.min_key(), Some(first.key));
        assert!(view.contains(second.key));

        store.delete(DIR, first.key).await.unwrap();
        let view = rx.recv().await.unwrap();
        assert_eq!(view.min_key(), Some(second.key));
        assert_eq!(view.master_value(), Some("b"));

        handle.abort();
    }

    #[tokio::test]
    async fn test_view_apply_and_queries() {
        let mut view = DirectoryView::default();
        assert!(view.is_empty());
        assert_eq!(view.min_key(), None);
        assert_eq!(view.master_value(), None);

        view.apply(
            1,
            &WatchEvent::Added {
                key: 7,
                value: "b".to_string(),
            },
        );
        view.apply(
            2,
            &WatchEvent::Added {
                key: 3,
                value: "a".to_string(),
            },
        );
        assert_eq!(view.min_key(), Some(3));
        assert_eq!(view.master_value(), Some("a"));
        assert_eq!(view.index(), 2);

        view.apply(3, &WatchEvent::Removed { key: 3 });
        assert_eq!(view.min_key(), Some(7));

        // Removing an unknown key is harmless
        view.apply(4, &WatchEvent::Removed { key: 99 });
        assert_eq!(view.len(), 1);
    }

    #[tokio::test]
    async fn test_gap_recovery_relists() {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::channel(16);
        let observer = DirectoryObserver::new(Arc::new(store.clone()), DIR.to_string(), tx);
        let handle = observer.spawn();

        let view = rx.recv().await.unwrap();
        assert!(view.is_empty());

        // Swamp the watch stream without draining it: the slow subscriber
        // is gapped and must recover by re-listing.
        let mut keys = Vec::new();
        for _ in 0..600 {
            let created = store.create_with_lease(DIR, "x", TTL).await.unwrap();
            keys.push(created.key);
        }
        for key in &keys[..300] {
            store.delete(DIR, *key).await.unwrap();
        }

        // Drain updates until the view converges on the store's state
        let expected: Vec<_> = keys[300..].to_vec();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let view = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("observer should converge before the deadline")
                .expect("observer should keep delivering views");
            if view.len() == expected.len() && expected.iter().all(|k| view.contains(*k)) {
                break;
            }
        }

        handle.abort();
    }
}
