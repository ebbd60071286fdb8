//! Candidacy Proposal Lifecycle
//!
//! Owns the single ephemeral candidacy entry this process contributes to an
//! election directory: creation, periodic lease renewal, and withdrawal.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::backoff::Backoff;
use crate::config::ElectionConfig;
use crate::error::{Error, Result};
use crate::store::{CoordinationStore, LeaseHandle, SequenceKey, StoreIndex};

/// Metadata stored as the candidacy entry's value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidacyMeta {
    /// Stable owner identifier, kept across restarts
    pub owner: String,
    /// Unique per live process instance
    pub instance: Uuid,
    /// When this candidacy was registered
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

/// A live candidacy entry registered with the store
#[derive(Debug, Clone)]
pub struct CandidacyEntry {
    /// Election directory the entry lives under
    pub directory: String,
    /// Owner identifier
    pub owner: String,
    /// Store-assigned sequence key
    pub key: SequenceKey,
    /// Lease backing the entry
    pub lease: LeaseHandle,
    /// Store index the creation committed at; directory views older than
    /// this cannot judge whether the entry is alive
    pub created_index: StoreIndex,
    /// Registration time
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Creates, keeps alive, and withdraws one candidacy entry per active
/// election.
pub struct ProposalManager {
    store: Arc<dyn CoordinationStore>,
    directory: String,
    owner: String,
    instance: Uuid,
    keepalive_interval: Duration,
    lease_ttl: Duration,
    withdraw_timeout: Duration,
}

impl ProposalManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        directory: String,
        owner: String,
        config: &ElectionConfig,
    ) -> Self {
        Self {
            store,
            directory,
            owner,
            instance: Uuid::new_v4(),
            keepalive_interval: config.keepalive_interval(),
            lease_ttl: config.lease_ttl(),
            withdraw_timeout: config.withdraw_timeout(),
        }
    }

    /// Register a fresh candidacy entry.
    ///
    /// Transient store failures are retried with backoff; anything else is
    /// returned to the caller.
    pub async fn propose(&self) -> Result<CandidacyEntry> {
        let meta = CandidacyMeta {
            owner: self.owner.clone(),
            instance: self.instance,
            joined_at: chrono::Utc::now(),
        };
        let value = serde_json::to_string(&meta)?;

        let mut backoff = Backoff::new();
        let created = loop {
            match self
                .store
                .create_with_lease(&self.directory, &value, self.lease_ttl)
                .await
            {
                Ok(created) => break created,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        "Candidacy registration for {} in {} failed, retrying: {}",
                        self.owner,
                        self.directory,
                        e
                    );
                    backoff.sleep().await;
                }
                Err(e) => return Err(e),
            }
        };

        tracing::debug!(
            "Registered candidacy for {} in {} (key {})",
            self.owner,
            self.directory,
            created.key
        );

        Ok(CandidacyEntry {
            directory: self.directory.clone(),
            owner: self.owner.clone(),
            key: created.key,
            lease: created.lease,
            created_index: created.index,
            created_at: meta.joined_at,
        })
    }

    /// Spawn the keepalive task refreshing `entry`'s lease.
    ///
    /// A transient refresh failure is logged and left to the next tick; the
    /// lease TTL tolerates two missed refreshes. A lease-gone answer ends
    /// the task without driving any transition: the directory observer is
    /// the single authoritative signal for a lost entry.
    pub fn spawn_keepalive(&self, entry: &CandidacyEntry) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let lease = entry.lease.clone();
        let owner = entry.owner.clone();
        let key = entry.key;
        let ttl = self.lease_ttl;
        let interval = self.keepalive_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately

            loop {
                ticker.tick().await;
                match store.refresh_lease(&lease, ttl).await {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(
                            "Keepalive refresh for {} (key {}) failed: {}",
                            owner,
                            key,
                            e
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Lease for {} (key {}) is gone, stopping keepalive: {}",
                            owner,
                            key,
                            e
                        );
                        break;
                    }
                }
            }
        })
    }

    /// Withdraw the candidacy entry.
    ///
    /// An entry already removed by the store counts as withdrawn; a store
    /// that does not answer within the withdraw timeout yields
    /// `WithdrawTimeout`.
    pub async fn withdraw(&self, entry: &CandidacyEntry) -> Result<()> {
        match tokio::time::timeout(
            self.withdraw_timeout,
            self.store.delete(&entry.directory, entry.key),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::WithdrawTimeout(self.withdraw_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager(store: &MemoryStore) -> ProposalManager {
        ProposalManager::new(
            Arc::new(store.clone()),
            "/election/proposal-test".to_string(),
            "node-1".to_string(),
            &ElectionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_propose_registers_entry_with_meta() {
        let store = MemoryStore::new();
        let entry = manager(&store).propose().await.unwrap();

        let snapshot = store
            .list_sorted("/election/proposal-test")
            .await
            .unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].key, entry.key);

        let meta: CandidacyMeta = serde_json::from_str(&snapshot.entries[0].value).unwrap();
        assert_eq!(meta.owner, "node-1");
    }

    #[tokio::test]
    async fn test_withdraw_is_idempotent() {
        let store = MemoryStore::new();
        let proposals = manager(&store);
        let entry = proposals.propose().await.unwrap();

        proposals.withdraw(&entry).await.unwrap();
        // Already gone: still success
        proposals.withdraw(&entry).await.unwrap();

        let snapshot = store
            .list_sorted("/election/proposal-test")
            .await
            .unwrap();
        assert!(snapshot.entries.is_empty());
    }

    #[tokio::test]
    async fn test_keepalive_outlives_ttl() {
        let store = MemoryStore::new();
        let mut proposals = manager(&store);
        proposals.keepalive_interval = Duration::from_millis(50);
        proposals.lease_ttl = Duration::from_millis(150);

        let entry = proposals.propose().await.unwrap();
        let keepalive = proposals.spawn_keepalive(&entry);

        // Well past the TTL, the entry survives because it is refreshed
        tokio::time::sleep(Duration::from_millis(500)).await;
        let snapshot = store
            .list_sorted("/election/proposal-test")
            .await
            .unwrap();
        assert_eq!(snapshot.entries.len(), 1);

        keepalive.abort();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let snapshot = store
            .list_sorted("/election/proposal-test")
            .await
            .unwrap();
        assert!(snapshot.entries.is_empty());
    }
}
