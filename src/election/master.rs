//! Election State Machine
//!
//! The public-facing election object. All mastership decisions are made by
//! a single dispatch task per election that owns the mutable state and
//! consumes directory-view updates in order; caller tasks interact through
//! message passing for mutations and shared watch state for queries, so the
//! transition path takes no lock.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::observer::{DirectoryObserver, DirectoryView};
use super::proposal::{CandidacyEntry, CandidacyMeta, ProposalManager};
use super::ElectionState;
use crate::config::ElectionConfig;
use crate::error::{Error, Result};
use crate::notify::Notification;
use crate::store::CoordinationStore;

/// Mutating request sent from caller tasks to the dispatch task
enum Command {
    Start { ack: oneshot::Sender<Result<()>> },
    Stop { ack: oneshot::Sender<Result<()>> },
}

/// What woke the dispatch loop
enum Wakeup {
    Command(Option<Command>),
    View(Option<DirectoryView>),
}

/// One process's participation in an election directory.
///
/// Cloning yields another handle to the same election. The participation
/// is withdrawn when the last handle is dropped, or earlier via
/// [`stop_election`](MasterElection::stop_election); an abnormal process
/// exit is covered by the store reclaiming the candidacy lease.
#[derive(Clone)]
pub struct MasterElection {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ElectionState>,
    master: watch::Receiver<Option<String>>,
    became_master: Arc<Notification>,
    stopped: Arc<Notification>,
}

impl MasterElection {
    /// Create a new election participant.
    ///
    /// No candidacy is registered until `start_election` is called. `owner`
    /// should be stable across restarts of the same logical participant.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        directory: impl Into<String>,
        owner: impl Into<String>,
        config: ElectionConfig,
    ) -> Self {
        let directory = directory.into();
        let owner = owner.into();

        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(ElectionState::Idle);
        let (master_tx, master_rx) = watch::channel(None);
        let became_master = Arc::new(Notification::new());
        let stopped = Arc::new(Notification::new());

        let task = ElectionTask {
            proposals: ProposalManager::new(
                Arc::clone(&store),
                directory.clone(),
                owner.clone(),
                &config,
            ),
            store,
            directory,
            owner,
            state_tx,
            master_tx,
            became_master: Arc::clone(&became_master),
            stopped: Arc::clone(&stopped),
            entry: None,
            keepalive: None,
            observer: None,
            view_rx: None,
        };
        tokio::spawn(task.run(commands_rx));

        Self {
            commands: commands_tx,
            state: state_rx,
            master: master_rx,
            became_master,
            stopped,
        }
    }

    /// Begin competing for mastership.
    ///
    /// Registers a candidacy entry and starts observing the directory.
    /// Fails with `AlreadyStarted` unless the election is idle.
    pub async fn start_election(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { ack: tx })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Withdraw from the election.
    ///
    /// Blocks until the candidacy entry is released or the withdraw timeout
    /// elapses (the store-side lease self-expires in that case). Once this
    /// returns, `is_master` is false and no further mastership
    /// notifications fire until a fresh `start_election`. Fails with
    /// `NotStarted` if the election is idle.
    pub async fn stop_election(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { ack: tx })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Whether this process currently holds mastership.
    ///
    /// Non-blocking and callable from any thread; reflects the last applied
    /// directory view, which trails the store by at most the watch
    /// propagation delay.
    pub fn is_master(&self) -> bool {
        matches!(*self.state.borrow(), ElectionState::Master)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ElectionState {
        *self.state.borrow()
    }

    /// Owner identifier of the current master, if the last applied view
    /// has one
    pub fn current_master(&self) -> Option<String> {
        self.master.borrow().clone()
    }

    /// Block until this process becomes master.
    ///
    /// Returns immediately if already master. Returns `Err(Stopped)` if the
    /// election is stopped while waiting, and `Err(NotStarted)` if called
    /// while not participating at all.
    pub async fn wait_to_become_master(&self) -> Result<()> {
        match self.state() {
            ElectionState::Idle => return Err(Error::NotStarted),
            ElectionState::Master => return Ok(()),
            _ => {}
        }

        tokio::select! {
            biased;
            _ = self.stopped.wait() => Err(Error::Stopped),
            _ = self.became_master.wait() => Ok(()),
        }
    }
}

/// Dispatch task owning all mutable election state
struct ElectionTask {
    proposals: ProposalManager,
    store: Arc<dyn CoordinationStore>,
    directory: String,
    owner: String,
    state_tx: watch::Sender<ElectionState>,
    master_tx: watch::Sender<Option<String>>,
    became_master: Arc<Notification>,
    stopped: Arc<Notification>,
    entry: Option<CandidacyEntry>,
    keepalive: Option<JoinHandle<()>>,
    observer: Option<JoinHandle<()>>,
    view_rx: Option<mpsc::Receiver<DirectoryView>>,
}

impl ElectionTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let wakeup = tokio::select! {
                command = commands.recv() => Wakeup::Command(command),
                view = Self::next_view(&mut self.view_rx) => Wakeup::View(view),
            };

            match wakeup {
                Wakeup::Command(Some(Command::Start { ack })) => {
                    let result = self.handle_start().await;
                    let _ = ack.send(result);
                }
                Wakeup::Command(Some(Command::Stop { ack })) => {
                    let result = self.handle_stop().await;
                    let _ = ack.send(result);
                }
                Wakeup::Command(None) => {
                    // Last handle dropped
                    self.shutdown().await;
                    return;
                }
                Wakeup::View(Some(view)) => self.handle_view(view).await,
                Wakeup::View(None) => self.view_rx = None,
            }
        }
    }

    async fn next_view(rx: &mut Option<mpsc::Receiver<DirectoryView>>) -> Option<DirectoryView> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    fn state(&self) -> ElectionState {
        *self.state_tx.borrow()
    }

    async fn handle_start(&mut self) -> Result<()> {
        if self.state() != ElectionState::Idle {
            return Err(Error::AlreadyStarted);
        }

        self.became_master.reset();
        self.stopped.reset();

        let entry = self.proposals.propose().await?;
        self.keepalive = Some(self.proposals.spawn_keepalive(&entry));

        let (updates_tx, updates_rx) = mpsc::channel(64);
        self.view_rx = Some(updates_rx);
        self.observer = Some(
            DirectoryObserver::new(Arc::clone(&self.store), self.directory.clone(), updates_tx)
                .spawn(),
        );

        tracing::info!(
            "{} joined election in {} with key {}",
            self.owner,
            self.directory,
            entry.key
        );
        self.entry = Some(entry);
        self.state_tx.send_replace(ElectionState::Electing);
        Ok(())
    }

    async fn handle_stop(&mut self) -> Result<()> {
        if self.state() == ElectionState::Idle {
            return Err(Error::NotStarted);
        }

        self.state_tx.send_replace(ElectionState::Stopping);
        self.stopped.notify();

        // Cut off observation first so no view update can race the
        // withdrawal back into mastership.
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
        self.view_rx = None;
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }

        if let Some(entry) = self.entry.take() {
            if let Err(e) = self.proposals.withdraw(&entry).await {
                // The local transition to Idle is unconditional; the lease
                // reclaims the entry if the store never confirmed.
                tracing::warn!(
                    "Withdrawal of key {} from {} not confirmed, lease will expire on its own: {}",
                    entry.key,
                    self.directory,
                    e
                );
            }
        }

        self.master_tx.send_replace(None);
        self.became_master.reset();
        self.state_tx.send_replace(ElectionState::Idle);
        tracing::info!("{} left election in {}", self.owner, self.directory);
        Ok(())
    }

    /// The single authoritative transition function: consumes one directory
    /// view and reconciles local mastership with it.
    async fn handle_view(&mut self, view: DirectoryView) {
        self.publish_master(&view);

        let state = self.state();
        if !matches!(state, ElectionState::Electing | ElectionState::Master) {
            return;
        }
        let Some(entry) = &self.entry else { return };

        if view.contains(entry.key) {
            if view.min_key() == Some(entry.key) {
                if state != ElectionState::Master {
                    tracing::info!(
                        "{} is now master of {} (key {})",
                        self.owner,
                        self.directory,
                        entry.key
                    );
                    self.state_tx.send_replace(ElectionState::Master);
                    self.became_master.notify();
                }
            } else if state == ElectionState::Master {
                // A smaller key surfaced, so an earlier candidacy had been
                // missing from our view. Step down and keep contending.
                tracing::warn!(
                    "{} lost mastership of {} to an earlier candidacy",
                    self.owner,
                    self.directory
                );
                self.became_master.reset();
                self.state_tx.send_replace(ElectionState::Electing);
            }
        } else if view.index() >= entry.created_index {
            // An up-to-date view no longer carries our entry: the lease was
            // lost. Believing ourselves master on a dead entry is the one
            // unacceptable outcome, so re-enter the election with a fresh
            // candidacy.
            if state == ElectionState::Master {
                self.became_master.reset();
                self.state_tx.send_replace(ElectionState::Electing);
            }
            tracing::warn!(
                "Candidacy of {} in {} vanished (key {}), re-proposing",
                self.owner,
                self.directory,
                entry.key
            );
            if let Some(keepalive) = self.keepalive.take() {
                keepalive.abort();
            }
            self.entry = None;

            match self.proposals.propose().await {
                Ok(entry) => {
                    self.keepalive = Some(self.proposals.spawn_keepalive(&entry));
                    self.entry = Some(entry);
                }
                Err(e) => {
                    tracing::error!(
                        "Re-proposal for {} in {} failed: {}",
                        self.owner,
                        self.directory,
                        e
                    );
                }
            }
        }
        // Views older than our entry's creation cannot judge it; skip.
    }

    /// Derive the current master's owner id from the view and publish it
    fn publish_master(&self, view: &DirectoryView) {
        let master = view.master_value().map(|value| {
            serde_json::from_str::<CandidacyMeta>(value)
                .map(|meta| meta.owner)
                .unwrap_or_else(|_| value.to_string())
        });
        self.master_tx.send_replace(master);
    }

    /// Best-effort withdrawal when the last handle is dropped
    async fn shutdown(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        if let Some(entry) = self.entry.take() {
            if let Err(e) = self.proposals.withdraw(&entry).await {
                tracing::debug!("Withdrawal during shutdown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        CreatedEntry, DirectorySnapshot, LeaseHandle, MemoryStore, SequenceKey, StoreIndex,
        WatchStream,
    };
    use std::time::Duration;

    const DIR: &str = "/election/master-test";
    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> ElectionConfig {
        ElectionConfig {
            keepalive_interval_secs: 1,
            withdraw_timeout_ms: 2000,
        }
    }

    fn election(store: &MemoryStore, owner: &str) -> MasterElection {
        MasterElection::new(Arc::new(store.clone()), DIR, owner, fast_config())
    }

    async fn wait_master(election: &MasterElection) {
        tokio::time::timeout(WAIT, election.wait_to_become_master())
            .await
            .expect("mastership wait timed out")
            .expect("mastership wait failed");
    }

    /// Poll until `predicate` holds or the deadline passes
    async fn eventually(mut predicate: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !predicate() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_single_instance_becomes_master() {
        let store = MemoryStore::new();
        let one = election(&store, "1");
        assert!(!one.is_master());
        assert_eq!(one.state(), ElectionState::Idle);

        one.start_election().await.unwrap();
        wait_master(&one).await;
        assert!(one.is_master());
        assert_eq!(one.state(), ElectionState::Master);
        assert_eq!(one.current_master().as_deref(), Some("1"));

        one.stop_election().await.unwrap();
        assert!(!one.is_master());
        assert_eq!(one.state(), ElectionState::Idle);
        assert_eq!(one.current_master(), None);

        let snapshot = store.list_sorted(DIR).await.unwrap();
        assert!(snapshot.entries.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop_misuse() {
        let store = MemoryStore::new();
        let one = election(&store, "1");

        assert!(matches!(
            one.stop_election().await,
            Err(Error::NotStarted)
        ));

        one.start_election().await.unwrap();
        assert!(matches!(
            one.start_election().await,
            Err(Error::AlreadyStarted)
        ));

        one.stop_election().await.unwrap();
        assert!(matches!(
            one.stop_election().await,
            Err(Error::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_multi_instance_failover_ordering() {
        let store = MemoryStore::new();
        let one = election(&store, "1");
        let two = election(&store, "2");
        let three = election(&store, "3");

        // Start order fixes the sequence-key order
        one.start_election().await.unwrap();
        wait_master(&one).await;
        two.start_election().await.unwrap();
        three.start_election().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(one.is_master());
        assert!(!two.is_master());
        assert!(!three.is_master());
        assert_eq!(two.current_master().as_deref(), Some("1"));

        // Next-lowest key wins, not the newest
        one.stop_election().await.unwrap();
        assert!(!one.is_master());
        wait_master(&two).await;
        assert!(!three.is_master());

        two.stop_election().await.unwrap();
        wait_master(&three).await;

        three.stop_election().await.unwrap();
        assert!(!three.is_master());
        let snapshot = store.list_sorted(DIR).await.unwrap();
        assert!(snapshot.entries.is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_after_stop() {
        let store = MemoryStore::new();
        let one = election(&store, "1");

        for _ in 0..3 {
            one.start_election().await.unwrap();
            wait_master(&one).await;
            one.stop_election().await.unwrap();
            assert!(!one.is_master());
        }
    }

    #[tokio::test]
    async fn test_stop_releases_pending_waiter() {
        let store = MemoryStore::new();
        let one = election(&store, "1");
        let two = election(&store, "2");

        one.start_election().await.unwrap();
        wait_master(&one).await;
        two.start_election().await.unwrap();

        let waiter = {
            let two = two.clone();
            tokio::spawn(async move { two.wait_to_become_master().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        two.stop_election().await.unwrap();
        let outcome = tokio::time::timeout(WAIT, waiter)
            .await
            .expect("waiter should be released by stop")
            .unwrap();
        assert!(matches!(outcome, Err(Error::Stopped)));

        one.stop_election().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_while_idle_fails_fast() {
        let store = MemoryStore::new();
        let one = election(&store, "1");

        assert!(matches!(
            one.wait_to_become_master().await,
            Err(Error::NotStarted)
        ));

        one.start_election().await.unwrap();
        wait_master(&one).await;
        one.stop_election().await.unwrap();

        // After a stop the wait must not spuriously succeed
        assert!(matches!(
            one.wait_to_become_master().await,
            Err(Error::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_wait_when_already_master_returns_immediately() {
        let store = MemoryStore::new();
        let one = election(&store, "1");
        one.start_election().await.unwrap();
        wait_master(&one).await;

        // No suspension: already master
        one.wait_to_become_master().await.unwrap();
        one.stop_election().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_lease_triggers_reproposal_and_failover() {
        let store = MemoryStore::new();
        let one = election(&store, "1");
        let two = election(&store, "2");

        one.start_election().await.unwrap();
        wait_master(&one).await;
        two.start_election().await.unwrap();

        let snapshot = store.list_sorted(DIR).await.unwrap();
        let lowest = snapshot.entries[0].key;

        // The master's entry vanishes, as if its keepalive had stalled
        store.expire(DIR, lowest).await;

        wait_master(&two).await;
        eventually(|| !one.is_master() && one.state() == ElectionState::Electing).await;

        // A fresh candidacy for "1" is registered behind "2"
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let snapshot = store.list_sorted(DIR).await.unwrap();
            if snapshot.entries.len() == 2 {
                assert!(snapshot.entries.iter().all(|e| e.key > lowest));
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "re-proposal did not land in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Failover continues to follow key order
        two.stop_election().await.unwrap();
        wait_master(&one).await;

        one.stop_election().await.unwrap();
    }

    /// Delegates to a MemoryStore but never answers deletions
    struct HangingDeleteStore {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl CoordinationStore for HangingDeleteStore {
        async fn create_with_lease(
            &self,
            prefix: &str,
            value: &str,
            ttl: Duration,
        ) -> crate::Result<CreatedEntry> {
            self.inner.create_with_lease(prefix, value, ttl).await
        }

        async fn refresh_lease(&self, lease: &LeaseHandle, ttl: Duration) -> crate::Result<()> {
            self.inner.refresh_lease(lease, ttl).await
        }

        async fn delete(&self, _prefix: &str, _key: SequenceKey) -> crate::Result<()> {
            std::future::pending().await
        }

        async fn list_sorted(&self, prefix: &str) -> crate::Result<DirectorySnapshot> {
            self.inner.list_sorted(prefix).await
        }

        async fn watch(&self, prefix: &str, from_index: StoreIndex) -> crate::Result<WatchStream> {
            self.inner.watch(prefix, from_index).await
        }
    }

    #[tokio::test]
    async fn test_withdraw_timeout_still_forces_idle() {
        let store = Arc::new(HangingDeleteStore {
            inner: MemoryStore::new(),
        });
        let config = ElectionConfig {
            keepalive_interval_secs: 1,
            withdraw_timeout_ms: 100,
        };
        let one = MasterElection::new(store, DIR, "1", config);

        one.start_election().await.unwrap();
        wait_master(&one).await;

        // The store never confirms the deletion; stop must still return
        // with local state reset
        one.stop_election().await.unwrap();
        assert!(!one.is_master());
        assert_eq!(one.state(), ElectionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_election_mania() {
        const CONTENDERS: usize = 20;
        const ROUNDS: usize = 20;

        let store = MemoryStore::new();
        let elections: Arc<Vec<MasterElection>> = Arc::new(
            (0..CONTENDERS)
                .map(|i| election(&store, &i.to_string()))
                .collect(),
        );

        let mut contenders = Vec::new();
        for i in 0..CONTENDERS {
            let elections = Arc::clone(&elections);
            contenders.push(tokio::spawn(async move {
                let mut mastership_count = 0;
                for _ in 0..ROUNDS {
                    let election = &elections[i];
                    election.start_election().await.unwrap();
                    election.wait_to_become_master().await.unwrap();
                    mastership_count += 1;

                    // There could be no master at all right after an
                    // update, but there must never be more than one, from
                    // any contender's point of view
                    let masters = elections.iter().filter(|e| e.is_master()).count();
                    assert!(
                        masters <= 1,
                        "contender {} observed {} simultaneous masters",
                        i,
                        masters
                    );

                    election.stop_election().await.unwrap();
                }
                mastership_count
            }));
        }

        for (i, contender) in contenders.into_iter().enumerate() {
            let count = contender.await.unwrap();
            assert_eq!(count, ROUNDS, "contender {} missed rounds", i);
        }

        let snapshot = store.list_sorted(DIR).await.unwrap();
        assert!(snapshot.entries.is_empty());
    }
}
