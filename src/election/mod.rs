//! Master Election
//!
//! Elects at most one master among the processes sharing an election
//! directory on a coordination store, with automatic failover when the
//! current master dies, stalls, or steps down.
//!
//! Each participant registers an ephemeral, lease-backed candidacy entry;
//! the entry holding the lowest store-assigned sequence key designates the
//! master. Participants watch the directory and promote or demote
//! themselves as the ordered set of live entries changes.

mod backoff;
mod master;
mod observer;
mod proposal;

pub use master::MasterElection;
pub use observer::{DirectoryObserver, DirectoryView};
pub use proposal::{CandidacyEntry, CandidacyMeta, ProposalManager};

/// Election lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Not participating
    Idle,
    /// Candidacy registered, observing the directory
    Electing,
    /// This process holds the lowest live sequence key
    Master,
    /// Withdrawal in progress
    Stopping,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Idle => write!(f, "IDLE"),
            ElectionState::Electing => write!(f, "ELECTING"),
            ElectionState::Master => write!(f, "MASTER"),
            ElectionState::Stopping => write!(f, "STOPPING"),
        }
    }
}
