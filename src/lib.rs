//! Wolfpack - Distributed Master Election
//!
//! A coordination-service-backed master election library: any number of
//! processes sharing a logical election directory agree, at any instant, on
//! at most one of them being master, with automatic failover when the
//! current master dies, stalls, or steps down, and a safe re-join path for
//! a process that previously held and released mastership.
//!
//! # Architecture
//!
//! Each participant registers an ephemeral, lease-backed candidacy entry
//! under a shared directory on the coordination store; the entry holding
//! the lowest store-assigned sequence key designates the master. A single
//! dispatch task per election consumes ordered directory updates and drives
//! every state transition, so mastership decisions are serialized without
//! locking.
//!
//! # Features
//!
//! - At most one master per directory outside the lease-bounded handover
//!   window
//! - Automatic failover and re-proposal when a candidacy lease is lost
//! - Keepalive sized so the lease tolerates two missed refreshes
//! - Watch gap recovery by full directory re-read
//! - Pluggable coordination store with a complete in-memory implementation

pub mod config;
pub mod election;
pub mod error;
pub mod notify;
pub mod store;

pub use config::WolfpackConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ElectionConfig, WolfpackConfig};
    pub use crate::election::{ElectionState, MasterElection};
    pub use crate::error::{Error, Result};
    pub use crate::notify::Notification;
    pub use crate::store::{CoordinationStore, MemoryStore};
}
