//! Retry Backoff
//!
//! Exponential delay with jitter for transient coordination store failures.

use rand::Rng;
use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(5);

/// Exponential backoff with random jitter.
///
/// Jitter keeps a fleet of contenders from retrying against the store in
/// lockstep after a shared outage.
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: INITIAL_DELAY,
        }
    }

    /// Return to the initial delay after a successful operation
    pub fn reset(&mut self) {
        self.current = INITIAL_DELAY;
    }

    /// Sleep for the current delay plus jitter, then double the delay
    pub async fn sleep(&mut self) {
        let jitter_ms = rand::thread_rng().gen_range(0..=self.current.as_millis() as u64 / 4);
        tokio::time::sleep(self.current + Duration::from_millis(jitter_ms)).await;
        self.current = (self.current * 2).min(MAX_DELAY);
    }
}
