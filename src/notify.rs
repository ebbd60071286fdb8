//! Cross-Thread Notification
//!
//! A resettable one-shot signal bridging the election dispatch task and
//! caller tasks blocked in a wait.

use std::time::Duration;
use tokio::sync::watch;

/// A resettable one-shot notification.
///
/// `notify` is idempotent and may be called from the dispatch task; `wait`
/// blocks until `notify` has been called at least once since the last
/// `reset`. The signal is level-triggered, so a notify that precedes the
/// wait is not lost.
#[derive(Debug)]
pub struct Notification {
    fired: watch::Sender<bool>,
}

impl Notification {
    /// Create a new, unfired notification
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self { fired }
    }

    /// Fire the notification, releasing all current and future waiters
    pub fn notify(&self) {
        self.fired.send_replace(true);
    }

    /// Clear the signal so the notification can fire again
    pub fn reset(&self) {
        self.fired.send_replace(false);
    }

    /// Check whether the notification has fired, without blocking
    pub fn has_fired(&self) -> bool {
        *self.fired.borrow()
    }

    /// Wait until the notification fires
    pub async fn wait(&self) {
        let mut rx = self.fired.subscribe();
        while !*rx.borrow_and_update() {
            // The sender lives in self, so the channel cannot close under us
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until the notification fires or the timeout elapses.
    ///
    /// Returns true if the notification fired.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_notify_releases_waiter() {
        let notification = Arc::new(Notification::new());
        assert!(!notification.has_fired());

        let waiter = {
            let notification = Arc::clone(&notification);
            tokio::spawn(async move { notification.wait().await })
        };

        notification.notify();
        waiter.await.unwrap();
        assert!(notification.has_fired());
    }

    #[tokio::test]
    async fn test_notify_before_wait_is_not_lost() {
        let notification = Notification::new();
        notification.notify();
        notification.notify(); // idempotent

        // Returns immediately
        assert!(notification.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_timeout_expires() {
        let notification = Notification::new();
        assert!(!notification.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_reset_rearms() {
        let notification = Notification::new();
        notification.notify();
        assert!(notification.has_fired());

        notification.reset();
        assert!(!notification.has_fired());
        assert!(!notification.wait_timeout(Duration::from_millis(10)).await);

        notification.notify();
        assert!(notification.wait_timeout(Duration::from_millis(10)).await);
    }
}
