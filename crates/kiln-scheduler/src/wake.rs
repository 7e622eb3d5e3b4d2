//! Named wake channels.
//!
//! Cross-task signalling goes through these rather than ad-hoc condition
//! pairs. Notifications coalesce: any number of `wake` calls between two
//! waits collapse into a single wakeup.

use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
pub struct WakeChannel {
    notify: Notify,
}

impl WakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the waiter. Callable from sync contexts (e.g. `Drop` impls).
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Wait until woken or until `timeout` elapses. Returns true if woken.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}
