//! Per-sender-signature mutual exclusion.
//!
//! Two deposits carrying the same signature would otherwise race on the one
//! pledge they share. Whoever settles a pledge (matching, the timeout sweep)
//! holds the signature's lock from the pledge lookup until its transaction
//! commits. Different signatures never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Above this many tracked signatures, idle entries are dropped on the next
/// acquisition.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct SignatureLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SignatureLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `sender_sig`. Released on drop.
    pub async fn acquire(&self, sender_sig: &str) -> OwnedMutexGuard<()> {
        if self.inner.len() > PRUNE_THRESHOLD {
            self.prune();
        }
        let lock = self
            .inner
            .entry(sender_sig.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        debug!(sender_sig, "Waiting for signature lock");
        lock.lock_owned().await
    }

    /// Forget signatures nobody holds or waits on.
    pub fn prune(&self) {
        self.inner.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}
