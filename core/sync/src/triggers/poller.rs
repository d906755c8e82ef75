//! Self-rescheduling polling timer.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SyncMode;
use crate::manager::SyncManager;
use crate::triggers::TriggerOrigin;

/// Timer-driven trigger, active only in polling mode.
///
/// Each cycle waits for the interval published *at that moment*, fires one
/// sync, and starts over. At most one chain runs at a time.
pub struct Poller {
    manager: SyncManager,
    chain: Mutex<Option<CancellationToken>>,
}

impl Poller {
    pub fn new(manager: SyncManager) -> Arc<Self> {
        Arc::new(Self {
            manager,
            chain: Mutex::new(None),
        })
    }

    /// Start a timer chain. No-op when one is already running or the
    /// manager is in push mode. Returns whether a new chain was started.
    pub fn arm(&self) -> bool {
        if self.manager.mode() != SyncMode::Polling {
            return false;
        }

        let mut chain = self.lock_chain();
        if chain.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return false;
        }

        let token = CancellationToken::new();
        *chain = Some(token.clone());
        drop(chain);

        debug!("Poller armed");
        tokio::spawn(run_chain(self.manager.clone(), token));
        true
    }

    /// Stop future timer firings. An attempt already in flight completes.
    pub fn suspend(&self) {
        if let Some(token) = self.lock_chain().take() {
            token.cancel();
            debug!("Poller suspended");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock_chain()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn lock_chain(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.chain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.suspend();
    }
}

async fn run_chain(manager: SyncManager, token: CancellationToken) {
    loop {
        // Read fresh: the previous attempt may have changed it.
        let Some(interval) = manager.current_interval() else {
            break;
        };

        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(interval) => {}
        }

        if manager.mode() != SyncMode::Polling {
            break;
        }
        manager.perform_sync(TriggerOrigin::Timer).await;
    }

    // Left on our own (push mode); let a later arm() start a new chain.
    token.cancel();
    debug!("Poller chain ended");
}
