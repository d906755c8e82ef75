//! Application lifecycle trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::manager::{SyncAttempt, SyncManager};
use crate::platform::AppState;
use crate::triggers::{Poller, TriggerOrigin};

/// Reacts to foreground/background transitions.
///
/// Background suspends the poller. Reaching `Active` after a stay in
/// `Background` (directly or through `Inactive`) re-arms it and, outside
/// the debounce window, drops any backoff and syncs at once.
pub struct LifecycleWatcher {
    manager: SyncManager,
    poller: Arc<Poller>,
    debounce: Duration,
    backgrounded: AtomicBool,
    last_foreground_sync: Mutex<Option<Instant>>,
}

impl LifecycleWatcher {
    pub fn new(manager: SyncManager, poller: Arc<Poller>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            manager,
            poller,
            debounce,
            backgrounded: AtomicBool::new(false),
            last_foreground_sync: Mutex::new(None),
        })
    }

    /// Follow `states` until `token` is cancelled or the sender goes away.
    pub fn spawn(
        self: Arc<Self>,
        mut states: watch::Receiver<AppState>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut previous = *states.borrow_and_update();
            if previous == AppState::Background {
                self.backgrounded.store(true, Ordering::SeqCst);
            }
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let next = *states.borrow_and_update();
                self.handle(previous, next);
                previous = next;
            }
        })
    }

    /// Apply one transition. Returns the spawned foreground sync, if any.
    pub fn handle(&self, previous: AppState, next: AppState) -> Option<JoinHandle<SyncAttempt>> {
        if previous == next {
            return None;
        }
        debug!("App state {:?} -> {:?}", previous, next);
        self.manager.note_app_state(next);

        match next {
            AppState::Background => {
                self.backgrounded.store(true, Ordering::SeqCst);
                self.poller.suspend();
                None
            }
            AppState::Active => {
                let returning = self.backgrounded.swap(false, Ordering::SeqCst)
                    || previous == AppState::Background;
                if !returning {
                    return None;
                }
                if !self.debounce_elapsed() {
                    debug!("Foreground sync debounced");
                    self.poller.arm();
                    return None;
                }

                // Reset before arming so the new chain reads the base interval.
                self.manager.reset_backoff();
                self.poller.arm();
                let manager = self.manager.clone();
                Some(tokio::spawn(async move {
                    manager.perform_sync(TriggerOrigin::Foreground).await
                }))
            }
            AppState::Inactive => None,
        }
    }

    /// Record a foreground sync now if the debounce window has passed.
    fn debounce_elapsed(&self) -> bool {
        let mut last = self
            .last_foreground_sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.debounce => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
