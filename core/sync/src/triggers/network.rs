//! Connectivity trigger.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::manager::{SyncAttempt, SyncManager};
use crate::platform::AppState;
use crate::triggers::TriggerOrigin;

/// Syncs when the device comes back online while the app is active.
pub struct NetworkWatcher {
    manager: SyncManager,
}

impl NetworkWatcher {
    pub fn new(manager: SyncManager) -> Arc<Self> {
        Arc::new(Self { manager })
    }

    pub fn spawn(
        self: Arc<Self>,
        mut network: watch::Receiver<bool>,
        app_state: watch::Receiver<AppState>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut previous = *network.borrow_and_update();
            self.manager.note_network(previous);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = network.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let online = *network.borrow_and_update();
                let state = *app_state.borrow();
                self.handle(previous, online, state);
                previous = online;
            }
        })
    }

    /// Apply one connectivity transition. Returns the spawned sync, if any.
    pub fn handle(
        &self,
        was_online: bool,
        online: bool,
        app_state: AppState,
    ) -> Option<JoinHandle<SyncAttempt>> {
        self.manager.note_network(online);
        if was_online || !online {
            return None;
        }
        if app_state != AppState::Active {
            debug!("Back online while {:?}; not syncing", app_state);
            return None;
        }

        debug!("Back online, syncing");
        let manager = self.manager.clone();
        Some(tokio::spawn(async move {
            manager.perform_sync(TriggerOrigin::NetworkReconnect).await
        }))
    }
}
