//! Background execution context.
//!
//! Handles a push wake-up when no foreground engine is running: open the
//! store from persisted configuration, run one delegated-retry attempt,
//! report the change manifest, close the store. The store is closed on
//! every path that opened it, including a failing or panicking completion
//! handler.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use driftsync_store::{ChangeObserver, RowChange, Store};

use crate::config::{ConfigStore, SessionConfig};
use crate::executor::SyncExecutor;
use crate::init::Initializer;
use crate::platform::PushNotification;
use crate::registry::{ChangeManifest, SyncHooks};
use crate::triggers::is_sync_notification;

/// What a background run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundRun {
    /// Not a sync notification.
    Ignored,
    /// Handed to the live foreground engine.
    Delegated,
    /// One attempt ran to completion.
    Completed { changes: u64, rows: usize },
    /// Logged and abandoned.
    Failed(String),
}

/// Cold-start capable single-attempt runner.
pub struct BackgroundContext {
    initializer: Initializer,
    config_store: Arc<dyn ConfigStore>,
    hooks: Arc<SyncHooks>,
}

impl BackgroundContext {
    pub fn new(
        initializer: Initializer,
        config_store: Arc<dyn ConfigStore>,
        hooks: Arc<SyncHooks>,
    ) -> Self {
        Self {
            initializer,
            config_store,
            hooks,
        }
    }

    /// Handle one wake-up.
    pub async fn run_once(&self, notification: &PushNotification) -> BackgroundRun {
        let persisted = self.config_store.load().await;
        let marker = match &persisted {
            Ok(Some(config)) => config.sync.push_marker.clone(),
            _ => Default::default(),
        };
        if !is_sync_notification(&notification.payload, &marker) {
            debug!("Background wake-up is not a sync notification");
            return BackgroundRun::Ignored;
        }

        if let Some(delegate) = self.hooks.foreground.get() {
            debug!("Foreground engine is live; delegating");
            delegate(notification.clone()).await;
            return BackgroundRun::Delegated;
        }

        let config = match persisted {
            Ok(Some(config)) => config,
            Ok(None) => return failed("no persisted configuration"),
            Err(e) => return failed(format!("loading persisted configuration: {}", e)),
        };

        let outcome = match self.initializer.initialize(&config).await {
            Ok(outcome) => outcome,
            Err(e) => return failed(format!("store initialization: {}", e)),
        };
        let store = outcome.store;

        let run = if outcome.link_ready {
            let run = self.sync_and_report(store.as_ref(), &config).await;
            if let Err(e) = self.initializer.link().terminate(store.as_ref()).await {
                debug!("Terminating link: {}", e);
            }
            run
        } else {
            failed(format!(
                "remote link: {}",
                outcome.link_error.as_deref().unwrap_or("no remote configured")
            ))
        };

        if let Err(e) = store.close().await {
            warn!("Closing background store: {}", e);
        }
        run
    }

    async fn sync_and_report(&self, store: &dyn Store, config: &SessionConfig) -> BackgroundRun {
        let rows: Arc<Mutex<Vec<RowChange>>> = Arc::new(Mutex::new(Vec::new()));
        let collector = rows.clone();
        let observer: ChangeObserver = Arc::new(move |change: RowChange| {
            if let Ok(mut rows) = collector.lock() {
                rows.push(change);
            }
        });

        store.observe_changes(Some(observer));
        let result = SyncExecutor::new(config.sync.background_options())
            .attempt(store)
            .await;
        store.observe_changes(None);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return failed(format!("sync attempt: {}", e)),
        };

        let manifest = ChangeManifest {
            changes: outcome.changes,
            rows: rows.lock().map(|r| r.clone()).unwrap_or_default(),
        };
        let row_count = manifest.rows.len();
        info!(
            "Background sync applied {} changes ({} rows observed)",
            manifest.changes, row_count
        );

        if let Some(handler) = self.hooks.completion.get() {
            let call = AssertUnwindSafe(async move { handler(manifest).await }).catch_unwind();
            match call.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background completion handler failed: {}", e),
                Err(_) => error!("Background completion handler panicked"),
            }
        }

        BackgroundRun::Completed {
            changes: outcome.changes,
            rows: row_count,
        }
    }
}

fn failed(reason: impl Into<String>) -> BackgroundRun {
    let reason = reason.into();
    warn!("Background sync abandoned: {}", reason);
    BackgroundRun::Failed(reason)
}
