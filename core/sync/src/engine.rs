//! Sync engine: composition root for the foreground context.
//!
//! Owns one session at a time. A session is the initialized store, its
//! [`SyncManager`] and the trigger tasks feeding it. Changing the remote
//! identity tears the session down and starts a new one; status
//! subscriptions stay valid across sessions.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use driftsync_common::Result;
use driftsync_store::{create_default_registry, StoreRegistry};

use crate::background::BackgroundContext;
use crate::config::{SessionConfig, SyncMode};
use crate::init::Initializer;
use crate::link::{CloudLink, RemoteLink};
use crate::manager::{
    SkipReason, StatusChannels, SyncAttempt, SyncCompleted, SyncManager,
};
use crate::platform::{AppState, Platform, PushNotification};
use crate::registry::{ForegroundDelegate, SyncHooks};
use crate::state::SyncStatus;
use crate::triggers::{
    LifecycleWatcher, NetworkWatcher, Poller, PushListener, PushSetup, TriggerOrigin,
};

struct Session {
    id: Uuid,
    config: SessionConfig,
    manager: SyncManager,
    poller: Arc<Poller>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Foreground sync engine.
pub struct SyncEngine {
    platform: Platform,
    hooks: Arc<SyncHooks>,
    initializer: Initializer,
    channels: StatusChannels,
    app_state: watch::Sender<AppState>,
    network: watch::Sender<bool>,
    session: Mutex<Option<Session>>,
}

impl SyncEngine {
    /// Create an engine. Nothing runs until [`SyncEngine::start`].
    pub fn new(
        platform: Platform,
        hooks: Arc<SyncHooks>,
        registry: Arc<StoreRegistry>,
        link: Arc<dyn RemoteLink>,
    ) -> Self {
        let (app_state, _) = watch::channel(AppState::Active);
        let (network, _) = watch::channel(true);

        Self {
            platform,
            hooks,
            initializer: Initializer::new(registry, link),
            channels: StatusChannels::new(SyncMode::Polling),
            app_state,
            network,
            session: Mutex::new(None),
        }
    }

    /// Engine with the built-in store drivers and the CloudSync link.
    pub fn with_defaults(platform: Platform, hooks: Arc<SyncHooks>) -> Self {
        Self::new(
            platform,
            hooks,
            Arc::new(create_default_registry()),
            Arc::new(CloudLink::new()),
        )
    }

    /// Initialize a session and start its triggers, replacing any running
    /// session.
    ///
    /// # Errors
    /// - `Error::InvalidInput` for an invalid sync configuration
    /// - `Error::Store` when phase 1 fails; scheduling stays dormant
    pub async fn start(&self, config: SessionConfig) -> Result<()> {
        config.sync.validate()?;

        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            self.teardown(previous).await;
        }

        let id = Uuid::new_v4();
        info!("Session {} starting ({:?} mode)", id, config.sync.mode);

        let manager = SyncManager::with_channels(
            &config.sync,
            self.platform.reachability.clone(),
            self.channels.clone(),
        );
        manager.note_app_state(*self.app_state.borrow());
        manager.note_network(*self.network.borrow());

        let outcome = match self.initializer.initialize(&config).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Session {} failed to initialize: {}", id, e);
                self.channels.record_init_error(e.to_string());
                return Err(e);
            }
        };

        manager.attach_store(outcome.store);
        manager.set_link_ready(outcome.link_ready);
        manager.record_init_errors(None, outcome.link_error);

        // The background context may cold-start later; it needs this first.
        if config.remote.is_some() {
            if let Err(e) = self.platform.config_store.save(&config).await {
                warn!("Persisting session configuration failed: {}", e);
            }
        }

        let mut session = Session {
            id,
            poller: Poller::new(manager.clone()),
            manager,
            token: CancellationToken::new(),
            tasks: Vec::new(),
            config,
        };

        self.spawn_watchers(&mut session);
        self.hooks.foreground.set(foreground_delegate(session.manager.clone()));

        match session.config.sync.mode {
            SyncMode::Polling => {
                if *self.app_state.borrow() != AppState::Background {
                    session.poller.arm();
                }
            }
            SyncMode::Push => self.start_push(&mut session).await,
        }

        if session.manager.link_ready() {
            session
                .tasks
                .push(spawn_initial_sync(&session.manager, &session.config, &session.token));
        }

        info!("Session {} running", session.id);
        *slot = Some(session);
        Ok(())
    }

    /// Apply a new configuration.
    ///
    /// A changed store or remote identity re-initializes from scratch and
    /// returns `true`. Otherwise the persisted copy is refreshed and the
    /// running session is kept.
    pub async fn reconfigure(&self, config: SessionConfig) -> Result<bool> {
        let requires_reinit = {
            let slot = self.session.lock().await;
            match slot.as_ref() {
                None => true,
                Some(session) => session.config.requires_reinit(&config),
            }
        };

        if requires_reinit {
            info!("Remote identity changed; re-initializing");
            self.start(config).await?;
            return Ok(true);
        }

        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_mut() {
            if session.config.sync != config.sync {
                debug!("Sync settings changed; they apply from the next session");
            }
            if config.remote.is_some() {
                self.platform.config_store.save(&config).await?;
            }
            session.config = config;
        }
        Ok(false)
    }

    /// Stop the running session. Persisted configuration is kept for the
    /// background context.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            self.teardown(session).await;
        }
    }

    /// Manual trigger. Same guards as every other trigger.
    pub async fn sync_now(&self) -> SyncAttempt {
        match self.manager().await {
            Some(manager) => manager.perform_sync(TriggerOrigin::Manual).await,
            None => SyncAttempt::Skipped(SkipReason::NoStore),
        }
    }

    /// Report an application lifecycle change.
    pub fn set_app_state(&self, state: AppState) {
        self.app_state.send_replace(state);
    }

    /// Report a connectivity change.
    pub fn set_network_available(&self, available: bool) {
        self.network.send_replace(available);
    }

    pub fn status(&self) -> SyncStatus {
        self.channels.snapshot()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.channels.subscribe()
    }

    /// Events for syncs that applied at least one change.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<SyncCompleted> {
        self.channels.subscribe_completed()
    }

    pub fn hooks(&self) -> &Arc<SyncHooks> {
        &self.hooks
    }

    /// Effective mode of the running session.
    pub async fn mode(&self) -> Option<SyncMode> {
        self.manager().await.map(|m| m.mode())
    }

    /// Background context sharing this engine's drivers, link and hooks.
    pub fn background_context(&self) -> BackgroundContext {
        BackgroundContext::new(
            self.initializer.clone(),
            self.platform.config_store.clone(),
            self.hooks.clone(),
        )
    }

    async fn manager(&self) -> Option<SyncManager> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.manager.clone())
    }

    fn spawn_watchers(&self, session: &mut Session) {
        let lifecycle = LifecycleWatcher::new(
            session.manager.clone(),
            session.poller.clone(),
            session.config.sync.foreground_debounce,
        );
        session
            .tasks
            .push(lifecycle.spawn(self.app_state.subscribe(), session.token.clone()));

        let network = NetworkWatcher::new(session.manager.clone());
        session.tasks.push(network.spawn(
            self.network.subscribe(),
            self.app_state.subscribe(),
            session.token.clone(),
        ));
    }

    async fn start_push(&self, session: &mut Session) {
        let listener = PushListener::new(
            session.manager.clone(),
            self.platform.push.clone(),
            self.platform.background_tasks.clone(),
            self.hooks.clone(),
            session.config.sync.push_marker.clone(),
            session.config.sync.listening_scope,
        );

        match listener.setup().await {
            PushSetup::Listening { notifications, .. } => {
                session.tasks.push(listener.spawn(
                    notifications,
                    self.app_state.subscribe(),
                    session.token.clone(),
                ));
            }
            PushSetup::Fallback { reason } => self.fallback_to_polling(session, &reason).await,
        }
    }

    /// Demote push to polling for the rest of the session: interval back
    /// to base, background task unregistered, poller armed.
    async fn fallback_to_polling(&self, session: &Session, reason: &str) {
        info!("Session {} falling back to polling: {}", session.id, reason);
        session.manager.set_mode(SyncMode::Polling);
        session.manager.reset_backoff();

        if self.platform.background_tasks.is_available() {
            if let Err(e) = self.platform.background_tasks.unregister().await {
                warn!("Unregistering background task failed: {}", e);
            }
        }

        if *self.app_state.borrow() != AppState::Background {
            session.poller.arm();
        }
    }

    /// Best-effort teardown: stop triggers, wait for the in-flight attempt,
    /// then release the link and close the store. Errors are logged.
    async fn teardown(&self, session: Session) {
        debug!("Session {} tearing down", session.id);
        session.token.cancel();
        session.poller.suspend();
        self.hooks.foreground.clear();

        let link_ready = session.manager.link_ready();
        let store = session.manager.detach_store();

        let timeout = session.config.sync.teardown_timeout;
        if !session.manager.wait_idle(timeout).await {
            warn!(
                "Session {}: sync still running after {:?}; closing anyway",
                session.id, timeout
            );
        }

        for task in session.tasks {
            if let Err(e) = task.await {
                debug!("Trigger task ended abnormally: {}", e);
            }
        }

        if let Some(store) = store {
            if link_ready {
                if let Err(e) = self.initializer.link().terminate(store.as_ref()).await {
                    warn!("Terminating remote link failed: {}", e);
                }
            }
            if let Err(e) = store.close().await {
                warn!("Closing store failed: {}", e);
            }
        }
        info!("Session {} stopped", session.id);
    }
}

fn foreground_delegate(manager: SyncManager) -> ForegroundDelegate {
    Arc::new(move |_notification: PushNotification| -> BoxFuture<'static, ()> {
        let manager = manager.clone();
        Box::pin(async move {
            manager.perform_sync(TriggerOrigin::Push).await;
        })
    })
}

/// One sync per session, delayed so observers can subscribe first.
fn spawn_initial_sync(
    manager: &SyncManager,
    config: &SessionConfig,
    token: &CancellationToken,
) -> JoinHandle<()> {
    let manager = manager.clone();
    let token = token.clone();
    let delay: Duration = config.sync.initial_sync_delay;
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = sleep(delay) => {
                manager.perform_sync(TriggerOrigin::Initial).await;
            }
        }
    })
}
