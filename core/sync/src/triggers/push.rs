//! Push notification trigger.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ListeningScope, PushMarker};
use crate::manager::{SyncAttempt, SyncManager};
use crate::platform::{
    AppState, BackgroundTaskService, PermissionStatus, PushNotification, PushService,
};
use crate::registry::SyncHooks;
use crate::triggers::TriggerOrigin;

/// Fields that may carry the marker one level down, either as an object or
/// as JSON-encoded text.
const NESTED_FIELDS: [&str; 2] = ["data", "body"];

/// Whether `payload` is a "data changed" notification.
///
/// The marker is accepted at the top level, inside a `data` object, or
/// inside a `data`/`body` field holding JSON text. Delivery paths differ in
/// which shape they produce.
pub fn is_sync_notification(payload: &Value, marker: &PushMarker) -> bool {
    if carries_marker(payload, marker) {
        return true;
    }

    NESTED_FIELDS.iter().any(|field| match payload.get(field) {
        Some(nested @ Value::Object(_)) => *field == "data" && carries_marker(nested, marker),
        Some(Value::String(text)) => serde_json::from_str::<Value>(text)
            .map(|nested| carries_marker(&nested, marker))
            .unwrap_or(false),
        _ => false,
    })
}

fn carries_marker(value: &Value, marker: &PushMarker) -> bool {
    value.get(&marker.key).and_then(Value::as_str) == Some(marker.value.as_str())
}

/// Result of push setup.
pub enum PushSetup {
    /// Registered; foreground deliveries arrive on `notifications`.
    Listening {
        notifications: mpsc::Receiver<PushNotification>,
        /// Background delivery is handled too.
        background: bool,
    },
    /// Push cannot be used; the scheduler should poll instead.
    Fallback { reason: String },
}

/// Push-driven trigger.
pub struct PushListener {
    manager: SyncManager,
    push: Arc<dyn PushService>,
    background_tasks: Arc<dyn BackgroundTaskService>,
    hooks: Arc<SyncHooks>,
    marker: PushMarker,
    scope: ListeningScope,
}

impl PushListener {
    pub fn new(
        manager: SyncManager,
        push: Arc<dyn PushService>,
        background_tasks: Arc<dyn BackgroundTaskService>,
        hooks: Arc<SyncHooks>,
        marker: PushMarker,
        scope: ListeningScope,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            push,
            background_tasks,
            hooks,
            marker,
            scope,
        })
    }

    /// Acquire permission, register the device and, for the `Always`
    /// scope, the background task.
    ///
    /// Never errors: every failure becomes [`PushSetup::Fallback`], except a
    /// missing background capability, which only narrows the scope.
    pub async fn setup(&self) -> PushSetup {
        if !self.push.is_available() {
            return fallback("push notifications are not available on this platform");
        }

        match self.acquire_permission().await {
            PermissionStatus::Granted => {}
            status => return fallback(format!("notification permission {:?}", status)),
        }

        if let Err(e) = self.push.register_device().await {
            return fallback(format!("device registration failed: {}", e));
        }

        let notifications = match self.push.subscribe().await {
            Ok(rx) => rx,
            Err(e) => return fallback(format!("subscribing to notifications failed: {}", e)),
        };

        let background = match self.scope {
            ListeningScope::Foreground => false,
            ListeningScope::Always if !self.background_tasks.is_available() => {
                warn!("Background tasks unavailable; handling push in the foreground only");
                false
            }
            ListeningScope::Always => match self.background_tasks.register().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "Background task registration failed, foreground only: {}",
                        e
                    );
                    false
                }
            },
        };

        info!("Push listener registered (background: {})", background);
        PushSetup::Listening {
            notifications,
            background,
        }
    }

    async fn acquire_permission(&self) -> PermissionStatus {
        match self.push.permission_status().await {
            PermissionStatus::Undetermined => {}
            status => return status,
        }

        if let Some(prompt) = self.hooks.permission_prompt.get() {
            if !prompt.confirm().await {
                debug!("Permission prompt declined by the application");
                return PermissionStatus::Denied;
            }
        }

        match self.push.request_permission().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Permission request failed: {}", e);
                PermissionStatus::Denied
            }
        }
    }

    /// Consume foreground deliveries until cancelled or the channel closes.
    pub fn spawn(
        self: Arc<Self>,
        mut notifications: mpsc::Receiver<PushNotification>,
        app_state: watch::Receiver<AppState>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = token.cancelled() => break,
                    received = notifications.recv() => match received {
                        Some(n) => n,
                        None => break,
                    },
                };
                let state = *app_state.borrow();
                self.handle(&notification, state).await;
            }
            debug!("Push listener stopped");
        })
    }

    /// Sync for a marked notification received while active.
    pub async fn handle(
        &self,
        notification: &PushNotification,
        app_state: AppState,
    ) -> Option<SyncAttempt> {
        if !is_sync_notification(&notification.payload, &self.marker) {
            debug!("Ignoring unrelated notification");
            return None;
        }
        if app_state != AppState::Active {
            debug!("Sync notification while {:?}; left to the background context", app_state);
            return None;
        }
        Some(self.manager.perform_sync(TriggerOrigin::Push).await)
    }
}

fn fallback(reason: impl Into<String>) -> PushSetup {
    let reason = reason.into();
    warn!("Push unavailable, falling back to polling: {}", reason);
    PushSetup::Fallback { reason }
}
