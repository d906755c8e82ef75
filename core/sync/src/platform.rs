//! Optional platform capabilities.
//!
//! Each capability exposes a single availability query plus its
//! operations. When the platform lacks one, the composition root injects
//! the matching null object, so call sites only check availability once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use driftsync_common::{Error, Result};

use crate::config::{ConfigStore, MemoryConfigStore};

/// Application lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

/// Notification permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

/// A delivered push notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    /// Raw payload as delivered by the platform.
    pub payload: serde_json::Value,
}

impl PushNotification {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload }
    }
}

/// Fast local connectivity check.
#[async_trait]
pub trait Reachability: Send + Sync {
    fn is_available(&self) -> bool;

    /// `Some(false)` when definitely offline, `None` when unknown.
    async fn check(&self) -> Option<bool>;
}

/// Push notification channel.
#[async_trait]
pub trait PushService: Send + Sync {
    fn is_available(&self) -> bool;

    /// Current permission without prompting.
    async fn permission_status(&self) -> PermissionStatus;

    /// Show the platform permission prompt.
    async fn request_permission(&self) -> Result<PermissionStatus>;

    /// Register this device for remote notifications.
    async fn register_device(&self) -> Result<()>;

    /// Foreground deliveries.
    async fn subscribe(&self) -> Result<mpsc::Receiver<PushNotification>>;
}

/// Headless background task registration.
#[async_trait]
pub trait BackgroundTaskService: Send + Sync {
    fn is_available(&self) -> bool;

    async fn register(&self) -> Result<()>;

    async fn unregister(&self) -> Result<()>;
}

/// Application-supplied step shown before the platform permission prompt.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    /// Return `false` to skip the platform prompt (treated as denial).
    async fn confirm(&self) -> bool;
}

/// Null reachability: connectivity is always unknown.
pub struct NoReachability;

#[async_trait]
impl Reachability for NoReachability {
    fn is_available(&self) -> bool {
        false
    }

    async fn check(&self) -> Option<bool> {
        None
    }
}

/// Null push service.
pub struct NoPush;

#[async_trait]
impl PushService for NoPush {
    fn is_available(&self) -> bool {
        false
    }

    async fn permission_status(&self) -> PermissionStatus {
        PermissionStatus::Denied
    }

    async fn request_permission(&self) -> Result<PermissionStatus> {
        Ok(PermissionStatus::Denied)
    }

    async fn register_device(&self) -> Result<()> {
        Err(Error::Permission("Push notifications unavailable".to_string()))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<PushNotification>> {
        Err(Error::Permission("Push notifications unavailable".to_string()))
    }
}

/// Null background task service.
pub struct NoBackgroundTasks;

#[async_trait]
impl BackgroundTaskService for NoBackgroundTasks {
    fn is_available(&self) -> bool {
        false
    }

    async fn register(&self) -> Result<()> {
        Ok(())
    }

    async fn unregister(&self) -> Result<()> {
        Ok(())
    }
}

/// Platform capabilities injected into the engine.
#[derive(Clone)]
pub struct Platform {
    pub reachability: Arc<dyn Reachability>,
    pub push: Arc<dyn PushService>,
    pub background_tasks: Arc<dyn BackgroundTaskService>,
    pub config_store: Arc<dyn ConfigStore>,
}

impl Platform {
    pub fn with_reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = reachability;
        self
    }

    pub fn with_push(mut self, push: Arc<dyn PushService>) -> Self {
        self.push = push;
        self
    }

    pub fn with_background_tasks(mut self, tasks: Arc<dyn BackgroundTaskService>) -> Self {
        self.background_tasks = tasks;
        self
    }

    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config_store = store;
        self
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            reachability: Arc::new(NoReachability),
            push: Arc::new(NoPush),
            background_tasks: Arc::new(NoBackgroundTasks),
            config_store: Arc::new(MemoryConfigStore::new()),
        }
    }
}
