//! Driftsync scheduling core
//!
//! Decides when a local-first store reconciles with its remote:
//! - Adaptive polling interval with idle and error backoff
//! - Single-flight sync attempts shared by every trigger
//! - Lifecycle, connectivity and push notification triggers
//! - Two-phase initialization (local store, then remote link)
//! - Cold-start background execution for push wake-ups

pub mod background;
pub mod config;
pub mod engine;
pub mod executor;
pub mod init;
pub mod link;
pub mod manager;
pub mod platform;
pub mod policy;
pub mod registry;
pub mod state;
pub mod triggers;

#[cfg(test)]
mod testing;

// Re-export main types
pub use background::{BackgroundContext, BackgroundRun};
pub use config::{
    ConfigStore, JsonFileConfigStore, ListeningScope, MemoryConfigStore, PushMarker,
    SessionConfig, SyncConfig, SyncMode,
};
pub use engine::SyncEngine;
pub use executor::{ExecutorOptions, RetryMode, SyncExecutor, SyncOutcome};
pub use init::{InitOutcome, Initializer};
pub use link::{CloudLink, ProtocolVersion, RemoteLink};
pub use manager::{SkipReason, StatusChannels, SyncAttempt, SyncCompleted, SyncManager};
pub use platform::{
    AppState, BackgroundTaskService, NoBackgroundTasks, NoPush, NoReachability,
    PermissionPrompt, PermissionStatus, Platform, PushNotification, PushService, Reachability,
};
pub use policy::{next_interval, BackoffConfig, SyncCounters};
pub use registry::{ChangeManifest, CompletionHandler, ForegroundDelegate, Slot, SyncHooks};
pub use state::{Readiness, SchedulerState, SyncStatus};
pub use triggers::{is_sync_notification, TriggerOrigin};
