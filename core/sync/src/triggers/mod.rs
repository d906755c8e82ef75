//! Sync triggers.
//!
//! Every trigger funnels into [`crate::manager::SyncManager::perform_sync`];
//! none of them touches the store directly.

mod lifecycle;
mod network;
mod poller;
mod push;

pub use lifecycle::LifecycleWatcher;
pub use network::NetworkWatcher;
pub use poller::Poller;
pub use push::{is_sync_notification, PushListener, PushSetup};

use serde::{Deserialize, Serialize};
use std::fmt;

/// What caused a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    Timer,
    Foreground,
    NetworkReconnect,
    Push,
    Manual,
    Initial,
}

impl fmt::Display for TriggerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerOrigin::Timer => "timer",
            TriggerOrigin::Foreground => "foreground",
            TriggerOrigin::NetworkReconnect => "network",
            TriggerOrigin::Push => "push",
            TriggerOrigin::Manual => "manual",
            TriggerOrigin::Initial => "initial",
        };
        f.write_str(name)
    }
}
