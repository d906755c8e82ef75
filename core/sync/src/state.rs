//! Scheduler state and the published status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SyncMode;
use crate::policy::SyncCounters;

/// Two-phase readiness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    /// Local store opened and provisioned.
    pub store_ready: bool,
    /// Remote link established.
    pub link_ready: bool,
}

/// Mutable scheduler state, owned by the sync manager.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_changes: u64,
    pub counters: SyncCounters,
    pub last_error: Option<String>,
    /// `None` when no periodic timer runs (push mode).
    pub current_interval: Option<Duration>,
}

impl SchedulerState {
    /// Fresh state for the given mode.
    pub fn new(mode: SyncMode, base_interval: Duration) -> Self {
        Self {
            current_interval: match mode {
                SyncMode::Polling => Some(base_interval),
                SyncMode::Push => None,
            },
            ..Self::default()
        }
    }

    /// Record a successful attempt.
    pub fn mark_synced(&mut self, changes: u64, at: DateTime<Utc>) {
        self.last_sync_time = Some(at);
        self.last_sync_changes = changes;
        self.counters.record_success(changes);
        self.last_error = None;
    }

    /// Record a failed attempt. Last sync time and change count are kept.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.counters.record_error();
        self.last_error = Some(error.into());
    }
}

/// Read-only status snapshot published to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub mode: SyncMode,
    pub readiness: Readiness,
    pub is_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_changes: u64,
    pub last_error: Option<String>,
    #[serde(serialize_with = "serialize_interval")]
    pub current_interval: Option<Duration>,
    pub consecutive_empty_syncs: u32,
    pub consecutive_sync_errors: u32,
    pub is_background: bool,
    pub network_available: bool,
    /// Phase-1 failure, if any.
    pub init_error: Option<String>,
    /// Phase-2 failure, if any.
    pub link_error: Option<String>,
}

impl SyncStatus {
    /// Initial snapshot before any session starts.
    pub fn initial(mode: SyncMode) -> Self {
        Self {
            mode,
            readiness: Readiness::default(),
            is_syncing: false,
            last_sync_time: None,
            last_sync_changes: 0,
            last_error: None,
            current_interval: None,
            consecutive_empty_syncs: 0,
            consecutive_sync_errors: 0,
            is_background: false,
            network_available: true,
            init_error: None,
            link_error: None,
        }
    }

    /// Copy the scheduler fields from `state`.
    pub(crate) fn apply(&mut self, state: &SchedulerState) {
        self.is_syncing = state.is_syncing;
        self.last_sync_time = state.last_sync_time;
        self.last_sync_changes = state.last_sync_changes;
        self.last_error = state.last_error.clone();
        self.current_interval = state.current_interval;
        self.consecutive_empty_syncs = state.counters.consecutive_empty_syncs;
        self.consecutive_sync_errors = state.counters.consecutive_sync_errors;
    }
}

fn serialize_interval<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}
