//! Scheduler and session configuration, and its durable persistence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use driftsync_common::{Error, RemoteTarget, Result};
use driftsync_store::StoreConfig;

use crate::executor::{ExecutorOptions, RetryMode};
use crate::policy::BackoffConfig;

/// How the foreground scheduler learns that remote data changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Timer-driven with adaptive interval.
    Polling,
    /// Driven by "data changed" push notifications; no periodic timer.
    Push,
}

/// Which push deliveries are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListeningScope {
    /// Only while the application is in the foreground.
    Foreground,
    /// Also while backgrounded or terminated, through the background context.
    Always,
}

/// Marker identifying "data changed" push payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMarker {
    pub key: String,
    pub value: String,
}

impl Default for PushMarker {
    fn default() -> Self {
        Self {
            key: "artifactURI".to_string(),
            value: "https://sqlite.ai".to_string(),
        }
    }
}

/// Configuration for the sync scheduling core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Requested sync mode. Push may fall back to polling at runtime.
    pub mode: SyncMode,
    /// Interval policy configuration.
    pub backoff: BackoffConfig,
    /// Executor options for the foreground context.
    pub foreground: ExecutorOptions,
    /// Executor options for the background context. Always run delegated.
    pub background: ExecutorOptions,
    /// Minimum spacing between foreground-transition syncs.
    #[serde(with = "duration_ms")]
    pub foreground_debounce: Duration,
    /// Delay before the initial sync once the link is ready.
    #[serde(with = "duration_ms")]
    pub initial_sync_delay: Duration,
    /// Run the fast connectivity check before each attempt.
    pub check_connectivity: bool,
    /// Push delivery scope.
    pub listening_scope: ListeningScope,
    /// Push payload marker.
    pub push_marker: PushMarker,
    /// How long teardown waits for an in-flight attempt.
    #[serde(with = "duration_ms")]
    pub teardown_timeout: Duration,
}

impl SyncConfig {
    /// Polling configuration with defaults.
    pub fn polling() -> Self {
        Self::default()
    }

    /// Push configuration with defaults.
    pub fn push(scope: ListeningScope) -> Self {
        Self {
            mode: SyncMode::Push,
            listening_scope: scope,
            ..Self::default()
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// - Invalid backoff configuration
    /// - Executor options with a zero attempt budget
    pub fn validate(&self) -> Result<()> {
        self.backoff.validate()?;
        self.foreground.validate()?;
        self.background.validate()?;
        if self.push_marker.key.is_empty() {
            return Err(Error::InvalidInput(
                "push_marker.key cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Background executor options with delegated retry enforced.
    pub fn background_options(&self) -> ExecutorOptions {
        self.background.clone().with_retry_mode(RetryMode::Delegated)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Polling,
            backoff: BackoffConfig::default(),
            foreground: ExecutorOptions::foreground(),
            background: ExecutorOptions::background(),
            foreground_debounce: Duration::from_millis(2_000),
            initial_sync_delay: Duration::from_millis(250),
            check_connectivity: true,
            listening_scope: ListeningScope::Foreground,
            push_marker: PushMarker::default(),
            teardown_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything needed to rebuild a session from scratch, including from a
/// cold-started process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Local store.
    pub store: StoreConfig,
    /// Remote target; `None` runs local-only.
    #[serde(default)]
    pub remote: Option<RemoteTarget>,
    /// Scheduler configuration.
    #[serde(default)]
    pub sync: SyncConfig,
}

impl SessionConfig {
    /// Create a session configuration.
    pub fn new(store: StoreConfig, remote: Option<RemoteTarget>) -> Self {
        Self {
            store,
            remote,
            sync: SyncConfig::default(),
        }
    }

    /// Set the scheduler configuration.
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Whether moving to `other` requires tearing the session down.
    ///
    /// True when the remote identity (connection, credential, table set)
    /// or the local store location differs.
    pub fn requires_reinit(&self, other: &SessionConfig) -> bool {
        if self.store.driver != other.store.driver || self.store.path != other.store.path {
            return true;
        }
        match (&self.remote, &other.remote) {
            (None, None) => false,
            (Some(a), Some(b)) => !a.same_identity(b),
            _ => true,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Durable storage for the session configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Persist the configuration, replacing any previous one.
    async fn save(&self, config: &SessionConfig) -> Result<()>;

    /// Load the persisted configuration, if any.
    async fn load(&self) -> Result<Option<SessionConfig>>;

    /// Remove the persisted configuration.
    async fn clear(&self) -> Result<()>;
}

/// JSON file backed configuration store.
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    /// Create a store writing to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn save(&self, config: &SessionConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, config.to_json()?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Session configuration persisted to {}", self.path.display());
        Ok(())
    }

    async fn load(&self) -> Result<Option<SessionConfig>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => SessionConfig::from_json(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory configuration store.
#[derive(Default)]
pub struct MemoryConfigStore {
    config: Mutex<Option<SessionConfig>>,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn save(&self, config: &SessionConfig) -> Result<()> {
        let mut slot = self
            .config
            .lock()
            .map_err(|_| Error::Config("Config lock poisoned".to_string()))?;
        *slot = Some(config.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<SessionConfig>> {
        let slot = self
            .config
            .lock()
            .map_err(|_| Error::Config("Config lock poisoned".to_string()))?;
        Ok(slot.clone())
    }

    async fn clear(&self) -> Result<()> {
        let mut slot = self
            .config
            .lock()
            .map_err(|_| Error::Config("Config lock poisoned".to_string()))?;
        *slot = None;
        Ok(())
    }
}

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
