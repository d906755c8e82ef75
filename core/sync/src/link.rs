//! Remote link: phase-2 initialization against the reconciliation extension.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use driftsync_common::{Credential, Error, RemoteTarget, Result};
use driftsync_store::{SqlValue, Store};

/// Major protocol version this crate speaks.
pub const SUPPORTED_MAJOR_VERSION: u64 = 0;

/// Oldest minor version with the network primitives we call.
pub const MIN_MINOR_VERSION: u64 = 9;

/// Establishes and tears down the link between a store and the remote.
#[async_trait]
pub trait RemoteLink: Send + Sync {
    /// Configure the store for reconciliation with `target`.
    ///
    /// # Errors
    /// - `Error::Link` when any step fails; the store stays usable locally
    async fn connect(&self, store: &dyn Store, target: &RemoteTarget) -> Result<()>;

    /// Release remote resources held by the store. Best-effort.
    async fn terminate(&self, store: &dyn Store) -> Result<()>;
}

/// Extension version as reported by `cloudsync_version()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ProtocolVersion {
    /// Parse `major.minor[.patch]`. Trailing pre-release tags are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let core = text
            .trim()
            .split(|c: char| c == '-' || c == '+')
            .next()
            .unwrap_or_default();
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(Error::Link(format!("Malformed extension version: {:?}", text)));
        }

        let number = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| Error::Link(format!("Malformed extension version: {:?}", text)))
        };

        Ok(Self {
            major: number(parts[0])?,
            minor: number(parts[1])?,
            patch: parts.get(2).map(|p| number(*p)).transpose()?.unwrap_or(0),
        })
    }

    /// Whether this version can be driven by [`CloudLink`].
    pub fn is_supported(&self) -> bool {
        self.major == SUPPORTED_MAJOR_VERSION && self.minor >= MIN_MINOR_VERSION
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Link driven entirely through SQL calls into the CloudSync extension.
#[derive(Debug, Clone, Default)]
pub struct CloudLink;

impl CloudLink {
    pub fn new() -> Self {
        Self
    }

    async fn step(store: &dyn Store, what: &str, sql: &str, params: Vec<SqlValue>) -> Result<SqlValue> {
        let result = store
            .execute(sql, params)
            .await
            .map_err(|e| Error::Link(format!("{} failed: {}", what, e)))?;
        Ok(result.first_value().cloned().unwrap_or(SqlValue::Null))
    }

    async fn check_version(store: &dyn Store) -> Result<ProtocolVersion> {
        let value = Self::step(store, "Version query", "SELECT cloudsync_version()", Vec::new()).await?;
        let SqlValue::Text(text) = &value else {
            return Err(Error::Link(format!(
                "Extension returned a non-text version: {:?}",
                value
            )));
        };

        let version = ProtocolVersion::parse(text)?;
        if !version.is_supported() {
            return Err(Error::Link(format!(
                "Extension version {} is not supported (need {}.{}.x or newer)",
                version, SUPPORTED_MAJOR_VERSION, MIN_MINOR_VERSION
            )));
        }
        Ok(version)
    }
}

#[async_trait]
impl RemoteLink for CloudLink {
    async fn connect(&self, store: &dyn Store, target: &RemoteTarget) -> Result<()> {
        target
            .validate()
            .map_err(|e| Error::Link(format!("Invalid remote target: {}", e)))?;

        if let Some(path) = &target.extension_path {
            store
                .load_extension(Path::new(path))
                .await
                .map_err(|e| Error::Link(format!("Loading extension {} failed: {}", path, e)))?;
            debug!("Loaded extension from {}", path);
        }

        let version = Self::check_version(store).await?;
        debug!("Extension version {}", version);

        for table in &target.tables {
            Self::step(
                store,
                &format!("Enabling table '{}'", table),
                "SELECT cloudsync_init(?1)",
                vec![SqlValue::from(table.as_str())],
            )
            .await?;
        }

        Self::step(
            store,
            "Network init",
            "SELECT cloudsync_network_init(?1)",
            vec![SqlValue::from(target.connection_string.as_str())],
        )
        .await?;

        match &target.credential {
            Credential::ApiKey(key) => {
                Self::step(
                    store,
                    "Setting API key",
                    "SELECT cloudsync_network_set_apikey(?1)",
                    vec![SqlValue::from(key.expose())],
                )
                .await?;
            }
            Credential::AccessToken(token) => {
                Self::step(
                    store,
                    "Setting access token",
                    "SELECT cloudsync_network_set_token(?1)",
                    vec![SqlValue::from(token.expose())],
                )
                .await?;
            }
            Credential::None => {
                warn!("Remote link configured without credentials");
            }
        }

        info!(
            "Remote link ready ({} tables, extension {})",
            target.tables.len(),
            version
        );
        Ok(())
    }

    async fn terminate(&self, store: &dyn Store) -> Result<()> {
        if store.is_closed() {
            return Ok(());
        }
        Self::step(store, "Terminate", "SELECT cloudsync_terminate()", Vec::new())
            .await
            .map(|_| ())
    }
}
