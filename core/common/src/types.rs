//! Types identifying the remote side of a sync session.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret string (API key, access token).
///
/// Zeroized on drop and redacted in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Credential used to authenticate the remote link.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Credential {
    /// No authentication configured.
    #[default]
    None,
    /// Static API key.
    ApiKey(Secret),
    /// Short-lived access token.
    AccessToken(Secret),
}

/// Remote reconciliation target.
///
/// The connection string, credential and table set together form the
/// identity of the target; changing any of them requires a full
/// re-initialization of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    /// Connection string for the remote service.
    pub connection_string: String,
    /// Authentication credential.
    #[serde(default)]
    pub credential: Credential,
    /// Tables enrolled in reconciliation.
    pub tables: Vec<String>,
    /// Path of the reconciliation extension, when it must be loaded at runtime.
    #[serde(default)]
    pub extension_path: Option<String>,
}

impl RemoteTarget {
    /// Create a target without credential or extension path.
    pub fn new(connection_string: impl Into<String>, tables: Vec<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            credential: Credential::None,
            tables,
            extension_path: None,
        }
    }

    /// Set the credential.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    /// Set the extension path.
    pub fn with_extension_path(mut self, path: impl Into<String>) -> Self {
        self.extension_path = Some(path.into());
        self
    }

    /// Validate the target.
    ///
    /// # Errors
    /// - Empty connection string
    /// - Empty table set or an empty table name
    pub fn validate(&self) -> crate::Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "Connection string cannot be empty".to_string(),
            ));
        }
        if self.tables.is_empty() {
            return Err(crate::Error::InvalidInput(
                "At least one table must be enrolled".to_string(),
            ));
        }
        if self.tables.iter().any(|t| t.trim().is_empty()) {
            return Err(crate::Error::InvalidInput(
                "Table name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `other` designates the same remote target.
    ///
    /// The table set is compared without regard to order or duplicates.
    pub fn same_identity(&self, other: &RemoteTarget) -> bool {
        self.connection_string == other.connection_string
            && self.credential == other.credential
            && self.table_set() == other.table_set()
    }

    fn table_set(&self) -> BTreeSet<&str> {
        self.tables.iter().map(String::as_str).collect()
    }
}
