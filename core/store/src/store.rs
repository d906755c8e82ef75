//! Store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use driftsync_common::{Error, Result};

/// A single SQL value, independent of the database driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

/// Rows returned by a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Result rows, each a list of column values.
    pub rows: Vec<Vec<SqlValue>>,
}

impl QueryResult {
    /// A result with no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single-row, single-column integer result.
    pub fn integer(value: i64) -> Self {
        Self {
            rows: vec![vec![SqlValue::Integer(value)]],
        }
    }

    /// A single-row, single-column text result.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            rows: vec![vec![SqlValue::Text(value.into())]],
        }
    }

    /// The first column of the first row, if any.
    pub fn first_value(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|row| row.first())
    }
}

/// Kind of row-level modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChange {
    /// Table the row belongs to.
    pub table: String,
    /// Modification kind.
    pub action: ChangeAction,
    /// Row id of the affected row.
    pub rowid: i64,
}

/// Callback receiving row-level change notifications.
pub type ChangeObserver = Arc<dyn Fn(RowChange) + Send + Sync>;

/// Embedded database handle.
///
/// A store is exclusively owned by one execution context. All operations
/// are async; implementations backed by a blocking driver must move the
/// work off the calling task.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get the driver name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Execute a single statement and return its rows.
    ///
    /// # Errors
    /// - Store closed
    /// - Statement failed (including errors raised by SQL functions)
    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult>;

    /// Execute several `;`-separated statements without parameters.
    async fn execute_batch(&self, sql: &str) -> Result<()>;

    /// Execute a single statement inside its own transaction.
    ///
    /// The transaction is committed when the statement succeeds and rolled
    /// back otherwise.
    async fn execute_in_transaction(&self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult>;

    /// Load a runtime extension into the store.
    async fn load_extension(&self, path: &Path) -> Result<()>;

    /// Install or remove the row-level change observer.
    ///
    /// At most one observer is installed; a new one replaces the previous.
    fn observe_changes(&self, observer: Option<ChangeObserver>);

    /// Close the store. Later operations fail with a store error.
    async fn close(&self) -> Result<()>;

    /// Whether the store has been closed.
    fn is_closed(&self) -> bool;
}

/// Error returned by operations on a closed store.
pub(crate) fn closed_error() -> Error {
    Error::Store("Store is closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_value() {
        assert_eq!(QueryResult::empty().first_value(), None);
        assert_eq!(
            QueryResult::integer(7).first_value(),
            Some(&SqlValue::Integer(7))
        );
    }

    #[test]
    fn test_row_change_serialization() {
        let change = RowChange {
            table: "todos".to_string(),
            action: ChangeAction::Update,
            rowid: 42,
        };

        let json = serde_json::to_string(&change).unwrap();
        assert!(json.contains("\"update\""));
        let restored: RowChange = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, change);
    }
}
