//! In-memory scripted store for testing.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::store::{closed_error, ChangeObserver, QueryResult, RowChange, SqlValue, Store};
use driftsync_common::{Error, Result};

/// A statement received by a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub in_transaction: bool,
}

/// Scripted response function.
pub type Responder = Arc<dyn Fn(&Statement) -> Result<QueryResult> + Send + Sync>;

/// Handle used by a responder to emit row changes to the installed observer.
#[derive(Clone, Default)]
pub struct ChangeSink {
    observer: Arc<Mutex<Option<ChangeObserver>>>,
}

impl ChangeSink {
    /// Deliver a change to the current observer, if any.
    pub fn emit(&self, change: RowChange) {
        let observer = self.observer.lock().ok().and_then(|guard| guard.clone());
        if let Some(observer) = observer {
            observer(change);
        }
    }
}

/// In-memory store.
///
/// Records every statement, answers through a scripted responder, and counts
/// `close` calls. Useful for driving the scheduler without a database file.
/// Without a responder every statement returns no rows.
pub struct MemoryStore {
    statements: Mutex<Vec<Statement>>,
    responder: Mutex<Option<Responder>>,
    latency: Mutex<Duration>,
    sink: ChangeSink,
    extensions: Mutex<Vec<String>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    fail_close: AtomicBool,
}

impl MemoryStore {
    /// Create a new store answering every statement with no rows.
    pub fn new() -> Self {
        Self {
            statements: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            sink: ChangeSink::default(),
            extensions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
        }
    }

    /// Create a store with the given responder.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Statement) -> Result<QueryResult> + Send + Sync + 'static,
    {
        let store = Self::new();
        store.set_responder(responder);
        store
    }

    /// Replace the responder.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Statement) -> Result<QueryResult> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.responder.lock() {
            *slot = Some(Arc::new(responder));
        }
    }

    /// Delay every statement by `latency` (uses the tokio clock).
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    /// Make `close` report an error (the store is still marked closed).
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Handle for emitting row changes from a responder.
    pub fn change_sink(&self) -> ChangeSink {
        self.sink.clone()
    }

    /// All statements received so far.
    pub fn statements(&self) -> Vec<Statement> {
        self.statements
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Number of received statements whose SQL contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.sql.contains(needle))
            .count()
    }

    /// Extensions passed to `load_extension`.
    pub fn loaded_extensions(&self) -> Vec<String> {
        self.extensions
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Number of `close` calls.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    async fn run(&self, sql: &str, params: Vec<SqlValue>, in_transaction: bool) -> Result<QueryResult> {
        if self.is_closed() {
            return Err(closed_error());
        }

        let statement = Statement {
            sql: sql.to_string(),
            params,
            in_transaction,
        };
        if let Ok(mut statements) = self.statements.lock() {
            statements.push(statement.clone());
        }

        let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let responder = self.responder.lock().ok().and_then(|r| r.clone());
        match responder {
            Some(responder) => responder(&statement),
            None => Ok(QueryResult::empty()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult> {
        self.run(sql, params, false).await
    }

    async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.run(sql, Vec::new(), false).await.map(|_| ())
    }

    async fn execute_in_transaction(&self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult> {
        self.run(sql, params, true).await
    }

    async fn load_extension(&self, path: &Path) -> Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        if let Ok(mut extensions) = self.extensions.lock() {
            extensions.push(path.display().to_string());
        }
        Ok(())
    }

    fn observe_changes(&self, observer: Option<ChangeObserver>) {
        if let Ok(mut slot) = self.sink.observer.lock() {
            *slot = observer;
        }
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(Error::Store("Injected close failure".to_string()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeAction;

    #[tokio::test]
    async fn test_records_statements() {
        let store = MemoryStore::new();
        store
            .execute("SELECT cloudsync_init(?1)", vec!["todos".into()])
            .await
            .unwrap();
        store
            .execute_in_transaction("SELECT cloudsync_network_sync()", vec![])
            .await
            .unwrap();

        let statements = store.statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].params, vec![SqlValue::Text("todos".into())]);
        assert!(statements[1].in_transaction);
        assert_eq!(store.count_matching("cloudsync_"), 2);
    }

    #[tokio::test]
    async fn test_responder_and_change_sink() {
        let store = MemoryStore::new();
        let sink = store.change_sink();
        store.set_responder(move |stmt| {
            if stmt.sql.contains("network_sync") {
                sink.emit(RowChange {
                    table: "todos".into(),
                    action: ChangeAction::Insert,
                    rowid: 1,
                });
                Ok(QueryResult::integer(1))
            } else {
                Err(Error::Store("no such function".into()))
            }
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let collector = seen.clone();
        store.observe_changes(Some(Arc::new(move |c| collector.lock().unwrap().push(c))));

        let result = store
            .execute("SELECT cloudsync_network_sync()", vec![])
            .await
            .unwrap();
        assert_eq!(result.first_value(), Some(&SqlValue::Integer(1)));
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(store.execute("SELECT nope()", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_close_counts_and_blocks_execution() {
        let store = MemoryStore::new();
        store.set_fail_close(true);

        assert!(store.close().await.is_err());
        assert!(store.is_closed());
        assert_eq!(store.close_calls(), 1);
        assert!(store.execute("SELECT 1", vec![]).await.is_err());
    }
}
