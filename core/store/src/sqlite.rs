//! SQLite-backed store.
//!
//! Wraps a single rusqlite connection. Every operation runs on the blocking
//! thread pool so the calling task only suspends, never blocks.

use async_trait::async_trait;
use rusqlite::hooks::Action;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::store::{closed_error, ChangeAction, ChangeObserver, QueryResult, RowChange, SqlValue, Store};
use driftsync_common::{Error, Result};

/// How long SQLite waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type ObserverSlot = Arc<Mutex<Option<ChangeObserver>>>;

/// Store backed by a SQLite database file.
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
    observer: ObserverSlot,
    closed: AtomicBool,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) a database file.
    ///
    /// # Errors
    /// - Database cannot be opened or configured
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(store_error)?;
        let store = Self::from_connection(conn, path)?;
        info!("SQLite store opened at {}", store.path.display());
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_error)?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(store_error)?;

        let observer: ObserverSlot = Arc::new(Mutex::new(None));
        let slot = observer.clone();
        conn.update_hook(Some(
            move |action: Action, _db: &str, table: &str, rowid: i64| {
                let action = match action {
                    Action::SQLITE_INSERT => ChangeAction::Insert,
                    Action::SQLITE_UPDATE => ChangeAction::Update,
                    Action::SQLITE_DELETE => ChangeAction::Delete,
                    _ => return,
                };
                let current = slot.lock().ok().and_then(|guard| guard.clone());
                if let Some(observer) = current {
                    observer(RowChange {
                        table: table.to_string(),
                        action,
                        rowid,
                    });
                }
            },
        ));

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            observer,
            closed: AtomicBool::new(false),
            path,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(closed_error());
        }
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Store("Connection lock poisoned".to_string()))?;
            let conn = guard.as_mut().ok_or_else(closed_error)?;
            f(conn)
        })
        .await
        .map_err(|e| Error::Store(format!("Store task failed: {}", e)))?
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult> {
        let sql = sql.to_string();
        self.with_conn(move |conn| run_query(conn, &sql, &params).map_err(store_error))
            .await
    }

    async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| conn.execute_batch(&sql).map_err(store_error))
            .await
    }

    async fn execute_in_transaction(&self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(store_error)?;
            let result = run_query(&tx, &sql, &params).map_err(store_error)?;
            tx.commit().map_err(store_error)?;
            Ok(result)
        })
        .await
    }

    async fn load_extension(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        debug!("Loading extension {}", path.display());
        self.with_conn(move |conn| {
            // SAFETY: extension loading is enabled only for the duration of
            // this call and the path comes from the session configuration.
            unsafe {
                let _guard = rusqlite::LoadExtensionGuard::new(conn).map_err(store_error)?;
                conn.load_extension(&path, None).map_err(store_error)
            }
        })
        .await
    }

    fn observe_changes(&self, observer: Option<ChangeObserver>) {
        match self.observer.lock() {
            Ok(mut slot) => *slot = observer,
            Err(_) => warn!("Change observer slot poisoned, observer not updated"),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.observe_changes(None);

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let taken = conn
                .lock()
                .map_err(|_| Error::Store("Connection lock poisoned".to_string()))?
                .take();
            match taken {
                Some(conn) => conn.close().map_err(|(_, e)| store_error(e)),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| Error::Store(format!("Store task failed: {}", e)))??;

        info!("SQLite store closed: {}", self.path.display());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();
    let values: Vec<Value> = params.iter().map(to_sqlite).collect();

    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut result = QueryResult::empty();
    while let Some(row) = rows.next()? {
        let mut columns = Vec::with_capacity(column_count);
        for index in 0..column_count {
            let value: Value = row.get(index)?;
            columns.push(from_sqlite(value));
        }
        result.rows.push(columns);
    }
    Ok(result)
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(r) => Value::Real(*r),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn from_sqlite(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(i),
        Value::Real(r) => SqlValue::Real(r),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Blob(b),
    }
}

fn store_error(err: rusqlite::Error) -> Error {
    Error::Store(format!("SQLite error: {}", err))
}
