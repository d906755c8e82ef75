//! Two-phase session initialization.
//!
//! Phase 1 opens and provisions the local store; failing it is fatal.
//! Phase 2 links the store to the remote; failing it leaves a usable local
//! store and is only recorded.

use std::sync::Arc;
use tracing::{debug, info, warn};

use driftsync_common::{Error, Result};
use driftsync_store::{Store, StoreRegistry};

use crate::config::SessionConfig;
use crate::link::RemoteLink;

/// Result of a successful phase 1.
pub struct InitOutcome {
    pub store: Arc<dyn Store>,
    /// Phase 2 completed.
    pub link_ready: bool,
    /// Phase 2 failure message, if phase 2 ran and failed.
    pub link_error: Option<String>,
}

/// Runs both initialization phases.
#[derive(Clone)]
pub struct Initializer {
    registry: Arc<StoreRegistry>,
    link: Arc<dyn RemoteLink>,
}

impl Initializer {
    pub fn new(registry: Arc<StoreRegistry>, link: Arc<dyn RemoteLink>) -> Self {
        Self { registry, link }
    }

    pub fn link(&self) -> &Arc<dyn RemoteLink> {
        &self.link
    }

    /// Run phase 1, then phase 2 when a remote is configured.
    ///
    /// # Errors
    /// - `Error::Store` when the store cannot be opened or provisioned
    pub async fn initialize(&self, config: &SessionConfig) -> Result<InitOutcome> {
        let store = self.open_store(config).await?;

        let Some(target) = &config.remote else {
            info!("Store ready; no remote configured, running local-only");
            return Ok(InitOutcome {
                store,
                link_ready: false,
                link_error: None,
            });
        };

        match self.link.connect(store.as_ref(), target).await {
            Ok(()) => Ok(InitOutcome {
                store,
                link_ready: true,
                link_error: None,
            }),
            Err(e) => {
                warn!("Remote link failed, store stays available locally: {}", e);
                Ok(InitOutcome {
                    store,
                    link_ready: false,
                    link_error: Some(e.to_string()),
                })
            }
        }
    }

    async fn open_store(&self, config: &SessionConfig) -> Result<Arc<dyn Store>> {
        let store = self.registry.open(&config.store).map_err(|e| match e {
            Error::Store(msg) => Error::Store(msg),
            other => Error::Store(format!("Opening store failed: {}", other)),
        })?;
        debug!("Opened {} store at {}", store.name(), config.store.path);

        for statement in &config.store.schema {
            if let Err(e) = store.execute_batch(statement).await {
                if let Err(close_err) = store.close().await {
                    warn!("Closing store after failed provisioning: {}", close_err);
                }
                return Err(Error::Store(format!("Schema provisioning failed: {}", e)));
            }
        }

        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::CloudLink;
    use crate::testing::{scripted_store_config, FakeLink, ScriptedStores};
    use driftsync_common::RemoteTarget;
    use driftsync_store::{create_default_registry, QueryResult, SqlValue, StoreConfig};
    use std::sync::atomic::Ordering;

    fn remote() -> RemoteTarget {
        RemoteTarget::new("sqlitecloud://demo.sqlite.cloud/app.db", vec!["todos".into()])
    }

    #[tokio::test]
    async fn test_local_only_session() {
        let stores = ScriptedStores::new();
        let link = Arc::new(FakeLink::default());
        let init = Initializer::new(stores.registry(), link.clone());

        let outcome = init
            .initialize(&SessionConfig::new(scripted_store_config(), None))
            .await
            .unwrap();

        assert!(!outcome.link_ready);
        assert!(outcome.link_error.is_none());
        assert_eq!(link.connects.load(Ordering::SeqCst), 0);
        assert_eq!(stores.last().count_matching("CREATE TABLE"), 1);
    }

    #[tokio::test]
    async fn test_link_failure_keeps_store() {
        let stores = ScriptedStores::new();
        let init = Initializer::new(stores.registry(), Arc::new(FakeLink::failing()));

        let outcome = init
            .initialize(&SessionConfig::new(scripted_store_config(), Some(remote())))
            .await
            .unwrap();

        assert!(!outcome.link_ready);
        assert!(outcome.link_error.unwrap().contains("remote unreachable"));
        assert!(!outcome.store.is_closed());
        assert!(outcome.store.execute("SELECT 1", vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_schema_failure_is_fatal_and_closes() {
        let stores = ScriptedStores::with_script(|stmt, _| {
            if stmt.sql.starts_with("CREATE") {
                Err(Error::Store("disk I/O error".into()))
            } else {
                Ok(QueryResult::empty())
            }
        });
        let link = Arc::new(FakeLink::default());
        let init = Initializer::new(stores.registry(), link.clone());

        let err = init
            .initialize(&SessionConfig::new(scripted_store_config(), Some(remote())))
            .await
            .err()
            .unwrap();

        assert!(err.is_fatal());
        assert_eq!(stores.last().close_calls(), 1);
        assert_eq!(link.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_driver_is_fatal() {
        let init = Initializer::new(Arc::new(create_default_registry()), Arc::new(CloudLink::new()));
        let config = StoreConfig {
            driver: "postgres".into(),
            path: "db".into(),
            schema: vec![],
        };

        let err = init
            .initialize(&SessionConfig::new(config, None))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn test_sqlite_store_without_extension_fails_phase_two_only() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("app.db");
        let config = StoreConfig::sqlite(path.to_string_lossy())
            .with_schema("CREATE TABLE IF NOT EXISTS todos (id TEXT PRIMARY KEY NOT NULL, title TEXT)");
        let init = Initializer::new(Arc::new(create_default_registry()), Arc::new(CloudLink::new()));

        let outcome = init
            .initialize(&SessionConfig::new(config, Some(remote())))
            .await
            .unwrap();

        assert!(!outcome.link_ready);
        assert!(outcome.link_error.is_some());
        outcome
            .store
            .execute(
                "INSERT INTO todos (id, title) VALUES (?1, ?2)",
                vec![SqlValue::from("a"), SqlValue::from("write offline")],
            )
            .await
            .unwrap();
        outcome.store.close().await.unwrap();
    }
}
