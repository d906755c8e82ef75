//! Store registry for opening stores by driver name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::Store;
use driftsync_common::{Error, Result};

/// Local store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Registered driver name (e.g., "sqlite").
    pub driver: String,
    /// Driver-specific location (database file path for SQLite).
    pub path: String,
    /// Schema statements run after opening. Must be idempotent.
    #[serde(default)]
    pub schema: Vec<String>,
}

impl StoreConfig {
    /// SQLite store at `path`.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            driver: "sqlite".to_string(),
            path: path.into(),
            schema: Vec::new(),
        }
    }

    /// Add a schema statement.
    pub fn with_schema(mut self, statement: impl Into<String>) -> Self {
        self.schema.push(statement.into());
        self
    }
}

/// Factory function type for opening stores.
pub type StoreFactory = Box<dyn Fn(&StoreConfig) -> Result<Arc<dyn Store>> + Send + Sync>;

/// Registry for store factories.
///
/// Lets a cold-started context reopen the store named in a persisted
/// configuration without knowing the concrete driver.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Store driver '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Open a store for the given configuration.
    ///
    /// # Errors
    /// - Driver not registered
    /// - Store cannot be opened
    pub fn open(&self, config: &StoreConfig) -> Result<Arc<dyn Store>> {
        let factory = self.factories.get(&config.driver).ok_or_else(|| {
            Error::NotFound(format!("Store driver '{}' is not registered", config.driver))
        })?;
        factory(config)
    }

    /// Get list of registered driver names.
    pub fn drivers(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a driver is registered.
    pub fn has_driver(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in drivers.
pub fn create_default_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();

    // Names are distinct and the registry is fresh, so registration cannot fail.
    let _ = registry.register(
        "sqlite",
        Box::new(|config| Ok(Arc::new(crate::sqlite::SqliteStore::open(&config.path)?))),
    );

    // Scripted store without responder, for dry runs.
    let _ = registry.register(
        "memory",
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()))),
    );

    registry
}
