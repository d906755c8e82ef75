//! Embedded store abstraction for driftsync.
//!
//! This module provides a trait-based interface over the local database
//! that the sync scheduling core drives, a SQLite implementation, a scripted
//! in-memory implementation for tests, and a registry for opening stores
//! by driver name.
//!
//! # Design Principles
//! - Exclusive ownership: a store handle belongs to one execution context
//! - Async operations: blocking drivers run on the blocking pool
//! - Driver isolation: no SQLite types leak through the trait

pub mod memory;
pub mod registry;
pub mod sqlite;
pub mod store;

pub use memory::{ChangeSink, MemoryStore, Statement};
pub use registry::{create_default_registry, StoreConfig, StoreFactory, StoreRegistry};
pub use sqlite::SqliteStore;
pub use store::{ChangeAction, ChangeObserver, QueryResult, RowChange, SqlValue, Store};
