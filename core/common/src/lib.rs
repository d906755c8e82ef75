//! Common utilities and types shared across driftsync crates.
//!
//! This module provides the error taxonomy used by the store and the sync
//! scheduling core, plus the types that identify a remote target.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Credential, RemoteTarget, Secret};
