//! Process-wide single-slot registries.
//!
//! Callbacks that must outlive the component that registered them (the
//! background completion handler, the foreground delegate) live here. The
//! application creates one [`SyncHooks`] at startup and hands clones of the
//! `Arc` to both execution contexts.

use futures::future::BoxFuture;
use std::sync::{Arc, RwLock};
use tracing::debug;

use driftsync_common::Result;
use driftsync_store::RowChange;

use crate::platform::{PermissionPrompt, PushNotification};

/// Changes applied by a background run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeManifest {
    /// Change count reported by the primitive.
    pub changes: u64,
    /// Rows touched while the run was in progress.
    pub rows: Vec<RowChange>,
}

/// Handler invoked after a background run.
pub type CompletionHandler =
    Arc<dyn Fn(ChangeManifest) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Live foreground callback that handles a push wake-up with the open store.
pub type ForegroundDelegate = Arc<dyn Fn(PushNotification) -> BoxFuture<'static, ()> + Send + Sync>;

/// Single-writer, many-reader slot holding at most one registrant.
pub struct Slot<T> {
    name: &'static str,
    value: RwLock<Option<T>>,
}

impl<T: Clone> Slot<T> {
    /// Create an empty slot.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: RwLock::new(None),
        }
    }

    /// Register `value`, returning the previous registrant.
    pub fn set(&self, value: T) -> Option<T> {
        let previous = match self.value.write() {
            Ok(mut slot) => slot.replace(value),
            Err(poisoned) => poisoned.into_inner().replace(value),
        };
        if previous.is_some() {
            debug!("Replaced registrant in {} slot", self.name);
        }
        previous
    }

    /// Current registrant.
    pub fn get(&self) -> Option<T> {
        match self.value.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Remove the registrant.
    pub fn clear(&self) -> Option<T> {
        match self.value.write() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

/// Registration points shared by the foreground and background contexts.
pub struct SyncHooks {
    /// Called with the change manifest after a background run.
    pub completion: Slot<CompletionHandler>,
    /// Set while a foreground engine with an open store is running.
    pub foreground: Slot<ForegroundDelegate>,
    /// Confirmation shown before the push permission prompt.
    pub permission_prompt: Slot<Arc<dyn PermissionPrompt>>,
}

impl SyncHooks {
    pub fn new() -> Self {
        Self {
            completion: Slot::new("completion"),
            foreground: Slot::new("foreground"),
            permission_prompt: Slot::new("permission_prompt"),
        }
    }

    /// Register the background completion handler.
    pub fn on_background_sync<F, Fut>(&self, handler: F)
    where
        F: Fn(ChangeManifest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let handler: CompletionHandler =
            Arc::new(move |manifest: ChangeManifest| -> BoxFuture<'static, Result<()>> {
                Box::pin(handler(manifest))
            });
        self.completion.set(handler);
    }
}

impl Default for SyncHooks {
    fn default() -> Self {
        Self::new()
    }
}
