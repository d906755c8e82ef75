//! Test doubles for platform capabilities and the remote link.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use driftsync_common::{Error, RemoteTarget, Result};
use driftsync_store::{
    ChangeSink, MemoryStore, QueryResult, Statement, Store, StoreConfig, StoreRegistry,
};

use crate::link::RemoteLink;
use crate::platform::{
    BackgroundTaskService, PermissionPrompt, PermissionStatus, PushNotification, PushService,
    Reachability,
};

pub struct FakeReachability {
    state: Mutex<Option<bool>>,
}

impl FakeReachability {
    pub fn new(state: Option<bool>) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn set(&self, state: Option<bool>) {
        *self.state.lock().unwrap() = state;
    }
}

#[async_trait]
impl Reachability for FakeReachability {
    fn is_available(&self) -> bool {
        true
    }

    async fn check(&self) -> Option<bool> {
        *self.state.lock().unwrap()
    }
}

pub struct FakePush {
    available: bool,
    status: Mutex<PermissionStatus>,
    grant_on_request: bool,
    fail_register: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<PushNotification>>>,
    pub request_calls: AtomicUsize,
    pub register_calls: AtomicUsize,
}

impl FakePush {
    pub fn new(status: PermissionStatus, grant_on_request: bool) -> Self {
        Self {
            available: true,
            status: Mutex::new(status),
            grant_on_request,
            fail_register: AtomicBool::new(false),
            sender: Mutex::new(None),
            request_calls: AtomicUsize::new(0),
            register_calls: AtomicUsize::new(0),
        }
    }

    pub fn granted() -> Self {
        Self::new(PermissionStatus::Granted, true)
    }

    pub fn fail_register(&self) {
        self.fail_register.store(true, Ordering::SeqCst);
    }

    /// Deliver a foreground notification. Returns `false` if nobody listens.
    pub async fn deliver(&self, payload: serde_json::Value) -> bool {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(PushNotification::new(payload)).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl PushService for FakePush {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn permission_status(&self) -> PermissionStatus {
        *self.status.lock().unwrap()
    }

    async fn request_permission(&self) -> Result<PermissionStatus> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        let status = if self.grant_on_request {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        *self.status.lock().unwrap() = status;
        Ok(status)
    }

    async fn register_device(&self) -> Result<()> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(Error::Permission("registration rejected".into()));
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<PushNotification>> {
        let (tx, rx) = mpsc::channel(8);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

pub struct FakeBackgroundTasks {
    available: bool,
    pub registered: AtomicBool,
    pub unregister_calls: AtomicUsize,
}

impl FakeBackgroundTasks {
    pub fn new(available: bool) -> Self {
        Self {
            available,
            registered: AtomicBool::new(false),
            unregister_calls: AtomicUsize::new(0),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundTaskService for FakeBackgroundTasks {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn register(&self) -> Result<()> {
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unregister(&self) -> Result<()> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        self.registered.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedPrompt(pub bool);

#[async_trait]
impl PermissionPrompt for ScriptedPrompt {
    async fn confirm(&self) -> bool {
        self.0
    }
}

/// Link that records calls instead of issuing SQL.
#[derive(Default)]
pub struct FakeLink {
    fail_connect: AtomicBool,
    pub connects: AtomicUsize,
    pub terminates: AtomicUsize,
}

impl FakeLink {
    pub fn failing() -> Self {
        let link = Self::default();
        link.fail_connect.store(true, Ordering::SeqCst);
        link
    }
}

#[async_trait]
impl RemoteLink for FakeLink {
    async fn connect(&self, _store: &dyn Store, _target: &RemoteTarget) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Link("remote unreachable".into()));
        }
        Ok(())
    }

    async fn terminate(&self, _store: &dyn Store) -> Result<()> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type Script = Arc<dyn Fn(&Statement, &ChangeSink) -> Result<QueryResult> + Send + Sync>;

/// Hands out a fresh [`MemoryStore`] per open under the "scripted" driver,
/// each answering through the same script.
#[derive(Clone)]
pub struct ScriptedStores {
    script: Arc<Mutex<Script>>,
    opened: Arc<Mutex<Vec<Arc<MemoryStore>>>>,
}

impl ScriptedStores {
    /// Stores that report an up-to-date extension and no changes.
    pub fn new() -> Self {
        Self::with_script(|stmt, _sink| {
            if stmt.sql.contains("cloudsync_version") {
                Ok(QueryResult::text("0.9.98"))
            } else if stmt.sql.contains("cloudsync_network_sync") {
                Ok(QueryResult::integer(0))
            } else {
                Ok(QueryResult::empty())
            }
        })
    }

    pub fn with_script<F>(script: F) -> Self
    where
        F: Fn(&Statement, &ChangeSink) -> Result<QueryResult> + Send + Sync + 'static,
    {
        let script: Script = Arc::new(script);
        Self {
            script: Arc::new(Mutex::new(script)),
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn registry(&self) -> Arc<StoreRegistry> {
        let stores = self.clone();
        let mut registry = StoreRegistry::new();
        registry
            .register(
                "scripted",
                Box::new(move |_config: &StoreConfig| {
                    let store = Arc::new(MemoryStore::new());
                    let sink = store.change_sink();
                    let script = stores.script.lock().unwrap().clone();
                    store.set_responder(move |stmt| script(stmt, &sink));
                    stores.opened.lock().unwrap().push(store.clone());
                    let handle: Arc<dyn Store> = store;
                    Ok(handle)
                }),
            )
            .unwrap();
        Arc::new(registry)
    }

    pub fn opened(&self) -> Vec<Arc<MemoryStore>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<MemoryStore> {
        self.opened().last().cloned().unwrap()
    }
}

pub fn scripted_store_config() -> StoreConfig {
    StoreConfig {
        driver: "scripted".into(),
        path: "scripted".into(),
        schema: vec!["CREATE TABLE IF NOT EXISTS todos (id TEXT PRIMARY KEY NOT NULL)".into()],
    }
}
