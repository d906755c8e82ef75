//! Sync manager: the single entry point every trigger calls.
//!
//! `perform_sync` is safe to call from any number of tasks. At most one
//! attempt is in flight; a trigger arriving while busy is dropped, not
//! queued. The busy flag is taken before the first suspension point and
//! released by a drop guard, so it clears on success, failure and
//! cancellation alike.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

use driftsync_store::Store;

use crate::config::{SyncConfig, SyncMode};
use crate::executor::{SyncExecutor, SyncOutcome};
use crate::platform::{AppState, Reachability};
use crate::policy::{next_interval, BackoffConfig, SyncCounters};
use crate::state::{SchedulerState, SyncStatus};
use crate::triggers::TriggerOrigin;

/// Capacity of the "synced with changes" channel.
const COMPLETED_CHANNEL_CAPACITY: usize = 32;

/// Why a trigger did not start an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoStore,
    AlreadySyncing,
    Offline,
    LinkNotReady,
}

/// Result of a `perform_sync` call. Never an error: failures are folded
/// into the published status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAttempt {
    Skipped(SkipReason),
    Completed(SyncOutcome),
    Failed(String),
}

impl SyncAttempt {
    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncAttempt::Skipped(_))
    }
}

/// Published after an attempt that applied at least one change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCompleted {
    pub changes: u64,
    pub origin: TriggerOrigin,
    pub at: DateTime<Utc>,
}

struct Core {
    state: SchedulerState,
    mode: SyncMode,
}

struct Inner {
    store: RwLock<Option<Arc<dyn Store>>>,
    link_ready: AtomicBool,
    busy: AtomicBool,
    idle: Notify,
    core: Mutex<Core>,
    executor: SyncExecutor,
    backoff: BackoffConfig,
    check_connectivity: bool,
    reachability: Arc<dyn Reachability>,
    status: Arc<watch::Sender<SyncStatus>>,
    completed: broadcast::Sender<SyncCompleted>,
}

/// Status publication channels, shared by successive managers.
#[derive(Clone)]
pub struct StatusChannels {
    status: Arc<watch::Sender<SyncStatus>>,
    completed: broadcast::Sender<SyncCompleted>,
}

impl StatusChannels {
    pub fn new(mode: SyncMode) -> Self {
        let (status, _) = watch::channel(SyncStatus::initial(mode));
        let (completed, _) = broadcast::channel(COMPLETED_CHANNEL_CAPACITY);
        Self {
            status: Arc::new(status),
            completed,
        }
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_completed(&self) -> broadcast::Receiver<SyncCompleted> {
        self.completed.subscribe()
    }

    /// Publish a fatal initialization error with no manager attached.
    pub fn record_init_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.readiness = Default::default();
            status.init_error = Some(error);
        });
    }
}

/// Owner of the scheduler state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    /// Create a manager without a store, with its own status channels.
    pub fn new(config: &SyncConfig, reachability: Arc<dyn Reachability>) -> Self {
        Self::with_channels(config, reachability, StatusChannels::new(config.mode))
    }

    /// Create a manager publishing into existing channels, so subscribers
    /// survive a re-initialization. Scheduler fields start fresh; the
    /// lifecycle and network flags are kept.
    pub fn with_channels(
        config: &SyncConfig,
        reachability: Arc<dyn Reachability>,
        channels: StatusChannels,
    ) -> Self {
        channels.status.send_modify(|status| {
            let is_background = status.is_background;
            let network_available = status.network_available;
            *status = SyncStatus::initial(config.mode);
            status.is_background = is_background;
            status.network_available = network_available;
        });
        let StatusChannels { status, completed } = channels;

        Self {
            inner: Arc::new(Inner {
                store: RwLock::new(None),
                link_ready: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                idle: Notify::new(),
                core: Mutex::new(Core {
                    state: SchedulerState::new(config.mode, config.backoff.base_interval),
                    mode: config.mode,
                }),
                executor: SyncExecutor::new(config.foreground.clone()),
                backoff: config.backoff.clone(),
                check_connectivity: config.check_connectivity,
                reachability,
                status,
                completed,
            }),
        }
    }

    /// Request a sync. Guards return silently, in order: no store, already
    /// syncing, definitely offline, link not ready.
    pub async fn perform_sync(&self, origin: TriggerOrigin) -> SyncAttempt {
        let Some(store) = self.store() else {
            debug!("Sync ({}) skipped: store not ready", origin);
            return SyncAttempt::Skipped(SkipReason::NoStore);
        };

        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync ({}) skipped: attempt already in flight", origin);
            return SyncAttempt::Skipped(SkipReason::AlreadySyncing);
        }
        let _busy = BusyGuard { manager: self };

        if self.inner.check_connectivity
            && self.inner.reachability.is_available()
            && self.inner.reachability.check().await == Some(false)
        {
            debug!("Sync ({}) skipped: device offline", origin);
            return SyncAttempt::Skipped(SkipReason::Offline);
        }

        if !self.inner.link_ready.load(Ordering::SeqCst) {
            debug!("Sync ({}) skipped: remote link not ready", origin);
            return SyncAttempt::Skipped(SkipReason::LinkNotReady);
        }

        self.update(|core| core.state.is_syncing = true);
        debug!("Sync ({}) started", origin);

        match self.inner.executor.attempt(store.as_ref()).await {
            Ok(outcome) => {
                let at = Utc::now();
                let backoff = &self.inner.backoff;
                let interval = self.update(|core| {
                    core.state.mark_synced(outcome.changes, at);
                    recompute_interval(core, backoff);
                    core.state.current_interval
                });

                if outcome.changes > 0 {
                    info!(
                        "Sync ({}) applied {} changes, next interval {:?}",
                        origin, outcome.changes, interval
                    );
                    let _ = self.inner.completed.send(SyncCompleted {
                        changes: outcome.changes,
                        origin,
                        at,
                    });
                } else {
                    debug!("Sync ({}) found no changes, next interval {:?}", origin, interval);
                }
                SyncAttempt::Completed(outcome)
            }
            Err(err) => {
                let message = err.to_string();
                let backoff = &self.inner.backoff;
                let (errors, interval) = self.update(|core| {
                    core.state.mark_failed(message.clone());
                    recompute_interval(core, backoff);
                    (
                        core.state.counters.consecutive_sync_errors,
                        core.state.current_interval,
                    )
                });
                warn!(
                    "Sync ({}) failed ({} in a row), next interval {:?}: {}",
                    origin, errors, interval, message
                );
                SyncAttempt::Failed(message)
            }
        }
    }

    /// Install the store handle. Scheduler state starts fresh.
    pub fn attach_store(&self, store: Arc<dyn Store>) {
        *write_lock(&self.inner.store) = Some(store);
        self.reset_state();
        self.inner
            .status
            .send_modify(|status| status.readiness.store_ready = true);
    }

    /// Remove the store handle and clear readiness and scheduler state.
    ///
    /// Callers should wait for [`SyncManager::wait_idle`] before closing the
    /// returned handle.
    pub fn detach_store(&self) -> Option<Arc<dyn Store>> {
        let store = write_lock(&self.inner.store).take();
        self.inner.link_ready.store(false, Ordering::SeqCst);
        self.reset_state();
        self.inner.status.send_modify(|status| {
            status.readiness.store_ready = false;
            status.readiness.link_ready = false;
            status.init_error = None;
            status.link_error = None;
        });
        store
    }

    /// Current store handle.
    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.inner
            .store
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mark the remote link as ready or not.
    pub fn set_link_ready(&self, ready: bool) {
        self.inner.link_ready.store(ready, Ordering::SeqCst);
        self.inner
            .status
            .send_modify(|status| status.readiness.link_ready = ready);
    }

    pub fn link_ready(&self) -> bool {
        self.inner.link_ready.load(Ordering::SeqCst)
    }

    /// Publish initialization errors.
    pub fn record_init_errors(&self, init_error: Option<String>, link_error: Option<String>) {
        self.inner.status.send_modify(|status| {
            status.init_error = init_error;
            status.link_error = link_error;
        });
    }

    /// Current sync mode.
    pub fn mode(&self) -> SyncMode {
        self.lock_core().mode
    }

    /// Switch mode. Polling gets an interval from the current counters,
    /// push clears it.
    pub fn set_mode(&self, mode: SyncMode) {
        let backoff = &self.inner.backoff;
        self.update(|core| {
            core.mode = mode;
            recompute_interval(core, backoff);
        });
        self.inner.status.send_modify(|status| status.mode = mode);
    }

    /// Interval the poller should wait next; `None` in push mode.
    pub fn current_interval(&self) -> Option<Duration> {
        self.lock_core().state.current_interval
    }

    /// Current adaptive counters.
    pub fn counters(&self) -> SyncCounters {
        self.lock_core().state.counters
    }

    /// Drop any backoff: counters go to zero and the interval back to base.
    pub fn reset_backoff(&self) {
        let backoff = &self.inner.backoff;
        self.update(|core| {
            core.state.counters = SyncCounters::default();
            recompute_interval(core, backoff);
        });
    }

    /// Record the application lifecycle state in the status snapshot.
    pub fn note_app_state(&self, app_state: AppState) {
        self.inner
            .status
            .send_modify(|status| status.is_background = app_state == AppState::Background);
    }

    /// Record network availability in the status snapshot.
    pub fn note_network(&self, available: bool) {
        self.inner
            .status
            .send_modify(|status| status.network_available = available);
    }

    /// Whether an attempt (or its guard checks) is in progress.
    pub fn is_syncing(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Wait until no attempt is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !self.is_syncing() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    /// Subscribe to status snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Subscribe to "synced with changes" events.
    pub fn subscribe_completed(&self) -> broadcast::Receiver<SyncCompleted> {
        self.inner.completed.subscribe()
    }

    fn reset_state(&self) {
        let base = self.inner.backoff.base_interval;
        self.update(|core| {
            core.state = SchedulerState::new(core.mode, base);
        });
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutate the core and publish the result while still holding the lock,
    /// so snapshots are published in mutation order.
    fn update<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let mut core = self.lock_core();
        let result = f(&mut core);
        self.inner.status.send_modify(|status| status.apply(&core.state));
        result
    }
}

fn recompute_interval(core: &mut Core, backoff: &BackoffConfig) {
    core.state.current_interval = match core.mode {
        SyncMode::Polling => Some(next_interval(&core.state.counters, backoff)),
        SyncMode::Push => None,
    };
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the busy flag when the attempt ends, however it ends.
struct BusyGuard<'a> {
    manager: &'a SyncManager,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let was_syncing = self.manager.lock_core().state.is_syncing;
        if was_syncing {
            self.manager.update(|core| core.state.is_syncing = false);
        }
        self.manager.inner.busy.store(false, Ordering::SeqCst);
        self.manager.inner.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorOptions;
    use crate::testing::FakeReachability;
    use driftsync_common::Error;
    use driftsync_store::{MemoryStore, QueryResult};
    use std::sync::atomic::AtomicU32;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.foreground = ExecutorOptions::new(1);
        config
    }

    fn manager_with(config: &SyncConfig) -> (SyncManager, Arc<FakeReachability>) {
        let reachability = Arc::new(FakeReachability::new(Some(true)));
        (SyncManager::new(config, reachability.clone()), reachability)
    }

    /// Store whose primitive returns `changes` and counts invocations.
    fn counting_store(changes: i64) -> (Arc<MemoryStore>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let store = MemoryStore::with_responder(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(QueryResult::integer(changes))
        });
        (Arc::new(store), calls)
    }

    fn ready(manager: &SyncManager, store: Arc<MemoryStore>) {
        manager.attach_store(store);
        manager.set_link_ready(true);
    }

    #[tokio::test]
    async fn test_no_store_is_skipped() {
        let (manager, _) = manager_with(&config());
        assert_eq!(
            manager.perform_sync(TriggerOrigin::Manual).await,
            SyncAttempt::Skipped(SkipReason::NoStore)
        );
    }

    #[tokio::test]
    async fn test_link_not_ready_touches_nothing() {
        let (manager, _) = manager_with(&config());
        let (store, calls) = counting_store(3);
        manager.attach_store(store);
        let before = manager.status();

        let attempt = manager.perform_sync(TriggerOrigin::Manual).await;

        assert_eq!(attempt, SyncAttempt::Skipped(SkipReason::LinkNotReady));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.status(), before);
        assert!(!manager.is_syncing());
    }

    #[tokio::test]
    async fn test_offline_precheck_skips_attempt() {
        let (manager, reachability) = manager_with(&config());
        let (store, calls) = counting_store(1);
        ready(&manager, store);
        reachability.set(Some(false));

        assert_eq!(
            manager.perform_sync(TriggerOrigin::Timer).await,
            SyncAttempt::Skipped(SkipReason::Offline)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!manager.is_syncing());

        // Unknown connectivity does not block.
        reachability.set(None);
        assert!(!manager.perform_sync(TriggerOrigin::Timer).await.is_skipped());
    }

    #[tokio::test]
    async fn test_precheck_disabled_ignores_reachability() {
        let mut config = config();
        config.check_connectivity = false;
        let (manager, reachability) = manager_with(&config);
        let (store, _) = counting_store(1);
        ready(&manager, store);
        reachability.set(Some(false));

        assert!(!manager.perform_sync(TriggerOrigin::Timer).await.is_skipped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_run_one_attempt() {
        let (manager, _) = manager_with(&config());
        let (store, calls) = counting_store(2);
        store.set_latency(Duration::from_millis(500));
        ready(&manager, store);

        let attempts = futures::future::join_all(
            (0..8).map(|_| manager.perform_sync(TriggerOrigin::Manual)),
        )
        .await;

        let completed = attempts
            .iter()
            .filter(|a| matches!(a, SyncAttempt::Completed(_)))
            .count();
        let dropped = attempts
            .iter()
            .filter(|a| **a == SyncAttempt::Skipped(SkipReason::AlreadySyncing))
            .count();
        assert_eq!(completed, 1);
        assert_eq!(dropped, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.counters(), SyncCounters::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_while_busy_changes_nothing() {
        let (manager, _) = manager_with(&config());
        let (store, calls) = counting_store(0);
        store.set_latency(Duration::from_millis(500));
        ready(&manager, store);

        let background = manager.clone();
        let running = tokio::spawn(async move { background.perform_sync(TriggerOrigin::Timer).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manager.status().is_syncing);
        let counters = manager.counters();
        assert_eq!(
            manager.perform_sync(TriggerOrigin::Manual).await,
            SyncAttempt::Skipped(SkipReason::AlreadySyncing)
        );
        assert_eq!(manager.counters(), counters);

        running.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!manager.status().is_syncing);
    }

    #[tokio::test]
    async fn test_counters_and_interval_follow_outcomes() {
        let (manager, _) = manager_with(&config());
        let store = Arc::new(MemoryStore::new());
        ready(&manager, store.clone());
        let base = Duration::from_millis(5_000);

        // Five empty syncs reach the threshold.
        for _ in 0..5 {
            manager.perform_sync(TriggerOrigin::Timer).await;
        }
        assert_eq!(manager.counters().consecutive_empty_syncs, 5);
        assert_eq!(manager.current_interval(), Some(Duration::from_millis(7_500)));

        // An error resets the empty counter and applies error backoff.
        store.set_responder(|_| Err(Error::Store("connection reset".into())));
        let attempt = manager.perform_sync(TriggerOrigin::Timer).await;
        assert!(matches!(attempt, SyncAttempt::Failed(_)));
        let status = manager.status();
        assert_eq!(status.consecutive_empty_syncs, 0);
        assert_eq!(status.consecutive_sync_errors, 1);
        assert_eq!(status.current_interval, Some(Duration::from_millis(10_000)));
        assert!(status.last_error.is_some());
        let last_time = status.last_sync_time;

        manager.perform_sync(TriggerOrigin::Timer).await;
        let status = manager.status();
        assert_eq!(status.consecutive_sync_errors, 2);
        assert_eq!(status.last_sync_time, last_time);

        // Changes reset everything.
        store.set_responder(|_| Ok(QueryResult::integer(9)));
        manager.perform_sync(TriggerOrigin::Timer).await;
        let status = manager.status();
        assert_eq!(status.consecutive_sync_errors, 0);
        assert_eq!(status.consecutive_empty_syncs, 0);
        assert_eq!(status.last_sync_changes, 9);
        assert_eq!(status.last_error, None);
        assert_eq!(status.current_interval, Some(base));
    }

    #[tokio::test]
    async fn test_push_mode_keeps_interval_null() {
        let config = SyncConfig {
            mode: SyncMode::Push,
            ..config()
        };
        let (manager, _) = manager_with(&config);
        let store = Arc::new(MemoryStore::with_responder(|_| {
            Err(Error::Store("boom".into()))
        }));
        ready(&manager, store);

        manager.perform_sync(TriggerOrigin::Push).await;
        assert_eq!(manager.current_interval(), None);
        assert_eq!(manager.counters().consecutive_sync_errors, 1);

        manager.set_mode(SyncMode::Polling);
        assert_eq!(manager.current_interval(), Some(Duration::from_millis(10_000)));
        assert_eq!(manager.status().mode, SyncMode::Polling);
    }

    #[tokio::test]
    async fn test_completed_events_only_for_changes() {
        let (manager, _) = manager_with(&config());
        let store = Arc::new(MemoryStore::new());
        ready(&manager, store.clone());
        let mut events = manager.subscribe_completed();

        manager.perform_sync(TriggerOrigin::Timer).await;
        assert!(events.try_recv().is_err());

        store.set_responder(|_| Ok(QueryResult::integer(3)));
        manager.perform_sync(TriggerOrigin::Push).await;
        let event = events.try_recv().unwrap();
        assert_eq!(event.changes, 3);
        assert_eq!(event.origin, TriggerOrigin::Push);
    }

    #[tokio::test]
    async fn test_reset_backoff_returns_to_base() {
        let (manager, _) = manager_with(&config());
        let store = Arc::new(MemoryStore::with_responder(|_| {
            Err(Error::Store("down".into()))
        }));
        ready(&manager, store);

        for _ in 0..10 {
            manager.perform_sync(TriggerOrigin::Timer).await;
        }
        assert_eq!(manager.current_interval(), Some(Duration::from_millis(300_000)));

        manager.reset_backoff();
        assert_eq!(manager.current_interval(), Some(Duration::from_millis(5_000)));
        assert_eq!(manager.counters(), SyncCounters::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle() {
        let (manager, _) = manager_with(&config());
        let (store, _) = counting_store(1);
        store.set_latency(Duration::from_secs(2));
        ready(&manager, store);

        assert!(manager.wait_idle(Duration::from_millis(1)).await);

        let background = manager.clone();
        let running = tokio::spawn(async move { background.perform_sync(TriggerOrigin::Timer).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!manager.wait_idle(Duration::from_millis(100)).await);
        assert!(manager.wait_idle(Duration::from_secs(5)).await);
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_resets_readiness_and_state() {
        let (manager, _) = manager_with(&config());
        let (store, _) = counting_store(4);
        ready(&manager, store);
        manager.perform_sync(TriggerOrigin::Manual).await;

        assert!(manager.detach_store().is_some());
        let status = manager.status();
        assert!(!status.readiness.store_ready);
        assert!(!status.readiness.link_ready);
        assert_eq!(status.last_sync_changes, 0);
        assert_eq!(status.last_sync_time, None);
        assert_eq!(
            manager.perform_sync(TriggerOrigin::Manual).await,
            SyncAttempt::Skipped(SkipReason::NoStore)
        );
    }

    #[tokio::test]
    async fn test_shared_channels_survive_new_manager() {
        let config = config();
        let channels = StatusChannels::new(config.mode);
        let mut status = channels.subscribe();
        let reachability = Arc::new(FakeReachability::new(None));

        let first = SyncManager::with_channels(&config, reachability.clone(), channels.clone());
        let (store, _) = counting_store(5);
        ready(&first, store);
        first.note_app_state(AppState::Background);
        first.perform_sync(TriggerOrigin::Manual).await;
        assert_eq!(status.borrow_and_update().last_sync_changes, 5);

        let second = SyncManager::with_channels(&config, reachability, channels.clone());
        let snapshot = status.borrow_and_update().clone();
        assert_eq!(snapshot.last_sync_changes, 0);
        assert!(!snapshot.readiness.store_ready);
        assert!(snapshot.is_background);
        assert_eq!(second.status(), channels.snapshot());
    }
}
