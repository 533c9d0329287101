//! Authoritative in-memory task list
//!
//! The registry is the only owner of [`Task`] values. Everyone else reads
//! snapshots (`get_cached`, subscriptions) and writes through
//! [`TaskRegistry::apply_update`]. Paginated loads merge into one list
//! bounded by `max_tasks`; concurrent refreshes of the same page share one
//! fetch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::api::{CachePolicy, DashboardApi, TaskPage};
use crate::domain::errors::EngineResult;
use crate::domain::task::{Task, TaskPatch};
use crate::infrastructure::cache_store::{CacheStore, keys as cache_keys};
use crate::infrastructure::config::RegistryConfig;
use crate::infrastructure::local_store::{LocalStore, keys as store_keys};
use crate::infrastructure::single_flight::SingleFlight;

/// Invoked with the full task list after every change.
pub type TaskListener = Arc<dyn Fn(&[Task]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Default)]
struct RegistryState {
    tasks: Vec<Task>,
    total_count: u64,
}

pub struct TaskRegistry {
    api: Arc<DashboardApi>,
    cache: Arc<CacheStore>,
    store: Arc<LocalStore>,
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    listeners: Mutex<Vec<(SubscriptionId, TaskListener)>>,
    next_listener: AtomicU64,
    refreshes: SingleFlight<(u32, u32), EngineResult<Vec<Task>>>,
}

impl TaskRegistry {
    pub fn new(
        api: Arc<DashboardApi>,
        cache: Arc<CacheStore>,
        store: Arc<LocalStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            api,
            cache,
            store,
            config,
            state: RwLock::new(RegistryState::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            refreshes: SingleFlight::new(),
        }
    }

    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Loads `count` tasks starting at `offset` and merges them.
    ///
    /// `offset == 0` replaces the list, later offsets append tasks not already
    /// known. Requests are clipped at `max_tasks`; an offset at or past the
    /// ceiling returns the current list without a network call. Returns the
    /// full list after the merge.
    pub async fn refresh(self: &Arc<Self>, offset: u32, count: u32) -> EngineResult<Vec<Task>> {
        let max = u32::try_from(self.config.max_tasks).unwrap_or(u32::MAX);
        if offset >= max || count == 0 {
            debug!("Registry at load ceiling ({} tasks), skipping fetch", max);
            return Ok(self.get_cached());
        }
        let count = count.min(max - offset);

        let registry = Arc::clone(self);
        self.refreshes
            .run((offset, count), move || async move {
                let page = registry
                    .api
                    .task_list(offset, count, CachePolicy::Refresh)
                    .await?;
                Ok(registry.merge_page(offset, page))
            })
            .await
    }

    /// Re-fetches as many leading tasks as are currently loaded (at least one page).
    pub async fn reload(self: &Arc<Self>) -> EngineResult<Vec<Task>> {
        let loaded = u32::try_from(self.len()).unwrap_or(u32::MAX);
        self.refresh(0, loaded.max(self.config.page_size)).await
    }

    /// Loads the next page after what is already held.
    pub async fn load_more(self: &Arc<Self>) -> EngineResult<Vec<Task>> {
        let loaded = u32::try_from(self.len()).unwrap_or(u32::MAX);
        self.refresh(loaded, self.config.page_size).await
    }

    /// Merges by the requested `offset`, whatever page answered it.
    fn merge_page(&self, offset: u32, page: TaskPage) -> Vec<Task> {
        let snapshot = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let before = state.tasks.len();

            if page.offset != offset {
                warn!("⚠️ Page for offset {} answered with offset {}", offset, page.offset);
            }
            if offset == 0 {
                state.tasks = page.tasks;
                state.tasks.truncate(self.config.max_tasks);
            } else {
                let mut known: HashSet<String> =
                    state.tasks.iter().map(|task| task.task_id.clone()).collect();
                for task in page.tasks {
                    if state.tasks.len() >= self.config.max_tasks {
                        break;
                    }
                    if known.insert(task.task_id.clone()) {
                        state.tasks.push(task);
                    }
                }
            }
            state.total_count = page.total_count;

            for task in &state.tasks {
                if let Some(violation) = task.ordering_violation() {
                    warn!("⚠️ Task {} stage order: {}", task.task_id, violation);
                }
            }
            info!(
                "📋 Registry merged page offset={} ({} -> {} tasks, total {})",
                offset,
                before,
                state.tasks.len(),
                state.total_count
            );
            state.tasks.clone()
        };
        self.publish(&snapshot);
        snapshot
    }

    pub fn get_cached(&self) -> Vec<Task> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .clone()
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .iter()
            .find(|task| task.task_id == task_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_count(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).total_count
    }

    /// More tasks exist server-side and the load ceiling is not reached.
    pub fn has_more(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let reachable = state.total_count.min(self.config.max_tasks as u64);
        (state.tasks.len() as u64) < reachable
    }

    pub fn has_active_tasks(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .iter()
            .any(Task::is_active)
    }

    /// Replaces the patched fields of one task and republishes the list.
    ///
    /// Returns `false` when the task is unknown or nothing changed. A stage
    /// change also drops the cached list pages and the task's marketing list.
    pub fn apply_update(&self, task_id: &str, patch: &TaskPatch) -> bool {
        if patch.is_empty() {
            return false;
        }

        let (snapshot, stage_changed) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let Some(task) = state.tasks.iter_mut().find(|task| task.task_id == task_id) else {
                debug!("apply_update for unknown task {}", task_id);
                return false;
            };

            for regression in patch.regressions(task) {
                warn!("⚠️ Task {} stage moved backwards: {}", task_id, regression);
            }
            let stages_before = (task.crawler_state, task.analysis_state, task.market_state);
            if !task.apply(patch) {
                return false;
            }
            if let Some(violation) = task.ordering_violation() {
                warn!("⚠️ Task {} stage order: {}", task_id, violation);
            }
            let stage_changed =
                stages_before != (task.crawler_state, task.analysis_state, task.market_state);
            (state.tasks.clone(), stage_changed)
        };

        if stage_changed {
            self.cache.invalidate_prefix(cache_keys::TASK_LIST_PREFIX);
            self.cache
                .invalidate_prefix(&cache_keys::marketing_list_family(task_id));
        }
        self.publish(&snapshot);
        true
    }

    pub fn clear(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.tasks.clear();
            state.total_count = 0;
        }
        self.cache.invalidate_prefix(cache_keys::TASK_LIST_PREFIX);
        info!("🧹 Registry cleared");
        self.publish(&[]);
    }

    pub fn subscribe(&self, listener: TaskListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn publish(&self, snapshot: &[Task]) {
        let listeners: Vec<TaskListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    /// Persists which task is selected on a given page.
    pub fn select_task(&self, page: &str, task_id: Option<&str>) -> EngineResult<()> {
        let key = store_keys::selected_task(page);
        let result = match task_id {
            Some(task_id) => self.store.set(&key, &task_id),
            None => self.store.remove(&key).map(|_| ()),
        };
        result.map_err(|e| crate::domain::errors::EngineError::invalid(e.to_string()))
    }

    pub fn selected_task(&self, page: &str) -> Option<String> {
        self.store.get_string(&store_keys::selected_task(page))
    }

    /// Reloads the list on a fixed interval while any task is still running.
    pub fn spawn_auto_refresh(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.config.auto_refresh_interval();
        tokio::spawn(async move {
            info!("🔄 Auto refresh every {:?} while tasks are active", interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                if !registry.has_active_tasks() {
                    continue;
                }
                if let Err(e) = registry.reload().await {
                    error!("❌ Auto refresh failed: {}", e);
                }
            }
            debug!("Auto refresh stopped");
        })
    }
}
