//! End-to-end flow for one created task
//!
//! create -> monitor until marketing is ready -> fetch the marketing audience.
//! The derived [`FlowStatus`] is published on a `watch` channel; monitoring
//! is cancellable at any suspension point through [`TaskFlowManager::stop_monitoring`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::api::{Aweme, CreateTaskRequest, DashboardApi, MarketingUserFilter};
use crate::application::task_registry::TaskRegistry;
use crate::domain::errors::{EngineError, EngineResult, ErrorKind};
use crate::domain::flow_status::{FlowStatus, flow_status_of};
use crate::domain::task::Platform;
use crate::infrastructure::config::FlowSettings;
use crate::infrastructure::local_store::{LocalStore, keys};

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub platform: Platform,
    pub keyword: String,
    #[serde(default)]
    pub awemes: Vec<Aweme>,
    #[serde(default = "default_lt")]
    pub lt: String,
    #[serde(default = "default_crawler_type")]
    pub crawler_type: String,
    #[serde(default = "default_start_page")]
    pub start_page: u32,
}

fn default_lt() -> String {
    "qrcode".to_string()
}

fn default_crawler_type() -> String {
    "detail".to_string()
}

const fn default_start_page() -> u32 {
    1
}

impl FlowConfig {
    pub fn new(platform: Platform, keyword: impl Into<String>) -> Self {
        Self {
            platform,
            keyword: keyword.into(),
            awemes: Vec::new(),
            lt: default_lt(),
            crawler_type: default_crawler_type(),
            start_page: default_start_page(),
        }
    }

    #[must_use]
    pub fn with_awemes(mut self, awemes: Vec<Aweme>) -> Self {
        self.awemes = awemes;
        self
    }

    /// Builds the creation body, rejecting configs the server would refuse.
    pub fn to_request(&self) -> EngineResult<CreateTaskRequest> {
        if self.keyword.trim().is_empty() {
            return Err(EngineError::invalid("flow keyword must not be empty"));
        }
        if matches!(&self.platform, Platform::Other(raw) if raw.trim().is_empty()) {
            return Err(EngineError::invalid("flow platform must not be empty"));
        }
        if self.start_page == 0 {
            return Err(EngineError::invalid("start_page starts at 1"));
        }
        if let Some(aweme) = self.awemes.iter().find(|a| a.id.trim().is_empty()) {
            return Err(EngineError::invalid(format!(
                "aweme '{}' has no id",
                aweme.title
            )));
        }

        Ok(CreateTaskRequest {
            platform: self.platform.clone(),
            keyword: self.keyword.trim().to_string(),
            awemes: self.awemes.clone(),
            lt: self.lt.clone(),
            crawler_type: self.crawler_type.clone(),
            start_page: self.start_page,
        })
    }
}

/// Record persisted under `task_{id}` when a flow creates a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub platform: Platform,
    pub keyword: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub awemes: Vec<Aweme>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowOutcome {
    pub task_id: String,
    pub status: FlowStatus,
    pub marketing_users: Vec<Value>,
}

pub struct TaskFlowManager {
    flow_id: Uuid,
    api: Arc<DashboardApi>,
    registry: Arc<TaskRegistry>,
    store: Arc<LocalStore>,
    settings: FlowSettings,
    config: FlowConfig,
    status: watch::Sender<FlowStatus>,
    task_id: Mutex<Option<String>>,
    cancel: CancellationToken,
    monitoring: AtomicBool,
}

impl TaskFlowManager {
    pub fn new(
        api: Arc<DashboardApi>,
        registry: Arc<TaskRegistry>,
        store: Arc<LocalStore>,
        settings: FlowSettings,
        config: FlowConfig,
    ) -> Self {
        let (status, _) = watch::channel(FlowStatus::Created);
        Self {
            flow_id: Uuid::new_v4(),
            api,
            registry,
            store,
            settings,
            config,
            status,
            task_id: Mutex::new(None),
            cancel: CancellationToken::new(),
            monitoring: AtomicBool::new(false),
        }
    }

    /// Correlates this flow's log lines.
    pub const fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    pub fn status(&self) -> FlowStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowStatus> {
        self.status.subscribe()
    }

    pub fn task_id(&self) -> Option<String> {
        self.task_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    /// Runs the whole flow.
    ///
    /// On failure the status moves to `Error` and the error is returned.
    /// `stop_monitoring` yields `Cancelled` and leaves the status where it
    /// was; the remote task is left alone. A stop issued while the task is
    /// still being created takes effect as soon as creation returns.
    pub async fn start_flow(&self) -> EngineResult<FlowOutcome> {
        let cancel = &self.cancel;
        let task_id = self.create().await?;
        if cancel.is_cancelled() {
            info!("⏹️ Flow {} stopped before monitoring task {}", self.flow_id, task_id);
            return Err(EngineError::Cancelled);
        }

        if let Err(e) = self.monitor(&task_id, cancel).await {
            return Err(self.fail(e));
        }

        let filter = MarketingUserFilter::default();
        let users = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(EngineError::Cancelled),
            users = self.api.marketing_users(&task_id, &filter) => users,
        };
        match users {
            Ok(marketing_users) => {
                info!("🎯 Flow for task {} complete: {} marketing users", task_id, marketing_users.len());
                Ok(FlowOutcome {
                    task_id,
                    status: self.status(),
                    marketing_users,
                })
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Creates the task and persists its summary without monitoring.
    pub async fn create_only(&self) -> EngineResult<String> {
        self.create().await
    }

    /// Aborts the current wait or poll immediately.
    pub fn stop_monitoring(&self) {
        self.cancel.cancel();
        if self.monitoring.swap(false, Ordering::SeqCst) {
            info!("⏹️ Flow monitoring stopped");
        }
    }

    /// Marketing audience for the created task.
    pub async fn fetch_marketing_users(&self, filter: &MarketingUserFilter) -> EngineResult<Vec<Value>> {
        let task_id = self
            .task_id()
            .ok_or_else(|| EngineError::invalid("no task created by this flow yet"))?;
        self.api.marketing_users(&task_id, filter).await
    }

    async fn create(&self) -> EngineResult<String> {
        if self.task_id().is_some() {
            return Err(EngineError::invalid("this flow already created a task"));
        }
        let request = self.config.to_request()?;
        info!("🚀 Flow {} creating {} task '{}'", self.flow_id, request.platform, request.keyword);

        let task_id = match self.api.create_task(&request).await {
            Ok(task_id) => task_id,
            Err(e) => return Err(self.fail(e)),
        };
        *self.task_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(task_id.clone());

        let summary = TaskSummary {
            task_id: task_id.clone(),
            platform: request.platform,
            keyword: request.keyword,
            status: "created".to_string(),
            created_at: Utc::now(),
            awemes: request.awemes,
        };
        if let Err(e) = self.store.set(&keys::task_summary(&task_id), &summary) {
            warn!("⚠️ Could not persist summary for task {}: {}", task_id, e);
        }
        Ok(task_id)
    }

    async fn monitor(&self, task_id: &str, cancel: &CancellationToken) -> EngineResult<()> {
        self.monitoring.store(true, Ordering::SeqCst);
        let result = self.monitor_loop(task_id, cancel).await;
        self.monitoring.store(false, Ordering::SeqCst);
        result
    }

    async fn monitor_loop(&self, task_id: &str, cancel: &CancellationToken) -> EngineResult<()> {
        let started = Instant::now();
        let deadline = started + self.settings.max_wait();
        info!("👀 Monitoring task {} (every {:?}, up to {:?})", task_id, self.settings.check_interval(), self.settings.max_wait());

        loop {
            let listed = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(EngineError::Cancelled),
                listed = self.registry.refresh(0, self.settings.monitor_page_size) => listed,
            };

            match listed {
                Ok(tasks) => match tasks.iter().find(|task| task.task_id == task_id) {
                    Some(task) => {
                        let status = flow_status_of(task);
                        self.observe(status);
                        match status {
                            FlowStatus::MarketingReady => return Ok(()),
                            FlowStatus::Error => {
                                return Err(EngineError::TaskFailed {
                                    task_id: task_id.to_string(),
                                    message: task
                                        .error_message
                                        .clone()
                                        .unwrap_or_else(|| "task reported an error".to_string()),
                                });
                            }
                            _ => {}
                        }
                    }
                    None => warn!("⚠️ Task {} not in the first {} listed tasks", task_id, self.settings.monitor_page_size),
                },
                Err(e) if e.kind() == ErrorKind::Unauthenticated => return Err(e),
                Err(e) => warn!("⚠️ Monitor tick for task {} failed, continuing: {}", task_id, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout(task_id, started));
            }
            let pause = self.settings.check_interval().min(deadline - now);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(EngineError::Cancelled),
                () = tokio::time::sleep(pause) => {}
            }
            if Instant::now() >= deadline {
                return Err(self.timeout(task_id, started));
            }
        }
    }

    fn timeout(&self, task_id: &str, started: Instant) -> EngineError {
        EngineError::MonitorTimeout {
            task_id: task_id.to_string(),
            waited_secs: started.elapsed().as_secs(),
        }
    }

    fn observe(&self, next: FlowStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!("⚠️ Ignoring flow transition {} -> {}", current, next);
                return false;
            }
            if current.is_backward(next) {
                warn!("⚠️ Flow status moved backwards: {} -> {}", current, next);
            }
            info!("🔀 Flow status {} -> {}", current, next);
            *current = next;
            true
        });
    }

    /// Moves to `Error` unless the failure is a cancellation.
    ///
    /// Unlike observed transitions this also leaves `MarketingReady`: the
    /// audience fetch can still fail after the task itself is done.
    fn fail(&self, error: EngineError) -> EngineError {
        if !error.is_cancelled() {
            error!("❌ Flow {} failed: {}", self.flow_id, error);
            self.status.send_if_modified(|current| {
                if *current == FlowStatus::Error {
                    return false;
                }
                info!("🔀 Flow status {} -> {}", current, FlowStatus::Error);
                *current = FlowStatus::Error;
                true
            });
        }
        error
    }
}
