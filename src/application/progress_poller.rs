//! Per-task progress polling
//!
//! Each `start` spawns one session task: an immediate fetch, then one fetch
//! per interval until the [`PollingSession`] rule says stop. Sessions are
//! cancelled through a [`CancellationToken`]; the loop races every fetch and
//! every sleep against it, so a superseded request is dropped mid-flight and
//! its response is never published.
//!
//! Fetches never take the 503 cache fallback: a cached snapshot is not a new
//! observation and must not count towards the stall rule.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::api::{CachePolicy, DashboardApi};
use crate::application::task_registry::TaskRegistry;
use crate::domain::errors::{EngineError, EngineResult, FailureReport};
use crate::domain::progress::{PollDecision, PollingSession, ProgressSnapshot, StopReason};
use crate::domain::task::TaskPatch;
use crate::infrastructure::cache_store::keys;
use crate::infrastructure::config::PollingConfig;

/// Which progress endpoint a session polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressChannel {
    Analysis { step_type: u32 },
    Marketing { is_all: bool },
}

impl ProgressChannel {
    pub fn cache_key(self, task_id: &str) -> String {
        match self {
            Self::Analysis { step_type } => keys::progress(task_id, step_type),
            Self::Marketing { is_all } => keys::marketing_progress(task_id, is_all),
        }
    }

    /// Registry fields that mirror a snapshot of this channel.
    fn patch(self, snapshot: &ProgressSnapshot) -> TaskPatch {
        match self {
            Self::Analysis { .. } => TaskPatch {
                analysis_progress: Some(snapshot.num),
                intent_count: Some(snapshot.ic_num),
                ..TaskPatch::default()
            },
            Self::Marketing { .. } => TaskPatch {
                market_progress: Some(snapshot.num),
                ..TaskPatch::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    Idle,
    Polling,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TerminationReason {
    Finished { reason: StopReason },
    Failed { failure: FailureReport },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ProgressEvent {
    Updated {
        task_id: String,
        channel: ProgressChannel,
        percent: u8,
        intent_percent: u8,
        snapshot: ProgressSnapshot,
    },
    Terminated {
        task_id: String,
        channel: ProgressChannel,
        reason: TerminationReason,
    },
}

impl ProgressEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Updated { task_id, .. } | Self::Terminated { task_id, .. } => task_id,
        }
    }
}

pub type ProgressListener = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Session {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ProgressPoller {
    api: Arc<DashboardApi>,
    registry: Arc<TaskRegistry>,
    config: PollingConfig,
    sessions: tokio::sync::Mutex<HashMap<String, Session>>,
    phases: Mutex<HashMap<String, (u64, PollPhase)>>,
    listeners: Mutex<HashMap<String, Vec<(ListenerId, ProgressListener)>>>,
    generation: AtomicU64,
    next_listener: AtomicU64,
}

impl ProgressPoller {
    pub fn new(api: Arc<DashboardApi>, registry: Arc<TaskRegistry>, config: PollingConfig) -> Self {
        Self {
            api,
            registry,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            phases: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        }
    }

    /// The analysis channel with the configured step type.
    pub const fn analysis_channel(&self) -> ProgressChannel {
        ProgressChannel::Analysis {
            step_type: self.config.analysis_step_type,
        }
    }

    /// Starts a fresh session for `task_id`, cancelling any running one first.
    ///
    /// The previous session's loop has fully exited when this returns, so none
    /// of its responses can be published afterwards.
    pub async fn start(self: &Arc<Self>, task_id: &str, channel: ProgressChannel) -> EngineResult<()> {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return Err(EngineError::invalid("progress polling needs a task id"));
        }

        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.remove(task_id) {
            debug!("Superseding polling session for {}", task_id);
            previous.cancel.cancel();
            let _ = previous.handle.await;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.set_phase(task_id, generation, PollPhase::Polling, true);

        let cancel = CancellationToken::new();
        let poller = Arc::clone(self);
        let handle = tokio::spawn(poller.run_session(
            task_id.to_string(),
            channel,
            generation,
            cancel.clone(),
        ));
        sessions.insert(
            task_id.to_string(),
            Session {
                generation,
                cancel,
                handle,
            },
        );
        info!("📡 Polling {} for task {}", channel_label(channel), task_id);
        Ok(())
    }

    /// Cancels the session for `task_id`. Returns whether one was running.
    ///
    /// Cancellation publishes no event.
    pub async fn stop(&self, task_id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(task_id);
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);

        let Some(session) = removed else {
            return false;
        };
        session.cancel.cancel();
        let _ = session.handle.await;
        info!("⏹️ Stopped polling task {}", task_id);
        true
    }

    /// Cancels every session.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, Session)> = self.sessions.lock().await.drain().collect();
        for (_, session) in &drained {
            session.cancel.cancel();
        }
        for (_, session) in drained {
            let _ = session.handle.await;
        }
        self.phases.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Sessions still registered, running or not yet collected.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn phase(&self, task_id: &str) -> PollPhase {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .map_or(PollPhase::Idle, |(_, phase)| *phase)
    }

    /// Last cached snapshot for the channel, without touching the network.
    pub fn latest(&self, task_id: &str, channel: ProgressChannel) -> Option<ProgressSnapshot> {
        self.api.cache().get_as(&channel.cache_key(task_id))
    }

    pub fn on_update(&self, task_id: &str, listener: ProgressListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task_id.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(existing, _)| *existing != id);
            removed |= entries.len() != before;
        }
        listeners.retain(|_, entries| !entries.is_empty());
        removed
    }

    async fn run_session(
        self: Arc<Self>,
        task_id: String,
        channel: ProgressChannel,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let finished = self.poll_until_done(&task_id, channel, generation, &cancel).await;
        if finished {
            self.collect_session(task_id, generation);
        }
    }

    /// Drops the registry entry of a session that ended on its own.
    ///
    /// Runs detached: `start` and `stop` hold the session lock while awaiting
    /// the old handle.
    fn collect_session(self: Arc<Self>, task_id: String, generation: u64) {
        tokio::spawn(async move {
            let mut sessions = self.sessions.lock().await;
            if sessions.get(&task_id).is_some_and(|s| s.generation == generation) {
                sessions.remove(&task_id);
                debug!("Collected finished polling session for {}", task_id);
            }
        });
    }

    /// Returns `true` when the session terminated, `false` when cancelled.
    async fn poll_until_done(
        &self,
        task_id: &str,
        channel: ProgressChannel,
        generation: u64,
        cancel: &CancellationToken,
    ) -> bool {
        let task_id = task_id.to_string();
        let mut session = PollingSession::new(task_id.as_str(), self.config.unchanged_threshold);
        let mut failures = 0u32;

        loop {
            let fetched = tokio::select! {
                biased;
                () = cancel.cancelled() => return false,
                result = self.fetch(&task_id, channel) => result,
            };
            if cancel.is_cancelled() {
                return false;
            }

            match fetched {
                Ok(snapshot) => {
                    failures = 0;
                    self.registry.apply_update(&task_id, &channel.patch(&snapshot));
                    let decision = session.advance(&snapshot);
                    debug!(
                        "Task {} progress {}/{} state={} -> {:?}",
                        task_id, snapshot.num, snapshot.sum, snapshot.state, decision
                    );
                    self.emit(&ProgressEvent::Updated {
                        task_id: task_id.clone(),
                        channel,
                        percent: snapshot.percent(),
                        intent_percent: snapshot.intent_percent(),
                        snapshot,
                    });
                    if let PollDecision::Stop(reason) = decision {
                        info!("✅ Polling for task {} finished: {:?}", task_id, reason);
                        self.terminate(&task_id, channel, generation, TerminationReason::Finished { reason });
                        return true;
                    }
                }
                Err(error) if error.is_cancelled() => return false,
                Err(error) => {
                    failures += 1;
                    if !error.is_recoverable() || failures >= self.config.max_consecutive_failures {
                        warn!("❌ Polling for task {} failed: {}", task_id, error);
                        self.terminate(
                            &task_id,
                            channel,
                            generation,
                            TerminationReason::Failed { failure: error.report() },
                        );
                        return true;
                    }
                    warn!(
                        "⚠️ Progress fetch for task {} failed ({}/{}): {}",
                        task_id, failures, self.config.max_consecutive_failures, error
                    );
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(self.config.interval()) => {}
            }
        }
    }

    async fn fetch(&self, task_id: &str, channel: ProgressChannel) -> EngineResult<ProgressSnapshot> {
        match channel {
            ProgressChannel::Analysis { step_type } => {
                self.api.progress(task_id, step_type, CachePolicy::NetworkOnly).await
            }
            ProgressChannel::Marketing { is_all } => {
                self.api
                    .marketing_progress(task_id, is_all, CachePolicy::NetworkOnly)
                    .await
            }
        }
    }

    fn terminate(&self, task_id: &str, channel: ProgressChannel, generation: u64, reason: TerminationReason) {
        self.set_phase(task_id, generation, PollPhase::Terminated, false);
        self.emit(&ProgressEvent::Terminated {
            task_id: task_id.to_string(),
            channel,
            reason,
        });
    }

    /// `force` installs a new generation; otherwise only the owning generation may write.
    fn set_phase(&self, task_id: &str, generation: u64, phase: PollPhase, force: bool) {
        let mut phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        match phases.get_mut(task_id) {
            Some(entry) if force || entry.0 == generation => *entry = (generation, phase),
            Some(_) => {}
            None if force => {
                phases.insert(task_id.to_string(), (generation, phase));
            }
            None => {}
        }
    }

    fn emit(&self, event: &ProgressEvent) {
        let listeners: Vec<ProgressListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.task_id())
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(event);
        }
    }
}

const fn channel_label(channel: ProgressChannel) -> &'static str {
    match channel {
        ProgressChannel::Analysis { .. } => "analysis progress",
        ProgressChannel::Marketing { .. } => "marketing progress",
    }
}
