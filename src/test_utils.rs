//! Test utilities for the engine
//!
//! Provides an in-memory [`HttpTransport`] whose replies are scripted per URL
//! path, plus a [`TestContext`] that wires a full [`EngineContext`] on top of
//! it. Everything runs on tokio's clock, so tests using
//! `#[tokio::test(start_paused = true)]` observe exact virtual timestamps.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::application::engine::EngineContext;
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::http_transport::{
    HttpTransport, OutboundRequest, RawResponse, TransportError,
};
use crate::infrastructure::local_store::LocalStore;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub struct Reply {
    outcome: Result<RawResponse, TransportError>,
    latency: Duration,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: Value) -> Self {
        Self {
            outcome: Ok(RawResponse::json(status, &body)),
            latency: Duration::ZERO,
        }
    }

    pub fn raw(status: u16, body: Vec<u8>) -> Self {
        Self {
            outcome: Ok(RawResponse { status, body }),
            latency: Duration::ZERO,
        }
    }

    pub fn fail(error: TransportError) -> Self {
        Self {
            outcome: Err(error),
            latency: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn after(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// A dispatch as the transport saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub path: String,
    pub request: OutboundRequest,
    pub authorization: Option<String>,
}

impl RecordedCall {
    pub fn query(&self, key: &str) -> Option<String> {
        self.request
            .url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

/// Replies are queued per path; the last reply for a path repeats forever.
/// Unscripted paths answer 404.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, path: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn push_with_latency(&self, path: &str, reply: Reply, latency: Duration) {
        self.push(path, reply.after(latency));
    }

    /// Drops anything still queued for `path`.
    pub fn reset(&self, path: &str) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    fn next_reply(&self, path: &str) -> Option<Reply> {
        let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = replies.get_mut(path)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|call| call.path == path).collect()
    }

    pub fn call_count(&self, path: &str) -> usize {
        self.calls_to(path).len()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn dispatch_times(&self) -> Vec<Instant> {
        self.calls().iter().map(|call| call.at).collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<RawResponse, TransportError> {
        let path = request.url.path().to_string();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                at: Instant::now(),
                path: path.clone(),
                request: request.clone(),
                authorization: request.authorization.clone(),
            });

        let Some(reply) = self.next_reply(&path) else {
            return Ok(RawResponse::json(404, &serde_json::json!({ "msg": "not scripted" })));
        };
        if !reply.latency.is_zero() {
            tokio::time::sleep(reply.latency).await;
        }
        reply.outcome
    }
}

/// Config tuned for tests: root base URL and an in-memory store.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.api.base_url = "http://engine.test/".to_string();
    config.storage.local_store_path = Some(std::path::PathBuf::new());
    config
}

/// Fully wired engine over a scripted transport, logged in with token `test-token`.
pub struct TestContext {
    pub transport: Arc<ScriptedTransport>,
    pub store: Arc<LocalStore>,
    pub engine: EngineContext,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(LocalStore::in_memory());
        store
            .set(crate::infrastructure::local_store::keys::TOKEN, &"test-token")
            .unwrap_or_else(|e| panic!("in-memory store rejected token: {e}"));
        let engine = EngineContext::with_parts(config, transport.clone(), store.clone())
            .unwrap_or_else(|e| panic!("test engine failed to build: {e}"));
        Self {
            transport,
            store,
            engine,
        }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Task-list envelope as the server returns it.
pub fn task_list_body(tasks: &[Value], total_count: u64) -> Value {
    serde_json::json!({
        "status": 200,
        "data": { "task_list": tasks, "total_count": total_count }
    })
}

/// Minimal raw task entry.
pub fn raw_task(task_id: &str, crawler: &str, analysis: &str, market: &str) -> Value {
    serde_json::json!({
        "task_id": task_id,
        "keyword": format!("kw-{task_id}"),
        "platform": "dy",
        "crawler_state": crawler,
        "analysis_state": analysis,
        "market_state": market,
    })
}

/// Progress envelope.
pub fn progress_body(num: u64, sum: u64, state: i64) -> Value {
    serde_json::json!({
        "status": 200,
        "data": { "num": num, "sum": sum, "state": state, "ic_num": 0 }
    })
}
