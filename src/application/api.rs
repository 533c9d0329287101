//! Typed client over the dashboard backend
//!
//! Each method maps one endpoint onto domain types, checks the JSON
//! envelope's own `status` field, and applies the cache policy of its
//! resource family. Cached families fall back to their freshest live entry
//! when the server answers 503.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::progress::ProgressSnapshot;
use crate::domain::task::{Platform, RawTask, Task, counter};
use crate::infrastructure::cache_store::{CacheStore, keys};
use crate::infrastructure::config::CacheConfig;
use crate::infrastructure::request_gateway::{ApiRequest, RequestGateway};

/// `task_step_type` the backend uses for the marketing stage.
pub const MARKETING_STEP_TYPE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Serve a live cached entry if there is one.
    PreferCache,
    /// Always hit the network; the result still refreshes the cache.
    Refresh,
    /// Like `Refresh`, but a 503 surfaces as an error instead of a cached answer.
    NetworkOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPage {
    pub offset: u32,
    pub count: u32,
    pub tasks: Vec<Task>,
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aweme {
    pub id: String,
    pub title: String,
    pub xsec_token: String,
}

/// Body of `POST /comment_crawler`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub platform: Platform,
    pub keyword: String,
    pub awemes: Vec<Aweme>,
    pub lt: String,
    pub crawler_type: String,
    pub start_page: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketingUserFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketingPage {
    pub items: Vec<Value>,
    pub total: Option<u64>,
}

pub struct DashboardApi {
    gateway: Arc<RequestGateway>,
    cache: Arc<CacheStore>,
    ttl: CacheConfig,
}

impl DashboardApi {
    pub const fn new(gateway: Arc<RequestGateway>, cache: Arc<CacheStore>, ttl: CacheConfig) -> Self {
        Self { gateway, cache, ttl }
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Calls through the gateway and validates the envelope.
    async fn fetch(&self, request: ApiRequest) -> EngineResult<Value> {
        let path = request.path.clone();
        let body = self.gateway.call(request).await?;
        self.check_envelope(&path, body)
    }

    fn check_envelope(&self, path: &str, body: Value) -> EngineResult<Value> {
        let status = match body.get("status") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse::<u64>().ok(),
            _ => None,
        };
        let message = ["msg", "message"]
            .iter()
            .find_map(|field| body.get(*field).and_then(Value::as_str))
            .unwrap_or("request rejected")
            .to_string();

        match status {
            None | Some(200) => Ok(body),
            Some(401) => {
                self.gateway
                    .credentials()
                    .invalidate_session(&format!("{path} answered status 401"));
                Err(EngineError::unauthenticated(Some(401), message))
            }
            Some(code) => {
                let code = u16::try_from(code).unwrap_or(u16::MAX);
                warn!("❌ {} envelope status {}: {}", path, code, message);
                Err(EngineError::server_rejected(code, message))
            }
        }
    }

    /// Answers a 503 from the freshest live entry under `prefix`.
    fn fallback<T: serde::de::DeserializeOwned>(
        &self,
        error: EngineError,
        prefixes: &[&str],
    ) -> EngineResult<T> {
        if error.is_service_unavailable() {
            for prefix in prefixes {
                if let Some((key, value)) = self.cache.freshest_as::<T>(prefix) {
                    warn!("🛟 503 from server, serving cached '{}'", key);
                    return Ok(value);
                }
            }
        }
        Err(error)
    }

    pub async fn login(&self, username: &str, password: &str) -> EngineResult<String> {
        let request = ApiRequest::post("login", json!({}))
            .query("username", username)
            .query("password", password)
            .unauthenticated();
        let body = self.fetch(request).await?;
        let token = body
            .get("token")
            .or_else(|| body.pointer("/data/token"))
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| EngineError::decode("login response carries no token"))?
            .to_string();

        self.gateway
            .credentials()
            .store_token(&token)
            .map_err(|e| EngineError::invalid(format!("could not persist token: {e}")))?;
        info!("🔓 Logged in as {}", username);
        Ok(token)
    }

    pub async fn task_list(&self, offset: u32, count: u32, policy: CachePolicy) -> EngineResult<TaskPage> {
        let key = keys::task_list(offset, count);
        if policy == CachePolicy::PreferCache {
            if let Some(page) = self.cache.get_as::<TaskPage>(&key) {
                debug!("📦 task_list {}:{} from cache", offset, count);
                return Ok(page);
            }
        }

        let request = ApiRequest::get("task_list")
            .query("offset", offset)
            .query("count", count);
        let body = match self.fetch(request).await {
            Ok(body) => body,
            Err(error) if policy == CachePolicy::NetworkOnly => return Err(error),
            Err(error) => {
                // only pages cached for this offset; another offset's page would merge wrongly
                let same_offset = format!("{}{offset}:", keys::TASK_LIST_PREFIX);
                return self.fallback(error, &[same_offset.as_str()]);
            }
        };

        let page = parse_task_page(&body, offset, count)?;
        self.cache.set_as(key, &page, self.ttl.task_list_ttl());
        Ok(page)
    }

    /// Creates a crawl task and returns its id.
    pub async fn create_task(&self, request: &CreateTaskRequest) -> EngineResult<String> {
        let body = serde_json::to_value(request)
            .map_err(|e| EngineError::invalid(format!("unserializable task request: {e}")))?;
        let response = self.fetch(ApiRequest::post("comment_crawler", body)).await?;

        let task_id = response
            .get("task_id")
            .or_else(|| response.pointer("/data/task_id"))
            .and_then(|id| match id {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| EngineError::decode("creation response carries no task_id"))?;

        self.cache.invalidate_prefix(keys::TASK_LIST_PREFIX);
        info!("🆕 Task created: {} ({})", task_id, request.keyword);
        Ok(task_id)
    }

    pub async fn progress(&self, task_id: &str, step_type: u32, policy: CachePolicy) -> EngineResult<ProgressSnapshot> {
        let key = keys::progress(task_id, step_type);
        if policy == CachePolicy::PreferCache {
            if let Some(snapshot) = self.cache.get_as(&key) {
                return Ok(snapshot);
            }
        }

        let request = ApiRequest::get("progress")
            .query("task_id", task_id)
            .query("step_type", step_type);
        let body = match self.fetch(request).await {
            Ok(body) => body,
            Err(error) if policy == CachePolicy::NetworkOnly => return Err(error),
            Err(error) => return self.fallback(error, &[key.as_str()]),
        };

        let snapshot = parse_snapshot(&body)?;
        self.cache.set_as(key, &snapshot, self.ttl.progress_ttl());
        Ok(snapshot)
    }

    pub async fn marketing_progress(&self, task_id: &str, is_all: bool, policy: CachePolicy) -> EngineResult<ProgressSnapshot> {
        let key = keys::marketing_progress(task_id, is_all);
        if policy == CachePolicy::PreferCache {
            if let Some(snapshot) = self.cache.get_as(&key) {
                return Ok(snapshot);
            }
        }

        let request = ApiRequest::get("marketing_progress")
            .query("task_id", task_id)
            .query("is_all", u8::from(is_all));
        let body = match self.fetch(request).await {
            Ok(body) => body,
            Err(error) if policy == CachePolicy::NetworkOnly => return Err(error),
            Err(error) => {
                let family = keys::marketing_progress_family(task_id);
                return self.fallback(error, &[key.as_str(), family.as_str()]);
            }
        };

        let snapshot = parse_snapshot(&body)?;
        self.cache.set_as(key, &snapshot, self.ttl.marketing_ttl());
        Ok(snapshot)
    }

    pub async fn marketing_users(&self, task_id: &str, filter: &MarketingUserFilter) -> EngineResult<Vec<Value>> {
        let mut body = json!({ "task_id": task_id, "task_step_type": MARKETING_STEP_TYPE });
        if let (Value::Object(target), Ok(Value::Object(extra))) = (&mut body, serde_json::to_value(filter)) {
            target.extend(extra);
        }

        let response = self
            .fetch(ApiRequest::post("get_simple_marketing_user", body))
            .await?;
        let users = response
            .get("data")
            .filter(|data| data.is_array())
            .or_else(|| response.get("users"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        debug!("👥 {} marketing users for {}", users.len(), task_id);
        Ok(users)
    }

    /// Marketing audience page. Later pages are sliced out of a cached first
    /// page of the same size when it already covers them.
    pub async fn marketing_list(&self, task_id: &str, offset: u32, count: u32, policy: CachePolicy) -> EngineResult<MarketingPage> {
        let key = keys::marketing_list(task_id, offset, count);
        let base_key = keys::marketing_list(task_id, 0, count);

        if policy == CachePolicy::PreferCache {
            if let Some(page) = self.cache.get_as::<MarketingPage>(&key) {
                return Ok(page);
            }
            if let Some(page) = self.slice_base_page(&base_key, offset, count) {
                return Ok(page);
            }
        }

        let request = ApiRequest::get("get_marketing_list")
            .query("task_id", task_id)
            .query("task_step_type", MARKETING_STEP_TYPE)
            .query("offset", offset)
            .query("count", count);
        let body = match self.fetch(request).await {
            Ok(body) => body,
            Err(error) => {
                if error.is_service_unavailable() {
                    if let Some(page) = self.slice_base_page(&base_key, offset, count) {
                        warn!("🛟 503 from server, slicing cached first page for {}", task_id);
                        return Ok(page);
                    }
                }
                let family = keys::marketing_list_family(task_id);
                return self.fallback(error, &[family.as_str()]);
            }
        };

        let page = MarketingPage {
            items: body
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            total: body.get("total").map(|v| counter(Some(v))),
        };
        self.cache.set_as(key, &page, self.ttl.marketing_ttl());
        Ok(page)
    }

    fn slice_base_page(&self, base_key: &str, offset: u32, count: u32) -> Option<MarketingPage> {
        if offset == 0 {
            return None;
        }
        let base = self.cache.get_as::<MarketingPage>(base_key)?;
        let start = offset as usize;
        if base.items.len() <= start {
            return None;
        }
        let end = (start + count as usize).min(base.items.len());
        Some(MarketingPage {
            items: base.items[start..end].to_vec(),
            total: base.total,
        })
    }

    pub async fn quota(&self, policy: CachePolicy) -> EngineResult<Value> {
        if policy == CachePolicy::PreferCache {
            if let Some(quota) = self.cache.get(keys::QUOTA) {
                return Ok(quota);
            }
        }
        let body = match self.fetch(ApiRequest::get("quota")).await {
            Ok(body) => body,
            Err(error) => return self.fallback(error, &[keys::QUOTA]),
        };
        let quota = body.get("data").cloned().unwrap_or(body);
        self.cache.set(keys::QUOTA, quota.clone(), self.ttl.quota_ttl());
        Ok(quota)
    }

    /// Stops server-side analysis and drops every derived view of the task.
    pub async fn stop_analysis(&self, task_id: &str) -> EngineResult<()> {
        self.fetch(ApiRequest::post("stop_analysis", json!({ "task_id": task_id })))
            .await?;
        self.cache.invalidate_prefix(&keys::task_prefix(task_id));
        self.cache.invalidate_prefix(keys::TASK_LIST_PREFIX);
        info!("⏹️ Analysis stopped for {}", task_id);
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        self.ttl.default_ttl()
    }
}

fn parse_task_page(body: &Value, offset: u32, count: u32) -> EngineResult<TaskPage> {
    let entries = body
        .pointer("/data/task_list")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::decode("task_list response has no data.task_list"))?;

    let tasks: Vec<Task> = entries
        .iter()
        .filter_map(|entry| serde_json::from_value::<RawTask>(entry.clone()).ok())
        .filter_map(RawTask::normalize)
        .collect();
    let dropped = entries.len() - tasks.len();
    if dropped > 0 {
        debug!("Dropped {} task entries without a usable task_id", dropped);
    }

    let total_count = body
        .pointer("/data/total_count")
        .or_else(|| body.get("total_count"))
        .map_or(tasks.len() as u64, |v| counter(Some(v)));

    Ok(TaskPage {
        offset,
        count,
        tasks,
        total_count,
    })
}

fn parse_snapshot(body: &Value) -> EngineResult<ProgressSnapshot> {
    let data = body
        .get("data")
        .filter(|data| data.is_object())
        .ok_or_else(|| EngineError::decode("progress response has no data object"))?;
    Ok(ProgressSnapshot {
        num: counter(data.get("num")),
        sum: counter(data.get("sum")),
        state: data.get("state").and_then(Value::as_i64).unwrap_or(0),
        ic_num: counter(data.get("ic_num")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Reply, TestContext, progress_body, raw_task, task_list_body};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn task_list_is_normalized_and_cached() {
        let ctx = TestContext::new();
        ctx.transport.push(
            "/task_list",
            Reply::ok(task_list_body(
                &[raw_task("a", "crawling", "initial", "initial"), json!({ "keyword": "orphan" })],
                7,
            )),
        );
        let api = &ctx.engine.api;

        let page = api.task_list(0, 50, CachePolicy::PreferCache).await.unwrap();
        assert_eq!(page.tasks.len(), 1);
        assert_eq!(page.total_count, 7);

        api.task_list(0, 50, CachePolicy::PreferCache).await.unwrap();
        assert_eq!(ctx.transport.call_count("/task_list"), 1);

        api.task_list(0, 50, CachePolicy::Refresh).await.unwrap();
        assert_eq!(ctx.transport.call_count("/task_list"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn envelope_status_is_checked() {
        let ctx = TestContext::new();
        ctx.transport
            .push("/quota", Reply::ok(json!({ "status": 500, "msg": "quota backend down" })));

        let err = ctx.engine.api.quota(CachePolicy::Refresh).await.unwrap_err();
        assert_eq!(err, EngineError::server_rejected(500, "quota backend down"));
    }

    #[tokio::test(start_paused = true)]
    async fn envelope_401_resets_session() {
        let ctx = TestContext::new();
        ctx.transport.push("/quota", Reply::ok(json!({ "status": 401 })));

        let err = ctx.engine.api.quota(CachePolicy::Refresh).await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthenticated { status: Some(401), .. }));
        assert!(ctx.engine.credentials.token().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn marketing_progress_falls_back_on_503() {
        let ctx = TestContext::new();
        ctx.transport.push("/marketing_progress", Reply::ok(progress_body(4, 10, 1)));
        ctx.transport
            .push("/marketing_progress", Reply::status(503, json!({})));
        let api = &ctx.engine.api;

        let fresh = api.marketing_progress("t", true, CachePolicy::Refresh).await.unwrap();
        assert_eq!(fresh.num, 4);

        // the filtered view was never fetched; the family fallback still answers
        let cached = api.marketing_progress("t", false, CachePolicy::Refresh).await.unwrap();
        assert_eq!(cached, fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn network_only_surfaces_503() {
        let ctx = TestContext::new();
        ctx.transport.push("/progress", Reply::ok(progress_body(1, 10, 1)));
        ctx.transport.push("/progress", Reply::status(503, json!({})));
        let api = &ctx.engine.api;

        api.progress("t", 2, CachePolicy::NetworkOnly).await.unwrap();
        let err = api.progress("t", 2, CachePolicy::NetworkOnly).await.unwrap_err();
        assert!(err.is_service_unavailable());
        assert_eq!(api.progress("t", 2, CachePolicy::Refresh).await.unwrap().num, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn task_list_fallback_stays_on_the_requested_offset() {
        let ctx = TestContext::new();
        ctx.transport.push(
            "/task_list",
            Reply::ok(task_list_body(&[raw_task("a", "finish", "initial", "initial")], 80)),
        );
        ctx.transport.push("/task_list", Reply::status(503, json!({})));
        let api = &ctx.engine.api;

        api.task_list(0, 50, CachePolicy::Refresh).await.unwrap();
        let err = api.task_list(50, 50, CachePolicy::Refresh).await.unwrap_err();
        assert!(err.is_service_unavailable());

        let cached = api.task_list(0, 20, CachePolicy::Refresh).await.unwrap();
        assert_eq!(cached.offset, 0);
        assert_eq!(cached.tasks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_503_failures_do_not_fall_back() {
        let ctx = TestContext::new();
        ctx.transport.push("/progress", Reply::ok(progress_body(1, 10, 1)));
        ctx.transport.push("/progress", Reply::status(500, json!({})));
        let api = &ctx.engine.api;

        api.progress("t", 2, CachePolicy::Refresh).await.unwrap();
        let err = api.progress("t", 2, CachePolicy::Refresh).await.unwrap_err();
        assert_eq!(err.http_status(), Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn marketing_list_slices_cached_first_page() {
        let ctx = TestContext::new();
        let items: Vec<Value> = (0..20).map(|i| json!({ "uid": i })).collect();
        ctx.transport.push(
            "/get_marketing_list",
            Reply::ok(json!({ "status": 200, "data": items, "total": 20 })),
        );
        let api = &ctx.engine.api;

        let first = api.marketing_list("t", 0, 10, CachePolicy::PreferCache).await.unwrap();
        assert_eq!(first.items.len(), 20);

        let second = api.marketing_list("t", 10, 10, CachePolicy::PreferCache).await.unwrap();
        assert_eq!(second.items.len(), 10);
        assert_eq!(second.items[0]["uid"], 10);
        assert_eq!(ctx.transport.call_count("/get_marketing_list"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn marketing_users_posts_step_type_and_filters() {
        let ctx = TestContext::new();
        ctx.transport.push(
            "/get_simple_marketing_user",
            Reply::ok(json!({ "status": 200, "users": [{ "uid": 1 }, { "uid": 2 }] })),
        );
        let filter = MarketingUserFilter {
            ip_location: Some("Shanghai".into()),
            ..MarketingUserFilter::default()
        };

        let users = ctx.engine.api.marketing_users("t9", &filter).await.unwrap();
        assert_eq!(users.len(), 2);

        let call = &ctx.transport.calls_to("/get_simple_marketing_user")[0];
        let body = call.request.body.clone().unwrap();
        assert_eq!(body["task_step_type"], 3);
        assert_eq!(body["ip_location"], "Shanghai");
        assert!(body.get("start_time").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn login_stores_token() {
        let ctx = TestContext::new();
        ctx.engine.credentials.invalidate_session("test");
        ctx.transport
            .push("/login", Reply::ok(json!({ "status": 200, "token": "fresh" })));

        ctx.engine.api.login("ops", "pw").await.unwrap();
        assert_eq!(ctx.engine.credentials.token().as_deref(), Some("fresh"));
        let call = &ctx.transport.calls_to("/login")[0];
        assert_eq!(call.query("username").as_deref(), Some("ops"));
        assert!(call.authorization.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_analysis_drops_task_views() {
        let ctx = TestContext::new();
        ctx.transport.push("/progress", Reply::ok(progress_body(1, 10, 1)));
        ctx.transport.push("/stop_analysis", Reply::ok(json!({ "status": 200 })));
        let api = &ctx.engine.api;

        api.progress("t", 2, CachePolicy::Refresh).await.unwrap();
        assert!(api.cache().get(&keys::progress("t", 2)).is_some());

        api.stop_analysis("t").await.unwrap();
        assert!(api.cache().get(&keys::progress("t", 2)).is_none());
    }
}
