//! Request gateway: the single path every outbound API call takes
//!
//! Per call, in order:
//! 1. Bearer token lookup (missing token fails fast and resets the session)
//! 2. In-flight coalescing keyed by `blake3(method, url, canonical body)`
//! 3. For each attempt: global minimum-interval throttle, dispatch under a
//!    fixed deadline, status interpretation
//! 4. Network-level failures retry with a fixed delay up to the attempt cap
//!
//! Only the caller that starts a call pays for throttling and retries;
//! coalesced callers just await the shared result. The gateway never caches.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::errors::{EngineError, EngineResult};
use crate::infrastructure::config::GatewayConfig;
use crate::infrastructure::credentials::CredentialStore;
use crate::infrastructure::http_transport::{
    HttpMethod, HttpTransport, OutboundRequest, RawResponse,
};
use crate::infrastructure::single_flight::SingleFlight;

/// Relative API request, resolved against the gateway's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub authenticated: bool,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
            authenticated: true,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
            authenticated: true,
        }
    }

    #[must_use]
    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub const fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }
}

/// Canonical identity of a request for coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    /// `serde_json::Value` objects are key-sorted, so the body's textual
    /// form is already canonical.
    pub fn new(method: HttpMethod, url: &Url, body: Option<&Value>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_str().as_bytes());
        hasher.update(b"\n");
        if let Some(body) = body {
            hasher.update(body.to_string().as_bytes());
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Enforces a minimum spacing between consecutive dispatches, process-wide.
#[derive(Debug)]
pub struct DispatchThrottle {
    min_interval: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl DispatchThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_dispatch: Mutex::new(None),
        }
    }

    /// Waits until a dispatch is allowed and records the dispatch time.
    ///
    /// The lock is held across the wait so waiters are released one interval
    /// apart, in arrival order.
    pub async fn acquire(&self) -> Instant {
        let mut last = self.last_dispatch.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if Instant::now() < ready_at {
                debug!("⏳ Throttling dispatch for {:?}", ready_at - Instant::now());
                sleep_until(ready_at).await;
            }
        }
        let now = Instant::now();
        *last = Some(now);
        now
    }

    pub async fn last_dispatch(&self) -> Option<Instant> {
        *self.last_dispatch.lock().await
    }
}

#[derive(Debug, Default)]
pub struct GatewayStats {
    calls: AtomicU64,
    dispatches: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct GatewayStatsSnapshot {
    pub calls: u64,
    /// Wire attempts, retries included.
    pub dispatches: u64,
    pub coalesced: u64,
    pub retries: u64,
    pub failures: u64,
}

/// Everything an in-flight call needs once detached from its caller.
struct Dispatcher {
    transport: Arc<dyn HttpTransport>,
    credentials: CredentialStore,
    throttle: DispatchThrottle,
    config: GatewayConfig,
    stats: GatewayStats,
}

pub struct RequestGateway {
    base_url: Url,
    dispatcher: Arc<Dispatcher>,
    flights: SingleFlight<DedupKey, EngineResult<Value>>,
}

impl RequestGateway {
    pub fn new(
        base_url: &str,
        transport: Arc<dyn HttpTransport>,
        credentials: CredentialStore,
        config: GatewayConfig,
    ) -> EngineResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| EngineError::invalid(format!("bad base url '{base_url}': {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        info!(
            "🚀 RequestGateway ready: base={}, min_interval={:?}, timeout={:?}, attempts={}",
            base_url,
            config.min_interval(),
            config.timeout(),
            config.max_attempts
        );

        Ok(Self {
            base_url,
            dispatcher: Arc::new(Dispatcher {
                transport,
                credentials,
                throttle: DispatchThrottle::new(config.min_interval()),
                config,
                stats: GatewayStats::default(),
            }),
            flights: SingleFlight::new(),
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.dispatcher.credentials
    }

    pub fn resolve(&self, request: &ApiRequest) -> EngineResult<Url> {
        let mut url = self
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|e| EngineError::invalid(format!("bad path '{}': {e}", request.path)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }

    /// Issues `request` and returns the decoded JSON body of a 200 response.
    pub async fn call(&self, request: ApiRequest) -> EngineResult<Value> {
        self.dispatcher.stats.calls.fetch_add(1, Ordering::Relaxed);
        let url = self.resolve(&request)?;

        if request.authenticated && self.dispatcher.credentials.token().is_none() {
            self.dispatcher.credentials.invalidate_session("no stored credential");
            return Err(EngineError::unauthenticated(None, "no stored credential"));
        }

        let key = DedupKey::new(request.method, &url, request.body.as_ref());
        let authenticated = request.authenticated;
        let dispatcher = Arc::clone(&self.dispatcher);
        let outbound = OutboundRequest {
            method: request.method,
            url,
            authorization: None,
            body: request.body,
        };

        self.flights
            .run(key, move || async move {
                dispatcher.dispatch(outbound, authenticated).await
            })
            .await
    }

    pub fn stats(&self) -> GatewayStatsSnapshot {
        let stats = &self.dispatcher.stats;
        GatewayStatsSnapshot {
            calls: stats.calls.load(Ordering::Relaxed),
            dispatches: stats.dispatches.load(Ordering::Relaxed),
            coalesced: self.flights.joined(),
            retries: stats.retries.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }
}

impl Dispatcher {
    async fn dispatch(&self, mut request: OutboundRequest, authenticated: bool) -> EngineResult<Value> {
        if authenticated {
            let Some(header) = self.credentials.authorization_header() else {
                self.credentials.invalidate_session("no stored credential");
                return Err(EngineError::unauthenticated(None, "no stored credential"));
            };
            request.authorization = Some(header);
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.throttle.acquire().await;
            self.stats.dispatches.fetch_add(1, Ordering::Relaxed);
            debug!("🌐 {} {} (attempt {}/{})", request.method, request.url, attempt, max_attempts);

            match timeout(self.config.timeout(), self.transport.send(&request)).await {
                Ok(Ok(response)) => return self.interpret(&request, response),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("no response within {:?}", self.config.timeout()),
            }

            warn!(
                "⚠️ {} {} failed on attempt {}/{}: {}",
                request.method, request.url, attempt, max_attempts, last_error
            );
            if attempt < max_attempts {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                sleep(self.config.retry_delay()).await;
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        Err(EngineError::transient(last_error, max_attempts))
    }

    fn interpret(&self, request: &OutboundRequest, response: RawResponse) -> EngineResult<Value> {
        match response.status {
            200 => serde_json::from_slice(&response.body).map_err(|e| {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                EngineError::decode(format!("{} {}: {e}", request.method, request.url.path()))
            }),
            401 => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.credentials.invalidate_session("server answered 401");
                Err(EngineError::unauthenticated(
                    Some(401),
                    server_message(&response.body).unwrap_or_else(|| "unauthorized".to_string()),
                ))
            }
            status => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                let message = server_message(&response.body)
                    .or_else(|| canonical_reason(status).map(str::to_string))
                    .unwrap_or_else(|| format!("HTTP {status}"));
                warn!("❌ {} {} -> {}: {}", request.method, request.url.path(), status, message);
                Err(EngineError::server_rejected(status, message))
            }
        }
    }
}

fn canonical_reason(status: u16) -> Option<&'static str> {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
}

/// `msg`, `message` or `detail` from a JSON error body.
pub(crate) fn server_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    ["msg", "message", "detail"]
        .iter()
        .find_map(|field| value.get(*field).and_then(Value::as_str))
        .filter(|message| !message.trim().is_empty())
        .map(str::to_string)
}
