//! Composition root
//!
//! [`EngineContext`] constructs every long-lived service once and hands out
//! shared references. There is no global state; a process (or a test) owns
//! one context.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::application::api::DashboardApi;
use crate::application::progress_poller::ProgressPoller;
use crate::application::task_flow::{FlowConfig, TaskFlowManager};
use crate::application::task_registry::TaskRegistry;
use crate::domain::errors::{EngineError, EngineResult};
use crate::infrastructure::cache_store::{self, CacheStore};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::credentials::CredentialStore;
use crate::infrastructure::http_transport::{HttpTransport, ReqwestTransport};
use crate::infrastructure::local_store::{self, LocalStore};
use crate::infrastructure::request_gateway::RequestGateway;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<LocalStore>,
    pub credentials: CredentialStore,
    pub gateway: Arc<RequestGateway>,
    pub cache: Arc<CacheStore>,
    pub api: Arc<DashboardApi>,
    pub registry: Arc<TaskRegistry>,
    pub poller: Arc<ProgressPoller>,
}

impl EngineContext {
    /// Production wiring: reqwest transport and the on-disk local store.
    pub fn build(config: EngineConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.api.user_agent, CONNECT_TIMEOUT)
            .context("Failed to build HTTP client")?;

        let store = match config.storage.resolve_store_path() {
            Some(path) => LocalStore::open(&path)
                .with_context(|| format!("Failed to open local store at {}", path.display()))?,
            None => LocalStore::in_memory(),
        };

        Self::with_parts(config, Arc::new(transport), Arc::new(store))
            .context("Failed to wire engine services")
    }

    pub fn with_parts(
        config: EngineConfig,
        transport: Arc<dyn HttpTransport>,
        store: Arc<LocalStore>,
    ) -> EngineResult<Self> {
        let credentials = CredentialStore::new(Arc::clone(&store));
        let gateway = Arc::new(RequestGateway::new(
            &config.api.base_url,
            transport,
            credentials.clone(),
            config.gateway.clone(),
        )?);
        let cache = Arc::new(CacheStore::new(config.cache.default_ttl()));
        let api = Arc::new(DashboardApi::new(
            Arc::clone(&gateway),
            Arc::clone(&cache),
            config.cache.clone(),
        ));
        let registry = Arc::new(TaskRegistry::new(
            Arc::clone(&api),
            Arc::clone(&cache),
            Arc::clone(&store),
            config.registry.clone(),
        ));
        let poller = Arc::new(ProgressPoller::new(
            Arc::clone(&api),
            Arc::clone(&registry),
            config.polling.clone(),
        ));

        info!("🏗️ Engine context ready");
        Ok(Self {
            config,
            store,
            credentials,
            gateway,
            cache,
            api,
            registry,
            poller,
        })
    }

    /// A flow manager for one task creation.
    pub fn new_flow(&self, flow: FlowConfig) -> Arc<TaskFlowManager> {
        Arc::new(TaskFlowManager::new(
            Arc::clone(&self.api),
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            self.config.flow.clone(),
            flow,
        ))
    }

    pub fn save_task_field(&self, task_id: &str, field: &str, value: &str) -> EngineResult<()> {
        self.store
            .set(&local_store::keys::task_field(task_id, field), &value)
            .map_err(|e| EngineError::invalid(e.to_string()))
    }

    pub fn task_field(&self, task_id: &str, field: &str) -> Option<String> {
        self.store
            .get_string(&local_store::keys::task_field(task_id, field))
    }

    pub fn save_task_template(&self, task_id: &str, template: &str) -> EngineResult<()> {
        self.store
            .set(&local_store::keys::task_template(task_id), &template)
            .map_err(|e| EngineError::invalid(e.to_string()))
    }

    pub fn task_template(&self, task_id: &str) -> Option<String> {
        self.store
            .get_string(&local_store::keys::task_template(task_id))
    }

    /// Drops everything persisted or cached under the task's namespace.
    pub fn forget_task(&self, task_id: &str) -> EngineResult<usize> {
        let cached = self
            .cache
            .invalidate_prefix(&cache_store::keys::task_prefix(task_id));
        let mut stored = self
            .store
            .remove_prefix(&local_store::keys::task_prefix(task_id))
            .map_err(|e| EngineError::invalid(e.to_string()))?;
        if self
            .store
            .remove(&local_store::keys::task_summary(task_id))
            .map_err(|e| EngineError::invalid(e.to_string()))?
        {
            stored += 1;
        }
        Ok(cached + stored)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::TestContext;
    use serde_json::json;

    #[tokio::test]
    async fn task_namespace_round_trips_and_is_forgotten() {
        let ctx = TestContext::new();
        let engine = &ctx.engine;

        engine.save_task_field("t1", "notes", "call back friday").unwrap();
        engine.save_task_template("t1", "Hi {name}").unwrap();
        engine.save_task_field("t2", "notes", "keep").unwrap();
        engine
            .cache
            .set_default(crate::infrastructure::cache_store::keys::progress("t1", 2), json!({}));

        assert_eq!(engine.task_field("t1", "notes").as_deref(), Some("call back friday"));
        assert_eq!(engine.task_template("t1").as_deref(), Some("Hi {name}"));

        assert_eq!(engine.forget_task("t1").unwrap(), 3);
        assert!(engine.task_field("t1", "notes").is_none());
        assert!(engine.task_template("t1").is_none());
        assert_eq!(engine.task_field("t2", "notes").as_deref(), Some("keep"));
    }

    #[test]
    fn bad_base_url_is_rejected() {
        let mut config = crate::test_utils::test_config();
        config.api.base_url = "not a url".to_string();
        let transport = std::sync::Arc::new(crate::test_utils::ScriptedTransport::new());
        let store = std::sync::Arc::new(crate::infrastructure::local_store::LocalStore::in_memory());
        assert!(super::EngineContext::with_parts(config, transport, store).is_err());
    }
}
