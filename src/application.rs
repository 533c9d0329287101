//! Application layer
//!
//! Long-lived services built on the gateway and cache: the typed endpoint
//! client, the task registry, progress polling and the task flow.

pub mod api;
pub mod engine;
pub mod progress_poller;
pub mod task_flow;
pub mod task_registry;

pub use api::{CachePolicy, DashboardApi, MarketingUserFilter, TaskPage};
pub use engine::EngineContext;
pub use progress_poller::{PollPhase, ProgressChannel, ProgressEvent, ProgressPoller, TerminationReason};
pub use task_flow::{FlowConfig, FlowOutcome, TaskFlowManager, TaskSummary};
pub use task_registry::{SubscriptionId, TaskRegistry};
