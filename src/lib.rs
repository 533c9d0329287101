//! Taskflow engine - client-side orchestration for the dashboard backend
//!
//! Throttled, deduplicated HTTP access, a TTL cache, the authoritative task
//! registry, progress polling and the create-to-marketing task flow.

pub mod application;
pub mod domain;
pub mod infrastructure;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use application::{
    CachePolicy, DashboardApi, EngineContext, FlowConfig, FlowOutcome, ProgressChannel,
    ProgressEvent, ProgressPoller, TaskFlowManager, TaskRegistry,
};
pub use domain::{EngineError, EngineResult, ErrorKind, FailureReport, FlowStatus, Task};
pub use infrastructure::config::EngineConfig;
