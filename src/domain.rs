//! Domain module - task model, flow status and polling rules
//!
//! Everything here is pure: no I/O, no clocks, no shared state. The
//! infrastructure and application layers build on these types.

pub mod errors;
pub mod flow_status;
pub mod progress;
pub mod task;

pub use errors::{EngineError, EngineResult, ErrorKind, FailureReport};
pub use flow_status::{FlowStatus, derive_flow_status, flow_status_of};
pub use progress::{PollDecision, PollingSession, ProgressSnapshot, StopReason};
pub use task::{Platform, RawTask, Stage, StageState, Task, TaskPatch};
