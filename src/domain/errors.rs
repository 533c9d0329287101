//! Engine error taxonomy
//!
//! Every engine call resolves to either a success payload or an [`EngineError`].
//! Collaborators that only need a serialisable summary use [`FailureReport`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification collaborators branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Transient,
    ServerRejected,
    Cancelled,
    Invalid,
    Decode,
    TaskFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// 401 from the server, or no stored credential at dispatch time.
    #[error("Authentication required: {message}")]
    Unauthenticated {
        status: Option<u16>,
        message: String,
    },

    /// Network-level failure (connect, DNS, timeout) after all attempts.
    #[error("Network failure after {attempts} attempt(s): {message}")]
    Transient { message: String, attempts: u32 },

    #[error("Server rejected request with status {status}: {message}")]
    ServerRejected { status: u16, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid input: {message}")]
    Invalid { message: String },

    #[error("Malformed response: {message}")]
    Decode { message: String },

    #[error("Task {task_id} reported an error: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("Monitor timeout after {waited_secs}s waiting for task {task_id}")]
    MonitorTimeout { task_id: String, waited_secs: u64 },
}

impl EngineError {
    pub fn unauthenticated(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            status,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>, attempts: u32) -> Self {
        Self::Transient {
            message: message.into(),
            attempts,
        }
    }

    pub fn server_rejected(status: u16, message: impl Into<String>) -> Self {
        Self::ServerRejected {
            status,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated { .. } => ErrorKind::Unauthenticated,
            Self::Transient { .. } | Self::MonitorTimeout { .. } => ErrorKind::Transient,
            Self::ServerRejected { .. } => ErrorKind::ServerRejected,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Invalid { .. } => ErrorKind::Invalid,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::TaskFailed { .. } => ErrorKind::TaskFailed,
        }
    }

    pub const fn http_status(&self) -> Option<u16> {
        match self {
            Self::Unauthenticated { status, .. } => *status,
            Self::ServerRejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for the 503 case that callers answer from the freshest cached snapshot.
    pub const fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServerRejected { status: 503, .. })
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether a polling loop may keep going after this failure.
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Decode { .. } => true,
            Self::ServerRejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn report(&self) -> FailureReport {
        FailureReport::from(self)
    }
}

/// Structured failure handed to collaborators: `{kind, message, httpStatus?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl From<&EngineError> for FailureReport {
    fn from(error: &EngineError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            http_status: error.http_status(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_timeout_is_reported_as_transient() {
        let error = EngineError::MonitorTimeout {
            task_id: "t-1".into(),
            waited_secs: 1800,
        };
        assert_eq!(error.kind(), ErrorKind::Transient);
        assert!(error.to_string().contains("Monitor timeout"));
    }

    #[test]
    fn failure_report_carries_http_status() {
        let report = EngineError::server_rejected(503, "Service Unavailable").report();
        assert_eq!(report.kind, ErrorKind::ServerRejected);
        assert_eq!(report.http_status, Some(503));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "server_rejected");
        assert_eq!(json["httpStatus"], 503);

        let no_status = serde_json::to_value(EngineError::Cancelled.report()).unwrap();
        assert!(no_status.get("httpStatus").is_none());
    }

    #[test]
    fn recoverability_follows_status_class() {
        assert!(EngineError::transient("timeout", 3).is_recoverable());
        assert!(EngineError::server_rejected(502, "Bad Gateway").is_recoverable());
        assert!(!EngineError::server_rejected(404, "Not Found").is_recoverable());
        assert!(!EngineError::unauthenticated(Some(401), "expired").is_recoverable());
        assert!(EngineError::server_rejected(503, "x").is_service_unavailable());
    }
}
