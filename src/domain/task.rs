//! Task entity and stage state model
//!
//! A task moves through three independent stages (crawl, analysis, marketing).
//! The server reports them as loosely-typed strings; [`RawTask`] absorbs that
//! looseness and [`Task`] is the normalized form the rest of the engine sees.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Source platform of the crawled content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Platform {
    Dy,
    Xhs,
    Other(String),
}

impl From<String> for Platform {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "dy" => Self::Dy,
            "xhs" => Self::Xhs,
            _ => Self::Other(value),
        }
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        match value {
            Platform::Dy => "dy".to_string(),
            Platform::Xhs => "xhs".to_string(),
            Platform::Other(raw) => raw,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dy => write!(f, "dy"),
            Self::Xhs => write!(f, "xhs"),
            Self::Other(raw) => write!(f, "{raw}"),
        }
    }
}

/// The three stages of a task, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Crawl,
    Analysis,
    Marketing,
}

/// Lifecycle of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    #[default]
    Initial,
    Running,
    Finish,
    Error,
}

impl StageState {
    /// Parses one stage field using that stage's own vocabulary.
    ///
    /// crawl: `crawling`/`running`, `completed`/`finish`.
    /// analysis: `analyzing`/`running`, `completed`/`finish`.
    /// marketing: `running`/`marketing`, `ready`/`finish`.
    /// `error`/`failed` is an error on every stage; any other spelling,
    /// including another stage's word, counts as not started.
    pub fn parse(stage: Stage, raw: &str) -> Self {
        let raw = raw.trim().to_ascii_lowercase();
        if matches!(raw.as_str(), "error" | "failed" | "fail") {
            return Self::Error;
        }
        match (stage, raw.as_str()) {
            (Stage::Crawl, "crawling" | "running")
            | (Stage::Analysis, "analyzing" | "running")
            | (Stage::Marketing, "marketing" | "running") => Self::Running,
            (Stage::Crawl | Stage::Analysis, "completed" | "finish")
            | (Stage::Marketing, "ready" | "finish") => Self::Finish,
            _ => Self::Initial,
        }
    }

    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Finish)
    }

    const fn rank(self) -> Option<u8> {
        match self {
            Self::Initial => Some(0),
            Self::Running => Some(1),
            Self::Finish => Some(2),
            Self::Error => None,
        }
    }

    /// A move to a lower rank that is not an explicit error or stop.
    pub fn regresses_to(self, next: Self) -> bool {
        match (self.rank(), next.rank()) {
            (Some(current), Some(next_rank)) => next_rank < current && next != Self::Initial,
            _ => false,
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initial => "initial",
            Self::Running => "running",
            Self::Finish => "finish",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Normalized task as held by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub keyword: String,
    pub platform: Platform,
    pub crawler_state: StageState,
    pub analysis_state: StageState,
    pub market_state: StageState,
    pub crawler_progress: u64,
    pub analysis_progress: u64,
    pub market_progress: u64,
    pub intent_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, keyword: impl Into<String>, platform: Platform) -> Self {
        Self {
            task_id: task_id.into(),
            keyword: keyword.into(),
            platform,
            crawler_state: StageState::Initial,
            analysis_state: StageState::Initial,
            market_state: StageState::Initial,
            crawler_progress: 0,
            analysis_progress: 0,
            market_progress: 0,
            intent_count: 0,
            error_message: None,
        }
    }

    /// True while crawl or analysis is still making progress server-side.
    pub const fn is_active(&self) -> bool {
        self.crawler_state.is_running() || self.analysis_state.is_running()
    }

    pub fn has_explicit_error(&self) -> bool {
        self.crawler_state == StageState::Error
            || self.analysis_state == StageState::Error
            || self.market_state == StageState::Error
            || self.error_message.as_deref().is_some_and(|m| !m.trim().is_empty())
    }

    /// Describes a later stage running ahead of an earlier unfinished one.
    ///
    /// These are tolerated; the caller only logs them.
    pub fn ordering_violation(&self) -> Option<String> {
        if self.analysis_state.is_running() && !self.crawler_state.is_finished() {
            return Some(format!(
                "analysis running while crawl is {}",
                self.crawler_state
            ));
        }
        if self.market_state.is_running() && !self.analysis_state.is_finished() {
            return Some(format!(
                "marketing running while analysis is {}",
                self.analysis_state
            ));
        }
        None
    }

    /// Replaces every field set in `patch`. Returns whether anything changed.
    pub fn apply(&mut self, patch: &TaskPatch) -> bool {
        let before = self.clone();

        if let Some(state) = patch.crawler_state {
            self.crawler_state = state;
        }
        if let Some(state) = patch.analysis_state {
            self.analysis_state = state;
        }
        if let Some(state) = patch.market_state {
            self.market_state = state;
        }
        if let Some(value) = patch.crawler_progress {
            self.crawler_progress = value;
        }
        if let Some(value) = patch.analysis_progress {
            self.analysis_progress = value;
        }
        if let Some(value) = patch.market_progress {
            self.market_progress = value;
        }
        if let Some(value) = patch.intent_count {
            self.intent_count = value;
        }
        if let Some(message) = &patch.error_message {
            self.error_message = message.clone();
        }

        *self != before
    }
}

/// Partial update applied through the registry's single write path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    pub crawler_state: Option<StageState>,
    pub analysis_state: Option<StageState>,
    pub market_state: Option<StageState>,
    pub crawler_progress: Option<u64>,
    pub analysis_progress: Option<u64>,
    pub market_progress: Option<u64>,
    pub intent_count: Option<u64>,
    /// `Some(None)` clears a previous error message.
    pub error_message: Option<Option<String>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Stage transitions in this patch that move a stage backwards.
    pub fn regressions(&self, current: &Task) -> Vec<String> {
        let mut found = Vec::new();
        let checks = [
            ("crawler_state", current.crawler_state, self.crawler_state),
            ("analysis_state", current.analysis_state, self.analysis_state),
            ("market_state", current.market_state, self.market_state),
        ];
        for (field, from, to) in checks {
            if let Some(to) = to {
                if from.regresses_to(to) {
                    found.push(format!("{field}: {from} -> {to}"));
                }
            }
        }
        found
    }
}

/// Task entry exactly as the list endpoint returns it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTask {
    #[serde(default)]
    pub task_id: Option<Value>,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub crawler_state: Option<String>,
    #[serde(default)]
    pub analysis_state: Option<String>,
    #[serde(default)]
    pub market_state: Option<String>,
    #[serde(default)]
    pub marketing_state: Option<String>,
    #[serde(default)]
    pub crawler_progress: Option<Value>,
    #[serde(default)]
    pub analysis_progress: Option<Value>,
    #[serde(default)]
    pub market_progress: Option<Value>,
    #[serde(default)]
    pub intent_count: Option<Value>,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl RawTask {
    /// Normalizes the entry. Entries without a usable `task_id` yield `None`.
    pub fn normalize(self) -> Option<Task> {
        let task_id = match self.task_id? {
            Value::String(id) if !id.trim().is_empty() => id,
            Value::Number(n) => n.to_string(),
            _ => return None,
        };

        let stage = |stage: Stage, raw: Option<&str>| {
            raw.map_or(StageState::Initial, |raw| StageState::parse(stage, raw))
        };
        let market_raw = self.market_state.as_deref().or(self.marketing_state.as_deref());

        let status_error = matches!(&self.status, Some(Value::String(s)) if s.eq_ignore_ascii_case("error"));
        let error_message = self
            .error_message
            .filter(|m| !m.trim().is_empty())
            .or_else(|| status_error.then(|| "task reported error status".to_string()));

        Some(Task {
            task_id,
            keyword: self.keyword.unwrap_or_default(),
            platform: Platform::from(self.platform.unwrap_or_default()),
            crawler_state: stage(Stage::Crawl, self.crawler_state.as_deref()),
            analysis_state: stage(Stage::Analysis, self.analysis_state.as_deref()),
            market_state: stage(Stage::Marketing, market_raw),
            crawler_progress: counter(self.crawler_progress.as_ref()),
            analysis_progress: counter(self.analysis_progress.as_ref()),
            market_progress: counter(self.market_progress.as_ref()),
            intent_count: counter(self.intent_count.as_ref()),
            error_message,
        })
    }
}

/// Counters arrive as numbers, numeric strings or null.
pub(crate) fn counter(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}
