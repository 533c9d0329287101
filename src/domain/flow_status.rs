//! Flow status of a single created task, derived from its three stage fields.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::task::{StageState, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Created,
    Crawling,
    CrawlCompleted,
    Analyzing,
    AnalysisCompleted,
    MarketingReady,
    Error,
}

impl FlowStatus {
    pub const ALL: [Self; 7] = [
        Self::Created,
        Self::Crawling,
        Self::CrawlCompleted,
        Self::Analyzing,
        Self::AnalysisCompleted,
        Self::MarketingReady,
        Self::Error,
    ];

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::MarketingReady | Self::Error)
    }

    const fn ladder_position(self) -> Option<u8> {
        match self {
            Self::Created => Some(0),
            Self::Crawling => Some(1),
            Self::CrawlCompleted => Some(2),
            Self::Analyzing => Some(3),
            Self::AnalysisCompleted => Some(4),
            Self::MarketingReady => Some(5),
            Self::Error => None,
        }
    }

    /// Terminal states never move. Error is reachable from any other state.
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        !matches!(self, Self::Error) || matches!(next, Self::Error)
    }

    /// A ladder move towards an earlier stage, e.g. Analyzing back to Crawling.
    pub fn is_backward(self, next: Self) -> bool {
        match (self.ladder_position(), next.ladder_position()) {
            (Some(from), Some(to)) => to < from,
            _ => false,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Crawling => "CRAWLING",
            Self::CrawlCompleted => "CRAWL_COMPLETED",
            Self::Analyzing => "ANALYZING",
            Self::AnalysisCompleted => "ANALYSIS_COMPLETED",
            Self::MarketingReady => "MARKETING_READY",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Total, deterministic status derivation.
///
/// An explicit error (any stage in `error`, or a non-blank message) wins over
/// the ladder. The ladder is evaluated crawl first, then analysis, then
/// marketing.
pub fn derive_flow_status(
    crawler: StageState,
    analysis: StageState,
    marketing: StageState,
    error_message: Option<&str>,
) -> FlowStatus {
    let explicit_error = [crawler, analysis, marketing].contains(&StageState::Error)
        || error_message.is_some_and(|m| !m.trim().is_empty());
    if explicit_error {
        return FlowStatus::Error;
    }

    if crawler.is_finished() {
        if analysis.is_finished() {
            if marketing.is_finished() {
                FlowStatus::MarketingReady
            } else {
                FlowStatus::AnalysisCompleted
            }
        } else if analysis.is_running() {
            FlowStatus::Analyzing
        } else {
            FlowStatus::CrawlCompleted
        }
    } else if crawler.is_running() {
        FlowStatus::Crawling
    } else {
        FlowStatus::Created
    }
}

pub fn flow_status_of(task: &Task) -> FlowStatus {
    derive_flow_status(
        task.crawler_state,
        task.analysis_state,
        task.market_state,
        task.error_message.as_deref(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::Stage;
    use proptest::prelude::*;
    use rstest::rstest;

    fn derive(crawler: &str, analysis: &str, marketing: &str, error_message: Option<&str>) -> FlowStatus {
        derive_flow_status(
            StageState::parse(Stage::Crawl, crawler),
            StageState::parse(Stage::Analysis, analysis),
            StageState::parse(Stage::Marketing, marketing),
            error_message,
        )
    }

    #[rstest]
    #[case("initial", "initial", "initial", None, FlowStatus::Created)]
    #[case("crawling", "initial", "initial", None, FlowStatus::Crawling)]
    #[case("running", "initial", "initial", None, FlowStatus::Crawling)]
    #[case("completed", "initial", "initial", None, FlowStatus::CrawlCompleted)]
    #[case("finish", "analyzing", "initial", None, FlowStatus::Analyzing)]
    #[case("finish", "running", "initial", None, FlowStatus::Analyzing)]
    #[case("finish", "finish", "initial", None, FlowStatus::AnalysisCompleted)]
    #[case("finish", "finish", "running", None, FlowStatus::AnalysisCompleted)]
    #[case("finish", "completed", "ready", None, FlowStatus::MarketingReady)]
    #[case("completed", "finish", "finish", None, FlowStatus::MarketingReady)]
    #[case("initial", "analyzing", "initial", None, FlowStatus::Created)]
    #[case("error", "initial", "initial", None, FlowStatus::Error)]
    #[case("finish", "finish", "error", None, FlowStatus::Error)]
    #[case("finish", "finish", "ready", Some("quota exhausted"), FlowStatus::Error)]
    #[case("crawling", "initial", "initial", Some("   "), FlowStatus::Crawling)]
    #[case("finish", "ready", "initial", None, FlowStatus::CrawlCompleted)]
    #[case("finish", "finish", "completed", None, FlowStatus::AnalysisCompleted)]
    #[case("analyzing", "initial", "initial", None, FlowStatus::Created)]
    #[case("marketing", "initial", "initial", None, FlowStatus::Created)]
    #[case("finish", "crawling", "initial", None, FlowStatus::CrawlCompleted)]
    fn derivation_table(
        #[case] crawler: &str,
        #[case] analysis: &str,
        #[case] marketing: &str,
        #[case] error_message: Option<&str>,
        #[case] expected: FlowStatus,
    ) {
        assert_eq!(derive(crawler, analysis, marketing, error_message), expected);
    }

    #[test]
    fn terminal_states_are_locked() {
        assert!(!FlowStatus::MarketingReady.can_transition_to(FlowStatus::Error));
        assert!(!FlowStatus::Error.can_transition_to(FlowStatus::Crawling));
        assert!(FlowStatus::Crawling.can_transition_to(FlowStatus::Error));
        assert!(FlowStatus::Created.can_transition_to(FlowStatus::Analyzing));
    }

    #[test]
    fn backward_moves_are_flagged() {
        assert!(FlowStatus::Analyzing.is_backward(FlowStatus::Crawling));
        assert!(!FlowStatus::Crawling.is_backward(FlowStatus::Analyzing));
        assert!(!FlowStatus::Crawling.is_backward(FlowStatus::Error));
    }

    fn any_stage() -> impl Strategy<Value = StageState> {
        prop_oneof![
            Just(StageState::Initial),
            Just(StageState::Running),
            Just(StageState::Finish),
            Just(StageState::Error),
        ]
    }

    proptest! {
        #[test]
        fn derivation_is_total_and_error_first(
            crawler in any_stage(),
            analysis in any_stage(),
            marketing in any_stage(),
            message in proptest::option::of("[a-z ]{0,8}"),
        ) {
            let status = derive_flow_status(crawler, analysis, marketing, message.as_deref());
            prop_assert!(FlowStatus::ALL.contains(&status));
            prop_assert_eq!(status, derive_flow_status(crawler, analysis, marketing, message.as_deref()));

            let has_error = [crawler, analysis, marketing].contains(&StageState::Error)
                || message.as_deref().is_some_and(|m| !m.trim().is_empty());
            prop_assert_eq!(status == FlowStatus::Error, has_error);
        }
    }
}
