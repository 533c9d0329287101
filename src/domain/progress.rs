//! Progress snapshots and the polling continuation rule
//!
//! [`PollingSession`] is a plain value object: it owns the stall-detection
//! counters and is advanced one snapshot at a time, so the termination
//! heuristics can be exercised without timers or a network.

use serde::{Deserialize, Serialize};

/// Server signal for "this job is done".
pub const STATE_COMPLETE: i64 = 3;

/// Lowest meaningful stall threshold: a baseline plus one repeat.
pub const MIN_UNCHANGED_THRESHOLD: u32 = 2;

/// One progress reading from `/progress` or `/marketing_progress`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    #[serde(default)]
    pub num: u64,
    #[serde(default)]
    pub sum: u64,
    #[serde(default)]
    pub state: i64,
    /// Intent-positive items among `num`; analysis progress only.
    #[serde(default)]
    pub ic_num: u64,
}

impl ProgressSnapshot {
    pub const fn new(num: u64, sum: u64, state: i64) -> Self {
        Self {
            num,
            sum,
            state,
            ic_num: 0,
        }
    }

    /// `round(num / sum * 100)`, 0 when `sum` is 0, capped at 100.
    pub fn percent(&self) -> u8 {
        ratio_percent(self.num, self.sum)
    }

    /// Share of analyzed items flagged as intent, `round(ic_num / num * 100)`.
    pub fn intent_percent(&self) -> u8 {
        ratio_percent(self.ic_num, self.num)
    }

    pub const fn is_complete(&self) -> bool {
        self.state == STATE_COMPLETE
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn ratio_percent(part: u64, whole: u64) -> u8 {
    if whole == 0 {
        return 0;
    }
    let pct = (part as f64 / whole as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `state == 3`.
    Completed,
    /// `sum > 0 && num >= sum`.
    ReachedTotal,
    /// `num` stayed constant for `threshold` consecutive observations.
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Continue,
    Stop(StopReason),
}

impl PollDecision {
    pub const fn should_continue(self) -> bool {
        matches!(self, Self::Continue)
    }
}

/// Per-task stall-detection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingSession {
    task_id: String,
    threshold: u32,
    unchanged_count: u32,
    last_observed: Option<u64>,
    observations: u64,
    stopped: Option<StopReason>,
}

impl PollingSession {
    /// `threshold` is clamped to [`MIN_UNCHANGED_THRESHOLD`].
    pub fn new(task_id: impl Into<String>, threshold: u32) -> Self {
        Self {
            task_id: task_id.into(),
            threshold: threshold.max(MIN_UNCHANGED_THRESHOLD),
            unchanged_count: 0,
            last_observed: None,
            observations: 0,
            stopped: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub const fn unchanged_count(&self) -> u32 {
        self.unchanged_count
    }

    pub const fn last_observed(&self) -> Option<u64> {
        self.last_observed
    }

    pub const fn observations(&self) -> u64 {
        self.observations
    }

    pub const fn should_continue(&self) -> bool {
        self.stopped.is_none()
    }

    pub const fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    /// Feeds one snapshot through the continuation rule.
    ///
    /// Rules in order: completion signal, reaching the total, then stall
    /// detection. A repeat of the baseline `num` bumps `unchanged_count`; the
    /// session stops once the baseline observation plus its repeats reach the
    /// threshold. Any change resets the counter and moves the baseline. Once
    /// stopped, further snapshots keep returning the same decision.
    pub fn advance(&mut self, snapshot: &ProgressSnapshot) -> PollDecision {
        if let Some(reason) = self.stopped {
            return PollDecision::Stop(reason);
        }
        self.observations += 1;

        let decision = if snapshot.is_complete() {
            PollDecision::Stop(StopReason::Completed)
        } else if snapshot.sum > 0 && snapshot.num >= snapshot.sum {
            PollDecision::Stop(StopReason::ReachedTotal)
        } else if self.last_observed == Some(snapshot.num) {
            self.unchanged_count += 1;
            if self.unchanged_count + 1 >= self.threshold {
                PollDecision::Stop(StopReason::Stalled)
            } else {
                PollDecision::Continue
            }
        } else {
            self.unchanged_count = 0;
            self.last_observed = Some(snapshot.num);
            PollDecision::Continue
        };

        if let PollDecision::Stop(reason) = decision {
            self.stopped = Some(reason);
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed(session: &mut PollingSession, nums: &[u64], sum: u64) -> Vec<PollDecision> {
        nums.iter()
            .map(|num| session.advance(&ProgressSnapshot::new(*num, sum, 1)))
            .collect()
    }

    #[test]
    fn stalled_sequence_stops_on_fifth_observation() {
        let mut session = PollingSession::new("t", 4);
        let decisions = feed(&mut session, &[3, 5, 5, 5, 5], 10);

        assert!(decisions[..4].iter().all(|d| d.should_continue()));
        assert_eq!(decisions[4], PollDecision::Stop(StopReason::Stalled));
        assert_eq!(session.observations(), 5);
        assert!(!session.should_continue());
    }

    #[test]
    fn completion_signal_wins() {
        let mut session = PollingSession::new("t", 4);
        let decision = session.advance(&ProgressSnapshot::new(1, 10, STATE_COMPLETE));
        assert_eq!(decision, PollDecision::Stop(StopReason::Completed));
    }

    #[test]
    fn reaching_total_stops_immediately() {
        let mut session = PollingSession::new("t", 4);
        assert!(session.advance(&ProgressSnapshot::new(2, 10, 1)).should_continue());
        assert_eq!(
            session.advance(&ProgressSnapshot::new(10, 10, 1)),
            PollDecision::Stop(StopReason::ReachedTotal)
        );
    }

    #[test]
    fn zero_total_never_counts_as_reached() {
        let mut session = PollingSession::new("t", 4);
        assert!(session.advance(&ProgressSnapshot::new(0, 0, 0)).should_continue());
    }

    #[test]
    fn progress_resets_the_counter() {
        let mut session = PollingSession::new("t", 4);
        feed(&mut session, &[1, 1, 1], 100);
        assert_eq!(session.unchanged_count(), 2);

        session.advance(&ProgressSnapshot::new(2, 100, 1));
        assert_eq!(session.unchanged_count(), 0);
        assert_eq!(session.last_observed(), Some(2));
    }

    #[test]
    fn stopped_session_is_sticky() {
        let mut session = PollingSession::new("t", 2);
        feed(&mut session, &[4, 4], 10);
        assert_eq!(session.stop_reason(), Some(StopReason::Stalled));
        assert_eq!(
            session.advance(&ProgressSnapshot::new(9, 10, 1)),
            PollDecision::Stop(StopReason::Stalled)
        );
        assert_eq!(session.observations(), 2);
    }

    #[test]
    fn percent_rounds_and_caps() {
        assert_eq!(ProgressSnapshot::new(1, 3, 1).percent(), 33);
        assert_eq!(ProgressSnapshot::new(2, 3, 1).percent(), 67);
        assert_eq!(ProgressSnapshot::new(12, 10, 1).percent(), 100);
        assert_eq!(ProgressSnapshot::new(5, 0, 1).percent(), 0);

        let snapshot = ProgressSnapshot {
            num: 8,
            sum: 10,
            state: 1,
            ic_num: 2,
        };
        assert_eq!(snapshot.intent_percent(), 25);
    }

    proptest! {
        #[test]
        fn constant_progress_stops_within_threshold(
            prefix in proptest::collection::vec(0u64..50, 0..6),
            constant in 50u64..100,
            threshold in 2u32..8,
        ) {
            let mut session = PollingSession::new("p", threshold);
            for num in &prefix {
                session.advance(&ProgressSnapshot::new(*num, 1000, 1));
            }
            prop_assume!(session.should_continue());

            let mut polls = 0;
            while session.should_continue() {
                session.advance(&ProgressSnapshot::new(constant, 1000, 1));
                polls += 1;
                prop_assert!(polls <= threshold);
            }
            prop_assert_eq!(session.stop_reason(), Some(StopReason::Stalled));
        }

        #[test]
        fn reaching_total_always_stops(num in 1u64..1000, extra in 0u64..10) {
            let mut session = PollingSession::new("p", 4);
            let decision = session.advance(&ProgressSnapshot::new(num + extra, num, 1));
            prop_assert_eq!(decision, PollDecision::Stop(StopReason::ReachedTotal));
        }
    }
}
