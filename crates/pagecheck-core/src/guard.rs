//! Finalize-time run guard.
//!
//! When a deadline fires the popped run is inspected once more: a navigation
//! that arrived after the last DOM snapshot means the snapshot describes a
//! page the tab has already left, so the run is skipped without emitting any
//! result. Fresh runs get a trigger reason derived from the event kinds they
//! contain.

use serde::{Deserialize, Serialize};

use crate::model::{EventKind, Run, TriggerReason};

/// Why a run was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A navigation arrived after the last DOM snapshot
    StaleSnapshot,
    /// No DOM snapshot and the DOM was never marked ready
    NoSnapshot,
    /// The run holds no events at all
    Empty,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaleSnapshot => "stale_snapshot",
            Self::NoSnapshot => "no_snapshot",
            Self::Empty => "empty",
        }
    }
}

/// Outcome of the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDecision {
    Execute(TriggerReason),
    Skip(SkipReason),
}

/// Decide whether a popped run should execute.
#[must_use]
pub fn evaluate(run: &Run) -> RunDecision {
    if run.events.is_empty() && !run.dom_done {
        return RunDecision::Skip(SkipReason::Empty);
    }
    match run.last_dom_snapshot() {
        Some(last_snapshot) => {
            let navigated_after = run.events[last_snapshot + 1..]
                .iter()
                .any(|e| e.kind.is_navigation());
            if navigated_after {
                return RunDecision::Skip(SkipReason::StaleSnapshot);
            }
        }
        None if !run.dom_done => return RunDecision::Skip(SkipReason::NoSnapshot),
        None => {}
    }
    RunDecision::Execute(trigger_reason(run))
}

/// Highest-priority trigger among the run's events.
#[must_use]
pub fn trigger_reason(run: &Run) -> TriggerReason {
    run.events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::NavBefore => Some(TriggerReason::NavBefore),
            EventKind::NavCommit => Some(TriggerReason::NavCommit),
            EventKind::NavHistory => Some(TriggerReason::NavHistory),
            EventKind::DomIdle => Some(TriggerReason::DomIdle),
            _ => None,
        })
        .min()
        .unwrap_or(TriggerReason::Auto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Event;

    fn run_of(kinds: &[&str]) -> Run {
        let mut run = Run::new();
        run.events = kinds.iter().map(|k| Event::new(*k)).collect();
        run
    }

    #[test]
    fn navigation_after_snapshot_is_stale() {
        let run = run_of(&["nav:before", "dom:idle", "nav:redirect"]);
        assert_eq!(evaluate(&run), RunDecision::Skip(SkipReason::StaleSnapshot));
    }

    #[test]
    fn navigation_before_snapshot_is_fresh() {
        let run = run_of(&["nav:before", "http:headers", "dom:idle"]);
        assert_eq!(evaluate(&run), RunDecision::Execute(TriggerReason::NavBefore));
    }

    #[test]
    fn later_snapshot_supersedes_intervening_navigation() {
        let run = run_of(&["dom:snapshot", "nav:history", "dom:snapshot"]);
        assert_eq!(evaluate(&run), RunDecision::Execute(TriggerReason::NavHistory));
    }

    #[test]
    fn non_navigation_events_after_snapshot_are_fine() {
        let run = run_of(&["dom:idle", "http:headers", "dom:ready"]);
        assert_eq!(evaluate(&run), RunDecision::Execute(TriggerReason::DomIdle));
    }

    #[test]
    fn no_snapshot_needs_dom_done() {
        let mut run = run_of(&["nav:commit", "dom:ready"]);
        assert_eq!(evaluate(&run), RunDecision::Skip(SkipReason::NoSnapshot));
        run.dom_done = true;
        assert_eq!(evaluate(&run), RunDecision::Execute(TriggerReason::NavCommit));
    }

    #[test]
    fn empty_run_is_skipped_unless_marked_ready() {
        let mut run = run_of(&[]);
        assert_eq!(evaluate(&run), RunDecision::Skip(SkipReason::Empty));
        run.dom_done = true;
        assert_eq!(evaluate(&run), RunDecision::Execute(TriggerReason::Auto));
    }

    #[test]
    fn trigger_priority_order() {
        assert_eq!(
            trigger_reason(&run_of(&["dom:idle", "nav:history", "nav:commit"])),
            TriggerReason::NavCommit
        );
        assert_eq!(
            trigger_reason(&run_of(&["nav:commit", "nav:before"])),
            TriggerReason::NavBefore
        );
        assert_eq!(
            trigger_reason(&run_of(&["dom:snapshot", "http:headers"])),
            TriggerReason::Auto
        );
    }
}
