//! # Execution State Model
//!
//! State types shared by executions, task runs and attempts.
//!
//! ## Overview
//!
//! A [`State`] is an append-only history of `(kind, timestamp)` transitions;
//! `current` is always the last entry. Nothing ever rewrites history: pauses,
//! retries, kills and restarts all append. Durations are derived from the
//! first and last timestamps, which makes the audit trail the single source
//! of truth for timing.
//!
//! ## Terminal States
//!
//! `SUCCESS`, `WARNING`, `FAILED`, `CANCELLED` and `KILLED` are terminal.
//! Once an execution reaches one of them the orchestration core
//! short-circuits and never mutates it again.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of state kinds an execution, task run or attempt can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateKind {
    /// Accepted but not yet started.
    Created,
    /// Actively progressing.
    Running,
    /// Suspended, waiting on an external resume or a pause timer.
    Paused,
    /// Failed and waiting for an in-place retry of the same task run.
    Retrying,
    /// Failed and flagged to be retried through a brand-new execution.
    Retried,
    /// Waiting for concurrency capacity on its flow.
    Queued,
    /// Revived by an operator; moves to `Running` on the next pass.
    Restarted,
    /// Kill requested; workers are being stopped.
    Killing,
    /// Kill completed. Terminal.
    Killed,
    /// Completed successfully. Terminal.
    Success,
    /// Completed with warnings. Terminal.
    Warning,
    /// Completed in error. Terminal.
    Failed,
    /// Discarded by policy before doing any work. Terminal.
    Cancelled,
    /// Suspended at a debug breakpoint.
    Breakpoint,
}

impl StateKind {
    /// True for states that end an execution or task run for good.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            StateKind::Success
                | StateKind::Warning
                | StateKind::Failed
                | StateKind::Cancelled
                | StateKind::Killed
        )
    }

    /// True while work is actively progressing (kill-in-flight included).
    pub fn is_running(&self) -> bool {
        matches!(self, StateKind::Running | StateKind::Killing)
    }

    pub fn is_created(&self) -> bool {
        matches!(self, StateKind::Created)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, StateKind::Paused)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, StateKind::Queued)
    }

    /// True for both retry flavors, which suspend end detection.
    pub fn is_retrying(&self) -> bool {
        matches!(self, StateKind::Retrying | StateKind::Retried)
    }

    pub fn is_killing(&self) -> bool {
        matches!(self, StateKind::Killing)
    }

    pub fn is_breakpoint(&self) -> bool {
        matches!(self, StateKind::Breakpoint)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StateKind::Failed)
    }

    /// All terminal kinds, in final-state precedence order.
    pub fn terminals() -> [StateKind; 5] {
        [
            StateKind::Killed,
            StateKind::Failed,
            StateKind::Warning,
            StateKind::Cancelled,
            StateKind::Success,
        ]
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateKind::Created => "CREATED",
            StateKind::Running => "RUNNING",
            StateKind::Paused => "PAUSED",
            StateKind::Retrying => "RETRYING",
            StateKind::Retried => "RETRIED",
            StateKind::Queued => "QUEUED",
            StateKind::Restarted => "RESTARTED",
            StateKind::Killing => "KILLING",
            StateKind::Killed => "KILLED",
            StateKind::Success => "SUCCESS",
            StateKind::Warning => "WARNING",
            StateKind::Failed => "FAILED",
            StateKind::Cancelled => "CANCELLED",
            StateKind::Breakpoint => "BREAKPOINT",
        };
        write!(f, "{s}")
    }
}

impl FromStr for StateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(StateKind::Created),
            "RUNNING" => Ok(StateKind::Running),
            "PAUSED" => Ok(StateKind::Paused),
            "RETRYING" => Ok(StateKind::Retrying),
            "RETRIED" => Ok(StateKind::Retried),
            "QUEUED" => Ok(StateKind::Queued),
            "RESTARTED" => Ok(StateKind::Restarted),
            "KILLING" => Ok(StateKind::Killing),
            "KILLED" => Ok(StateKind::Killed),
            "SUCCESS" => Ok(StateKind::Success),
            "WARNING" => Ok(StateKind::Warning),
            "FAILED" => Ok(StateKind::Failed),
            "CANCELLED" => Ok(StateKind::Cancelled),
            "BREAKPOINT" => Ok(StateKind::Breakpoint),
            _ => Err(format!("Unknown state kind: {s}")),
        }
    }
}

impl Default for StateKind {
    fn default() -> Self {
        StateKind::Created
    }
}

/// One entry in a state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistory {
    pub state: StateKind,
    pub date: DateTime<Utc>,
}

/// Append-only state with full transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub current: StateKind,
    pub histories: Vec<StateHistory>,
}

impl State {
    /// Open a fresh history at `kind`, stamped now.
    pub fn new(kind: StateKind) -> Self {
        State {
            current: kind,
            histories: vec![StateHistory {
                state: kind,
                date: Utc::now(),
            }],
        }
    }

    /// Append a transition, returning the new state value.
    ///
    /// Appending the current kind again is a no-op; duplicate deliveries must
    /// not inflate the history.
    pub fn with_state(&self, kind: StateKind) -> Self {
        if self.current == kind {
            return self.clone();
        }
        let mut histories = self.histories.clone();
        histories.push(StateHistory {
            state: kind,
            date: Utc::now(),
        });
        State {
            current: kind,
            histories,
        }
    }

    /// True if the history ever passed through `kind`.
    pub fn has_been(&self, kind: StateKind) -> bool {
        self.histories.iter().any(|h| h.state == kind)
    }

    /// A previously failed execution that has been put back in flight.
    /// Such executions re-run admission (concurrency, deadline monitors)
    /// exactly like a freshly created one.
    pub fn failed_then_restarted(&self) -> bool {
        self.current == StateKind::Restarted && self.has_been(StateKind::Failed)
    }

    /// Timestamp of the first transition.
    pub fn started_date(&self) -> DateTime<Utc> {
        self.histories
            .first()
            .map(|h| h.date)
            .unwrap_or_else(Utc::now)
    }

    /// Timestamp of the most recent transition.
    pub fn max_date(&self) -> DateTime<Utc> {
        self.histories
            .last()
            .map(|h| h.date)
            .unwrap_or_else(Utc::now)
    }

    /// End timestamp, present only once terminal.
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        if self.current.is_terminated() {
            self.histories.last().map(|h| h.date)
        } else {
            None
        }
    }

    /// Wall-clock duration from first transition to last (or now).
    pub fn duration(&self) -> Duration {
        let end = self.end_date().unwrap_or_else(Utc::now);
        end - self.started_date()
    }

    pub fn is_terminated(&self) -> bool {
        self.current.is_terminated()
    }

    pub fn is_running(&self) -> bool {
        self.current.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.current.is_paused()
    }

    pub fn is_retrying(&self) -> bool {
        self.current.is_retrying()
    }
}

impl Default for State {
    fn default() -> Self {
        State::new(StateKind::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        for kind in StateKind::terminals() {
            assert!(kind.is_terminated(), "{kind} should be terminal");
        }
        for kind in [
            StateKind::Created,
            StateKind::Running,
            StateKind::Paused,
            StateKind::Retrying,
            StateKind::Retried,
            StateKind::Queued,
            StateKind::Restarted,
            StateKind::Killing,
            StateKind::Breakpoint,
        ] {
            assert!(!kind.is_terminated(), "{kind} should not be terminal");
        }
    }

    #[test]
    fn test_running_includes_killing() {
        assert!(StateKind::Running.is_running());
        assert!(StateKind::Killing.is_running());
        assert!(!StateKind::Paused.is_running());
    }

    #[test]
    fn test_retrying_covers_both_flavors() {
        assert!(StateKind::Retrying.is_retrying());
        assert!(StateKind::Retried.is_retrying());
        assert!(!StateKind::Failed.is_retrying());
    }

    #[test]
    fn test_string_round_trip() {
        for kind in [
            StateKind::Created,
            StateKind::Running,
            StateKind::Paused,
            StateKind::Retrying,
            StateKind::Retried,
            StateKind::Queued,
            StateKind::Restarted,
            StateKind::Killing,
            StateKind::Killed,
            StateKind::Success,
            StateKind::Warning,
            StateKind::Failed,
            StateKind::Cancelled,
            StateKind::Breakpoint,
        ] {
            let parsed: StateKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("NOT_A_STATE".parse::<StateKind>().is_err());
    }

    #[test]
    fn test_serde_wire_format() {
        let json = serde_json::to_string(&StateKind::Killing).unwrap();
        assert_eq!(json, "\"KILLING\"");
        let back: StateKind = serde_json::from_str("\"SUCCESS\"").unwrap();
        assert_eq!(back, StateKind::Success);
    }

    #[test]
    fn test_history_appends() {
        let state = State::new(StateKind::Created)
            .with_state(StateKind::Running)
            .with_state(StateKind::Success);
        assert_eq!(state.current, StateKind::Success);
        assert_eq!(state.histories.len(), 3);
        assert!(state.has_been(StateKind::Running));
        assert!(!state.has_been(StateKind::Paused));
        assert!(state.end_date().is_some());
    }

    #[test]
    fn test_duplicate_append_is_noop() {
        let state = State::new(StateKind::Created).with_state(StateKind::Running);
        let again = state.with_state(StateKind::Running);
        assert_eq!(again.histories.len(), 2);
    }

    #[test]
    fn test_duration_is_non_negative() {
        let state = State::new(StateKind::Created).with_state(StateKind::Success);
        assert!(state.duration() >= Duration::zero());
    }
}
