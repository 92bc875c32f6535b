use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Scheduling state of one (job, operation) pair.
///
/// A pair moves Blocked → Eligible as its preconditions come true,
/// Eligible → Running when selected, and Running → Done only once the
/// postconditions are observed to hold after the body returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairState {
    Blocked,
    Eligible,
    Running,
    Done,
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairState::Blocked => write!(f, "BLOCKED"),
            PairState::Eligible => write!(f, "ELIGIBLE"),
            PairState::Running => write!(f, "RUNNING"),
            PairState::Done => write!(f, "DONE"),
        }
    }
}

/// Something that happened to a pair during a scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairEvent {
    /// Preconditions and postconditions were (re)evaluated.
    Evaluated { pre: bool, post: bool },
    /// The body was started.
    Start,
    /// The body returned; `post` is the freshly evaluated postcondition.
    Finished { post: bool },
    /// The body failed or the process is unwinding the pair.
    Aborted,
}

/// Reason a pair was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Postconditions already held before the pass.
    AlreadyDone,
    /// Preconditions did not hold.
    Blocked,
    /// Postconditions came true between selection and execution.
    CompletedElsewhere,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyDone => write!(f, "already done"),
            SkipReason::Blocked => write!(f, "blocked"),
            SkipReason::CompletedElsewhere => write!(f, "completed by another process"),
        }
    }
}

/// Result of handling a pair in one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairOutcome {
    Succeeded,
    Skipped(SkipReason),
    Failed { kind: ErrorKind, message: String },
}

impl PairOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, PairOutcome::Failed { .. })
    }
}

pub struct StateMachine;

impl StateMachine {
    /// Classifies a pair from its current condition values.
    ///
    /// Completion wins over eligibility: a pair whose postconditions hold is
    /// Done even if its preconditions have since gone false.
    pub fn classify(pre: bool, post: bool) -> PairState {
        match (pre, post) {
            (_, true) => PairState::Done,
            (true, false) => PairState::Eligible,
            (false, false) => PairState::Blocked,
        }
    }

    /// Computes the state after `event`. Events that make no sense in the
    /// current state leave it unchanged.
    pub fn next(state: PairState, event: PairEvent) -> PairState {
        match (state, event) {
            (PairState::Running, PairEvent::Evaluated { .. }) => PairState::Running,
            (_, PairEvent::Evaluated { pre, post }) => Self::classify(pre, post),
            (PairState::Eligible, PairEvent::Start) => PairState::Running,
            (PairState::Running, PairEvent::Finished { post: true }) => PairState::Done,
            // Body returned without establishing its postconditions: retry next invocation.
            (PairState::Running, PairEvent::Finished { post: false }) => PairState::Eligible,
            (PairState::Running, PairEvent::Aborted) => PairState::Eligible,
            (state, _) => state,
        }
    }
}
