//! Run lifecycle graph.
//!
//! ```text
//! queued -> running -> verifying -> awaiting_approval -> approved -> applying -> completed
//!                          |               |
//!                          v               v
//!                        failed     failed (rejected)
//! ```
//!
//! `failed` is reachable from every claimed, non-terminal state and
//! `cancelled` from every non-terminal state. Nothing re-enters `queued`.

use std::fmt;

use crate::core::types::RunStatus;

/// Whether `from -> to` is an edge of the lifecycle graph.
pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::{
        Applying, Approved, AwaitingApproval, Cancelled, Completed, Failed, Queued, Running,
        Verifying,
    };

    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (_, Cancelled) => true,
        (Queued, Failed) => false,
        (_, Failed) => true,
        (Queued, Running)
        | (Running, Verifying)
        | (Verifying, AwaitingApproval)
        | (AwaitingApproval, Approved)
        | (Approved, Applying)
        | (Applying, Completed) => true,
        _ => false,
    }
}

/// Validate a transition, returning a stable error for illegal edges.
pub fn check_transition(from: RunStatus, to: RunStatus) -> Result<(), TransitionError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal run transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}
