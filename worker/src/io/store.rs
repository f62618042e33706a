//! Event/record store contract.
//!
//! The store is the system of record for runs, patches and run events.
//! Implementations are responsible for making ownership transitions explicit:
//! - `claim` and `transition_status` must check and write the status in one
//!   atomic conditional update, so a losing caller observes `None`/`false`
//!   and never a partially written run.
//! - `append_events` must be durable before it returns and must assign
//!   strictly increasing per-run sequence numbers.
//! - `record_decision` must check for an open decision and write it (and, for
//!   approvals, the run's patch flags) in one atomic conditional update.
//! - `mark_patch_applied` must refuse an unapproved patch.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::lifecycle::check_transition;
use crate::core::types::{
    ApprovalDecision, ApprovalRecord, NewEvent, Patch, PatchStateError, Run, RunEvent, RunStatus,
    RunUpdate,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound { kind: &'static str, id: String },
    /// Transient; callers may retry.
    Unavailable(String),
    Conflict(String),
    /// A write would break a record invariant.
    Invariant(String),
    /// A persisted record could not be decoded.
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn run_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: "run",
            id: id.to_string(),
        }
    }

    pub fn patch_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: "patch",
            id: id.to_string(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { kind, id } => write!(f, "{kind} {id} not found"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::Conflict(msg) => write!(f, "store conflict: {msg}"),
            StoreError::Invariant(msg) => write!(f, "store invariant violated: {msg}"),
            StoreError::Corrupt(msg) => write!(f, "store record corrupt: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<PatchStateError> for StoreError {
    fn from(err: PatchStateError) -> Self {
        StoreError::Invariant(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which run a claim targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimTarget {
    Run(String),
    OldestQueued,
}

pub trait Store: Send + Sync {
    /// Insert a new run. Fails with `Conflict` if the id exists.
    fn insert_run(&self, run: Run) -> StoreResult<()>;

    fn get_run(&self, id: &str) -> StoreResult<Run>;

    /// Runs in `status`, oldest first.
    fn runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<Run>>;

    /// Merge `update` into the run and stamp `updated_at`.
    fn update_run(&self, id: &str, update: &RunUpdate) -> StoreResult<Run>;

    /// Move the run from `from` to `to` if it is still in `from`.
    ///
    /// Returns `Ok(false)` when the run is no longer in `from`. Illegal
    /// lifecycle edges are `Invariant` errors.
    fn transition_status(&self, id: &str, from: RunStatus, to: RunStatus) -> StoreResult<bool>;

    /// Atomically move a queued run to running under `worker_id`.
    ///
    /// Returns `Ok(None)` when the target exists but is not queued (or, for
    /// [`ClaimTarget::OldestQueued`], when nothing is queued).
    fn claim(
        &self,
        target: &ClaimTarget,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>>;

    /// Append events in order and return them with assigned sequence numbers.
    fn append_events(&self, run_id: &str, events: &[NewEvent]) -> StoreResult<Vec<RunEvent>>;

    fn events(&self, run_id: &str) -> StoreResult<Vec<RunEvent>>;

    fn insert_patch(&self, patch: Patch) -> StoreResult<()>;

    fn get_patch(&self, id: &str) -> StoreResult<Patch>;

    /// Patches of a run, in proposal order.
    fn patches_for_run(&self, run_id: &str) -> StoreResult<Vec<Patch>>;

    fn approve_patch(&self, id: &str, approver: &str, at: DateTime<Utc>) -> StoreResult<Patch>;

    /// Record a human decision on a run awaiting one. An approval flags every
    /// patch of the run in the same update.
    ///
    /// Returns `Ok(None)` when the run is not awaiting approval or already has
    /// a decision.
    fn record_decision(&self, id: &str, approval: &ApprovalRecord) -> StoreResult<Option<Run>>;

    /// Flip the applied flag. Unapproved patches are `Invariant` errors.
    fn mark_patch_applied(&self, id: &str, at: DateTime<Utc>) -> StoreResult<Patch>;
}

impl<T: Store + ?Sized> Store for Arc<T> {
    fn insert_run(&self, run: Run) -> StoreResult<()> {
        (**self).insert_run(run)
    }

    fn get_run(&self, id: &str) -> StoreResult<Run> {
        (**self).get_run(id)
    }

    fn runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<Run>> {
        (**self).runs_with_status(status)
    }

    fn update_run(&self, id: &str, update: &RunUpdate) -> StoreResult<Run> {
        (**self).update_run(id, update)
    }

    fn transition_status(&self, id: &str, from: RunStatus, to: RunStatus) -> StoreResult<bool> {
        (**self).transition_status(id, from, to)
    }

    fn claim(
        &self,
        target: &ClaimTarget,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>> {
        (**self).claim(target, worker_id, now)
    }

    fn append_events(&self, run_id: &str, events: &[NewEvent]) -> StoreResult<Vec<RunEvent>> {
        (**self).append_events(run_id, events)
    }

    fn events(&self, run_id: &str) -> StoreResult<Vec<RunEvent>> {
        (**self).events(run_id)
    }

    fn insert_patch(&self, patch: Patch) -> StoreResult<()> {
        (**self).insert_patch(patch)
    }

    fn get_patch(&self, id: &str) -> StoreResult<Patch> {
        (**self).get_patch(id)
    }

    fn patches_for_run(&self, run_id: &str) -> StoreResult<Vec<Patch>> {
        (**self).patches_for_run(run_id)
    }

    fn approve_patch(&self, id: &str, approver: &str, at: DateTime<Utc>) -> StoreResult<Patch> {
        (**self).approve_patch(id, approver, at)
    }

    fn record_decision(&self, id: &str, approval: &ApprovalRecord) -> StoreResult<Option<Run>> {
        (**self).record_decision(id, approval)
    }

    fn mark_patch_applied(&self, id: &str, at: DateTime<Utc>) -> StoreResult<Patch> {
        (**self).mark_patch_applied(id, at)
    }
}

/// Compare-and-set a run's status in place. Shared by store implementations.
pub(crate) fn transition_in_place(
    run: &mut Run,
    from: RunStatus,
    to: RunStatus,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    check_transition(from, to).map_err(|err| StoreError::Invariant(err.to_string()))?;
    if run.status != from {
        return Ok(false);
    }
    run.status = to;
    run.updated_at = now;
    Ok(true)
}

/// Claim a run in place if it is queued. Shared by store implementations.
pub(crate) fn claim_in_place(run: &mut Run, worker_id: &str, now: DateTime<Utc>) -> bool {
    if run.status != RunStatus::Queued {
        return false;
    }
    run.status = RunStatus::Running;
    run.claimed_by = Some(worker_id.to_string());
    run.claimed_at = Some(now);
    run.updated_at = now;
    true
}

/// Whether a decision may still be recorded on `run`.
pub(crate) fn decision_open(run: &Run) -> bool {
    run.status == RunStatus::AwaitingApproval && run.approval.decision == ApprovalDecision::Pending
}

/// Flag `patches` approved on behalf of an approval record.
pub(crate) fn approve_for(patches: &mut [Patch], approval: &ApprovalRecord, now: DateTime<Utc>) {
    let approver = approval.decided_by.as_deref().unwrap_or("unknown");
    let at = approval.decided_at.unwrap_or(now);
    for patch in patches {
        patch.approve(approver, at);
    }
}

/// Oldest-first ordering used by `runs_with_status` and oldest-queued claims.
pub(crate) fn sort_oldest_first(runs: &mut [Run]) {
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Stamp sequence numbers onto new events, continuing after `last_seq`.
pub(crate) fn sequence_events(
    run_id: &str,
    last_seq: u64,
    events: &[NewEvent],
    at: DateTime<Utc>,
) -> Vec<RunEvent> {
    events
        .iter()
        .zip(last_seq + 1..)
        .map(|(event, seq)| RunEvent {
            seq,
            run_id: run_id.to_string(),
            event_type: event.event_type,
            payload: event.payload.clone(),
            at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EventType;
    use serde_json::json;

    #[test]
    fn transition_in_place_is_compare_and_set() {
        let now = Utc::now();
        let mut run = Run::queued("r1", "task", now);
        run.status = RunStatus::Running;
        assert!(
            transition_in_place(&mut run, RunStatus::Running, RunStatus::Verifying, now)
                .expect("legal")
        );
        assert!(
            !transition_in_place(&mut run, RunStatus::Running, RunStatus::Verifying, now)
                .expect("legal")
        );
        assert_eq!(run.status, RunStatus::Verifying);
    }

    #[test]
    fn illegal_edge_is_invariant_error() {
        let now = Utc::now();
        let mut run = Run::queued("r1", "task", now);
        let err = transition_in_place(&mut run, RunStatus::Queued, RunStatus::Completed, now)
            .unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
        assert_eq!(run.status, RunStatus::Queued);
    }

    #[test]
    fn sequence_continues_after_last() {
        let events = vec![
            NewEvent::new(EventType::LogChunk, json!({"chunk": "a"})),
            NewEvent::new(EventType::LogChunk, json!({"chunk": "b"})),
        ];
        let sequenced = sequence_events("r1", 4, &events, Utc::now());
        let seqs: Vec<u64> = sequenced.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![5, 6]);
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("timeout".to_string()).is_transient());
        assert!(!StoreError::run_not_found("r1").is_transient());
        assert!(!StoreError::Conflict("dup".to_string()).is_transient());
    }
}
