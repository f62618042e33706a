//! External approval signals.
//!
//! These calls record a human decision; they never move a run through
//! approved/applying themselves. The owning orchestrator observes the record
//! on its next tick and acts on it.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use crate::core::types::{ApprovalDecision, ApprovalRecord, EventType, NewEvent, Run, RunStatus};
use crate::io::store::Store;
use crate::io::transport::{EventSink, RetryPolicy, with_retry};

/// Approve every patch of a run awaiting approval.
pub fn approve_run<S: Store + ?Sized>(
    store: &S,
    policy: &RetryPolicy,
    run_id: &str,
    approver: &str,
    now: DateTime<Utc>,
) -> Result<Run> {
    let run = decidable_run(store, policy, run_id)?;
    if run.patch_ids.is_empty() {
        bail!("run {run_id} has no patches to approve");
    }
    let approval = ApprovalRecord {
        decision: ApprovalDecision::Approved,
        decided_by: Some(approver.to_string()),
        decided_at: Some(now),
        reason: None,
    };
    let run = record(store, policy, run_id, &approval)?;
    info!(run_id, approver, "run approved");
    Ok(run)
}

/// Record a rejection. The orchestrator fails the run when it observes it.
pub fn reject_run<S: Store + ?Sized>(
    store: &S,
    policy: &RetryPolicy,
    run_id: &str,
    rejected_by: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Run> {
    decidable_run(store, policy, run_id)?;
    let approval = ApprovalRecord {
        decision: ApprovalDecision::Rejected,
        decided_by: Some(rejected_by.to_string()),
        decided_at: Some(now),
        reason: reason.map(str::to_string),
    };
    let run = record(store, policy, run_id, &approval)?;
    info!(run_id, rejected_by, "run rejected");
    Ok(run)
}

/// Conditionally write the decision. A concurrent decision or status change
/// between the check above and this write surfaces as the usual error.
fn record<S: Store + ?Sized>(
    store: &S,
    policy: &RetryPolicy,
    run_id: &str,
    approval: &ApprovalRecord,
) -> Result<Run> {
    match with_retry(policy, "record_decision", || {
        store.record_decision(run_id, approval)
    })? {
        Some(run) => Ok(run),
        None => {
            decidable_run(store, policy, run_id)?;
            bail!("run {run_id} changed while its decision was recorded")
        }
    }
}

/// Cancel a non-terminal run. Returns the status it was cancelled from.
///
/// Retries the compare-and-set when the run moves concurrently.
pub fn cancel_run<S: Store + ?Sized>(
    store: &S,
    policy: &RetryPolicy,
    run_id: &str,
) -> Result<RunStatus> {
    loop {
        let run = with_retry(policy, "get_run", || store.get_run(run_id))?;
        if run.status.is_terminal() {
            bail!("run {run_id} is already {}", run.status);
        }
        let won = with_retry(policy, "transition_status", || {
            store.transition_status(run_id, run.status, RunStatus::Cancelled)
        })?;
        if won {
            EventSink::new(store, *policy)
                .emit(
                    run_id,
                    NewEvent::new(
                        EventType::StatusChanged,
                        json!({ "from": run.status, "to": RunStatus::Cancelled }),
                    ),
                )
                .ignore_failure("status change is persisted; the event is telemetry");
            info!(run_id, from = %run.status, "run cancelled");
            return Ok(run.status);
        }
    }
}

fn decidable_run<S: Store + ?Sized>(
    store: &S,
    policy: &RetryPolicy,
    run_id: &str,
) -> Result<Run> {
    let run = with_retry(policy, "get_run", || store.get_run(run_id))?;
    if run.status != RunStatus::AwaitingApproval {
        bail!(
            "run {run_id} is {}, not awaiting approval",
            run.status
        );
    }
    if run.approval.decision != ApprovalDecision::Pending {
        bail!("run {run_id} already has an approval decision");
    }
    Ok(run)
}
