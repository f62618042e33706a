//! Shared record types for runs, tool calls, patches and events.
//!
//! These types are the contract between the worker and the event/record
//! store. They carry no I/O and serialize to stable JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::risk::RiskAssessment;

/// Maximum characters kept in a sealed tool call's result summary.
pub const TOOL_SUMMARY_LIMIT: usize = 500;

/// Authoritative lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Verifying,
    AwaitingApproval,
    Approved,
    Applying,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Verifying => "verifying",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Approved => "approved",
            RunStatus::Applying => "applying",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A sealed record of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: String,
    /// Opaque tool arguments, ordered by key for stable output.
    pub input: BTreeMap<String, Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ToolCallStatus,
    pub result_summary: Option<String>,
}

impl ToolCall {
    /// Start a tool invocation. The returned handle is the only way to seal it.
    pub fn begin(
        id: impl Into<String>,
        tool: impl Into<String>,
        input: BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> InFlightToolCall {
        InFlightToolCall {
            call: ToolCall {
                id: id.into(),
                tool: tool.into(),
                input,
                started_at: Some(now),
                finished_at: None,
                status: ToolCallStatus::Running,
                result_summary: None,
            },
        }
    }
}

/// A tool call that has started but not finished.
///
/// Sealing consumes the handle, so a finished record cannot be mutated through it.
#[derive(Debug)]
pub struct InFlightToolCall {
    call: ToolCall,
}

impl InFlightToolCall {
    pub fn record(&self) -> &ToolCall {
        &self.call
    }

    pub fn complete(self, summary: &str, now: DateTime<Utc>) -> ToolCall {
        self.seal(ToolCallStatus::Completed, summary, now)
    }

    pub fn fail(self, error: &str, now: DateTime<Utc>) -> ToolCall {
        self.seal(ToolCallStatus::Failed, error, now)
    }

    fn seal(mut self, status: ToolCallStatus, summary: &str, now: DateTime<Utc>) -> ToolCall {
        self.call.status = status;
        self.call.finished_at = Some(now);
        self.call.result_summary = Some(truncate_chars(summary, TOOL_SUMMARY_LIMIT));
        self.call
    }
}

/// Truncate to at most `limit` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffLineKind {
    Header,
    Context,
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub kind: DiffLineKind,
    pub text: String,
    pub old_line: Option<u32>,
    pub new_line: Option<u32>,
}

/// Per-file slice of a patch, immutable once the patch exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Repository-relative target path (the old path for deletions).
    pub path: String,
    pub additions: u32,
    pub deletions: u32,
    pub lines: Vec<DiffLine>,
}

/// A proposed unified diff plus metadata.
///
/// Only the approval and applied fields change after creation, and only
/// through [`Patch::approve`] and [`Patch::mark_applied`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    pub run_id: String,
    pub summary: String,
    pub diff: String,
    pub files: Vec<FileChange>,
    pub additions: u32,
    pub deletions: u32,
    pub reasoning: String,
    pub risk: Option<RiskAssessment>,
    pub approved: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Patch {
    /// Record an approval. Re-approving keeps the first approver.
    pub fn approve(&mut self, approver: &str, at: DateTime<Utc>) {
        if self.approved {
            return;
        }
        self.approved = true;
        self.approved_by = Some(approver.to_string());
        self.approved_at = Some(at);
    }

    /// Flip the applied flag. Refuses unless the patch is approved.
    pub fn mark_applied(&mut self, at: DateTime<Utc>) -> Result<(), PatchStateError> {
        if !self.approved {
            return Err(PatchStateError::NotApproved {
                patch_id: self.id.clone(),
            });
        }
        if !self.applied {
            self.applied = true;
            self.applied_at = Some(at);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchStateError {
    NotApproved { patch_id: String },
}

impl fmt::Display for PatchStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchStateError::NotApproved { patch_id } => {
                write!(f, "patch {patch_id} cannot be applied before it is approved")
            }
        }
    }
}

impl std::error::Error for PatchStateError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

/// One detected verification command and its sealed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCommand {
    pub command: String,
    pub status: VerificationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub commands: Vec<VerificationCommand>,
    pub passed: bool,
}

impl VerificationSummary {
    /// Passing requires at least one command and every command passed.
    pub fn from_commands(commands: Vec<VerificationCommand>) -> Self {
        let passed = !commands.is_empty()
            && commands
                .iter()
                .all(|cmd| cmd.status == VerificationStatus::Passed);
        Self { commands, passed }
    }
}

/// Failure taxonomy for runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Verification,
    Environment,
    Analysis,
    Unknown,
}

impl ErrorCategory {
    pub fn is_recoverable(self) -> bool {
        self != ErrorCategory::Environment
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Verification => "verification",
            ErrorCategory::Environment => "environment",
            ErrorCategory::Analysis => "analysis",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Pipeline phase in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Claim,
    Context,
    Verification,
    Proposal,
    Validation,
    Approval,
    Apply,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub phase: RunPhase,
    pub category: ErrorCategory,
    pub recoverable: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// External approval decision for a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub decision: ApprovalDecision,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// A single end-to-end attempt to satisfy a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub task: String,
    pub status: RunStatus,
    pub plan: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub patch_ids: Vec<String>,
    pub verification: Option<VerificationSummary>,
    pub approval: ApprovalRecord,
    pub risk: Option<RiskAssessment>,
    pub error: Option<ErrorRecord>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn queued(id: impl Into<String>, task: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            status: RunStatus::Queued,
            plan: None,
            tool_calls: Vec::new(),
            patch_ids: Vec::new(),
            verification: None,
            approval: ApprovalRecord::default(),
            risk: None,
            error: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Merge-patch for a run record. `None` fields are left untouched.
///
/// Status is deliberately absent: it only moves through compare-and-set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub plan: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub patch_ids: Option<Vec<String>>,
    pub verification: Option<VerificationSummary>,
    pub approval: Option<ApprovalRecord>,
    pub risk: Option<RiskAssessment>,
    pub error: Option<ErrorRecord>,
}

impl RunUpdate {
    pub fn apply_to(&self, run: &mut Run, now: DateTime<Utc>) {
        if let Some(plan) = &self.plan {
            run.plan = Some(plan.clone());
        }
        if let Some(tool_calls) = &self.tool_calls {
            run.tool_calls = tool_calls.clone();
        }
        if let Some(patch_ids) = &self.patch_ids {
            run.patch_ids = patch_ids.clone();
        }
        if let Some(verification) = &self.verification {
            run.verification = Some(verification.clone());
        }
        if let Some(approval) = &self.approval {
            run.approval = approval.clone();
        }
        if let Some(risk) = &self.risk {
            run.risk = Some(risk.clone());
        }
        if let Some(error) = &self.error {
            run.error = Some(error.clone());
        }
        run.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    StatusChanged,
    ToolCallStarted,
    ToolCallCompleted,
    VerificationStarted,
    CommandStarted,
    LogChunk,
    CommandFinished,
    VerificationCompleted,
    PatchProposed,
    AwaitingApproval,
    PatchApplied,
    ApplyWarning,
    ApplyFailed,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

/// An event not yet assigned a sequence number by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: EventType,
    pub payload: Value,
}

impl NewEvent {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }
}

/// A durable entry in a run's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub run_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch() -> Patch {
        Patch {
            id: "p1".to_string(),
            run_id: "r1".to_string(),
            summary: "s".to_string(),
            diff: String::new(),
            files: Vec::new(),
            additions: 0,
            deletions: 0,
            reasoning: String::new(),
            risk: None,
            approved: false,
            approved_by: None,
            approved_at: None,
            applied: false,
            applied_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn mark_applied_requires_approval() {
        let mut patch = patch();
        let err = patch.mark_applied(Utc::now()).unwrap_err();
        assert_eq!(
            err,
            PatchStateError::NotApproved {
                patch_id: "p1".to_string()
            }
        );
        assert!(!patch.applied);

        patch.approve("alice", Utc::now());
        patch.mark_applied(Utc::now()).expect("applied");
        assert!(patch.applied && patch.approved);
    }

    #[test]
    fn reapproval_keeps_first_approver() {
        let mut patch = patch();
        patch.approve("alice", Utc::now());
        patch.approve("bob", Utc::now());
        assert_eq!(patch.approved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn sealing_truncates_summary() {
        let call = ToolCall::begin("t1", "search", BTreeMap::new(), Utc::now());
        let long = "x".repeat(TOOL_SUMMARY_LIMIT + 10);
        let sealed = call.complete(&long, Utc::now());
        assert_eq!(sealed.status, ToolCallStatus::Completed);
        let summary = sealed.result_summary.expect("summary");
        assert_eq!(summary.chars().count(), TOOL_SUMMARY_LIMIT + 1);
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn empty_verification_does_not_pass() {
        assert!(!VerificationSummary::from_commands(Vec::new()).passed);
    }

    #[test]
    fn run_update_merges_only_present_fields() {
        let now = Utc::now();
        let mut run = Run::queued("r1", "task", now);
        run.plan = Some("keep".to_string());
        let update = RunUpdate {
            patch_ids: Some(vec!["p1".to_string()]),
            ..RunUpdate::default()
        };
        update.apply_to(&mut run, now);
        assert_eq!(run.plan.as_deref(), Some("keep"));
        assert_eq!(run.patch_ids, vec!["p1".to_string()]);
    }

    #[test]
    fn event_types_serialize_screaming_snake() {
        let event = NewEvent::new(EventType::RunStarted, json!({}));
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["event_type"], "RUN_STARTED");
        let status = serde_json::to_value(RunStatus::AwaitingApproval).expect("serialize");
        assert_eq!(status, "awaiting_approval");
    }
}
