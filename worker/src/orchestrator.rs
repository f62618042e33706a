//! Run state machine.
//!
//! An [`Orchestrator`] owns one run slot. Each [`Orchestrator::tick`] either
//! advances a run this worker already owns (an approval decision arrived) or
//! claims the oldest queued run and drives it to `awaiting_approval`. Status
//! moves only through store compare-and-set, so a cancellation written by
//! anyone else is observed as a lost transition at the next phase boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::classify_message;
use crate::core::diff::{FileDiff, parse_unified_diff};
use crate::core::lifecycle::can_transition;
use crate::core::patch_policy::{PatchConstraints, validate_patch};
use crate::core::risk::{RiskThresholds, assess_risk};
use crate::core::symbols::extract_symbols;
use crate::core::types::{
    ApprovalDecision, ErrorCategory, ErrorRecord, EventType, NewEvent, Patch, Run, RunPhase,
    RunStatus, RunUpdate, ToolCall, ToolCallStatus, VerificationStatus, truncate_chars,
};
use crate::io::claim::{ClaimCoordinator, ClaimOutcome};
use crate::io::config::{ContextConfig, VerificationConfig, WorkerConfig};
use crate::io::patch_apply::apply_patch;
use crate::io::process::{CommandRunner, StreamSettings};
use crate::io::proposer::{ProposalRequest, Proposer};
use crate::io::repo_tools::RepoTools;
use crate::io::store::{Store, StoreError};
use crate::io::transport::{EventSink, RetryPolicy, with_retry};
use crate::io::verify::{VerificationPipeline, detect_for_repo};

/// Upper bound on the context digest handed to the proposer.
const CONTEXT_DIGEST_CHARS: usize = 20_000;
const SYMBOLS_PER_FILE: usize = 20;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "into", "that", "this", "add", "fix", "make", "update",
    "use", "when", "should", "all", "our", "its", "not", "are",
];

/// A pipeline failure with the phase and (optionally) category it was raised in.
///
/// Attached at the failing call site and recovered with `downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub phase: RunPhase,
    pub category: Option<ErrorCategory>,
    pub message: String,
}

impl RunFailure {
    pub fn new(phase: RunPhase, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            phase,
            category: Some(category),
            message: message.into(),
        }
    }

    /// Resolve the category, falling back to the message classifier.
    pub fn resolved_category(&self) -> ErrorCategory {
        self.category
            .unwrap_or_else(|| classify_message(&self.message))
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RunFailure {}

/// The run was cancelled out from under the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RunCancelled;

impl fmt::Display for RunCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("run was cancelled")
    }
}

impl std::error::Error for RunCancelled {}

trait PhaseExt<T> {
    /// Tag an untagged error with the phase it surfaced in.
    fn phase(self, phase: RunPhase) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> PhaseExt<T> for std::result::Result<T, E> {
    fn phase(self, phase: RunPhase) -> Result<T> {
        self.map_err(|err| {
            let err: anyhow::Error = err.into();
            if err.is::<RunFailure>() || err.is::<RunCancelled>() {
                return err;
            }
            let phase = if err.is::<StoreError>() {
                RunPhase::Store
            } else {
                phase
            };
            anyhow!(RunFailure {
                phase,
                category: None,
                message: format!("{err:#}"),
            })
        })
    }
}

/// Single run slot. At most one guard exists at a time.
#[derive(Debug, Default)]
pub struct RunSlot {
    busy: AtomicBool,
}

impl RunSlot {
    pub fn try_acquire(&self) -> Option<SlotGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard { slot: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct SlotGuard<'a> {
    slot: &'a RunSlot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The slot is taken; nothing was done.
    Busy,
    /// Nothing to claim or advance.
    Idle,
    /// A queued run was claimed and driven until it stopped.
    Processed { run_id: String, status: RunStatus },
    /// An owned run moved on after an approval decision.
    Advanced { run_id: String, status: RunStatus },
    /// A targeted claim found no such run.
    NotFound { run_id: String },
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub worker_id: String,
    pub repo_root: PathBuf,
    pub retry: RetryPolicy,
    pub stream: StreamSettings,
    pub verification: VerificationConfig,
    pub patch: PatchConstraints,
    pub risk: RiskThresholds,
    pub context: ContextConfig,
}

impl OrchestratorConfig {
    pub fn from_worker_config(cfg: &WorkerConfig, repo_root: &Path, worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            repo_root: repo_root.to_path_buf(),
            retry: RetryPolicy::from(&cfg.retry),
            stream: StreamSettings::from(&cfg.command),
            verification: cfg.verification.clone(),
            patch: cfg.patch.clone(),
            risk: cfg.risk.clone(),
            context: cfg.context.clone(),
        }
    }
}

pub struct Orchestrator<S: Store, R: CommandRunner, P: Proposer> {
    store: S,
    runner: R,
    proposer: P,
    config: OrchestratorConfig,
    slot: RunSlot,
}

impl<S: Store, R: CommandRunner, P: Proposer> Orchestrator<S, R, P> {
    pub fn new(store: S, runner: R, proposer: P, config: OrchestratorConfig) -> Self {
        Self {
            store,
            runner,
            proposer,
            config,
            slot: RunSlot::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn proposer(&self) -> &P {
        &self.proposer
    }

    pub fn slot(&self) -> &RunSlot {
        &self.slot
    }

    fn sink(&self) -> EventSink<'_, S> {
        EventSink::new(&self.store, self.config.retry)
    }

    /// One scheduling step. Owned runs with a decision come before new claims.
    #[instrument(skip_all, fields(worker_id = %self.config.worker_id))]
    pub fn tick(&self) -> Result<TickOutcome> {
        let Some(_guard) = self.slot.try_acquire() else {
            debug!("slot busy");
            return Ok(TickOutcome::Busy);
        };

        if let Some(run) = self.next_owned_decision()? {
            let run_id = run.id.clone();
            let status = self.advance_locked(run)?;
            return Ok(TickOutcome::Advanced { run_id, status });
        }

        let claims = ClaimCoordinator::new(&self.store, &self.config.worker_id, self.config.retry);
        match claims.claim_next(Utc::now())? {
            ClaimOutcome::Claimed(run) => {
                let run_id = run.id.clone();
                let status = self.process_locked(*run)?;
                Ok(TickOutcome::Processed { run_id, status })
            }
            ClaimOutcome::NotClaimed | ClaimOutcome::NotFound => Ok(TickOutcome::Idle),
        }
    }

    /// Claim and process one specific run.
    #[instrument(skip_all, fields(worker_id = %self.config.worker_id, run_id = %run_id))]
    pub fn claim_and_process(&self, run_id: &str) -> Result<TickOutcome> {
        let Some(_guard) = self.slot.try_acquire() else {
            return Ok(TickOutcome::Busy);
        };
        let claims = ClaimCoordinator::new(&self.store, &self.config.worker_id, self.config.retry);
        match claims.claim_run(run_id, Utc::now())? {
            ClaimOutcome::Claimed(run) => {
                let status = self.process_locked(*run)?;
                Ok(TickOutcome::Processed {
                    run_id: run_id.to_string(),
                    status,
                })
            }
            ClaimOutcome::NotClaimed => Ok(TickOutcome::Idle),
            ClaimOutcome::NotFound => Ok(TickOutcome::NotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    /// Advance one owned run whose approval decision has arrived.
    pub fn advance(&self, run_id: &str) -> Result<TickOutcome> {
        let Some(_guard) = self.slot.try_acquire() else {
            return Ok(TickOutcome::Busy);
        };
        let run = with_retry(&self.config.retry, "get_run", || self.store.get_run(run_id))?;
        let status = self.advance_locked(run)?;
        Ok(TickOutcome::Advanced {
            run_id: run_id.to_string(),
            status,
        })
    }

    fn next_owned_decision(&self) -> Result<Option<Run>> {
        let owned = |run: &Run| run.claimed_by.as_deref() == Some(self.config.worker_id.as_str());
        let approved = with_retry(&self.config.retry, "runs_with_status", || {
            self.store.runs_with_status(RunStatus::Approved)
        })?;
        if let Some(run) = approved.into_iter().find(|run| owned(run)) {
            return Ok(Some(run));
        }
        let awaiting = with_retry(&self.config.retry, "runs_with_status", || {
            self.store.runs_with_status(RunStatus::AwaitingApproval)
        })?;
        Ok(awaiting
            .into_iter()
            .find(|run| owned(run) && run.approval.decision != ApprovalDecision::Pending))
    }

    fn process_locked(&self, run: Run) -> Result<RunStatus> {
        let run_id = run.id.clone();
        let outcome = self.run_pipeline(run);
        self.settle(&run_id, outcome)
    }

    fn advance_locked(&self, run: Run) -> Result<RunStatus> {
        let run_id = run.id.clone();
        let outcome = self.run_approval(run);
        self.settle(&run_id, outcome)
    }

    /// Turn a pipeline outcome into the run's persisted status.
    fn settle(&self, run_id: &str, outcome: Result<RunStatus>) -> Result<RunStatus> {
        match outcome {
            Ok(status) => Ok(status),
            Err(err) if err.is::<RunCancelled>() => {
                info!(run_id, "run cancelled; stopping");
                self.sink()
                    .emit(run_id, NewEvent::new(EventType::RunCancelled, json!({})))
                    .ignore_failure("the cancellation itself is already persisted");
                Ok(RunStatus::Cancelled)
            }
            Err(err) => self.fail_run(run_id, &err),
        }
    }

    /// Claimed run: context, verification, proposal, awaiting approval.
    #[instrument(skip_all, fields(run_id = %run.id))]
    fn run_pipeline(&self, run: Run) -> Result<RunStatus> {
        let run_id = run.id.as_str();

        let digest = self.gather_context(&run)?;
        self.move_status(run_id, RunStatus::Running, RunStatus::Verifying)?;

        let commands = detect_for_repo(&self.config.repo_root, &self.config.verification)
            .map_err(|err| {
                RunFailure::new(
                    RunPhase::Verification,
                    ErrorCategory::Analysis,
                    format!("verification detection failed: {err:#}"),
                )
            })?;
        if commands.is_empty() {
            return Err(RunFailure::new(
                RunPhase::Verification,
                ErrorCategory::Verification,
                "no verification commands detected",
            )
            .into());
        }
        let pipeline = VerificationPipeline {
            sink: self.sink(),
            runner: &self.runner,
            settings: self.config.stream,
            repo_root: &self.config.repo_root,
        };
        let summary = pipeline.run(run_id, &commands);
        self.update(
            run_id,
            RunUpdate {
                verification: Some(summary.clone()),
                ..RunUpdate::default()
            },
        )?;
        if !summary.passed {
            let failed: Vec<String> = summary
                .commands
                .iter()
                .filter(|cmd| cmd.status != VerificationStatus::Passed)
                .map(|cmd| {
                    format!(
                        "{} exited with code {}",
                        cmd.command,
                        cmd.exit_code.unwrap_or(1)
                    )
                })
                .collect();
            return Err(RunFailure::new(
                RunPhase::Verification,
                ErrorCategory::Verification,
                format!("verification failed: {}", failed.join("; ")),
            )
            .into());
        }
        self.checkpoint(run_id)?;

        let request = ProposalRequest {
            run_id: run_id.to_string(),
            task: run.task.clone(),
            context: digest,
            verification: summary,
        };
        let proposal = self.proposer.propose(&request).map_err(|err| {
            RunFailure::new(
                RunPhase::Proposal,
                ErrorCategory::Analysis,
                format!("proposal failed: {err:#}"),
            )
        })?;
        self.checkpoint(run_id)?;

        let files = parse_unified_diff(&proposal.diff).map_err(|err| {
            RunFailure::new(
                RunPhase::Validation,
                ErrorCategory::Analysis,
                format!("diff parse failed: {err}"),
            )
        })?;
        let report = validate_patch(&files, &self.config.repo_root, &self.config.patch);
        if !report.is_valid() {
            return Err(RunFailure::new(
                RunPhase::Validation,
                report.category().unwrap_or(ErrorCategory::Analysis),
                format!("patch rejected: {}", report.error_summary()),
            )
            .into());
        }
        for warning in &report.warnings {
            warn!(run_id, warning = %warning, "patch warning");
        }

        let changes: Vec<_> = files.iter().map(FileDiff::to_file_change).collect();
        let risk = assess_risk(&changes, &run.task, &self.config.risk);
        let patch = Patch {
            id: patch_id(run_id, &proposal.diff),
            run_id: run_id.to_string(),
            summary: proposal.summary,
            diff: proposal.diff,
            additions: changes.iter().map(|c| c.additions).sum(),
            deletions: changes.iter().map(|c| c.deletions).sum(),
            files: changes,
            reasoning: proposal.reasoning,
            risk: Some(risk.clone()),
            approved: false,
            approved_by: None,
            approved_at: None,
            applied: false,
            applied_at: None,
            created_at: Utc::now(),
        };
        let patch_id = patch.id.clone();
        let proposed = json!({
            "patch_id": patch.id,
            "summary": patch.summary,
            "files": patch.files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            "additions": patch.additions,
            "deletions": patch.deletions,
            "risk": risk.score,
            "warnings": report.warnings,
        });
        with_retry(&self.config.retry, "insert_patch", || {
            self.store.insert_patch(patch.clone())
        })
        .phase(RunPhase::Store)?;

        let mut patch_ids = run.patch_ids.clone();
        patch_ids.push(patch_id.clone());
        self.update(
            run_id,
            RunUpdate {
                patch_ids: Some(patch_ids.clone()),
                risk: Some(risk.clone()),
                ..RunUpdate::default()
            },
        )?;
        self.sink()
            .emit(run_id, NewEvent::new(EventType::PatchProposed, proposed))
            .ignore_failure("the patch record is persisted; the event is telemetry");

        self.move_status(run_id, RunStatus::Verifying, RunStatus::AwaitingApproval)?;
        self.sink()
            .emit(
                run_id,
                NewEvent::new(
                    EventType::AwaitingApproval,
                    json!({ "patch_ids": patch_ids, "risk": risk.score }),
                ),
            )
            .ignore_failure("status is persisted; the event is telemetry");
        info!(run_id, patch_id = %patch_id, score = ?risk.score, "awaiting approval");
        Ok(RunStatus::AwaitingApproval)
    }

    /// Owned run after a decision: reject, or approve and apply.
    #[instrument(skip_all, fields(run_id = %run.id, status = %run.status))]
    fn run_approval(&self, run: Run) -> Result<RunStatus> {
        let run_id = run.id.as_str();
        match run.status {
            RunStatus::AwaitingApproval => {}
            RunStatus::Approved => return self.apply_approved(&run),
            RunStatus::Cancelled => return Err(RunCancelled.into()),
            other => return Ok(other),
        }

        match run.approval.decision {
            ApprovalDecision::Pending => Ok(RunStatus::AwaitingApproval),
            ApprovalDecision::Rejected => {
                let by = run.approval.decided_by.as_deref().unwrap_or("unknown");
                let reason = run
                    .approval
                    .reason
                    .as_deref()
                    .map(|r| format!(": {r}"))
                    .unwrap_or_default();
                Err(RunFailure::new(
                    RunPhase::Approval,
                    ErrorCategory::Unknown,
                    format!("patch rejected by {by}{reason}"),
                )
                .into())
            }
            ApprovalDecision::Approved => {
                let patches = with_retry(&self.config.retry, "patches_for_run", || {
                    self.store.patches_for_run(run_id)
                })
                .phase(RunPhase::Approval)?;
                let all_approved = !run.patch_ids.is_empty()
                    && run.patch_ids.iter().all(|id| {
                        patches.iter().any(|patch| &patch.id == id && patch.approved)
                    });
                if !all_approved {
                    return Err(RunFailure::new(
                        RunPhase::Approval,
                        ErrorCategory::Unknown,
                        "run is marked approved but not every patch is",
                    )
                    .into());
                }
                self.move_status(run_id, RunStatus::AwaitingApproval, RunStatus::Approved)?;
                self.apply_approved(&run)
            }
        }
    }

    fn apply_approved(&self, run: &Run) -> Result<RunStatus> {
        let run_id = run.id.as_str();
        self.move_status(run_id, RunStatus::Approved, RunStatus::Applying)?;

        let patches = with_retry(&self.config.retry, "patches_for_run", || {
            self.store.patches_for_run(run_id)
        })
        .phase(RunPhase::Apply)?;

        for patch in patches.iter().filter(|patch| !patch.applied) {
            self.checkpoint(run_id)?;
            if !patch.approved {
                return Err(RunFailure::new(
                    RunPhase::Apply,
                    ErrorCategory::Unknown,
                    format!("patch {} is not approved", patch.id),
                )
                .into());
            }
            self.apply_one(run_id, patch)?;
        }

        let patches = with_retry(&self.config.retry, "patches_for_run", || {
            self.store.patches_for_run(run_id)
        })
        .phase(RunPhase::Apply)?;
        let all_applied = run
            .patch_ids
            .iter()
            .all(|id| patches.iter().any(|patch| &patch.id == id && patch.applied));
        if !all_applied {
            return Err(RunFailure::new(
                RunPhase::Apply,
                ErrorCategory::Unknown,
                "not every patch of the run reports applied",
            )
            .into());
        }

        self.move_status(run_id, RunStatus::Applying, RunStatus::Completed)?;
        self.sink()
            .emit(
                run_id,
                NewEvent::new(EventType::RunCompleted, json!({ "patch_ids": run.patch_ids })),
            )
            .ignore_failure("status is persisted; the event is telemetry");
        info!(run_id, "run completed");
        Ok(RunStatus::Completed)
    }

    fn apply_one(&self, run_id: &str, patch: &Patch) -> Result<()> {
        let files = parse_unified_diff(&patch.diff).map_err(|err| {
            RunFailure::new(
                RunPhase::Apply,
                ErrorCategory::Analysis,
                format!("stored diff no longer parses: {err}"),
            )
        })?;
        let report = validate_patch(&files, &self.config.repo_root, &self.config.patch);
        if !report.is_valid() {
            return Err(RunFailure::new(
                RunPhase::Apply,
                report.category().unwrap_or(ErrorCategory::Analysis),
                format!("re-validation failed: {}", report.error_summary()),
            )
            .into());
        }

        let applied = apply_patch(&self.config.repo_root, &files);
        for warning in &applied.warnings {
            self.sink()
                .emit(
                    run_id,
                    NewEvent::new(
                        EventType::ApplyWarning,
                        json!({ "patch_id": patch.id, "warning": warning }),
                    ),
                )
                .ignore_failure("apply warnings are telemetry");
        }
        if !applied.success() {
            self.sink()
                .emit(
                    run_id,
                    NewEvent::new(
                        EventType::ApplyFailed,
                        json!({
                            "patch_id": patch.id,
                            "files_affected": applied.files_affected,
                            "errors": applied.errors,
                        }),
                    ),
                )
                .ignore_failure("the failure record below carries the same files");
            let joined = applied.errors.join("; ");
            let category = match classify_message(&joined) {
                ErrorCategory::Environment => ErrorCategory::Environment,
                _ => ErrorCategory::Analysis,
            };
            let written = if applied.files_affected.is_empty() {
                "none".to_string()
            } else {
                applied.files_affected.join(", ")
            };
            return Err(RunFailure::new(
                RunPhase::Apply,
                category,
                format!(
                    "patch {} did not apply: {joined}; files written: {written}",
                    patch.id
                ),
            )
            .into());
        }

        with_retry(&self.config.retry, "mark_patch_applied", || {
            self.store.mark_patch_applied(&patch.id, Utc::now())
        })
        .phase(RunPhase::Apply)?;
        self.sink()
            .emit(
                run_id,
                NewEvent::new(
                    EventType::PatchApplied,
                    json!({ "patch_id": patch.id, "files_affected": applied.files_affected }),
                ),
            )
            .ignore_failure("the applied flag is persisted; the event is telemetry");
        Ok(())
    }

    /// Read-only context tools. Fails only if every tool call fails.
    fn gather_context(&self, run: &Run) -> Result<String> {
        let run_id = run.id.as_str();
        let tools = RepoTools::new(&self.config.repo_root).map_err(|err| {
            RunFailure::new(
                RunPhase::Context,
                ErrorCategory::Environment,
                format!("context tools unavailable: {err:#}"),
            )
        })?;
        let ctx = &self.config.context;
        let mut calls: Vec<ToolCall> = Vec::new();
        let mut digest = String::new();

        let listed = self.tool_call(
            run_id,
            &mut calls,
            "list_files",
            BTreeMap::from([("pattern".to_string(), json!(ctx.file_pattern))]),
            || {
                let files = tools.list_files(&ctx.file_pattern, ctx.max_listed_files)?;
                Ok((format!("{} files", files.len()), files.join("\n")))
            },
        );
        if let Some(listing) = listed {
            digest.push_str("## Files\n");
            digest.push_str(&listing);
            digest.push('\n');
        }

        let mut hit_paths: Vec<String> = Vec::new();
        for term in task_keywords(&run.task, ctx.max_search_terms) {
            let found = self.tool_call(
                run_id,
                &mut calls,
                "search",
                BTreeMap::from([
                    ("query".to_string(), json!(term)),
                    ("file_pattern".to_string(), json!(ctx.file_pattern)),
                ]),
                || {
                    let hits = tools.search(&term, &ctx.file_pattern, 20)?;
                    for hit in &hits {
                        if !hit_paths.contains(&hit.path) {
                            hit_paths.push(hit.path.clone());
                        }
                    }
                    let lines: Vec<String> = hits
                        .iter()
                        .map(|hit| format!("{}:{}: {}", hit.path, hit.line, hit.snippet))
                        .collect();
                    Ok((format!("{} hits for '{term}'", hits.len()), lines.join("\n")))
                },
            );
            if let Some(found) = found {
                digest.push_str(&format!("## Search: {term}\n{found}\n"));
            }
        }

        for path in hit_paths.iter().take(ctx.max_open_files) {
            let opened = self.tool_call(
                run_id,
                &mut calls,
                "open_file",
                BTreeMap::from([("path".to_string(), json!(path))]),
                || {
                    let file = tools.open_file(path, None)?;
                    let symbols = extract_symbols(&file.raw, SYMBOLS_PER_FILE);
                    let mut summary = format!("{} lines", file.total_lines);
                    if !symbols.is_empty() {
                        summary.push_str(&format!("; symbols: {}", symbols.join(", ")));
                    }
                    Ok((summary, file.content))
                },
            );
            if let Some(content) = opened {
                digest.push_str(&format!("## {path}\n{content}"));
            }
        }

        let plan = format!(
            "Gathered context with {} tool calls; verify with detected commands, request a patch, await approval.",
            calls.len()
        );
        self.update(
            run_id,
            RunUpdate {
                plan: Some(plan),
                tool_calls: Some(calls.clone()),
                ..RunUpdate::default()
            },
        )?;

        if !calls.is_empty() && calls.iter().all(|call| call.status == ToolCallStatus::Failed) {
            let errors: Vec<&str> = calls
                .iter()
                .filter_map(|call| call.result_summary.as_deref())
                .collect();
            return Err(RunFailure::new(
                RunPhase::Context,
                ErrorCategory::Analysis,
                format!("all context tools failed: {}", errors.join("; ")),
            )
            .into());
        }
        self.checkpoint(run_id)?;
        Ok(truncate_chars(&digest, CONTEXT_DIGEST_CHARS))
    }

    /// Run one tool, recording and emitting it. Returns the output on success.
    fn tool_call(
        &self,
        run_id: &str,
        calls: &mut Vec<ToolCall>,
        tool: &str,
        input: BTreeMap<String, Value>,
        f: impl FnOnce() -> Result<(String, String)>,
    ) -> Option<String> {
        let id = format!("{run_id}-tool-{}", calls.len() + 1);
        let in_flight = ToolCall::begin(id, tool, input, Utc::now());
        self.sink()
            .emit(
                run_id,
                NewEvent::new(
                    EventType::ToolCallStarted,
                    json!({
                        "tool_call_id": in_flight.record().id,
                        "tool": tool,
                        "input": in_flight.record().input,
                    }),
                ),
            )
            .ignore_failure("tool progress is telemetry");

        let (sealed, output) = match f() {
            Ok((summary, output)) => (in_flight.complete(&summary, Utc::now()), Some(output)),
            Err(err) => {
                warn!(run_id, tool, err = %format!("{err:#}"), "context tool failed");
                (in_flight.fail(&format!("{err:#}"), Utc::now()), None)
            }
        };
        self.sink()
            .emit(
                run_id,
                NewEvent::new(
                    EventType::ToolCallCompleted,
                    json!({
                        "tool_call_id": sealed.id,
                        "tool": tool,
                        "status": sealed.status,
                        "summary": sealed.result_summary,
                    }),
                ),
            )
            .ignore_failure("tool progress is telemetry");
        calls.push(sealed);
        output
    }

    fn update(&self, run_id: &str, update: RunUpdate) -> Result<()> {
        with_retry(&self.config.retry, "update_run", || {
            self.store.update_run(run_id, &update)
        })
        .phase(RunPhase::Store)?;
        Ok(())
    }

    /// Phase boundary: stop if the run was cancelled meanwhile.
    fn checkpoint(&self, run_id: &str) -> Result<()> {
        let run = with_retry(&self.config.retry, "get_run", || self.store.get_run(run_id))
            .phase(RunPhase::Store)?;
        if run.status == RunStatus::Cancelled {
            return Err(RunCancelled.into());
        }
        Ok(())
    }

    /// Compare-and-set a status, emitting `STATUS_CHANGED` on success.
    fn move_status(&self, run_id: &str, from: RunStatus, to: RunStatus) -> Result<()> {
        let won = with_retry(&self.config.retry, "transition_status", || {
            self.store.transition_status(run_id, from, to)
        })
        .phase(RunPhase::Store)?;
        if !won {
            let current = with_retry(&self.config.retry, "get_run", || self.store.get_run(run_id))
                .phase(RunPhase::Store)?;
            if current.status == RunStatus::Cancelled {
                return Err(RunCancelled.into());
            }
            return Err(RunFailure::new(
                RunPhase::Store,
                ErrorCategory::Unknown,
                format!(
                    "run moved to {} while transitioning {from} -> {to}",
                    current.status
                ),
            )
            .into());
        }
        info!(run_id, from = %from, to = %to, "status changed");
        self.sink()
            .emit(
                run_id,
                NewEvent::new(EventType::StatusChanged, json!({ "from": from, "to": to })),
            )
            .ignore_failure("status is persisted; the event is telemetry");
        Ok(())
    }

    /// Persist a structured failure and move the run to `failed`.
    #[instrument(skip_all, fields(run_id = %run_id))]
    fn fail_run(&self, run_id: &str, err: &anyhow::Error) -> Result<RunStatus> {
        let failure = match err.downcast_ref::<RunFailure>() {
            Some(failure) => failure.clone(),
            None => RunFailure {
                phase: RunPhase::Store,
                category: None,
                message: format!("{err:#}"),
            },
        };
        let category = failure.resolved_category();
        let record = ErrorRecord {
            message: failure.message.clone(),
            phase: failure.phase,
            category,
            recoverable: category.is_recoverable(),
            at: Utc::now(),
        };
        warn!(
            run_id,
            phase = ?record.phase,
            category = category.as_str(),
            message = %record.message,
            "run failed"
        );

        self.update(
            run_id,
            RunUpdate {
                error: Some(record.clone()),
                ..RunUpdate::default()
            },
        )?;

        let current = with_retry(&self.config.retry, "get_run", || self.store.get_run(run_id))?;
        if current.status.is_terminal() {
            debug!(status = %current.status, "run already terminal; not failing");
            return Ok(current.status);
        }
        if !can_transition(current.status, RunStatus::Failed) {
            return Err(anyhow!(
                "run {run_id} cannot fail from {}",
                current.status
            ));
        }
        let won = with_retry(&self.config.retry, "transition_status", || {
            self.store
                .transition_status(run_id, current.status, RunStatus::Failed)
        })?;
        if !won {
            let now = with_retry(&self.config.retry, "get_run", || self.store.get_run(run_id))?;
            debug!(status = %now.status, "lost race while failing run");
            return Ok(now.status);
        }

        let sink = self.sink();
        sink.emit_batch(
            run_id,
            &[
                NewEvent::new(
                    EventType::StatusChanged,
                    json!({ "from": current.status, "to": RunStatus::Failed }),
                ),
                NewEvent::new(
                    EventType::RunFailed,
                    json!({
                        "message": record.message,
                        "phase": record.phase,
                        "category": record.category,
                        "recoverable": record.recoverable,
                    }),
                ),
            ],
        )
        .ignore_failure("the error record is persisted; the event is telemetry");
        Ok(RunStatus::Failed)
    }
}

/// Content-addressed patch id.
pub fn patch_id(run_id: &str, diff: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(diff.as_bytes());
    format!("patch-{}", &hex::encode(hasher.finalize())[..16])
}

/// Distinct search terms from a task description, in order.
fn task_keywords(task: &str, limit: usize) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in task.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if terms.len() >= limit {
            break;
        }
        let word = word.to_lowercase();
        if word.chars().count() < 3 || STOPWORDS.contains(&word.as_str()) {
            continue;
        }
        if !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_admits_one_holder() {
        let slot = RunSlot::default();
        let guard = slot.try_acquire().expect("first");
        assert!(slot.try_acquire().is_none());
        assert!(slot.is_busy());
        drop(guard);
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn patch_id_is_content_hash() {
        let a = patch_id("r1", "diff");
        assert_eq!(a, patch_id("r1", "diff"));
        assert_ne!(a, patch_id("r2", "diff"));
        assert_ne!(a, patch_id("r1", "diff2"));
        assert_eq!(a.len(), "patch-".len() + 16);
    }

    #[test]
    fn keywords_skip_stopwords_and_duplicates() {
        assert_eq!(
            task_keywords("Fix the login bug in Login form", 5),
            vec!["login", "bug", "form"]
        );
        assert_eq!(task_keywords("rename rename_me and more", 1), vec!["rename"]);
        assert!(task_keywords("rename it", 0).is_empty());
    }

    #[test]
    fn phase_tagging_keeps_existing_failures() {
        let tagged: Result<()> = Err::<(), _>(anyhow!(RunFailure::new(
            RunPhase::Validation,
            ErrorCategory::Environment,
            "x"
        )))
        .phase(RunPhase::Store);
        let err = tagged.unwrap_err();
        let failure = err.downcast_ref::<RunFailure>().expect("failure");
        assert_eq!(failure.phase, RunPhase::Validation);

        let untagged: Result<()> =
            Err::<(), _>(StoreError::Unavailable("down".to_string())).phase(RunPhase::Context);
        let err = untagged.unwrap_err();
        let failure = err.downcast_ref::<RunFailure>().expect("failure");
        assert_eq!(failure.phase, RunPhase::Store);
        assert_eq!(failure.category, None);
    }

    #[test]
    fn unresolved_category_uses_classifier() {
        let failure = RunFailure {
            phase: RunPhase::Apply,
            category: None,
            message: "write a.ts: Permission denied".to_string(),
        };
        assert_eq!(failure.resolved_category(), ErrorCategory::Environment);
    }
}
