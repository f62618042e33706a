//! Test-only fakes and fixtures: scripted seams, diffs and scratch repos.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

use crate::core::types::{ApprovalRecord, NewEvent, Patch, Run, RunEvent, RunStatus, RunUpdate};
use crate::io::process::{CommandResult, CommandRunner, CommandSpec, StreamSettings};
use crate::io::proposer::{Proposal, ProposalRequest, Proposer};
use crate::io::store::{ClaimTarget, Store, StoreError, StoreResult};

/// An unapproved patch with deterministic fields.
pub fn sample_patch(id: &str, run_id: &str) -> Patch {
    Patch {
        id: id.to_string(),
        run_id: run_id.to_string(),
        summary: format!("{id} summary"),
        diff: "--- a/a.ts\n+++ b/a.ts\n@@ -1 +1 @@\n-a\n+b\n".to_string(),
        files: Vec::new(),
        additions: 1,
        deletions: 1,
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

/// Store wrapper that fails a chosen number of calls with `Unavailable`.
#[derive(Debug)]
pub struct FlakyStore<S> {
    inner: S,
    claim_failures: AtomicU32,
    append_failures: AtomicU32,
}

impl<S: Store> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            claim_failures: AtomicU32::new(0),
            append_failures: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail_next_claims(&self, n: u32) {
        self.claim_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_appends(&self, n: u32) {
        self.append_failures.store(n, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicU32, op: &str) -> StoreResult<()> {
    let previous = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    match previous {
        Ok(_) => Err(StoreError::Unavailable(format!("{op}: injected failure"))),
        Err(_) => Ok(()),
    }
}

impl<S: Store> Store for FlakyStore<S> {
    fn insert_run(&self, run: Run) -> StoreResult<()> {
        self.inner.insert_run(run)
    }

    fn get_run(&self, id: &str) -> StoreResult<Run> {
        self.inner.get_run(id)
    }

    fn runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<Run>> {
        self.inner.runs_with_status(status)
    }

    fn update_run(&self, id: &str, update: &RunUpdate) -> StoreResult<Run> {
        self.inner.update_run(id, update)
    }

    fn transition_status(&self, id: &str, from: RunStatus, to: RunStatus) -> StoreResult<bool> {
        self.inner.transition_status(id, from, to)
    }

    fn claim(
        &self,
        target: &ClaimTarget,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>> {
        take_failure(&self.claim_failures, "claim")?;
        self.inner.claim(target, worker_id, now)
    }

    fn append_events(&self, run_id: &str, events: &[NewEvent]) -> StoreResult<Vec<RunEvent>> {
        take_failure(&self.append_failures, "append_events")?;
        self.inner.append_events(run_id, events)
    }

    fn events(&self, run_id: &str) -> StoreResult<Vec<RunEvent>> {
        self.inner.events(run_id)
    }

    fn insert_patch(&self, patch: Patch) -> StoreResult<()> {
        self.inner.insert_patch(patch)
    }

    fn get_patch(&self, id: &str) -> StoreResult<Patch> {
        self.inner.get_patch(id)
    }

    fn patches_for_run(&self, run_id: &str) -> StoreResult<Vec<Patch>> {
        self.inner.patches_for_run(run_id)
    }

    fn approve_patch(&self, id: &str, approver: &str, at: DateTime<Utc>) -> StoreResult<Patch> {
        self.inner.approve_patch(id, approver, at)
    }

    fn record_decision(&self, id: &str, approval: &ApprovalRecord) -> StoreResult<Option<Run>> {
        self.inner.record_decision(id, approval)
    }

    fn mark_patch_applied(&self, id: &str, at: DateTime<Utc>) -> StoreResult<Patch> {
        self.inner.mark_patch_applied(id, at)
    }
}

/// One scripted command outcome.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub exit_code: i32,
    pub chunks: Vec<String>,
    pub timed_out: bool,
}

impl ScriptedStep {
    pub fn exit(exit_code: i32, chunks: &[&str]) -> Self {
        Self {
            exit_code,
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            timed_out: false,
        }
    }

    pub fn timeout(chunks: &[&str]) -> Self {
        Self {
            timed_out: true,
            ..Self::exit(1, chunks)
        }
    }
}

/// Command runner that replays steps in order and records every spec.
///
/// Running past the end of the script is an error.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    steps: Mutex<VecDeque<ScriptedStep>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run_streaming(
        &self,
        spec: &CommandSpec,
        _settings: &StreamSettings,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<CommandResult> {
        self.calls.lock().expect("calls lock").push(spec.clone());
        let step = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted step left for {}", spec.display()))?;
        let started_at = Utc::now();
        for chunk in &step.chunks {
            on_chunk(chunk);
        }
        Ok(CommandResult {
            exit_code: step.exit_code,
            logs: step
                .chunks
                .iter()
                .flat_map(|chunk| chunk.lines().map(str::to_string).collect::<Vec<_>>())
                .collect(),
            timed_out: step.timed_out,
            truncated_bytes: 0,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Proposer that replays canned results and records each request's task.
#[derive(Debug, Default)]
pub struct ScriptedProposer {
    results: Mutex<VecDeque<std::result::Result<Proposal, String>>>,
    requests: Mutex<Vec<ProposalRequest>>,
}

impl ScriptedProposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next request with `diff`.
    pub fn with_diff(self, summary: &str, diff: &str) -> Self {
        self.results
            .lock()
            .expect("results lock")
            .push_back(Ok(Proposal {
                summary: summary.to_string(),
                diff: diff.to_string(),
                reasoning: String::new(),
            }));
        self
    }

    /// Fail the next request with `message`.
    pub fn with_error(self, message: &str) -> Self {
        self.results
            .lock()
            .expect("results lock")
            .push_back(Err(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<ProposalRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl Proposer for ScriptedProposer {
    fn propose(&self, request: &ProposalRequest) -> Result<Proposal> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        match self.results.lock().expect("results lock").pop_front() {
            Some(Ok(proposal)) => Ok(proposal),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted proposal left")),
        }
    }
}

/// Builds unified diffs in `git diff` layout.
#[derive(Debug, Default, Clone)]
pub struct DiffBuilder {
    text: String,
}

impl DiffBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added_file(mut self, path: &str, lines: &[&str]) -> Self {
        self.text.push_str(&format!(
            "diff --git a/{path} b/{path}\nnew file mode 100644\n--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,{} @@\n",
            lines.len()
        ));
        for line in lines {
            self.text.push_str(&format!("+{line}\n"));
        }
        self
    }

    /// One hunk at old/new line `start`: context, removals, additions, context.
    pub fn modified_file(
        mut self,
        path: &str,
        start: u32,
        before: &[&str],
        removed: &[&str],
        added: &[&str],
        after: &[&str],
    ) -> Self {
        let old_len = before.len() + removed.len() + after.len();
        let new_len = before.len() + added.len() + after.len();
        self.text.push_str(&format!(
            "diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n@@ -{start},{old_len} +{start},{new_len} @@\n"
        ));
        for line in before {
            self.text.push_str(&format!(" {line}\n"));
        }
        for line in removed {
            self.text.push_str(&format!("-{line}\n"));
        }
        for line in added {
            self.text.push_str(&format!("+{line}\n"));
        }
        for line in after {
            self.text.push_str(&format!(" {line}\n"));
        }
        self
    }

    pub fn deleted_file(mut self, path: &str, lines: &[&str]) -> Self {
        self.text.push_str(&format!(
            "diff --git a/{path} b/{path}\ndeleted file mode 100644\n--- a/{path}\n+++ /dev/null\n@@ -1,{} +0,0 @@\n",
            lines.len()
        ));
        for line in lines {
            self.text.push_str(&format!("-{line}\n"));
        }
        self
    }

    pub fn build(self) -> String {
        self.text
    }
}

/// Scratch repository directory removed on drop.
#[derive(Debug)]
pub struct TempRepo {
    dir: tempfile::TempDir,
}

impl TempRepo {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        fs::write(&path, contents).expect("write fixture file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.dir.path().join(relative)).expect("read fixture file")
    }
}

impl Default for TempRepo {
    fn default() -> Self {
        Self::new()
    }
}
