//! Directory-backed store shared by worker processes on one host.
//!
//! Layout:
//! ```text
//! <dir>/runs/<run_id>.json
//! <dir>/patches/<patch_id>.json
//! <dir>/events/<run_id>.jsonl
//! <dir>/store.lock
//! ```
//!
//! Record files are replaced with temp file + rename. Every mutation runs
//! while holding an exclusive advisory lock on `store.lock`, so conditional
//! updates stay atomic across processes. The OS drops the lock when its
//! holder exits, so a crashed worker never leaves the store locked.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::core::types::{
    ApprovalDecision, ApprovalRecord, NewEvent, Patch, Run, RunEvent, RunStatus, RunUpdate,
};
use crate::io::store::{
    ClaimTarget, Store, StoreError, StoreResult, approve_for, claim_in_place, decision_open,
    sequence_events, sort_oldest_first, transition_in_place,
};

const LOCK_FILE: &str = "store.lock";
const LOCK_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`. Mutations wait at
    /// most `lock_timeout` for the store lock before reporting `Unavailable`.
    pub fn open(dir: &Path, lock_timeout: Duration) -> StoreResult<Self> {
        for sub in ["runs", "patches", "events"] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|err| io_error("create", &path, &err))?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            lock_timeout,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_path(&self, id: &str) -> StoreResult<PathBuf> {
        Ok(self.dir.join("runs").join(format!("{}.json", checked_id(id)?)))
    }

    fn patch_path(&self, id: &str) -> StoreResult<PathBuf> {
        Ok(self
            .dir
            .join("patches")
            .join(format!("{}.json", checked_id(id)?)))
    }

    fn events_path(&self, run_id: &str) -> StoreResult<PathBuf> {
        Ok(self
            .dir
            .join("events")
            .join(format!("{}.jsonl", checked_id(run_id)?)))
    }

    #[instrument(skip_all)]
    fn lock(&self) -> StoreResult<LockGuard> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| io_error("open lock", &path, &err))?;
        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    record_holder(&file, &path);
                    return Ok(LockGuard { file, path });
                }
                Err(err) if is_contended(&err) => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(StoreError::Unavailable(format!(
                            "timed out waiting for {}",
                            path.display()
                        )));
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(err) => return Err(io_error("lock", &path, &err)),
            }
        }
    }

    fn load_run(&self, id: &str) -> StoreResult<Run> {
        read_record(&self.run_path(id)?)?.ok_or_else(|| StoreError::run_not_found(id))
    }

    fn load_patch(&self, id: &str) -> StoreResult<Patch> {
        read_record(&self.patch_path(id)?)?.ok_or_else(|| StoreError::patch_not_found(id))
    }

    fn all_runs(&self) -> StoreResult<Vec<Run>> {
        list_records(&self.dir.join("runs"))
    }
}

impl Store for FileStore {
    fn insert_run(&self, run: Run) -> StoreResult<()> {
        let _lock = self.lock()?;
        let path = self.run_path(&run.id)?;
        if path.exists() {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        write_record(&path, &run)
    }

    fn get_run(&self, id: &str) -> StoreResult<Run> {
        self.load_run(id)
    }

    fn runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .all_runs()?
            .into_iter()
            .filter(|run| run.status == status)
            .collect();
        sort_oldest_first(&mut runs);
        Ok(runs)
    }

    fn update_run(&self, id: &str, update: &RunUpdate) -> StoreResult<Run> {
        let _lock = self.lock()?;
        let mut run = self.load_run(id)?;
        update.apply_to(&mut run, Utc::now());
        write_record(&self.run_path(id)?, &run)?;
        Ok(run)
    }

    #[instrument(skip_all, fields(run_id = %id, from = %from, to = %to))]
    fn transition_status(&self, id: &str, from: RunStatus, to: RunStatus) -> StoreResult<bool> {
        let _lock = self.lock()?;
        let mut run = self.load_run(id)?;
        if !transition_in_place(&mut run, from, to, Utc::now())? {
            debug!(current = %run.status, "transition lost");
            return Ok(false);
        }
        write_record(&self.run_path(id)?, &run)?;
        Ok(true)
    }

    #[instrument(skip_all, fields(worker_id = %worker_id))]
    fn claim(
        &self,
        target: &ClaimTarget,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>> {
        let _lock = self.lock()?;
        let mut run = match target {
            ClaimTarget::Run(id) => self.load_run(id)?,
            ClaimTarget::OldestQueued => {
                let mut queued: Vec<Run> = self
                    .all_runs()?
                    .into_iter()
                    .filter(|run| run.status == RunStatus::Queued)
                    .collect();
                sort_oldest_first(&mut queued);
                match queued.into_iter().next() {
                    Some(run) => run,
                    None => return Ok(None),
                }
            }
        };
        if !claim_in_place(&mut run, worker_id, now) {
            return Ok(None);
        }
        write_record(&self.run_path(&run.id)?, &run)?;
        Ok(Some(run))
    }

    fn append_events(&self, run_id: &str, events: &[NewEvent]) -> StoreResult<Vec<RunEvent>> {
        let _lock = self.lock()?;
        if !self.run_path(run_id)?.exists() {
            return Err(StoreError::run_not_found(run_id));
        }
        let path = self.events_path(run_id)?;
        let last_seq = read_events(&path)?.last().map_or(0, |event| event.seq);
        let sequenced = sequence_events(run_id, last_seq, events, Utc::now());

        let mut buf = Vec::new();
        for event in &sequenced {
            serde_json::to_writer(&mut buf, event)
                .map_err(|err| StoreError::Corrupt(format!("encode event: {err}")))?;
            buf.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| io_error("open", &path, &err))?;
        file.write_all(&buf)
            .and_then(|()| file.sync_data())
            .map_err(|err| io_error("append", &path, &err))?;
        Ok(sequenced)
    }

    fn events(&self, run_id: &str) -> StoreResult<Vec<RunEvent>> {
        if !self.run_path(run_id)?.exists() {
            return Err(StoreError::run_not_found(run_id));
        }
        read_events(&self.events_path(run_id)?)
    }

    fn insert_patch(&self, patch: Patch) -> StoreResult<()> {
        let _lock = self.lock()?;
        if !self.run_path(&patch.run_id)?.exists() {
            return Err(StoreError::run_not_found(&patch.run_id));
        }
        let path = self.patch_path(&patch.id)?;
        if path.exists() {
            return Err(StoreError::Conflict(format!(
                "patch {} already exists",
                patch.id
            )));
        }
        if patch.applied && !patch.approved {
            return Err(StoreError::Invariant(format!(
                "patch {} is applied but not approved",
                patch.id
            )));
        }
        write_record(&path, &patch)
    }

    fn get_patch(&self, id: &str) -> StoreResult<Patch> {
        self.load_patch(id)
    }

    fn patches_for_run(&self, run_id: &str) -> StoreResult<Vec<Patch>> {
        let mut patches: Vec<Patch> = list_records::<Patch>(&self.dir.join("patches"))?
            .into_iter()
            .filter(|patch| patch.run_id == run_id)
            .collect();
        patches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(patches)
    }

    fn approve_patch(&self, id: &str, approver: &str, at: DateTime<Utc>) -> StoreResult<Patch> {
        let _lock = self.lock()?;
        let mut patch = self.load_patch(id)?;
        patch.approve(approver, at);
        write_record(&self.patch_path(id)?, &patch)?;
        Ok(patch)
    }

    #[instrument(skip_all, fields(run_id = %id))]
    fn record_decision(&self, id: &str, approval: &ApprovalRecord) -> StoreResult<Option<Run>> {
        let _lock = self.lock()?;
        let mut run = self.load_run(id)?;
        if !decision_open(&run) {
            debug!(status = %run.status, "decision already closed");
            return Ok(None);
        }
        let now = Utc::now();
        if approval.decision == ApprovalDecision::Approved {
            let mut patches = run
                .patch_ids
                .iter()
                .map(|patch_id| self.load_patch(patch_id))
                .collect::<StoreResult<Vec<Patch>>>()?;
            approve_for(&mut patches, approval, now);
            for patch in &patches {
                write_record(&self.patch_path(&patch.id)?, patch)?;
            }
        }
        run.approval = approval.clone();
        run.updated_at = now;
        write_record(&self.run_path(id)?, &run)?;
        Ok(Some(run))
    }

    fn mark_patch_applied(&self, id: &str, at: DateTime<Utc>) -> StoreResult<Patch> {
        let _lock = self.lock()?;
        let mut patch = self.load_patch(id)?;
        patch.mark_applied(at)?;
        write_record(&self.patch_path(id)?, &patch)?;
        Ok(patch)
    }
}

/// Holds the exclusive lock on `store.lock` until dropped. The file itself
/// stays in place; only the lock is released.
struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(err = %err, path = %self.path.display(), "failed to release store lock");
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Holder pid, for operators inspecting a stuck store.
fn record_holder(file: &File, path: &Path) {
    let mut file = file;
    let written = file
        .set_len(0)
        .and_then(|()| writeln!(file, "{}", std::process::id()));
    if let Err(err) = written {
        debug!(err = %err, path = %path.display(), "could not record lock holder");
    }
}

/// Record ids become file names, so they must be a single plain component.
fn checked_id(id: &str) -> StoreResult<&str> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id)
    } else {
        Err(StoreError::Invariant(format!("invalid record id {id:?}")))
    }
}

fn io_error(action: &str, path: &Path, err: &std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{action} {}: {err}", path.display()))
}

fn read_record<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error("read", path, &err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| StoreError::Corrupt(format!("{}: {err}", path.display())))
}

fn write_record<T: Serialize>(path: &Path, record: &T) -> StoreResult<()> {
    let mut buf = serde_json::to_vec_pretty(record)
        .map_err(|err| StoreError::Corrupt(format!("encode {}: {err}", path.display())))?;
    buf.push(b'\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf).map_err(|err| io_error("write", &tmp_path, &err))?;
    fs::rename(&tmp_path, path).map_err(|err| io_error("replace", path, &err))
}

fn list_records<T: DeserializeOwned>(dir: &Path) -> StoreResult<Vec<T>> {
    let entries = fs::read_dir(dir).map_err(|err| io_error("list", dir, &err))?;
    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| io_error("list", dir, &err))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        // A record may be replaced between the listing and the read.
        if let Some(record) = read_record(&path)? {
            records.push(record);
        }
    }
    Ok(records)
}

fn read_events(path: &Path) -> StoreResult<Vec<RunEvent>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error("read", path, &err)),
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|err| {
                StoreError::Corrupt(format!("{} line {}: {err}", path.display(), idx + 1))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EventType;
    use crate::test_support::sample_patch;
    use serde_json::json;

    fn store(dir: &Path) -> FileStore {
        FileStore::open(dir, Duration::from_secs(5)).expect("open store")
    }

    #[test]
    fn runs_survive_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        store(temp.path())
            .insert_run(Run::queued("r1", "task", Utc::now()))
            .expect("insert");
        let reopened = store(temp.path());
        assert_eq!(reopened.get_run("r1").expect("get").task, "task");
        assert_eq!(
            reopened
                .runs_with_status(RunStatus::Queued)
                .expect("list")
                .len(),
            1
        );
    }

    #[test]
    fn claim_then_transition_is_persisted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        let claimed = store
            .claim(&ClaimTarget::OldestQueued, "w1", Utc::now())
            .expect("claim")
            .expect("claimed");
        assert_eq!(claimed.status, RunStatus::Running);
        assert!(
            store
                .claim(&ClaimTarget::Run("r1".to_string()), "w2", Utc::now())
                .expect("claim")
                .is_none()
        );
        assert!(
            store
                .transition_status("r1", RunStatus::Running, RunStatus::Verifying)
                .expect("transition")
        );
        assert_eq!(store.get_run("r1").expect("get").status, RunStatus::Verifying);
    }

    #[test]
    fn events_append_across_calls() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        store
            .append_events("r1", &[NewEvent::new(EventType::RunStarted, json!({"worker_id": "w"}))])
            .expect("append");
        store
            .append_events("r1", &[NewEvent::new(EventType::StatusChanged, json!({}))])
            .expect("append");
        let events = store.events("r1").expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].seq, 2);
        assert_eq!(events[0].payload["worker_id"], "w");
    }

    #[test]
    fn leftover_lock_file_does_not_block() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::write(temp.path().join(LOCK_FILE), "999999\n").expect("write lock");
        store
            .insert_run(Run::queued("r1", "t", Utc::now()))
            .expect("insert with leftover lock file");
    }

    #[test]
    fn held_lock_times_out_as_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let holder = store(temp.path());
        let waiter = FileStore::open(temp.path(), Duration::from_millis(50)).expect("open");
        let guard = holder.lock().expect("lock");
        let err = waiter
            .insert_run(Run::queued("r1", "t", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)), "{err:?}");
        drop(guard);
        waiter
            .insert_run(Run::queued("r1", "t", Utc::now()))
            .expect("insert after release");
    }

    #[test]
    fn rejects_path_like_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = store(temp.path()).get_run("../escape").unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
    }

    #[test]
    fn applied_requires_approved_on_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        store.insert_patch(sample_patch("p1", "r1")).expect("insert patch");
        assert!(matches!(
            store.mark_patch_applied("p1", Utc::now()),
            Err(StoreError::Invariant(_))
        ));
        store.approve_patch("p1", "alice", Utc::now()).expect("approve");
        store.mark_patch_applied("p1", Utc::now()).expect("applied");
        let patches = store.patches_for_run("r1").expect("patches");
        assert!(patches[0].applied && patches[0].approved);
    }

    #[test]
    fn approval_decision_flags_patches_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut run = Run::queued("r1", "t", Utc::now());
        run.status = RunStatus::AwaitingApproval;
        run.patch_ids = vec!["p1".to_string()];
        store.insert_run(run).expect("insert");
        store.insert_patch(sample_patch("p1", "r1")).expect("insert patch");

        let approval = ApprovalRecord {
            decision: ApprovalDecision::Approved,
            decided_by: Some("alice".to_string()),
            decided_at: Some(Utc::now()),
            reason: None,
        };
        let run = store
            .record_decision("r1", &approval)
            .expect("record")
            .expect("decision open");
        assert_eq!(run.approval.decision, ApprovalDecision::Approved);
        let patch = store.get_patch("p1").expect("patch");
        assert_eq!(patch.approved_by.as_deref(), Some("alice"));
        assert!(store.record_decision("r1", &approval).expect("record").is_none());
    }

    #[test]
    fn corrupt_record_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::write(temp.path().join("runs").join("bad.json"), "{not json").expect("write");
        assert!(matches!(store.get_run("bad"), Err(StoreError::Corrupt(_))));
    }
}
