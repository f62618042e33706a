//! In-process store backed by mutex-guarded maps.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::core::types::{
    ApprovalDecision, ApprovalRecord, NewEvent, Patch, Run, RunEvent, RunStatus, RunUpdate,
};
use crate::io::store::{
    ClaimTarget, Store, StoreError, StoreResult, approve_for, claim_in_place, decision_open,
    sequence_events, sort_oldest_first, transition_in_place,
};

#[derive(Debug, Default)]
struct State {
    runs: BTreeMap<String, Run>,
    patches: BTreeMap<String, Patch>,
    events: BTreeMap<String, Vec<RunEvent>>,
}

/// A store that lives for the life of the process.
///
/// One mutex guards every map, so each trait operation is atomic with respect
/// to all others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn insert_run(&self, run: Run) -> StoreResult<()> {
        let mut state = self.state()?;
        if state.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        state.runs.insert(run.id.clone(), run);
        Ok(())
    }

    fn get_run(&self, id: &str) -> StoreResult<Run> {
        self.state()?
            .runs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::run_not_found(id))
    }

    fn runs_with_status(&self, status: RunStatus) -> StoreResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .state()?
            .runs
            .values()
            .filter(|run| run.status == status)
            .cloned()
            .collect();
        sort_oldest_first(&mut runs);
        Ok(runs)
    }

    fn update_run(&self, id: &str, update: &RunUpdate) -> StoreResult<Run> {
        let mut state = self.state()?;
        let run = state
            .runs
            .get_mut(id)
            .ok_or_else(|| StoreError::run_not_found(id))?;
        update.apply_to(run, Utc::now());
        Ok(run.clone())
    }

    fn transition_status(&self, id: &str, from: RunStatus, to: RunStatus) -> StoreResult<bool> {
        let mut state = self.state()?;
        let run = state
            .runs
            .get_mut(id)
            .ok_or_else(|| StoreError::run_not_found(id))?;
        transition_in_place(run, from, to, Utc::now())
    }

    fn claim(
        &self,
        target: &ClaimTarget,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Run>> {
        let mut state = self.state()?;
        let id = match target {
            ClaimTarget::Run(id) => {
                if !state.runs.contains_key(id) {
                    return Err(StoreError::run_not_found(id));
                }
                id.clone()
            }
            ClaimTarget::OldestQueued => {
                let mut queued: Vec<Run> = state
                    .runs
                    .values()
                    .filter(|run| run.status == RunStatus::Queued)
                    .cloned()
                    .collect();
                sort_oldest_first(&mut queued);
                match queued.into_iter().next() {
                    Some(run) => run.id,
                    None => return Ok(None),
                }
            }
        };
        let Some(run) = state.runs.get_mut(&id) else {
            return Err(StoreError::run_not_found(&id));
        };
        Ok(claim_in_place(run, worker_id, now).then(|| run.clone()))
    }

    fn append_events(&self, run_id: &str, events: &[NewEvent]) -> StoreResult<Vec<RunEvent>> {
        let mut state = self.state()?;
        if !state.runs.contains_key(run_id) {
            return Err(StoreError::run_not_found(run_id));
        }
        let log = state.events.entry(run_id.to_string()).or_default();
        let last_seq = log.last().map_or(0, |event| event.seq);
        let sequenced = sequence_events(run_id, last_seq, events, Utc::now());
        log.extend(sequenced.iter().cloned());
        Ok(sequenced)
    }

    fn events(&self, run_id: &str) -> StoreResult<Vec<RunEvent>> {
        let state = self.state()?;
        if !state.runs.contains_key(run_id) {
            return Err(StoreError::run_not_found(run_id));
        }
        Ok(state.events.get(run_id).cloned().unwrap_or_default())
    }

    fn insert_patch(&self, patch: Patch) -> StoreResult<()> {
        let mut state = self.state()?;
        if !state.runs.contains_key(&patch.run_id) {
            return Err(StoreError::run_not_found(&patch.run_id));
        }
        if state.patches.contains_key(&patch.id) {
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
        state.patches.insert(patch.id.clone(), patch);
        Ok(())
    }

    fn get_patch(&self, id: &str) -> StoreResult<Patch> {
        self.state()?
            .patches
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::patch_not_found(id))
    }

    fn patches_for_run(&self, run_id: &str) -> StoreResult<Vec<Patch>> {
        let mut patches: Vec<Patch> = self
            .state()?
            .patches
            .values()
            .filter(|patch| patch.run_id == run_id)
            .cloned()
            .collect();
        patches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(patches)
    }

    fn approve_patch(&self, id: &str, approver: &str, at: DateTime<Utc>) -> StoreResult<Patch> {
        let mut state = self.state()?;
        let patch = state
            .patches
            .get_mut(id)
            .ok_or_else(|| StoreError::patch_not_found(id))?;
        patch.approve(approver, at);
        Ok(patch.clone())
    }

    fn record_decision(&self, id: &str, approval: &ApprovalRecord) -> StoreResult<Option<Run>> {
        let mut state = self.state()?;
        let now = Utc::now();
        let patch_ids = match state.runs.get(id) {
            None => return Err(StoreError::run_not_found(id)),
            Some(run) if !decision_open(run) => return Ok(None),
            Some(run) => run.patch_ids.clone(),
        };
        if approval.decision == ApprovalDecision::Approved {
            let mut patches = patch_ids
                .iter()
                .map(|patch_id| {
                    state
                        .patches
                        .get(patch_id)
                        .cloned()
                        .ok_or_else(|| StoreError::patch_not_found(patch_id))
                })
                .collect::<StoreResult<Vec<Patch>>>()?;
            approve_for(&mut patches, approval, now);
            for patch in patches {
                state.patches.insert(patch.id.clone(), patch);
            }
        }
        let run = state
            .runs
            .get_mut(id)
            .ok_or_else(|| StoreError::run_not_found(id))?;
        run.approval = approval.clone();
        run.updated_at = now;
        Ok(Some(run.clone()))
    }

    fn mark_patch_applied(&self, id: &str, at: DateTime<Utc>) -> StoreResult<Patch> {
        let mut state = self.state()?;
        let patch = state
            .patches
            .get_mut(id)
            .ok_or_else(|| StoreError::patch_not_found(id))?;
        patch.mark_applied(at)?;
        Ok(patch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EventType;
    use crate::test_support::sample_patch;
    use serde_json::json;

    #[test]
    fn claim_oldest_picks_earliest_queued() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store
            .insert_run(Run::queued("b", "second", t0 + chrono::Duration::seconds(1)))
            .expect("insert");
        store.insert_run(Run::queued("a", "first", t0)).expect("insert");

        let claimed = store
            .claim(&ClaimTarget::OldestQueued, "w1", Utc::now())
            .expect("claim")
            .expect("claimed");
        assert_eq!(claimed.id, "a");
        assert_eq!(claimed.status, RunStatus::Running);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
    }

    #[test]
    fn second_claim_of_same_run_loses() {
        let store = MemoryStore::new();
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        let target = ClaimTarget::Run("r1".to_string());
        assert!(store.claim(&target, "w1", Utc::now()).expect("claim").is_some());
        assert!(store.claim(&target, "w2", Utc::now()).expect("claim").is_none());
        assert_eq!(
            store.get_run("r1").expect("get").claimed_by.as_deref(),
            Some("w1")
        );
    }

    #[test]
    fn claim_missing_run_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .claim(&ClaimTarget::Run("nope".to_string()), "w1", Utc::now())
            .unwrap_err();
        assert_eq!(err, StoreError::run_not_found("nope"));
    }

    #[test]
    fn events_are_sequenced_per_run() {
        let store = MemoryStore::new();
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        store
            .append_events("r1", &[NewEvent::new(EventType::RunStarted, json!({}))])
            .expect("append");
        store
            .append_events(
                "r1",
                &[
                    NewEvent::new(EventType::LogChunk, json!({"chunk": "a"})),
                    NewEvent::new(EventType::LogChunk, json!({"chunk": "b"})),
                ],
            )
            .expect("append");
        let seqs: Vec<u64> = store
            .events("r1")
            .expect("events")
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn unapproved_patch_cannot_be_marked_applied() {
        let store = MemoryStore::new();
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        store.insert_patch(sample_patch("p1", "r1")).expect("insert patch");

        let err = store.mark_patch_applied("p1", Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
        assert!(!store.get_patch("p1").expect("get").applied);

        store.approve_patch("p1", "alice", Utc::now()).expect("approve");
        let patch = store.mark_patch_applied("p1", Utc::now()).expect("applied");
        assert!(patch.applied && patch.approved);
    }
}
