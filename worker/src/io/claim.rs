//! Run claiming.
//!
//! The only correctness requirement is that at most one worker observes a
//! successful claim for a given run. That is delegated entirely to the
//! store's conditional update; this module adds retries and the
//! `RUN_STARTED` event.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::core::types::{EventType, NewEvent, Run};
use crate::io::store::{ClaimTarget, Store, StoreError, StoreResult};
use crate::io::transport::{EventSink, RetryPolicy, with_retry};

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Box<Run>),
    /// The run exists but another worker holds it, or nothing is queued.
    NotClaimed,
    /// The targeted run id does not exist.
    NotFound,
}

pub struct ClaimCoordinator<'a, S: Store + ?Sized> {
    store: &'a S,
    worker_id: &'a str,
    policy: RetryPolicy,
}

impl<'a, S: Store + ?Sized> ClaimCoordinator<'a, S> {
    pub fn new(store: &'a S, worker_id: &'a str, policy: RetryPolicy) -> Self {
        Self {
            store,
            worker_id,
            policy,
        }
    }

    pub fn claim_run(&self, run_id: &str, now: DateTime<Utc>) -> StoreResult<ClaimOutcome> {
        self.claim(&ClaimTarget::Run(run_id.to_string()), now)
    }

    pub fn claim_next(&self, now: DateTime<Utc>) -> StoreResult<ClaimOutcome> {
        self.claim(&ClaimTarget::OldestQueued, now)
    }

    /// Claim `target`. Transient store errors are retried and then returned.
    #[instrument(skip_all, fields(worker_id = %self.worker_id))]
    pub fn claim(&self, target: &ClaimTarget, now: DateTime<Utc>) -> StoreResult<ClaimOutcome> {
        let claimed = match with_retry(&self.policy, "claim", || {
            self.store.claim(target, self.worker_id, now)
        }) {
            Ok(claimed) => claimed,
            Err(StoreError::NotFound { .. }) => return Ok(ClaimOutcome::NotFound),
            Err(err) => return Err(err),
        };

        let Some(run) = claimed else {
            debug!(?target, "nothing claimed");
            return Ok(ClaimOutcome::NotClaimed);
        };

        info!(run_id = %run.id, "claimed run");
        EventSink::new(self.store, self.policy)
            .emit(
                &run.id,
                NewEvent::new(
                    EventType::RunStarted,
                    json!({ "worker_id": self.worker_id, "claimed_at": now }),
                ),
            )
            .ignore_failure("RUN_STARTED is telemetry; the claim itself is persisted");
        Ok(ClaimOutcome::Claimed(Box::new(run)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunStatus;
    use crate::io::memory_store::MemoryStore;
    use crate::test_support::FlakyStore;

    #[test]
    fn claim_emits_run_started_with_identity() {
        let store = MemoryStore::new();
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        let outcome = ClaimCoordinator::new(&store, "w1", RetryPolicy::immediate(3))
            .claim_run("r1", Utc::now())
            .expect("claim");
        let ClaimOutcome::Claimed(run) = outcome else {
            panic!("expected claim, got {outcome:?}");
        };
        assert_eq!(run.status, RunStatus::Running);

        let events = store.events("r1").expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[0].payload["worker_id"], "w1");
        assert!(events[0].payload["claimed_at"].is_string());
    }

    #[test]
    fn claim_of_missing_run_is_not_found() {
        let store = MemoryStore::new();
        let outcome = ClaimCoordinator::new(&store, "w1", RetryPolicy::immediate(3))
            .claim_run("ghost", Utc::now())
            .expect("claim");
        assert_eq!(outcome, ClaimOutcome::NotFound);
    }

    #[test]
    fn claim_of_running_run_is_not_claimed() {
        let store = MemoryStore::new();
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        let coordinator = ClaimCoordinator::new(&store, "w1", RetryPolicy::immediate(3));
        assert!(matches!(
            coordinator.claim_run("r1", Utc::now()).expect("claim"),
            ClaimOutcome::Claimed(_)
        ));
        assert_eq!(
            coordinator.claim_run("r1", Utc::now()).expect("claim"),
            ClaimOutcome::NotClaimed
        );
        assert_eq!(store.events("r1").expect("events").len(), 1);
    }

    #[test]
    fn empty_queue_is_not_claimed() {
        let store = MemoryStore::new();
        let outcome = ClaimCoordinator::new(&store, "w1", RetryPolicy::immediate(3))
            .claim_next(Utc::now())
            .expect("claim");
        assert_eq!(outcome, ClaimOutcome::NotClaimed);
    }

    #[test]
    fn transient_failures_are_retried() {
        let store = FlakyStore::new(MemoryStore::new());
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        store.fail_next_claims(2);
        let outcome = ClaimCoordinator::new(&store, "w1", RetryPolicy::immediate(3))
            .claim_next(Utc::now())
            .expect("claim");
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn persistent_unavailability_propagates() {
        let store = FlakyStore::new(MemoryStore::new());
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        store.fail_next_claims(5);
        let err = ClaimCoordinator::new(&store, "w1", RetryPolicy::immediate(3))
            .claim_next(Utc::now())
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.get_run("r1").expect("get").status, RunStatus::Queued);
    }
}
