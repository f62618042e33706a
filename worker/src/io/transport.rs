//! Retry and best-effort wrappers around store calls.
//!
//! Authoritative writes (status, patches) go through [`with_retry`] and
//! propagate their final error. Telemetry writes (events) are wrapped in
//! [`BestEffort`], which forces each call site to say why a failure may be
//! ignored.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::types::{NewEvent, RunEvent};
use crate::io::config::RetryConfig;
use crate::io::store::{Store, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Run `op`, retrying transient store errors with linear backoff.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                debug!(label, attempt, err = %err, delay_ms = delay.as_millis() as u64, "retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Result of a telemetry write whose failure must not abort the caller.
#[must_use = "telemetry failures must be explicitly ignored with ignore_failure"]
#[derive(Debug)]
pub struct BestEffort<T> {
    result: StoreResult<T>,
}

impl<T> BestEffort<T> {
    pub fn new(result: StoreResult<T>) -> Self {
        Self { result }
    }

    /// Log a failure at `warn` with `reason` and discard it.
    pub fn ignore_failure(self, reason: &str) -> Option<T> {
        match self.result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(err = %err, reason, "best-effort write failed");
                None
            }
        }
    }

    pub fn into_result(self) -> StoreResult<T> {
        self.result
    }
}

/// Emits run events through the retry wrapper.
pub struct EventSink<'a, S: Store + ?Sized> {
    store: &'a S,
    policy: RetryPolicy,
}

impl<'a, S: Store + ?Sized> EventSink<'a, S> {
    pub fn new(store: &'a S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn emit(&self, run_id: &str, event: NewEvent) -> BestEffort<RunEvent> {
        let result = self.emit_batch(run_id, std::slice::from_ref(&event)).result;
        BestEffort::new(result.and_then(|mut events| {
            events
                .pop()
                .ok_or_else(|| StoreError::Invariant("store returned no event".to_string()))
        }))
    }

    pub fn emit_batch(&self, run_id: &str, events: &[NewEvent]) -> BestEffort<Vec<RunEvent>> {
        if events.is_empty() {
            return BestEffort::new(Ok(Vec::new()));
        }
        BestEffort::new(with_retry(&self.policy, "append_events", || {
            self.store.append_events(run_id, events)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retries_transient_until_success() {
        let calls = Cell::new(0);
        let result = with_retry(&RetryPolicy::immediate(3), "op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::Unavailable("blip".to_string()))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn gives_up_after_max_attempts_with_last_error() {
        let calls = Cell::new(0);
        let result: StoreResult<()> = with_retry(&RetryPolicy::immediate(3), "op", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Unavailable(format!("attempt {}", calls.get())))
        });
        assert_eq!(result, Err(StoreError::Unavailable("attempt 3".to_string())));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: StoreResult<()> = with_retry(&RetryPolicy::immediate(3), "op", || {
            calls.set(calls.get() + 1);
            Err(StoreError::run_not_found("r1"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn delay_grows_linearly() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
    }

    #[test]
    fn ignore_failure_yields_none() {
        let failed: BestEffort<()> =
            BestEffort::new(Err(StoreError::Unavailable("down".to_string())));
        assert_eq!(failed.ignore_failure("telemetry only"), None);
        assert_eq!(BestEffort::new(Ok(5)).ignore_failure("unused"), Some(5));
    }
}
