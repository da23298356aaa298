//! Retry/Backoff Scheduler.
//!
//! Every external call goes through [`RetryScheduler::call`], which bounds
//! it with a timeout, retries transient failures with capped exponential
//! backoff plus jitter, pauses on rate limiting and gives up on confirmed
//! absence. A per-(collection, phase) circuit breaker watches consecutive
//! failures across different items and pauses or halts the collection when
//! the external service itself looks unavailable.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use crate::config::RetryConfig;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use transcriptforge_common::{CollectionName, Error, Phase, Result};

/// How the scheduler treats a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network trouble or timeout: retry with backoff.
    Transient,
    /// The collaborator is throttling us: pause, shrink the batch, retry.
    RateLimited { retry_after: Option<Duration> },
    /// The content does not exist: never retry.
    Permanent,
}

/// Errors the scheduler knows how to classify.
pub trait Classify: fmt::Display {
    fn class(&self) -> ErrorClass;

    /// The error reported when a call exceeds its time budget.
    fn timed_out(after: Duration) -> Self
    where
        Self: Sized;
}

/// Final outcome of one scheduled call.
#[derive(Debug)]
pub enum CallOutcome<T, E> {
    Success(T),
    /// Confirmed absence reported by the collaborator.
    Permanent(E),
    /// Transient failures used up the per-call budget.
    Exhausted(E),
    /// Still rate limited after the allowed number of pauses.
    Throttled(E),
    /// The operator interrupted before the call could finish.
    Cancelled,
}

/// What happened during a call, including the failures absorbed on the way.
#[derive(Debug)]
pub struct CallReport<T, E> {
    pub outcome: CallOutcome<T, E>,
    /// Transient failures, including the final one for `Exhausted`
    pub failed_attempts: u32,
    /// Rate-limit pauses taken
    pub rate_limited: u32,
    /// Failures absorbed by retrying, oldest first
    pub absorbed: Vec<(ErrorClass, String)>,
}

impl<T, E> CallReport<T, E> {
    fn new(
        outcome: CallOutcome<T, E>,
        failed_attempts: u32,
        rate_limited: u32,
        absorbed: Vec<(ErrorClass, String)>,
    ) -> Self {
        Self {
            outcome,
            failed_attempts,
            rate_limited,
            absorbed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CallOutcome::Success(_))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BreakerState {
    consecutive: u32,
    trips: u32,
}

#[derive(Debug)]
struct SessionState {
    batch_size: usize,
    breakers: HashMap<(CollectionName, Phase), BreakerState>,
}

pub struct RetryScheduler {
    policy: RetryConfig,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    jitter: bool,
    state: Mutex<SessionState>,
}

impl RetryScheduler {
    pub fn new(policy: RetryConfig, batch_size: usize, clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            policy,
            clock,
            cancel,
            jitter: true,
            state: Mutex::new(SessionState {
                batch_size: batch_size.max(1),
                breakers: HashMap::new(),
            }),
        }
    }

    /// Disable jitter so delays are exact.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn policy(&self) -> &RetryConfig {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Items per stage pass for the rest of this session.
    pub fn batch_size(&self) -> usize {
        self.state.lock().batch_size
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let max = self.policy.max_delay();
        let delay = self
            .policy
            .base_delay()
            .checked_mul(1u32 << exponent)
            .unwrap_or(max)
            .min(max);

        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_millis() as u64 / 4;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    /// Run `operation` under the retry policy.
    pub async fn call<T, E, F, Fut>(&self, label: &str, mut operation: F) -> CallReport<T, E>
    where
        E: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let timeout = self.policy.call_timeout();
        let mut failed = 0u32;
        let mut pauses = 0u32;
        let mut absorbed = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                return CallReport::new(CallOutcome::Cancelled, failed, pauses, absorbed);
            }

            let result = if timeout.is_zero() {
                operation().await
            } else {
                match tokio::time::timeout(timeout, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(E::timed_out(timeout)),
                }
            };

            let error = match result {
                Ok(value) => return CallReport::new(CallOutcome::Success(value), failed, pauses, absorbed),
                Err(error) => error,
            };

            match error.class() {
                ErrorClass::Permanent => {
                    return CallReport::new(CallOutcome::Permanent(error), failed, pauses, absorbed);
                }
                ErrorClass::RateLimited { retry_after } => {
                    pauses += 1;
                    if pauses > self.policy.max_attempts {
                        return CallReport::new(CallOutcome::Throttled(error), failed, pauses - 1, absorbed);
                    }
                    absorbed.push((error.class(), error.to_string()));
                    let pause = self.policy.rate_limit_pause().max(retry_after.unwrap_or_default());
                    let batch = self.reduce_batch();
                    tracing::warn!(
                        "{}: rate limited, pausing {:?} (batch size now {})",
                        label,
                        pause,
                        batch
                    );
                    self.clock.sleep(pause).await;
                }
                ErrorClass::Transient => {
                    failed += 1;
                    if failed >= self.policy.max_attempts {
                        tracing::warn!("{}: giving up after {} attempts: {}", label, failed, error);
                        return CallReport::new(CallOutcome::Exhausted(error), failed, pauses, absorbed);
                    }
                    absorbed.push((ErrorClass::Transient, error.to_string()));
                    let delay = self.backoff_delay(failed);
                    tracing::info!(
                        "{}: attempt {} failed ({}), retrying in {:?}",
                        label,
                        failed,
                        error,
                        delay
                    );
                    self.clock.sleep(delay).await;
                }
            }
        }
    }

    fn reduce_batch(&self) -> usize {
        let mut state = self.state.lock();
        state.batch_size = (state.batch_size / 2).max(1);
        state.batch_size
    }

    /// A call for this collection and phase succeeded (or confirmed absence).
    pub fn record_success(&self, collection: &CollectionName, phase: Phase) {
        let mut state = self.state.lock();
        if let Some(breaker) = state.breakers.get_mut(&(collection.clone(), phase)) {
            breaker.consecutive = 0;
        }
    }

    /// A call ended in a terminal failure.
    ///
    /// At the threshold the whole collection pauses; once the session has
    /// tripped more than the allowed number of times the collection is
    /// halted with [`Error::CircuitOpen`].
    pub async fn record_failure(&self, collection: &CollectionName, phase: Phase) -> Result<()> {
        let tripped = {
            let mut state = self.state.lock();
            let breaker = state
                .breakers
                .entry((collection.clone(), phase))
                .or_default();
            breaker.consecutive += 1;
            if breaker.consecutive < self.policy.circuit_breaker_threshold {
                None
            } else {
                let failures = breaker.consecutive;
                breaker.consecutive = 0;
                breaker.trips += 1;
                Some((failures, breaker.trips))
            }
        };

        let Some((failures, trips)) = tripped else {
            return Ok(());
        };

        if trips > self.policy.circuit_breaker_max_trips {
            tracing::error!(
                collection = %collection,
                phase = %phase,
                "Circuit open after {} consecutive failures; halting collection",
                failures
            );
            return Err(Error::CircuitOpen {
                collection: collection.to_string(),
                phase: phase.to_string(),
                failures,
            });
        }

        let pause = self.policy.circuit_breaker_pause();
        tracing::warn!(
            collection = %collection,
            phase = %phase,
            "{} consecutive failures, pausing collection for {:?} (trip {})",
            failures,
            pause,
            trips
        );
        self.clock.sleep(pause).await;
        Ok(())
    }
}
