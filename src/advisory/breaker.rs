//! Consecutive-failure circuit breaker around any [`AdvisoryService`].
//!
//! Closed: calls pass through; each failure increments a counter and a
//! success resets it. When the counter reaches the threshold the circuit
//! opens and every call fails with [`AdvisoryError::CircuitOpen`] until the
//! cooldown has elapsed. The first call after the cooldown is a trial and the
//! only call admitted while it is in flight: success closes the circuit,
//! failure re-opens it for another cooldown. A trial that never reports back
//! (its future was dropped) expires after one cooldown.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::{AdvisoryError, AdvisoryRequest, AdvisoryService};

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

pub struct CircuitBreaker<S> {
    inner: S,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl<S: AdvisoryService> CircuitBreaker<S> {
    pub fn new(inner: S, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// True while calls are being rejected without reaching the inner service.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        matches!(state.opened_at, Some(at) if at.elapsed() < self.cooldown)
    }

    fn admit(&self) -> Result<(), AdvisoryError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match (state.opened_at, state.trial_started) {
            (None, _) => Ok(()),
            (Some(at), _) if at.elapsed() < self.cooldown => Err(AdvisoryError::CircuitOpen),
            (Some(_), Some(trial)) if trial.elapsed() < self.cooldown => Err(AdvisoryError::CircuitOpen),
            (Some(_), _) => {
                state.trial_started = Some(Instant::now());
                info!(target: "optimizer::advisory", "advisory circuit half-open, sending trial call");
                Ok(())
            }
        }
    }

    fn record(&self, outcome: &Result<String, AdvisoryError>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match outcome {
            Ok(_) => {
                if state.opened_at.is_some() {
                    info!(target: "optimizer::advisory", "advisory circuit closed");
                }
                *state = BreakerState::default();
            }
            Err(e) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.failure_threshold {
                    state.opened_at = Some(Instant::now());
                    state.trial_started = None;
                    error!(
                        target: "optimizer::advisory",
                        error = %e,
                        consecutive_failures = state.consecutive_failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "advisory circuit opened"
                    );
                } else {
                    warn!(
                        target: "optimizer::advisory",
                        error = %e,
                        consecutive_failures = state.consecutive_failures,
                        "advisory call failed"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl<S: AdvisoryService> AdvisoryService for CircuitBreaker<S> {
    async fn complete(&self, request: AdvisoryRequest) -> Result<String, AdvisoryError> {
        self.admit()?;
        let outcome = self.inner.complete(request).await;
        self.record(&outcome);
        outcome
    }
}
