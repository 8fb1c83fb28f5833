//! Breaker-guarded probes.

use std::sync::Arc;
use std::time::Duration;

use rollguard_breaker::CircuitBreaker;
use rollguard_core::FallbackStatus;
use tracing::debug;

use crate::probe::{Probe, ProbeFuture, ProbeOutcome, ProbeSpec, ProbeStatus};

/// Message reported while the guarding circuit is open.
pub const CIRCUIT_OPEN_MESSAGE: &str = "dependency unavailable: circuit open";

/// Wraps a probe with a [`CircuitBreaker`].
///
/// While the circuit is open the inner probe is not called and the
/// configured fallback status is reported instead. Every admitted call
/// records exactly one success or failure; `unhealthy` is the only
/// outcome counted as a failure.
pub struct GuardedProbe {
    inner: Arc<dyn Probe>,
    breaker: CircuitBreaker,
    fallback: ProbeStatus,
}

impl GuardedProbe {
    pub fn new(inner: Arc<dyn Probe>, breaker: CircuitBreaker, fallback: FallbackStatus) -> Self {
        let fallback = match fallback {
            FallbackStatus::Degraded => ProbeStatus::Degraded,
            FallbackStatus::Unhealthy => ProbeStatus::Unhealthy,
            FallbackStatus::Disabled => ProbeStatus::Disabled,
        };
        Self {
            inner,
            breaker,
            fallback,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

/// Records a failure if the call is dropped before it settles, e.g. when
/// the aggregator's timeout cancels it.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl PendingCall<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(circuit = %self.breaker.key(), "guarded call abandoned");
            self.breaker.record_failure();
        }
    }
}

impl Probe for GuardedProbe {
    fn spec(&self) -> &ProbeSpec {
        self.inner.spec()
    }

    fn check(&self, timeout: Duration) -> ProbeFuture<'_> {
        Box::pin(async move {
            if !self.breaker.allow() {
                debug!(probe = %self.spec().name, circuit = %self.breaker.key(), "circuit open, skipping probe");
                return ProbeOutcome::new(self.fallback, CIRCUIT_OPEN_MESSAGE);
            }
            let pending = PendingCall {
                breaker: &self.breaker,
                settled: false,
            };
            let outcome = self.inner.check(timeout).await;
            pending.settle(outcome.status != ProbeStatus::Unhealthy);
            outcome
        })
    }
}
