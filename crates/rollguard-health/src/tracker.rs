//! Consecutive-evaluation tracking with backoff.
//!
//! `HealthAggregator::evaluate` never retries; callers that poll a
//! deployment feed each report into a [`HealthTracker`] to decide when a
//! run of failures warrants a rollback.

use std::time::Duration;

use rollguard_core::GuardConfig;
use tracing::{debug, warn};

use crate::report::{HealthReport, HealthStatus};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct HealthTracker {
    last_status: Option<HealthStatus>,
    consecutive_unhealthy: u32,
    unhealthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
}

impl HealthTracker {
    pub fn new(config: &GuardConfig) -> Self {
        Self::with_threshold(config.unhealthy_threshold(), config.interval())
    }

    pub fn with_threshold(unhealthy_threshold: u32, interval: Duration) -> Self {
        Self {
            last_status: None,
            consecutive_unhealthy: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
        }
    }

    /// Record one evaluation and return its status.
    pub fn record(&mut self, report: &HealthReport) -> HealthStatus {
        let status = report.overall_status;
        if status.is_serving() {
            if self.consecutive_unhealthy > 0 {
                debug!(after = self.consecutive_unhealthy, %status, "deployment recovered");
            }
            self.consecutive_unhealthy = 0;
            self.current_backoff = self.base_interval;
        } else {
            self.consecutive_unhealthy += 1;
            self.current_backoff = (self.current_backoff * 2).min(MAX_BACKOFF);
            if self.consecutive_unhealthy == self.unhealthy_threshold {
                warn!(
                    failures = self.consecutive_unhealthy,
                    threshold = self.unhealthy_threshold,
                    "deployment unhealthy past threshold"
                );
            }
        }
        self.last_status = Some(status);
        status
    }

    pub fn last_status(&self) -> Option<HealthStatus> {
        self.last_status
    }

    pub fn consecutive_unhealthy(&self) -> u32 {
        self.consecutive_unhealthy
    }

    /// Wait before the next evaluation.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }

    pub fn needs_rollback(&self) -> bool {
        self.consecutive_unhealthy >= self.unhealthy_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: HealthStatus) -> HealthReport {
        HealthReport {
            overall_status: status,
            results: Vec::new(),
            evaluated_at_ms: 0,
        }
    }

    #[test]
    fn threshold_reached_after_consecutive_failures() {
        let mut tracker = HealthTracker::with_threshold(3, Duration::from_secs(1));
        tracker.record(&report(HealthStatus::Unhealthy));
        tracker.record(&report(HealthStatus::Unhealthy));
        assert!(!tracker.needs_rollback());
        tracker.record(&report(HealthStatus::Unhealthy));
        assert!(tracker.needs_rollback());
    }

    #[test]
    fn degraded_resets_the_run() {
        let mut tracker = HealthTracker::with_threshold(2, Duration::from_secs(1));
        tracker.record(&report(HealthStatus::Unhealthy));
        tracker.record(&report(HealthStatus::Degraded));
        tracker.record(&report(HealthStatus::Unhealthy));
        assert!(!tracker.needs_rollback());
        assert_eq!(tracker.consecutive_unhealthy(), 1);
        assert_eq!(tracker.last_status(), Some(HealthStatus::Unhealthy));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut tracker = HealthTracker::with_threshold(100, Duration::from_secs(5));
        tracker.record(&report(HealthStatus::Unhealthy));
        assert_eq!(tracker.next_interval(), Duration::from_secs(10));
        tracker.record(&report(HealthStatus::Unhealthy));
        assert_eq!(tracker.next_interval(), Duration::from_secs(20));
        for _ in 0..5 {
            tracker.record(&report(HealthStatus::Unhealthy));
        }
        assert_eq!(tracker.next_interval(), MAX_BACKOFF);
    }

    #[test]
    fn recovery_resets_backoff() {
        let mut tracker = HealthTracker::with_threshold(2, Duration::from_secs(5));
        tracker.record(&report(HealthStatus::Unhealthy));
        tracker.record(&report(HealthStatus::Healthy));
        assert_eq!(tracker.next_interval(), Duration::from_secs(5));
        assert_eq!(tracker.consecutive_unhealthy(), 0);
    }

    #[test]
    fn config_defaults() {
        let tracker = HealthTracker::new(&GuardConfig::default());
        assert_eq!(tracker.next_interval(), Duration::from_secs(5));
        assert!(tracker.last_status().is_none());
    }
}
