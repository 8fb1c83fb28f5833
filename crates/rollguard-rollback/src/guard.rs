//! DeploymentGuard: evaluate a fresh deployment and roll it back when it
//! stays unhealthy.

use std::sync::Arc;

use rollguard_core::GuardConfig;
use rollguard_health::{HealthAggregator, HealthReport, HealthTracker, ProbeSet};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RollbackError;
use crate::orchestrator::{RollbackOrchestrator, cancelled};
use crate::request::{RollbackRequest, RollbackResult};

#[derive(Debug)]
pub enum GuardOutcome {
    /// Every check passed, or failures never reached the threshold.
    Stable(HealthReport),
    RolledBack(RollbackResult),
    /// Stopped before reaching a verdict.
    Cancelled,
}

pub struct DeploymentGuard {
    aggregator: HealthAggregator,
    deployment: ProbeSet,
    orchestrator: Arc<RollbackOrchestrator>,
    config: GuardConfig,
}

impl DeploymentGuard {
    pub fn new(deployment: ProbeSet, orchestrator: Arc<RollbackOrchestrator>, config: GuardConfig) -> Self {
        Self {
            aggregator: HealthAggregator::new(),
            deployment,
            orchestrator,
            config,
        }
    }

    /// Evaluate `app_id` up to `guard.checks` times; once
    /// `unhealthy_threshold` consecutive evaluations come back unhealthy,
    /// issue an automatic rollback whose reason is the last report's summary.
    pub async fn watch(
        &self,
        app_id: &str,
        initiated_by: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<GuardOutcome, RollbackError> {
        let mut tracker = HealthTracker::new(&self.config);
        let checks = self.config.checks().max(1);
        let mut attempt = 1;

        loop {
            if *cancel.borrow() {
                return Ok(GuardOutcome::Cancelled);
            }

            let report = self.aggregator.evaluate(&self.deployment).await;
            tracker.record(&report);
            debug!(%app_id, attempt, checks, status = %report.overall_status, "guard check");

            if tracker.needs_rollback() {
                info!(%app_id, summary = %report.summary(), "deployment unhealthy, rolling back");
                let request = RollbackRequest::automatic(app_id, &report.summary()).with_initiator(initiated_by);
                let result = self.orchestrator.rollback(request, cancel).await?;
                return Ok(GuardOutcome::RolledBack(result));
            }

            if attempt >= checks {
                info!(%app_id, status = %report.overall_status, "deployment stable");
                return Ok(GuardOutcome::Stable(report));
            }
            attempt += 1;

            tokio::select! {
                _ = tokio::time::sleep(tracker.next_interval()) => {}
                _ = cancelled(&mut cancel) => {
                    warn!(%app_id, "guard cancelled");
                    return Ok(GuardOutcome::Cancelled);
                }
            }
        }
    }
}
