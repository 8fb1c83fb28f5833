//! HealthAggregator: runs a probe set concurrently and merges the results.

use std::sync::Arc;
use std::time::Instant;

use rollguard_core::epoch_millis;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::probe::{Probe, ProbeOutcome, ProbeResult};
use crate::report::HealthReport;
use crate::sets::{ProbeSet, SetMember};

/// Evaluates probe sets. Holds no state between calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthAggregator;

impl HealthAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Run every probe in `set` concurrently and build a fresh report.
    ///
    /// Never fails: timeouts and panics inside a probe become
    /// `unhealthy` results for that probe only.
    pub async fn evaluate(&self, set: &ProbeSet) -> HealthReport {
        let started = Instant::now();
        let members = set.members();

        let mut tasks = JoinSet::new();
        for (index, member) in members.iter().enumerate() {
            let probe = Arc::clone(&member.probe);
            let quorum = member.quorum;
            tasks.spawn(async move { (index, run_probe(probe, quorum).await) });
        }

        let mut slots: Vec<Option<ProbeResult>> = vec![None; members.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!(set = %set.name(), error = %e, "probe task failed"),
            }
        }

        let results = slots
            .into_iter()
            .zip(members)
            .map(|(slot, member)| slot.unwrap_or_else(|| panicked(member)))
            .collect();
        let report = HealthReport::from_results(results, epoch_millis());

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if report.overall_status.is_serving() {
            debug!(set = %set.name(), status = %report.overall_status, elapsed_ms, "health evaluated");
        } else {
            info!(
                set = %set.name(),
                status = %report.overall_status,
                elapsed_ms,
                summary = %report.summary(),
                "health evaluated"
            );
        }
        report
    }
}

async fn run_probe(probe: Arc<dyn Probe>, quorum: bool) -> ProbeResult {
    let spec = probe.spec();
    let measured_at_ms = epoch_millis();
    let started = Instant::now();

    let outcome = match tokio::time::timeout(spec.timeout, probe.check(spec.timeout)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(
                probe = %spec.name,
                timeout_ms = spec.timeout.as_millis() as u64,
                "probe timed out"
            );
            ProbeOutcome::unhealthy("timeout")
        }
    };

    ProbeResult {
        probe_name: spec.name.clone(),
        criticality: spec.criticality,
        quorum,
        status: outcome.status,
        message: outcome.message,
        duration_ms: started.elapsed().as_millis() as u64,
        measured_at_ms,
        certificate: outcome.certificate,
    }
}

fn panicked(member: &SetMember) -> ProbeResult {
    let spec = member.probe.spec();
    let outcome = ProbeOutcome::unhealthy("probe panicked");
    ProbeResult {
        probe_name: spec.name.clone(),
        criticality: spec.criticality,
        quorum: member.quorum,
        status: outcome.status,
        message: outcome.message,
        duration_ms: 0,
        measured_at_ms: epoch_millis(),
        certificate: None,
    }
}
