//! HealthReport and the verdict rules.
//!
//! The overall status is a pure function of the probe results:
//!
//! 1. any **critical** probe `unhealthy` → `unhealthy`
//! 2. a quorum group with fewer than ⌈2/3⌉ of its counted members
//!    `healthy` → `unhealthy`
//! 3. any probe `unhealthy`/`degraded`, or any certificate reported
//!    invalid → `degraded`
//! 4. otherwise `healthy`
//!
//! `disabled` and `not_applicable` results are ignored by every rule,
//! including the quorum denominator.

use serde::{Deserialize, Serialize};

use crate::probe::{Criticality, ProbeResult, ProbeStatus};

/// Deployment-level verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded: the deployment is serving.
    pub fn is_serving(self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Outcome of the quorum rule for one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuorumTally {
    pub healthy: usize,
    pub counted: usize,
    pub required: usize,
}

impl QuorumTally {
    pub fn met(&self) -> bool {
        self.healthy >= self.required
    }
}

/// Smallest healthy count satisfying the two-thirds quorum: ⌈2n/3⌉.
pub fn quorum_required(counted: usize) -> usize {
    (2 * counted).div_ceil(3)
}

/// Result of one evaluation. Recomputed on every call, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub results: Vec<ProbeResult>,
    pub evaluated_at_ms: u64,
}

impl HealthReport {
    pub fn from_results(results: Vec<ProbeResult>, evaluated_at_ms: u64) -> Self {
        Self {
            overall_status: overall_status(&results),
            results,
            evaluated_at_ms,
        }
    }

    /// HTTP status for the public health surface.
    pub fn http_status(&self) -> u16 {
        match self.overall_status {
            HealthStatus::Unhealthy => 503,
            HealthStatus::Healthy | HealthStatus::Degraded => 200,
        }
    }

    /// Quorum tally, or `None` if the report has no quorum group.
    pub fn quorum(&self) -> Option<QuorumTally> {
        quorum_tally(&self.results)
    }

    pub fn result(&self, probe_name: &str) -> Option<&ProbeResult> {
        self.results.iter().find(|r| r.probe_name == probe_name)
    }

    /// One line naming every probe that is not healthy.
    pub fn summary(&self) -> String {
        let failing: Vec<String> = self
            .results
            .iter()
            .filter(|r| matches!(r.status, ProbeStatus::Unhealthy | ProbeStatus::Degraded))
            .map(|r| format!("{}: {} ({})", r.probe_name, r.status, r.message))
            .collect();
        if failing.is_empty() {
            format!("deployment {}", self.overall_status)
        } else {
            format!("deployment {}: {}", self.overall_status, failing.join("; "))
        }
    }
}

/// The aggregation rule. Depends on nothing but `results`.
pub fn overall_status(results: &[ProbeResult]) -> HealthStatus {
    let critical_down = results.iter().any(|r| {
        r.criticality == Criticality::Critical && r.status == ProbeStatus::Unhealthy
    });
    if critical_down {
        return HealthStatus::Unhealthy;
    }

    if let Some(tally) = quorum_tally(results) {
        if !tally.met() {
            return HealthStatus::Unhealthy;
        }
    }

    let any_impaired = results
        .iter()
        .any(|r| matches!(r.status, ProbeStatus::Unhealthy | ProbeStatus::Degraded));
    let certificate_invalid = results
        .iter()
        .filter(|r| r.status.counts())
        .filter_map(|r| r.certificate.as_ref())
        .any(|c| !c.valid);
    if any_impaired || certificate_invalid {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}

fn quorum_tally(results: &[ProbeResult]) -> Option<QuorumTally> {
    let mut members = results.iter().filter(|r| r.quorum).peekable();
    members.peek()?;
    let counted: Vec<&ProbeResult> = members.filter(|r| r.status.counts()).collect();
    let healthy = counted
        .iter()
        .filter(|r| r.status == ProbeStatus::Healthy)
        .count();
    Some(QuorumTally {
        healthy,
        counted: counted.len(),
        required: quorum_required(counted.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::CertificateStatus;

    fn result(name: &str, criticality: Criticality, status: ProbeStatus) -> ProbeResult {
        ProbeResult {
            probe_name: name.to_string(),
            criticality,
            quorum: false,
            status,
            message: status.to_string(),
            duration_ms: 1,
            measured_at_ms: 1000,
            certificate: None,
        }
    }

    fn critical(name: &str, status: ProbeStatus) -> ProbeResult {
        result(name, Criticality::Critical, status)
    }

    fn optional(name: &str, status: ProbeStatus) -> ProbeResult {
        result(name, Criticality::Optional, status)
    }

    fn member(name: &str, status: ProbeStatus) -> ProbeResult {
        ProbeResult {
            quorum: true,
            ..optional(name, status)
        }
    }

    use ProbeStatus::*;

    #[test]
    fn all_healthy_is_healthy() {
        let results = vec![
            critical("database", Healthy),
            critical("cache", Healthy),
            optional("metrics", Healthy),
        ];
        assert_eq!(overall_status(&results), HealthStatus::Healthy);
    }

    #[test]
    fn empty_set_is_healthy() {
        assert_eq!(overall_status(&[]), HealthStatus::Healthy);
    }

    #[test]
    fn critical_failure_dominates_everything() {
        for other in [Healthy, Degraded, Unhealthy, Disabled, NotApplicable] {
            let results = vec![
                critical("database", Unhealthy),
                critical("cache", other),
                optional("metrics", other),
            ];
            assert_eq!(overall_status(&results), HealthStatus::Unhealthy, "other={other}");
        }
    }

    #[test]
    fn critical_degraded_is_only_degraded() {
        let results = vec![critical("database", Degraded), critical("cache", Healthy)];
        assert_eq!(overall_status(&results), HealthStatus::Degraded);
    }

    #[test]
    fn optional_failure_degrades() {
        for status in [Unhealthy, Degraded] {
            let results = vec![
                critical("database", Healthy),
                critical("cache", Healthy),
                optional("error-tracking", status),
            ];
            assert_eq!(overall_status(&results), HealthStatus::Degraded);
        }
    }

    #[test]
    fn disabled_and_not_applicable_are_neutral() {
        let results = vec![
            critical("database", Disabled),
            optional("feature-flags", Disabled),
            optional("tls-certificate", NotApplicable),
            optional("metrics", Healthy),
        ];
        assert_eq!(overall_status(&results), HealthStatus::Healthy);
    }

    #[test]
    fn invalid_certificate_degrades() {
        let mut tls = optional("tls-certificate", Healthy);
        tls.certificate = Some(CertificateStatus {
            host: "example.com".to_string(),
            valid: false,
            expiring_soon: false,
            warn_days: 14,
        });
        let results = vec![critical("database", Healthy), tls];
        assert_eq!(overall_status(&results), HealthStatus::Degraded);
    }

    #[test]
    fn quorum_required_is_two_thirds_rounded_up() {
        assert_eq!(quorum_required(0), 0);
        assert_eq!(quorum_required(1), 1);
        assert_eq!(quorum_required(2), 2);
        assert_eq!(quorum_required(3), 2);
        assert_eq!(quorum_required(4), 3);
        assert_eq!(quorum_required(6), 4);
    }

    #[test]
    fn quorum_met_with_one_of_three_down_is_degraded() {
        let results = vec![
            critical("reachability", Healthy),
            member("error-tracking", Healthy),
            member("feature-flags", Unhealthy),
            member("metrics", Healthy),
        ];
        assert_eq!(overall_status(&results), HealthStatus::Degraded);
    }

    #[test]
    fn quorum_missed_is_unhealthy_even_though_members_are_optional() {
        let results = vec![
            critical("reachability", Healthy),
            member("error-tracking", Unhealthy),
            member("feature-flags", Degraded),
            member("metrics", Healthy),
        ];
        assert_eq!(overall_status(&results), HealthStatus::Unhealthy);
    }

    #[test]
    fn same_results_without_quorum_tag_only_degrade() {
        // Distinct rule: untagged optional failures never produce unhealthy.
        let results = vec![
            critical("reachability", Healthy),
            optional("error-tracking", Unhealthy),
            optional("feature-flags", Degraded),
            optional("metrics", Healthy),
        ];
        assert_eq!(overall_status(&results), HealthStatus::Degraded);
    }

    #[test]
    fn disabled_members_leave_the_quorum_denominator() {
        let results = vec![
            critical("reachability", Healthy),
            member("error-tracking", Healthy),
            member("feature-flags", Disabled),
            member("metrics", Healthy),
        ];
        let report = HealthReport::from_results(results, 1);
        assert_eq!(
            report.quorum(),
            Some(QuorumTally { healthy: 2, counted: 2, required: 2 })
        );
        assert_eq!(report.overall_status, HealthStatus::Healthy);
    }

    #[test]
    fn http_status_mapping() {
        let report = HealthReport::from_results(vec![critical("database", Unhealthy)], 1);
        assert_eq!(report.http_status(), 503);
        let report = HealthReport::from_results(vec![optional("metrics", Degraded)], 1);
        assert_eq!(report.http_status(), 200);
        let report = HealthReport::from_results(vec![], 1);
        assert_eq!(report.http_status(), 200);
    }

    #[test]
    fn summary_names_failing_probes() {
        let report = HealthReport::from_results(
            vec![critical("database", Unhealthy), optional("metrics", Healthy)],
            1,
        );
        let summary = report.summary();
        assert!(summary.starts_with("deployment unhealthy"));
        assert!(summary.contains("database: unhealthy"));
        assert!(!summary.contains("metrics"));
    }
}
