//! The probe capability and the values it produces.
//!
//! Every health check implements [`Probe`]; the aggregator holds a
//! homogeneous list of `Arc<dyn Probe>` and never inspects which kind of
//! probe it is running.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Boxed future returned by [`Probe::check`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>>;

/// Whether a probe's failure alone sinks the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Critical,
    Optional,
}

/// Status of a single probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// The dependency is switched off for this deployment.
    Disabled,
    /// The check does not apply (e.g. TLS on a plain-HTTP deployment).
    NotApplicable,
}

impl ProbeStatus {
    /// Disabled and not-applicable probes never influence a verdict.
    pub fn counts(self) -> bool {
        !matches!(self, ProbeStatus::Disabled | ProbeStatus::NotApplicable)
    }
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProbeStatus::Healthy => "healthy",
            ProbeStatus::Degraded => "degraded",
            ProbeStatus::Unhealthy => "unhealthy",
            ProbeStatus::Disabled => "disabled",
            ProbeStatus::NotApplicable => "not_applicable",
        };
        f.write_str(s)
    }
}

/// Immutable description of a probe, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub name: String,
    pub criticality: Criticality,
    pub timeout: Duration,
}

impl ProbeSpec {
    pub fn new(name: &str, criticality: Criticality, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            criticality,
            timeout,
        }
    }
}

/// Certificate validity reported by the TLS probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateStatus {
    pub host: String,
    pub valid: bool,
    /// Valid now, but not `warn_days` from now.
    pub expiring_soon: bool,
    pub warn_days: u32,
}

/// What a probe reports; the aggregator stamps name, timing and
/// criticality on top to make a [`ProbeResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub message: String,
    pub certificate: Option<CertificateStatus>,
}

impl ProbeOutcome {
    pub fn new(status: ProbeStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            certificate: None,
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(ProbeStatus::Healthy, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ProbeStatus::Degraded, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ProbeStatus::Unhealthy, message)
    }

    pub fn with_certificate(mut self, certificate: CertificateStatus) -> Self {
        self.certificate = Some(certificate);
        self
    }
}

/// One probe's result within a [`crate::HealthReport`]. Never mutated
/// after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub probe_name: String,
    pub criticality: Criticality,
    /// Member of the quorum group rather than the critical/optional rule.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub quorum: bool,
    pub status: ProbeStatus,
    pub message: String,
    pub duration_ms: u64,
    pub measured_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateStatus>,
}

/// A named, criticality-tagged health check.
pub trait Probe: Send + Sync {
    fn spec(&self) -> &ProbeSpec;

    /// Run the check once. `timeout` is the probe's own budget; the
    /// aggregator enforces it regardless, so implementations may ignore it.
    fn check(&self, timeout: Duration) -> ProbeFuture<'_>;
}

/// Probe that reports a fixed outcome, optionally after a delay.
///
/// Used for unconfigured dependencies and in tests.
pub struct StaticProbe {
    spec: ProbeSpec,
    outcome: ProbeOutcome,
    delay: Option<Duration>,
}

impl StaticProbe {
    pub fn new(spec: ProbeSpec, outcome: ProbeOutcome) -> Self {
        Self {
            spec,
            outcome,
            delay: None,
        }
    }

    pub fn with_status(name: &str, criticality: Criticality, status: ProbeStatus) -> Self {
        Self::new(
            ProbeSpec::new(name, criticality, Duration::from_secs(1)),
            ProbeOutcome::new(status, status.to_string()),
        )
    }

    /// A dependency that is switched off.
    pub fn disabled(name: &str, criticality: Criticality, reason: &str) -> Self {
        Self::new(
            ProbeSpec::new(name, criticality, Duration::from_secs(1)),
            ProbeOutcome::new(ProbeStatus::Disabled, reason),
        )
    }

    /// A check that does not apply to this deployment.
    pub fn not_applicable(name: &str, criticality: Criticality, reason: &str) -> Self {
        Self::new(
            ProbeSpec::new(name, criticality, Duration::from_secs(1)),
            ProbeOutcome::new(ProbeStatus::NotApplicable, reason),
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = timeout;
        self
    }
}

impl Probe for StaticProbe {
    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    fn check(&self, _timeout: Duration) -> ProbeFuture<'_> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.outcome.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_and_not_applicable_do_not_count() {
        assert!(!ProbeStatus::Disabled.counts());
        assert!(!ProbeStatus::NotApplicable.counts());
        assert!(ProbeStatus::Degraded.counts());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ProbeStatus::NotApplicable).unwrap();
        assert_eq!(json, "\"not_applicable\"");
    }

    #[tokio::test]
    async fn static_probe_reports_its_outcome() {
        let probe = StaticProbe::disabled("feature-flags", Criticality::Optional, "flags off");
        let outcome = probe.check(Duration::from_secs(1)).await;
        assert_eq!(outcome.status, ProbeStatus::Disabled);
        assert_eq!(outcome.message, "flags off");
    }
}
