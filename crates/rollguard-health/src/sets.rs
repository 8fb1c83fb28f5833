//! Standard probe sets and their construction from configuration.
//!
//! Two sets are defined by composition:
//!
//! - **deployment health**: `database` and `cache` critical; `error-tracking`,
//!   `feature-flags`, `metrics`, `tls-certificate` optional.
//! - **post-rollback verification**: `reachability` critical plus a quorum
//!   group of `error-tracking`, `feature-flags`, `metrics`.

use std::collections::BTreeMap;
use std::sync::Arc;

use rollguard_breaker::{BreakerSettings, CircuitBreaker};
use rollguard_core::{ProbeConfig, ProbeKind, RollguardConfig};
use rollguard_state::KvStore;
use tracing::debug;

use crate::checker::{HttpProbe, TcpProbe};
use crate::guarded::GuardedProbe;
use crate::probe::{Criticality, Probe, ProbeSpec, StaticProbe};
use crate::tls::TlsCertificateProbe;

pub const DATABASE: &str = "database";
pub const CACHE: &str = "cache";
pub const ERROR_TRACKING: &str = "error-tracking";
pub const FEATURE_FLAGS: &str = "feature-flags";
pub const METRICS: &str = "metrics";
pub const TLS_CERTIFICATE: &str = "tls-certificate";
pub const REACHABILITY: &str = "reachability";

/// Optional services whose collective health is judged by quorum after a
/// rollback.
pub const SERVICE_INTEGRATIONS: [&str; 3] = [ERROR_TRACKING, FEATURE_FLAGS, METRICS];

/// A probe plus its membership in the set's quorum group.
#[derive(Clone)]
pub struct SetMember {
    pub probe: Arc<dyn Probe>,
    pub quorum: bool,
}

/// Ordered list of probes evaluated together.
#[derive(Clone)]
pub struct ProbeSet {
    name: String,
    members: Vec<SetMember>,
}

impl ProbeSet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Vec::new(),
        }
    }

    /// Add a probe judged by the critical/optional rule.
    pub fn with(mut self, probe: Arc<dyn Probe>) -> Self {
        self.members.push(SetMember { probe, quorum: false });
        self
    }

    /// Add a probe to the quorum group.
    pub fn with_quorum(mut self, probe: Arc<dyn Probe>) -> Self {
        self.members.push(SetMember { probe, quorum: true });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[SetMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl std::fmt::Debug for ProbeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self
            .members
            .iter()
            .map(|m| m.probe.spec().name.as_str())
            .collect();
        f.debug_struct("ProbeSet")
            .field("name", &self.name)
            .field("probes", &names)
            .finish()
    }
}

/// Builds probes and the standard sets from `[probes.<name>]` sections.
pub struct ProbeFactory {
    probes: BTreeMap<String, ProbeConfig>,
    breaker: BreakerSettings,
    store: Arc<dyn KvStore>,
}

impl ProbeFactory {
    pub fn new(config: &RollguardConfig, store: Arc<dyn KvStore>) -> Self {
        Self {
            probes: config.probes.clone(),
            breaker: BreakerSettings::from(&config.breaker),
            store,
        }
    }

    /// Set served on the public health surface.
    pub fn deployment_health(&self) -> ProbeSet {
        ProbeSet::new("deployment-health")
            .with(self.build(DATABASE, Criticality::Critical))
            .with(self.build(CACHE, Criticality::Critical))
            .with(self.build(ERROR_TRACKING, Criticality::Optional))
            .with(self.build(FEATURE_FLAGS, Criticality::Optional))
            .with(self.build(METRICS, Criticality::Optional))
            .with(self.build(TLS_CERTIFICATE, Criticality::Optional))
    }

    /// Set used to confirm a rollback took.
    pub fn post_rollback_verification(&self) -> ProbeSet {
        SERVICE_INTEGRATIONS.iter().fold(
            ProbeSet::new("post-rollback-verification")
                .with(self.build(REACHABILITY, Criticality::Critical)),
            |set, name| set.with_quorum(self.build(name, Criticality::Optional)),
        )
    }

    /// Build the probe configured under `name`. Unconfigured probes
    /// report `disabled`.
    pub fn build(&self, name: &str, criticality: Criticality) -> Arc<dyn Probe> {
        let Some(config) = self.probes.get(name) else {
            debug!(probe = %name, "probe not configured, disabled");
            return Arc::new(StaticProbe::disabled(name, criticality, "not configured"));
        };

        let spec = ProbeSpec::new(name, criticality, config.timeout());
        let probe: Arc<dyn Probe> = match config.kind {
            ProbeKind::Tcp => match &config.address {
                Some(address) => Arc::new(TcpProbe::new(spec, address)),
                None => Arc::new(StaticProbe::disabled(name, criticality, "no address configured")),
            },
            ProbeKind::Http => match &config.url {
                Some(url) => Arc::new(HttpProbe::new(spec, url)),
                None => Arc::new(StaticProbe::disabled(name, criticality, "no url configured")),
            },
            ProbeKind::Tls => match &config.host {
                Some(host) => Arc::new(TlsCertificateProbe::new(
                    spec,
                    host,
                    config.tls_port(),
                    config.warn_days(),
                )),
                None => {
                    return Arc::new(StaticProbe::not_applicable(
                        name,
                        criticality,
                        "no TLS host configured",
                    ));
                }
            },
        };

        if config.guarded() {
            let breaker = CircuitBreaker::new(name, self.breaker, Arc::clone(&self.store));
            Arc::new(GuardedProbe::new(probe, breaker, config.fallback()))
        } else {
            probe
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rollguard_state::MemoryStore;

    use super::*;
    use crate::aggregator::HealthAggregator;
    use crate::probe::ProbeStatus;
    use crate::report::HealthStatus;

    fn factory(toml: &str) -> ProbeFactory {
        let config = RollguardConfig::from_toml_str(toml).unwrap();
        ProbeFactory::new(&config, Arc::new(MemoryStore::new()))
    }

    fn names(set: &ProbeSet) -> Vec<String> {
        set.members()
            .iter()
            .map(|m| m.probe.spec().name.clone())
            .collect()
    }

    #[test]
    fn deployment_set_composition() {
        let set = factory("").deployment_health();
        assert_eq!(
            names(&set),
            [DATABASE, CACHE, ERROR_TRACKING, FEATURE_FLAGS, METRICS, TLS_CERTIFICATE]
        );
        let critical: Vec<bool> = set
            .members()
            .iter()
            .map(|m| m.probe.spec().criticality == Criticality::Critical)
            .collect();
        assert_eq!(critical, [true, true, false, false, false, false]);
        assert!(set.members().iter().all(|m| !m.quorum));
    }

    #[test]
    fn verification_set_composition() {
        let set = factory("").post_rollback_verification();
        assert_eq!(names(&set), [REACHABILITY, ERROR_TRACKING, FEATURE_FLAGS, METRICS]);
        let quorum: Vec<bool> = set.members().iter().map(|m| m.quorum).collect();
        assert_eq!(quorum, [false, true, true, true]);
        assert_eq!(set.members()[0].probe.spec().criticality, Criticality::Critical);
    }

    #[tokio::test]
    async fn unconfigured_probes_are_disabled_and_neutral() {
        let set = factory("").deployment_health();
        let report = HealthAggregator::new().evaluate(&set).await;
        assert!(report.results.iter().all(|r| r.status == ProbeStatus::Disabled));
        assert_eq!(report.overall_status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn tls_without_host_is_not_applicable() {
        let set = factory(
            r#"
[probes.tls-certificate]
kind = "tls"
"#,
        )
        .deployment_health();
        let report = HealthAggregator::new().evaluate(&set).await;
        assert_eq!(
            report.result(TLS_CERTIFICATE).unwrap().status,
            ProbeStatus::NotApplicable
        );
    }

    #[tokio::test]
    async fn configured_probe_uses_its_timeout() {
        let factory = factory(
            r#"
[probes.database]
kind = "tcp"
address = "127.0.0.1:1"
timeout = "750ms"
"#,
        );
        let probe = factory.build(DATABASE, Criticality::Critical);
        assert_eq!(probe.spec().timeout, Duration::from_millis(750));
    }

    #[tokio::test]
    async fn guarded_probe_opens_its_circuit() {
        let store = Arc::new(MemoryStore::new());
        let config = RollguardConfig::from_toml_str(
            r#"
[breaker]
failure_threshold = 1
open_duration = "60s"

[probes.feature-flags]
kind = "tcp"
address = "127.0.0.1:1"
timeout = "1s"
guarded = true
"#,
        )
        .unwrap();
        let factory = ProbeFactory::new(&config, store.clone());
        let probe = factory.build(FEATURE_FLAGS, Criticality::Optional);

        let first = probe.check(Duration::from_secs(1)).await;
        assert_eq!(first.status, ProbeStatus::Unhealthy);
        let second = probe.check(Duration::from_secs(1)).await;
        assert_eq!(second.status, ProbeStatus::Degraded);
        assert_eq!(second.message, crate::guarded::CIRCUIT_OPEN_MESSAGE);

        // A probe built later shares the persisted circuit.
        let rebuilt = factory.build(FEATURE_FLAGS, Criticality::Optional);
        let third = rebuilt.check(Duration::from_secs(1)).await;
        assert_eq!(third.status, ProbeStatus::Degraded);
    }
}
