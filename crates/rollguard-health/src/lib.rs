//! rollguard-health: probes and the deployment health verdict.
//!
//! Runs a set of independent probes concurrently and folds their results
//! into one [`HealthReport`]. Probes never raise errors: timeouts, panics,
//! refused connections and open circuits all come back as a
//! [`ProbeResult`] status.
//!
//! # Architecture
//!
//! ```text
//! HealthAggregator::evaluate(&ProbeSet)
//!   ├── JoinSet, one task per probe, each bounded by its own timeout
//!   │   ├── TcpProbe / HttpProbe / TlsCertificateProbe
//!   │   ├── GuardedProbe → CircuitBreaker (rollguard-breaker)
//!   │   └── StaticProbe (disabled / not_applicable)
//!   └── HealthReport::from_results (pure verdict rules + quorum rule)
//! ```
//!
//! [`ProbeFactory`] builds the deployment-health and post-rollback
//! verification sets from configuration. [`HealthTracker`] is the caller's
//! retry policy across evaluations.

pub mod aggregator;
pub mod checker;
pub mod document;
pub mod guarded;
pub mod probe;
pub mod report;
pub mod sets;
pub mod tls;
pub mod tracker;

pub use aggregator::HealthAggregator;
pub use checker::{HttpProbe, TcpProbe};
pub use document::{HealthDocument, ServiceEntry};
pub use guarded::{CIRCUIT_OPEN_MESSAGE, GuardedProbe};
pub use probe::{
    CertificateStatus, Criticality, Probe, ProbeFuture, ProbeOutcome, ProbeResult, ProbeSpec,
    ProbeStatus, StaticProbe,
};
pub use report::{HealthReport, HealthStatus, QuorumTally, overall_status, quorum_required};
pub use sets::{ProbeFactory, ProbeSet, SetMember};
pub use tls::TlsCertificateProbe;
pub use tracker::HealthTracker;
