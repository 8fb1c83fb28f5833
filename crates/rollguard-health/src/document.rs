//! The public health document rendered from a [`HealthReport`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::probe::{CertificateStatus, Criticality, ProbeStatus};
use crate::report::{HealthReport, HealthStatus};

/// `{status, timestamp, services, ssl}` as served on `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthDocument {
    pub status: HealthStatus,
    /// Evaluation time, epoch milliseconds.
    pub timestamp: u64,
    pub services: BTreeMap<String, ServiceEntry>,
    pub ssl: Option<CertificateStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub status: ProbeStatus,
    pub criticality: Criticality,
    pub message: String,
    pub duration_ms: u64,
}

impl From<&HealthReport> for HealthDocument {
    fn from(report: &HealthReport) -> Self {
        let services = report
            .results
            .iter()
            .map(|r| {
                (
                    r.probe_name.clone(),
                    ServiceEntry {
                        status: r.status,
                        criticality: r.criticality,
                        message: r.message.clone(),
                        duration_ms: r.duration_ms,
                    },
                )
            })
            .collect();
        let ssl = report.results.iter().find_map(|r| r.certificate.clone());
        Self {
            status: report.overall_status,
            timestamp: report.evaluated_at_ms,
            services,
            ssl,
        }
    }
}
