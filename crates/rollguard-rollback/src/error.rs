use std::time::Duration;

use thiserror::Error;

use crate::request::RollbackStep;

/// Infrastructure faults from a [`crate::ProcessRunner`]: the command
/// could not be run at all, as opposed to running and exiting non-zero.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("remote host {host} unreachable: {detail}")]
    Unreachable { host: String, detail: String },
}

/// Terminal rollback failures. Display strings lead with the failure kind
/// so they can be matched on in results and logs.
#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("NoPreviousRelease: {app_id}: {detail}")]
    NoPreviousRelease { app_id: String, detail: String },

    #[error("RebuildFailed: rebuild of {release} exited with code {exit_code}")]
    RebuildFailed {
        release: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("RollbackInProgress: a rollback of {app_id} is already running")]
    RollbackInProgress { app_id: String },

    #[error("Cancelled: rollback of {app_id} cancelled before it started")]
    Cancelled { app_id: String },

    #[error(
        "InvalidIdentifier: {field} {value:?} must be ASCII letters, digits, '.', '_' or '-' and start alphanumeric"
    )]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("RunnerFailed: {step} step: {source}")]
    Runner {
        step: RollbackStep,
        #[source]
        source: RunnerError,
    },
}

impl RollbackError {
    /// Pipeline step the failure belongs to, if any.
    pub fn step(&self) -> Option<RollbackStep> {
        match self {
            RollbackError::NoPreviousRelease { .. }
            | RollbackError::Cancelled { .. }
            | RollbackError::InvalidIdentifier { .. } => Some(RollbackStep::ResolveTarget),
            RollbackError::RebuildFailed { .. } => Some(RollbackStep::Rebuild),
            RollbackError::Runner { step, .. } => Some(*step),
            RollbackError::RollbackInProgress { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid webhook url {url}: {detail}")]
    InvalidUrl { url: String, detail: String },

    #[error("webhook delivery failed: {0}")]
    Delivery(String),

    #[error("webhook returned HTTP {0}")]
    Status(u16),

    #[error("webhook timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
}
