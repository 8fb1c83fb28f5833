//! rollguard-rollback: revert an application to its previous release.
//!
//! # Components
//!
//! - **`runner`**: `ProcessRunner` over ssh or a local shell, each call
//!   bounded by a timeout
//! - **`orchestrator`**: the rollback pipeline (resolve, stop, rebuild,
//!   settle, verify, report) with a per-app lock
//! - **`notify`**: fire-and-forget `NotificationSink`s (log, webhook)
//! - **`guard`**: `DeploymentGuard`, repeated health evaluation that
//!   triggers an automatic rollback

pub mod error;
pub mod guard;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod request;
pub mod runner;

pub use error::{NotifyError, RollbackError, RunnerError};
pub use guard::{DeploymentGuard, GuardOutcome};
pub use lock::{AppLockGuard, AppLocks};
pub use notify::{
    LogSink, Notification, NotificationSink, RecordingSink, WebhookSink, sink_from_config, spawn_emit,
};
pub use orchestrator::{OrchestratorSettings, Release, RollbackOrchestrator, parse_releases};
pub use request::{
    CommandDiagnostics, MAX_IDENTIFIER_LEN, RollbackMode, RollbackRequest, RollbackResult,
    RollbackStep, VERIFICATION_FAILED_MESSAGE, VERIFICATION_SKIPPED_MESSAGE, check_identifier,
};
pub use runner::{
    CommandOutput, LocalRunner, ProcessRunner, RunFuture, ScriptedRunner, SshRunner, runner_from_config,
};
