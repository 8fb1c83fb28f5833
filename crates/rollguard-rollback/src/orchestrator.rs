//! Rollback orchestrator: drives one rollback attempt through its steps.
//!
//! ```text
//! ResolveTarget → Stop → Rebuild → Settle → Verify → Report
//! ```
//!
//! The pipeline is linear and runs once per request; retrying is the
//! caller's decision. A failed verification leaves the rolled-back
//! release in place.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rollguard_core::{CommandTemplates, RollbackConfig};
use rollguard_health::{HealthAggregator, ProbeSet};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::RollbackError;
use crate::lock::AppLocks;
use crate::notify::{Notification, NotificationSink, spawn_emit};
use crate::request::{RollbackRequest, RollbackResult, RollbackStep, check_identifier};
use crate::runner::{CommandOutput, ProcessRunner};

/// A deployed release as listed by the process manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub identifier: String,
    /// Whatever follows the identifier on the line; never interpreted.
    pub deployed_at: Option<String>,
}

/// Parse release-list output: one release per line, most recent first.
/// The first whitespace-separated token is the identifier.
pub fn parse_releases(stdout: &str) -> Vec<Release> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let mut parts = line.splitn(2, char::is_whitespace);
            let identifier = parts.next()?.to_string();
            let deployed_at = parts
                .next()
                .map(str::trim)
                .filter(|rest| !rest.is_empty())
                .map(str::to_string);
            Some(Release {
                identifier,
                deployed_at,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub settle_delay: Duration,
    pub command_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&RollbackConfig> for OrchestratorSettings {
    fn from(config: &RollbackConfig) -> Self {
        Self {
            settle_delay: config.settle_delay(),
            command_timeout: config.command_timeout(),
        }
    }
}

pub struct RollbackOrchestrator {
    runner: Arc<dyn ProcessRunner>,
    commands: CommandTemplates,
    verification: ProbeSet,
    aggregator: HealthAggregator,
    sink: Arc<dyn NotificationSink>,
    locks: AppLocks,
    settings: OrchestratorSettings,
    /// Notifications handed to the sink and possibly still in flight.
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl RollbackOrchestrator {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        commands: CommandTemplates,
        verification: ProbeSet,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            runner,
            commands,
            verification,
            aggregator: HealthAggregator::new(),
            sink,
            locks: AppLocks::new(),
            settings: OrchestratorSettings::default(),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> OrchestratorSettings {
        self.settings
    }

    pub fn locks(&self) -> &AppLocks {
        &self.locks
    }

    fn pending(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for notifications still being delivered. Short-lived callers
    /// (the CLI, shutdown) call this before the runtime goes away.
    pub async fn flush_notifications(&self) {
        let pending = std::mem::take(&mut *self.pending());
        if !pending.is_empty() {
            debug!(count = pending.len(), "waiting for rollback notifications");
        }
        for handle in pending {
            let _ = handle.await;
        }
    }

    /// Run one rollback attempt.
    ///
    /// Every pipeline failure comes back as an `Ok` result with
    /// `success = false`. `Err` means the attempt never ran
    /// (`RollbackInProgress`) or the runner itself failed
    /// (`RollbackError::Runner`); the latter is still reported to the sink.
    ///
    /// `cancel` flipping to `true` before the pipeline starts aborts it;
    /// afterwards it only cuts the settle and verify waits short.
    pub async fn rollback(
        &self,
        request: RollbackRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<RollbackResult, RollbackError> {
        if let Err(e) = request.validate() {
            warn!(app_id = %request.app_id, error = %e, "rollback request rejected");
            return Err(e);
        }

        let Some(_lock) = self.locks.try_acquire(&request.app_id) else {
            warn!(app_id = %request.app_id, "rollback already in progress");
            return Err(RollbackError::RollbackInProgress {
                app_id: request.app_id.clone(),
            });
        };

        info!(
            app_id = %request.app_id,
            mode = ?request.mode,
            initiated_by = %request.initiated_by,
            reason = %request.reason,
            "rollback started"
        );

        let (result, fault) = match self.run_pipeline(&request, cancel).await {
            Ok(result) => (result, None),
            Err(e @ RollbackError::Runner { .. }) => (RollbackResult::failed(&request, &e), Some(e)),
            Err(e) => (RollbackResult::failed(&request, &e), None),
        };

        if result.success {
            info!(app_id = %request.app_id, release = ?result.release_used, "rollback complete");
        } else {
            warn!(
                app_id = %request.app_id,
                failed_step = ?result.failed_step,
                message = %result.message,
                "rollback did not succeed"
            );
        }

        // Report
        let handle = spawn_emit(Arc::clone(&self.sink), Notification::new(&request, &result));
        {
            let mut pending = self.pending();
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }

        match fault {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    async fn run_pipeline(
        &self,
        request: &RollbackRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RollbackResult, RollbackError> {
        if *cancel.borrow() {
            return Err(RollbackError::Cancelled {
                app_id: request.app_id.clone(),
            });
        }

        // Once dispatched, resolve/stop/rebuild run to completion.
        let release = self.resolve_target(request).await?;
        info!(app_id = %request.app_id, %release, "rollback target resolved");
        self.stop(request).await?;
        self.rebuild(request, &release).await?;

        debug!(
            app_id = %request.app_id,
            settle_ms = self.settings.settle_delay.as_millis() as u64,
            "waiting for process manager to settle"
        );
        tokio::select! {
            _ = tokio::time::sleep(self.settings.settle_delay) => {}
            _ = cancelled(&mut cancel) => {
                warn!(app_id = %request.app_id, "cancelled while settling, verification skipped");
                return Ok(RollbackResult::verification_skipped(request, &release, RollbackStep::Settle));
            }
        }

        let report = tokio::select! {
            report = self.aggregator.evaluate(&self.verification) => report,
            _ = cancelled(&mut cancel) => {
                warn!(app_id = %request.app_id, "cancelled while verifying, verification skipped");
                return Ok(RollbackResult::verification_skipped(request, &release, RollbackStep::Verify));
            }
        };

        if !report.results.iter().any(|r| r.status.counts()) {
            // Nothing was actually checked; do not call that verified.
            warn!(
                app_id = %request.app_id,
                %release,
                "nothing was verified, rollback unverified"
            );
            Ok(RollbackResult::unverified(request, &release, report))
        } else if report.overall_status.is_serving() {
            Ok(RollbackResult::succeeded(request, &release, report))
        } else {
            // The release switch stands; a second rollback could loop.
            warn!(
                app_id = %request.app_id,
                %release,
                summary = %report.summary(),
                "rollback verification failed"
            );
            Ok(RollbackResult::unverified(request, &release, report))
        }
    }

    async fn resolve_target(&self, request: &RollbackRequest) -> Result<String, RollbackError> {
        if let Some(target) = &request.target_release {
            return Ok(target.clone());
        }

        let command = CommandTemplates::render(&self.commands.list_releases, &request.app_id, None);
        let output = self.run(RollbackStep::ResolveTarget, &command).await?;
        if !output.success() {
            return Err(RollbackError::NoPreviousRelease {
                app_id: request.app_id.clone(),
                detail: format!(
                    "listing releases exited with code {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }

        let releases = parse_releases(&output.stdout);
        match releases.get(1) {
            Some(previous) => {
                check_identifier("release", &previous.identifier)?;
                Ok(previous.identifier.clone())
            }
            None => Err(RollbackError::NoPreviousRelease {
                app_id: request.app_id.clone(),
                detail: format!("found {} release(s)", releases.len()),
            }),
        }
    }

    async fn stop(&self, request: &RollbackRequest) -> Result<(), RollbackError> {
        let command = CommandTemplates::render(&self.commands.stop, &request.app_id, None);
        let output = self.run(RollbackStep::Stop, &command).await?;
        if !output.success() {
            // Stopping an app that is already down is not fatal.
            warn!(
                app_id = %request.app_id,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "stop exited non-zero, continuing"
            );
        }
        Ok(())
    }

    async fn rebuild(&self, request: &RollbackRequest, release: &str) -> Result<(), RollbackError> {
        let command = CommandTemplates::render(&self.commands.rebuild, &request.app_id, Some(release));
        let output = self.run(RollbackStep::Rebuild, &command).await?;
        if !output.success() {
            return Err(RollbackError::RebuildFailed {
                release: release.to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    async fn run(&self, step: RollbackStep, command: &str) -> Result<CommandOutput, RollbackError> {
        self.runner
            .run(command, self.settings.command_timeout)
            .await
            .map_err(|source| {
                error!(%step, %command, error = %source, "process runner failed");
                RollbackError::Runner { step, source }
            })
    }
}

/// Resolves once `cancel` reads `true`. Never resolves if the sender is
/// dropped without cancelling.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
