//! Rollback requests and results.

use rollguard_health::HealthReport;
use serde::{Deserialize, Serialize};

use crate::error::RollbackError;

/// Message reported when the rolled-back release could not be confirmed
/// healthy. The release switch stands.
pub const VERIFICATION_FAILED_MESSAGE: &str = "rollback verification failed";

/// Longest app id or release identifier accepted.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Message reported when cancellation cut the settle or verify wait short.
pub const VERIFICATION_SKIPPED_MESSAGE: &str = "rollback applied; verification skipped (cancelled)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMode {
    /// Triggered by a failed health evaluation.
    Automatic,
    /// Triggered by an operator.
    Manual,
}

/// One rollback attempt. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub app_id: String,
    pub reason: String,
    /// Release to roll back to; resolved from the release list when absent.
    pub target_release: Option<String>,
    pub mode: RollbackMode,
    pub initiated_by: String,
}

impl RollbackRequest {
    pub fn manual(app_id: &str, initiated_by: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            reason: "manual rollback".to_string(),
            target_release: None,
            mode: RollbackMode::Manual,
            initiated_by: initiated_by.to_string(),
        }
    }

    pub fn automatic(app_id: &str, reason: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            reason: reason.to_string(),
            target_release: None,
            mode: RollbackMode::Automatic,
            initiated_by: "rollguard".to_string(),
        }
    }

    pub fn with_target(mut self, release: &str) -> Self {
        self.target_release = Some(release.to_string());
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = reason.to_string();
        self
    }

    pub fn with_initiator(mut self, initiated_by: &str) -> Self {
        self.initiated_by = initiated_by.to_string();
        self
    }

    /// Reject app ids and target releases that are unsafe to substitute
    /// into a shell command.
    pub fn validate(&self) -> Result<(), RollbackError> {
        check_identifier("app_id", &self.app_id)?;
        if let Some(target) = &self.target_release {
            check_identifier("target_release", target)?;
        }
        Ok(())
    }
}

/// Identifiers end up inside `sh -c` (locally or over SSH), so only
/// `[A-Za-z0-9._-]` is allowed, starting with a letter or digit.
pub fn check_identifier(field: &'static str, value: &str) -> Result<(), RollbackError> {
    let valid = value.len() <= MAX_IDENTIFIER_LEN
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(RollbackError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
    }
}

/// Steps of the rollback pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStep {
    ResolveTarget,
    Stop,
    Rebuild,
    Settle,
    Verify,
    Report,
}

impl std::fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RollbackStep::ResolveTarget => "resolve_target",
            RollbackStep::Stop => "stop",
            RollbackStep::Rebuild => "rebuild",
            RollbackStep::Settle => "settle",
            RollbackStep::Verify => "verify",
            RollbackStep::Report => "report",
        };
        f.write_str(s)
    }
}

/// Output of the failing remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDiagnostics {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Terminal value of one rollback attempt. Not stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub success: bool,
    pub message: String,
    pub release_used: Option<String>,
    pub verification: Option<HealthReport>,
    /// Step that failed, `None` on success.
    pub failed_step: Option<RollbackStep>,
    pub app_id: String,
    pub reason: String,
    pub initiated_by: String,
    pub mode: RollbackMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<CommandDiagnostics>,
}

impl RollbackResult {
    fn base(request: &RollbackRequest, success: bool, message: String) -> Self {
        Self {
            success,
            message,
            release_used: None,
            verification: None,
            failed_step: None,
            app_id: request.app_id.clone(),
            reason: request.reason.clone(),
            initiated_by: request.initiated_by.clone(),
            mode: request.mode,
            diagnostics: None,
        }
    }

    /// Rollback applied and verified healthy or degraded.
    pub fn succeeded(request: &RollbackRequest, release: &str, verification: HealthReport) -> Self {
        Self {
            release_used: Some(release.to_string()),
            verification: Some(verification),
            ..Self::base(
                request,
                true,
                format!("rolled back {} to {release}", request.app_id),
            )
        }
    }

    /// Rollback applied but the verification set came back unhealthy.
    pub fn unverified(request: &RollbackRequest, release: &str, verification: HealthReport) -> Self {
        Self {
            release_used: Some(release.to_string()),
            verification: Some(verification),
            failed_step: Some(RollbackStep::Verify),
            ..Self::base(request, false, VERIFICATION_FAILED_MESSAGE.to_string())
        }
    }

    /// Rollback applied; cancellation cut verification short.
    pub fn verification_skipped(request: &RollbackRequest, release: &str, step: RollbackStep) -> Self {
        Self {
            release_used: Some(release.to_string()),
            failed_step: Some(step),
            ..Self::base(request, false, VERIFICATION_SKIPPED_MESSAGE.to_string())
        }
    }

    /// A terminal pipeline error rendered as a result document.
    pub fn failed(request: &RollbackRequest, error: &RollbackError) -> Self {
        let diagnostics = match error {
            RollbackError::RebuildFailed {
                exit_code,
                stdout,
                stderr,
                ..
            } => Some(CommandDiagnostics {
                exit_code: *exit_code,
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }),
            _ => None,
        };
        Self {
            failed_step: error.step(),
            diagnostics,
            ..Self::base(request, false, error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_failure_carries_diagnostics() {
        let request = RollbackRequest::manual("shop", "ops@example.com");
        let error = RollbackError::RebuildFailed {
            release: "v4".to_string(),
            exit_code: 1,
            stdout: "building".to_string(),
            stderr: "disk full".to_string(),
        };
        let result = RollbackResult::failed(&request, &error);
        assert!(!result.success);
        assert!(result.message.starts_with("RebuildFailed"));
        assert_eq!(result.failed_step, Some(RollbackStep::Rebuild));
        assert_eq!(result.diagnostics.unwrap().stderr, "disk full");
        assert_eq!(result.initiated_by, "ops@example.com");
    }

    #[test]
    fn result_serializes_snake_case() {
        let request = RollbackRequest::automatic("shop", "database: unhealthy");
        let error = RollbackError::NoPreviousRelease {
            app_id: "shop".to_string(),
            detail: "found 1 release(s)".to_string(),
        };
        let json = serde_json::to_value(RollbackResult::failed(&request, &error)).unwrap();
        assert_eq!(json["mode"], "automatic");
        assert_eq!(json["failed_step"], "resolve_target");
        assert!(json["verification"].is_null());
        assert!(json.get("diagnostics").is_none());
    }

    #[test]
    fn request_builders() {
        let request = RollbackRequest::manual("shop", "alice")
            .with_target("v7")
            .with_reason("bad deploy");
        assert_eq!(request.target_release.as_deref(), Some("v7"));
        assert_eq!(request.reason, "bad deploy");
        assert_eq!(request.mode, RollbackMode::Manual);
    }

    #[test]
    fn identifiers_accept_release_names() {
        for id in ["shop", "v4", "2024.05.01-rc_1", "A9"] {
            assert!(check_identifier("target_release", id).is_ok(), "{id}");
        }
    }

    #[test]
    fn identifiers_reject_shell_syntax() {
        for id in ["v1; touch /tmp/x", "$(id)", "`id`", "a b", "-rf", "", "v1\nv2", "../v1/x", "a|b"] {
            let err = check_identifier("target_release", id).unwrap_err();
            assert!(err.to_string().starts_with("InvalidIdentifier"), "{id}");
        }
        assert!(check_identifier("app_id", &"a".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }

    #[test]
    fn validate_checks_app_and_target() {
        assert!(RollbackRequest::manual("shop", "alice").with_target("v2").validate().is_ok());
        let err = RollbackRequest::manual("shop;reboot", "alice").validate().unwrap_err();
        assert!(matches!(err, RollbackError::InvalidIdentifier { field: "app_id", .. }));
        let err = RollbackRequest::manual("shop", "alice")
            .with_target("v1 && id")
            .validate()
            .unwrap_err();
        assert!(matches!(err, RollbackError::InvalidIdentifier { field: "target_release", .. }));
        // Free-text fields never reach a command.
        assert!(RollbackRequest::manual("shop", "a; b").with_reason("$(x)").validate().is_ok());
    }
}
