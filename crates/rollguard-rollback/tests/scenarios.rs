//! End-to-end rollback scenarios.
//!
//! Probe sets come from a real `ProbeFactory` over configuration; the
//! remote process manager is a `ScriptedRunner`.

use std::sync::Arc;

use rollguard_core::RollguardConfig;
use rollguard_health::{HealthStatus, ProbeFactory, ProbeStatus};
use rollguard_rollback::*;
use rollguard_state::MemoryStore;
use tokio::net::TcpListener;
use tokio::sync::watch;

const COMMANDS: &str = r#"
[rollback]
settle_delay = "10ms"
command_timeout = "5s"

[rollback.commands]
list_releases = "releases {app}"
stop = "stop {app}"
rebuild = "rebuild {app} {release}"
"#;

/// Config whose verification probes all point at a live local listener.
async fn healthy_config() -> (RollguardConfig, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut toml = COMMANDS.to_string();
    for name in ["reachability", "error-tracking", "feature-flags", "metrics"] {
        toml.push_str(&format!(
            "\n[probes.{name}]\nkind = \"tcp\"\naddress = \"{addr}\"\ntimeout = \"2s\"\n"
        ));
    }
    (RollguardConfig::from_toml_str(&toml).unwrap(), listener)
}

fn orchestrator(
    config: &RollguardConfig,
    runner: &ScriptedRunner,
) -> (RollbackOrchestrator, tokio::sync::mpsc::UnboundedReceiver<Notification>) {
    let factory = ProbeFactory::new(config, Arc::new(MemoryStore::new()));
    let (sink, rx) = RecordingSink::channel();
    let commands = config.rollback.commands.clone().unwrap();
    let orchestrator = RollbackOrchestrator::new(
        Arc::new(runner.clone()),
        commands,
        factory.post_rollback_verification(),
        Arc::new(sink),
    )
    .with_settings(OrchestratorSettings::from(&config.rollback));
    (orchestrator, rx)
}

fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn scenario_c_rollback_to_previous_release_verified() {
    let (config, _listener) = healthy_config().await;
    let runner = ScriptedRunner::new().respond("releases", CommandOutput::ok("v5\nv4\n"));
    let (orchestrator, mut rx) = orchestrator(&config, &runner);

    let result = orchestrator
        .rollback(RollbackRequest::manual("shop", "alice"), no_cancel())
        .await
        .unwrap();

    assert!(result.success, "{}", result.message);
    assert_eq!(result.release_used.as_deref(), Some("v4"));
    let verification = result.verification.as_ref().unwrap();
    assert_eq!(verification.overall_status, HealthStatus::Healthy);
    assert_eq!(verification.results.len(), 4);
    assert_eq!(runner.calls(), ["releases shop", "stop shop", "rebuild shop v4"]);

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.result, result);
}

#[tokio::test]
async fn scenario_d_rebuild_failure_stops_the_pipeline() {
    let (config, _listener) = healthy_config().await;
    let runner = ScriptedRunner::new()
        .respond("releases", CommandOutput::ok("v5\nv4\n"))
        .respond(
            "rebuild",
            CommandOutput {
                exit_code: 1,
                stdout: "fetching v4".to_string(),
                stderr: "release v4 not found".to_string(),
            },
        );
    let (orchestrator, _rx) = orchestrator(&config, &runner);

    let result = orchestrator
        .rollback(RollbackRequest::manual("shop", "alice"), no_cancel())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.message.contains("RebuildFailed"));
    assert_eq!(result.failed_step, Some(RollbackStep::Rebuild));
    // Settle and Verify never ran.
    assert!(result.verification.is_none());
    assert!(result.release_used.is_none());
    let diagnostics = result.diagnostics.unwrap();
    assert_eq!(diagnostics.exit_code, 1);
    assert_eq!(diagnostics.stderr, "release v4 not found");
}

#[tokio::test]
async fn verification_quorum_tolerates_one_integration_down() {
    let (mut config, _listener) = healthy_config().await;
    // One of three integrations unreachable: 2/3 still meets quorum.
    config.probes.get_mut("metrics").unwrap().address = Some("127.0.0.1:1".to_string());
    let runner = ScriptedRunner::new().respond("releases", CommandOutput::ok("v5\nv4\n"));
    let (orchestrator, _rx) = orchestrator(&config, &runner);

    let result = orchestrator
        .rollback(RollbackRequest::manual("shop", "alice"), no_cancel())
        .await
        .unwrap();

    assert!(result.success, "{}", result.message);
    let verification = result.verification.unwrap();
    assert_eq!(verification.overall_status, HealthStatus::Degraded);
    assert_eq!(verification.result("metrics").unwrap().status, ProbeStatus::Unhealthy);
}

#[tokio::test]
async fn verification_quorum_missed_reports_failure_without_undo() {
    let (mut config, _listener) = healthy_config().await;
    for name in ["metrics", "feature-flags"] {
        config.probes.get_mut(name).unwrap().address = Some("127.0.0.1:1".to_string());
    }
    let runner = ScriptedRunner::new().respond("releases", CommandOutput::ok("v5\nv4\n"));
    let (orchestrator, _rx) = orchestrator(&config, &runner);

    let result = orchestrator
        .rollback(RollbackRequest::manual("shop", "alice"), no_cancel())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.message, VERIFICATION_FAILED_MESSAGE);
    assert_eq!(result.release_used.as_deref(), Some("v4"));
    assert_eq!(
        result.verification.unwrap().overall_status,
        HealthStatus::Unhealthy
    );
    assert_eq!(runner.calls().len(), 3);
}

#[tokio::test]
async fn unreachable_host_is_an_infrastructure_fault() {
    let (config, _listener) = healthy_config().await;
    let runner = ScriptedRunner::new().unreachable("releases");
    let (orchestrator, _rx) = orchestrator(&config, &runner);

    let err = orchestrator
        .rollback(RollbackRequest::manual("shop", "alice"), no_cancel())
        .await
        .unwrap_err();
    assert!(matches!(err, RollbackError::Runner { step: RollbackStep::ResolveTarget, .. }));
    assert!(!orchestrator.locks().is_locked("shop"));
}

#[tokio::test]
async fn rollback_without_verification_checks_is_not_verified() {
    let config = RollguardConfig::from_toml_str(COMMANDS).unwrap();
    let runner = ScriptedRunner::new().respond("releases", CommandOutput::ok("v5\nv4\n"));
    let (orchestrator, mut rx) = orchestrator(&config, &runner);

    let result = orchestrator
        .rollback(RollbackRequest::manual("shop", "alice"), no_cancel())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.message, VERIFICATION_FAILED_MESSAGE);
    assert_eq!(result.release_used.as_deref(), Some("v4"));
    let verification = result.verification.unwrap();
    assert!(verification.results.iter().all(|r| r.status == ProbeStatus::Disabled));
    assert!(!rx.recv().await.unwrap().result.success);
}
