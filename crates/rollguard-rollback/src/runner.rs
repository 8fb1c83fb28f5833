//! ProcessRunner: executes release-management commands.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rollguard_core::{RemoteConfig, RollbackConfig};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::RunnerError;

/// ssh exits with 255 when the connection itself fails.
const SSH_CONNECTION_FAILURE: i32 = 255;

pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<CommandOutput, RunnerError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one shell command with a hard timeout.
///
/// A non-zero exit is a normal `Ok` result; `Err` is reserved for
/// failing to run the command at all.
pub trait ProcessRunner: Send + Sync {
    fn run<'a>(&'a self, command: &'a str, timeout: Duration) -> RunFuture<'a>;
}

/// Runs commands through `sh -c` on this host.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl ProcessRunner for LocalRunner {
    fn run<'a>(&'a self, command: &'a str, timeout: Duration) -> RunFuture<'a> {
        Box::pin(async move {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            execute(cmd, command, timeout).await
        })
    }
}

/// Runs commands on a remote host over `ssh` in batch mode.
#[derive(Debug, Clone)]
pub struct SshRunner {
    remote: RemoteConfig,
}

impl SshRunner {
    pub fn new(remote: RemoteConfig) -> Self {
        Self { remote }
    }

    fn destination(&self) -> String {
        match &self.remote.user {
            Some(user) => format!("{user}@{}", self.remote.host),
            None => self.remote.host.clone(),
        }
    }

    /// Arguments passed to `ssh` for `command`.
    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(port) = self.remote.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.remote.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(self.destination());
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

impl ProcessRunner for SshRunner {
    fn run<'a>(&'a self, command: &'a str, timeout: Duration) -> RunFuture<'a> {
        Box::pin(async move {
            let mut cmd = Command::new("ssh");
            cmd.args(self.ssh_args(command));
            let output = execute(cmd, command, timeout).await?;
            if output.exit_code == SSH_CONNECTION_FAILURE {
                return Err(RunnerError::Unreachable {
                    host: self.remote.host.clone(),
                    detail: output.stderr.trim().to_string(),
                });
            }
            Ok(output)
        })
    }
}

async fn execute(mut cmd: Command, command: &str, timeout: Duration) -> Result<CommandOutput, RunnerError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        command: command.to_string(),
        source,
    })?;

    debug!(%command, timeout_ms = timeout.as_millis() as u64, "running command");
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let result = CommandOutput {
                // Killed by a signal: no exit code.
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            if !result.success() {
                debug!(%command, exit_code = result.exit_code, "command exited non-zero");
            }
            Ok(result)
        }
        Ok(Err(source)) => Err(RunnerError::Spawn {
            command: command.to_string(),
            source,
        }),
        Err(_) => {
            warn!(%command, timeout_ms = timeout.as_millis() as u64, "command timed out");
            Err(RunnerError::Timeout {
                command: command.to_string(),
                timeout,
            })
        }
    }
}

/// SSH when `[rollback.remote]` is configured, local shell otherwise.
pub fn runner_from_config(config: &RollbackConfig) -> Arc<dyn ProcessRunner> {
    match &config.remote {
        Some(remote) => Arc::new(SshRunner::new(remote.clone())),
        None => Arc::new(LocalRunner),
    }
}

// ── Scripted runner ───────────────────────────────────────────────

enum Scripted {
    Output(CommandOutput),
    Unreachable,
}

struct Rule {
    prefix: String,
    reply: Scripted,
    delay: Option<Duration>,
}

/// Runner with canned replies, matched by command prefix. Records every
/// command it receives. Unmatched commands succeed with empty output.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    rules: Arc<Mutex<Vec<Rule>>>,
    calls: Arc<Mutex<VecDeque<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to commands starting with `prefix`.
    pub fn respond(self, prefix: &str, output: CommandOutput) -> Self {
        self.push(prefix, Scripted::Output(output), None)
    }

    /// Reply after `delay`.
    pub fn respond_after(self, prefix: &str, output: CommandOutput, delay: Duration) -> Self {
        self.push(prefix, Scripted::Output(output), Some(delay))
    }

    /// Fail commands starting with `prefix` as if the host were down.
    pub fn unreachable(self, prefix: &str) -> Self {
        self.push(prefix, Scripted::Unreachable, None)
    }

    fn push(self, prefix: &str, reply: Scripted, delay: Option<Duration>) -> Self {
        self.rules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Rule {
                prefix: prefix.to_string(),
                reply,
                delay,
            });
        self
    }

    /// Commands received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Whether any received command starts with `prefix`.
    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run<'a>(&'a self, command: &'a str, _timeout: Duration) -> RunFuture<'a> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push_back(command.to_string());

            let (reply, delay) = {
                let rules = self.rules.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                match rules.iter().find(|r| command.starts_with(&r.prefix)) {
                    Some(rule) => (
                        match &rule.reply {
                            Scripted::Output(output) => Ok(output.clone()),
                            Scripted::Unreachable => Err(()),
                        },
                        rule.delay,
                    ),
                    None => (Ok(CommandOutput::default()), None),
                }
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            reply.map_err(|()| RunnerError::Unreachable {
                host: "scripted".to_string(),
                detail: format!("no route for `{command}`"),
            })
        })
    }
}
