//! rollguard.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;

/// Errors raised while loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollguardConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Probe endpoints keyed by probe name (`database`, `cache`, ...).
    #[serde(default)]
    pub probes: BTreeMap<String, ProbeConfig>,
    #[serde(default)]
    pub rollback: RollbackConfig,
    pub notify: Option<NotifyConfig>,
    #[serde(default)]
    pub guard: GuardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Some("0.0.0.0:8080".to_string()),
            data_dir: Some(PathBuf::from("/var/lib/rollguard")),
        }
    }
}

impl ServerConfig {
    pub fn listen(&self) -> &str {
        self.listen.as_deref().unwrap_or("0.0.0.0:8080")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/lib/rollguard"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: Option<u32>,
    pub open_duration: Option<String>,
}

impl BreakerConfig {
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold.unwrap_or(5)
    }

    pub fn open_duration(&self) -> Duration {
        duration_or(self.open_duration.as_deref(), Duration::from_secs(60))
    }
}

/// How a probe reaches its dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Tcp,
    Http,
    Tls,
}

/// Status reported by a breaker-guarded probe while its circuit is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStatus {
    #[default]
    Degraded,
    Unhealthy,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub kind: ProbeKind,
    /// `host:port` for TCP probes.
    pub address: Option<String>,
    /// Full URL for HTTP probes (`http://` only).
    pub url: Option<String>,
    /// TLS server name.
    pub host: Option<String>,
    /// TLS port, 443 when absent.
    pub port: Option<u16>,
    pub timeout: Option<String>,
    /// Route the probe through a circuit breaker keyed by its name.
    pub guarded: Option<bool>,
    pub fallback: Option<FallbackStatus>,
    /// Certificates expiring within this many days report degraded.
    pub warn_days: Option<u32>,
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        duration_or(self.timeout.as_deref(), Duration::from_secs(5))
    }

    pub fn guarded(&self) -> bool {
        self.guarded.unwrap_or(false)
    }

    pub fn fallback(&self) -> FallbackStatus {
        self.fallback.unwrap_or_default()
    }

    pub fn warn_days(&self) -> u32 {
        self.warn_days.unwrap_or(14)
    }

    pub fn tls_port(&self) -> u16 {
        self.port.unwrap_or(443)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let missing = |field: &str| {
            ConfigError::Invalid(format!("probe `{name}` ({:?}) requires `{field}`", self.kind))
        };
        match self.kind {
            ProbeKind::Tcp if self.address.is_none() => return Err(missing("address")),
            ProbeKind::Http if self.url.is_none() => return Err(missing("url")),
            _ => {}
        }
        if let Some(url) = &self.url {
            if !url.starts_with("http://") {
                return Err(ConfigError::Invalid(format!(
                    "probe `{name}`: only http:// URLs are supported, got {url}"
                )));
            }
        }
        check_duration(&format!("probes.{name}.timeout"), self.timeout.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackConfig {
    pub settle_delay: Option<String>,
    pub command_timeout: Option<String>,
    pub notify_timeout: Option<String>,
    pub remote: Option<RemoteConfig>,
    pub commands: Option<CommandTemplates>,
}

impl RollbackConfig {
    pub fn settle_delay(&self) -> Duration {
        duration_or(self.settle_delay.as_deref(), Duration::from_secs(10))
    }

    pub fn command_timeout(&self) -> Duration {
        duration_or(self.command_timeout.as_deref(), Duration::from_secs(300))
    }

    pub fn notify_timeout(&self) -> Duration {
        duration_or(self.notify_timeout.as_deref(), Duration::from_secs(10))
    }
}

/// SSH target hosting the process manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

/// Remote commands; `{app}` and `{release}` are substituted before running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTemplates {
    /// Prints one release per line, most recent first.
    pub list_releases: String,
    pub stop: String,
    pub rebuild: String,
}

impl CommandTemplates {
    /// Substitute `{app}` and `{release}` placeholders.
    pub fn render(template: &str, app: &str, release: Option<&str>) -> String {
        let rendered = template.replace("{app}", app);
        match release {
            Some(release) => rendered.replace("{release}", release),
            None => rendered,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    pub checks: Option<u32>,
    pub interval: Option<String>,
    pub unhealthy_threshold: Option<u32>,
}

impl GuardConfig {
    pub fn checks(&self) -> u32 {
        self.checks.unwrap_or(3)
    }

    pub fn interval(&self) -> Duration {
        duration_or(self.interval.as_deref(), Duration::from_secs(5))
    }

    pub fn unhealthy_threshold(&self) -> u32 {
        self.unhealthy_threshold.unwrap_or(2)
    }
}

impl RollguardConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RollguardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would only fail later at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == Some(0) {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        check_duration("breaker.open_duration", self.breaker.open_duration.as_deref())?;

        for (name, probe) in &self.probes {
            probe.validate(name)?;
        }

        check_duration("rollback.settle_delay", self.rollback.settle_delay.as_deref())?;
        check_duration("rollback.command_timeout", self.rollback.command_timeout.as_deref())?;
        check_duration("rollback.notify_timeout", self.rollback.notify_timeout.as_deref())?;
        if let Some(commands) = &self.rollback.commands {
            for (field, value) in [
                ("list_releases", &commands.list_releases),
                ("stop", &commands.stop),
                ("rebuild", &commands.rebuild),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "rollback.commands.{field} must not be empty"
                    )));
                }
            }
            if !commands.rebuild.contains("{release}") {
                return Err(ConfigError::Invalid(
                    "rollback.commands.rebuild must reference {release}".to_string(),
                ));
            }
        }

        check_duration("guard.interval", self.guard.interval.as_deref())?;
        if self.guard.unhealthy_threshold == Some(0) {
            return Err(ConfigError::Invalid(
                "guard.unhealthy_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn duration_or(value: Option<&str>, default: Duration) -> Duration {
    value.and_then(parse_duration).unwrap_or(default)
}

fn check_duration(field: &str, value: Option<&str>) -> Result<(), ConfigError> {
    match value {
        Some(v) if parse_duration(v).is_none() => Err(ConfigError::Invalid(format!(
            "{field}: cannot parse duration {v:?}"
        ))),
        _ => Ok(()),
    }
}
