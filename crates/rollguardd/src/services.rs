//! Wiring: configuration in, store + probe sets + orchestrator out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use rollguard_api::AppState;
use rollguard_breaker::BreakerSettings;
use rollguard_core::RollguardConfig;
use rollguard_health::{HealthAggregator, ProbeFactory};
use rollguard_rollback::{
    OrchestratorSettings, RollbackOrchestrator, runner_from_config, sink_from_config,
};
use rollguard_state::{KvStore, MemoryStore, RedbStore};
use tokio::sync::watch;
use tracing::{info, warn};

pub const DB_FILE: &str = "rollguard.redb";

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE)
}

/// Open the redb store under `data_dir`, creating the directory.
pub fn open_store(data_dir: &Path) -> anyhow::Result<RedbStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let path = db_path(data_dir);
    let store = RedbStore::open(&path).with_context(|| format!("opening {}", path.display()))?;
    info!(path = %path.display(), "state store opened");
    Ok(store)
}

/// Store for one-shot commands. A running `serve` holds the redb file
/// lock, so fall back to process-local circuits when it is taken.
pub fn open_shared_store(data_dir: &Path) -> Arc<dyn KvStore> {
    match open_store(data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "state store unavailable, circuits are process-local");
            Arc::new(MemoryStore::new())
        }
    }
}

pub struct Services {
    pub config: RollguardConfig,
    pub store: Arc<dyn KvStore>,
    pub factory: ProbeFactory,
    pub orchestrator: Option<Arc<RollbackOrchestrator>>,
}

impl Services {
    pub fn assemble(config: RollguardConfig, store: Arc<dyn KvStore>) -> Self {
        let factory = ProbeFactory::new(&config, Arc::clone(&store));
        let orchestrator = config.rollback.commands.clone().map(|commands| {
            Arc::new(
                RollbackOrchestrator::new(
                    runner_from_config(&config.rollback),
                    commands,
                    factory.post_rollback_verification(),
                    sink_from_config(config.notify.as_ref(), &config.rollback),
                )
                .with_settings(OrchestratorSettings::from(&config.rollback)),
            )
        });
        if orchestrator.is_none() {
            warn!("[rollback.commands] not configured, rollback disabled");
        }
        Self {
            config,
            store,
            factory,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> anyhow::Result<Arc<RollbackOrchestrator>> {
        self.orchestrator
            .clone()
            .context("rollback requires [rollback.commands] in the configuration")
    }

    pub fn app_state(&self, shutdown: watch::Receiver<bool>) -> AppState {
        AppState {
            store: Arc::clone(&self.store),
            breaker: BreakerSettings::from(&self.config.breaker),
            aggregator: HealthAggregator::new(),
            deployment: self.factory.deployment_health(),
            orchestrator: self.orchestrator.clone(),
            shutdown,
        }
    }
}
