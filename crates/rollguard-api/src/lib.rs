//! rollguard-api: HTTP surface for the deployment guard.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Health document for the deployment set (200 / 503) |
//! | POST | `/api/v1/apps/{app_id}/rollback` | Trigger a manual rollback |
//! | GET | `/api/v1/circuits/{key}` | Circuit breaker snapshot |
//! | DELETE | `/api/v1/circuits/{key}` | Reset a circuit |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use rollguard_breaker::BreakerSettings;
use rollguard_health::{HealthAggregator, ProbeSet};
use rollguard_rollback::RollbackOrchestrator;
use rollguard_state::KvStore;
use tokio::sync::watch;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KvStore>,
    pub breaker: BreakerSettings,
    pub aggregator: HealthAggregator,
    /// Probe set behind `/health`.
    pub deployment: ProbeSet,
    /// `None` when `[rollback.commands]` is not configured.
    pub orchestrator: Option<Arc<RollbackOrchestrator>>,
    /// Flips to `true` on shutdown; handed to rollbacks as their cancel signal.
    pub shutdown: watch::Receiver<bool>,
}

/// Build the complete API router.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/apps/{app_id}/rollback", post(handlers::trigger_rollback))
        .route(
            "/circuits/{key}",
            get(handlers::get_circuit).delete(handlers::reset_circuit),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api_routes)
        .with_state(state)
}
