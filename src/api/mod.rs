pub mod cache;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub use cache::ResponseCache;

/// Assemble the public router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/orchestrator/tick", post(handlers::post_orchestrator_tick))
        .route("/orchestrator/status", get(handlers::get_orchestrator_status))
        .route("/sync-user-symbols", post(handlers::post_sync_user_symbols))
        .route("/chart-read", post(handlers::post_chart_read))
        .route("/chart-health", get(handlers::get_chart_health))
        .route("/rate-limits", get(handlers::get_rate_limits))
        .with_state(state)
}
