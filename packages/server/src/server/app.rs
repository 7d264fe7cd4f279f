//! Application router and shared state.

use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::kernel::ServerDeps;
use crate::server::routes;

#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<ServerDeps>,
}

/// Build the HTTP router over an already-wired dependency set.
///
/// Background services (worker pool, scheduler, metrics publisher) are
/// spawned by the binary, not here, so tests can drive routes against
/// in-memory dependencies without side tasks.
pub fn build_app(deps: Arc<ServerDeps>, allowed_origins: &[String]) -> Router {
    let state = AppState { deps };

    let cors = cors_layer(allowed_origins);

    Router::new()
        // Task queue
        .route("/tasks", get(routes::tasks::list).post(routes::tasks::create))
        .route("/tasks/stats", get(routes::tasks::stats))
        .route("/tasks/history", get(routes::tasks::history))
        .route("/tasks/health", get(routes::tasks::health))
        .route("/tasks/{id}", get(routes::tasks::get_one))
        .route("/tasks/{id}/cancel", post(routes::tasks::cancel))
        // High-level shortcuts
        .route("/tasks/export/parquet", post(routes::tasks::export_parquet))
        .route("/tasks/pipeline/execute", post(routes::tasks::pipeline_execute))
        .route("/tasks/sync/data", post(routes::tasks::sync_data))
        .route("/tasks/cache/refresh", post(routes::tasks::cache_refresh))
        // Scheduler
        .route(
            "/tasks/scheduled",
            get(routes::scheduled::list).post(routes::scheduled::create),
        )
        .route("/tasks/scheduled/{id}", delete(routes::scheduled::remove))
        .route("/tasks/scheduled/{id}/trigger", post(routes::scheduled::trigger))
        .route("/tasks/scheduled/{id}/enable", post(routes::scheduled::enable))
        // Ticket data
        .route("/modal/data/{table}/{sys_id}", get(routes::tickets::data))
        .route("/modal/ticket/{table}/{sys_id}", put(routes::tickets::update))
        .route(
            "/modal/refresh/{section}/{table}/{sys_id}",
            get(routes::tickets::refresh_section),
        )
        // Real-time streams
        .route("/events/ticket-updates/{sys_id}", get(routes::events::ticket_updates))
        .route("/events/performance", get(routes::events::performance))
        // Liveness
        .route("/health", get(routes::health::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}
