pub mod health;
pub mod jobs;
pub mod queues;
pub mod scheduler;

use crate::state::AppState;
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router with all routes
pub fn create_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::liveness))
        .route("/health/summary", get(health::summary))
        .nest("/api/v1", api_v1_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .merge(jobs::router())
        .merge(queues::router())
        .merge(scheduler::router())
}
