mod error;
mod rest;
mod types;

pub use error::{status_for, ApiError, ApiResult};
pub use rest::AppState;
pub use types::*;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the complete HTTP surface
pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    // Configure CORS to allow frontend requests
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    rest::routes()
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
