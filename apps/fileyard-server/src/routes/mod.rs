//! Route modules for the Fileyard server

pub mod files;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Build the application router
pub fn router(state: AppState) -> Router {
    let max_request_bytes = state.config().upload.max_request_bytes;

    Router::new()
        .nest("/health", health::router())
        .nest("/api/v1/health", health::router())
        .nest("/api/v1/files", files::router(max_request_bytes))
        .with_state(state)
}
