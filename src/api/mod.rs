//! HTTP API: router, handlers, state and server setup

pub mod handlers;
pub mod server;
pub mod state;

use axum::{routing::get, Router};

pub use server::{create_server, run_server, spawn_refresh_loop};
pub use state::{AppState, Backends};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api", get(handlers::dispatch).post(handlers::dispatch))
        // Peers that mount the API at the web root
        .route("/", get(handlers::dispatch).post(handlers::dispatch))
        .with_state(state)
}
