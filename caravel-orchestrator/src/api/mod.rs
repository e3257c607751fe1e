//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod events;
pub mod health;
pub mod hooks;
pub mod run;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::service::Deps;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub deps: Arc<Deps>,
}

/// Create the main API router with all endpoints
pub fn create_router(pool: PgPool, deps: Arc<Deps>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Run endpoints
        .route("/api/runs", post(run::create_run))
        .route("/api/runs/{id}", get(run::get_run))
        .route("/api/stages/{id}/runs", get(run::list_incomplete_runs))
        // Event-bus signals
        .route("/events/run-created", post(events::run_created))
        .route("/events/account-linked", post(events::account_linked))
        .route("/events/runner-started", post(events::runner_started))
        .route("/events/runner-completed", post(events::runner_completed))
        // Scheduled triggers
        .route("/hooks/run-timeout", post(hooks::run_timeout))
        .route("/hooks/runner-warmer", post(hooks::runner_warmer))
        .route("/hooks/runner-remover", post(hooks::runner_remover))
        // Add state and middleware
        .with_state(AppState { pool, deps })
        .layer(TraceLayer::new_for_http())
}
