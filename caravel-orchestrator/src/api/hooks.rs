//! Scheduled-trigger Handlers
//!
//! Endpoints the scheduler invokes. Payloads are the plain JSON documents the
//! schedule was registered with.

use axum::{Json, extract::State, http::StatusCode};

use caravel_core::event::{RunTimeout, RunnerRemover, RunnerWarmer};

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::repository::run as run_repository;
use crate::service::{run as run_service, runner as runner_service};

/// POST /hooks/run-timeout
/// One-shot watchdog for a run's deadline
pub async fn run_timeout(
    State(state): State<AppState>,
    Json(event): Json<RunTimeout>,
) -> ApiResult<StatusCode> {
    tracing::info!(run_id = %event.run_id, "run timeout check");

    let workspace_id = event.workspace_id;
    let run_id = event.run_id;
    run_service::handle_timeout(&state.pool, &state.deps, event).await?;

    // a timed-out run frees the stage's active slot
    if let Some(run) = run_repository::find_by_id(&state.pool, workspace_id, run_id).await? {
        run_service::orchestrate(&state.pool, &state.deps, workspace_id, run.stage_id).await?;
    }

    Ok(StatusCode::NO_CONTENT)
}

/// POST /hooks/runner-warmer
/// Keep a runner's compute hot while it is in use
pub async fn runner_warmer(
    State(state): State<AppState>,
    Json(event): Json<RunnerWarmer>,
) -> ApiResult<StatusCode> {
    tracing::debug!(runner_id = %event.runner_id, "runner warm tick");

    runner_service::handle_warmer(&state.pool, &state.deps, event).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /hooks/runner-remover
/// Tear down a runner nobody has used for the inactivity window
pub async fn runner_remover(
    State(state): State<AppState>,
    Json(event): Json<RunnerRemover>,
) -> ApiResult<StatusCode> {
    tracing::info!(runner_id = %event.runner_id, "runner idle check");

    runner_service::handle_remover(&state.pool, &state.deps, event).await?;

    Ok(StatusCode::NO_CONTENT)
}
