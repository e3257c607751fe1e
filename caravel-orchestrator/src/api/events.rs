//! Event Handlers
//!
//! Endpoints the event bus delivers control-plane signals to. Each handler is
//! stateless; re-delivery is safe because the underlying services are
//! idempotent.

use axum::{Json, extract::State, http::StatusCode};

use caravel_core::event::{AccountLinked, RunCreated, RunnerCompleted, RunnerStarted};

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::repository::{app as app_repository, run as run_repository};
use crate::service::run as run_service;

/// POST /events/run-created
/// A run was queued; try to dispatch the stage's queue
pub async fn run_created(
    State(state): State<AppState>,
    Json(event): Json<RunCreated>,
) -> ApiResult<StatusCode> {
    tracing::info!(run_id = %event.run_id, stage_id = %event.stage_id, "run.created received");

    run_service::orchestrate(&state.pool, &state.deps, event.workspace_id, event.stage_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /events/account-linked
/// A customer account became usable; retry stages that were blocked on it
pub async fn account_linked(
    State(state): State<AppState>,
    Json(event): Json<AccountLinked>,
) -> ApiResult<StatusCode> {
    tracing::info!(account = %event.aws_account_id, "account.linked received");

    let account =
        app_repository::link_aws_account(&state.pool, event.workspace_id, &event.aws_account_id)
            .await?;

    let stage_ids = app_repository::stages_with_pending_runs_for_account(
        &state.pool,
        event.workspace_id,
        account.id,
    )
    .await?;
    for stage_id in stage_ids {
        run_service::orchestrate(&state.pool, &state.deps, event.workspace_id, stage_id).await?;
    }

    Ok(StatusCode::NO_CONTENT)
}

/// POST /events/runner-started
/// The remote runner picked the run up
pub async fn runner_started(
    State(state): State<AppState>,
    Json(event): Json<RunnerStarted>,
) -> ApiResult<StatusCode> {
    tracing::info!(run_id = %event.run_id, "runner.started received");

    run_service::mark_started(&state.pool, event).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /events/runner-completed
/// The remote runner finished, successfully or not
pub async fn runner_completed(
    State(state): State<AppState>,
    Json(event): Json<RunnerCompleted>,
) -> ApiResult<StatusCode> {
    tracing::info!(run_id = %event.run_id, error = ?event.error, "runner.completed received");

    run_service::complete(
        &state.pool,
        &state.deps,
        event.workspace_id,
        event.run_id,
        event.error,
    )
    .await?;

    // the freed active slot may unblock a queued run
    if let Some(run) =
        run_repository::find_by_id(&state.pool, event.workspace_id, event.run_id).await?
    {
        run_service::orchestrate(&state.pool, &state.deps, event.workspace_id, run.stage_id)
            .await?;
    }

    Ok(StatusCode::NO_CONTENT)
}
