//! Run API Handlers
//!
//! HTTP endpoints for creating and inspecting runs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use caravel_core::domain::run::{DeployConfig, Run};
use caravel_core::domain::trigger::Trigger;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::repository::run as run_repository;
use crate::service::run as run_service;

/// POST /api/runs
/// Queue a run for a parsed push event
pub async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<CreateRunResponse>)> {
    tracing::info!(app_id = %req.app_id, stage = %req.config.stage, "creating run");

    let run_id = run_service::create_run(
        &state.pool,
        &state.deps,
        run_service::CreateRun {
            workspace_id: req.workspace_id,
            app_id: req.app_id,
            trigger: req.trigger,
            config: req.config,
        },
    )
    .await?;

    let status = if run_id.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(CreateRunResponse { run_id })))
}

/// GET /api/runs/{id}
/// Get run details by ID
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<WorkspaceQuery>,
) -> ApiResult<Json<Run>> {
    let run = run_service::get_run(&state.pool, query.workspace_id, id).await?;
    Ok(Json(run))
}

/// GET /api/stages/{id}/runs
/// List a stage's queued and active runs, oldest first
pub async fn list_incomplete_runs(
    State(state): State<AppState>,
    Path(stage_id): Path<Uuid>,
    Query(query): Query<WorkspaceQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    let runs =
        run_repository::incomplete_by_stage(&state.pool, query.workspace_id, stage_id).await?;
    Ok(Json(runs))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub workspace_id: Uuid,
    pub app_id: Uuid,
    pub trigger: Trigger,
    pub config: DeployConfig,
}

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    /// Absent when no run config targets the pushed stage
    pub run_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceQuery {
    pub workspace_id: Uuid,
}
