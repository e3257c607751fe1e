//! Run repository
//!
//! Handles all database operations related to runs.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use caravel_core::domain::run::{DeployConfig, LogPointer, Run};
use caravel_core::domain::trigger::Trigger;

/// Fields for a new queued run
#[derive(Debug)]
pub struct NewRun {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub stage_id: Uuid,
    pub state_update_id: Uuid,
    pub trigger: Trigger,
    pub config: DeployConfig,
}

/// Insert a queued run (active = NULL, not completed)
pub async fn create(conn: &mut PgConnection, new: NewRun) -> Result<(), sqlx::Error> {
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO runs (id, workspace_id, stage_id, state_update_id, trigger, config,
                          time_created, time_updated)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
        "#,
    )
    .bind(new.id)
    .bind(new.workspace_id)
    .bind(new.stage_id)
    .bind(new.state_update_id)
    .bind(Json(&new.trigger))
    .bind(Json(&new.config))
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

/// Find a run by ID
pub async fn find_by_id(
    pool: &PgPool,
    workspace_id: Uuid,
    run_id: Uuid,
) -> Result<Option<Run>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, workspace_id, stage_id, state_update_id, trigger, config, active,
               log, error, time_created, time_updated, time_started, time_completed
        FROM runs
        WHERE workspace_id = $1 AND id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// All runs for a stage that have not reached a terminal state, oldest first
pub async fn incomplete_by_stage(
    pool: &PgPool,
    workspace_id: Uuid,
    stage_id: Uuid,
) -> Result<Vec<Run>, sqlx::Error> {
    let rows = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, workspace_id, stage_id, state_update_id, trigger, config, active,
               log, error, time_created, time_updated, time_started, time_completed
        FROM runs
        WHERE workspace_id = $1 AND stage_id = $2 AND time_completed IS NULL
        ORDER BY time_created ASC
        "#,
    )
    .bind(workspace_id)
    .bind(stage_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Claim a run for dispatch
///
/// Raises a unique violation when another process holds the stage's active
/// slot through a different run; returns 0 when this run was already claimed
/// or completed. The caller backs off in both cases.
pub async fn mark_active(
    conn: &mut PgConnection,
    workspace_id: Uuid,
    run_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET active = TRUE, time_updated = $3
        WHERE workspace_id = $1 AND id = $2 AND active IS NULL AND time_completed IS NULL
        "#,
    )
    .bind(workspace_id)
    .bind(run_id)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Complete superseded runs with no error
pub async fn skip(
    conn: &mut PgConnection,
    workspace_id: Uuid,
    run_ids: &[Uuid],
    time_completed: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runs
        SET time_completed = $3, time_updated = $3
        WHERE workspace_id = $1 AND id = ANY($2) AND time_completed IS NULL
        "#,
    )
    .bind(workspace_id)
    .bind(run_ids)
    .bind(time_completed)
    .execute(conn)
    .await?;

    Ok(())
}

/// Transition a run to its terminal state
///
/// Guarded by `time_completed IS NULL`: of any number of concurrent callers
/// exactly one observes `rows_affected == 1`, the rest no-op without
/// overwriting the first writer's error.
pub async fn complete(
    conn: &mut PgConnection,
    workspace_id: Uuid,
    run_id: Uuid,
    error: Option<&str>,
    time_completed: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET time_completed = $3, time_updated = $3, error = $4, active = NULL
        WHERE workspace_id = $1 AND id = $2 AND time_completed IS NULL
        "#,
    )
    .bind(workspace_id)
    .bind(run_id)
    .bind(time_completed)
    .bind(error)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// Record the runner-side start signal and its log pointer
pub async fn mark_started(
    pool: &PgPool,
    workspace_id: Uuid,
    run_id: Uuid,
    log: &LogPointer,
) -> Result<(), sqlx::Error> {
    let now = Utc::now();

    sqlx::query(
        r#"
        UPDATE runs
        SET time_started = $3, time_updated = $3, log = $4
        WHERE workspace_id = $1 AND id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(run_id)
    .bind(now)
    .bind(Json(log))
    .execute(pool)
    .await?;

    Ok(())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    workspace_id: Uuid,
    stage_id: Uuid,
    state_update_id: Uuid,
    trigger: Json<Trigger>,
    config: Json<DeployConfig>,
    active: Option<bool>,
    log: Option<Json<LogPointer>>,
    error: Option<String>,
    time_created: DateTime<Utc>,
    time_updated: DateTime<Utc>,
    time_started: Option<DateTime<Utc>>,
    time_completed: Option<DateTime<Utc>>,
}

impl From<RunRow> for Run {
    fn from(row: RunRow) -> Self {
        Run {
            id: row.id,
            workspace_id: row.workspace_id,
            stage_id: row.stage_id,
            state_update_id: row.state_update_id,
            trigger: row.trigger.0,
            config: row.config.0,
            active: row.active,
            log: row.log.map(|log| log.0),
            error: row.error,
            time_created: row.time_created,
            time_updated: row.time_updated,
            time_started: row.time_started,
            time_completed: row.time_completed,
        }
    }
}
