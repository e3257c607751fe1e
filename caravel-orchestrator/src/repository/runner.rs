//! Runner repository
//!
//! Handles all database operations related to runners and their usage
//! records.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use caravel_core::domain::runner::{Engine, Resource, Runner};

/// Identity key a runner is looked up by
#[derive(Debug, Clone)]
pub struct RunnerKey {
    pub workspace_id: Uuid,
    pub aws_account_id: Uuid,
    pub app_repo_id: Uuid,
    pub region: String,
    pub engine: Engine,
    pub runner_type: String,
}

/// Find the runner matching an identity key
pub async fn lookup(pool: &PgPool, key: &RunnerKey) -> Result<Option<Runner>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunnerRow>(
        r#"
        SELECT id, workspace_id, aws_account_id, app_repo_id, region, engine, runner_type,
               resource, warmer, time_run, time_created, time_updated
        FROM runners
        WHERE workspace_id = $1 AND aws_account_id = $2 AND app_repo_id = $3
          AND region = $4 AND engine = $5 AND runner_type = $6
        "#,
    )
    .bind(key.workspace_id)
    .bind(key.aws_account_id)
    .bind(key.app_repo_id)
    .bind(&key.region)
    .bind(key.engine.as_str())
    .bind(&key.runner_type)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Find a runner by ID
pub async fn find_by_id(
    pool: &PgPool,
    workspace_id: Uuid,
    runner_id: Uuid,
) -> Result<Option<Runner>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunnerRow>(
        r#"
        SELECT id, workspace_id, aws_account_id, app_repo_id, region, engine, runner_type,
               resource, warmer, time_run, time_created, time_updated
        FROM runners
        WHERE workspace_id = $1 AND id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(runner_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Insert a runner row with no resource yet
///
/// The placeholder claims the identity key so concurrent orchestrations wait
/// instead of provisioning a second set of cloud resources.
pub async fn insert_placeholder(
    pool: &PgPool,
    runner_id: Uuid,
    key: &RunnerKey,
) -> Result<(), sqlx::Error> {
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO runners (id, workspace_id, aws_account_id, app_repo_id, region, engine,
                             runner_type, time_created, time_updated)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
        "#,
    )
    .bind(runner_id)
    .bind(key.workspace_id)
    .bind(key.aws_account_id)
    .bind(key.app_repo_id)
    .bind(&key.region)
    .bind(key.engine.as_str())
    .bind(&key.runner_type)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Backfill the provisioned resource onto a placeholder row
pub async fn set_resource(
    pool: &PgPool,
    workspace_id: Uuid,
    runner_id: Uuid,
    resource: &Resource,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runners
        SET resource = $3, time_updated = $4
        WHERE workspace_id = $1 AND id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(runner_id)
    .bind(Json(resource))
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a runner row
pub async fn delete(pool: &PgPool, workspace_id: Uuid, runner_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM runners WHERE workspace_id = $1 AND id = $2")
        .bind(workspace_id)
        .bind(runner_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Persist the name of the runner's warm-keep schedule
pub async fn set_warmer(
    pool: &PgPool,
    workspace_id: Uuid,
    runner_id: Uuid,
    warmer: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runners
        SET warmer = $3, time_updated = $4
        WHERE workspace_id = $1 AND id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(runner_id)
    .bind(warmer)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Clear the warm-keep schedule name
pub async fn unset_warmer(
    pool: &PgPool,
    workspace_id: Uuid,
    runner_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runners
        SET warmer = NULL, time_updated = $3
        WHERE workspace_id = $1 AND id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(runner_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a dispatch: stamp the runner and upsert the per-stage usage row
pub async fn record_dispatch(
    conn: &mut PgConnection,
    workspace_id: Uuid,
    runner_id: Uuid,
    stage_id: Uuid,
    time_run: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runners
        SET time_run = $3, time_updated = $3
        WHERE workspace_id = $1 AND id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(runner_id)
    .bind(time_run)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO runner_usages (id, workspace_id, runner_id, stage_id, time_run)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (workspace_id, runner_id, stage_id) DO UPDATE SET
            time_run = EXCLUDED.time_run
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(workspace_id)
    .bind(runner_id)
    .bind(stage_id)
    .bind(time_run)
    .execute(conn)
    .await?;

    Ok(())
}

/// Number of stages that used the runner since `since`
pub async fn usage_count_since(
    pool: &PgPool,
    workspace_id: Uuid,
    runner_id: Uuid,
    since: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM runner_usages
        WHERE workspace_id = $1 AND runner_id = $2 AND time_run > $3
        "#,
    )
    .bind(workspace_id)
    .bind(runner_id)
    .bind(since)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunnerRow {
    id: Uuid,
    workspace_id: Uuid,
    aws_account_id: Uuid,
    app_repo_id: Uuid,
    region: String,
    engine: String,
    runner_type: String,
    resource: Option<Json<Resource>>,
    warmer: Option<String>,
    time_run: Option<DateTime<Utc>>,
    time_created: DateTime<Utc>,
    time_updated: DateTime<Utc>,
}

impl From<RunnerRow> for Runner {
    fn from(row: RunnerRow) -> Self {
        Runner {
            id: row.id,
            workspace_id: row.workspace_id,
            aws_account_id: row.aws_account_id,
            app_repo_id: row.app_repo_id,
            region: row.region,
            // rows are only ever written with Engine::as_str values
            engine: Engine::parse(&row.engine).unwrap_or(Engine::Lambda),
            runner_type: row.runner_type,
            resource: row.resource.map(|resource| resource.0),
            warmer: row.warmer,
            time_run: row.time_run,
            time_created: row.time_created,
            time_updated: row.time_updated,
        }
    }
}
