//! App, stage, repo-link and account repositories
//!
//! Lookup contracts the orchestrator consumes while resolving a run's target.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// A deploy target of an app
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Stage {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub app_id: Uuid,
    pub name: String,
    pub region: String,
    pub aws_account_id: Option<Uuid>,
}

/// Link between an app and its git repository
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppRepo {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub app_id: Uuid,
    pub repo_owner: String,
    pub repo_name: String,
}

/// A customer AWS account linked to the workspace
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AwsAccount {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub account_id: String,
}

pub async fn stage_by_id(
    pool: &PgPool,
    workspace_id: Uuid,
    stage_id: Uuid,
) -> Result<Option<Stage>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, workspace_id, app_id, name, region, aws_account_id
        FROM stages
        WHERE workspace_id = $1 AND id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(stage_id)
    .fetch_optional(pool)
    .await
}

pub async fn stage_by_name(
    pool: &PgPool,
    workspace_id: Uuid,
    app_id: Uuid,
    name: &str,
) -> Result<Option<Stage>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, workspace_id, app_id, name, region, aws_account_id
        FROM stages
        WHERE workspace_id = $1 AND app_id = $2 AND name = $3
        "#,
    )
    .bind(workspace_id)
    .bind(app_id)
    .bind(name)
    .fetch_optional(pool)
    .await
}

/// Create the stage if it does not exist yet and return its id
pub async fn connect_stage(
    pool: &PgPool,
    workspace_id: Uuid,
    app_id: Uuid,
    name: &str,
    region: &str,
    aws_account_id: Uuid,
) -> Result<Uuid, sqlx::Error> {
    let now: DateTime<Utc> = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO stages (id, workspace_id, app_id, name, region, aws_account_id, time_created)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (workspace_id, app_id, name) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(workspace_id)
    .bind(app_id)
    .bind(name)
    .bind(region)
    .bind(aws_account_id)
    .bind(now)
    .execute(pool)
    .await?;

    let stage = stage_by_name(pool, workspace_id, app_id, name).await?;
    stage.map(|s| s.id).ok_or(sqlx::Error::RowNotFound)
}

pub async fn app_repo_by_app(
    pool: &PgPool,
    workspace_id: Uuid,
    app_id: Uuid,
) -> Result<Option<AppRepo>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, workspace_id, app_id, repo_owner, repo_name
        FROM app_repos
        WHERE workspace_id = $1 AND app_id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(app_id)
    .fetch_optional(pool)
    .await
}

pub async fn app_repo_by_id(
    pool: &PgPool,
    workspace_id: Uuid,
    app_repo_id: Uuid,
) -> Result<Option<AppRepo>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, workspace_id, app_id, repo_owner, repo_name
        FROM app_repos
        WHERE workspace_id = $1 AND id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(app_repo_id)
    .fetch_optional(pool)
    .await
}

pub async fn aws_account_by_id(
    pool: &PgPool,
    workspace_id: Uuid,
    account_id: Uuid,
) -> Result<Option<AwsAccount>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, workspace_id, account_id
        FROM aws_accounts
        WHERE workspace_id = $1 AND id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(account_id)
    .fetch_optional(pool)
    .await
}

pub async fn aws_account_by_external_id(
    pool: &PgPool,
    workspace_id: Uuid,
    external_id: &str,
) -> Result<Option<AwsAccount>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, workspace_id, account_id
        FROM aws_accounts
        WHERE workspace_id = $1 AND account_id = $2
        "#,
    )
    .bind(workspace_id)
    .bind(external_id)
    .fetch_optional(pool)
    .await
}

/// Record a newly linked account and return its row
pub async fn link_aws_account(
    pool: &PgPool,
    workspace_id: Uuid,
    external_id: &str,
) -> Result<AwsAccount, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO aws_accounts (id, workspace_id, account_id, time_created)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (workspace_id, account_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(workspace_id)
    .bind(external_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    let account = aws_account_by_external_id(pool, workspace_id, external_id).await?;
    account.ok_or(sqlx::Error::RowNotFound)
}

/// Stages deploying into the account that still have undispatched runs
pub async fn stages_with_pending_runs_for_account(
    pool: &PgPool,
    workspace_id: Uuid,
    aws_account_id: Uuid,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT s.id
        FROM stages s
        JOIN runs r ON r.workspace_id = s.workspace_id AND r.stage_id = s.id
        WHERE s.workspace_id = $1 AND s.aws_account_id = $2 AND r.time_completed IS NULL
        "#,
    )
    .bind(workspace_id)
    .bind(aws_account_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
