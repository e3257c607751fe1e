use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create apps table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS apps (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            name VARCHAR(255) NOT NULL,
            time_created TIMESTAMPTZ NOT NULL,
            UNIQUE (workspace_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create aws_accounts table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aws_accounts (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            account_id VARCHAR(12) NOT NULL,
            time_created TIMESTAMPTZ NOT NULL,
            UNIQUE (workspace_id, account_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create stages table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stages (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            app_id UUID NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            region VARCHAR(255) NOT NULL,
            aws_account_id UUID REFERENCES aws_accounts(id) ON DELETE SET NULL,
            time_created TIMESTAMPTZ NOT NULL,
            UNIQUE (workspace_id, app_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create app_repos table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS app_repos (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            app_id UUID NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
            repo_owner VARCHAR(255) NOT NULL,
            repo_name VARCHAR(255) NOT NULL,
            time_created TIMESTAMPTZ NOT NULL,
            UNIQUE (workspace_id, app_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create run_configs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_configs (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            app_id UUID NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
            stage_pattern VARCHAR(255) NOT NULL,
            aws_account_external_id VARCHAR(12) NOT NULL,
            env JSONB NOT NULL DEFAULT '{}',
            time_created TIMESTAMPTZ NOT NULL,
            time_updated TIMESTAMPTZ NOT NULL,
            UNIQUE (workspace_id, app_id, stage_pattern)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create state_updates table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS state_updates (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            stage_id UUID NOT NULL,
            run_id UUID,
            command VARCHAR(50) NOT NULL,
            error TEXT,
            time_created TIMESTAMPTZ NOT NULL,
            time_completed TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create runs table.
    // The UNIQUE constraint on (workspace_id, stage_id, active) is the
    // single-active-run lock: queued and completed runs keep active = NULL
    // (distinct under postgres uniqueness), so only the TRUE slot is
    // contended and concurrent activations surface as unique violations.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            stage_id UUID NOT NULL REFERENCES stages(id) ON DELETE CASCADE,
            state_update_id UUID NOT NULL,
            trigger JSONB NOT NULL,
            config JSONB NOT NULL,
            active BOOLEAN,
            log JSONB,
            error TEXT,
            time_created TIMESTAMPTZ NOT NULL,
            time_updated TIMESTAMPTZ NOT NULL,
            time_started TIMESTAMPTZ,
            time_completed TIMESTAMPTZ,
            UNIQUE (workspace_id, stage_id, active)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create runners table. The identity key is deliberately not unique;
    // creation races are resolved by the registry's bounded wait.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runners (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            aws_account_id UUID NOT NULL REFERENCES aws_accounts(id) ON DELETE CASCADE,
            app_repo_id UUID NOT NULL REFERENCES app_repos(id) ON DELETE CASCADE,
            region VARCHAR(255) NOT NULL,
            engine VARCHAR(50) NOT NULL,
            runner_type VARCHAR(255) NOT NULL,
            resource JSONB,
            warmer VARCHAR(255),
            time_run TIMESTAMPTZ,
            time_created TIMESTAMPTZ NOT NULL,
            time_updated TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create runner_usages table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runner_usages (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            runner_id UUID NOT NULL REFERENCES runners(id) ON DELETE CASCADE,
            stage_id UUID NOT NULL,
            time_run TIMESTAMPTZ NOT NULL,
            UNIQUE (workspace_id, runner_id, stage_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for the hot lookups
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_runs_stage_incomplete
         ON runs(workspace_id, stage_id, time_created)
         WHERE time_completed IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_runners_identity
         ON runners(workspace_id, aws_account_id, app_repo_id, region, engine, runner_type)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_runner_usages_recency
         ON runner_usages(workspace_id, runner_id, time_run)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
