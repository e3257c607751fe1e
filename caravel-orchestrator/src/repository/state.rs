//! State-update repository
//!
//! Every run owns a state-update record that the dashboard's state timeline
//! renders. The record is created with the run and completed exactly when the
//! run completes.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

pub async fn create_update(
    conn: &mut PgConnection,
    id: Uuid,
    workspace_id: Uuid,
    stage_id: Uuid,
    run_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO state_updates (id, workspace_id, stage_id, run_id, command, time_created)
        VALUES ($1, $2, $3, $4, 'deploy', $5)
        "#,
    )
    .bind(id)
    .bind(workspace_id)
    .bind(stage_id)
    .bind(run_id)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

/// Complete a batch of updates; already-completed rows are untouched
pub async fn complete_updates(
    conn: &mut PgConnection,
    workspace_id: Uuid,
    update_ids: &[Uuid],
    time_completed: DateTime<Utc>,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE state_updates
        SET time_completed = $3, error = $4
        WHERE workspace_id = $1 AND id = ANY($2) AND time_completed IS NULL
        "#,
    )
    .bind(workspace_id)
    .bind(update_ids)
    .bind(time_completed)
    .bind(error)
    .execute(conn)
    .await?;

    Ok(())
}
