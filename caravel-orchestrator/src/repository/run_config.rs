//! Run-config repository
//!
//! Per-app deployment settings keyed by a stage glob pattern: which customer
//! account a stage deploys into and the environment handed to the runner.

use std::collections::HashMap;

use globset::Glob;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

/// Key carrying the customer account id inside a config's env set
pub const AWS_ACCOUNT_ENV_KEY: &str = "__AWS_ACCOUNT_ID";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub app_id: Uuid,
    pub stage_pattern: String,
    pub aws_account_external_id: String,
    pub env: HashMap<String, String>,
}

pub async fn list_by_app(
    pool: &PgPool,
    workspace_id: Uuid,
    app_id: Uuid,
) -> Result<Vec<RunConfig>, sqlx::Error> {
    let rows = sqlx::query_as::<_, RunConfigRow>(
        r#"
        SELECT id, workspace_id, app_id, stage_pattern, aws_account_external_id, env
        FROM run_configs
        WHERE workspace_id = $1 AND app_id = $2
        ORDER BY stage_pattern ASC
        "#,
    )
    .bind(workspace_id)
    .bind(app_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// First config whose stage pattern matches the stage name
pub fn match_stage<'a>(configs: &'a [RunConfig], stage_name: &str) -> Option<&'a RunConfig> {
    configs.iter().find(|config| {
        Glob::new(&config.stage_pattern)
            .map(|glob| glob.compile_matcher().is_match(stage_name))
            .unwrap_or(false)
    })
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunConfigRow {
    id: Uuid,
    workspace_id: Uuid,
    app_id: Uuid,
    stage_pattern: String,
    aws_account_external_id: String,
    env: Json<HashMap<String, String>>,
}

impl From<RunConfigRow> for RunConfig {
    fn from(row: RunConfigRow) -> Self {
        RunConfig {
            id: row.id,
            workspace_id: row.workspace_id,
            app_id: row.app_id,
            stage_pattern: row.stage_pattern,
            aws_account_external_id: row.aws_account_external_id,
            env: row.env.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pattern: &str) -> RunConfig {
        RunConfig {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            stage_pattern: pattern.to_string(),
            aws_account_external_id: "123456789012".to_string(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_match_stage_exact_and_glob() {
        let configs = vec![config("production"), config("pr-*")];

        assert_eq!(
            match_stage(&configs, "production").map(|c| c.stage_pattern.as_str()),
            Some("production")
        );
        assert_eq!(
            match_stage(&configs, "pr-123").map(|c| c.stage_pattern.as_str()),
            Some("pr-*")
        );
        assert!(match_stage(&configs, "staging").is_none());
    }

    #[test]
    fn test_match_stage_prefers_first_match() {
        let configs = vec![config("pr-*"), config("*")];
        assert_eq!(
            match_stage(&configs, "pr-7").map(|c| c.stage_pattern.as_str()),
            Some("pr-*")
        );
        assert_eq!(
            match_stage(&configs, "anything").map(|c| c.stage_pattern.as_str()),
            Some("*")
        );
    }

    #[test]
    fn test_match_stage_ignores_invalid_patterns() {
        let configs = vec![config("pr-["), config("pr-*")];
        assert_eq!(
            match_stage(&configs, "pr-1").map(|c| c.stage_pattern.as_str()),
            Some("pr-*")
        );
    }
}
