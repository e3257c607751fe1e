//! Run domain types
//!
//! A run is one deployment attempt for a stage. Runs queue per stage; at most
//! one may be active at a time, enforced by a uniqueness constraint in the
//! orchestrator's storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::runner::{Engine, RunnerConfig};
use crate::domain::trigger::Trigger;

/// One deployment attempt for a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub stage_id: Uuid,

    /// State-update record created alongside the run, completed with it
    pub state_update_id: Uuid,

    pub trigger: Trigger,
    pub config: DeployConfig,

    /// Soft mutual-exclusion lock: `Some(true)` while dispatched, `None`
    /// while queued or after completion
    pub active: Option<bool>,

    /// Engine-tagged pointer to the runner-side log stream
    pub log: Option<LogPointer>,

    /// Terminal failure reason, if the run did not succeed
    pub error: Option<String>,

    pub time_created: DateTime<Utc>,
    pub time_updated: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
}

impl Run {
    pub fn is_completed(&self) -> bool {
        self.time_completed.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active == Some(true)
    }
}

/// Deploy target parsed from the app's config by an upstream step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Stage name the push deploys to
    pub stage: String,

    /// Region the app's provider block pins, when it pins one
    #[serde(default)]
    pub region: Option<String>,

    /// Requested runner characteristics
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Environment overrides declared in the app's config
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

/// Pointer into the runner-side log stream, tagged by engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum LogPointer {
    #[serde(rename_all = "camelCase")]
    Lambda {
        request_id: String,
        log_group: String,
        log_stream: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Codebuild {
        log_group: String,
        log_stream: String,
    },
}

impl LogPointer {
    pub fn engine(&self) -> Engine {
        match self {
            LogPointer::Lambda { .. } => Engine::Lambda,
            LogPointer::Codebuild { .. } => Engine::Codebuild,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trigger::{
        TriggerAction, TriggerCommit, TriggerRepo, TriggerSender, TriggerSource,
    };

    fn run(active: Option<bool>, completed: bool) -> Run {
        let now = Utc::now();
        Run {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            stage_id: Uuid::new_v4(),
            state_update_id: Uuid::new_v4(),
            trigger: Trigger::Branch {
                action: TriggerAction::Pushed,
                source: TriggerSource::Github,
                repo: TriggerRepo {
                    id: 1,
                    owner: "acme".to_string(),
                    repo: "storefront".to_string(),
                },
                branch: "main".to_string(),
                commit: TriggerCommit {
                    id: "abc".to_string(),
                    message: "deploy".to_string(),
                },
                sender: TriggerSender {
                    id: 1,
                    username: "jo".to_string(),
                },
            },
            config: DeployConfig {
                stage: "production".to_string(),
                region: None,
                runner: RunnerConfig::default(),
                env: Default::default(),
            },
            active,
            log: None,
            error: None,
            time_created: now,
            time_updated: now,
            time_started: None,
            time_completed: completed.then_some(now),
        }
    }

    #[test]
    fn test_lifecycle_predicates() {
        assert!(!run(None, false).is_active());
        assert!(run(Some(true), false).is_active());
        assert!(run(None, true).is_completed());
        assert!(!run(None, false).is_completed());
    }

    #[test]
    fn test_log_pointer_wire_shape() {
        let log = LogPointer::Lambda {
            request_id: "req-1".to_string(),
            log_group: "/aws/lambda/runner".to_string(),
            log_stream: "2026/08/07/[$LATEST]abc".to_string(),
            timestamp: 1754500000000,
        };
        let value = serde_json::to_value(&log).unwrap();
        assert_eq!(value["engine"], "lambda");
        assert_eq!(value["requestId"], "req-1");
        assert!(value["logGroup"].is_string());
    }

    #[test]
    fn test_deploy_config_defaults_runner() {
        let config: DeployConfig =
            serde_json::from_str(r#"{"stage": "staging"}"#).unwrap();
        assert_eq!(config.stage, "staging");
        assert_eq!(config.runner, RunnerConfig::default());
    }
}
