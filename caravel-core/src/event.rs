//! Event payloads
//!
//! JSON documents exchanged between the orchestrator, the scheduler targets,
//! and the remote runners. Field names are camelCase on the wire because the
//! same documents are consumed by the runner-side bootstrap script.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::runner::Engine;

/// "run.created" — a run was queued for a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCreated {
    pub workspace_id: Uuid,
    pub app_id: Uuid,
    pub stage_id: Uuid,
    pub run_id: Uuid,
}

/// "run.completed" — a run reached a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCompleted {
    pub workspace_id: Uuid,
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// "account.linked" — a customer AWS account became usable for deploys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLinked {
    pub workspace_id: Uuid,
    /// 12-digit AWS account id
    pub aws_account_id: String,
}

/// "runner.started" — raised by the remote runner once it picks up a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStarted {
    pub workspace_id: Uuid,
    pub run_id: Uuid,
    pub engine: Engine,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_request_id: Option<String>,
    pub log_group: String,
    pub log_stream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// "runner.completed" — raised by the remote runner when the deploy finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerCompleted {
    pub workspace_id: Uuid,
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Scheduled-trigger payloads
// =============================================================================

/// One-shot timeout watchdog input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTimeout {
    pub workspace_id: Uuid,
    pub run_id: Uuid,
}

/// Warm-keep trigger input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerWarmer {
    pub workspace_id: Uuid,
    pub runner_id: Uuid,
}

/// Idle-reaper trigger input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerRemover {
    pub workspace_id: Uuid,
    pub runner_id: Uuid,
    pub remove_if_not_used_after: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remover_wire_keys() {
        let event = RunnerRemover {
            workspace_id: Uuid::new_v4(),
            runner_id: Uuid::new_v4(),
            remove_if_not_used_after: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("workspaceID").is_none());
        assert!(value.get("workspaceId").is_some());
        assert!(value.get("removeIfNotUsedAfter").is_some());
    }

    #[test]
    fn test_completed_omits_missing_error() {
        let event = RunCompleted {
            workspace_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            error: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_runner_started_round_trip() {
        let event = RunnerStarted {
            workspace_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            engine: Engine::Codebuild,
            aws_request_id: None,
            log_group: "/aws/codebuild/runner".to_string(),
            log_stream: "abc123".to_string(),
            timestamp: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: RunnerStarted = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
