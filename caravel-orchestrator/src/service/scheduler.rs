//! Scheduler client
//!
//! Wraps the generic "create a scheduled trigger" primitive behind a trait.
//! Three registrations are built on it: the run timeout watchdog, the runner
//! warmer and the runner idle remover. One-shot schedules delete themselves
//! after firing.

use async_trait::async_trait;
use aws_sdk_scheduler::types::{
    ActionAfterCompletion, FlexibleTimeWindow, FlexibleTimeWindowMode, Target,
};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use caravel_core::event::{RunTimeout, RunnerRemover, RunnerWarmer};

use crate::aws::retry;
use crate::config::OrchestratorConfig;

/// Slack added on top of a run's timeout before the watchdog fires
pub const TIMEOUT_MONITOR_SLACK_MINUTES: i64 = 1;

/// Interval between warm-keep invocations
pub const RUNNER_WARM_INTERVAL_MINUTES: i64 = 5;

/// A runner with no usage for this long is eligible for removal
pub const RUNNER_INACTIVE_DAYS: i64 = 7;

/// The remover checks one extra day after the inactivity window
pub const RUNNER_REMOVER_SLACK_DAYS: i64 = 1;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("failed to create schedule {name}: {message}")]
    Create { name: String, message: String },
}

/// One-shot schedule creation request
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub name: String,
    pub fire_at: DateTime<Utc>,
    pub target_arn: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait ScheduleClient: Send + Sync {
    async fn create(&self, request: ScheduleRequest) -> Result<(), ScheduleError>;
}

/// EventBridge Scheduler-backed client
pub struct AwsScheduleClient {
    client: aws_sdk_scheduler::Client,
    group: String,
    role_arn: String,
}

impl AwsScheduleClient {
    pub fn new(sdk_config: &aws_config::SdkConfig, group: String, role_arn: String) -> Self {
        Self {
            client: aws_sdk_scheduler::Client::new(sdk_config),
            group,
            role_arn,
        }
    }
}

#[async_trait]
impl ScheduleClient for AwsScheduleClient {
    async fn create(&self, request: ScheduleRequest) -> Result<(), ScheduleError> {
        let window = FlexibleTimeWindow::builder()
            .mode(FlexibleTimeWindowMode::Off)
            .build()
            .map_err(|err| ScheduleError::Create {
                name: request.name.clone(),
                message: err.to_string(),
            })?;
        let target = Target::builder()
            .arn(&request.target_arn)
            .role_arn(&self.role_arn)
            .input(request.payload.to_string())
            .build()
            .map_err(|err| ScheduleError::Create {
                name: request.name.clone(),
                message: err.to_string(),
            })?;

        retry("scheduler.create_schedule", || {
            self.client
                .create_schedule()
                .name(&request.name)
                .group_name(&self.group)
                .schedule_expression(at_expression(request.fire_at))
                .flexible_time_window(window.clone())
                .action_after_completion(ActionAfterCompletion::Delete)
                .target(target.clone())
                .send()
        })
        .await
        .map_err(|err| ScheduleError::Create {
            name: request.name.clone(),
            message: err.to_string(),
        })?;

        Ok(())
    }
}

/// One-shot schedule expression, seconds precision
pub fn at_expression(when: DateTime<Utc>) -> String {
    format!("at({})", when.format("%Y-%m-%dT%H:%M:%S"))
}

// =============================================================================
// Registrations
// =============================================================================

/// Schedules the one-shot watchdog that force-completes an overrunning run
pub async fn schedule_run_timeout(
    scheduler: &dyn ScheduleClient,
    config: &OrchestratorConfig,
    workspace_id: Uuid,
    run_id: Uuid,
    timeout_minutes: u32,
) -> Result<(), ScheduleError> {
    let fire_at =
        Utc::now() + Duration::minutes(timeout_minutes as i64 + TIMEOUT_MONITOR_SLACK_MINUTES);
    scheduler
        .create(ScheduleRequest {
            name: format!("run-timeout-{run_id}"),
            fire_at,
            target_arn: config.timeout_monitor_arn.clone(),
            payload: serde_json::json!(RunTimeout {
                workspace_id,
                run_id,
            }),
        })
        .await
}

/// Schedules the next warm-keep invocation; returns the schedule name so the
/// caller can persist it on the runner
pub async fn schedule_runner_warmer(
    scheduler: &dyn ScheduleClient,
    config: &OrchestratorConfig,
    workspace_id: Uuid,
    runner_id: Uuid,
) -> Result<String, ScheduleError> {
    let now = Utc::now();
    let name = format!("runner-warmer-{}-{}", runner_id, now.timestamp_millis());
    scheduler
        .create(ScheduleRequest {
            name: name.clone(),
            fire_at: now + Duration::minutes(RUNNER_WARM_INTERVAL_MINUTES),
            target_arn: config.runner_warmer_arn.clone(),
            payload: serde_json::json!(RunnerWarmer {
                workspace_id,
                runner_id,
            }),
        })
        .await?;
    Ok(name)
}

/// Schedules the idle check that removes an unused runner
///
/// Fires one day after the inactivity window so a runner used right at the
/// edge of the window is seen as used.
pub async fn schedule_runner_remover(
    scheduler: &dyn ScheduleClient,
    config: &OrchestratorConfig,
    workspace_id: Uuid,
    runner_id: Uuid,
) -> Result<(), ScheduleError> {
    let now = Utc::now();
    let remove_if_not_used_after = now + Duration::days(RUNNER_REMOVER_SLACK_DAYS);
    scheduler
        .create(ScheduleRequest {
            name: format!("runner-remover-{}-{}", runner_id, now.timestamp_millis()),
            fire_at: now + Duration::days(RUNNER_INACTIVE_DAYS + RUNNER_REMOVER_SLACK_DAYS),
            target_arn: config.runner_remover_arn.clone(),
            payload: serde_json::json!(RunnerRemover {
                workspace_id,
                runner_id,
                remove_if_not_used_after,
            }),
        })
        .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Records requests instead of creating schedules
    #[derive(Default)]
    pub(crate) struct FakeScheduleClient {
        pub requests: Mutex<Vec<ScheduleRequest>>,
    }

    #[async_trait]
    impl ScheduleClient for FakeScheduleClient {
        async fn create(&self, request: ScheduleRequest) -> Result<(), ScheduleError> {
            self.requests.lock().unwrap().push(request);
            Ok(())
        }
    }

    #[test]
    fn test_at_expression_truncates_to_seconds() {
        let when = Utc.with_ymd_and_hms(2026, 8, 7, 12, 30, 45).unwrap();
        assert_eq!(at_expression(when), "at(2026-08-07T12:30:45)");
    }

    #[tokio::test]
    async fn test_schedule_run_timeout_shape() {
        let scheduler = FakeScheduleClient::default();
        let config = crate::config::test_config();
        let workspace_id = Uuid::new_v4();
        let run_id = Uuid::new_v4();

        let before = Utc::now();
        schedule_run_timeout(&scheduler, &config, workspace_id, run_id, 15)
            .await
            .unwrap();
        let after = Utc::now();

        let requests = scheduler.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.name, format!("run-timeout-{run_id}"));
        assert_eq!(request.target_arn, config.timeout_monitor_arn);
        assert_eq!(request.payload["runId"], serde_json::json!(run_id));
        assert_eq!(request.payload["workspaceId"], serde_json::json!(workspace_id));
        // timeout plus one minute of slack
        assert!(request.fire_at >= before + Duration::minutes(16));
        assert!(request.fire_at <= after + Duration::minutes(16));
    }

    #[tokio::test]
    async fn test_schedule_runner_warmer_returns_unique_names() {
        let scheduler = FakeScheduleClient::default();
        let config = crate::config::test_config();
        let runner_id = Uuid::new_v4();

        let name = schedule_runner_warmer(&scheduler, &config, Uuid::new_v4(), runner_id)
            .await
            .unwrap();
        assert!(name.starts_with(&format!("runner-warmer-{runner_id}-")));

        let requests = scheduler.requests.lock().unwrap();
        assert_eq!(requests[0].name, name);
        assert_eq!(requests[0].target_arn, config.runner_warmer_arn);
    }

    #[tokio::test]
    async fn test_schedule_runner_remover_carries_threshold() {
        let scheduler = FakeScheduleClient::default();
        let config = crate::config::test_config();

        schedule_runner_remover(&scheduler, &config, Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();

        let requests = scheduler.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.target_arn, config.runner_remover_arn);
        assert!(request.payload.get("removeIfNotUsedAfter").is_some());
        // fires after the full inactivity window plus slack
        assert!(request.fire_at > Utc::now() + Duration::days(7));
    }
}
