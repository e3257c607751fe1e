//! Control-plane event publishing
//!
//! Run lifecycle signals go out on the control-plane event bus so the rest of
//! the product (dashboard, notifications) can react without being called
//! directly.

use async_trait::async_trait;
use thiserror::Error;

use aws_sdk_eventbridge::types::PutEventsRequestEntry;

use caravel_core::event::{RunCompleted, RunCreated};

use crate::aws::retry;

/// Event source recorded on every published entry
const EVENT_SOURCE: &str = "caravel.control";

/// Signals the orchestrator emits
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    RunCreated(RunCreated),
    RunCompleted(RunCompleted),
}

impl ControlEvent {
    pub fn detail_type(&self) -> &'static str {
        match self {
            ControlEvent::RunCreated(_) => "run.created",
            ControlEvent::RunCompleted(_) => "run.completed",
        }
    }

    pub fn detail(&self) -> serde_json::Value {
        match self {
            ControlEvent::RunCreated(event) => serde_json::json!(event),
            ControlEvent::RunCompleted(event) => serde_json::json!(event),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to publish {detail_type}: {message}")]
    PutEvents {
        detail_type: &'static str,
        message: String,
    },
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: ControlEvent) -> Result<(), PublishError>;
}

/// EventBridge-backed publisher
pub struct EventBridgePublisher {
    client: aws_sdk_eventbridge::Client,
    bus_arn: String,
}

impl EventBridgePublisher {
    pub fn new(sdk_config: &aws_config::SdkConfig, bus_arn: String) -> Self {
        Self {
            client: aws_sdk_eventbridge::Client::new(sdk_config),
            bus_arn,
        }
    }
}

#[async_trait]
impl EventPublisher for EventBridgePublisher {
    async fn publish(&self, event: ControlEvent) -> Result<(), PublishError> {
        let detail_type = event.detail_type();
        let detail = event.detail().to_string();

        retry("events.put_events", || {
            self.client
                .put_events()
                .entries(
                    PutEventsRequestEntry::builder()
                        .event_bus_name(&self.bus_arn)
                        .source(EVENT_SOURCE)
                        .detail_type(detail_type)
                        .detail(&detail)
                        .build(),
                )
                .send()
        })
        .await
        .map_err(|err| PublishError::PutEvents {
            detail_type,
            message: err.to_string(),
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_detail_type_mapping() {
        let created = ControlEvent::RunCreated(RunCreated {
            workspace_id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            stage_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
        });
        assert_eq!(created.detail_type(), "run.created");

        let completed = ControlEvent::RunCompleted(RunCompleted {
            workspace_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            error: Some("Build timed out".to_string()),
        });
        assert_eq!(completed.detail_type(), "run.completed");
    }

    #[test]
    fn test_detail_keeps_wire_casing() {
        let run_id = Uuid::new_v4();
        let event = ControlEvent::RunCompleted(RunCompleted {
            workspace_id: Uuid::new_v4(),
            run_id,
            error: None,
        });
        let detail = event.detail();
        assert_eq!(detail["runId"], serde_json::json!(run_id));
        assert!(detail.get("error").is_none());
    }
}
