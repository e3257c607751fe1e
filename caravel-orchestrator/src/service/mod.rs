//! Service layer
//!
//! Business logic for run orchestration and runner lifecycle. Services are
//! free async functions over the pool plus a [`Deps`] bundle holding the
//! cloud-facing collaborators, all trait objects so tests can swap in fakes.

pub mod run;
pub mod runner;
pub mod scheduler;

use std::sync::Arc;

use crate::aws::credentials::{CredentialIssuer, StsCredentialIssuer};
use crate::aws::events::{EventBridgePublisher, EventPublisher};
use crate::config::OrchestratorConfig;
use crate::engine::Engines;
use crate::git::{GitSource, GithubSource};
use crate::service::scheduler::{AwsScheduleClient, ScheduleClient};

/// Cloud-facing collaborators threaded through the services
#[derive(Clone)]
pub struct Deps {
    pub config: OrchestratorConfig,
    pub engines: Engines,
    pub scheduler: Arc<dyn ScheduleClient>,
    pub publisher: Arc<dyn EventPublisher>,
    pub credentials: Arc<dyn CredentialIssuer>,
    pub git: Arc<dyn GitSource>,
}

impl Deps {
    /// Wires the production implementations
    pub fn production(config: OrchestratorConfig, sdk_config: &aws_config::SdkConfig) -> Self {
        let engines = Engines::production(&config);
        let scheduler = Arc::new(AwsScheduleClient::new(
            sdk_config,
            config.schedule_group.clone(),
            config.schedule_role_arn.clone(),
        ));
        let publisher = Arc::new(EventBridgePublisher::new(
            sdk_config,
            config.event_bus_arn.clone(),
        ));
        let credentials = Arc::new(StsCredentialIssuer::new(
            sdk_config,
            config.runner_role_name.clone(),
        ));
        let git = Arc::new(GithubSource::new(config.github_token.clone()));

        Self {
            config,
            engines,
            scheduler,
            publisher,
            credentials,
            git,
        }
    }
}
