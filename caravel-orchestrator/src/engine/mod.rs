//! Execution engines
//!
//! A runner executes deploys on one of two backends: a container-image
//! function or a managed build project, both provisioned in the customer's
//! account. The backends implement the same capability contract and are
//! selected purely from the run's config.

pub mod codebuild;
pub mod lambda;

use std::sync::Arc;

use async_trait::async_trait;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use sha2::{Digest, Sha256};
use thiserror::Error;

use caravel_core::domain::runner::{
    Architecture, Compute, Engine, Resource, ResolvedRunnerConfig, RunnerConfig,
};
use caravel_core::payload::{Credentials, RunnerPayload};

use crate::aws::{ErrorKind, classify, retry};
use crate::config::OrchestratorConfig;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Provisioning failed with a message meant for the user; preferred over
    /// phase-context messages when surfacing the run's terminal error
    #[error("{0}")]
    CreateResource(String),

    #[error("{operation} failed: {message}")]
    Aws {
        operation: &'static str,
        kind: ErrorKind,
        message: String,
    },

    #[error("{0} response missing {1}")]
    MissingField(&'static str, &'static str),

    #[error("invalid {0} request: {1}")]
    InvalidRequest(&'static str, String),

    #[error("failed to encode runner payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl EngineError {
    pub(crate) fn aws<E, R>(operation: &'static str, err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata,
    {
        let message = err
            .message()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        EngineError::Aws {
            operation,
            kind: classify(&err),
            message,
        }
    }
}

/// Everything an engine needs to act in the customer account
#[derive(Clone)]
pub struct EngineContext {
    pub credentials: Credentials,
    pub region: String,

    /// 12-digit customer account id, used when deriving ARNs
    pub external_account_id: String,

    /// Resource-name suffix: architecture, config hash, deployment
    pub suffix: String,

    /// Deployment-only suffix for account-wide singletons (event rule)
    pub deployment_suffix: String,

    pub image: String,
    pub architecture: Architecture,
    pub compute: Compute,

    pub event_bus_arn: String,
    pub publisher_role_name: String,
}

impl EngineContext {
    pub fn new(
        config: &OrchestratorConfig,
        resolved: &ResolvedRunnerConfig,
        region: String,
        external_account_id: String,
        credentials: Credentials,
    ) -> Self {
        Self {
            credentials,
            region,
            external_account_id,
            suffix: name_suffix(resolved, &config.deployment_suffix()),
            deployment_suffix: config.deployment_suffix(),
            image: resolved.image.clone(),
            architecture: resolved.architecture,
            compute: resolved.compute,
            event_bus_arn: config.event_bus_arn.clone(),
            publisher_role_name: config.publisher_role_name.clone(),
        }
    }

    fn aws_credentials(&self) -> aws_credential_types::Credentials {
        aws_credential_types::Credentials::from_keys(
            self.credentials.access_key_id.clone(),
            self.credentials.secret_access_key.clone(),
            Some(self.credentials.session_token.clone()),
        )
    }

    // SDK-level retries are disabled on every client; all calls go through
    // aws::retry, which never withholds an attempt.

    pub(crate) fn iam(&self) -> aws_sdk_iam::Client {
        let config = aws_sdk_iam::Config::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.region.clone()))
            .credentials_provider(self.aws_credentials())
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .build();
        aws_sdk_iam::Client::from_conf(config)
    }

    pub(crate) fn lambda(&self) -> aws_sdk_lambda::Client {
        let config = aws_sdk_lambda::Config::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.region.clone()))
            .credentials_provider(self.aws_credentials())
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .build();
        aws_sdk_lambda::Client::from_conf(config)
    }

    pub(crate) fn codebuild(&self) -> aws_sdk_codebuild::Client {
        let config = aws_sdk_codebuild::Config::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.region.clone()))
            .credentials_provider(self.aws_credentials())
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .build();
        aws_sdk_codebuild::Client::from_conf(config)
    }

    pub(crate) fn eventbridge(&self) -> aws_sdk_eventbridge::Client {
        let config = aws_sdk_eventbridge::Config::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.region.clone()))
            .credentials_provider(self.aws_credentials())
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .build();
        aws_sdk_eventbridge::Client::from_conf(config)
    }
}

/// Capability contract every engine implements
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Image used when the run's config does not pin one
    fn default_image(&self, architecture: Architecture) -> String;

    /// Build timeout when the run's config does not set one
    fn default_build_timeout_minutes(&self) -> u32;

    /// Provisions the engine's compute in the customer account
    async fn create_resource(&self, ctx: &EngineContext) -> Result<Resource, EngineError>;

    /// Tears the compute down; best-effort, logs and continues on partial
    /// failure so a half-deleted runner can still be reaped
    async fn remove_resource(
        &self,
        ctx: &EngineContext,
        resource: &Resource,
    ) -> Result<(), EngineError>;

    /// Dispatches a payload to the provisioned compute
    async fn invoke(
        &self,
        ctx: &EngineContext,
        resource: &Resource,
        payload: &RunnerPayload,
        timeout_minutes: u32,
    ) -> Result<(), EngineError>;
}

/// The closed set of engines, dispatched by [`Engine`]
#[derive(Clone)]
pub struct Engines {
    lambda: Arc<dyn EngineAdapter>,
    codebuild: Arc<dyn EngineAdapter>,
}

impl Engines {
    pub fn production(config: &OrchestratorConfig) -> Self {
        Self {
            lambda: Arc::new(lambda::LambdaEngine::new(config.image_uri.clone())),
            codebuild: Arc::new(codebuild::CodeBuildEngine::new()),
        }
    }

    pub fn from_parts(lambda: Arc<dyn EngineAdapter>, codebuild: Arc<dyn EngineAdapter>) -> Self {
        Self { lambda, codebuild }
    }

    pub fn get(&self, engine: Engine) -> &dyn EngineAdapter {
        match engine {
            Engine::Lambda => self.lambda.as_ref(),
            Engine::Codebuild => self.codebuild.as_ref(),
        }
    }
}

/// Applies defaults to a run's runner config
pub fn resolve_config(engines: &Engines, config: &RunnerConfig) -> ResolvedRunnerConfig {
    let engine = config.engine.unwrap_or(Engine::Lambda);
    let architecture = config.architecture.unwrap_or(Architecture::X86_64);
    let compute = config.compute.unwrap_or(Compute::Small);
    let image = config
        .image
        .clone()
        .unwrap_or_else(|| engines.get(engine).default_image(architecture));
    ResolvedRunnerConfig {
        engine,
        architecture,
        image,
        compute,
        timeout_minutes: config.timeout_minutes,
    }
}

/// Resource-name suffix for a runner configuration
///
/// The hash keeps names unique per config while staying stable across
/// invocations, so "already exists" during creation always means "ours".
pub fn name_suffix(resolved: &ResolvedRunnerConfig, deployment_suffix: &str) -> String {
    let digest = Sha256::digest(resolved.fingerprint().as_bytes());
    let hash: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{}-{}{}", resolved.architecture, hash, deployment_suffix)
}

/// Registers the rule forwarding runner-emitted events to the control plane
///
/// Shared by both engines; safe to call repeatedly.
pub(crate) async fn register_event_forwarding(ctx: &EngineContext) -> Result<(), EngineError> {
    use aws_sdk_eventbridge::types::{RuleState, Target};

    let eventbridge = ctx.eventbridge();
    let rule_name = format!("CaravelExternal{}", ctx.deployment_suffix);

    let put_rule = retry("events.put_rule", || {
        eventbridge
            .put_rule()
            .name(&rule_name)
            .state(RuleState::Enabled)
            .event_pattern(r#"{"source":["caravel.external"]}"#)
            .send()
    })
    .await;
    if let Err(err) = put_rule {
        if classify(&err) != ErrorKind::AlreadyExists {
            return Err(EngineError::aws("events.put_rule", err));
        }
    }

    let iam = ctx.iam();
    let role = retry("iam.get_role", || {
        iam.get_role().role_name(&ctx.publisher_role_name).send()
    })
    .await
    .map_err(|err| EngineError::aws("iam.get_role", err))?;
    let role_arn = role
        .role
        .map(|role| role.arn)
        .ok_or(EngineError::MissingField("iam.get_role", "role arn"))?;

    let target = Target::builder()
        .id("CaravelExternal")
        .arn(&ctx.event_bus_arn)
        .role_arn(&role_arn)
        .build()
        .map_err(|err| EngineError::InvalidRequest("events.put_targets", err.to_string()))?;

    let put_targets = retry("events.put_targets", || {
        eventbridge
            .put_targets()
            .rule(&rule_name)
            .targets(target.clone())
            .send()
    })
    .await;
    if let Err(err) = put_targets {
        if classify(&err) != ErrorKind::AlreadyExists {
            return Err(EngineError::aws("events.put_targets", err));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(engine: Engine) -> ResolvedRunnerConfig {
        ResolvedRunnerConfig {
            engine,
            architecture: Architecture::X86_64,
            image: "registry.example.com/runner:x86_64-1".to_string(),
            compute: Compute::Small,
            timeout_minutes: None,
        }
    }

    #[test]
    fn test_name_suffix_is_stable() {
        let config = resolved(Engine::Lambda);
        assert_eq!(name_suffix(&config, "-dev"), name_suffix(&config, "-dev"));
    }

    #[test]
    fn test_name_suffix_shape() {
        let suffix = name_suffix(&resolved(Engine::Lambda), "-dev");
        assert!(suffix.starts_with("x86_64-"));
        assert!(suffix.ends_with("-dev"));
        // 8 hex chars between architecture and deployment
        let hash = &suffix["x86_64-".len()..suffix.len() - "-dev".len()];
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_name_suffix_differs_per_engine() {
        assert_ne!(
            name_suffix(&resolved(Engine::Lambda), ""),
            name_suffix(&resolved(Engine::Codebuild), "")
        );
    }

    #[test]
    fn test_resolve_config_defaults() {
        let engines = Engines::production(&crate::config::test_config());
        let resolved = resolve_config(&engines, &RunnerConfig::default());
        assert_eq!(resolved.engine, Engine::Lambda);
        assert_eq!(resolved.architecture, Architecture::X86_64);
        assert_eq!(resolved.compute, Compute::Small);
        assert_eq!(resolved.image, "registry.example.com/caravel-runner:x86_64-1");
    }

    #[test]
    fn test_resolve_config_respects_overrides() {
        let engines = Engines::production(&crate::config::test_config());
        let config = RunnerConfig {
            engine: Some(Engine::Codebuild),
            architecture: Some(Architecture::Arm64),
            image: None,
            compute: Some(Compute::Large),
            timeout_minutes: Some(45),
        };
        let resolved = resolve_config(&engines, &config);
        assert_eq!(resolved.engine, Engine::Codebuild);
        assert_eq!(resolved.image, "aws/codebuild/amazonlinux2-aarch64-standard:3.0");
        assert_eq!(resolved.timeout_minutes, Some(45));
    }
}
