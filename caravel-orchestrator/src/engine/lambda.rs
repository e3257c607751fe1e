//! Function engine
//!
//! Runs deploys inside a container-image function in the customer account.
//! Fast to start once warm, bounded to the service's maximum execution time,
//! so it is the default engine for ordinary deploys.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{
    Architecture as FunctionArchitecture, EphemeralStorage, FunctionCode, InvocationType,
    PackageType, State,
};
use aws_smithy_types::error::metadata::ProvideErrorMetadata;

use caravel_core::domain::runner::{Architecture, Resource};
use caravel_core::payload::RunnerPayload;

use crate::aws::{ErrorKind, classify, retry};
use crate::engine::{EngineAdapter, EngineContext, EngineError, register_event_forwarding};

const DEFAULT_BUILD_TIMEOUT_MINUTES: u32 = 15;

/// Memory and ephemeral storage are pinned at the service maximum; deploys
/// are short-lived and CPU scales with memory
const FUNCTION_MEMORY_MB: i32 = 10240;
const FUNCTION_STORAGE_MB: i32 = 10240;
const FUNCTION_TIMEOUT_SECONDS: i32 = 900;

/// How long to wait between checks while the function leaves "Pending"
const PENDING_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct LambdaEngine {
    image_uri: String,
}

impl LambdaEngine {
    pub fn new(image_uri: String) -> Self {
        Self { image_uri }
    }

    fn role_name(ctx: &EngineContext) -> String {
        format!("caravel-runner-{}-{}", ctx.region, ctx.suffix)
    }

    fn function_name(ctx: &EngineContext) -> String {
        format!("caravel-runner-{}", ctx.suffix)
    }

    async fn create_role(&self, ctx: &EngineContext) -> Result<String, EngineError> {
        let iam = ctx.iam();
        let role_name = Self::role_name(ctx);

        let trust_policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": "lambda.amazonaws.com" },
                "Action": "sts:AssumeRole",
            }],
        })
        .to_string();

        let created = retry("iam.create_role", || {
            iam.create_role()
                .role_name(&role_name)
                .assume_role_policy_document(&trust_policy)
                .send()
        })
        .await;

        let role_arn = match created {
            Ok(output) => output
                .role
                .map(|role| role.arn)
                .ok_or(EngineError::MissingField("iam.create_role", "role arn"))?,
            Err(err) if classify(&err) == ErrorKind::AlreadyExists => {
                let output = retry("iam.get_role", || {
                    iam.get_role().role_name(&role_name).send()
                })
                .await
                .map_err(|err| EngineError::aws("iam.get_role", err))?;
                return output
                    .role
                    .map(|role| role.arn)
                    .ok_or(EngineError::MissingField("iam.get_role", "role arn"));
            }
            Err(err) => return Err(EngineError::aws("iam.create_role", err)),
        };

        let publish_policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Action": "events:PutEvents",
                "Resource": "*",
            }],
        })
        .to_string();

        retry("iam.put_role_policy", || {
            iam.put_role_policy()
                .role_name(&role_name)
                .policy_name("eventbridge")
                .policy_document(&publish_policy)
                .send()
        })
        .await
        .map_err(|err| EngineError::aws("iam.put_role_policy", err))?;

        retry("iam.attach_role_policy", || {
            iam.attach_role_policy()
                .role_name(&role_name)
                .policy_arn("arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole")
                .send()
        })
        .await
        .map_err(|err| EngineError::aws("iam.attach_role_policy", err))?;

        Ok(role_arn)
    }

    async fn create_function(
        &self,
        ctx: &EngineContext,
        role_arn: &str,
    ) -> Result<String, EngineError> {
        let lambda = ctx.lambda();
        let function_name = Self::function_name(ctx);
        let architecture = match ctx.architecture {
            Architecture::X86_64 => FunctionArchitecture::X8664,
            Architecture::Arm64 => FunctionArchitecture::Arm64,
        };

        let storage = EphemeralStorage::builder()
            .size(FUNCTION_STORAGE_MB)
            .build()
            .map_err(|err| EngineError::InvalidRequest("lambda.create_function", err.to_string()))?;

        loop {
            let created = retry("lambda.create_function", || {
                lambda
                    .create_function()
                    .function_name(&function_name)
                    .role(role_arn)
                    .package_type(PackageType::Image)
                    .code(FunctionCode::builder().image_uri(&ctx.image).build())
                    .timeout(FUNCTION_TIMEOUT_SECONDS)
                    .memory_size(FUNCTION_MEMORY_MB)
                    .ephemeral_storage(storage.clone())
                    .architectures(architecture.clone())
                    .send()
            })
            .await;

            match created {
                Ok(output) => {
                    let function_arn = output.function_arn.clone().ok_or(
                        EngineError::MissingField("lambda.create_function", "function arn"),
                    )?;
                    retry("lambda.put_function_event_invoke_config", || {
                        lambda
                            .put_function_event_invoke_config()
                            .function_name(&function_arn)
                            .maximum_retry_attempts(0)
                            .maximum_event_age_in_seconds(3600)
                            .send()
                    })
                    .await
                    .map_err(|err| {
                        EngineError::aws("lambda.put_function_event_invoke_config", err)
                    })?;
                    break;
                }
                Err(err) if classify(&err) == ErrorKind::AlreadyExists => break,
                Err(err) if err.code() == Some("InvalidParameterValueException") => {
                    // the role has not propagated yet
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(err) => return Err(EngineError::aws("lambda.create_function", err)),
            }
        }

        // Invocations fail while the function is still materializing
        loop {
            let output = retry("lambda.get_function", || {
                lambda.get_function().function_name(&function_name).send()
            })
            .await
            .map_err(|err| EngineError::aws("lambda.get_function", err))?;

            let configuration = output
                .configuration
                .ok_or(EngineError::MissingField("lambda.get_function", "configuration"))?;

            if configuration.state != Some(State::Pending) {
                return configuration
                    .function_arn
                    .ok_or(EngineError::MissingField("lambda.get_function", "function arn"));
            }
            tokio::time::sleep(PENDING_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl EngineAdapter for LambdaEngine {
    fn default_image(&self, architecture: Architecture) -> String {
        format!("{}:{}-1", self.image_uri, architecture)
    }

    fn default_build_timeout_minutes(&self) -> u32 {
        DEFAULT_BUILD_TIMEOUT_MINUTES
    }

    async fn create_resource(&self, ctx: &EngineContext) -> Result<Resource, EngineError> {
        let role = self.create_role(ctx).await?;
        let function = self.create_function(ctx, &role).await?;
        register_event_forwarding(ctx).await?;
        Ok(Resource::Lambda { role, function })
    }

    async fn remove_resource(
        &self,
        ctx: &EngineContext,
        resource: &Resource,
    ) -> Result<(), EngineError> {
        let Resource::Lambda { role, function } = resource else {
            return Ok(());
        };

        let iam = ctx.iam();
        if let Some(role_name) = role.split('/').next_back() {
            if let Err(err) = retry("iam.delete_role_policy", || {
                iam.delete_role_policy()
                    .role_name(role_name)
                    .policy_name("eventbridge")
                    .send()
            })
            .await
            {
                tracing::warn!(role_name, code = ?err.code(), "failed to delete role policy");
            }

            if let Err(err) = retry("iam.detach_role_policy", || {
                iam.detach_role_policy()
                    .role_name(role_name)
                    .policy_arn(
                        "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole",
                    )
                    .send()
            })
            .await
            {
                if classify(&err) != ErrorKind::NotFound {
                    tracing::warn!(role_name, code = ?err.code(), "failed to detach role policy");
                }
            }

            if let Err(err) = retry("iam.delete_role", || {
                iam.delete_role().role_name(role_name).send()
            })
            .await
            {
                tracing::warn!(role_name, code = ?err.code(), "failed to delete role");
            }
        }

        let lambda = ctx.lambda();
        if let Err(err) = retry("lambda.delete_function", || {
            lambda.delete_function().function_name(function).send()
        })
        .await
        {
            tracing::warn!(function, code = ?err.code(), "failed to delete function");
        }

        Ok(())
    }

    async fn invoke(
        &self,
        ctx: &EngineContext,
        resource: &Resource,
        payload: &RunnerPayload,
        _timeout_minutes: u32,
    ) -> Result<(), EngineError> {
        let Resource::Lambda { function, .. } = resource else {
            return Ok(());
        };

        let body = serde_json::to_vec(payload)?;
        let lambda = ctx.lambda();
        retry("lambda.invoke", || {
            lambda
                .invoke()
                .function_name(function)
                .invocation_type(InvocationType::Event)
                .payload(Blob::new(body.clone()))
                .send()
        })
        .await
        .map_err(|err| EngineError::aws("lambda.invoke", err))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_image_per_architecture() {
        let engine = LambdaEngine::new("registry.example.com/runner".to_string());
        assert_eq!(
            engine.default_image(Architecture::X86_64),
            "registry.example.com/runner:x86_64-1"
        );
        assert_eq!(
            engine.default_image(Architecture::Arm64),
            "registry.example.com/runner:arm64-1"
        );
    }

    #[test]
    fn test_default_timeout() {
        let engine = LambdaEngine::new(String::new());
        assert_eq!(engine.default_build_timeout_minutes(), 15);
    }
}
