//! Build engine
//!
//! Runs deploys inside a managed build project in the customer account.
//! Slower to start than the function engine but not bound to its execution
//! ceiling, so it serves long deploys and privileged container builds.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_codebuild::types::{
    ArtifactsType, CloudWatchLogsConfig, ComputeType, EnvironmentType, EnvironmentVariable,
    LogsConfig, LogsConfigStatusType, ProjectArtifacts, ProjectEnvironment, ProjectSource,
    SourceType,
};
use aws_smithy_types::error::metadata::ProvideErrorMetadata;

use caravel_core::domain::runner::{Architecture, Compute, Resource};
use caravel_core::payload::{BuildspecSource, RunnerPayload};

use crate::aws::{ErrorKind, classify, retry};
use crate::engine::{EngineAdapter, EngineContext, EngineError, register_event_forwarding};

const DEFAULT_BUILD_TIMEOUT_MINUTES: u32 = 60;

/// Environment variable the payload is delivered in
const PAYLOAD_ENV_VAR: &str = "CARAVEL_RUNNER_EVENT";

pub struct CodeBuildEngine;

impl CodeBuildEngine {
    pub fn new() -> Self {
        Self
    }

    fn role_name(ctx: &EngineContext) -> String {
        format!("caravel-runner-{}-{}", ctx.region, ctx.suffix)
    }

    fn project_name(ctx: &EngineContext) -> String {
        format!("caravel-runner-{}", ctx.suffix)
    }

    async fn create_role(&self, ctx: &EngineContext) -> Result<String, EngineError> {
        let iam = ctx.iam();
        let role_name = Self::role_name(ctx);
        let project_name = Self::project_name(ctx);

        let trust_policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": "codebuild.amazonaws.com" },
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

        let log_group = format!(
            "arn:aws:logs:{}:{}:log-group:/aws/codebuild/{}",
            ctx.region, ctx.external_account_id, project_name
        );
        let policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Effect": "Allow",
                    "Action": "events:PutEvents",
                    "Resource": "*",
                },
                {
                    "Effect": "Allow",
                    "Action": [
                        "logs:CreateLogStream",
                        "logs:CreateLogGroup",
                        "logs:PutLogEvents",
                    ],
                    "Resource": [log_group.clone(), format!("{log_group}:*")],
                },
                {
                    "Effect": "Allow",
                    "Action": [
                        "codebuild:CreateReportGroup",
                        "codebuild:CreateReport",
                        "codebuild:UpdateReport",
                        "codebuild:BatchPutTestCases",
                        "codebuild:BatchPutCodeCoverages",
                    ],
                    "Resource": format!(
                        "arn:aws:codebuild:{}:{}:report-group/{}-*",
                        ctx.region, ctx.external_account_id, project_name
                    ),
                },
            ],
        })
        .to_string();

        retry("iam.put_role_policy", || {
            iam.put_role_policy()
                .role_name(&role_name)
                .policy_name("default")
                .policy_document(&policy)
                .send()
        })
        .await
        .map_err(|err| EngineError::aws("iam.put_role_policy", err))?;

        Ok(role_arn)
    }

    async fn create_project(
        &self,
        ctx: &EngineContext,
        role_arn: &str,
    ) -> Result<String, EngineError> {
        let codebuild = ctx.codebuild();
        let project_name = Self::project_name(ctx);

        let source = ProjectSource::builder()
            .r#type(SourceType::NoSource)
            .buildspec(bootstrap_buildspec())
            .build()
            .map_err(|err| EngineError::InvalidRequest("codebuild.create_project", err.to_string()))?;
        let artifacts = ProjectArtifacts::builder()
            .r#type(ArtifactsType::NoArtifacts)
            .build()
            .map_err(|err| EngineError::InvalidRequest("codebuild.create_project", err.to_string()))?;
        let environment = ProjectEnvironment::builder()
            .compute_type(compute_type(ctx.compute))
            .image(&ctx.image)
            .r#type(match ctx.architecture {
                Architecture::X86_64 => EnvironmentType::LinuxContainer,
                Architecture::Arm64 => EnvironmentType::ArmContainer,
            })
            .privileged_mode(true)
            .build()
            .map_err(|err| EngineError::InvalidRequest("codebuild.create_project", err.to_string()))?;
        let logs = LogsConfig::builder()
            .cloud_watch_logs(
                CloudWatchLogsConfig::builder()
                    .status(LogsConfigStatusType::Enabled)
                    .build()
                    .map_err(|err| {
                        EngineError::InvalidRequest("codebuild.create_project", err.to_string())
                    })?,
            )
            .build();

        loop {
            let created = retry("codebuild.create_project", || {
                codebuild
                    .create_project()
                    .name(&project_name)
                    .service_role(role_arn)
                    .source(source.clone())
                    .artifacts(artifacts.clone())
                    .environment(environment.clone())
                    .timeout_in_minutes(DEFAULT_BUILD_TIMEOUT_MINUTES as i32)
                    .logs_config(logs.clone())
                    .send()
            })
            .await;

            match created {
                Ok(output) => {
                    return output
                        .project
                        .and_then(|project| project.arn)
                        .ok_or(EngineError::MissingField(
                            "codebuild.create_project",
                            "project arn",
                        ));
                }
                Err(err) if classify(&err) == ErrorKind::AlreadyExists => {
                    return Ok(format!(
                        "arn:aws:codebuild:{}:{}:project/{}",
                        ctx.region, ctx.external_account_id, project_name
                    ));
                }
                Err(err) => {
                    let message = err.message().unwrap_or_default();
                    if message.contains("not supported for ARM_CONTAINER") {
                        return Err(EngineError::CreateResource(format!(
                            "CodeBuild does not support the arm64 architecture in the {} region",
                            ctx.region
                        )));
                    }
                    if message.contains("not authorized to perform: sts:AssumeRole") {
                        // the service role has not propagated yet
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    return Err(EngineError::aws("codebuild.create_project", err));
                }
            }
        }
    }
}

#[async_trait]
impl EngineAdapter for CodeBuildEngine {
    fn default_image(&self, architecture: Architecture) -> String {
        match architecture {
            Architecture::X86_64 => "aws/codebuild/amazonlinux2-x86_64-standard:5.0".to_string(),
            Architecture::Arm64 => "aws/codebuild/amazonlinux2-aarch64-standard:3.0".to_string(),
        }
    }

    fn default_build_timeout_minutes(&self) -> u32 {
        DEFAULT_BUILD_TIMEOUT_MINUTES
    }

    async fn create_resource(&self, ctx: &EngineContext) -> Result<Resource, EngineError> {
        if ctx.architecture == Architecture::Arm64
            && !matches!(ctx.compute, Compute::Small | Compute::Large)
        {
            return Err(EngineError::CreateResource(format!(
                "CodeBuild does not support the \"{}\" compute size for the arm64 architecture",
                ctx.compute
            )));
        }

        let role = self.create_role(ctx).await?;
        let project = self.create_project(ctx, &role).await?;
        register_event_forwarding(ctx).await?;
        Ok(Resource::Codebuild { role, project })
    }

    async fn remove_resource(
        &self,
        ctx: &EngineContext,
        resource: &Resource,
    ) -> Result<(), EngineError> {
        let Resource::Codebuild { role, project } = resource else {
            return Ok(());
        };

        let iam = ctx.iam();
        if let Some(role_name) = role.split('/').next_back() {
            if let Err(err) = retry("iam.delete_role_policy", || {
                iam.delete_role_policy()
                    .role_name(role_name)
                    .policy_name("default")
                    .send()
            })
            .await
            {
                tracing::warn!(role_name, code = ?err.code(), "failed to delete role policy");
            }

            if let Err(err) = retry("iam.delete_role", || {
                iam.delete_role().role_name(role_name).send()
            })
            .await
            {
                tracing::warn!(role_name, code = ?err.code(), "failed to delete role");
            }
        }

        if let Some(project_name) = project.split('/').next_back() {
            let codebuild = ctx.codebuild();
            if let Err(err) = retry("codebuild.delete_project", || {
                codebuild.delete_project().name(project_name).send()
            })
            .await
            {
                tracing::warn!(project_name, code = ?err.code(), "failed to delete project");
            }
        }

        Ok(())
    }

    async fn invoke(
        &self,
        ctx: &EngineContext,
        resource: &Resource,
        payload: &RunnerPayload,
        timeout_minutes: u32,
    ) -> Result<(), EngineError> {
        let Resource::Codebuild { project, .. } = resource else {
            return Ok(());
        };
        let Some(project_name) = project.split('/').next_back() else {
            return Ok(());
        };

        let body = serde_json::to_string(payload)?;
        let buildspec = invoke_buildspec(project_name, payload.buildspec());
        let event = EnvironmentVariable::builder()
            .name(PAYLOAD_ENV_VAR)
            .value(&body)
            .build()
            .map_err(|err| EngineError::InvalidRequest("codebuild.start_build", err.to_string()))?;

        let codebuild = ctx.codebuild();
        retry("codebuild.start_build", || {
            codebuild
                .start_build()
                .project_name(project_name)
                .buildspec_override(&buildspec)
                .environment_variables_override(event.clone())
                .timeout_in_minutes_override(timeout_minutes as i32)
                .send()
        })
        .await
        .map_err(|err| EngineError::aws("codebuild.start_build", err))?;

        Ok(())
    }
}

/// Buildspec the project is created with; only used when a build is started
/// without an override
fn bootstrap_buildspec() -> String {
    [
        "version: 0.2",
        "phases:",
        "  build:",
        "    commands:",
        "      - curl -fsSL https://install.caravel.dev/cli | bash",
    ]
    .join("\n")
}

/// Buildspec override for a real dispatch: bootstraps the CLI, downloads the
/// versioned runner bundle and executes it with the payload from the
/// environment
fn invoke_buildspec(project_name: &str, buildspec: &BuildspecSource) -> String {
    [
        "version: 0.2".to_string(),
        "phases:".to_string(),
        "  build:".to_string(),
        "    commands:".to_string(),
        "      - curl -fsSL https://install.caravel.dev/cli | bash && mv /root/.caravel/bin/caravel /usr/local/bin/caravel".to_string(),
        "      - rm -rf /tmp/buildspec && mkdir -p /tmp/buildspec".to_string(),
        format!(
            "      - curl -o /tmp/buildspec/runner.mjs https://{}.s3.amazonaws.com/buildspec/{}/runner.mjs",
            buildspec.bucket, buildspec.version
        ),
        format!(
            "      - node /tmp/buildspec/runner.mjs \"${}\" /aws/codebuild/{} \"$CODEBUILD_LOG_PATH\"",
            PAYLOAD_ENV_VAR, project_name
        ),
    ]
    .join("\n")
}

fn compute_type(compute: Compute) -> ComputeType {
    match compute {
        Compute::Small => ComputeType::BuildGeneral1Small,
        Compute::Medium => ComputeType::BuildGeneral1Medium,
        Compute::Large => ComputeType::BuildGeneral1Large,
        Compute::Xlarge => ComputeType::BuildGeneral1Xlarge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_core::domain::runner::{Engine, ResolvedRunnerConfig};
    use caravel_core::payload::Credentials;

    use crate::engine::EngineContext;

    fn context(architecture: Architecture, compute: Compute) -> EngineContext {
        let config = crate::config::test_config();
        let resolved = ResolvedRunnerConfig {
            engine: Engine::Codebuild,
            architecture,
            image: CodeBuildEngine::new().default_image(architecture),
            compute,
            timeout_minutes: None,
        };
        EngineContext::new(
            &config,
            &resolved,
            "us-east-1".to_string(),
            "123456789012".to_string(),
            Credentials {
                access_key_id: "AKIA".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: "token".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_arm_rejects_unsupported_compute() {
        let engine = CodeBuildEngine::new();
        for compute in [Compute::Medium, Compute::Xlarge] {
            let err = engine
                .create_resource(&context(Architecture::Arm64, compute))
                .await
                .unwrap_err();
            match err {
                EngineError::CreateResource(message) => {
                    assert!(message.contains(compute.as_str()));
                    assert!(message.contains("arm64"));
                }
                other => panic!("expected CreateResource error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_compute_mapping() {
        assert_eq!(compute_type(Compute::Small), ComputeType::BuildGeneral1Small);
        assert_eq!(compute_type(Compute::Large), ComputeType::BuildGeneral1Large);
    }

    #[test]
    fn test_invoke_buildspec_interpolates_bundle_location() {
        let buildspec = invoke_buildspec(
            "caravel-runner-x86_64-abcd1234",
            &BuildspecSource {
                version: "v42".to_string(),
                bucket: "caravel-buildspec".to_string(),
            },
        );
        assert!(buildspec.contains("https://caravel-buildspec.s3.amazonaws.com/buildspec/v42/runner.mjs"));
        assert!(buildspec.contains("/aws/codebuild/caravel-runner-x86_64-abcd1234"));
        assert!(buildspec.contains(PAYLOAD_ENV_VAR));
        assert!(buildspec.starts_with("version: 0.2\n"));
    }

    #[test]
    fn test_default_images() {
        let engine = CodeBuildEngine::new();
        assert!(engine.default_image(Architecture::X86_64).contains("x86_64"));
        assert!(engine.default_image(Architecture::Arm64).contains("aarch64"));
    }
}
