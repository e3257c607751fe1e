//! Runner service
//!
//! The registry over persisted runners: lookup by identity key, creation with
//! placeholder-then-backfill, warm-keeping and idle removal.

use chrono::{Duration, Utc};
use uuid::Uuid;

use caravel_core::domain::runner::{
    Architecture, Compute, ResolvedRunnerConfig, Runner, RunnerConfig,
};
use caravel_core::event::{RunnerRemover, RunnerWarmer};
use caravel_core::payload::{BuildspecSource, Credentials, RunnerPayload};
use sqlx::PgPool;

use crate::aws::credentials::CredentialError;
use crate::engine::{self, EngineAdapter, EngineContext, EngineError};
use crate::git::GitError;
use crate::repository::{app as app_repository, runner as runner_repository};
use crate::repository::runner::RunnerKey;
use crate::service::Deps;
use crate::service::scheduler::{self, ScheduleError};

/// A runner that has not been used by any stage for this long stops being
/// kept warm
const RUNNER_WARM_INACTIVE_DAYS: i64 = 1;

/// Service error type
#[derive(Debug)]
pub enum RunnerError {
    NotFound(Uuid),
    Engine(EngineError),
    Schedule(ScheduleError),
    Credential(CredentialError),
    Git(GitError),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for RunnerError {
    fn from(err: sqlx::Error) -> Self {
        RunnerError::DatabaseError(err)
    }
}

impl From<EngineError> for RunnerError {
    fn from(err: EngineError) -> Self {
        RunnerError::Engine(err)
    }
}

impl From<ScheduleError> for RunnerError {
    fn from(err: ScheduleError) -> Self {
        RunnerError::Schedule(err)
    }
}

impl From<CredentialError> for RunnerError {
    fn from(err: CredentialError) -> Self {
        RunnerError::Credential(err)
    }
}

impl From<GitError> for RunnerError {
    fn from(err: GitError) -> Self {
        RunnerError::Git(err)
    }
}

/// Identity key for a run's runner request
pub fn runner_key(
    deps: &Deps,
    workspace_id: Uuid,
    aws_account_id: Uuid,
    app_repo_id: Uuid,
    region: &str,
    config: &RunnerConfig,
) -> (RunnerKey, ResolvedRunnerConfig) {
    let resolved = engine::resolve_config(&deps.engines, config);
    let key = RunnerKey {
        workspace_id,
        aws_account_id,
        app_repo_id,
        region: region.to_string(),
        engine: resolved.engine,
        runner_type: resolved.fingerprint(),
    };
    (key, resolved)
}

/// Creates a runner: claim the identity key with a placeholder row, provision
/// through the engine, then backfill the resource
///
/// The idle remover is scheduled up front so even a runner that is never used
/// gets reaped. On any provisioning failure the placeholder is deleted before
/// the error is rethrown, so lookups never see a half-created runner.
pub async fn create(
    pool: &PgPool,
    deps: &Deps,
    key: &RunnerKey,
    resolved: &ResolvedRunnerConfig,
    external_account_id: &str,
    credentials: Credentials,
) -> Result<Runner, RunnerError> {
    let runner_id = Uuid::new_v4();

    scheduler::schedule_runner_remover(
        deps.scheduler.as_ref(),
        &deps.config,
        key.workspace_id,
        runner_id,
    )
    .await?;

    runner_repository::insert_placeholder(pool, runner_id, key).await?;

    let ctx = EngineContext::new(
        &deps.config,
        resolved,
        key.region.clone(),
        external_account_id.to_string(),
        credentials,
    );
    let adapter = deps.engines.get(resolved.engine);

    let provisioned: Result<_, RunnerError> = async {
        let resource = adapter.create_resource(&ctx).await?;
        runner_repository::set_resource(pool, key.workspace_id, runner_id, &resource).await?;
        Ok(resource)
    }
    .await;

    let resource = match provisioned {
        Ok(resource) => resource,
        Err(err) => {
            if let Err(cleanup) =
                runner_repository::delete(pool, key.workspace_id, runner_id).await
            {
                tracing::error!(%runner_id, error = ?cleanup, "failed to delete placeholder runner");
            }
            return Err(err);
        }
    };

    tracing::info!(%runner_id, engine = %resolved.engine, region = %key.region, "runner created");

    let now = Utc::now();
    Ok(Runner {
        id: runner_id,
        workspace_id: key.workspace_id,
        aws_account_id: key.aws_account_id,
        app_repo_id: key.app_repo_id,
        region: key.region.clone(),
        engine: resolved.engine,
        runner_type: key.runner_type.clone(),
        resource: Some(resource),
        warmer: None,
        time_run: None,
        time_created: now,
        time_updated: now,
    })
}

/// Tears down a runner's cloud resources and deletes its row
pub async fn remove(
    pool: &PgPool,
    deps: &Deps,
    runner: &Runner,
    external_account_id: &str,
    credentials: Credentials,
) -> Result<(), RunnerError> {
    if let Some(resource) = &runner.resource {
        let ctx = EngineContext::new(
            &deps.config,
            &resolved_for(runner),
            runner.region.clone(),
            external_account_id.to_string(),
            credentials,
        );
        deps.engines
            .get(runner.engine)
            .remove_resource(&ctx, resource)
            .await?;
    }

    runner_repository::delete(pool, runner.workspace_id, runner.id).await?;
    tracing::info!(runner_id = %runner.id, "runner removed");
    Ok(())
}

/// Dispatches warm invocations, unordered and uncapped
pub async fn warm(
    adapter: &dyn EngineAdapter,
    ctx: &EngineContext,
    runner: &Runner,
    payload: &RunnerPayload,
    instances: usize,
) -> Result<(), EngineError> {
    let Some(resource) = &runner.resource else {
        return Ok(());
    };
    let timeout = adapter.default_build_timeout_minutes();

    let results = futures::future::join_all(
        (0..instances).map(|_| adapter.invoke(ctx, resource, payload, timeout)),
    )
    .await;

    results.into_iter().collect()
}

// =============================================================================
// Scheduled-event handlers
// =============================================================================

/// Warm-keep trigger: invoke the runner with warm payloads, then re-register
///
/// Warming stops once no stage has used the runner for a day, except for a
/// freshly created runner that has never run at all.
pub async fn handle_warmer(
    pool: &PgPool,
    deps: &Deps,
    event: RunnerWarmer,
) -> Result<(), RunnerError> {
    let workspace_id = event.workspace_id;
    let Some(runner) = runner_repository::find_by_id(pool, workspace_id, event.runner_id).await?
    else {
        return Ok(());
    };
    if runner.resource.is_none() {
        return Ok(());
    }

    let since = Utc::now() - Duration::days(RUNNER_WARM_INACTIVE_DAYS);
    let usage = runner_repository::usage_count_since(pool, workspace_id, runner.id, since).await?;
    if usage == 0 && runner.time_run.is_some() {
        tracing::info!(runner_id = %runner.id, "runner idle, stopping warmer");
        runner_repository::unset_warmer(pool, workspace_id, runner.id).await?;
        return Ok(());
    }

    let Some(app_repo) =
        app_repository::app_repo_by_id(pool, workspace_id, runner.app_repo_id).await?
    else {
        return Ok(());
    };
    let clone_url = deps
        .git
        .clone_url(&app_repo.repo_owner, &app_repo.repo_name)
        .await?;

    let Some(account) =
        app_repository::aws_account_by_id(pool, workspace_id, runner.aws_account_id).await?
    else {
        return Ok(());
    };
    let Some(credentials) = deps.credentials.assume_role(&account.account_id).await? else {
        return Ok(());
    };

    let ctx = EngineContext::new(
        &deps.config,
        &resolved_for(&runner),
        runner.region.clone(),
        account.account_id.clone(),
        credentials.clone(),
    );
    let payload = RunnerPayload::warm(clone_url, buildspec(deps), credentials);
    let instances = usage.max(1) as usize;
    warm(deps.engines.get(runner.engine), &ctx, &runner, &payload, instances).await?;

    let name = scheduler::schedule_runner_warmer(
        deps.scheduler.as_ref(),
        &deps.config,
        workspace_id,
        runner.id,
    )
    .await?;
    runner_repository::set_warmer(pool, workspace_id, runner.id, &name).await?;

    Ok(())
}

/// Idle-reaper trigger: remove the runner unless a stage used it since the
/// threshold, in which case check again after the next window
pub async fn handle_remover(
    pool: &PgPool,
    deps: &Deps,
    event: RunnerRemover,
) -> Result<(), RunnerError> {
    let workspace_id = event.workspace_id;
    let Some(runner) = runner_repository::find_by_id(pool, workspace_id, event.runner_id).await?
    else {
        return Ok(());
    };

    let used = runner_repository::usage_count_since(
        pool,
        workspace_id,
        runner.id,
        event.remove_if_not_used_after,
    )
    .await?;
    if used > 0 {
        scheduler::schedule_runner_remover(
            deps.scheduler.as_ref(),
            &deps.config,
            workspace_id,
            runner.id,
        )
        .await?;
        return Ok(());
    }

    let Some(account) =
        app_repository::aws_account_by_id(pool, workspace_id, runner.aws_account_id).await?
    else {
        return Ok(());
    };
    let Some(credentials) = deps.credentials.assume_role(&account.account_id).await? else {
        return Ok(());
    };

    remove(pool, deps, &runner, &account.account_id, credentials).await
}

/// Buildspec bundle location runners download from
pub fn buildspec(deps: &Deps) -> BuildspecSource {
    BuildspecSource {
        version: deps.config.buildspec_version.clone(),
        bucket: deps.config.buildspec_bucket.clone(),
    }
}

/// Reconstructs the resolved config a runner row was created from
fn resolved_for(runner: &Runner) -> ResolvedRunnerConfig {
    ResolvedRunnerConfig::from_fingerprint(&runner.runner_type).unwrap_or(ResolvedRunnerConfig {
        engine: runner.engine,
        architecture: Architecture::X86_64,
        image: String::new(),
        compute: Compute::Small,
        timeout_minutes: None,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use caravel_core::domain::runner::{Engine, Resource};
    use crate::engine::EngineContext;

    /// Counts invocations instead of calling AWS
    pub(crate) struct FakeEngine {
        pub invokes: AtomicUsize,
        pub warm_invokes: AtomicUsize,
    }

    impl FakeEngine {
        pub(crate) fn new() -> Self {
            Self {
                invokes: AtomicUsize::new(0),
                warm_invokes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EngineAdapter for FakeEngine {
        fn default_image(&self, architecture: Architecture) -> String {
            format!("fake:{architecture}")
        }

        fn default_build_timeout_minutes(&self) -> u32 {
            15
        }

        async fn create_resource(&self, _ctx: &EngineContext) -> Result<Resource, EngineError> {
            Ok(Resource::Lambda {
                role: "arn:aws:iam::123456789012:role/fake".to_string(),
                function: "arn:aws:lambda:us-east-1:123456789012:function:fake".to_string(),
            })
        }

        async fn remove_resource(
            &self,
            _ctx: &EngineContext,
            _resource: &Resource,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        async fn invoke(
            &self,
            _ctx: &EngineContext,
            _resource: &Resource,
            payload: &RunnerPayload,
            _timeout_minutes: u32,
        ) -> Result<(), EngineError> {
            if payload.is_warm() {
                self.warm_invokes.fetch_add(1, Ordering::SeqCst);
            } else {
                self.invokes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn test_runner(engine: Engine) -> Runner {
        let now = Utc::now();
        Runner {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            aws_account_id: Uuid::new_v4(),
            app_repo_id: Uuid::new_v4(),
            region: "us-east-1".to_string(),
            engine,
            runner_type: format!("{engine}:x86_64:small:fake:x86_64"),
            resource: Some(Resource::Lambda {
                role: "arn:aws:iam::123456789012:role/fake".to_string(),
                function: "arn:aws:lambda:us-east-1:123456789012:function:fake".to_string(),
            }),
            warmer: None,
            time_run: None,
            time_created: now,
            time_updated: now,
        }
    }

    fn test_context(runner: &Runner) -> EngineContext {
        EngineContext::new(
            &crate::config::test_config(),
            &resolved_for(runner),
            runner.region.clone(),
            "123456789012".to_string(),
            Credentials {
                access_key_id: "AKIA".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: "token".to_string(),
            },
        )
    }

    fn warm_payload() -> RunnerPayload {
        RunnerPayload::warm(
            "https://github.com/acme/storefront.git".to_string(),
            BuildspecSource {
                version: "v42".to_string(),
                bucket: "caravel-buildspec".to_string(),
            },
            Credentials {
                access_key_id: "AKIA".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: "token".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_warm_dispatches_one_invoke_per_instance() {
        let engine = FakeEngine::new();
        let runner = test_runner(Engine::Lambda);
        let ctx = test_context(&runner);

        warm(&engine, &ctx, &runner, &warm_payload(), 3).await.unwrap();
        assert_eq!(engine.warm_invokes.load(Ordering::SeqCst), 3);
        assert_eq!(engine.invokes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_warm_skips_unprovisioned_runner() {
        let engine = FakeEngine::new();
        let mut runner = test_runner(Engine::Lambda);
        runner.resource = None;
        let ctx = test_context(&runner);

        warm(&engine, &ctx, &runner, &warm_payload(), 2).await.unwrap();
        assert_eq!(engine.warm_invokes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resolved_for_parses_fingerprint() {
        let runner = test_runner(Engine::Codebuild);
        let resolved = resolved_for(&runner);
        assert_eq!(resolved.engine, Engine::Codebuild);
        assert_eq!(resolved.image, "fake:x86_64");
    }

    #[test]
    fn test_resolved_for_survives_unknown_fingerprint() {
        let mut runner = test_runner(Engine::Lambda);
        runner.runner_type = "garbage".to_string();
        let resolved = resolved_for(&runner);
        assert_eq!(resolved.engine, Engine::Lambda);
        assert_eq!(resolved.compute, Compute::Small);
    }
}
