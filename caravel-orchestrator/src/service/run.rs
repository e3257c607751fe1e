//! Run service
//!
//! Business logic for the run lifecycle: creation from a push event, the
//! orchestration state machine that dispatches at most one run per stage,
//! idempotent completion, and the timeout watchdog handler.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use caravel_core::domain::run::{DeployConfig, LogPointer, Run};
use caravel_core::domain::runner::{Engine, ResolvedRunnerConfig, Runner};
use caravel_core::domain::trigger::Trigger;
use caravel_core::event::{RunCompleted, RunCreated, RunTimeout, RunnerStarted};
use caravel_core::payload::RunPayload;

use crate::aws::credentials::CredentialError;
use crate::aws::events::{ControlEvent, PublishError};
use crate::aws::poll_until;
use crate::engine::{EngineAdapter, EngineContext, EngineError};
use crate::git::GitError;
use crate::repository::{
    self, app as app_repository, run as run_repository, run_config as run_config_repository,
    runner as runner_repository, state as state_repository,
};
use crate::service::Deps;
use crate::service::runner::{self as runner_service, RunnerError};
use crate::service::scheduler::{self, ScheduleError};

/// Budget for waiting out a concurrent runner creation
const RUNNER_WAIT_BUDGET: Duration = Duration::from_secs(120);

/// Interval between lookups while waiting
const RUNNER_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// Region used when the app's config does not pin one
const DEFAULT_REGION: &str = "us-east-1";

/// Service error type
#[derive(Debug)]
pub enum RunError {
    NotFound(Uuid),
    StageNotFound(Uuid),
    RepoNotFound(Uuid),
    AccountNotLinked(String),
    RunnerUnavailable,
    Runner(RunnerError),
    Engine(EngineError),
    Schedule(ScheduleError),
    Credential(CredentialError),
    Git(GitError),
    Publish(PublishError),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for RunError {
    fn from(err: sqlx::Error) -> Self {
        RunError::DatabaseError(err)
    }
}

impl From<RunnerError> for RunError {
    fn from(err: RunnerError) -> Self {
        RunError::Runner(err)
    }
}

impl From<EngineError> for RunError {
    fn from(err: EngineError) -> Self {
        RunError::Engine(err)
    }
}

impl From<ScheduleError> for RunError {
    fn from(err: ScheduleError) -> Self {
        RunError::Schedule(err)
    }
}

impl From<CredentialError> for RunError {
    fn from(err: CredentialError) -> Self {
        RunError::Credential(err)
    }
}

impl From<GitError> for RunError {
    fn from(err: GitError) -> Self {
        RunError::Git(err)
    }
}

impl From<PublishError> for RunError {
    fn from(err: PublishError) -> Self {
        RunError::Publish(err)
    }
}

/// Dispatch phase, used to give terminal errors user-readable context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initialize,
    Lookup,
    Create,
    Start,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Initialize => "initialize runner",
            Phase::Lookup => "lookup existing runner",
            Phase::Create => "create runner",
            Phase::Start => "start runner",
        }
    }
}

fn at<E: Into<RunError>>(phase: Phase) -> impl Fn(E) -> (Phase, RunError) {
    move |err| (phase, err.into())
}

/// The run's surfaced failure reason: an engine message written for the user
/// when there is one, otherwise the phase that failed
fn terminal_message(phase: Phase, error: &RunError) -> String {
    match error {
        RunError::Engine(EngineError::CreateResource(message))
        | RunError::Runner(RunnerError::Engine(EngineError::CreateResource(message))) => {
            message.clone()
        }
        _ => format!("Failed to {}", phase.as_str()),
    }
}

// =============================================================================
// Creation
// =============================================================================

/// A parsed push event ready to become a run
#[derive(Debug)]
pub struct CreateRun {
    pub workspace_id: Uuid,
    pub app_id: Uuid,
    pub trigger: Trigger,
    pub config: DeployConfig,
}

/// Queues a run for the push, creating the stage on first deploy
///
/// Returns `None` when no run config targets the stage — the push simply does
/// not autodeploy.
pub async fn create_run(
    pool: &PgPool,
    deps: &Deps,
    input: CreateRun,
) -> Result<Option<Uuid>, RunError> {
    let configs =
        run_config_repository::list_by_app(pool, input.workspace_id, input.app_id).await?;
    let Some(run_config) = run_config_repository::match_stage(&configs, &input.config.stage)
    else {
        tracing::info!(stage = %input.config.stage, "no run config targets stage, skipping");
        return Ok(None);
    };

    let Some(account) = app_repository::aws_account_by_external_id(
        pool,
        input.workspace_id,
        &run_config.aws_account_external_id,
    )
    .await?
    else {
        return Err(RunError::AccountNotLinked(
            run_config.aws_account_external_id.clone(),
        ));
    };

    let region = input
        .config
        .region
        .clone()
        .unwrap_or_else(|| DEFAULT_REGION.to_string());
    let stage_id = app_repository::connect_stage(
        pool,
        input.workspace_id,
        input.app_id,
        &input.config.stage,
        &region,
        account.id,
    )
    .await?;

    let run_id = Uuid::new_v4();
    let state_update_id = Uuid::new_v4();

    let mut tx = pool.begin().await?;
    run_repository::create(
        &mut tx,
        run_repository::NewRun {
            id: run_id,
            workspace_id: input.workspace_id,
            stage_id,
            state_update_id,
            trigger: input.trigger,
            config: input.config,
        },
    )
    .await?;
    state_repository::create_update(&mut tx, state_update_id, input.workspace_id, stage_id, run_id)
        .await?;
    tx.commit().await?;

    tracing::info!(%run_id, %stage_id, "run created");

    deps.publisher
        .publish(ControlEvent::RunCreated(RunCreated {
            workspace_id: input.workspace_id,
            app_id: input.app_id,
            stage_id,
            run_id,
        }))
        .await?;

    Ok(Some(run_id))
}

/// Get a run by ID
pub async fn get_run(pool: &PgPool, workspace_id: Uuid, run_id: Uuid) -> Result<Run, RunError> {
    run_repository::find_by_id(pool, workspace_id, run_id)
        .await?
        .ok_or(RunError::NotFound(run_id))
}

// =============================================================================
// Orchestration
// =============================================================================

/// Splits the incomplete queue into the run to dispatch and the runs it
/// supersedes; `None` when there is nothing to do or a run is already active
fn partition_queue(runs: &[Run]) -> Option<(&Run, &[Run])> {
    if runs.is_empty() || runs.iter().any(Run::is_active) {
        return None;
    }
    Some((&runs[0], &runs[1..]))
}

/// Dispatches the stage's oldest queued run, if any
///
/// Safe to invoke concurrently: the active-slot uniqueness constraint decides
/// the winner and everyone else backs off silently.
pub async fn orchestrate(
    pool: &PgPool,
    deps: &Deps,
    workspace_id: Uuid,
    stage_id: Uuid,
) -> Result<(), RunError> {
    let runs = run_repository::incomplete_by_stage(pool, workspace_id, stage_id).await?;
    let Some((winner, superseded)) = partition_queue(&runs) else {
        return Ok(());
    };

    let now = Utc::now();
    let mut tx = pool.begin().await?;
    match run_repository::mark_active(&mut tx, workspace_id, winner.id).await {
        Ok(0) => {
            // another invocation claimed or completed this run first
            tracing::info!(run_id = %winner.id, %stage_id, "run already claimed, backing off");
            return Ok(());
        }
        Ok(_) => {}
        Err(err) if repository::is_unique_violation(&err) => {
            tracing::info!(run_id = %winner.id, %stage_id, "lost the activation race, backing off");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }
    if !superseded.is_empty() {
        let run_ids: Vec<Uuid> = superseded.iter().map(|run| run.id).collect();
        let update_ids: Vec<Uuid> = superseded.iter().map(|run| run.state_update_id).collect();
        run_repository::skip(&mut tx, workspace_id, &run_ids, now).await?;
        state_repository::complete_updates(&mut tx, workspace_id, &update_ids, now, None).await?;
        tracing::info!(count = superseded.len(), %stage_id, "superseded stale queued runs");
    }
    tx.commit().await?;

    let run = winner.clone();
    match dispatch(pool, deps, &run).await {
        Ok(Some(dispatched)) => {
            scheduler::schedule_run_timeout(
                deps.scheduler.as_ref(),
                &deps.config,
                workspace_id,
                run.id,
                dispatched.timeout_minutes,
            )
            .await?;

            if dispatched.runner.warmer.is_none() {
                let name = scheduler::schedule_runner_warmer(
                    deps.scheduler.as_ref(),
                    &deps.config,
                    workspace_id,
                    dispatched.runner.id,
                )
                .await?;
                runner_repository::set_warmer(pool, workspace_id, dispatched.runner.id, &name)
                    .await?;
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err((phase, err)) => {
            let message = terminal_message(phase, &err);
            tracing::error!(run_id = %run.id, phase = phase.as_str(), error = ?err, "dispatch failed");
            complete(pool, deps, workspace_id, run.id, Some(message)).await?;
            Err(err)
        }
    }
}

struct Dispatched {
    runner: Runner,
    timeout_minutes: u32,
}

async fn dispatch(
    pool: &PgPool,
    deps: &Deps,
    run: &Run,
) -> Result<Option<Dispatched>, (Phase, RunError)> {
    let workspace_id = run.workspace_id;

    let stage = app_repository::stage_by_id(pool, workspace_id, run.stage_id)
        .await
        .map_err(at(Phase::Initialize))?
        .ok_or((Phase::Initialize, RunError::StageNotFound(run.stage_id)))?;
    let app_repo = app_repository::app_repo_by_app(pool, workspace_id, stage.app_id)
        .await
        .map_err(at(Phase::Initialize))?
        .ok_or((Phase::Initialize, RunError::RepoNotFound(stage.app_id)))?;

    // A stage without a usable account link is not completed here; the
    // timeout monitor picks the run up if the link never materializes.
    let Some(account_row_id) = stage.aws_account_id else {
        tracing::warn!(stage_id = %stage.id, "stage has no linked account");
        return Ok(None);
    };
    let Some(account) = app_repository::aws_account_by_id(pool, workspace_id, account_row_id)
        .await
        .map_err(at(Phase::Initialize))?
    else {
        return Ok(None);
    };
    let Some(credentials) = deps
        .credentials
        .assume_role(&account.account_id)
        .await
        .map_err(at(Phase::Initialize))?
    else {
        return Ok(None);
    };

    let (key, resolved) = runner_service::runner_key(
        deps,
        workspace_id,
        account_row_id,
        app_repo.id,
        &stage.region,
        &run.config.runner,
    );

    // Bounded wait: a row without a resource means another process is
    // mid-creation; absence means nobody is.
    let lookup_pool = pool.clone();
    let lookup_key = key.clone();
    let existing = poll_until(RUNNER_WAIT_BUDGET, RUNNER_WAIT_INTERVAL, move || {
        let pool = lookup_pool.clone();
        let key = lookup_key.clone();
        async move {
            let runner = runner_repository::lookup(&pool, &key).await?;
            Ok::<_, sqlx::Error>(match runner {
                Some(runner) if runner.resource.is_none() => {
                    tracing::info!(runner_id = %runner.id, "waiting for runner being created");
                    None
                }
                other => Some(other),
            })
        }
    })
    .await
    .map_err(at(Phase::Lookup))?;

    let runner = match existing {
        Some(Some(runner)) => runner,
        Some(None) => runner_service::create(
            pool,
            deps,
            &key,
            &resolved,
            &account.account_id,
            credentials.clone(),
        )
        .await
        .map_err(at(Phase::Create))?,
        None => return Err((Phase::Create, RunError::RunnerUnavailable)),
    };
    let Some(resource) = runner.resource.clone() else {
        return Err((Phase::Create, RunError::RunnerUnavailable));
    };

    let env = resolve_env(pool, &stage, run)
        .await
        .map_err(at(Phase::Start))?;
    let clone_url = deps
        .git
        .clone_url(&app_repo.repo_owner, &app_repo.repo_name)
        .await
        .map_err(at(Phase::Start))?;

    let adapter = deps.engines.get(resolved.engine);
    let timeout_minutes = build_timeout_minutes(&resolved, adapter);
    let payload = RunPayload {
        warm: false,
        engine: resolved.engine,
        run_id: run.id,
        workspace_id,
        state_update_id: run.state_update_id,
        stage: stage.name.clone(),
        env,
        clone_url,
        buildspec: runner_service::buildspec(deps),
        credentials: credentials.clone(),
        trigger: run.trigger.clone(),
    }
    .into_payload();

    let ctx = EngineContext::new(
        &deps.config,
        &resolved,
        stage.region.clone(),
        account.account_id.clone(),
        credentials,
    );
    adapter
        .invoke(&ctx, &resource, &payload, timeout_minutes)
        .await
        .map_err(at(Phase::Start))?;

    tracing::info!(run_id = %run.id, runner_id = %runner.id, "run dispatched");

    let mut tx = pool.begin().await.map_err(at(Phase::Start))?;
    runner_repository::record_dispatch(&mut tx, workspace_id, runner.id, run.stage_id, Utc::now())
        .await
        .map_err(at(Phase::Start))?;
    tx.commit().await.map_err(at(Phase::Start))?;

    Ok(Some(Dispatched {
        runner,
        timeout_minutes,
    }))
}

/// Run-level timeout override, or the engine's default
fn build_timeout_minutes(resolved: &ResolvedRunnerConfig, adapter: &dyn EngineAdapter) -> u32 {
    resolved
        .timeout_minutes
        .unwrap_or_else(|| adapter.default_build_timeout_minutes())
}

/// Deployment environment for the stage: the matching run config's env with
/// the app-config overrides on top
async fn resolve_env(
    pool: &PgPool,
    stage: &app_repository::Stage,
    run: &Run,
) -> Result<HashMap<String, String>, sqlx::Error> {
    let configs =
        run_config_repository::list_by_app(pool, run.workspace_id, stage.app_id).await?;
    let mut env = run_config_repository::match_stage(&configs, &stage.name)
        .map(|config| config.env.clone())
        .unwrap_or_default();
    env.remove(run_config_repository::AWS_ACCOUNT_ENV_KEY);
    env.extend(run.config.env.clone());
    Ok(env)
}

// =============================================================================
// Completion
// =============================================================================

/// Transitions a run to its terminal state, exactly once
///
/// Callable concurrently from the dispatch failure path, the timeout monitor
/// and the runner's own completion event; whoever loses the guard observes
/// the already-completed row and no-ops.
pub async fn complete(
    pool: &PgPool,
    deps: &Deps,
    workspace_id: Uuid,
    run_id: Uuid,
    error: Option<String>,
) -> Result<(), RunError> {
    let Some(run) = run_repository::find_by_id(pool, workspace_id, run_id).await? else {
        return Ok(());
    };
    if run.is_completed() {
        return Ok(());
    }

    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let transitioned =
        run_repository::complete(&mut tx, workspace_id, run_id, error.as_deref(), now).await?;
    if transitioned == 0 {
        // someone else won between the read and the update
        return Ok(());
    }
    state_repository::complete_updates(
        &mut tx,
        workspace_id,
        &[run.state_update_id],
        now,
        error.as_deref(),
    )
    .await?;
    tx.commit().await?;

    tracing::info!(%run_id, error = ?error, "run completed");

    deps.publisher
        .publish(ControlEvent::RunCompleted(RunCompleted {
            workspace_id,
            run_id,
            error,
        }))
        .await?;

    Ok(())
}

// =============================================================================
// External signals
// =============================================================================

/// "runner.started": stamp the start time and the log pointer
pub async fn mark_started(pool: &PgPool, event: RunnerStarted) -> Result<(), RunError> {
    let log = match event.engine {
        Engine::Lambda => LogPointer::Lambda {
            request_id: event.aws_request_id.unwrap_or_default(),
            log_group: event.log_group,
            log_stream: event.log_stream,
            timestamp: event.timestamp.unwrap_or_default(),
        },
        Engine::Codebuild => LogPointer::Codebuild {
            log_group: event.log_group,
            log_stream: event.log_stream,
        },
    };

    run_repository::mark_started(pool, event.workspace_id, event.run_id, &log).await?;
    Ok(())
}

/// Timeout watchdog: force-complete a run still going past its deadline
pub async fn handle_timeout(
    pool: &PgPool,
    deps: &Deps,
    event: RunTimeout,
) -> Result<(), RunError> {
    let Some(run) = run_repository::find_by_id(pool, event.workspace_id, event.run_id).await?
    else {
        return Ok(());
    };
    if run.is_completed() {
        return Ok(());
    }

    complete(
        pool,
        deps,
        event.workspace_id,
        event.run_id,
        Some("Build timed out".to_string()),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_core::domain::runner::{Architecture, Compute, RunnerConfig};
    use caravel_core::domain::trigger::{
        TriggerAction, TriggerCommit, TriggerRepo, TriggerSender, TriggerSource,
    };

    use crate::service::runner::tests::FakeEngine;

    fn queued_run(active: Option<bool>, offset_seconds: i64) -> Run {
        let now = Utc::now() + chrono::Duration::seconds(offset_seconds);
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
            time_completed: None,
        }
    }

    #[test]
    fn test_partition_queue_empty() {
        assert!(partition_queue(&[]).is_none());
    }

    #[test]
    fn test_partition_queue_backs_off_when_active() {
        let runs = vec![queued_run(Some(true), 0), queued_run(None, 1)];
        assert!(partition_queue(&runs).is_none());
    }

    #[test]
    fn test_partition_queue_oldest_wins() {
        let runs = vec![queued_run(None, 0), queued_run(None, 1), queued_run(None, 2)];
        let (winner, superseded) = partition_queue(&runs).unwrap();
        assert_eq!(winner.id, runs[0].id);
        assert_eq!(superseded.len(), 2);
        assert!(superseded.iter().all(|run| run.id != winner.id));
    }

    #[test]
    fn test_terminal_message_prefers_engine_message() {
        let err = RunError::Runner(RunnerError::Engine(EngineError::CreateResource(
            "CodeBuild does not support the arm64 architecture in the us-west-1 region"
                .to_string(),
        )));
        assert_eq!(
            terminal_message(Phase::Create, &err),
            "CodeBuild does not support the arm64 architecture in the us-west-1 region"
        );
    }

    #[test]
    fn test_terminal_message_falls_back_to_phase() {
        let err = RunError::RunnerUnavailable;
        assert_eq!(terminal_message(Phase::Create, &err), "Failed to create runner");
        assert_eq!(
            terminal_message(Phase::Start, &RunError::StageNotFound(Uuid::new_v4())),
            "Failed to start runner"
        );
        assert_eq!(
            terminal_message(Phase::Lookup, &err),
            "Failed to lookup existing runner"
        );
    }

    #[test]
    fn test_build_timeout_prefers_run_config() {
        let adapter = FakeEngine::new();
        let mut resolved = ResolvedRunnerConfig {
            engine: Engine::Lambda,
            architecture: Architecture::X86_64,
            image: "fake:x86_64".to_string(),
            compute: Compute::Small,
            timeout_minutes: None,
        };
        assert_eq!(build_timeout_minutes(&resolved, &adapter), 15);

        resolved.timeout_minutes = Some(45);
        assert_eq!(build_timeout_minutes(&resolved, &adapter), 45);
    }
}
