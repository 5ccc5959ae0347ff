//! Migration Orchestrator
//!
//! Sequences a pipeline's stages, carries produced identifiers forward, and
//! records per-stage progress so a re-run skips completed work:
//! - stages recorded as succeeded are skipped with no remote calls
//! - any other stage re-enters its idempotency pre-check
//! - best-effort stage failures are recorded and the run continues
//! - a fatal failure stops the run and returns the partial state

use crate::domain::context::OperationContext;
use crate::domain::ports::{ClientProviderRef, Identifiers};
use crate::error::{Error, Result};
use crate::migration::config::PipelineDefinition;
use crate::migration::locks::{ResourceGuard, ResourceLocks};
use crate::migration::stage::MigrationStage;
use crate::migration::state::{PipelineRunState, RunStatus};
use crate::migration::store::{validate_run_id, RunStateStoreRef};
use crate::observability::{EventSinkRef, MigrationEvent, SkipReason};
use crate::retry::RetryConfig;
use crate::serde_util::option_seconds;
use crate::waiter::descriptor::Bindings;
use crate::waiter::model::WaiterModel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Settings shared by every run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retry policy for stages that do not declare their own
    pub default_retry: RetryConfig,
    /// Wall-clock bound for pipelines that do not declare their own
    #[serde(with = "option_seconds", skip_serializing_if = "Option::is_none")]
    pub run_timeout: Option<Duration>,
    /// Replaces every named waiter's poll interval (rehearsals)
    #[serde(with = "option_seconds", skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryConfig::default(),
            run_timeout: None,
            poll_interval: None,
        }
    }
}

impl OrchestratorConfig {
    fn waiter_model(&self, model: WaiterModel) -> WaiterModel {
        match self.poll_interval {
            Some(interval) => model.with_poll_interval(interval),
            None => model,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs pipelines against the clients of one source/destination pair
pub struct MigrationOrchestrator {
    config: OrchestratorConfig,
    clients: ClientProviderRef,
    waiters: Arc<WaiterModel>,
    store: RunStateStoreRef,
    locks: ResourceLocks,
    events: EventSinkRef,
}

impl MigrationOrchestrator {
    /// Create an orchestrator using the built-in waiters
    pub fn new(
        config: OrchestratorConfig,
        clients: ClientProviderRef,
        store: RunStateStoreRef,
        events: EventSinkRef,
    ) -> Self {
        Self {
            waiters: Arc::new(config.waiter_model(WaiterModel::builtin())),
            config,
            clients,
            store,
            locks: ResourceLocks::new(),
            events,
        }
    }

    /// Add custom waiters on top of the built-in ones
    pub fn with_waiters(mut self, custom: WaiterModel) -> Self {
        let mut model = WaiterModel::builtin();
        model.merge(custom);
        self.waiters = Arc::new(self.config.waiter_model(model));
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn waiters(&self) -> &WaiterModel {
        &self.waiters
    }

    pub fn store(&self) -> &RunStateStoreRef {
        &self.store
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    /// Check a pipeline without touching the control plane
    pub fn validate(&self, pipeline: &PipelineDefinition) -> Result<()> {
        pipeline.validate(&self.waiters)?;
        self.compile(pipeline).map(|_| ())
    }

    fn compile<'p>(&self, pipeline: &'p PipelineDefinition) -> Result<Vec<MigrationStage<'p>>> {
        pipeline
            .stages
            .iter()
            .map(|stage| {
                MigrationStage::compile(
                    stage,
                    self.clients.as_ref(),
                    &self.waiters,
                    &self.config.default_retry,
                )
            })
            .collect()
    }

    /// Start a new run
    pub async fn start(
        &self,
        pipeline: &PipelineDefinition,
        run_id: &str,
        inputs: Identifiers,
        cancel: CancellationToken,
    ) -> Result<PipelineRunState> {
        validate_run_id(run_id)?;
        if let Some(existing) = self.store.load(run_id).await? {
            return Err(if existing.status.is_terminal() {
                Error::Configuration(format!("run {} already exists; resume it instead", run_id))
            } else {
                Error::RunActive(run_id.to_string())
            });
        }
        let state = PipelineRunState::new(run_id, pipeline, inputs);
        self.execute(pipeline, state, cancel).await
    }

    /// Resume a stored run
    pub async fn resume(
        &self,
        pipeline: &PipelineDefinition,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<PipelineRunState> {
        let state = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        self.execute(pipeline, state, cancel).await
    }

    /// Drive `state` through the pipeline.
    ///
    /// On a fatal failure returns [`Error::RunAborted`] carrying the partial
    /// state, which has also been persisted.
    pub async fn execute(
        &self,
        pipeline: &PipelineDefinition,
        mut state: PipelineRunState,
        cancel: CancellationToken,
    ) -> Result<PipelineRunState> {
        pipeline.validate(&self.waiters)?;
        state.reconcile(pipeline)?;
        for input in &pipeline.inputs {
            if !state.inputs.contains_key(input) {
                return Err(Error::MissingInput {
                    stage: pipeline.name.clone(),
                    input: input.clone(),
                });
            }
        }
        let stages = self.compile(pipeline)?;

        let _guard = self.lock_target(pipeline, &state, &cancel).await?;

        let ctx = OperationContext::new(state.run_id.clone(), cancel, self.events.clone());
        let started = Instant::now();
        let deadline = pipeline
            .timeout
            .or(self.config.run_timeout)
            .map(|limit| (limit, started + limit));

        let resume_at = state.resume_index();
        state.set_status(RunStatus::Running);
        state.error = None;
        self.store.save(&state).await?;

        info!(
            run_id = %state.run_id,
            pipeline = %pipeline.name,
            resume_at,
            stages = stages.len(),
            "Starting pipeline run"
        );
        ctx.emit(MigrationEvent::RunStarted {
            run_id: state.run_id.clone(),
            pipeline: pipeline.name.clone(),
            resume_at,
        });

        for stage in &stages {
            let name = stage.name();
            if state.is_succeeded(name) {
                debug!(run_id = %state.run_id, stage = %name, "Stage already succeeded, skipping");
                ctx.emit(MigrationEvent::StageSkipped {
                    run_id: state.run_id.clone(),
                    stage: name.to_string(),
                    reason: SkipReason::AlreadySucceeded,
                });
                continue;
            }

            if let Err(err) = ctx.check_cancelled() {
                return Err(self.abort(state, name, false, err, started, &ctx).await);
            }
            if let Some((limit, at)) = deadline {
                if Instant::now() >= at {
                    return Err(self.abort(state, name, false, Error::RunTimeout(limit), started, &ctx).await);
                }
            }

            state.mark_running(name)?;
            self.store.save(&state).await?;
            ctx.emit(MigrationEvent::StageStarted {
                run_id: state.run_id.clone(),
                stage: name.to_string(),
                context: stage.definition().context,
            });
            info!(
                run_id = %state.run_id,
                stage = %name,
                context = %stage.definition().context,
                "Stage started"
            );

            let stage_ctx = ctx.for_stage(name);
            let inputs = state.identifiers();
            let stage_started = Instant::now();
            let result = match deadline {
                Some((limit, at)) => {
                    match tokio::time::timeout_at(at, stage.run(&inputs, &stage_ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::RunTimeout(limit)),
                    }
                }
                None => stage.run(&inputs, &stage_ctx).await,
            };

            match result {
                Ok(output) => {
                    let duration_ms = stage_started.elapsed().as_millis() as u64;
                    info!(
                        run_id = %state.run_id,
                        stage = %name,
                        duration_ms,
                        produced = output.produced.len(),
                        "Stage succeeded"
                    );
                    ctx.emit(MigrationEvent::StageSucceeded {
                        run_id: state.run_id.clone(),
                        stage: name.to_string(),
                        produced: output.produced.clone(),
                        duration_ms,
                    });
                    state.mark_succeeded(name, output.produced)?;
                    self.store.save(&state).await?;
                }
                Err(err) if is_tolerable(stage, &err) => {
                    warn!(
                        run_id = %state.run_id,
                        stage = %name,
                        error = %err,
                        "Best-effort stage failed, continuing"
                    );
                    ctx.emit(MigrationEvent::StageFailed {
                        run_id: state.run_id.clone(),
                        stage: name.to_string(),
                        error: err.to_string(),
                        best_effort: true,
                    });
                    state.mark_failed(name, &err)?;
                    self.store.save(&state).await?;
                }
                Err(err) => {
                    return Err(self.abort(state, name, true, err, started, &ctx).await);
                }
            }
        }

        let status = if state.best_effort_failures().is_empty() {
            RunStatus::Succeeded
        } else {
            RunStatus::PartiallyFailed
        };
        state.set_status(status);
        self.store.save(&state).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(run_id = %state.run_id, status = %status, duration_ms, "Pipeline run finished");
        ctx.emit(MigrationEvent::RunFinished {
            run_id: state.run_id.clone(),
            status,
            duration_ms,
        });
        Ok(state)
    }

    async fn lock_target(
        &self,
        pipeline: &PipelineDefinition,
        state: &PipelineRunState,
        cancel: &CancellationToken,
    ) -> Result<Option<ResourceGuard>> {
        let lock = match &pipeline.lock {
            Some(lock) => lock,
            None => return Ok(None),
        };
        let value = lock.resolve(&Bindings::new(&pipeline.name, &state.inputs))?;
        let key = match value.as_str() {
            Some(key) => key.to_string(),
            None => value.to_string(),
        };
        Ok(Some(self.locks.acquire(&key, cancel).await?))
    }

    /// Record a fatal failure and build the error returned to the caller
    async fn abort(
        &self,
        mut state: PipelineRunState,
        stage: &str,
        stage_ran: bool,
        err: Error,
        started: Instant,
        ctx: &OperationContext,
    ) -> Error {
        let status = if err.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };

        if stage_ran {
            if let Err(e) = state.mark_failed(stage, &err) {
                error!(run_id = %state.run_id, error = %e, "Failed to record stage failure");
            }
            ctx.emit(MigrationEvent::StageFailed {
                run_id: state.run_id.clone(),
                stage: stage.to_string(),
                error: err.to_string(),
                best_effort: false,
            });
        }
        state.set_status(status);
        state.error = Some(err.to_string());

        if let Err(e) = self.store.save(&state).await {
            error!(run_id = %state.run_id, error = %e, "Failed to persist aborted run state");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        error!(
            run_id = %state.run_id,
            stage = %stage,
            status = %status,
            error = %err,
            "Pipeline run aborted"
        );
        ctx.emit(MigrationEvent::RunFinished {
            run_id: state.run_id.clone(),
            status,
            duration_ms,
        });

        Error::RunAborted {
            run_id: state.run_id.clone(),
            stage: stage.to_string(),
            cause: Box::new(err),
            state: Box::new(state),
        }
    }
}

/// Best-effort stages absorb their own failures, but never a cancellation
/// or the run deadline
fn is_tolerable(stage: &MigrationStage<'_>, err: &Error) -> bool {
    stage.definition().best_effort && !err.is_cancelled() && !matches!(err, Error::RunTimeout(_))
}

impl std::fmt::Debug for MigrationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationOrchestrator")
            .field("config", &self.config)
            .field("waiters", &self.waiters.waiters.len())
            .finish()
    }
}
