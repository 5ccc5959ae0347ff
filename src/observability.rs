//! Migration Events
//!
//! Structured events emitted by the waiter, retry policy and orchestrator,
//! and the sinks that consume them (tracing, Prometheus, in-memory).

use crate::domain::ports::{ExecutionContext, Identifiers};
use crate::error::{Error, Result};
use crate::migration::state::RunStatus;
use crate::waiter::rules::Outcome;
use parking_lot::Mutex;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Events
// =============================================================================

/// Why a stage did not invoke its action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Recorded as succeeded in the run state
    AlreadySucceeded,
    /// Idempotency pre-check found the effect already achieved
    PrecheckSatisfied,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadySucceeded => write!(f, "already_succeeded"),
            SkipReason::PrecheckSatisfied => write!(f, "precheck_satisfied"),
        }
    }
}

/// Events emitted during a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEvent {
    RunStarted {
        run_id: String,
        pipeline: String,
        /// Index of the first stage that will execute
        resume_at: usize,
    },

    RunFinished {
        run_id: String,
        status: RunStatus,
        duration_ms: u64,
    },

    StageStarted {
        run_id: String,
        stage: String,
        context: ExecutionContext,
    },

    StageSkipped {
        run_id: String,
        stage: String,
        reason: SkipReason,
    },

    StageSucceeded {
        run_id: String,
        stage: String,
        produced: Identifiers,
        duration_ms: u64,
    },

    StageFailed {
        run_id: String,
        stage: String,
        error: String,
        best_effort: bool,
    },

    PollAttempt {
        run_id: String,
        stage: String,
        waiter: String,
        attempt: u32,
        max_attempts: u32,
        matched: Option<Outcome>,
    },

    RetryAttempt {
        run_id: String,
        stage: String,
        operation: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
}

impl MigrationEvent {
    /// Get the run ID associated with this event
    pub fn run_id(&self) -> &str {
        match self {
            MigrationEvent::RunStarted { run_id, .. }
            | MigrationEvent::RunFinished { run_id, .. }
            | MigrationEvent::StageStarted { run_id, .. }
            | MigrationEvent::StageSkipped { run_id, .. }
            | MigrationEvent::StageSucceeded { run_id, .. }
            | MigrationEvent::StageFailed { run_id, .. }
            | MigrationEvent::PollAttempt { run_id, .. }
            | MigrationEvent::RetryAttempt { run_id, .. } => run_id,
        }
    }

    /// Check if this is a stage-level event
    pub fn is_stage_event(&self) -> bool {
        matches!(
            self,
            MigrationEvent::StageStarted { .. }
                | MigrationEvent::StageSkipped { .. }
                | MigrationEvent::StageSucceeded { .. }
                | MigrationEvent::StageFailed { .. }
        )
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Injected consumer of migration events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &MigrationEvent);
}

pub type EventSinkRef = Arc<dyn EventSink>;

/// Writes events as structured tracing records
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &MigrationEvent) {
        match event {
            MigrationEvent::RunStarted {
                run_id,
                pipeline,
                resume_at,
            } => info!(%run_id, %pipeline, resume_at, "run started"),
            MigrationEvent::RunFinished {
                run_id,
                status,
                duration_ms,
            } => info!(%run_id, %status, duration_ms, "run finished"),
            MigrationEvent::StageStarted {
                run_id,
                stage,
                context,
            } => info!(%run_id, %stage, %context, "stage started"),
            MigrationEvent::StageSkipped {
                run_id,
                stage,
                reason,
            } => info!(%run_id, %stage, %reason, "stage skipped"),
            MigrationEvent::StageSucceeded {
                run_id,
                stage,
                produced,
                duration_ms,
            } => info!(%run_id, %stage, ?produced, duration_ms, "stage succeeded"),
            MigrationEvent::StageFailed {
                run_id,
                stage,
                error,
                best_effort,
            } => {
                if *best_effort {
                    warn!(%run_id, %stage, %error, "best-effort stage failed");
                } else {
                    error!(%run_id, %stage, %error, "stage failed");
                }
            }
            MigrationEvent::PollAttempt {
                run_id,
                stage,
                waiter,
                attempt,
                max_attempts,
                matched,
            } => debug!(%run_id, %stage, %waiter, attempt, max_attempts, ?matched, "poll attempt"),
            MigrationEvent::RetryAttempt {
                run_id,
                stage,
                operation,
                attempt,
                delay_ms,
                error,
            } => warn!(%run_id, %stage, %operation, attempt, delay_ms, %error, "retrying"),
        }
    }
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<MigrationEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<MigrationEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&MigrationEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &MigrationEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Fans out to several sinks
#[derive(Default, Clone)]
pub struct CompositeEventSink {
    sinks: Vec<EventSinkRef>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: EventSinkRef) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for CompositeEventSink {
    fn emit(&self, event: &MigrationEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

// =============================================================================
// Prometheus
// =============================================================================

/// Translates events into Prometheus counters and histograms
pub struct PrometheusEventSink {
    stages: IntCounterVec,
    polls: IntCounterVec,
    retries: IntCounterVec,
    runs: IntCounterVec,
    run_duration: HistogramVec,
    stage_duration: HistogramVec,
}

impl PrometheusEventSink {
    /// Create the metric families and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let stages = IntCounterVec::new(
            Opts::new("migrator_stage_outcomes_total", "Stage outcomes by stage name"),
            &["stage", "outcome"],
        )
        .map_err(metrics_error)?;
        let polls = IntCounterVec::new(
            Opts::new("migrator_poll_attempts_total", "Waiter poll attempts"),
            &["waiter"],
        )
        .map_err(metrics_error)?;
        let retries = IntCounterVec::new(
            Opts::new("migrator_retry_attempts_total", "Retries scheduled by the retry policy"),
            &["operation"],
        )
        .map_err(metrics_error)?;
        let runs = IntCounterVec::new(
            Opts::new("migrator_runs_total", "Finished pipeline runs by status"),
            &["status"],
        )
        .map_err(metrics_error)?;
        let run_duration = HistogramVec::new(
            HistogramOpts::new("migrator_run_duration_seconds", "Pipeline run duration")
                .buckets(vec![60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0]),
            &["status"],
        )
        .map_err(metrics_error)?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new("migrator_stage_duration_seconds", "Successful stage duration")
                .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0]),
            &["stage"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(stages.clone())).map_err(metrics_error)?;
        registry.register(Box::new(polls.clone())).map_err(metrics_error)?;
        registry.register(Box::new(retries.clone())).map_err(metrics_error)?;
        registry.register(Box::new(runs.clone())).map_err(metrics_error)?;
        registry.register(Box::new(run_duration.clone())).map_err(metrics_error)?;
        registry.register(Box::new(stage_duration.clone())).map_err(metrics_error)?;

        Ok(Self {
            stages,
            polls,
            retries,
            runs,
            run_duration,
            stage_duration,
        })
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl EventSink for PrometheusEventSink {
    fn emit(&self, event: &MigrationEvent) {
        match event {
            MigrationEvent::RunFinished {
                status,
                duration_ms,
                ..
            } => {
                let status = status.to_string();
                self.runs.with_label_values(&[&status]).inc();
                self.run_duration
                    .with_label_values(&[&status])
                    .observe(*duration_ms as f64 / 1000.0);
            }
            MigrationEvent::StageSkipped { stage, .. } => {
                self.stages.with_label_values(&[stage, "skipped"]).inc();
            }
            MigrationEvent::StageSucceeded {
                stage, duration_ms, ..
            } => {
                self.stages.with_label_values(&[stage, "succeeded"]).inc();
                self.stage_duration
                    .with_label_values(&[stage])
                    .observe(*duration_ms as f64 / 1000.0);
            }
            MigrationEvent::StageFailed { stage, .. } => {
                self.stages.with_label_values(&[stage, "failed"]).inc();
            }
            MigrationEvent::PollAttempt { waiter, .. } => {
                self.polls.with_label_values(&[waiter]).inc();
            }
            MigrationEvent::RetryAttempt { operation, .. } => {
                self.retries.with_label_values(&[operation]).inc();
            }
            MigrationEvent::RunStarted { .. } | MigrationEvent::StageStarted { .. } => {}
        }
    }
}
