//! Snapshot Migrator - Resumable Snapshot Migration Pipelines
//!
//! Moves database snapshots and clusters between accounts of a managed
//! database control plane as a sequence of resumable stages, built on a
//! declarative polling waiter and a classified retry policy.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                 CLI (run / validate / status / serve)                       │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    REST API     │  │   Run Manager   │  │      Run State Store        │  │
//! │  │     (axum)      │  │ (tasks, cancel) │  │     (memory / files)        │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │ Migration Orchestrator│                                │
//! │                    │ (stages, resume, lock)│                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌────────┴────────┐  ┌─────────────────────────────┐  │
//! │  │  Polling Waiter │  │  Retry Policy   │  │       Plan Builders         │  │
//! │  │ (rules, paths)  │  │ (backoff,jitter)│  │ (refresh, instance, sync)   │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │        ControlPlaneClient / ClientProvider (source, destination)            │
//! │                 simulated control plane for rehearsals                      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`waiter`]: descriptors, termination rules and the polling loop
//! - [`retry`]: error classification and backoff
//! - [`migration`]: stages, run state, the orchestrator and plan builders
//! - [`controlplane`]: run manager, REST API and the simulated control plane
//! - [`domain`]: ports and the per-run operation context
//! - [`observability`]: migration events and their sinks
//! - [`config`]: the binary's configuration document
//! - [`error`]: error types and classification

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod migration;
pub mod observability;
pub mod retry;
pub mod serde_util;
pub mod waiter;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{MigratorConfig, PlanEntry};

pub use controlplane::{
    ApiServer, ApiServerConfig, RunManager, SimulatedControlPlane, SimulatedWorld, SimulationConfig,
};

pub use domain::ports::{
    ClientProvider, ClientSet, ControlPlaneClient, ExecutionContext, Identifiers, Params,
    RemoteError, ResourceId,
};
pub use domain::OperationContext;

pub use error::{Error, ErrorClass, Result};

pub use migration::{
    EnvironmentProfile, MigrationOrchestrator, OrchestratorConfig, PipelineDefinition,
    PipelineRunState, PlanRequest, RunStatus, StageDefinition,
};

pub use observability::{
    CompositeEventSink, EventSink, MemoryEventSink, MigrationEvent, PrometheusEventSink,
    TracingEventSink,
};

pub use retry::{RetryConfig, RetryPolicy};

pub use waiter::{OperationDescriptor, PollingWaiter, RuleSet, WaiterModel};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
