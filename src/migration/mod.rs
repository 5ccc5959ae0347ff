//! Migration Module
//!
//! Resumable multi-stage migrations built from the waiter and retry
//! primitives:
//! - `config`: serializable pipeline and stage definitions
//! - `stage`: executes one stage (pre-check, submit, wait, outputs, batches)
//! - `state`: per-run progress records
//! - `store`: run-state persistence
//! - `locks`: per-target serialization of runs
//! - `orchestrator`: sequences stages and resumes runs
//! - `plans`: builders for the cluster refresh, instance snapshot, DataSync
//!   and S3 replication migrations

pub mod config;
pub mod locks;
pub mod orchestrator;
pub mod plans;
pub mod stage;
pub mod state;
pub mod store;

pub use config::{
    ActionSpec, BatchSpec, OutputBinding, PipelineDefinition, Precheck, RetryScope, StageDefinition,
    WaitSpec, WaiterRef,
};
pub use locks::{ResourceGuard, ResourceLocks};
pub use orchestrator::{MigrationOrchestrator, OrchestratorConfig};
pub use plans::{
    partition, AccountProfile, BatchReplication, ClusterRefreshPlan, DataSyncPlan, EnvironmentProfile,
    InstanceSnapshotPlan, PlanRequest, S3ReplicationPlan, SnapshotNames,
};
pub use stage::{MigrationStage, StageOutput};
pub use state::{PipelineRunState, RunStatus, StageRecord, StageStatus};
pub use store::{FileRunStore, MemoryRunStore, RunStateStore, RunStateStoreRef};
