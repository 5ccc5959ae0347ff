//! Run Manager
//!
//! Owns the registered pipelines and the runs executing in this process.
//! Each run is a background task with its own cancellation token, derived
//! from a manager-wide token so shutdown stops every run at its next stage
//! boundary or wait.

use crate::domain::ports::Identifiers;
use crate::error::{Error, Result};
use crate::migration::config::PipelineDefinition;
use crate::migration::orchestrator::MigrationOrchestrator;
use crate::migration::state::PipelineRunState;
use crate::migration::store::validate_run_id;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A registered pipeline as listed by the API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub inputs: Vec<String>,
    pub stages: Vec<String>,
}

impl From<&PipelineDefinition> for PipelineSummary {
    fn from(pipeline: &PipelineDefinition) -> Self {
        Self {
            name: pipeline.name.clone(),
            description: pipeline.description.clone(),
            inputs: pipeline.inputs.clone(),
            stages: pipeline.stages.iter().map(|s| s.name.clone()).collect(),
        }
    }
}

/// A run executing in this process
#[derive(Debug, Clone)]
struct ActiveRun {
    pipeline: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Stored state of a run plus whether it is executing here
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub state: PipelineRunState,
    pub active: bool,
}

/// Starts, resumes, cancels and reports pipeline runs
pub struct RunManager {
    orchestrator: Arc<MigrationOrchestrator>,
    pipelines: DashMap<String, Arc<PipelineDefinition>>,
    active: Arc<DashMap<String, ActiveRun>>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl RunManager {
    pub fn new(orchestrator: Arc<MigrationOrchestrator>) -> Self {
        Self {
            orchestrator,
            pipelines: DashMap::new(),
            active: Arc::new(DashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<MigrationOrchestrator> {
        &self.orchestrator
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Validate and register a pipeline under its name
    pub fn register(&self, pipeline: PipelineDefinition) -> Result<()> {
        self.orchestrator.validate(&pipeline)?;
        match self.pipelines.entry(pipeline.name.clone()) {
            Entry::Occupied(_) => Err(Error::Configuration(format!(
                "pipeline {} is registered twice",
                pipeline.name
            ))),
            Entry::Vacant(slot) => {
                info!(pipeline = %pipeline.name, stages = pipeline.stages.len(), "Registered pipeline");
                slot.insert(Arc::new(pipeline));
                Ok(())
            }
        }
    }

    pub fn pipeline(&self, name: &str) -> Result<Arc<PipelineDefinition>> {
        self.pipelines
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))
    }

    /// Registered pipelines sorted by name
    pub fn pipelines(&self) -> Vec<PipelineSummary> {
        let mut summaries: Vec<_> = self
            .pipelines
            .iter()
            .map(|p| PipelineSummary::from(p.value().as_ref()))
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Start a run in the background and return its id.
    ///
    /// Everything that can be checked before the first stage (run id,
    /// inputs, duplicates) is reported here rather than from the task.
    pub async fn start(&self, pipeline: &str, run_id: Option<String>, inputs: Identifiers) -> Result<String> {
        let definition = self.pipeline(pipeline)?;
        let run_id = run_id.unwrap_or_else(|| generate_run_id(pipeline));
        validate_run_id(&run_id)?;
        if let Some(input) = definition.inputs.iter().find(|i| !inputs.contains_key(*i)) {
            return Err(Error::MissingInput {
                stage: definition.name.clone(),
                input: input.clone(),
            });
        }
        if self.is_active(&run_id) {
            return Err(Error::RunActive(run_id));
        }
        if self.orchestrator.store().load(&run_id).await?.is_some() {
            return Err(Error::Configuration(format!(
                "run {} already exists; resume it instead",
                run_id
            )));
        }

        let cancel = self.claim(&run_id, pipeline)?;
        let orchestrator = self.orchestrator.clone();
        let id = run_id.clone();
        self.spawn(run_id.clone(), async move {
            orchestrator.start(&definition, &id, inputs, cancel).await
        });
        Ok(run_id)
    }

    /// Resume a stored run in the background
    pub async fn resume(&self, run_id: &str) -> Result<()> {
        let state = self
            .orchestrator
            .store()
            .load(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        let definition = self.pipeline(&state.pipeline)?;

        let cancel = self.claim(run_id, &state.pipeline)?;
        let orchestrator = self.orchestrator.clone();
        let id = run_id.to_string();
        self.spawn(run_id.to_string(), async move {
            orchestrator.resume(&definition, &id, cancel).await
        });
        Ok(())
    }

    /// Request cancellation; returns false if the run is not executing here
    pub async fn cancel(&self, run_id: &str) -> Result<bool> {
        if let Some(run) = self.active.get(run_id) {
            info!(run_id = %run_id, pipeline = %run.pipeline, "Cancelling run");
            run.cancel.cancel();
            return Ok(true);
        }
        match self.orchestrator.store().load(run_id).await? {
            Some(_) => Ok(false),
            None => Err(Error::RunNotFound(run_id.to_string())),
        }
    }

    /// False once shutdown has begun
    pub fn is_accepting(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.active.contains_key(run_id)
    }

    /// Ids of the runs executing here with their start times
    pub fn active_runs(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut runs: Vec<_> = self
            .active
            .iter()
            .map(|r| (r.key().clone(), r.started_at))
            .collect();
        runs.sort();
        runs
    }

    pub async fn status(&self, run_id: &str) -> Result<RunView> {
        let state = self
            .orchestrator
            .store()
            .load(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        Ok(RunView {
            active: self.is_active(run_id),
            state,
        })
    }

    /// Stored runs, newest first
    pub async fn list(&self) -> Result<Vec<RunView>> {
        let runs = self.orchestrator.store().list().await?;
        Ok(runs
            .into_iter()
            .map(|state| RunView {
                active: self.is_active(&state.run_id),
                state,
            })
            .collect())
    }

    /// Wait for every background run to finish
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Run task panicked");
            }
        }
    }

    /// Cancel every run and wait for them to record their state
    pub async fn shutdown(&self) {
        info!(active = self.active.len(), "Stopping pipeline runs");
        self.shutdown.cancel();
        self.drain().await;
    }

    fn claim(&self, run_id: &str, pipeline: &str) -> Result<CancellationToken> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.active.entry(run_id.to_string()) {
            Entry::Occupied(_) => Err(Error::RunActive(run_id.to_string())),
            Entry::Vacant(slot) => {
                let cancel = self.shutdown.child_token();
                slot.insert(ActiveRun {
                    pipeline: pipeline.to_string(),
                    started_at: Utc::now(),
                    cancel: cancel.clone(),
                });
                Ok(cancel)
            }
        }
    }

    fn spawn<F>(&self, run_id: String, run: F)
    where
        F: std::future::Future<Output = Result<PipelineRunState>> + Send + 'static,
    {
        let active = self.active.clone();
        self.tasks.lock().spawn(async move {
            match run.await {
                Ok(state) => info!(run_id = %run_id, status = %state.status, "Run finished"),
                Err(e) => warn!(run_id = %run_id, error = %e, "Run ended with error"),
            }
            active.remove(&run_id);
        });
    }
}

impl std::fmt::Debug for RunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunManager")
            .field("pipelines", &self.pipelines.len())
            .field("active", &self.active.len())
            .finish()
    }
}

/// `<pipeline>-<utc timestamp>-<random suffix>`, restricted to run-id characters
pub fn generate_run_id(pipeline: &str) -> String {
    let prefix: String = pipeline
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let prefix = prefix.trim_start_matches('-');
    let prefix = if prefix.is_empty() { "run" } else { prefix };
    format!(
        "{}-{}-{:06x}",
        prefix,
        Utc::now().format("%Y%m%dT%H%M%S"),
        rand::random::<u32>() & 0x00ff_ffff
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ClientSet, ResourceId};
    use crate::migration::config::{ActionSpec, StageDefinition, WaitSpec, WaiterRef};
    use crate::migration::orchestrator::OrchestratorConfig;
    use crate::migration::state::RunStatus;
    use crate::migration::store::MemoryRunStore;
    use crate::observability::MemoryEventSink;
    use crate::testing::ScriptedClient;
    use crate::waiter::builtin;
    use crate::waiter::descriptor::{OperationDescriptor, ParamValue, ResourceQuery};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn manager(client: ScriptedClient) -> (RunManager, Arc<ScriptedClient>) {
        let client = Arc::new(client);
        let orchestrator = MigrationOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(ClientSet::single(client.clone())),
            Arc::new(MemoryRunStore::new()),
            MemoryEventSink::new(),
        );
        (RunManager::new(Arc::new(orchestrator)), client)
    }

    fn snapshot_pipeline() -> PipelineDefinition {
        let wait = WaitSpec::new(
            OperationDescriptor::new(ResourceQuery::invoke(
                "DescribeDBClusterSnapshots",
                [("DBClusterSnapshotIdentifier".to_string(), ParamValue::key())]
                    .into_iter()
                    .collect(),
            )),
            WaiterRef::Named(builtin::DB_CLUSTER_SNAPSHOT_AVAILABLE.to_string()),
        );
        let create = StageDefinition::new(
            "create-snapshot",
            ActionSpec::new("CreateDBClusterSnapshot")
                .param("DBClusterIdentifier", ParamValue::input("cluster"))
                .param("DBClusterSnapshotIdentifier", ParamValue::key()),
        )
        .with_key("events-snap")
        .with_wait(wait);
        PipelineDefinition::new("snapshot", vec![create]).with_inputs(["cluster"])
    }

    fn inputs() -> Identifiers {
        let mut inputs = Identifiers::new();
        inputs.insert("cluster".into(), ResourceId::new("new-events"));
        inputs
    }

    fn available() -> serde_json::Value {
        json!({"DBClusterSnapshots": [{"Status": "available"}]})
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_in_background() {
        let (manager, client) = manager(ScriptedClient::new("acct").ok("DescribeDBClusterSnapshots", available()));
        manager.register(snapshot_pipeline()).unwrap();

        let run_id = manager
            .start("snapshot", Some("run-1".into()), inputs())
            .await
            .unwrap();
        assert_eq!(run_id, "run-1");
        manager.drain().await;

        let view = manager.status("run-1").await.unwrap();
        assert!(!view.active);
        assert_eq!(view.state.status, RunStatus::Succeeded);
        assert_eq!(client.count("CreateDBClusterSnapshot"), 1);
        assert_eq!(manager.list().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_waiting_run() {
        let creating = json!({"DBClusterSnapshots": [{"Status": "creating"}]});
        let (manager, _) = manager(ScriptedClient::new("acct").ok("DescribeDBClusterSnapshots", creating));
        manager.register(snapshot_pipeline()).unwrap();

        manager
            .start("snapshot", Some("run-2".into()), inputs())
            .await
            .unwrap();
        // let the run reach its wait
        tokio::time::sleep(std::time::Duration::from_secs(45)).await;
        assert!(manager.is_active("run-2"));
        assert!(manager.cancel("run-2").await.unwrap());
        manager.drain().await;

        let view = manager.status("run-2").await.unwrap();
        assert_eq!(view.state.status, RunStatus::Cancelled);
        assert!(!manager.cancel("run-2").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_failure() {
        let client = ScriptedClient::new("acct")
            .err("CreateDBClusterSnapshot", "DBClusterNotFoundFault")
            .ok("CreateDBClusterSnapshot", json!({}))
            .ok("DescribeDBClusterSnapshots", available());
        let (manager, client) = manager(client);
        manager.register(snapshot_pipeline()).unwrap();

        manager
            .start("snapshot", Some("run-3".into()), inputs())
            .await
            .unwrap();
        manager.drain().await;
        assert_eq!(manager.status("run-3").await.unwrap().state.status, RunStatus::Failed);

        manager.resume("run-3").await.unwrap();
        manager.drain().await;
        assert_eq!(manager.status("run-3").await.unwrap().state.status, RunStatus::Succeeded);
        assert_eq!(client.count("CreateDBClusterSnapshot"), 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_requests() {
        let (manager, _) = manager(ScriptedClient::new("acct"));
        manager.register(snapshot_pipeline()).unwrap();

        assert_matches!(manager.register(snapshot_pipeline()), Err(Error::Configuration(_)));
        assert_matches!(
            manager.start("missing", None, inputs()).await,
            Err(Error::PipelineNotFound(_))
        );
        assert_matches!(
            manager.start("snapshot", None, Identifiers::new()).await,
            Err(Error::MissingInput { .. })
        );
        assert_matches!(
            manager.start("snapshot", Some("../x".into()), inputs()).await,
            Err(Error::Configuration(_))
        );
        assert_matches!(manager.resume("nope").await, Err(Error::RunNotFound(_)));
        assert_matches!(manager.cancel("nope").await, Err(Error::RunNotFound(_)));
        assert_eq!(manager.pipelines()[0].stages, vec!["create-snapshot".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_runs() {
        let (manager, _) = manager(ScriptedClient::new("acct"));
        manager.register(snapshot_pipeline()).unwrap();
        manager.shutdown().await;
        assert_matches!(
            manager.start("snapshot", None, inputs()).await,
            Err(Error::Cancelled)
        );
    }

    #[test]
    fn test_generated_run_ids_are_valid() {
        let id = generate_run_id("cluster refresh/staging");
        assert!(id.starts_with("cluster-refresh-staging-"));
        assert!(validate_run_id(&id).is_ok());
        assert!(generate_run_id("").starts_with("run-"));
    }
}
