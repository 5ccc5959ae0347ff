//! Pipeline Run State
//!
//! The persisted record of one pipeline run: per-stage status and produced
//! identifiers. Re-running a pipeline with a stored state skips every stage
//! recorded as succeeded.

use crate::domain::ports::Identifiers;
use crate::error::{Error, Result};
use crate::migration::config::PipelineDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single stage within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Succeeded => write!(f, "succeeded"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    /// Completed, but at least one best-effort stage failed
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::PartiallyFailed => write!(f, "partially-failed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-stage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    #[serde(default)]
    pub best_effort: bool,
    /// Times the stage was entered (across resumes)
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub outputs: Identifiers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    fn pending(name: &str, best_effort: bool) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            best_effort,
            attempts: 0,
            outputs: Identifiers::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// State of one pipeline run, owned by exactly one run at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunState {
    pub run_id: String,
    pub pipeline: String,
    pub status: RunStatus,
    /// Identifiers supplied by the caller
    #[serde(default)]
    pub inputs: Identifiers,
    pub stages: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRunState {
    /// Fresh state with every stage pending
    pub fn new(run_id: impl Into<String>, pipeline: &PipelineDefinition, inputs: Identifiers) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            pipeline: pipeline.name.clone(),
            status: RunStatus::Pending,
            inputs,
            stages: pipeline
                .stages
                .iter()
                .map(|s| StageRecord::pending(&s.name, s.best_effort))
                .collect(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check this state belongs to `pipeline`; append records for stages
    /// added to the definition since the state was written
    pub fn reconcile(&mut self, pipeline: &PipelineDefinition) -> Result<()> {
        if self.pipeline != pipeline.name {
            return Err(Error::Configuration(format!(
                "run {} belongs to pipeline {}, not {}",
                self.run_id, self.pipeline, pipeline.name
            )));
        }
        for (index, record) in self.stages.iter().enumerate() {
            match pipeline.stages.get(index) {
                Some(stage) if stage.name == record.name => {}
                _ => {
                    return Err(Error::Configuration(format!(
                        "run {} recorded stage {} at position {}, which the pipeline no longer matches",
                        self.run_id, record.name, index
                    )))
                }
            }
        }
        for stage in pipeline.stages.iter().skip(self.stages.len()) {
            self.stages.push(StageRecord::pending(&stage.name, stage.best_effort));
        }
        Ok(())
    }

    pub fn record(&self, stage: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.name == stage)
    }

    fn record_mut(&mut self, stage: &str) -> Result<&mut StageRecord> {
        let run_id = &self.run_id;
        self.stages
            .iter_mut()
            .find(|r| r.name == stage)
            .ok_or_else(|| Error::Internal(format!("run {} has no stage {}", run_id, stage)))
    }

    pub fn is_succeeded(&self, stage: &str) -> bool {
        self.record(stage)
            .map(|r| r.status == StageStatus::Succeeded)
            .unwrap_or(false)
    }

    /// Index of the first stage that is not recorded as succeeded
    pub fn resume_index(&self) -> usize {
        self.stages
            .iter()
            .position(|r| r.status != StageStatus::Succeeded)
            .unwrap_or(self.stages.len())
    }

    /// Run inputs plus outputs of every succeeded stage, in stage order
    pub fn identifiers(&self) -> Identifiers {
        let mut ids = self.inputs.clone();
        for record in self.stages.iter().filter(|r| r.status == StageStatus::Succeeded) {
            ids.extend(record.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        ids
    }

    pub fn mark_running(&mut self, stage: &str) -> Result<()> {
        let now = Utc::now();
        let record = self.record_mut(stage)?;
        record.status = StageStatus::Running;
        record.attempts += 1;
        record.error = None;
        record.started_at = Some(now);
        record.finished_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_succeeded(&mut self, stage: &str, outputs: Identifiers) -> Result<()> {
        let now = Utc::now();
        let record = self.record_mut(stage)?;
        record.status = StageStatus::Succeeded;
        record.outputs = outputs;
        record.error = None;
        record.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, stage: &str, error: &Error) -> Result<()> {
        let now = Utc::now();
        let record = self.record_mut(stage)?;
        record.status = StageStatus::Failed;
        record.error = Some(error.to_string());
        record.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Names of stages whose failure did not stop the run
    pub fn best_effort_failures(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|r| r.best_effort && r.status == StageStatus::Failed)
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ResourceId;
    use crate::migration::config::{ActionSpec, StageDefinition};

    fn pipeline(stages: &[&str]) -> PipelineDefinition {
        PipelineDefinition::new(
            "cluster-refresh",
            stages
                .iter()
                .map(|name| StageDefinition::new(*name, ActionSpec::new("Noop")))
                .collect(),
        )
    }

    #[test]
    fn test_json_round_trip_is_exact() {
        let def = pipeline(&["create", "share", "copy"]);
        let mut inputs = Identifiers::new();
        inputs.insert("cluster".into(), ResourceId::new("new-events"));
        let mut state = PipelineRunState::new("run-1", &def, inputs);

        state.mark_running("create").unwrap();
        let mut outputs = Identifiers::new();
        outputs.insert("snapshot_id".into(), ResourceId::new("s-1"));
        state.mark_succeeded("create", outputs).unwrap();
        state.mark_running("share").unwrap();
        state
            .mark_failed("share", &Error::Internal("boom".into()))
            .unwrap();
        state.set_status(RunStatus::Failed);

        let json = state.to_json().unwrap();
        let back = PipelineRunState::from_json(&json).unwrap();
        assert_eq!(back, state);
        assert!(json.contains("\"succeeded\""));
    }

    #[test]
    fn test_resume_index_and_identifiers() {
        let def = pipeline(&["create", "share", "copy", "restore"]);
        let mut state = PipelineRunState::new("run-2", &def, Identifiers::new());
        assert_eq!(state.resume_index(), 0);

        let mut outputs = Identifiers::new();
        outputs.insert("snapshotId".into(), ResourceId::new("s-1"));
        state.mark_succeeded("create", outputs).unwrap();
        state.mark_succeeded("share", Identifiers::new()).unwrap();

        assert_eq!(state.resume_index(), 2);
        assert_eq!(state.identifiers()["snapshotId"].as_str(), "s-1");
        assert!(state.is_succeeded("share"));
        assert!(!state.is_succeeded("copy"));
    }

    #[test]
    fn test_failed_outputs_not_exposed() {
        let def = pipeline(&["a", "b"]);
        let mut state = PipelineRunState::new("run-3", &def, Identifiers::new());
        state.mark_running("a").unwrap();
        state.mark_failed("a", &Error::Cancelled).unwrap();
        assert!(state.identifiers().is_empty());
        assert_eq!(state.stages[0].attempts, 1);
    }

    #[test]
    fn test_reconcile() {
        let def = pipeline(&["a", "b"]);
        let mut state = PipelineRunState::new("run-4", &def, Identifiers::new());

        let extended = pipeline(&["a", "b", "c"]);
        state.reconcile(&extended).unwrap();
        assert_eq!(state.stages.len(), 3);

        let reordered = pipeline(&["b", "a", "c"]);
        assert!(state.reconcile(&reordered).is_err());

        let mut other = pipeline(&["a", "b", "c"]);
        other.name = "other".into();
        assert!(state.reconcile(&other).is_err());
    }

    #[test]
    fn test_run_status_serde() {
        assert_eq!(
            serde_json::to_string(&RunStatus::PartiallyFailed).unwrap(),
            "\"partially-failed\""
        );
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
