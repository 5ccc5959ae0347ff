//! Migrator Configuration
//!
//! The YAML document read by the binary: environment profiles, plan
//! requests, custom pipelines, waiter models and service settings.
//!
//! ```yaml
//! state_dir: ./state
//! profiles:
//!   - name: staging
//!     source: { account_id: "111111111111", region: us-east-1, kms_key_id: alias/share }
//!     destination: { account_id: "222222222222", region: us-east-1, kms_key_id: alias/staging }
//! plans:
//!   - name: refresh-staging
//!     profile: staging
//!     plan: cluster-refresh
//!     key: events-2026-10-15
//!     source_cluster: alpha-events
//!     target_cluster: staging-events
//! pipeline_files: pipelines/*.yaml
//! ```

use crate::controlplane::api::ApiServerConfig;
use crate::controlplane::simulated::SimulationConfig;
use crate::error::{Error, Result};
use crate::migration::config::PipelineDefinition;
use crate::migration::orchestrator::OrchestratorConfig;
use crate::migration::plans::{EnvironmentProfile, PlanRequest};
use crate::waiter::model::WaiterModel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A plan request bound to a name and a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub name: String,
    pub profile: String,
    #[serde(flatten)]
    pub request: PlanRequest,
}

/// Top-level configuration document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// Directory for run state files; runs are kept in memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    pub orchestrator: OrchestratorConfig,
    pub api: ApiServerConfig,
    pub profiles: Vec<EnvironmentProfile>,
    pub plans: Vec<PlanEntry>,
    /// Pipelines written out in full
    pub pipelines: Vec<PipelineDefinition>,
    /// Glob of additional pipeline files, relative to the config file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_files: Option<String>,
    /// Waiter model document (JSON or YAML), relative to the config file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiters: Option<PathBuf>,
    /// Seeds and faults for rehearsal runs
    pub simulation: SimulationConfig,
}

impl MigratorConfig {
    pub fn from_yaml(document: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(document)?)
    }

    /// Read a config file
    pub fn load(path: &Path) -> Result<Self> {
        let document = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&document)
    }

    /// The named profile, or the only one when no name is given
    pub fn profile(&self, name: Option<&str>) -> Result<&EnvironmentProfile> {
        match name {
            Some(name) => self
                .profiles
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| Error::Configuration(format!("unknown profile {}", name))),
            None => match self.profiles.as_slice() {
                [only] => Ok(only),
                [] => Err(Error::Configuration("no profiles configured".into())),
                _ => Err(Error::Configuration(
                    "several profiles configured; choose one with --profile".into(),
                )),
            },
        }
    }

    /// Custom waiters, if a model file is configured
    pub fn waiter_model(&self, base: &Path) -> Result<Option<WaiterModel>> {
        let Some(file) = &self.waiters else {
            return Ok(None);
        };
        let path = base.join(file);
        let document = std::fs::read_to_string(&path)
            .map_err(|e| Error::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        let model = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => WaiterModel::from_json(&document)?,
            _ => WaiterModel::from_yaml(&document)?,
        };
        Ok(Some(model))
    }

    /// Every pipeline available under `profile`: built plans, inline
    /// pipelines and pipeline files. Names must be unique.
    pub fn pipelines(&self, profile: &EnvironmentProfile, base: &Path) -> Result<Vec<PipelineDefinition>> {
        let mut pipelines = Vec::new();

        for entry in self.plans.iter().filter(|e| e.profile == profile.name) {
            pipelines.push(entry.request.build(&entry.name, profile)?);
        }
        pipelines.extend(self.pipelines.iter().cloned());
        if let Some(pattern) = &self.pipeline_files {
            pipelines.extend(load_pipeline_files(base, pattern)?);
        }

        let mut names = BTreeSet::new();
        for pipeline in &pipelines {
            if !names.insert(pipeline.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "pipeline {} is defined more than once",
                    pipeline.name
                )));
            }
        }
        Ok(pipelines)
    }
}

fn load_pipeline_files(base: &Path, pattern: &str) -> Result<Vec<PipelineDefinition>> {
    let full = base.join(pattern);
    let full = full.to_string_lossy();
    let paths = glob::glob(&full)
        .map_err(|e| Error::Configuration(format!("invalid pipeline pattern {}: {}", pattern, e)))?;

    let mut pipelines = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| Error::Configuration(format!("cannot read pipeline file: {}", e)))?;
        let document = std::fs::read_to_string(&path)?;
        let pipeline = PipelineDefinition::from_yaml(&document).map_err(|e| {
            Error::Configuration(format!("invalid pipeline file {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), pipeline = %pipeline.name, "Loaded pipeline file");
        pipelines.push(pipeline);
    }
    Ok(pipelines)
}
