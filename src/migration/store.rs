//! Run State Stores
//!
//! Persistence for [`PipelineRunState`] so an interrupted or failed run can
//! be resumed. State is encoded as JSON and round-trips exactly.

use crate::error::{Error, Result};
use crate::migration::state::PipelineRunState;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Port for run-state persistence
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn load(&self, run_id: &str) -> Result<Option<PipelineRunState>>;

    /// Insert or replace the state for its run id
    async fn save(&self, state: &PipelineRunState) -> Result<()>;

    /// All stored runs, newest first
    async fn list(&self) -> Result<Vec<PipelineRunState>>;

    async fn delete(&self, run_id: &str) -> Result<bool>;
}

pub type RunStateStoreRef = Arc<dyn RunStateStore>;

/// Run ids double as file names
pub fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id.len() <= 128
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!("invalid run id {:?}", run_id)))
    }
}

fn newest_first(runs: &mut [PipelineRunState]) {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Process-local store; state is lost on exit
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, PipelineRunState>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStore {
    async fn load(&self, run_id: &str) -> Result<Option<PipelineRunState>> {
        Ok(self.runs.read().get(run_id).cloned())
    }

    async fn save(&self, state: &PipelineRunState) -> Result<()> {
        self.runs
            .write()
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PipelineRunState>> {
        let mut runs: Vec<_> = self.runs.read().values().cloned().collect();
        newest_first(&mut runs);
        Ok(runs)
    }

    async fn delete(&self, run_id: &str) -> Result<bool> {
        Ok(self.runs.write().remove(run_id).is_some())
    }
}

// =============================================================================
// File Store
// =============================================================================

/// One JSON file per run under a state directory
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    /// Open (creating if needed) a state directory
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.root.join(format!("{}.json", run_id)))
    }
}

#[async_trait]
impl RunStateStore for FileRunStore {
    async fn load(&self, run_id: &str) -> Result<Option<PipelineRunState>> {
        let path = self.path_for(run_id)?;
        match fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(PipelineRunState::from_json(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &PipelineRunState) -> Result<()> {
        let path = self.path_for(&state.run_id)?;
        let tmp = path.with_extension("json.tmp");
        let json = state.to_json()?;

        // write-then-rename so a crash never leaves a truncated state file
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        debug!(run_id = %state.run_id, path = %path.display(), "Saved run state");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PipelineRunState>> {
        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = fs::read_to_string(&path).await?;
            match PipelineRunState::from_json(&json) {
                Ok(state) => runs.push(state),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run state"),
            }
        }
        newest_first(&mut runs);
        Ok(runs)
    }

    async fn delete(&self, run_id: &str) -> Result<bool> {
        let path = self.path_for(run_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
