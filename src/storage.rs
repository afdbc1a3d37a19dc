//! Persisted session state: run history, workflow catalog, active stages and
//! model selection.
//!
//! Storage itself sits behind [`SnapshotStore`]. When a store reports that a
//! snapshot does not fit, [`persist_with_fallback`] retries with fewer runs
//! and then with stripped runs before giving up.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::StoreError;
use crate::gateway::AgentResolver;
use crate::pipeline::RetryPolicy;
use crate::run::{FINAL_RESULT_ID, ModelSelection, PipelineRun, stage_result_id};
use crate::workflow::{
    DEFAULT_WORKFLOW_ID, StageConfig, WorkflowConfig, WorkflowState, default_stages, dedupe,
};

/// Runs kept when a full snapshot exceeds the store's capacity.
pub const FALLBACK_RUNS_LIMIT: usize = 5;

pub const STATE_FILE: &str = "state.json";

/// Everything persisted between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredState {
    #[serde(default)]
    pub runs: Vec<PipelineRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_run_id: Option<String>,
    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_workflow_id: Option<String>,
    /// Active stage list
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    /// A run's stage snapshot was loaded and has not been edited since
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_next_sync: bool,
    #[serde(default)]
    pub agent_model_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_model_id: Option<String>,
    #[serde(default, alias = "finalModelId", skip_serializing_if = "Option::is_none")]
    pub review_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_threshold: Option<u32>,
}

impl StoredState {
    /// Snapshot the live session.
    pub fn capture(
        workflows: &WorkflowState,
        runs: Vec<PipelineRun>,
        selected_run_id: Option<String>,
        models: &ModelSelection,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            runs,
            selected_run_id,
            workflows: workflows.workflows().to_vec(),
            selected_workflow_id: Some(workflows.selected_workflow_id().to_string()),
            stages: workflows.stages().to_vec(),
            skip_next_sync: workflows.sync_suppressed(),
            agent_model_ids: models.agent_model_ids.clone(),
            synthesis_model_id: Some(models.synthesis_model_id.clone()),
            review_model_id: Some(models.review_model_id.clone()),
            retry_enabled: Some(retry.enabled),
            retry_threshold: Some(retry.threshold),
        }
    }

    /// Fill the gaps left by older or partial snapshots.
    ///
    /// Runs get a workflow id, a stage snapshot and a model selection from
    /// the state (or `defaults`) when they lack one, unit ids are rebuilt
    /// from their coordinates (index counted within each stage), and missing agent labels are resolved. The
    /// agent pool is de-duplicated, and an empty active stage list is
    /// refilled from the selected workflow.
    pub fn normalize(mut self, defaults: &ModelSelection, resolver: &dyn AgentResolver) -> Self {
        let selected_workflow_id = self
            .selected_workflow_id
            .clone()
            .unwrap_or_else(|| DEFAULT_WORKFLOW_ID.to_string());
        let synthesis = self
            .synthesis_model_id
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| defaults.synthesis_model_id.clone());
        let review = self
            .review_model_id
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| defaults.review_model_id.clone());
        let pool = if self.agent_model_ids.is_empty() {
            defaults.agent_model_ids.clone()
        } else {
            dedupe(&self.agent_model_ids)
        };

        for run in &mut self.runs {
            if run.workflow_id.is_empty() {
                run.workflow_id = selected_workflow_id.clone();
            }
            if run.stages_config.is_empty() {
                run.stages_config = self.stages.clone();
            }
            if run.models.agent_model_ids.is_empty() {
                run.models.agent_model_ids = pool.clone();
            }
            if run.models.synthesis_model_id.is_empty() {
                run.models.synthesis_model_id = synthesis.clone();
            }
            if run.models.review_model_id.is_empty() {
                run.models.review_model_id = review.clone();
            }
            let run_id = run.id.clone();
            let mut per_stage: HashMap<String, usize> = HashMap::new();
            for result in run.stages.iter_mut() {
                let index = per_stage.entry(result.stage_id.clone()).or_default();
                result.id = stage_result_id(&run_id, &result.stage_id, &result.model_id, *index);
                *index += 1;
                if result.agent_label.is_empty() {
                    result.agent_label = resolver.agent_label(&result.model_id);
                }
            }
            if let Some(final_result) = run.final_result.as_mut() {
                if final_result.id.is_empty() {
                    final_result.id = FINAL_RESULT_ID.to_string();
                }
                if final_result.agent_label.is_empty() {
                    final_result.agent_label = resolver.agent_label(&final_result.model_id);
                }
            }
        }

        let workflow_state = WorkflowState::new(
            std::mem::take(&mut self.workflows),
            Some(selected_workflow_id.as_str()),
        );
        self.workflows = workflow_state.workflows().to_vec();
        self.selected_workflow_id = Some(workflow_state.selected_workflow_id().to_string());
        if self.stages.is_empty() {
            self.stages = match workflow_state.stages() {
                [] => default_stages(),
                stages => stages.to_vec(),
            };
        }
        self.agent_model_ids = pool;
        self.synthesis_model_id = Some(synthesis);
        self.review_model_id = Some(review);
        self.retry_enabled = Some(self.retry_enabled.unwrap_or(true));
        self.retry_threshold = Some(
            self.retry_threshold
                .unwrap_or(crate::pipeline::DEFAULT_RETRY_THRESHOLD),
        );
        self
    }

    pub fn models(&self) -> ModelSelection {
        ModelSelection {
            agent_model_ids: self.agent_model_ids.clone(),
            synthesis_model_id: self.synthesis_model_id.clone().unwrap_or_default(),
            review_model_id: self.review_model_id.clone().unwrap_or_default(),
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            enabled: self.retry_enabled.unwrap_or(defaults.enabled),
            threshold: self.retry_threshold.unwrap_or(defaults.threshold),
        }
    }

    /// Rebuild the workflow state, keeping the active stage list.
    pub fn workflow_state(&self) -> WorkflowState {
        WorkflowState::new(self.workflows.clone(), self.selected_workflow_id.as_deref())
            .with_active_stages(self.stages.clone())
            .with_sync_suppressed(self.skip_next_sync)
    }

    fn with_runs(&self, runs: Vec<PipelineRun>) -> Self {
        let selected_run_id = self
            .selected_run_id
            .clone()
            .filter(|id| runs.iter().any(|r| &r.id == id));
        Self {
            runs,
            selected_run_id,
            ..self.clone()
        }
    }
}

/// Durable storage for [`StoredState`] snapshots.
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<StoredState>, StoreError>;

    fn save(&self, state: &StoredState) -> Result<(), StoreError>;
}

/// Which representation a snapshot was stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistTier {
    Full,
    Trimmed,
    Stripped,
}

/// Save `state`, degrading on capacity failures: every run, then the
/// `fallback_runs` most recent, then those runs stripped of outputs,
/// errors, requests and responses. Other errors are returned unchanged.
pub fn persist_with_fallback(
    store: &dyn SnapshotStore,
    state: &StoredState,
    fallback_runs: usize,
) -> Result<PersistTier, StoreError> {
    match store.save(state) {
        Ok(()) => return Ok(PersistTier::Full),
        Err(e) if e.is_capacity() => {
            warn!(runs = state.runs.len(), error = %e, "Snapshot too large, trimming history");
        }
        Err(e) => return Err(e),
    }

    let trimmed_runs: Vec<PipelineRun> = state.runs.iter().take(fallback_runs).cloned().collect();
    let trimmed = state.with_runs(trimmed_runs);
    match store.save(&trimmed) {
        Ok(()) => return Ok(PersistTier::Trimmed),
        Err(e) if e.is_capacity() => {
            warn!(runs = trimmed.runs.len(), error = %e, "Trimmed snapshot too large, stripping run details");
        }
        Err(e) => return Err(e),
    }

    let stripped = trimmed.with_runs(trimmed.runs.iter().map(PipelineRun::stripped).collect());
    store.save(&stripped)?;
    Ok(PersistTier::Stripped)
}

/// JSON file store with an optional byte capacity.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    capacity: Option<usize>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            capacity: None,
        }
    }

    /// Store `state.json` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(STATE_FILE))
    }

    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the stored snapshot, if any.
    pub fn remove(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<StoredState>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        match serde_json::from_str(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable snapshot");
                Ok(None)
            }
        }
    }

    fn save(&self, state: &StoredState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state)?;
        if let Some(capacity) = self.capacity
            && json.len() > capacity
        {
            return Err(StoreError::CapacityExceeded {
                bytes: json.len(),
                capacity,
            });
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        // Write-then-rename so a crash never leaves a half-written snapshot.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), bytes = json.len(), "Snapshot saved");
        Ok(())
    }
}

/// In-process store, mainly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<String>>,
    capacity: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            snapshot: Mutex::new(None),
            capacity: Some(bytes),
        }
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Option<StoredState>, StoreError> {
        let guard = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_deref()
            .map(serde_json::from_str::<StoredState>)
            .transpose()
            .map_err(StoreError::from)
    }

    fn save(&self, state: &StoredState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        if let Some(capacity) = self.capacity
            && json.len() > capacity
        {
            return Err(StoreError::CapacityExceeded {
                bytes: json.len(),
                capacity,
            });
        }
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(json);
        Ok(())
    }
}

/// Load and normalise stored state, treating an absent snapshot as a fresh
/// session built from `defaults`.
pub fn load_state(
    store: &dyn SnapshotStore,
    defaults: &ModelSelection,
    resolver: &dyn AgentResolver,
) -> Result<StoredState, StoreError> {
    let state = match store.load()? {
        Some(state) => state,
        None => {
            info!("No stored state, starting with defaults");
            StoredState::default()
        }
    };
    Ok(state.normalize(defaults, resolver))
}
