//! Active stage list and workflow catalog management.
//!
//! The active stage list is what the next run executes. It starts as a copy
//! of the selected workflow's stages and can then be edited without touching
//! the workflow itself. Edits reach a named workflow only through
//! [`WorkflowState::sync_stages_to_workflow`] or a saved draft.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::templates::{DEFAULT_WORKFLOW_ID, builtin_templates, is_template};
use super::{
    StageConfig, StageKind, WorkflowConfig, merge_templates, new_stage_id, new_workflow_id,
    slugify_stage_id,
};
use crate::errors::DraftError;

/// Result of pushing the active stage list back onto its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// The one suppression armed by loading a historical run was consumed.
    Suppressed,
    /// Built-in templates keep their shipped definition.
    Template,
    NoWorkflow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowState {
    workflows: Vec<WorkflowConfig>,
    selected_workflow_id: String,
    stages: Vec<StageConfig>,
    skip_next_sync: bool,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new(Vec::new(), None)
    }
}

impl WorkflowState {
    /// Build state from stored workflows. Templates are merged in first and
    /// the active stage list is copied from the selected workflow, falling
    /// back to the default template when the selection is unknown.
    pub fn new(stored: Vec<WorkflowConfig>, selected_workflow_id: Option<&str>) -> Self {
        let workflows = merge_templates(&builtin_templates(), stored);
        let selected = selected_workflow_id
            .filter(|id| workflows.iter().any(|w| w.id == *id))
            .unwrap_or(DEFAULT_WORKFLOW_ID)
            .to_string();
        let stages = workflows
            .iter()
            .find(|w| w.id == selected)
            .map(|w| w.stages.clone())
            .unwrap_or_default();
        Self {
            workflows,
            selected_workflow_id: selected,
            stages,
            skip_next_sync: false,
        }
    }

    /// Replace the active stage list, e.g. with stages restored from storage.
    pub fn with_active_stages(mut self, stages: Vec<StageConfig>) -> Self {
        if !stages.is_empty() {
            self.stages = stages;
        }
        self
    }

    pub fn workflows(&self) -> &[WorkflowConfig] {
        &self.workflows
    }

    pub fn selected_workflow_id(&self) -> &str {
        &self.selected_workflow_id
    }

    pub fn selected_workflow(&self) -> Option<&WorkflowConfig> {
        self.workflow(&self.selected_workflow_id)
    }

    pub fn workflow(&self, id: &str) -> Option<&WorkflowConfig> {
        self.workflows.iter().find(|w| w.id == id)
    }

    /// The active stage list.
    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn sync_suppressed(&self) -> bool {
        self.skip_next_sync
    }

    /// Restore a pending sync suppression carried over from a snapshot.
    pub fn with_sync_suppressed(mut self, suppressed: bool) -> Self {
        self.skip_next_sync = suppressed;
        self
    }

    /// Switch the active workflow, replacing the active stage list wholesale.
    /// Returns false for an unknown id.
    pub fn select_workflow(&mut self, workflow_id: &str) -> bool {
        let Some(workflow) = self.workflow(workflow_id) else {
            return false;
        };
        self.stages = workflow.stages.clone();
        self.selected_workflow_id = workflow_id.to_string();
        debug!(workflow_id, stages = self.stages.len(), "Selected workflow");
        true
    }

    /// Re-apply a historical run's frozen stages to the active list.
    ///
    /// The next [`sync_stages_to_workflow`](Self::sync_stages_to_workflow)
    /// is suppressed so the snapshot does not flow back into the workflow
    /// the run was derived from.
    pub fn apply_workflow_from_run(&mut self, workflow_id: Option<&str>, stages: &[StageConfig]) {
        self.skip_next_sync = true;
        if let Some(id) = workflow_id.filter(|id| self.workflow(id).is_some()) {
            self.selected_workflow_id = id.to_string();
        }
        self.stages = stages.to_vec();
        debug!(
            workflow_id = %self.selected_workflow_id,
            stages = self.stages.len(),
            "Applied run stage snapshot"
        );
    }

    /// Write the active stage list onto the selected workflow.
    pub fn sync_stages_to_workflow(&mut self) -> SyncOutcome {
        if self.skip_next_sync {
            self.skip_next_sync = false;
            return SyncOutcome::Suppressed;
        }
        if is_template(&self.selected_workflow_id) {
            return SyncOutcome::Template;
        }
        let stages = self.stages.clone();
        match self
            .workflows
            .iter_mut()
            .find(|w| w.id == self.selected_workflow_id)
        {
            Some(workflow) => {
                workflow.stages = stages;
                SyncOutcome::Synced
            }
            None => SyncOutcome::NoWorkflow,
        }
    }

    /// Flip `enabled` on an active stage. Returns the new value.
    pub fn toggle_stage(&mut self, stage_id: &str) -> Option<bool> {
        let stage = self.stages.iter_mut().find(|s| s.id == stage_id)?;
        stage.enabled = !stage.enabled;
        Some(stage.enabled)
    }

    pub fn set_stage_prompt(&mut self, stage_id: &str, prompt: &str) -> bool {
        match self.stages.iter_mut().find(|s| s.id == stage_id) {
            Some(stage) => {
                stage.system_prompt = prompt.to_string();
                true
            }
            None => false,
        }
    }

    /// Save a draft as a new workflow, insert it first and make it active.
    pub fn save_draft(&mut self, draft: &WorkflowDraft) -> Result<WorkflowConfig, DraftError> {
        let workflow = draft.to_workflow()?;
        self.workflows.insert(0, workflow.clone());
        self.selected_workflow_id = workflow.id.clone();
        self.stages = workflow.stages.clone();
        debug!(workflow_id = %workflow.id, name = %workflow.name, "Saved workflow draft");
        Ok(workflow)
    }
}

/// One stage of a workflow being authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftStage {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub kind: StageKind,
}

impl DraftStage {
    pub fn empty(kind: StageKind) -> Self {
        Self {
            id: new_stage_id(),
            name: String::new(),
            prompt: String::new(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDraft {
    pub name: String,
    pub description: String,
    pub stages: Vec<DraftStage>,
}

impl Default for WorkflowDraft {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            stages: vec![DraftStage::empty(StageKind::Agent)],
        }
    }
}

impl WorkflowDraft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an empty agent stage and return its id.
    pub fn add_stage(&mut self) -> String {
        let stage = DraftStage::empty(StageKind::Agent);
        let id = stage.id.clone();
        self.stages.push(stage);
        id
    }

    pub fn update_stage(&mut self, stage_id: &str, update: impl FnOnce(&mut DraftStage)) -> bool {
        match self.stages.iter_mut().find(|s| s.id == stage_id) {
            Some(stage) => {
                update(stage);
                true
            }
            None => false,
        }
    }

    pub fn remove_stage(&mut self, stage_id: &str) -> bool {
        let before = self.stages.len();
        self.stages.retain(|s| s.id != stage_id);
        self.stages.len() != before
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Check the draft and build the workflow it describes.
    ///
    /// Stage ids are slugs of the stage names; colliding slugs get `-2`,
    /// `-3`… suffixes and an empty slug gets a random id.
    pub fn to_workflow(&self) -> Result<WorkflowConfig, DraftError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(DraftError::MissingName);
        }
        if self.stages.is_empty() {
            return Err(DraftError::MissingStages);
        }
        if let Some(index) = self
            .stages
            .iter()
            .position(|s| s.name.trim().is_empty() || s.prompt.trim().is_empty())
        {
            return Err(DraftError::MissingStageDetails { index: index + 1 });
        }

        let mut used = HashSet::new();
        let stages = self
            .stages
            .iter()
            .map(|draft| {
                let base = match slugify_stage_id(&draft.name) {
                    slug if slug.is_empty() => new_stage_id(),
                    slug => slug,
                };
                let mut id = base.clone();
                let mut suffix = 2;
                while used.contains(&id) {
                    id = format!("{}-{}", base, suffix);
                    suffix += 1;
                }
                used.insert(id.clone());
                StageConfig::new(&id, draft.name.trim(), draft.kind, draft.prompt.trim())
            })
            .collect();

        let description = self.description.trim();
        Ok(WorkflowConfig {
            id: new_workflow_id(),
            name: name.to_string(),
            description: (!description.is_empty()).then(|| description.to_string()),
            stages,
        })
    }
}
