//! Workflow and stage definitions.
//!
//! A workflow is an ordered list of stages. Each stage is tagged with a
//! [`StageKind`] that fully determines how the pipeline executes it:
//!
//! | Kind        | Fan-out                           | Position                      |
//! |-------------|-----------------------------------|-------------------------------|
//! | `agent`     | one request per agent-pool model  | configured order              |
//! | `synthesis` | one request, synthesis model      | configured order              |
//! | `review`    | one request, review model         | always last (last enabled wins) |

pub mod state;
pub mod templates;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use state::{DraftStage, WorkflowDraft, WorkflowState};
pub use templates::{DEFAULT_WORKFLOW_ID, builtin_templates, default_stages};

/// Closed set of stage kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    #[default]
    Agent,
    Synthesis,
    Review,
}

impl StageKind {
    /// Sampling temperature a stage of this kind gets when none is stored.
    pub fn default_temperature(self) -> f64 {
        match self {
            StageKind::Agent => 0.4,
            StageKind::Synthesis => 0.35,
            StageKind::Review => 0.2,
        }
    }

    /// Infer a kind for legacy stages that were stored without one.
    pub fn infer_from_id(id: &str) -> Self {
        match id {
            "synthesis" => StageKind::Synthesis,
            "review" => StageKind::Review,
            _ => StageKind::Agent,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Agent => "agent",
            StageKind::Synthesis => "synthesis",
            StageKind::Review => "review",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "agent" => Ok(StageKind::Agent),
            "synthesis" => Ok(StageKind::Synthesis),
            "review" => Ok(StageKind::Review),
            _ => anyhow::bail!(
                "Invalid stage kind '{}'. Valid values: agent, synthesis, review",
                s
            ),
        }
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredStageConfig")]
pub struct StageConfig {
    /// Unique within its workflow
    pub id: String,
    pub label: String,
    pub enabled: bool,
    pub kind: StageKind,
    /// Prompt template sent as the system message
    pub system_prompt: String,
    pub temperature: f64,
}

impl StageConfig {
    pub fn new(id: &str, label: &str, kind: StageKind, system_prompt: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            enabled: true,
            kind,
            system_prompt: system_prompt.to_string(),
            temperature: kind.default_temperature(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

/// On-disk shape of a stage, tolerant of records written before `kind` and
/// `temperature` existed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredStageConfig {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    kind: Option<StageKind>,
    #[serde(default)]
    system_prompt: String,
    #[serde(default)]
    temperature: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl From<StoredStageConfig> for StageConfig {
    fn from(raw: StoredStageConfig) -> Self {
        let kind = raw.kind.unwrap_or_else(|| StageKind::infer_from_id(&raw.id));
        Self {
            temperature: raw.temperature.unwrap_or_else(|| kind.default_temperature()),
            id: raw.id,
            label: raw.label,
            enabled: raw.enabled,
            kind,
            system_prompt: raw.system_prompt,
        }
    }
}

/// A named, ordered list of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl WorkflowConfig {
    pub fn enabled_stages(&self) -> Vec<&StageConfig> {
        self.stages.iter().filter(|s| s.enabled).collect()
    }

    /// A workflow needs at least one enabled stage to run.
    pub fn is_runnable(&self) -> bool {
        self.stages.iter().any(|s| s.enabled)
    }
}

/// The terminal review stage: the last enabled review-kind stage.
///
/// Earlier enabled review stages stay in the configuration but never execute.
pub fn terminal_review(stages: &[StageConfig]) -> Option<&StageConfig> {
    stages
        .iter()
        .rev()
        .find(|s| s.enabled && s.kind == StageKind::Review)
}

/// Enabled non-review stages in configured order.
pub fn execution_stages(stages: &[StageConfig]) -> Vec<&StageConfig> {
    stages
        .iter()
        .filter(|s| s.enabled && s.kind != StageKind::Review)
        .collect()
}

/// Merge stored workflows with the built-in templates.
///
/// Templates come first and always carry their shipped definition; stored
/// workflows sharing a template id are dropped, the rest follow in order.
pub fn merge_templates(
    templates: &[WorkflowConfig],
    workflows: Vec<WorkflowConfig>,
) -> Vec<WorkflowConfig> {
    let template_ids: HashSet<&str> = templates.iter().map(|t| t.id.as_str()).collect();
    let extra = workflows
        .into_iter()
        .filter(|w| !template_ids.contains(w.id.as_str()));
    templates.iter().cloned().chain(extra).collect()
}

/// Turn a stage name into an id: lowercase ASCII alphanumerics joined by `-`.
pub fn slugify_stage_id(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn new_workflow_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_stage_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Remove duplicates, keeping the first occurrence.
pub fn dedupe(items: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}
