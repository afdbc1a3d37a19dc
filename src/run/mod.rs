//! Run records: per-unit results, the terminal review result and the run
//! that owns them.
//!
//! A [`PipelineRun`] freezes the stage configuration and model selection it
//! was started with. Only `stages` and `final_result` change while the run
//! executes, one unit at a time, through the id-addressed helpers
//! [`update_run_stage`] and [`update_run_final`].

pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::resolver::AgentResolver;
use crate::workflow::{StageConfig, StageKind, execution_stages, terminal_review};

pub use registry::{MAX_RUNS, RunRegistry};

/// Id of the single final result of a run.
pub const FINAL_RESULT_ID: &str = "final";
pub const FINAL_RESULT_LABEL: &str = "Final review";

/// Unit state machine: `pending → running → complete | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Error,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Payload sent to the provider for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    pub model: String,
    pub temperature: f64,
    pub messages: Vec<ChatMessage>,
}

impl StageRequest {
    /// Build the payload for one unit: the stage prompt as the system
    /// message, then the problem plus any prior stage outputs.
    pub fn compose(
        stage: &StageConfig,
        model_id: &str,
        problem: &str,
        prior_outputs: &[String],
    ) -> Self {
        let mut user = problem.trim().to_string();
        if !prior_outputs.is_empty() {
            user.push_str("\n\nPrior stage outputs:\n\n");
            user.push_str(&prior_outputs.join("\n\n"));
        }
        Self {
            model: model_id.to_string(),
            temperature: stage.temperature,
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: stage.system_prompt.clone(),
                },
                ChatMessage {
                    role: Role::User,
                    content: user,
                },
            ],
        }
    }

    /// Content of the last user message.
    pub fn user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// Provider response metadata. Opaque to the pipeline apart from cost and
/// token counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl StageResponse {
    pub fn total_tokens(&self) -> Option<u64> {
        self.usage.as_ref().and_then(|u| {
            u.total_tokens.or(match (u.prompt_tokens, u.completion_tokens) {
                (None, None) => None,
                (p, c) => Some(p.unwrap_or(0) + c.unwrap_or(0)),
            })
        })
    }
}

/// Progress of one unit of work, shared by stage and final results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitState {
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<StageRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<StageResponse>,
}

impl UnitState {
    pub fn start(&mut self, at: DateTime<Utc>) {
        self.status = StageStatus::Running;
        self.started_at = Some(at);
    }

    pub fn complete(
        &mut self,
        at: DateTime<Utc>,
        output: String,
        request: StageRequest,
        response: StageResponse,
    ) {
        self.settle(at);
        self.status = StageStatus::Complete;
        self.output = Some(output);
        self.request = Some(request);
        self.response = Some(response);
    }

    pub fn fail(&mut self, at: DateTime<Utc>, message: String) {
        self.settle(at);
        self.status = StageStatus::Error;
        self.error = Some(message);
    }

    // Duration runs from the moment the unit was marked running, across all
    // retry attempts.
    fn settle(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.duration_ms = Some(
            self.started_at
                .map(|started| (at - started).num_milliseconds().max(0))
                .unwrap_or(0),
        );
    }

    /// Drop the bulky fields, keeping status and timing.
    pub fn strip(&mut self) {
        self.output = None;
        self.error = None;
        self.request = None;
        self.response = None;
    }

    pub fn cost(&self) -> Option<f64> {
        self.response.as_ref().and_then(|r| r.cost)
    }

    pub fn tokens(&self) -> Option<u64> {
        self.response.as_ref().and_then(StageResponse::total_tokens)
    }
}

/// One agent unit of work within a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub id: String,
    pub stage_id: String,
    #[serde(default)]
    pub stage_label: String,
    pub model_id: String,
    #[serde(default)]
    pub agent_label: String,
    /// Prompt snapshot taken when the run was constructed
    #[serde(default)]
    pub system_prompt: String,
    #[serde(flatten)]
    pub state: UnitState,
}

impl StageResult {
    pub fn status(&self) -> StageStatus {
        self.state.status
    }
}

/// Result of the terminal review stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResult {
    #[serde(default = "default_final_id")]
    pub id: String,
    #[serde(default = "default_final_label")]
    pub label: String,
    pub model_id: String,
    #[serde(default)]
    pub agent_label: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(flatten)]
    pub state: UnitState,
}

fn default_final_id() -> String {
    FINAL_RESULT_ID.to_string()
}

fn default_final_label() -> String {
    FINAL_RESULT_LABEL.to_string()
}

impl FinalResult {
    pub fn status(&self) -> StageStatus {
        self.state.status
    }
}

/// The models a run fans out to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSelection {
    #[serde(default)]
    pub agent_model_ids: Vec<String>,
    #[serde(default)]
    pub synthesis_model_id: String,
    #[serde(default)]
    pub review_model_id: String,
}

impl ModelSelection {
    /// Append a model to the agent pool. Blank ids and duplicates are
    /// rejected.
    pub fn add_agent(&mut self, model_id: &str) -> bool {
        let model_id = model_id.trim();
        if model_id.is_empty() || self.agent_model_ids.iter().any(|m| m == model_id) {
            return false;
        }
        self.agent_model_ids.push(model_id.to_string());
        true
    }

    pub fn update_agent(&mut self, index: usize, model_id: &str) -> bool {
        match self.agent_model_ids.get_mut(index) {
            Some(slot) => {
                *slot = model_id.trim().to_string();
                true
            }
            None => false,
        }
    }

    pub fn remove_agent(&mut self, index: usize) -> Option<String> {
        (index < self.agent_model_ids.len()).then(|| self.agent_model_ids.remove(index))
    }

    pub fn reset_agents(&mut self, defaults: &[String]) {
        self.agent_model_ids = defaults.to_vec();
    }
}

/// One end-to-end execution of a workflow against a problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: String,
    #[serde(default)]
    pub workflow_id: String,
    /// Stage configuration frozen at run start
    #[serde(default)]
    pub stages_config: Vec<StageConfig>,
    #[serde(flatten)]
    pub models: ModelSelection,
    pub problem: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stages: Vec<StageResult>,
    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<FinalResult>,
}

/// Deterministic unit id; the index keeps a model listed twice unique.
pub fn stage_result_id(run_id: &str, stage_id: &str, model_id: &str, index: usize) -> String {
    format!("{}:{}:{}:{}", run_id, stage_id, model_id, index)
}

pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl PipelineRun {
    /// Build a run with every unit pending.
    ///
    /// Agent stages get one unit per pool model, synthesis stages one unit,
    /// and the final result exists only when a terminal review is enabled.
    pub fn plan(
        id: String,
        workflow_id: &str,
        stages: &[StageConfig],
        models: &ModelSelection,
        problem: &str,
        created_at: DateTime<Utc>,
        resolver: &dyn AgentResolver,
    ) -> Self {
        let pending = |stage: &StageConfig, model_id: &str, index: usize| StageResult {
            id: stage_result_id(&id, &stage.id, model_id, index),
            stage_id: stage.id.clone(),
            stage_label: stage.label.clone(),
            model_id: model_id.to_string(),
            agent_label: resolver.agent_label(model_id),
            system_prompt: stage.system_prompt.clone(),
            state: UnitState::default(),
        };

        let results = execution_stages(stages)
            .into_iter()
            .flat_map(|stage| match stage.kind {
                StageKind::Agent => models
                    .agent_model_ids
                    .iter()
                    .enumerate()
                    .map(|(index, model_id)| pending(stage, model_id, index))
                    .collect::<Vec<_>>(),
                StageKind::Synthesis => vec![pending(stage, &models.synthesis_model_id, 0)],
                StageKind::Review => Vec::new(),
            })
            .collect();

        let final_result = terminal_review(stages).map(|review| FinalResult {
            id: FINAL_RESULT_ID.to_string(),
            label: FINAL_RESULT_LABEL.to_string(),
            model_id: models.review_model_id.clone(),
            agent_label: resolver.agent_label(&models.review_model_id),
            system_prompt: review.system_prompt.clone(),
            state: UnitState::default(),
        });

        Self {
            workflow_id: workflow_id.to_string(),
            stages_config: stages.to_vec(),
            models: models.clone(),
            problem: problem.trim().to_string(),
            created_at,
            stages: results,
            final_result,
            id,
        }
    }

    pub fn results_for_stage(&self, stage_id: &str) -> Vec<&StageResult> {
        self.stages.iter().filter(|r| r.stage_id == stage_id).collect()
    }

    pub fn stage_status(&self, stage_id: &str) -> Option<StageStatus> {
        aggregate_status(self.results_for_stage(stage_id))
    }

    /// Overall status across every unit and the final review. A run with
    /// no units reads as pending.
    pub fn status(&self) -> StageStatus {
        aggregate(
            self.stages
                .iter()
                .map(StageResult::status)
                .chain(self.final_result.iter().map(FinalResult::status)),
        )
        .unwrap_or_default()
    }

    /// True once no unit is left running and the pipeline has stopped.
    pub fn is_settled(&self) -> bool {
        let final_done = self
            .final_result
            .as_ref()
            .is_none_or(|f| f.status().is_terminal());
        let any_error = self.stages.iter().any(|r| r.status() == StageStatus::Error);
        let none_running = self
            .stages
            .iter()
            .all(|r| r.status() != StageStatus::Running);
        let all_done = self.stages.iter().all(|r| r.status().is_terminal()) && final_done;
        none_running && (any_error || all_done)
    }

    pub fn total_cost(&self) -> Option<f64> {
        sum_present(self.unit_states().map(UnitState::cost))
    }

    pub fn total_tokens(&self) -> Option<u64> {
        let tokens: Vec<u64> = self.unit_states().filter_map(UnitState::tokens).collect();
        (!tokens.is_empty()).then(|| tokens.iter().sum())
    }

    fn unit_states(&self) -> impl Iterator<Item = &UnitState> {
        self.stages
            .iter()
            .map(|r| &r.state)
            .chain(self.final_result.iter().map(|f| &f.state))
    }

    /// Copy of the run without outputs, errors, requests or responses.
    pub fn stripped(&self) -> Self {
        let mut run = self.clone();
        for result in &mut run.stages {
            result.state.strip();
        }
        if let Some(final_result) = run.final_result.as_mut() {
            final_result.state.strip();
        }
        run
    }
}

fn sum_present(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    values
        .flatten()
        .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

/// Aggregate status of a stage's units.
///
/// Any error wins, then any running; all complete is complete; anything else
/// is pending. `None` when the stage has no units.
pub fn aggregate_status<'a>(
    results: impl IntoIterator<Item = &'a StageResult>,
) -> Option<StageStatus> {
    aggregate(results.into_iter().map(StageResult::status))
}

fn aggregate(statuses: impl IntoIterator<Item = StageStatus>) -> Option<StageStatus> {
    let statuses: Vec<StageStatus> = statuses.into_iter().collect();
    if statuses.is_empty() {
        return None;
    }
    if statuses.contains(&StageStatus::Error) {
        return Some(StageStatus::Error);
    }
    if statuses.contains(&StageStatus::Running) {
        return Some(StageStatus::Running);
    }
    if statuses.iter().all(|s| *s == StageStatus::Complete) {
        return Some(StageStatus::Complete);
    }
    Some(StageStatus::Pending)
}

/// Number of provider requests a run of `stages` issues (retries excluded).
pub fn request_count(stages: &[StageConfig], agent_count: usize) -> usize {
    let main: usize = execution_stages(stages)
        .iter()
        .map(|stage| match stage.kind {
            StageKind::Agent => agent_count,
            _ => 1,
        })
        .sum();
    main + usize::from(terminal_review(stages).is_some())
}

/// Apply `update` to one stage result of one run, leaving every other unit
/// untouched. Returns false if either id is unknown.
pub fn update_run_stage(
    runs: &mut [PipelineRun],
    run_id: &str,
    result_id: &str,
    update: impl FnOnce(&mut StageResult),
) -> bool {
    let Some(result) = runs
        .iter_mut()
        .find(|run| run.id == run_id)
        .and_then(|run| run.stages.iter_mut().find(|r| r.id == result_id))
    else {
        return false;
    };
    update(result);
    true
}

/// Apply `update` to the final result of one run. Returns false if the run
/// is unknown or has no final result.
pub fn update_run_final(
    runs: &mut [PipelineRun],
    run_id: &str,
    update: impl FnOnce(&mut FinalResult),
) -> bool {
    let Some(final_result) = runs
        .iter_mut()
        .find(|run| run.id == run_id)
        .and_then(|run| run.final_result.as_mut())
    else {
        return false;
    };
    update(final_result);
    true
}
