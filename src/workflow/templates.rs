//! Built-in workflow templates.

use super::{StageConfig, StageKind, WorkflowConfig};

pub const DEFAULT_WORKFLOW_ID: &str = "default";
pub const DEBATE_WORKFLOW_ID: &str = "debate";

const ANALYSIS_PROMPT: &str = "You are one of several independent analysts. Work through the problem \
from first principles, state your assumptions explicitly, and propose a concrete solution. \
Do not hedge: commit to the approach you believe is strongest.";

const CRITIQUE_PROMPT: &str = "You are reviewing proposals written by other analysts. Identify \
errors, unstated assumptions and missed alternatives in the prior outputs, then give your own \
corrected recommendation.";

const SYNTHESIS_PROMPT: &str = "Combine the prior stage outputs into a single coherent solution. \
Keep the strongest ideas, resolve disagreements explicitly, and discard anything that was \
shown to be wrong.";

const REVIEW_PROMPT: &str = "Review the synthesized solution for correctness and completeness. \
Fix any remaining issues and produce the final answer, followed by a short list of residual \
risks.";

/// Stages of the default workflow.
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new(
            "analysis",
            "Independent analysis",
            StageKind::Agent,
            ANALYSIS_PROMPT,
        ),
        StageConfig::new("synthesis", "Synthesis", StageKind::Synthesis, SYNTHESIS_PROMPT),
        StageConfig::new("review", "Final review", StageKind::Review, REVIEW_PROMPT),
    ]
}

fn debate_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new("proposals", "Proposals", StageKind::Agent, ANALYSIS_PROMPT),
        StageConfig::new(
            "cross-examination",
            "Cross-examination",
            StageKind::Agent,
            CRITIQUE_PROMPT,
        ),
        StageConfig::new("synthesis", "Synthesis", StageKind::Synthesis, SYNTHESIS_PROMPT),
        StageConfig::new("review", "Final review", StageKind::Review, REVIEW_PROMPT),
    ]
}

/// Templates shipped with the binary. They are restored to these definitions
/// every time stored workflows are merged.
pub fn builtin_templates() -> Vec<WorkflowConfig> {
    vec![
        WorkflowConfig {
            id: DEFAULT_WORKFLOW_ID.to_string(),
            name: "Default pipeline".to_string(),
            description: Some(
                "Baseline multi-stage workflow for structured solutions.".to_string(),
            ),
            stages: default_stages(),
        },
        WorkflowConfig {
            id: DEBATE_WORKFLOW_ID.to_string(),
            name: "Debate".to_string(),
            description: Some(
                "Agents propose, then critique each other before synthesis.".to_string(),
            ),
            stages: debate_stages(),
        },
    ]
}

/// True when `id` names a built-in template.
pub fn is_template(id: &str) -> bool {
    builtin_templates().iter().any(|t| t.id == id)
}
