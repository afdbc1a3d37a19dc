//! Display labels for model ids.

use std::collections::{BTreeMap, HashMap};

/// Maps a model id to the label shown next to its output.
///
/// Implementations must be total: an unknown id resolves to itself.
pub trait AgentResolver: Send + Sync {
    fn agent_label(&self, model_id: &str) -> String;
}

const BUILTIN_LABELS: &[(&str, &str)] = &[
    ("openai/gpt-4o", "GPT-4o"),
    ("openai/gpt-4o-mini", "GPT-4o mini"),
    ("openai/gpt-4.1", "GPT-4.1"),
    ("openai/gpt-4.1-mini", "GPT-4.1 mini"),
    ("anthropic/claude-sonnet-4.5", "Claude Sonnet 4.5"),
    ("anthropic/claude-haiku-4.5", "Claude Haiku 4.5"),
    ("anthropic/claude-opus-4.1", "Claude Opus 4.1"),
    ("google/gemini-2.5-pro", "Gemini 2.5 Pro"),
    ("google/gemini-2.5-flash", "Gemini 2.5 Flash"),
    ("google/gemini-3-flash-preview", "Gemini 3 Flash Preview"),
    ("meta-llama/llama-3.3-70b-instruct", "Llama 3.3 70B Instruct"),
    ("mistralai/mistral-large", "Mistral Large"),
    ("deepseek/deepseek-chat", "DeepSeek V3"),
    ("x-ai/grok-4", "Grok 4"),
];

/// Built-in model labels extended with user-configured entries.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    labels: HashMap<String, String>,
}

impl ModelCatalog {
    /// A catalog with no entries; every id resolves to itself.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self {
            labels: BUILTIN_LABELS
                .iter()
                .map(|(id, label)| (id.to_string(), label.to_string()))
                .collect(),
        }
    }

    /// Add or override labels. Configured entries win over built-ins.
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.labels.contains_key(model_id)
    }

    /// Known ids with their labels, sorted by id.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self
            .labels
            .iter()
            .map(|(id, label)| (id.as_str(), label.as_str()))
            .collect();
        entries.sort();
        entries
    }
}

impl AgentResolver for ModelCatalog {
    fn agent_label(&self, model_id: &str) -> String {
        self.labels
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| model_id.to_string())
    }
}
