//! Request gateway contract.
//!
//! The pipeline never talks to a provider directly. It hands a
//! [`StageCall`] to a [`StageGateway`] and gets back either the unit's
//! content with request/response metadata, or a [`GatewayError`] whose
//! message is recorded on the unit. Timeouts belong to the gateway.

pub mod resolver;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::GatewayError;
use crate::run::{StageRequest, StageResponse, Usage};
use crate::workflow::StageConfig;

pub use resolver::{AgentResolver, ModelCatalog};

/// Everything a gateway needs for one request.
#[derive(Debug, Clone)]
pub struct StageCall {
    pub api_key: String,
    pub base_url: String,
    pub stage: StageConfig,
    pub model_id: String,
    pub problem: String,
    /// Labelled fragments from every stage completed so far
    pub prior_outputs: Vec<String>,
}

impl StageCall {
    pub fn compose_request(&self) -> StageRequest {
        StageRequest::compose(&self.stage, &self.model_id, &self.problem, &self.prior_outputs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReply {
    pub content: String,
    pub request: StageRequest,
    pub response: StageResponse,
}

/// One request/response exchange with a model provider.
#[async_trait]
pub trait StageGateway: Send + Sync {
    async fn request_stage(&self, call: StageCall) -> Result<StageReply, GatewayError>;
}

/// Offline gateway that answers every request with a description of the
/// request it would have sent.
#[derive(Debug, Clone, Default)]
pub struct PreviewGateway;

#[async_trait]
impl StageGateway for PreviewGateway {
    async fn request_stage(&self, call: StageCall) -> Result<StageReply, GatewayError> {
        let request = call.compose_request();
        let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
        let content = format!(
            "[preview] {} via {} (temperature {:.2}, {} prior outputs, {} prompt characters)\n{}",
            call.stage.label,
            call.model_id,
            request.temperature,
            call.prior_outputs.len(),
            prompt_chars,
            call.stage.system_prompt.lines().next().unwrap_or_default(),
        );
        let prompt_tokens = (prompt_chars / 4) as u64;
        let completion_tokens = (content.len() / 4) as u64;
        let response = StageResponse {
            id: Some(format!("preview-{}", uuid::Uuid::new_v4())),
            model: Some(call.model_id.clone()),
            created: Some(Utc::now().timestamp()),
            usage: Some(Usage {
                prompt_tokens: Some(prompt_tokens),
                completion_tokens: Some(completion_tokens),
                total_tokens: Some(prompt_tokens + completion_tokens),
            }),
            cost: None,
        };
        Ok(StageReply {
            content,
            request,
            response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StageKind;

    fn call(prior: Vec<String>) -> StageCall {
        StageCall {
            api_key: "k".into(),
            base_url: "http://localhost".into(),
            stage: StageConfig::new("synthesis", "Synthesis", StageKind::Synthesis, "combine\nmore"),
            model_id: "m1".into(),
            problem: "why".into(),
            prior_outputs: prior,
        }
    }

    #[tokio::test]
    async fn test_preview_gateway_echoes_request() {
        let reply = PreviewGateway
            .request_stage(call(vec!["### A\none".into()]))
            .await
            .unwrap();
        assert!(reply.content.starts_with("[preview] Synthesis via m1"));
        assert!(reply.content.contains("1 prior outputs"));
        assert!(reply.content.ends_with("combine"));
        assert_eq!(reply.request, call(vec!["### A\none".into()]).compose_request());
        assert_eq!(reply.response.model.as_deref(), Some("m1"));
        assert!(reply.response.total_tokens().unwrap() > 0);
    }
}
