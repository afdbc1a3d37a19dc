//! Executes one stage of a run.
//!
//! Dispatch is on [`StageKind`]:
//! - agent stages fan out one task per pool model and wait for every task
//!   to settle before the stage is judged
//! - synthesis stages issue a single request with the synthesis model
//! - the terminal review issues a single request with the review model and
//!   writes the run's final result
//!
//! Fragments are folded in pool order, never in completion order.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::orchestrator::{EventSink, RunEvent};
use super::retry::RetryPolicy;
use crate::gateway::{AgentResolver, StageCall, StageGateway};
use crate::run::{
    FINAL_RESULT_ID, ModelSelection, RunRegistry, StageStatus, UnitState, stage_result_id,
};
use crate::workflow::{StageConfig, StageKind};

/// Per-run values shared by every unit.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub problem: String,
    pub api_key: String,
    pub base_url: String,
    pub models: ModelSelection,
}

/// How a stage settled.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Every unit completed; labelled fragments in pool order.
    Complete(Vec<String>),
    /// At least one unit ended in error after its retries.
    Failed { failed_units: usize },
}

impl StageOutcome {
    pub fn status(&self) -> StageStatus {
        match self {
            Self::Complete(_) => StageStatus::Complete,
            Self::Failed { .. } => StageStatus::Error,
        }
    }
}

#[derive(Debug, Clone)]
enum UnitTarget {
    Stage(String),
    Final,
}

impl UnitTarget {
    fn id(&self) -> &str {
        match self {
            Self::Stage(id) => id,
            Self::Final => FINAL_RESULT_ID,
        }
    }
}

#[derive(Clone)]
pub struct StageExecutor {
    gateway: Arc<dyn StageGateway>,
    resolver: Arc<dyn AgentResolver>,
    registry: RunRegistry,
    retry: RetryPolicy,
    events: EventSink,
}

impl StageExecutor {
    pub fn new(
        gateway: Arc<dyn StageGateway>,
        resolver: Arc<dyn AgentResolver>,
        registry: RunRegistry,
        retry: RetryPolicy,
        events: EventSink,
    ) -> Self {
        Self {
            gateway,
            resolver,
            registry,
            retry,
            events,
        }
    }

    /// Run every unit of `stage` against the accumulated `prior` fragments.
    pub async fn execute(
        &self,
        ctx: &Arc<RunContext>,
        stage: &StageConfig,
        prior: &[String],
    ) -> StageOutcome {
        match stage.kind {
            StageKind::Agent => self.fan_out(ctx, stage, prior).await,
            StageKind::Synthesis => self.synthesize(ctx, stage, prior).await,
            StageKind::Review => self.review(ctx, stage, prior).await,
        }
    }

    async fn fan_out(
        &self,
        ctx: &Arc<RunContext>,
        stage: &StageConfig,
        prior: &[String],
    ) -> StageOutcome {
        let models = &ctx.models.agent_model_ids;
        self.events
            .emit(RunEvent::StageStarted {
                run_id: ctx.run_id.clone(),
                stage_id: stage.id.clone(),
                label: stage.label.clone(),
                kind: stage.kind,
                units: models.len(),
            })
            .await;
        info!(run_id = %ctx.run_id, stage_id = %stage.id, agents = models.len(), "Fanning out agent stage");

        let prior: Arc<[String]> = prior.into();
        let handles: Vec<_> = models
            .iter()
            .enumerate()
            .map(|(index, model_id)| {
                let executor = self.clone();
                let ctx = Arc::clone(ctx);
                let stage = stage.clone();
                let prior = Arc::clone(&prior);
                let target = UnitTarget::Stage(stage_result_id(&ctx.run_id, &stage.id, model_id, index));
                let model_id = model_id.clone();
                tokio::spawn(async move {
                    executor
                        .run_unit(&ctx, &stage, &model_id, &prior, &target)
                        .await
                })
            })
            .collect();

        let settled = join_all(handles).await;

        let mut fragments = Vec::with_capacity(settled.len());
        let mut failed_units = 0;
        for (index, (joined, model_id)) in settled.into_iter().zip(models).enumerate() {
            match joined {
                Ok(Ok(content)) => fragments.push(format!(
                    "### {} ({})\n{}",
                    stage.label,
                    self.resolver.agent_label(model_id),
                    content
                )),
                Ok(Err(_)) => failed_units += 1,
                Err(join_err) => {
                    // The task died before recording an outcome.
                    failed_units += 1;
                    let target =
                        UnitTarget::Stage(stage_result_id(&ctx.run_id, &stage.id, model_id, index));
                    let message = format!("Unit task aborted: {}", join_err);
                    warn!(run_id = %ctx.run_id, unit = target.id(), error = %message, "Unit task failed");
                    self.update_unit(&ctx.run_id, &target, |state| state.fail(Utc::now(), message))
                        .await;
                }
            }
        }

        let outcome = if failed_units == 0 {
            StageOutcome::Complete(fragments)
        } else {
            StageOutcome::Failed { failed_units }
        };
        self.finish_stage(ctx, stage, &outcome).await;
        outcome
    }

    async fn synthesize(
        &self,
        ctx: &Arc<RunContext>,
        stage: &StageConfig,
        prior: &[String],
    ) -> StageOutcome {
        let model_id = &ctx.models.synthesis_model_id;
        self.events
            .emit(RunEvent::StageStarted {
                run_id: ctx.run_id.clone(),
                stage_id: stage.id.clone(),
                label: stage.label.clone(),
                kind: stage.kind,
                units: 1,
            })
            .await;

        let target = UnitTarget::Stage(stage_result_id(&ctx.run_id, &stage.id, model_id, 0));
        let outcome = match self.run_unit(ctx, stage, model_id, prior, &target).await {
            Ok(content) => StageOutcome::Complete(vec![format!("### {}\n{}", stage.label, content)]),
            Err(_) => StageOutcome::Failed { failed_units: 1 },
        };
        self.finish_stage(ctx, stage, &outcome).await;
        outcome
    }

    async fn review(
        &self,
        ctx: &Arc<RunContext>,
        stage: &StageConfig,
        prior: &[String],
    ) -> StageOutcome {
        let model_id = &ctx.models.review_model_id;
        self.events
            .emit(RunEvent::FinalStarted {
                run_id: ctx.run_id.clone(),
                stage_id: stage.id.clone(),
                model_id: model_id.clone(),
            })
            .await;

        let outcome = match self
            .run_unit(ctx, stage, model_id, prior, &UnitTarget::Final)
            .await
        {
            Ok(content) => StageOutcome::Complete(vec![format!("### {}\n{}", stage.label, content)]),
            Err(_) => StageOutcome::Failed { failed_units: 1 },
        };
        self.events
            .emit(RunEvent::FinalFinished {
                run_id: ctx.run_id.clone(),
                status: outcome.status(),
            })
            .await;
        outcome
    }

    async fn finish_stage(&self, ctx: &RunContext, stage: &StageConfig, outcome: &StageOutcome) {
        info!(run_id = %ctx.run_id, stage_id = %stage.id, status = %outcome.status(), "Stage finished");
        self.events
            .emit(RunEvent::StageFinished {
                run_id: ctx.run_id.clone(),
                stage_id: stage.id.clone(),
                status: outcome.status(),
            })
            .await;
    }

    /// Run one unit through the retry policy and record its outcome.
    ///
    /// Returns the raw content on success and the last error message
    /// otherwise. The unit is always left complete or error.
    async fn run_unit(
        &self,
        ctx: &RunContext,
        stage: &StageConfig,
        model_id: &str,
        prior: &[String],
        target: &UnitTarget,
    ) -> Result<String, String> {
        let started = Utc::now();
        self.update_unit(&ctx.run_id, target, |state| state.start(started))
            .await;
        self.events
            .emit(RunEvent::UnitStarted {
                run_id: ctx.run_id.clone(),
                unit_id: target.id().to_string(),
                stage_id: stage.id.clone(),
                model_id: model_id.to_string(),
            })
            .await;

        let call = StageCall {
            api_key: ctx.api_key.clone(),
            base_url: ctx.base_url.clone(),
            stage: stage.clone(),
            model_id: model_id.to_string(),
            problem: ctx.problem.clone(),
            prior_outputs: prior.to_vec(),
        };
        let gateway = &self.gateway;
        let result = self
            .retry
            .run(target.id(), |attempt| {
                let call = call.clone();
                debug!(run_id = %ctx.run_id, unit = target.id(), model = %call.model_id, attempt, "Requesting stage");
                async move { gateway.request_stage(call).await }
            })
            .await;

        match result {
            Ok(reply) => {
                let content = reply.content.clone();
                let cost = reply.response.cost;
                let mut duration_ms = None;
                self.update_unit(&ctx.run_id, target, |state| {
                    state.complete(Utc::now(), reply.content, reply.request, reply.response);
                    duration_ms = state.duration_ms;
                })
                .await;
                debug!(run_id = %ctx.run_id, unit = target.id(), model = model_id, "Unit complete");
                self.events
                    .emit(RunEvent::UnitCompleted {
                        run_id: ctx.run_id.clone(),
                        unit_id: target.id().to_string(),
                        stage_id: stage.id.clone(),
                        model_id: model_id.to_string(),
                        duration_ms,
                        cost,
                    })
                    .await;
                Ok(content)
            }
            Err(e) => {
                let message = e.to_string();
                let recorded = message.clone();
                self.update_unit(&ctx.run_id, target, |state| state.fail(Utc::now(), recorded))
                    .await;
                warn!(run_id = %ctx.run_id, unit = target.id(), model = model_id, error = %message, "Unit failed");
                self.events
                    .emit(RunEvent::UnitFailed {
                        run_id: ctx.run_id.clone(),
                        unit_id: target.id().to_string(),
                        stage_id: stage.id.clone(),
                        model_id: model_id.to_string(),
                        error: message.clone(),
                    })
                    .await;
                Err(message)
            }
        }
    }

    async fn update_unit(&self, run_id: &str, target: &UnitTarget, update: impl FnOnce(&mut UnitState)) {
        let found = match target {
            UnitTarget::Stage(id) => {
                self.registry
                    .update_stage(run_id, id, |result| update(&mut result.state))
                    .await
            }
            UnitTarget::Final => {
                self.registry
                    .update_final(run_id, |result| update(&mut result.state))
                    .await
            }
        };
        if !found {
            warn!(run_id, unit = target.id(), "Unit no longer in history, update dropped");
        }
    }
}
