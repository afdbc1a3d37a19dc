//! Run orchestration: validation, run construction, sequential stage
//! execution and the run lifecycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::executor::{RunContext, StageExecutor, StageOutcome};
use super::retry::RetryPolicy;
use crate::errors::PipelineError;
use crate::gateway::{AgentResolver, ModelCatalog, StageGateway};
use crate::run::{ModelSelection, PipelineRun, RunRegistry, StageStatus, new_run_id, request_count};
use crate::workflow::{StageConfig, StageKind, execution_stages, terminal_review};

/// Progress events emitted while a run executes.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        stages: usize,
        requests: usize,
    },
    StageStarted {
        run_id: String,
        stage_id: String,
        label: String,
        kind: StageKind,
        units: usize,
    },
    UnitStarted {
        run_id: String,
        unit_id: String,
        stage_id: String,
        model_id: String,
    },
    UnitCompleted {
        run_id: String,
        unit_id: String,
        stage_id: String,
        model_id: String,
        duration_ms: Option<i64>,
        cost: Option<f64>,
    },
    UnitFailed {
        run_id: String,
        unit_id: String,
        stage_id: String,
        model_id: String,
        error: String,
    },
    StageFinished {
        run_id: String,
        stage_id: String,
        status: StageStatus,
    },
    FinalStarted {
        run_id: String,
        stage_id: String,
        model_id: String,
    },
    FinalFinished {
        run_id: String,
        status: StageStatus,
    },
    /// Emitted on every tick of the elapsed counter while the run is live
    Elapsed {
        run_id: String,
        elapsed_ms: u64,
    },
    RunSettled {
        run_id: String,
        success: bool,
        elapsed_ms: u64,
    },
}

/// Optional event channel. Sends are best effort: a dropped receiver never
/// affects the run.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::Sender<RunEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self(Some(tx))
    }

    pub async fn emit(&self, event: RunEvent) {
        if let Some(ref tx) = self.0 {
            tx.send(event).await.ok();
        }
    }

    /// Send without waiting for capacity. The event is dropped when the
    /// channel is full.
    pub fn notify(&self, event: RunEvent) {
        if let Some(ref tx) = self.0 {
            tx.try_send(event).ok();
        }
    }
}

/// Lifecycle of the orchestrator's current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Settled,
}

/// Everything a run starts from. Captured by value so later edits to the
/// live workflow or agent pool cannot reach a run in flight.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub problem: String,
    pub workflow_id: String,
    pub stages: Vec<StageConfig>,
    pub models: ModelSelection,
    pub api_key: String,
    pub base_url: String,
}

impl RunInputs {
    /// Reject inputs that cannot produce a run. Nothing is constructed when
    /// this fails.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.problem.trim().is_empty() {
            return Err(PipelineError::EmptyProblem);
        }
        if !self.stages.iter().any(|s| s.enabled) {
            return Err(PipelineError::NoEnabledStages);
        }
        if self.api_key.trim().is_empty() {
            return Err(PipelineError::MissingApiKey);
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = self.stages.iter().find(|s| !seen.insert(s.id.as_str())) {
            return Err(PipelineError::DuplicateStageId {
                stage: duplicate.id.clone(),
            });
        }
        for stage in execution_stages(&self.stages) {
            match stage.kind {
                StageKind::Agent if self.models.agent_model_ids.is_empty() => {
                    return Err(PipelineError::EmptyAgentPool {
                        stage: stage.id.clone(),
                    });
                }
                StageKind::Synthesis if self.models.synthesis_model_id.trim().is_empty() => {
                    return Err(PipelineError::MissingSynthesisModel {
                        stage: stage.id.clone(),
                    });
                }
                StageKind::Agent | StageKind::Synthesis | StageKind::Review => {}
            }
        }
        if let Some(review) = terminal_review(&self.stages)
            && self.models.review_model_id.trim().is_empty()
        {
            return Err(PipelineError::MissingReviewModel {
                stage: review.id.clone(),
            });
        }
        Ok(())
    }

    /// Provider requests this run would issue without retries.
    pub fn request_count(&self) -> usize {
        request_count(&self.stages, self.models.agent_model_ids.len())
    }
}

/// Drives one run at a time through its stages.
pub struct RunOrchestrator {
    gateway: Arc<dyn StageGateway>,
    resolver: Arc<dyn AgentResolver>,
    registry: RunRegistry,
    retry: RetryPolicy,
    events: EventSink,
    phase: Arc<watch::Sender<RunPhase>>,
    elapsed_ms: Arc<AtomicU64>,
    tick: Duration,
}

/// Settles the live run even if the `start` future is dropped mid-flight:
/// the ticker stops, the counter resets and the phase moves to settled.
struct SettleGuard {
    phase: Arc<watch::Sender<RunPhase>>,
    elapsed_ms: Arc<AtomicU64>,
    ticker: Option<JoinHandle<()>>,
}

impl SettleGuard {
    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.elapsed_ms.store(0, Ordering::Relaxed);
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        self.phase.send_replace(RunPhase::Settled);
        self.stop_ticker();
    }
}

impl RunOrchestrator {
    pub fn new(gateway: Arc<dyn StageGateway>, registry: RunRegistry) -> Self {
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            gateway,
            resolver: Arc::new(ModelCatalog::builtin()),
            registry,
            retry: RetryPolicy::default(),
            events: EventSink::default(),
            phase: Arc::new(phase),
            elapsed_ms: Arc::new(AtomicU64::new(0)),
            tick: Duration::from_secs(1),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AgentResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    /// Interval of the elapsed counter. One second unless overridden.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == RunPhase::Running
    }

    /// Milliseconds since the live run started; zero when no run is live.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms.load(Ordering::Relaxed)
    }

    /// Validate, construct and execute a run, returning its settled state.
    ///
    /// Errors only when the inputs are rejected or another run is live.
    /// Once the run exists every failure is recorded on it instead.
    pub async fn start(&self, inputs: RunInputs) -> Result<PipelineRun, PipelineError> {
        inputs.validate()?;

        let accepted = self.phase.send_if_modified(|phase| {
            if *phase == RunPhase::Running {
                return false;
            }
            *phase = RunPhase::Running;
            true
        });
        if !accepted {
            return Err(PipelineError::AlreadyRunning);
        }
        let mut settle = SettleGuard {
            phase: Arc::clone(&self.phase),
            elapsed_ms: Arc::clone(&self.elapsed_ms),
            ticker: None,
        };

        let run = PipelineRun::plan(
            new_run_id(),
            &inputs.workflow_id,
            &inputs.stages,
            &inputs.models,
            &inputs.problem,
            Utc::now(),
            self.resolver.as_ref(),
        );
        let run_id = run.id.clone();
        let stages = run.stages_config.clone();
        self.registry.insert(run.clone()).await;
        self.registry.select(&run_id).await;

        info!(
            run_id = %run_id,
            workflow_id = %inputs.workflow_id,
            stages = stages.len(),
            requests = inputs.request_count(),
            "Run started"
        );
        self.events
            .emit(RunEvent::RunStarted {
                run_id: run_id.clone(),
                stages: execution_stages(&stages).len()
                    + usize::from(terminal_review(&stages).is_some()),
                requests: inputs.request_count(),
            })
            .await;

        let started = Instant::now();
        self.elapsed_ms.store(0, Ordering::Relaxed);
        settle.ticker = Some(self.spawn_ticker(run_id.clone(), started));

        let ctx = Arc::new(RunContext {
            run_id: run_id.clone(),
            problem: run.problem.clone(),
            api_key: inputs.api_key,
            base_url: inputs.base_url,
            models: run.models.clone(),
        });
        let success = self.execute_stages(&ctx, &stages).await;

        settle.stop_ticker();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(run_id = %run_id, success, elapsed_ms, "Run settled");
        self.events
            .emit(RunEvent::RunSettled {
                run_id: run_id.clone(),
                success,
                elapsed_ms,
            })
            .await;

        match self.registry.view(&run_id).await {
            Some(settled) => Ok(settled),
            None => {
                warn!(run_id = %run_id, "Run evicted before it settled");
                Ok(run)
            }
        }
    }

    /// Execute stages in order, stopping at the first failed stage. The
    /// terminal review runs only when everything before it completed.
    async fn execute_stages(&self, ctx: &Arc<RunContext>, stages: &[StageConfig]) -> bool {
        let executor = StageExecutor::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.resolver),
            self.registry.clone(),
            self.retry,
            self.events.clone(),
        );

        let mut prior: Vec<String> = Vec::new();
        let review = terminal_review(stages);
        for stage in execution_stages(stages).into_iter().chain(review) {
            match executor.execute(ctx, stage, &prior).await {
                StageOutcome::Complete(fragments) => prior.extend(fragments),
                StageOutcome::Failed { failed_units } => {
                    warn!(
                        run_id = %ctx.run_id,
                        stage_id = %stage.id,
                        failed_units,
                        "Stage failed, halting run"
                    );
                    return false;
                }
            }
        }
        true
    }

    fn spawn_ticker(&self, run_id: String, started: Instant) -> JoinHandle<()> {
        let events = self.events.clone();
        let elapsed = Arc::clone(&self.elapsed_ms);
        let phase = self.phase.subscribe();
        let tick = self.tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;
            loop {
                interval.tick().await;
                if *phase.borrow() != RunPhase::Running {
                    break;
                }
                let elapsed_ms = started.elapsed().as_millis() as u64;
                elapsed.store(elapsed_ms, Ordering::Relaxed);
                // Ticks never wait for channel capacity.
                events.notify(RunEvent::Elapsed {
                    run_id: run_id.clone(),
                    elapsed_ms,
                });
            }
        })
    }
}
