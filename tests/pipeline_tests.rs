//! End-to-end pipeline tests against a scripted in-memory gateway.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thinktank::errors::{GatewayError, PipelineError};
use thinktank::gateway::{StageCall, StageGateway, StageReply};
use thinktank::pipeline::{RetryPolicy, RunEvent, RunInputs, RunOrchestrator, RunPhase};
use thinktank::run::{ModelSelection, RunRegistry, StageResponse, StageStatus};
use thinktank::workflow::state::SyncOutcome;
use thinktank::workflow::{DraftStage, StageConfig, StageKind, WorkflowDraft, WorkflowState};

// =============================================================================
// Scripted gateway
// =============================================================================

/// How one model answers.
#[derive(Clone)]
struct Script {
    content: String,
    /// Leading attempts that fail; `u32::MAX` fails forever
    failures: u32,
    /// Status reported with each failure, if any
    status: Option<u16>,
    delay: Duration,
}

impl Script {
    fn ok(content: &str) -> Self {
        Self {
            content: content.to_string(),
            failures: 0,
            status: None,
            delay: Duration::ZERO,
        }
    }

    fn failing() -> Self {
        Self {
            failures: u32::MAX,
            ..Self::ok("")
        }
    }

    fn rejected(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::failing()
        }
    }

    fn flaky(failures: u32, content: &str) -> Self {
        Self {
            failures,
            ..Self::ok(content)
        }
    }

    fn delayed(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }
}

#[derive(Default)]
struct ScriptedGateway {
    scripts: HashMap<String, Script>,
    attempts: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<StageCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedGateway {
    fn new(scripts: &[(&str, Script)]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .iter()
                .map(|(model, script)| (model.to_string(), script.clone()))
                .collect(),
            ..Default::default()
        })
    }

    fn attempts(&self, model: &str) -> u32 {
        self.attempts.lock().unwrap().get(model).copied().unwrap_or(0)
    }

    fn calls_for_stage(&self, stage_id: &str) -> Vec<StageCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.stage.id == stage_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StageGateway for ScriptedGateway {
    async fn request_stage(&self, call: StageCall) -> Result<StageReply, GatewayError> {
        let script = self
            .scripts
            .get(&call.model_id)
            .cloned()
            .unwrap_or_else(|| Script::ok(&format!("{} says hi", call.model_id)));
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(call.model_id.clone()).or_default();
            *counter += 1;
            *counter
        };
        self.calls.lock().unwrap().push(call.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(script.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if attempt <= script.failures {
            let message = format!("{} attempt {} failed", call.model_id, attempt);
            return Err(match script.status {
                Some(status) => GatewayError::provider(status, message),
                None => GatewayError::request(message),
            });
        }
        Ok(StageReply {
            content: script.content,
            request: call.compose_request(),
            response: StageResponse {
                cost: Some(0.01),
                ..Default::default()
            },
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn agent_then_review() -> Vec<StageConfig> {
    vec![
        StageConfig::new("agents", "Agents", StageKind::Agent, "think"),
        StageConfig::new("review", "Review", StageKind::Review, "judge"),
    ]
}

fn agent_synthesis_review() -> Vec<StageConfig> {
    vec![
        StageConfig::new("agents", "Agents", StageKind::Agent, "think"),
        StageConfig::new("synthesis", "Synthesis", StageKind::Synthesis, "combine"),
        StageConfig::new("review", "Review", StageKind::Review, "judge"),
    ]
}

fn inputs(stages: Vec<StageConfig>, agents: &[&str]) -> RunInputs {
    RunInputs {
        problem: "x".into(),
        workflow_id: "custom".into(),
        stages,
        models: ModelSelection {
            agent_model_ids: agents.iter().map(|a| a.to_string()).collect(),
            synthesis_model_id: "s".into(),
            review_model_id: "r".into(),
        },
        api_key: "key".into(),
        base_url: "http://localhost".into(),
    }
}

fn orchestrator(gateway: Arc<ScriptedGateway>) -> RunOrchestrator {
    RunOrchestrator::new(gateway, RunRegistry::default())
}

// =============================================================================
// Fan-out
// =============================================================================

mod fan_out {
    use super::*;

    #[tokio::test]
    async fn test_one_unit_per_model_with_unique_ids() {
        let gateway = ScriptedGateway::new(&[]);
        let run = orchestrator(gateway)
            .start(inputs(agent_then_review(), &["m1", "m2", "m3"]))
            .await
            .unwrap();

        let units = run.results_for_stage("agents");
        assert_eq!(units.len(), 3);
        let ids: HashSet<_> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(units.iter().all(|u| u.status() == StageStatus::Complete));
    }

    #[tokio::test]
    async fn test_fragments_follow_pool_order_not_completion_order() {
        let gateway = ScriptedGateway::new(&[
            ("m1", Script::ok("first").delayed(40)),
            ("m2", Script::ok("second")),
            ("m3", Script::ok("third").delayed(15)),
        ]);
        let run = orchestrator(Arc::clone(&gateway))
            .start(inputs(agent_then_review(), &["m1", "m2", "m3"]))
            .await
            .unwrap();

        let models: Vec<_> = run.stages.iter().map(|u| u.model_id.as_str()).collect();
        assert_eq!(models, vec!["m1", "m2", "m3"]);

        let review_calls = gateway.calls_for_stage("review");
        assert_eq!(review_calls.len(), 1);
        assert_eq!(
            review_calls[0].prior_outputs,
            vec![
                "### Agents (m1)\nfirst".to_string(),
                "### Agents (m2)\nsecond".to_string(),
                "### Agents (m3)\nthird".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_units_run_concurrently() {
        let gateway = ScriptedGateway::new(&[
            ("m1", Script::ok("a").delayed(30)),
            ("m2", Script::ok("b").delayed(30)),
            ("m3", Script::ok("c").delayed(30)),
        ]);
        orchestrator(Arc::clone(&gateway))
            .start(inputs(agent_then_review(), &["m1", "m2", "m3"]))
            .await
            .unwrap();
        assert_eq!(gateway.max_in_flight.load(Ordering::SeqCst), 3);
    }
}

// =============================================================================
// Scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_both_agents_succeed_and_review_sees_both() {
        let gateway = ScriptedGateway::new(&[
            ("m1", Script::ok("A")),
            ("m2", Script::ok("B")),
            ("r", Script::ok("verdict")),
        ]);
        let run = orchestrator(Arc::clone(&gateway))
            .start(inputs(agent_then_review(), &["m1", "m2"]))
            .await
            .unwrap();

        let review = &gateway.calls_for_stage("review")[0];
        let context = review.compose_request();
        let user = context.user_content();
        let a = user.find("(m1)\nA").unwrap();
        let b = user.find("(m2)\nB").unwrap();
        assert!(a < b);
        assert!(user.starts_with("x"));

        assert!(
            run.stages
                .iter()
                .all(|u| u.status() == StageStatus::Complete)
        );
        let final_result = run.final_result.as_ref().unwrap();
        assert_eq!(final_result.status(), StageStatus::Complete);
        assert_eq!(final_result.state.output.as_deref(), Some("verdict"));
        assert!(run.is_settled());
    }

    #[tokio::test]
    async fn test_failed_agent_leaves_final_pending() {
        let gateway = ScriptedGateway::new(&[("m1", Script::ok("A")), ("m2", Script::failing())]);
        let run = orchestrator(Arc::clone(&gateway))
            .start(inputs(agent_then_review(), &["m1", "m2"]))
            .await
            .unwrap();

        assert_eq!(run.stages[0].status(), StageStatus::Complete);
        assert_eq!(run.stages[1].status(), StageStatus::Error);
        assert_eq!(
            run.stages[1].state.error.as_deref(),
            Some("m2 attempt 3 failed")
        );
        assert_eq!(
            run.final_result.as_ref().unwrap().status(),
            StageStatus::Pending
        );
        assert!(gateway.calls_for_stage("review").is_empty());
    }

    #[tokio::test]
    async fn test_failure_halts_later_stages_but_siblings_settle() {
        let gateway = ScriptedGateway::new(&[
            ("m1", Script::ok("A").delayed(30)),
            ("m2", Script::failing()),
        ]);
        let run = orchestrator(Arc::clone(&gateway))
            .start(inputs(agent_synthesis_review(), &["m1", "m2"]))
            .await
            .unwrap();

        assert!(
            run.stages
                .iter()
                .all(|u| u.status() != StageStatus::Running)
        );
        assert_eq!(run.stages[0].status(), StageStatus::Complete);
        assert!(run.stages[0].state.duration_ms.is_some());
        assert_eq!(run.stage_status("synthesis"), Some(StageStatus::Pending));
        assert!(gateway.calls_for_stage("synthesis").is_empty());
        assert_eq!(gateway.attempts("s"), 0);
    }

    #[tokio::test]
    async fn test_synthesis_receives_agent_fragments_and_feeds_review() {
        let gateway = ScriptedGateway::new(&[
            ("m1", Script::ok("A")),
            ("s", Script::ok("merged")),
        ]);
        let run = orchestrator(Arc::clone(&gateway))
            .start(inputs(agent_synthesis_review(), &["m1"]))
            .await
            .unwrap();

        let synthesis = &gateway.calls_for_stage("synthesis")[0];
        assert_eq!(synthesis.prior_outputs, vec!["### Agents (m1)\nA".to_string()]);
        let review = &gateway.calls_for_stage("review")[0];
        assert_eq!(
            review.prior_outputs,
            vec![
                "### Agents (m1)\nA".to_string(),
                "### Synthesis\nmerged".to_string()
            ]
        );
        assert_eq!(
            run.final_result.as_ref().unwrap().status(),
            StageStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_only_last_enabled_review_executes() {
        let stages = vec![
            StageConfig::new("early", "Early review", StageKind::Review, "early prompt"),
            StageConfig::new("agents", "Agents", StageKind::Agent, "think"),
            StageConfig::new("late", "Late review", StageKind::Review, "late prompt"),
        ];
        let gateway = ScriptedGateway::new(&[]);
        let run = orchestrator(Arc::clone(&gateway))
            .start(inputs(stages, &["m1"]))
            .await
            .unwrap();

        assert!(gateway.calls_for_stage("early").is_empty());
        let late = gateway.calls_for_stage("late");
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].stage.system_prompt, "late prompt");
        assert_eq!(
            run.final_result.as_ref().unwrap().system_prompt,
            "late prompt"
        );
    }

    #[tokio::test]
    async fn test_run_without_review_has_no_final_result() {
        let stages = vec![StageConfig::new("agents", "Agents", StageKind::Agent, "think")];
        let run = orchestrator(ScriptedGateway::new(&[]))
            .start(inputs(stages, &["m1", "m2"]))
            .await
            .unwrap();
        assert!(run.final_result.is_none());
        assert!(run.is_settled());
    }

    #[tokio::test]
    async fn test_loaded_run_edits_do_not_touch_workflow_until_saved() {
        let mut workflows = WorkflowState::default();
        let mut draft = WorkflowDraft::new();
        draft.name = "Panel".into();
        draft.stages = vec![
            DraftStage {
                name: "Agents".into(),
                prompt: "think".into(),
                ..DraftStage::empty(StageKind::Agent)
            },
            DraftStage {
                name: "Review".into(),
                prompt: "judge".into(),
                ..DraftStage::empty(StageKind::Review)
            },
        ];
        let workflow = workflows.save_draft(&draft).unwrap();

        let mut run_inputs = inputs(workflows.stages().to_vec(), &["m1"]);
        run_inputs.workflow_id = workflow.id.clone();
        let run = orchestrator(ScriptedGateway::new(&[]))
            .start(run_inputs)
            .await
            .unwrap();

        workflows.apply_workflow_from_run(Some(&run.workflow_id), &run.stages_config);
        assert_eq!(workflows.toggle_stage("review"), Some(false));
        assert_eq!(workflows.sync_stages_to_workflow(), SyncOutcome::Suppressed);
        assert_eq!(workflows.workflow(&workflow.id).unwrap().stages, workflow.stages);

        assert_eq!(workflows.sync_stages_to_workflow(), SyncOutcome::Synced);
        assert!(!workflows.workflow(&workflow.id).unwrap().stages[1].enabled);
    }
}

// =============================================================================
// Retry
// =============================================================================

mod retry {
    use super::*;

    #[tokio::test]
    async fn test_disabled_makes_one_attempt_per_unit() {
        let gateway = ScriptedGateway::new(&[("m1", Script::failing()), ("m2", Script::ok("B"))]);
        let run = orchestrator(Arc::clone(&gateway))
            .with_retry(RetryPolicy::disabled())
            .start(inputs(agent_then_review(), &["m1", "m2"]))
            .await
            .unwrap();
        assert_eq!(gateway.attempts("m1"), 1);
        assert_eq!(gateway.attempts("m2"), 1);
        assert_eq!(run.stages[0].state.error.as_deref(), Some("m1 attempt 1 failed"));
    }

    #[tokio::test]
    async fn test_threshold_bounds_attempts_and_last_error_wins() {
        let gateway = ScriptedGateway::new(&[("m1", Script::failing())]);
        let run = orchestrator(Arc::clone(&gateway))
            .with_retry(RetryPolicy {
                enabled: true,
                threshold: 5,
            })
            .start(inputs(agent_then_review(), &["m1"]))
            .await
            .unwrap();
        assert_eq!(gateway.attempts("m1"), 5);
        assert_eq!(run.stages[0].state.error.as_deref(), Some("m1 attempt 5 failed"));
    }

    #[tokio::test]
    async fn test_flaky_unit_recovers_within_threshold() {
        let gateway = ScriptedGateway::new(&[("m1", Script::flaky(2, "late bloomer"))]);
        let run = orchestrator(Arc::clone(&gateway))
            .start(inputs(agent_then_review(), &["m1"]))
            .await
            .unwrap();
        assert_eq!(gateway.attempts("m1"), 3);
        assert_eq!(run.stages[0].status(), StageStatus::Complete);
        assert!(run.stages[0].state.error.is_none());
        assert_eq!(
            run.final_result.as_ref().unwrap().status(),
            StageStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_provider_status_is_recorded_on_unit() {
        let gateway = ScriptedGateway::new(&[("m1", Script::rejected(429))]);
        let run = orchestrator(Arc::clone(&gateway))
            .with_retry(RetryPolicy::disabled())
            .start(inputs(agent_then_review(), &["m1"]))
            .await
            .unwrap();
        assert_eq!(
            run.stages[0].state.error.as_deref(),
            Some("Provider returned 429: m1 attempt 1 failed")
        );
        assert_eq!(gateway.attempts("m1"), 1);
    }

    #[tokio::test]
    async fn test_zero_threshold_still_attempts_once() {
        let gateway = ScriptedGateway::new(&[("m1", Script::failing())]);
        orchestrator(Arc::clone(&gateway))
            .with_retry(RetryPolicy {
                enabled: true,
                threshold: 0,
            })
            .start(inputs(agent_then_review(), &["m1"]))
            .await
            .unwrap();
        assert_eq!(gateway.attempts("m1"), 1);
    }
}

// =============================================================================
// Registry and lifecycle
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_registry_keeps_most_recent_runs() {
        let registry = RunRegistry::new(2);
        let orchestrator = RunOrchestrator::new(ScriptedGateway::new(&[]), registry.clone());
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                orchestrator
                    .start(inputs(agent_then_review(), &["m1"]))
                    .await
                    .unwrap()
                    .id,
            );
        }
        let kept: Vec<_> = registry.runs().await.into_iter().map(|r| r.id).collect();
        assert_eq!(kept, vec![ids[2].clone(), ids[1].clone()]);
        assert_eq!(registry.selected_run_id().await, Some(ids[2].clone()));
    }

    #[tokio::test]
    async fn test_rejected_inputs_construct_nothing() {
        let gateway = ScriptedGateway::new(&[]);
        let orchestrator = orchestrator(Arc::clone(&gateway));
        let mut bad = inputs(agent_then_review(), &["m1"]);
        bad.problem = "   ".into();
        assert_eq!(
            orchestrator.start(bad).await.unwrap_err(),
            PipelineError::EmptyProblem
        );
        assert!(orchestrator.registry().is_empty().await);
        assert_eq!(orchestrator.phase(), RunPhase::Idle);
        assert!(gateway.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_while_running_is_rejected() {
        let gateway = ScriptedGateway::new(&[("m1", Script::ok("A").delayed(50))]);
        let orchestrator = Arc::new(orchestrator(gateway));
        let mut phase = orchestrator.subscribe_phase();

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .start(inputs(agent_then_review(), &["m1"]))
                    .await
            })
        };
        phase
            .wait_for(|p| *p == RunPhase::Running)
            .await
            .unwrap();
        assert!(orchestrator.is_running());

        let second = orchestrator
            .start(inputs(agent_then_review(), &["m1"]))
            .await;
        assert_eq!(second.unwrap_err(), PipelineError::AlreadyRunning);

        let run = first.await.unwrap().unwrap();
        assert!(run.is_settled());
        assert_eq!(orchestrator.phase(), RunPhase::Settled);
        assert_eq!(orchestrator.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_events_and_elapsed_counter() {
        let gateway = ScriptedGateway::new(&[
            ("m1", Script::ok("A").delayed(40)),
            ("m2", Script::failing()),
        ]);
        let (tx, mut rx) = tokio::sync::mpsc::channel(512);
        let orchestrator = orchestrator(gateway)
            .with_retry(RetryPolicy::disabled())
            .with_event_channel(tx)
            .with_tick(Duration::from_millis(10));

        let run = orchestrator
            .start(inputs(agent_synthesis_review(), &["m1", "m2"]))
            .await
            .unwrap();
        assert_eq!(orchestrator.elapsed_ms(), 0);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert_eq!(
            events.first(),
            Some(&RunEvent::RunStarted {
                run_id: run.id.clone(),
                stages: 3,
                requests: 4,
            })
        );
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunSettled { success: false, .. })
        ));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, RunEvent::Elapsed { elapsed_ms, .. } if *elapsed_ms > 0))
        );
        let completed = events
            .iter()
            .filter(|e| matches!(e, RunEvent::UnitCompleted { .. }))
            .count();
        let failed = events
            .iter()
            .filter(|e| matches!(e, RunEvent::UnitFailed { .. }))
            .count();
        assert_eq!((completed, failed), (1, 1));
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::StageFinished { stage_id, status: StageStatus::Error, .. } if stage_id == "agents"
        )));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, RunEvent::FinalStarted { .. }))
        );
    }

    #[tokio::test]
    async fn test_duplicate_stage_ids_are_rejected() {
        let gateway = ScriptedGateway::new(&[]);
        let orchestrator = orchestrator(Arc::clone(&gateway));
        let stages = vec![
            StageConfig::new("dup", "First", StageKind::Agent, "think"),
            StageConfig::new("dup", "Second", StageKind::Agent, "again"),
        ];
        assert_eq!(
            orchestrator.start(inputs(stages, &["m1"])).await.unwrap_err(),
            PipelineError::DuplicateStageId {
                stage: "dup".into()
            }
        );
        assert!(orchestrator.registry().is_empty().await);
        assert!(gateway.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_elapsed_counter() {
        let gateway = ScriptedGateway::new(&[("m1", Script::ok("A").delayed(500))]);
        let (tx, mut rx) = tokio::sync::mpsc::channel(512);
        let orchestrator = orchestrator(gateway)
            .with_event_channel(tx)
            .with_tick(Duration::from_millis(10));

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            orchestrator.start(inputs(agent_then_review(), &["m1"])),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(orchestrator.phase(), RunPhase::Settled);
        assert_eq!(orchestrator.elapsed_ms(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut late = Vec::new();
        while let Ok(event) = rx.try_recv() {
            late.push(event);
        }
        assert!(
            !late.iter().any(|e| matches!(e, RunEvent::Elapsed { .. })),
            "ticks after cancel: {:?}",
            late
        );
        assert_eq!(orchestrator.elapsed_ms(), 0);
    }

    #[tokio::test]
    async fn test_run_totals_sum_stage_and_final_costs() {
        let run = orchestrator(ScriptedGateway::new(&[]))
            .start(inputs(agent_then_review(), &["m1", "m2"]))
            .await
            .unwrap();
        let total = run.total_cost().unwrap();
        assert!((total - 0.03).abs() < 1e-9, "total = {}", total);
    }
}
