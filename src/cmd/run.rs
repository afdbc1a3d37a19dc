//! Pipeline commands: `thinktank preview` and `thinktank plan`.

use anyhow::{Result, bail};
use console::style;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::session::Session;
use thinktank::config::ThinktankConfig;
use thinktank::gateway::{AgentResolver, PreviewGateway};
use thinktank::pipeline::{RunInputs, RunOrchestrator};
use thinktank::run::{RunRegistry, request_count};
use thinktank::storage::{PersistTier, StoredState};
use thinktank::ui::format::format_number;
use thinktank::ui::{RunProgress, render_run};
use thinktank::workflow::{StageKind, terminal_review};

/// Key handed to the preview gateway when none is configured. It never
/// leaves the process.
const PREVIEW_API_KEY: &str = "preview";

pub async fn cmd_preview(
    config: &ThinktankConfig,
    problem: &str,
    workflow_id: Option<&str>,
) -> Result<()> {
    let mut session = Session::open(config)?;
    let workflows = session.state.workflow_state();

    let (workflow_id, stages) = match workflow_id {
        Some(id) => match workflows.workflow(id) {
            Some(workflow) => (workflow.id.clone(), workflow.stages.clone()),
            None => bail!("Unknown workflow '{}'. Run 'thinktank workflows list'.", id),
        },
        None => (
            workflows.selected_workflow_id().to_string(),
            workflows.stages().to_vec(),
        ),
    };

    let registry = RunRegistry::with_runs(
        session.state.runs.clone(),
        session.state.selected_run_id.clone(),
        config.max_runs(),
    );
    let (tx, mut rx) = mpsc::channel(64);
    let orchestrator = RunOrchestrator::new(Arc::new(PreviewGateway), registry.clone())
        .with_resolver(Arc::new(config.catalog()))
        .with_retry(config.retry())
        .with_event_channel(tx);

    let verbose = config.verbose;
    let progress = tokio::spawn(async move {
        let mut ui = RunProgress::new(verbose);
        while let Some(event) = rx.recv().await {
            ui.handle(&event);
        }
    });

    let inputs = RunInputs {
        problem: problem.to_string(),
        workflow_id,
        stages,
        models: config.models(),
        api_key: config
            .api_key()
            .unwrap_or_else(|| PREVIEW_API_KEY.to_string()),
        base_url: config.base_url(),
    };
    let result = orchestrator.start(inputs).await;
    // Closes the event channel so the progress task drains and exits.
    drop(orchestrator);
    progress.await.ok();
    let run = result?;

    println!();
    print!("{}", render_run(&run, config.verbose));

    session.state = StoredState::capture(
        &workflows,
        registry.runs().await,
        registry.selected_run_id().await,
        &config.models(),
        config.retry(),
    );
    match session.save()? {
        PersistTier::Full => {}
        PersistTier::Trimmed => println!(
            "{}",
            style("History trimmed to fit storage capacity").yellow()
        ),
        PersistTier::Stripped => println!(
            "{}",
            style("History trimmed and stripped of outputs to fit storage capacity").yellow()
        ),
    }
    Ok(())
}

pub fn cmd_plan(config: &ThinktankConfig) -> Result<()> {
    let session = Session::open(config)?;
    let workflows = session.state.workflow_state();
    let stages = workflows.stages();
    let models = config.models();
    let catalog = config.catalog();

    let name = workflows
        .selected_workflow()
        .map(|w| w.name.as_str())
        .unwrap_or("(unsaved)");
    println!();
    println!(
        "Workflow: {} {}",
        style(name).bold(),
        style(format!("[{}]", workflows.selected_workflow_id())).dim()
    );
    println!();
    println!("{:<4} {:<24} {:<10} {:<8} Models", "#", "Stage", "Kind", "Enabled");
    println!("{:<4} {:<24} {:<10} {:<8} ------", "--", "-----", "----", "-------");

    let review = terminal_review(stages);
    for (index, stage) in stages.iter().enumerate() {
        let executes = match stage.kind {
            StageKind::Review => review.is_some_and(|r| std::ptr::eq(r, stage)),
            StageKind::Agent | StageKind::Synthesis => stage.enabled,
        };
        let model_note = if !executes {
            style("skipped").dim().to_string()
        } else {
            match stage.kind {
                StageKind::Agent => models
                    .agent_model_ids
                    .iter()
                    .map(|m| catalog.agent_label(m))
                    .collect::<Vec<_>>()
                    .join(", "),
                StageKind::Synthesis => catalog.agent_label(&models.synthesis_model_id),
                StageKind::Review => catalog.agent_label(&models.review_model_id),
            }
        };
        println!(
            "{:<4} {:<24} {:<10} {:<8} {}",
            index + 1,
            stage.label,
            stage.kind.as_str(),
            if stage.enabled { "yes" } else { "no" },
            model_note
        );
    }

    println!();
    match review {
        Some(stage) => println!("Final review: {}", style(&stage.label).bold()),
        None => println!("Final review: {}", style("none").dim()),
    }
    println!(
        "Requests per run: {}",
        style(format_number(Some(
            request_count(stages, models.agent_model_ids.len()) as u64
        )))
        .cyan()
    );
    println!();
    Ok(())
}
