//! Run history commands: `thinktank history`.

use anyhow::{Result, bail};
use console::style;

use super::super::HistoryCommands;
use super::session::Session;
use thinktank::config::ThinktankConfig;
use thinktank::run::RunRegistry;
use thinktank::ui::format::format_cost;
use thinktank::ui::render_run;

pub async fn cmd_history(config: &ThinktankConfig, command: Option<HistoryCommands>) -> Result<()> {
    let mut session = Session::open(config)?;
    let registry = RunRegistry::with_runs(
        std::mem::take(&mut session.state.runs),
        session.state.selected_run_id.take(),
        config.max_runs(),
    );

    match command {
        None | Some(HistoryCommands::List) => {
            let runs = registry.runs().await;
            if runs.is_empty() {
                println!();
                println!("No runs yet. Run 'thinktank preview --problem \"...\"' to start one.");
                println!();
                return Ok(());
            }
            let selected = registry.selected_run_id().await;
            println!();
            println!(
                "  {:<38} {:<20} {:<12} {:<9} {:<10} Problem",
                "Run", "Created", "Workflow", "Status", "Cost"
            );
            for run in &runs {
                let marker = if selected.as_deref() == Some(run.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {:<38} {:<20} {:<12} {:<9} {:<10} {}",
                    marker,
                    run.id,
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    run.workflow_id,
                    run.status().as_str(),
                    format_cost(run.total_cost()),
                    run.problem.lines().next().unwrap_or_default()
                );
            }
            println!();
            println!("{} of {} runs kept", runs.len(), registry.max_runs().await);
            println!();
            return Ok(());
        }
        Some(HistoryCommands::Show { run_id, outputs }) => {
            let Some(run) = registry.view(&run_id).await else {
                bail!("Run '{}' not found. Run 'thinktank history list'.", run_id);
            };
            println!();
            print!("{}", render_run(&run, outputs));
            println!();
            return Ok(());
        }
        Some(HistoryCommands::Load { run_id }) => {
            let Some(run) = registry.select(&run_id).await else {
                bail!("Run '{}' not found. Run 'thinktank history list'.", run_id);
            };
            let mut workflows = session.state.workflow_state();
            workflows.apply_workflow_from_run(Some(&run.workflow_id), &run.stages_config);
            session.state.selected_workflow_id = Some(workflows.selected_workflow_id().to_string());
            session.state.stages = workflows.stages().to_vec();
            session.state.skip_next_sync = workflows.sync_suppressed();
            println!(
                "Loaded run {} ({} stages from workflow '{}')",
                style(&run.id).cyan(),
                run.stages_config.len(),
                run.workflow_id
            );
        }
        Some(HistoryCommands::Clear) => {
            let count = registry.len().await;
            registry.clear().await;
            println!("Cleared {} runs", count);
        }
    }

    session.state.runs = registry.runs().await;
    session.state.selected_run_id = registry.selected_run_id().await;
    session.save()?;
    Ok(())
}
