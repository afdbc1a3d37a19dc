//! Workflow and stage editing: `thinktank workflows`, `thinktank stages`.

use anyhow::{Context, Result, bail};
use console::style;

use super::super::{StageCommands, WorkflowCommands};
use super::session::Session;
use thinktank::config::ThinktankConfig;
use thinktank::workflow::state::SyncOutcome;
use thinktank::workflow::templates::is_template;
use thinktank::workflow::{StageKind, WorkflowDraft, WorkflowState};

/// Parse a `KIND:NAME:PROMPT` stage argument. The prompt may contain colons.
fn parse_stage_arg(value: &str) -> Result<(StageKind, String, String)> {
    let mut parts = value.splitn(3, ':');
    let (Some(kind), Some(name), Some(prompt)) = (parts.next(), parts.next(), parts.next()) else {
        bail!("Invalid stage '{}'. Expected KIND:NAME:PROMPT", value);
    };
    let kind: StageKind = kind.trim().parse()?;
    Ok((kind, name.to_string(), prompt.to_string()))
}

fn build_draft(name: &str, description: Option<&str>, stages: &[String]) -> Result<WorkflowDraft> {
    let mut draft = WorkflowDraft::new();
    draft.name = name.to_string();
    draft.description = description.unwrap_or_default().to_string();
    for (index, arg) in stages.iter().enumerate() {
        let (kind, stage_name, prompt) = parse_stage_arg(arg)?;
        let stage_id = match draft.stages.get(index) {
            Some(stage) => stage.id.clone(),
            None => draft.add_stage(),
        };
        draft.update_stage(&stage_id, |stage| {
            stage.kind = kind;
            stage.name = stage_name;
            stage.prompt = prompt;
        });
    }
    Ok(draft)
}

fn store_workflows(session: &mut Session, workflows: &WorkflowState) {
    session.state.workflows = workflows.workflows().to_vec();
    session.state.selected_workflow_id = Some(workflows.selected_workflow_id().to_string());
    session.state.stages = workflows.stages().to_vec();
    session.state.skip_next_sync = workflows.sync_suppressed();
}

pub fn cmd_workflows(config: &ThinktankConfig, command: Option<WorkflowCommands>) -> Result<()> {
    let mut session = Session::open(config)?;
    let mut workflows = session.state.workflow_state();

    match command {
        None | Some(WorkflowCommands::List) => {
            println!();
            println!("  {:<24} {:<28} {:<8} Kind", "Id", "Name", "Stages");
            for workflow in workflows.workflows() {
                let marker = if workflow.id == workflows.selected_workflow_id() {
                    "*"
                } else {
                    " "
                };
                let kind = if is_template(&workflow.id) {
                    "template"
                } else {
                    "custom"
                };
                println!(
                    "{} {:<24} {:<28} {:<8} {}",
                    marker,
                    workflow.id,
                    workflow.name,
                    workflow.enabled_stages().len(),
                    kind
                );
                if config.verbose
                    && let Some(description) = &workflow.description
                {
                    println!("    {}", style(description).dim());
                }
            }
            println!();
            return Ok(());
        }
        Some(WorkflowCommands::Select { workflow_id }) => {
            if !workflows.select_workflow(&workflow_id) {
                bail!(
                    "Unknown workflow '{}'. Run 'thinktank workflows list'.",
                    workflow_id
                );
            }
            println!("Active workflow: {}", style(&workflow_id).cyan());
        }
        Some(WorkflowCommands::Create {
            name,
            description,
            stages,
        }) => {
            let draft = build_draft(&name, description.as_deref(), &stages)?;
            let workflow = workflows
                .save_draft(&draft)
                .context("Workflow not saved")?;
            println!(
                "Created workflow {} with {} stages",
                style(&workflow.id).cyan(),
                workflow.stages.len()
            );
            for stage in &workflow.stages {
                println!("  {:<24} {}", stage.id, stage.kind.as_str());
            }
        }
    }

    store_workflows(&mut session, &workflows);
    session.save()?;
    Ok(())
}

pub fn cmd_stages(config: &ThinktankConfig, command: StageCommands) -> Result<()> {
    let mut session = Session::open(config)?;
    let mut workflows = session.state.workflow_state();

    match command {
        StageCommands::Toggle { stage_id } => {
            let Some(enabled) = workflows.toggle_stage(&stage_id) else {
                bail!("Unknown stage '{}'. Run 'thinktank plan'.", stage_id);
            };
            println!(
                "Stage {} {}",
                style(&stage_id).cyan(),
                if enabled { "enabled" } else { "disabled" }
            );
        }
        StageCommands::Prompt { stage_id, prompt } => {
            if !workflows.set_stage_prompt(&stage_id, &prompt) {
                bail!("Unknown stage '{}'. Run 'thinktank plan'.", stage_id);
            }
            println!("Updated prompt for stage {}", style(&stage_id).cyan());
        }
    }

    match workflows.sync_stages_to_workflow() {
        SyncOutcome::Synced => println!(
            "Saved to workflow '{}'",
            workflows.selected_workflow_id()
        ),
        SyncOutcome::Suppressed => println!(
            "{}",
            style("Stages loaded from a run: workflow left unchanged").dim()
        ),
        SyncOutcome::Template => println!(
            "{}",
            style("Built-in template: edits apply to the active stages only").dim()
        ),
        SyncOutcome::NoWorkflow => {}
    }

    store_workflows(&mut session, &workflows);
    session.save()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stage_arg_keeps_colons_in_prompt() {
        let (kind, name, prompt) = parse_stage_arg("synthesis:Merge:Combine: carefully").unwrap();
        assert_eq!(kind, StageKind::Synthesis);
        assert_eq!(name, "Merge");
        assert_eq!(prompt, "Combine: carefully");
    }

    #[test]
    fn test_parse_stage_arg_rejects_bad_input() {
        assert!(parse_stage_arg("agent:only-name").is_err());
        assert!(parse_stage_arg("oracle:Name:Prompt").is_err());
    }

    #[test]
    fn test_build_draft_fills_stages_in_order() {
        let draft = build_draft(
            "Panel",
            None,
            &["agent:Scout:look".to_string(), "review:Judge:decide".to_string()],
        )
        .unwrap();
        assert_eq!(draft.stages.len(), 2);
        assert_eq!(draft.stages[0].name, "Scout");
        assert_eq!(draft.stages[1].kind, StageKind::Review);
        let workflow = draft.to_workflow().unwrap();
        assert_eq!(workflow.stages[0].id, "scout");
        assert_eq!(workflow.stages[1].id, "judge");
    }
}
