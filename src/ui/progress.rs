use crate::pipeline::RunEvent;
use crate::run::{PipelineRun, StageStatus};
use crate::ui::format::{format_cost, format_duration, format_elapsed, format_number};
use crate::ui::icons::{AGENT, CHECK, CLOCK, CROSS, PENDING, REVIEW, RUNNING, SPARKLE, SYNTHESIS};
use crate::workflow::StageKind;
use console::{Emoji, style};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Terminal rendering of a live run.
///
/// A single spinner carries the elapsed counter and the current stage;
/// unit and stage outcomes are printed above it as they arrive.
pub struct RunProgress {
    spinner: ProgressBar,
    stage: String,
    verbose: bool,
}

impl RunProgress {
    pub fn new(verbose: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        let spinner_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(spinner_style);
        spinner.set_prefix("Run");
        Self {
            spinner,
            stage: String::new(),
            verbose,
        }
    }

    /// Print a line above the spinner, or straight to stderr when the
    /// spinner is hidden (no terminal).
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.spinner.is_hidden() {
            eprintln!("{}", msg.as_ref());
        } else {
            self.spinner.println(msg.as_ref());
        }
    }

    pub fn handle(&mut self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                stages, requests, ..
            } => {
                self.print_line(format!(
                    "{}Running {} stages ({} requests)",
                    RUNNING,
                    style(stages).cyan(),
                    style(requests).cyan()
                ));
                self.spinner.enable_steady_tick(Duration::from_millis(100));
                self.spinner.set_message("starting...");
            }
            RunEvent::StageStarted {
                label, kind, units, ..
            } => {
                let icon = match kind {
                    StageKind::Agent => &AGENT,
                    StageKind::Synthesis => &SYNTHESIS,
                    StageKind::Review => &REVIEW,
                };
                self.stage = label.clone();
                self.print_line(format!(
                    "{}{} {}",
                    icon,
                    style(label).bold(),
                    style(format!("({} units)", units)).dim()
                ));
                self.spinner.set_message(label.clone());
            }
            RunEvent::UnitStarted { model_id, .. } => {
                if self.verbose {
                    self.print_line(format!("    {} {}", style("→").dim(), style(model_id).dim()));
                }
            }
            RunEvent::UnitCompleted {
                model_id,
                duration_ms,
                cost,
                ..
            } => {
                self.print_line(format!(
                    "    {}{} {} {}",
                    CHECK,
                    model_id,
                    style(format_duration(*duration_ms)).dim(),
                    style(format_cost(*cost)).dim()
                ));
            }
            RunEvent::UnitFailed {
                model_id, error, ..
            } => {
                self.print_line(format!("    {}{} {}", CROSS, model_id, style(error).red()));
            }
            RunEvent::StageFinished { status, .. } => {
                if *status == StageStatus::Error {
                    self.print_line(format!(
                        "  {}",
                        style(format!("{} failed, halting run", self.stage)).red().bold()
                    ));
                }
            }
            RunEvent::FinalStarted { model_id, .. } => {
                self.stage = "Final review".to_string();
                self.print_line(format!("{}{} {}", REVIEW, style("Final review").bold(), style(model_id).dim()));
                self.spinner.set_message("Final review");
            }
            RunEvent::FinalFinished { .. } => {}
            RunEvent::Elapsed { elapsed_ms, .. } => {
                self.spinner.set_message(format!(
                    "{} {}",
                    self.stage,
                    style(format!("({})", format_elapsed(*elapsed_ms))).dim()
                ));
            }
            RunEvent::RunSettled {
                success,
                elapsed_ms,
                ..
            } => {
                self.spinner.finish_and_clear();
                let outcome = if *success {
                    style("Run complete").green().bold()
                } else {
                    style("Run halted").red().bold()
                };
                self.print_line(format!("{}{} in {}", CLOCK, outcome, format_elapsed(*elapsed_ms)));
            }
        }
    }
}

fn status_icon(status: StageStatus) -> &'static Emoji<'static, 'static> {
    match status {
        StageStatus::Complete => &CHECK,
        StageStatus::Error => &CROSS,
        StageStatus::Running => &RUNNING,
        StageStatus::Pending => &PENDING,
    }
}

/// Render a stored run: per-stage status, per-unit details, final output.
pub fn render_run(run: &PipelineRun, show_outputs: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} {}\n",
        style("Run").bold(),
        style(&run.id).cyan()
    ));
    out.push_str(&format!(
        "  {} {}\n  {} {}\n  {} {}\n",
        style("Workflow:").dim(),
        run.workflow_id,
        style("Created:").dim(),
        run.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        style("Problem:").dim(),
        run.problem.lines().next().unwrap_or_default()
    ));
    out.push_str(&format!(
        "  {} {}  {} {}\n\n",
        style("Cost:").dim(),
        format_cost(run.total_cost()),
        style("Tokens:").dim(),
        format_number(run.total_tokens())
    ));

    for stage in run.stages_config.iter().filter(|s| s.enabled) {
        let results = run.results_for_stage(&stage.id);
        let Some(status) = crate::run::aggregate_status(results.iter().copied()) else {
            continue;
        };
        out.push_str(&format!(
            "{}{} {}\n",
            status_icon(status),
            style(&stage.label).bold(),
            style(status).dim()
        ));
        for result in results {
            out.push_str(&format!(
                "    {}{} {}\n",
                status_icon(result.status()),
                result.agent_label,
                style(format_duration(result.state.duration_ms)).dim()
            ));
            if let Some(error) = &result.state.error {
                out.push_str(&format!("      {}\n", style(error).red()));
            }
            if show_outputs && let Some(output) = &result.state.output {
                for line in output.lines() {
                    out.push_str(&format!("      {}\n", line));
                }
            }
        }
    }

    if let Some(final_result) = &run.final_result {
        out.push_str(&format!(
            "{}{} {} {}\n",
            status_icon(final_result.status()),
            style(&final_result.label).bold(),
            style(&final_result.agent_label).dim(),
            style(final_result.status()).dim()
        ));
        if let Some(error) = &final_result.state.error {
            out.push_str(&format!("    {}\n", style(error).red()));
        }
        if let Some(output) = &final_result.state.output {
            out.push_str(&format!("\n{}Final answer\n{}\n", SPARKLE, output));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ModelCatalog;
    use crate::run::{ModelSelection, StageRequest, StageResponse};
    use crate::workflow::default_stages;
    use chrono::Utc;

    fn run() -> PipelineRun {
        let mut run = PipelineRun::plan(
            "run-1".into(),
            "default",
            &default_stages(),
            &ModelSelection {
                agent_model_ids: vec!["m1".into(), "m2".into()],
                synthesis_model_id: "s".into(),
                review_model_id: "r".into(),
            },
            "Why is the sky blue?\nDetails",
            Utc::now(),
            &ModelCatalog::empty(),
        );
        let now = Utc::now();
        run.stages[0].state.start(now);
        run.stages[0].state.complete(
            now,
            "Rayleigh scattering".into(),
            StageRequest {
                model: "m1".into(),
                temperature: 0.4,
                messages: vec![],
            },
            StageResponse {
                cost: Some(0.5),
                ..Default::default()
            },
        );
        run.stages[1].state.start(now);
        run.stages[1].state.fail(now, "rate limited".into());
        run
    }

    #[test]
    fn test_render_run_shows_units_and_errors() {
        let text = console::strip_ansi_codes(&render_run(&run(), false)).to_string();
        assert!(text.contains("run-1"));
        assert!(text.contains("Why is the sky blue?"));
        assert!(!text.contains("Details"));
        assert!(text.contains("$0.5000"));
        assert!(text.contains("Independent analysis"));
        assert!(text.contains("rate limited"));
        assert!(!text.contains("Rayleigh scattering"));
        assert!(text.contains("Final review"));
    }

    #[test]
    fn test_render_run_with_outputs() {
        let text = console::strip_ansi_codes(&render_run(&run(), true)).to_string();
        assert!(text.contains("Rayleigh scattering"));
    }

    #[test]
    fn test_render_run_lists_pending_stages() {
        let text = console::strip_ansi_codes(&render_run(&run(), false)).to_string();
        assert!(text.contains("Synthesis"));
        assert!(text.contains("pending"));
    }
}
