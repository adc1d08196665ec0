use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::*;

use crate::models::OptimizationAction;
use crate::optimize::feedback::{HealthScore, HealthStatus, OptimizationHistory};
use crate::scheduler::{JobSpec, PipelineRun, RunStatus, StepStatus};

#[derive(Parser, Debug)]
#[command(name = "adaptive-optimizer")]
#[command(version)]
#[command(about = "Self-tuning optimization loop: experiments, performance tracking and gated strategy changes")]
pub struct Args {
    /// Settings file (TOML). Defaults apply when omitted.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Override the rollout phase from the settings file
    #[arg(long, global = true, value_parser = clap::value_parser!(u8).range(1..=4))]
    pub phase: Option<u8>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start the scheduler and block until Ctrl-C
    Run {
        /// Run the daily full pipeline once before waiting on triggers
        #[arg(long)]
        initial_run: bool,
    },
    /// Run one job immediately
    RunNow {
        /// Job id, e.g. feedback_loop
        job: String,
    },
    /// Print the system health score
    Health,
    /// Print the learning report
    Report {
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(i64).range(1..=3650))]
        days: i64,
    },
    /// Print applied optimizations
    History {
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(i64).range(1..=3650))]
        days: i64,
    },
    /// List the jobs registered for the current phase
    Jobs,
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn status_label(status: HealthStatus) -> ColoredString {
    let s = status.as_str();
    match status {
        HealthStatus::Excellent => s.bright_green().bold(),
        HealthStatus::Good => s.green(),
        HealthStatus::Fair => s.yellow(),
        HealthStatus::NeedsAttention => s.bright_red().bold(),
        HealthStatus::Unknown => s.dimmed(),
    }
}

pub fn render_health(h: &HealthScore) -> String {
    let mut out = format!(
        "{}: {:.1} ({})\n",
        "Health".bright_cyan().bold(),
        h.health_score,
        status_label(h.status)
    );
    match &h.components {
        Some(c) => {
            for (name, value) in [
                ("content_production", c.content_production),
                ("engagement", c.engagement),
                ("monetization", c.monetization),
                ("conversion", c.conversion),
                ("ai_performance", c.ai_performance),
            ] {
                out.push_str(&format!("  {:<20} {:>5.1}\n", name.bright_yellow(), value));
            }
        }
        None => out.push_str(&format!("  {}\n", "no snapshot in the last 24h".dimmed())),
    }
    out
}

fn render_action(a: &OptimizationAction) -> String {
    format!(
        "  {} {} [{}] conf {:.2}\n      {}\n",
        a.timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed(),
        a.action.bright_white(),
        a.component.bright_magenta(),
        a.confidence,
        a.rationale
    )
}

pub fn render_history(h: &OptimizationHistory) -> String {
    let mut out = format!(
        "{} ({} days): {}\n",
        "Optimizations".bright_cyan().bold(),
        h.period_days,
        h.total_optimizations
    );
    for a in &h.optimizations {
        out.push_str(&render_action(a));
    }
    out
}

pub fn render_jobs<'a>(phase: u8, jobs: impl IntoIterator<Item = &'a JobSpec>) -> String {
    let mut out = format!("{} (phase {phase})\n", "Scheduled jobs".bright_cyan().bold());
    for j in jobs {
        let steps: Vec<_> = j.steps.iter().map(|s| s.as_str()).collect();
        out.push_str(&format!(
            "  {:<22} {:<20} {}\n",
            j.id.as_str().bright_yellow(),
            j.trigger.to_string(),
            steps.join(" > ").dimmed()
        ));
    }
    out
}

pub fn render_run(run: &PipelineRun) -> String {
    let status = match run.status {
        RunStatus::Succeeded => run.status.as_str().bright_green().bold(),
        RunStatus::Failed => run.status.as_str().bright_red().bold(),
    };
    let mut out = format!("{} {} in {}ms\n", run.job.as_str().bright_cyan().bold(), status, run.duration_ms);
    for s in &run.steps {
        let mark = match s.status {
            StepStatus::Succeeded => "ok".green(),
            StepStatus::Skipped => "skipped".dimmed(),
            StepStatus::Failed => "failed".red(),
        };
        out.push_str(&format!("  {:<22} {}", s.step.as_str(), mark));
        if let Some(e) = &s.error {
            out.push_str(&format!(" ({e})"));
        }
        out.push('\n');
    }
    out
}
