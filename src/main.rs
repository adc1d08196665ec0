use std::io;

use clap::{CommandFactory, Parser};
use colored::*;
use tracing_subscriber::EnvFilter;

use adaptive_optimizer::advisory;
use adaptive_optimizer::cli::{self, Args, Command};
use adaptive_optimizer::config::Settings;
use adaptive_optimizer::optimize::Services;
use adaptive_optimizer::scheduler::{Collaborators, JobId, PipelineScheduler, RunOutcome};
use adaptive_optimizer::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Command::Completions { shell } = args.command {
        clap_complete::generate(shell, &mut Args::command(), "adaptive-optimizer", &mut io::stdout());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(phase) = args.phase {
        settings.scheduler.phase = phase;
    }
    settings.validate()?;

    let store = Store::open(&settings.database.path)?;
    let advisor = advisory::from_settings(&settings.advisory);
    let services = Services::build(store, advisor, &settings);
    let phase = settings.scheduler.phase;

    match args.command {
        Command::Run { initial_run } => {
            let scheduler = PipelineScheduler::new(services, phase, Collaborators::new());
            scheduler.start();
            if initial_run {
                print_outcome(scheduler.run_now(JobId::DailyFullPipeline.as_str()).await?);
            }
            println!("{}", "Scheduler running. Press Ctrl-C to exit.".bright_cyan());
            tokio::signal::ctrl_c().await?;
            scheduler.stop();
        }
        Command::RunNow { job } => {
            let scheduler = PipelineScheduler::new(services, phase, Collaborators::new());
            print_outcome(scheduler.run_now(&job).await?);
        }
        Command::Health => {
            print!("{}", cli::render_health(&services.coordinator.system_health_score()?));
        }
        Command::Report { days } => {
            println!("{}", services.coordinator.learning_report(days).await?);
        }
        Command::History { days } => {
            print!("{}", cli::render_history(&services.coordinator.optimization_history(days)?));
        }
        Command::Jobs => {
            let scheduler = PipelineScheduler::new(services, phase, Collaborators::new());
            print!("{}", cli::render_jobs(phase, scheduler.jobs()));
        }
        Command::Completions { .. } => {}
    }

    Ok(())
}

fn print_outcome(outcome: RunOutcome) {
    match outcome {
        RunOutcome::Completed(run) => print!("{}", cli::render_run(&run)),
        RunOutcome::AlreadyRunning(id) => {
            println!("{} {}", id.as_str().bright_yellow(), "is already running".yellow())
        }
    }
}
