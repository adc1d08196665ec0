//! # Stage: Pipeline Scheduler
//!
//! ## Responsibility
//! Runs the phase's jobs on their triggers. Each job is a sequence of
//! [`Step`]s resolved to [`Stage`]s; every run is recorded in the job run log.
//!
//! ## Guarantees
//! - Sequential: steps inside a run execute in order; the first failure stops
//!   the run and the step results collected so far are kept
//! - Non-reentrant: a job never runs twice concurrently; an overlapping fire or
//!   `run_now` returns [`RunOutcome::AlreadyRunning`]
//! - Isolated: each fire is its own task, so one job failing never cancels
//!   another
//! - Graceful stop: [`PipelineScheduler::stop`] disarms triggers but leaves
//!   in-flight runs to finish
//!
//! ## NOT Responsible For
//! - Cross-process exclusion
//! - Catching up on fires missed while stopped

pub mod jobs;
pub mod stage;
pub mod trigger;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::{OptimizerError, OptimizerResult};
use crate::models::JobRunRecord;
use crate::optimize::Services;
use crate::store::StoreResult;

pub use jobs::{registry, JobId, JobSpec, Step};
pub use stage::{Collaborators, Stage};
pub use trigger::Trigger;

// ---------------------------------------------------------------------------
// Run results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step: Step,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub output: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// One execution of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineRun {
    pub id: String,
    pub job: JobId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn to_record(&self) -> JobRunRecord {
        JobRunRecord {
            id: self.id.clone(),
            job_id: self.job.as_str().to_string(),
            status: self.status.as_str().to_string(),
            started_at: self.started_at,
            duration_ms: self.duration_ms,
            error: self.error.clone(),
            steps: serde_json::to_value(&self.steps).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(PipelineRun),
    /// The job was already running; nothing was executed.
    AlreadyRunning(JobId),
}

/// Observable scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub overlaps_skipped: u64,
    pub last_job: Option<JobId>,
    pub last_run_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Shared run state
// ---------------------------------------------------------------------------

struct Job {
    spec: JobSpec,
    guard: Arc<tokio::sync::Mutex<()>>,
}

struct Shared {
    services: Services,
    collaborators: Collaborators,
    jobs: BTreeMap<JobId, Job>,
    status: Arc<Mutex<SchedulerStatus>>,
}

impl Shared {
    async fn execute(&self, id: JobId) -> OptimizerResult<RunOutcome> {
        let job = self
            .jobs
            .get(&id)
            .ok_or_else(|| OptimizerError::UnknownJob(format!("{id} is not registered")))?;

        let _permit = match Arc::clone(&job.guard).try_lock_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(target: "optimizer::scheduler", job = %id, "job already running, skipping");
                self.status.lock().unwrap_or_else(|p| p.into_inner()).overlaps_skipped += 1;
                return Ok(RunOutcome::AlreadyRunning(id));
            }
        };

        let run = self.run_steps(&job.spec).await;
        if let Err(e) = self.services.store.append_job_run(&run.to_record()) {
            error!(target: "optimizer::scheduler", job = %id, error = %e, "failed to record job run");
        }

        {
            let mut st = self.status.lock().unwrap_or_else(|p| p.into_inner());
            st.runs_completed += 1;
            if run.status == RunStatus::Failed {
                st.runs_failed += 1;
            }
            st.last_job = Some(id);
            st.last_run_at = Some(run.started_at);
        }
        Ok(RunOutcome::Completed(run))
    }

    async fn run_steps(&self, spec: &JobSpec) -> PipelineRun {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(target: "optimizer::scheduler", job = %spec.id, steps = spec.steps.len(), "job started");

        let mut results = Vec::with_capacity(spec.steps.len());
        let mut failure = None;
        for &step in &spec.steps {
            let step_clock = Instant::now();
            let Some(stage) = stage::stage_for(step, &self.services, &self.collaborators) else {
                info!(target: "optimizer::scheduler", job = %spec.id, %step, "no stage registered, skipped");
                results.push(StepResult {
                    step,
                    status: StepStatus::Skipped,
                    duration_ms: 0,
                    error: None,
                    output: Value::Null,
                });
                continue;
            };
            match stage.execute().await {
                Ok(output) => results.push(StepResult {
                    step,
                    status: StepStatus::Succeeded,
                    duration_ms: elapsed_ms(step_clock),
                    error: None,
                    output,
                }),
                Err(e) => {
                    error!(target: "optimizer::scheduler", job = %spec.id, %step, error = %e, "step failed");
                    results.push(StepResult {
                        step,
                        status: StepStatus::Failed,
                        duration_ms: elapsed_ms(step_clock),
                        error: Some(e.to_string()),
                        output: Value::Null,
                    });
                    failure = Some(format!("{step}: {e}"));
                    break;
                }
            }
        }

        let run = PipelineRun {
            id: uuid::Uuid::new_v4().to_string(),
            job: spec.id,
            status: if failure.is_some() { RunStatus::Failed } else { RunStatus::Succeeded },
            started_at,
            duration_ms: elapsed_ms(clock),
            steps: results,
            error: failure,
        };
        match run.status {
            RunStatus::Succeeded => info!(
                target: "optimizer::scheduler",
                job = %spec.id,
                duration_ms = run.duration_ms,
                "job finished"
            ),
            RunStatus::Failed => error!(
                target: "optimizer::scheduler",
                job = %spec.id,
                duration_ms = run.duration_ms,
                error = run.error.as_deref().unwrap_or_default(),
                "job failed"
            ),
        }
        run
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Spawn one run of `id` as its own task.
fn fire(shared: &Arc<Shared>, id: JobId) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        if let Err(e) = shared.execute(id).await {
            error!(target: "optimizer::scheduler", job = %id, error = %e, "scheduled run rejected");
        }
    });
}

async fn trigger_loop(shared: Arc<Shared>, id: JobId, trigger: Trigger) {
    match trigger {
        Trigger::Interval { period } => {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                fire(&shared, id);
            }
        }
        Trigger::DailyAt { .. } => loop {
            let now = Utc::now();
            let wait = (trigger.next_fire_after(now) - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            fire(&shared, id);
        },
    }
}

// ---------------------------------------------------------------------------
// PipelineScheduler
// ---------------------------------------------------------------------------

pub struct PipelineScheduler {
    phase: u8,
    shared: Arc<Shared>,
    triggers: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineScheduler {
    /// Register the jobs of `phase`. Steps with no entry in `collaborators`
    /// (other than the optimization steps) are skipped at run time.
    pub fn new(services: Services, phase: u8, collaborators: Collaborators) -> Self {
        let jobs = registry(phase)
            .into_iter()
            .map(|spec| (spec.id, Job { spec, guard: Arc::new(tokio::sync::Mutex::new(())) }))
            .collect();
        Self {
            phase,
            shared: Arc::new(Shared {
                services,
                collaborators,
                jobs,
                status: Arc::new(Mutex::new(SchedulerStatus::default())),
            }),
            triggers: Mutex::new(Vec::new()),
        }
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobSpec> {
        self.shared.jobs.values().map(|j| &j.spec)
    }

    pub fn status_snapshot(&self) -> SchedulerStatus {
        self.shared.status.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_running(&self) -> bool {
        !self.triggers.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }

    /// Arm every job's trigger. Calling `start` on a running scheduler is a no-op.
    pub fn start(&self) {
        let mut triggers = self.triggers.lock().unwrap_or_else(|p| p.into_inner());
        if !triggers.is_empty() {
            return;
        }
        let now = Utc::now();
        for spec in self.jobs() {
            info!(
                target: "optimizer::scheduler",
                job = %spec.id,
                trigger = %spec.trigger,
                next_run = %spec.trigger.next_fire_after(now),
                "job armed"
            );
            triggers.push(tokio::spawn(trigger_loop(Arc::clone(&self.shared), spec.id, spec.trigger)));
        }
        self.shared.status.lock().unwrap_or_else(|p| p.into_inner()).running = true;
        info!(target: "optimizer::scheduler", phase = self.phase, jobs = triggers.len(), "scheduler started");
    }

    /// Disarm all triggers. Runs already in flight complete.
    pub fn stop(&self) {
        let handles: Vec<_> = self.triggers.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        self.shared.status.lock().unwrap_or_else(|p| p.into_inner()).running = false;
        info!(target: "optimizer::scheduler", disarmed = handles.len(), "scheduler stopped");
    }

    /// Run `job` now, outside its schedule.
    pub async fn run_now(&self, job: &str) -> OptimizerResult<RunOutcome> {
        let id: JobId = job.parse()?;
        if !self.shared.jobs.contains_key(&id) {
            return Err(OptimizerError::UnknownJob(format!(
                "{id} is not registered in phase {}",
                self.phase
            )));
        }
        info!(target: "optimizer::scheduler", job = %id, "manual run requested");
        self.shared.execute(id).await
    }

    /// Most recent runs of `job` from the run log, newest first.
    pub fn recent_runs(&self, job: JobId, limit: usize) -> StoreResult<Vec<JobRunRecord>> {
        self.shared.services.store.recent_job_runs(job.as_str(), limit)
    }
}

impl Drop for PipelineScheduler {
    fn drop(&mut self) {
        for handle in self.triggers.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::testing::ScriptedAdvisor;
    use crate::config::Settings;
    use crate::store::Store;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Stage for Counting {
        async fn execute(&self) -> OptimizerResult<Value> {
            Ok(json!({ "calls": self.0.fetch_add(1, Ordering::SeqCst) + 1 }))
        }
    }

    struct Failing;

    #[async_trait]
    impl Stage for Failing {
        async fn execute(&self) -> OptimizerResult<Value> {
            Err(OptimizerError::stage("content_creation", "renderer offline"))
        }
    }

    fn services() -> Services {
        Services::build(
            Store::open_in_memory().unwrap(),
            Arc::new(ScriptedAdvisor::always_failing()),
            &Settings::default(),
        )
    }

    fn completed(outcome: RunOutcome) -> PipelineRun {
        match outcome {
            RunOutcome::Completed(run) => run,
            other => panic!("expected completed run, got {other:?}"),
        }
    }

    // ===== run_now =====

    #[tokio::test]
    async fn test_run_now_unknown_job() {
        let s = PipelineScheduler::new(services(), 4, Collaborators::new());
        assert!(matches!(s.run_now("nope").await, Err(OptimizerError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn test_run_now_job_outside_phase() {
        let s = PipelineScheduler::new(services(), 1, Collaborators::new());
        let err = s.run_now("feedback_loop").await.unwrap_err();
        assert!(err.to_string().contains("phase 1"));
    }

    #[tokio::test]
    async fn test_missing_collaborator_is_skipped() {
        let s = PipelineScheduler::new(services(), 1, Collaborators::new());
        let run = completed(s.run_now("market_scan").await.unwrap());
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.steps[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_first_failure_stops_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut collab = Collaborators::new();
        collab.insert(Step::ContentStrategy, Arc::new(Counting(Arc::clone(&calls))) as Arc<dyn Stage>);
        collab.insert(Step::ContentCreation, Arc::new(Failing));
        collab.insert(Step::Publishing, Arc::new(Counting(Arc::clone(&calls))));
        let s = PipelineScheduler::new(services(), 1, collab);

        let run = completed(s.run_now("content_creation").await.unwrap());
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.steps[0].output, json!({"calls": 1}));
        assert_eq!(run.steps[1].status, StepStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(run.error.unwrap().starts_with("content_creation:"));

        let logged = s.recent_runs(JobId::ContentCreation, 5).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].status, "failed");
        assert_eq!(logged[0].steps.as_array().unwrap().len(), 2);
        assert_eq!(s.status_snapshot().runs_failed, 1);
    }

    #[tokio::test]
    async fn test_core_stages_run_on_empty_store() {
        let s = PipelineScheduler::new(services(), 4, Collaborators::new());
        for job in ["performance_analytics", "ab_testing", "strategy_tuning", "feedback_loop"] {
            let run = completed(s.run_now(job).await.unwrap());
            assert_eq!(run.status, RunStatus::Succeeded, "{job}");
            assert_eq!(run.steps[0].status, StepStatus::Succeeded, "{job}");
        }
    }

    // ===== triggers =====

    #[tokio::test(start_paused = true)]
    async fn test_interval_fires_after_one_period() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut collab = Collaborators::new();
        collab.insert(Step::Moderation, Arc::new(Counting(Arc::clone(&calls))) as Arc<dyn Stage>);
        let s = PipelineScheduler::new(services(), 3, collab);
        s.start();
        assert!(s.is_running());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(std::time::Duration::from_secs(30 * 60 + 1)).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(s.recent_runs(JobId::Moderation, 10).unwrap().len(), 1);

        s.stop();
        assert!(!s.is_running());
        tokio::time::advance(std::time::Duration::from_secs(60 * 60)).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(s.recent_runs(JobId::Moderation, 10).unwrap().len(), 1);
    }
}
