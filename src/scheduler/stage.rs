//! Executable steps.
//!
//! [`Stage`] is the seam between the scheduler and whatever does the work.
//! The four optimization steps are built from [`Services`]; every other step
//! comes from a collaborator registered with the scheduler, and is skipped
//! when none was registered.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::OptimizerResult;
use crate::models::PeriodType;
use crate::optimize::experiment::TestOutcome;
use crate::optimize::Services;

use super::jobs::Step;

#[async_trait]
pub trait Stage: Send + Sync {
    /// Run once. The returned value is stored in the step result.
    async fn execute(&self) -> OptimizerResult<Value>;
}

/// Collaborator-supplied stages keyed by the step they implement.
pub type Collaborators = HashMap<Step, Arc<dyn Stage>>;

/// Resolve `step` to a runnable stage, or `None` if it should be skipped.
pub fn stage_for(step: Step, services: &Services, collaborators: &Collaborators) -> Option<Arc<dyn Stage>> {
    match step {
        Step::PerformanceAnalytics => Some(Arc::new(PerformanceAnalyticsStage(services.clone()))),
        Step::AbTesting => Some(Arc::new(AbTestingStage(services.clone()))),
        Step::StrategyTuning => Some(Arc::new(StrategyTuningStage(services.clone()))),
        Step::FeedbackLoop => Some(Arc::new(FeedbackLoopStage(services.clone()))),
        Step::MarketScan
        | Step::Analysis
        | Step::ImageGeneration
        | Step::ContentStrategy
        | Step::ContentCreation
        | Step::Publishing
        | Step::Engagement
        | Step::Analytics
        | Step::ContentRepurposing
        | Step::Conversion
        | Step::Onboarding
        | Step::ExclusiveContent
        | Step::Moderation => collaborators.get(&step).cloned(),
    }
}

// ---------------------------------------------------------------------------
// Optimization stages
// ---------------------------------------------------------------------------

struct PerformanceAnalyticsStage(Services);

#[async_trait]
impl Stage for PerformanceAnalyticsStage {
    async fn execute(&self) -> OptimizerResult<Value> {
        let tracker = &self.0.tracker;
        let snapshot = tracker.create_snapshot(PeriodType::Daily)?;
        let trends = tracker.analyze_trends()?;
        let anomalies = tracker.detect_anomalies()?;
        let predictions = tracker.predictions().await?;
        Ok(json!({
            "snapshot_id": snapshot.id,
            "trends": trends,
            "anomalies": anomalies,
            "predictions": predictions.len(),
        }))
    }
}

struct AbTestingStage(Services);

#[async_trait]
impl Stage for AbTestingStage {
    async fn execute(&self) -> OptimizerResult<Value> {
        let engine = &self.0.experiments;
        let outcomes = engine.analyze_active_tests().await?;
        let created = engine.create_tests_from_insights().await?;
        let winners = outcomes.iter().filter(|o| matches!(o, TestOutcome::Winner { .. })).count();
        let inconclusive = outcomes.iter().filter(|o| matches!(o, TestOutcome::Inconclusive { .. })).count();
        Ok(json!({
            "tests_analyzed": outcomes.len(),
            "winners": winners,
            "inconclusive": inconclusive,
            "tests_created": created.len(),
        }))
    }
}

/// Produces candidates only; applying them is the feedback loop's job.
struct StrategyTuningStage(Services);

#[async_trait]
impl Stage for StrategyTuningStage {
    async fn execute(&self) -> OptimizerResult<Value> {
        let recs = self.0.synthesizer.synthesize().await?;
        Ok(json!({ "recommendations": recs }))
    }
}

struct FeedbackLoopStage(Services);

#[async_trait]
impl Stage for FeedbackLoopStage {
    async fn execute(&self) -> OptimizerResult<Value> {
        let report = self.0.coordinator.run_cycle().await?;
        Ok(json!({
            "tests_completed": report.tests_completed,
            "tests_created": report.tests_created,
            "candidates": report.candidates,
            "applied": report.applied.len(),
            "rejected": report.rejected.len(),
        }))
    }
}
