//! Job catalogue: ids, steps, triggers and which rollout phase registers each.

use std::str::FromStr;

use serde::Serialize;

use crate::error::OptimizerError;

use super::trigger::Trigger;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobId {
    MarketScan,
    AnalysisPipeline,
    ContentCreation,
    DailyFullPipeline,
    Engagement,
    Analytics,
    ContentRepurposing,
    Conversion,
    Onboarding,
    ExclusiveContent,
    Moderation,
    PerformanceAnalytics,
    AbTesting,
    StrategyTuning,
    FeedbackLoop,
}

impl JobId {
    pub const ALL: [JobId; 15] = [
        JobId::MarketScan,
        JobId::AnalysisPipeline,
        JobId::ContentCreation,
        JobId::DailyFullPipeline,
        JobId::Engagement,
        JobId::Analytics,
        JobId::ContentRepurposing,
        JobId::Conversion,
        JobId::Onboarding,
        JobId::ExclusiveContent,
        JobId::Moderation,
        JobId::PerformanceAnalytics,
        JobId::AbTesting,
        JobId::StrategyTuning,
        JobId::FeedbackLoop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobId::MarketScan => "market_scan",
            JobId::AnalysisPipeline => "analysis_pipeline",
            JobId::ContentCreation => "content_creation",
            JobId::DailyFullPipeline => "daily_full_pipeline",
            JobId::Engagement => "engagement",
            JobId::Analytics => "analytics",
            JobId::ContentRepurposing => "content_repurposing",
            JobId::Conversion => "conversion",
            JobId::Onboarding => "onboarding",
            JobId::ExclusiveContent => "exclusive_content",
            JobId::Moderation => "moderation",
            JobId::PerformanceAnalytics => "performance_analytics",
            JobId::AbTesting => "ab_testing",
            JobId::StrategyTuning => "strategy_tuning",
            JobId::FeedbackLoop => "feedback_loop",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            JobId::MarketScan => "Market Scanner",
            JobId::AnalysisPipeline => "Analysis Pipeline",
            JobId::ContentCreation => "Content Creation",
            JobId::DailyFullPipeline => "Daily Full Pipeline",
            JobId::Engagement => "Engagement Pipeline",
            JobId::Analytics => "Analytics Collection",
            JobId::ContentRepurposing => "Content Repurposing",
            JobId::Conversion => "User Conversion",
            JobId::Onboarding => "Member Onboarding",
            JobId::ExclusiveContent => "Exclusive Content",
            JobId::Moderation => "Community Moderation",
            JobId::PerformanceAnalytics => "Performance Analytics",
            JobId::AbTesting => "A/B Testing",
            JobId::StrategyTuning => "Strategy Tuning",
            JobId::FeedbackLoop => "Feedback Loop Coordination",
        }
    }

    /// Lowest rollout phase that registers this job.
    pub fn min_phase(self) -> u8 {
        match self {
            JobId::MarketScan
            | JobId::AnalysisPipeline
            | JobId::ContentCreation
            | JobId::DailyFullPipeline => 1,
            JobId::Engagement | JobId::Analytics | JobId::ContentRepurposing => 2,
            JobId::Conversion | JobId::Onboarding | JobId::ExclusiveContent | JobId::Moderation => 3,
            JobId::PerformanceAnalytics
            | JobId::AbTesting
            | JobId::StrategyTuning
            | JobId::FeedbackLoop => 4,
        }
    }

    pub fn trigger(self) -> Trigger {
        match self {
            JobId::MarketScan | JobId::Moderation => Trigger::minutes(30),
            JobId::Engagement => Trigger::hours(1),
            JobId::AnalysisPipeline | JobId::Onboarding => Trigger::hours(2),
            JobId::ContentCreation | JobId::ExclusiveContent => Trigger::hours(3),
            JobId::Conversion => Trigger::hours(4),
            JobId::Analytics => Trigger::hours(6),
            JobId::AbTesting => Trigger::hours(8),
            JobId::PerformanceAnalytics => Trigger::hours(12),
            JobId::StrategyTuning => Trigger::daily(2, 0),
            JobId::FeedbackLoop => Trigger::daily(4, 0),
            JobId::DailyFullPipeline => Trigger::daily(6, 0),
            JobId::ContentRepurposing => Trigger::daily(10, 0),
        }
    }

    /// Steps run, in order, for this job at `phase`.
    pub fn steps(self, phase: u8) -> Vec<Step> {
        match self {
            JobId::MarketScan => vec![Step::MarketScan],
            JobId::AnalysisPipeline => vec![Step::Analysis, Step::ContentStrategy],
            JobId::ContentCreation => vec![Step::ContentStrategy, Step::ContentCreation, Step::Publishing],
            JobId::DailyFullPipeline => daily_pipeline_steps(phase),
            JobId::Engagement => vec![Step::Engagement, Step::Analytics],
            JobId::Analytics => vec![Step::Analytics],
            JobId::ContentRepurposing => vec![Step::ContentRepurposing],
            JobId::Conversion => vec![Step::Conversion],
            JobId::Onboarding => vec![Step::Onboarding],
            JobId::ExclusiveContent => vec![Step::ExclusiveContent],
            JobId::Moderation => vec![Step::Moderation],
            JobId::PerformanceAnalytics => vec![Step::PerformanceAnalytics],
            JobId::AbTesting => vec![Step::AbTesting],
            JobId::StrategyTuning => vec![Step::StrategyTuning],
            JobId::FeedbackLoop => vec![Step::FeedbackLoop],
        }
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobId {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| OptimizerError::UnknownJob(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of work inside a job. The last four are implemented in this crate;
/// the rest are supplied by collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    MarketScan,
    Analysis,
    ImageGeneration,
    ContentStrategy,
    ContentCreation,
    Publishing,
    Engagement,
    Analytics,
    ContentRepurposing,
    Conversion,
    Onboarding,
    ExclusiveContent,
    Moderation,
    PerformanceAnalytics,
    AbTesting,
    StrategyTuning,
    FeedbackLoop,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::MarketScan => "market_scan",
            Step::Analysis => "analysis",
            Step::ImageGeneration => "image_generation",
            Step::ContentStrategy => "content_strategy",
            Step::ContentCreation => "content_creation",
            Step::Publishing => "publishing",
            Step::Engagement => "engagement",
            Step::Analytics => "analytics",
            Step::ContentRepurposing => "content_repurposing",
            Step::Conversion => "conversion",
            Step::Onboarding => "onboarding",
            Step::ExclusiveContent => "exclusive_content",
            Step::Moderation => "moderation",
            Step::PerformanceAnalytics => "performance_analytics",
            Step::AbTesting => "ab_testing",
            Step::StrategyTuning => "strategy_tuning",
            Step::FeedbackLoop => "feedback_loop",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The daily pipeline grows with the phase; each phase appends to the last.
pub fn daily_pipeline_steps(phase: u8) -> Vec<Step> {
    let mut steps = vec![Step::MarketScan, Step::Analysis];
    if phase >= 2 {
        steps.push(Step::ImageGeneration);
    }
    steps.extend([Step::ContentStrategy, Step::ContentCreation, Step::Publishing]);
    if phase >= 2 {
        steps.extend([Step::Engagement, Step::Analytics, Step::ContentRepurposing]);
    }
    if phase >= 3 {
        steps.extend([Step::Conversion, Step::Onboarding, Step::ExclusiveContent, Step::Moderation]);
    }
    if phase >= 4 {
        steps.extend([Step::PerformanceAnalytics, Step::AbTesting, Step::FeedbackLoop]);
    }
    steps
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSpec {
    pub id: JobId,
    pub name: &'static str,
    pub trigger: Trigger,
    pub steps: Vec<Step>,
}

/// Jobs registered at `phase`, in catalogue order.
pub fn registry(phase: u8) -> Vec<JobSpec> {
    JobId::ALL
        .into_iter()
        .filter(|id| id.min_phase() <= phase)
        .map(|id| JobSpec { id, name: id.display_name(), trigger: id.trigger(), steps: id.steps(phase) })
        .collect()
}
