//! # Stage: Feedback Coordinator
//!
//! ## Responsibility
//! Drives one optimization cycle end to end (snapshot, experiments,
//! recommendations) and is the only place tuning changes are applied. Every
//! candidate passes a component allowlist, a denylist and a confidence floor;
//! accepted changes are appended to the optimization action log.
//!
//! ## Guarantees
//! - Gated: denylisted components are never applied, even if allowlisted
//! - Bounded: at most `max_adjustments` actions applied per cycle
//! - Auditable: every applied action is persisted with parameters and rationale;
//!   every rejection carries a typed reason
//! - Observable: [`CoordinatorStatus`] is readable at any time via `status_snapshot`
//!
//! ## NOT Responsible For
//! - Scheduling cycles (pipeline scheduler)
//! - Pushing applied parameters into collaborator stages

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::advisory::{AdvisoryPurpose, AdvisoryRequest, AdvisoryService};
use crate::config::FeedbackLoopSettings;
use crate::error::OptimizerResult;
use crate::models::{days_before, OptimizationAction, PerformanceSnapshot, PeriodType};
use crate::store::Store;

use super::experiment::{ExperimentEngine, TestOutcome};
use super::performance::{Anomaly, MetricTrend, PerformanceTracker};
use super::recommend::{Recommendation, RecommendationSynthesizer};

/// Components the coordinator may change automatically.
pub const ALLOWED_COMPONENTS: [&str; 4] = [
    "posting_schedule",
    "content_format_weights",
    "engagement_thresholds",
    "ab_test_parameters",
];

/// Components that are never changed automatically.
pub const DENIED_COMPONENTS: [&str; 3] = ["payment_processing", "user_data", "moderation_rules"];

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    Denylisted { component: String },
    NotAllowlisted { component: String },
    LowConfidence { confidence: f64, required: f64 },
    OverLimit { max: usize },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Denylisted { component } => write!(f, "component '{component}' is protected"),
            RejectReason::NotAllowlisted { component } => {
                write!(f, "component '{component}' is not auto-tunable")
            }
            RejectReason::LowConfidence { confidence, required } => {
                write!(f, "confidence {confidence:.2} below {required:.2}")
            }
            RejectReason::OverLimit { max } => write!(f, "per-cycle limit of {max} reached"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub recommendation: Recommendation,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GateDecision {
    pub accepted: Vec<Recommendation>,
    pub rejected: Vec<Rejection>,
}

/// Split candidates into those that may be applied and those that may not.
/// Candidates are considered in order; the denylist is checked first.
pub fn gate(candidates: &[Recommendation], min_confidence: f64, max: usize) -> GateDecision {
    let mut decision = GateDecision::default();
    for rec in candidates {
        let component = rec.component.as_str();
        let reason = if DENIED_COMPONENTS.contains(&component) {
            Some(RejectReason::Denylisted { component: component.to_string() })
        } else if !ALLOWED_COMPONENTS.contains(&component) {
            Some(RejectReason::NotAllowlisted { component: component.to_string() })
        } else if !(rec.confidence >= min_confidence) {
            Some(RejectReason::LowConfidence { confidence: rec.confidence, required: min_confidence })
        } else if decision.accepted.len() >= max {
            Some(RejectReason::OverLimit { max })
        } else {
            None
        };
        match reason {
            Some(reason) => decision.rejected.push(Rejection { recommendation: rec.clone(), reason }),
            None => decision.accepted.push(rec.clone()),
        }
    }
    decision
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    NeedsAttention,
    Unknown,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Excellent
        } else if score >= 60.0 {
            Self::Good
        } else if score >= 40.0 {
            Self::Fair
        } else {
            Self::NeedsAttention
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::NeedsAttention => "needs_attention",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthComponents {
    pub content_production: f64,
    pub engagement: f64,
    pub monetization: f64,
    pub conversion: f64,
    pub ai_performance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthScore {
    pub health_score: f64,
    pub status: HealthStatus,
    /// `None` when there is no recent snapshot.
    pub components: Option<HealthComponents>,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Weighted health score for one snapshot.
pub fn score_snapshot(s: &PerformanceSnapshot) -> HealthScore {
    let c = HealthComponents {
        content_production: (s.content_published_count as f64 * 10.0).min(100.0),
        engagement: s.avg_engagement_rate * 100.0,
        monetization: (s.total_paying_members as f64 * 5.0).min(100.0),
        conversion: s.conversion_rate * 100.0,
        ai_performance: s.avg_insight_confidence * 100.0,
    };
    let score = c.content_production * 0.20
        + c.engagement * 0.30
        + c.monetization * 0.25
        + c.conversion * 0.15
        + c.ai_performance * 0.10;
    HealthScore {
        health_score: round1(score),
        status: HealthStatus::from_score(score),
        components: Some(HealthComponents {
            content_production: round1(c.content_production),
            engagement: round1(c.engagement),
            monetization: round1(c.monetization),
            conversion: round1(c.conversion),
            ai_performance: round1(c.ai_performance),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationHistory {
    pub period_days: i64,
    pub total_optimizations: usize,
    pub optimizations: Vec<OptimizationAction>,
}

/// Everything one cycle observed and did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub snapshot: PerformanceSnapshot,
    pub trends: Option<Vec<MetricTrend>>,
    pub anomalies: Option<Vec<Anomaly>>,
    #[serde(skip)]
    pub test_outcomes: Vec<TestOutcome>,
    pub tests_completed: usize,
    pub tests_created: usize,
    pub candidates: usize,
    pub applied: Vec<OptimizationAction>,
    pub rejected: Vec<Rejection>,
}

/// Observable coordinator state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub cycles_completed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// `last_cycle_at` plus the configured cycle length.
    pub next_cycle_due: Option<DateTime<Utc>>,
    pub last_applied: usize,
    pub total_applied: u64,
}

// ---------------------------------------------------------------------------
// FeedbackCoordinator
// ---------------------------------------------------------------------------

pub struct FeedbackCoordinator {
    store: Store,
    advisor: Arc<dyn AdvisoryService>,
    tracker: Arc<PerformanceTracker>,
    experiments: Arc<ExperimentEngine>,
    synthesizer: Arc<RecommendationSynthesizer>,
    config: FeedbackLoopSettings,
    max_adjustments: usize,
    status: Arc<Mutex<CoordinatorStatus>>,
}

impl FeedbackCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        advisor: Arc<dyn AdvisoryService>,
        tracker: Arc<PerformanceTracker>,
        experiments: Arc<ExperimentEngine>,
        synthesizer: Arc<RecommendationSynthesizer>,
        config: FeedbackLoopSettings,
        max_adjustments: usize,
    ) -> Self {
        Self {
            store,
            advisor,
            tracker,
            experiments,
            synthesizer,
            config,
            max_adjustments,
            status: Arc::new(Mutex::new(CoordinatorStatus::default())),
        }
    }

    pub fn status_snapshot(&self) -> CoordinatorStatus {
        self.status.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub async fn run_cycle(&self) -> OptimizerResult<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> OptimizerResult<CycleReport> {
        info!(target: "optimizer::feedback", "optimization cycle started");

        let snapshot = self.tracker.create_snapshot_at(PeriodType::Daily, now)?;
        let trends = self.tracker.analyze_trends_at(now)?;
        let anomalies = self.tracker.detect_anomalies_at(now)?;

        let test_outcomes = self.experiments.analyze_active_tests_at(now).await?;
        let created = self.experiments.create_tests_from_insights_at(now).await?;

        let candidates = self.synthesizer.synthesize_at(now).await?;
        let decision = gate(&candidates, self.config.min_confidence_for_changes, self.max_adjustments);
        for r in &decision.rejected {
            info!(
                target: "optimizer::feedback",
                action = %r.recommendation.action,
                component = %r.recommendation.component,
                reason = %r.reason,
                "recommendation rejected"
            );
        }
        let applied = self.apply(&decision.accepted, now)?;

        {
            let mut st = self.status.lock().unwrap_or_else(|p| p.into_inner());
            st.cycles_completed += 1;
            st.last_cycle_at = Some(now);
            st.next_cycle_due = Some(now + Duration::hours(self.config.optimization_cycle_hours as i64));
            st.last_applied = applied.len();
            st.total_applied += applied.len() as u64;
        }

        let report = CycleReport {
            started_at: now,
            snapshot,
            trends,
            anomalies,
            tests_completed: test_outcomes.iter().filter(|o| o.is_completed()).count(),
            test_outcomes,
            tests_created: created.len(),
            candidates: candidates.len(),
            applied,
            rejected: decision.rejected,
        };
        info!(
            target: "optimizer::feedback",
            tests_completed = report.tests_completed,
            tests_created = report.tests_created,
            applied = report.applied.len(),
            rejected = report.rejected.len(),
            "optimization cycle complete"
        );
        Ok(report)
    }

    /// Record each accepted recommendation in the action log.
    fn apply(&self, accepted: &[Recommendation], now: DateTime<Utc>) -> OptimizerResult<Vec<OptimizationAction>> {
        let mut applied = Vec::with_capacity(accepted.len());
        for rec in accepted {
            let action = OptimizationAction {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: now,
                action: rec.action.clone(),
                component: rec.component.clone(),
                parameters: rec.adjustment.clone(),
                rationale: rec.reason.clone(),
                confidence: rec.confidence,
            };
            self.store.append_action(&action)?;
            info!(
                target: "optimizer::feedback",
                action = %action.action,
                component = %action.component,
                confidence = action.confidence,
                "optimization applied"
            );
            applied.push(action);
        }
        Ok(applied)
    }

    // ----- reporting -----

    pub fn system_health_score(&self) -> OptimizerResult<HealthScore> {
        self.system_health_score_at(Utc::now())
    }

    pub fn system_health_score_at(&self, now: DateTime<Utc>) -> OptimizerResult<HealthScore> {
        Ok(match self.store.latest_snapshot_since(now - Duration::hours(24))? {
            Some(s) => score_snapshot(&s),
            None => HealthScore { health_score: 0.0, status: HealthStatus::Unknown, components: None },
        })
    }

    pub fn optimization_history(&self, days: i64) -> OptimizerResult<OptimizationHistory> {
        self.optimization_history_at(days, Utc::now())
    }

    pub fn optimization_history_at(&self, days: i64, now: DateTime<Utc>) -> OptimizerResult<OptimizationHistory> {
        let optimizations = self.store.actions_since(days_before(now, days))?;
        Ok(OptimizationHistory {
            period_days: days,
            total_optimizations: optimizations.len(),
            optimizations,
        })
    }

    pub async fn learning_report(&self, days: i64) -> OptimizerResult<String> {
        self.learning_report_at(days, Utc::now()).await
    }

    /// Markdown report of what the system learned over the window.
    pub async fn learning_report_at(&self, days: i64, now: DateTime<Utc>) -> OptimizerResult<String> {
        let learnings = self.experiments.learnings_at(days, now)?;
        let history = self.optimization_history_at(days, now)?;
        let summary = self.tracker.executive_summary_at(days, now).await?;
        let roi = self.tracker.roi_metrics_at(days, now)?;

        let fallback = format!(
            "# System Learning Report ({days} days)\n\n\
             ## Executive Summary\n{summary}\n\n\
             ## A/B Tests Completed\n{} tests completed\n\n\
             ## Optimizations Applied\n{} optimizations\n\n\
             ## ROI\n\
             - Revenue: ${:.2}\n\
             - ROI: {:.1}%\n\
             - Conversion Efficiency: {:.1}%\n",
            learnings.len(),
            history.total_optimizations,
            roi.total_revenue,
            roi.roi_percentage,
            roi.conversion_efficiency,
        );

        let prompt = format!(
            "You are a business intelligence analyst. Generate a learning report in markdown.\n\n\
             Period: last {days} days\n\nExecutive summary:\n{summary}\n\n\
             A/B test learnings:\n{}\n\nOptimizations applied:\n{}\n\nROI metrics:\n{}\n\n\
             Cover: executive summary, key learnings, performance improvements, how the system \
             evolved, and what to focus on next.",
            serde_json::to_string_pretty(&learnings).unwrap_or_default(),
            serde_json::to_string_pretty(&history).unwrap_or_default(),
            serde_json::to_string_pretty(&roi).unwrap_or_default(),
        );
        match self
            .advisor
            .complete(AdvisoryRequest::new(AdvisoryPurpose::LearningReport, prompt))
            .await
        {
            Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(_) => Ok(fallback),
            Err(e) => {
                warn!(target: "optimizer::feedback", error = %e, "learning report fallback");
                Ok(fallback)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::testing::ScriptedAdvisor;
    use crate::config::Settings;
    use crate::optimize::Services;
    use rstest::rstest;
    use serde_json::json;

    fn rec(action: &str, component: &str, confidence: f64) -> Recommendation {
        Recommendation {
            action: action.into(),
            component: component.into(),
            reason: "because".into(),
            adjustment: json!({"k": 1}),
            expected_impact: json!("more"),
            confidence,
        }
    }

    fn snapshot(count: u64, rate: f64, paying: u64, conv: f64, conf: f64, at: DateTime<Utc>) -> PerformanceSnapshot {
        PerformanceSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            period_type: PeriodType::Daily,
            snapshot_date: at,
            snapshot_day: at.format("%Y-%m-%d").to_string(),
            content_published_count: count,
            avg_engagement_rate: rate,
            total_impressions: 0,
            total_clicks: 0,
            new_conversions: 0,
            total_paying_members: paying,
            revenue: 0.0,
            conversion_rate: conv,
            top_performing_format: None,
            top_performing_asset: None,
            top_performing_insight_type: None,
            avg_insight_confidence: conf,
        }
    }

    fn services(advisor: ScriptedAdvisor) -> Services {
        let store = Store::open_in_memory().unwrap();
        Services::build(store, Arc::new(advisor), &Settings::default())
    }

    // ===== gate =====

    #[test]
    fn test_gate_accepts_allowlisted_confident() {
        let d = gate(&[rec("a", "posting_schedule", 0.9)], 0.85, 5);
        assert_eq!(d.accepted.len(), 1);
        assert!(d.rejected.is_empty());
    }

    #[rstest]
    #[case("payment_processing", 0.99)]
    #[case("user_data", 0.99)]
    #[case("moderation_rules", 0.99)]
    fn test_gate_denylist(#[case] component: &str, #[case] conf: f64) {
        let d = gate(&[rec("a", component, conf)], 0.85, 5);
        assert!(d.accepted.is_empty());
        assert!(matches!(d.rejected[0].reason, RejectReason::Denylisted { .. }));
    }

    #[test]
    fn test_gate_unknown_component_rejected() {
        let d = gate(&[rec("a", "unknown", 0.99)], 0.85, 5);
        assert!(matches!(d.rejected[0].reason, RejectReason::NotAllowlisted { .. }));
    }

    #[test]
    fn test_gate_low_confidence() {
        let d = gate(&[rec("a", "posting_schedule", 0.84)], 0.85, 5);
        assert_eq!(
            d.rejected[0].reason,
            RejectReason::LowConfidence { confidence: 0.84, required: 0.85 }
        );
    }

    #[test]
    fn test_gate_limit() {
        let cands: Vec<_> = (0..7).map(|i| rec(&format!("a{i}"), "posting_schedule", 0.9)).collect();
        let d = gate(&cands, 0.85, 5);
        assert_eq!(d.accepted.len(), 5);
        assert_eq!(d.rejected.len(), 2);
        assert_eq!(d.rejected[0].reason, RejectReason::OverLimit { max: 5 });
    }

    // ===== health =====

    #[test]
    fn test_health_weighted_score() {
        // content 100, engagement 50, monetization 50, conversion 20, ai 90
        let s = snapshot(12, 0.5, 10, 0.2, 0.9, Utc::now());
        let h = score_snapshot(&s);
        // 20 + 15 + 12.5 + 3 + 9 = 59.5
        assert!((h.health_score - 59.5).abs() < 1e-9);
        assert_eq!(h.status, HealthStatus::Fair);
        let c = h.components.unwrap();
        assert_eq!(c.content_production, 100.0);
        assert_eq!(c.monetization, 50.0);
    }

    #[test]
    fn test_health_rate_components_are_not_capped() {
        let s = snapshot(0, 1.5, 0, 0.0, 0.0, Utc::now());
        let h = score_snapshot(&s);
        assert!((h.health_score - 45.0).abs() < 1e-9);
        assert_eq!(h.status, HealthStatus::Fair);
        assert_eq!(h.components.unwrap().engagement, 150.0);
    }

    #[rstest]
    #[case(80.0, HealthStatus::Excellent)]
    #[case(79.9, HealthStatus::Good)]
    #[case(60.0, HealthStatus::Good)]
    #[case(40.0, HealthStatus::Fair)]
    #[case(39.9, HealthStatus::NeedsAttention)]
    fn test_health_status_buckets(#[case] score: f64, #[case] expected: HealthStatus) {
        assert_eq!(HealthStatus::from_score(score), expected);
    }

    #[test]
    fn test_health_without_recent_snapshot_is_unknown() {
        let svc = services(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        svc.store.insert_snapshot(&snapshot(5, 0.1, 1, 0.1, 0.9, now - Duration::hours(30))).unwrap();
        let h = svc.coordinator.system_health_score_at(now).unwrap();
        assert_eq!(h.health_score, 0.0);
        assert_eq!(h.status, HealthStatus::Unknown);
        assert!(h.components.is_none());
    }

    #[test]
    fn test_health_uses_recent_snapshot() {
        let svc = services(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        svc.store.insert_snapshot(&snapshot(10, 1.0, 20, 1.0, 1.0, now - Duration::hours(1))).unwrap();
        let h = svc.coordinator.system_health_score_at(now).unwrap();
        assert_eq!(h.health_score, 100.0);
        assert_eq!(h.status, HealthStatus::Excellent);
    }

    // ===== cycle + reporting =====

    #[tokio::test]
    async fn test_cycle_on_empty_store_applies_nothing() {
        let svc = services(ScriptedAdvisor::always_failing());
        let report = svc.coordinator.run_cycle().await.unwrap();
        assert_eq!(report.snapshot.content_published_count, 0);
        assert!(report.trends.is_none());
        assert!(report.applied.is_empty());
        let status = svc.coordinator.status_snapshot();
        assert_eq!(status.cycles_completed, 1);
        assert_eq!(status.next_cycle_due, Some(report.started_at + Duration::hours(24)));
    }

    #[test]
    fn test_apply_logs_actions_newest_first() {
        let svc = services(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        svc.coordinator
            .apply(&[rec("first", "posting_schedule", 0.9)], now - Duration::hours(2))
            .unwrap();
        svc.coordinator
            .apply(&[rec("second", "ab_test_parameters", 0.95)], now - Duration::hours(1))
            .unwrap();
        let h = svc.coordinator.optimization_history_at(30, now).unwrap();
        assert_eq!(h.total_optimizations, 2);
        assert_eq!(h.optimizations[0].action, "second");
        assert_eq!(h.optimizations[1].parameters, json!({"k": 1}));
        assert_eq!(h.optimizations[1].rationale, "because");
    }

    #[tokio::test]
    async fn test_learning_report_fallback_sections() {
        let svc = services(ScriptedAdvisor::always_failing());
        let report = svc.coordinator.learning_report(7).await.unwrap();
        assert!(report.starts_with("# System Learning Report (7 days)"));
        assert!(report.contains("## Executive Summary\nInsufficient data for executive summary."));
        assert!(report.contains("## A/B Tests Completed\n0 tests completed"));
        assert!(report.contains("## Optimizations Applied\n0 optimizations"));
        assert!(report.contains("- Revenue: $0.00"));
        assert!(report.contains("- ROI: 0.0%"));
        assert!(report.contains("- Conversion Efficiency: 0.0%"));
    }

    #[tokio::test]
    async fn test_learning_report_prefers_advisor_text() {
        // Executive summary short-circuits without snapshots, so the only
        // advisory call is the report itself.
        let svc = services(ScriptedAdvisor::new(vec![Ok("# Report\nAll good".into())]));
        assert_eq!(svc.coordinator.learning_report(7).await.unwrap(), "# Report\nAll good");
    }
}
