//! # Stage: Recommendation Synthesizer
//!
//! ## Responsibility
//! Summarizes the last 30 days of content, conversion and timing data, asks
//! the advisory service for tuning candidates and reduces the reply to a
//! short, ranked, de-duplicated list.
//!
//! ## Guarantees
//! - Soft failure: an advisory error or malformed reply yields an empty list
//! - Bounded: at most `max_adjustments_per_run` candidates, each at or above
//!   `confidence_level`
//! - Deterministic ranking: confidence descending, ties keep reply order
//!
//! ## NOT Responsible For
//! - Deciding what may be applied (feedback coordinator gate)

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::advisory::{extract_json_array, AdvisoryPurpose, AdvisoryRequest, AdvisoryService};
use crate::config::StrategyTuningSettings;
use crate::error::OptimizerResult;
use crate::models::AttemptStatus;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Analyses
// ---------------------------------------------------------------------------

/// An analysis result, or a marker that the window held too little data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Analysis<T> {
    InsufficientData { message: String },
    Ready(T),
}

impl<T> Analysis<T> {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, Analysis::InsufficientData { .. })
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            Analysis::Ready(t) => Some(t),
            Analysis::InsufficientData { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStats {
    pub count: usize,
    pub avg_engagement: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentAnalysis {
    pub total_content_analyzed: usize,
    /// Per format: mean of `likes + 2*comments + 3*shares`.
    pub format_performance: BTreeMap<String, GroupStats>,
    /// Per insight type: mean engagement rate.
    pub insight_performance: BTreeMap<String, GroupStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscountStats {
    pub count: usize,
    pub conversions: usize,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionAnalysis {
    pub total_attempts_analyzed: usize,
    pub overall_conversion_rate: f64,
    pub overall_click_rate: f64,
    pub discount_performance: BTreeMap<u32, DiscountStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourStats {
    pub count: usize,
    pub avg_engagement_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingAnalysis {
    pub hourly_performance: BTreeMap<u32, HourStats>,
    pub best_posting_hours: Vec<u32>,
    pub worst_posting_hours: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analyses {
    pub content: Analysis<ContentAnalysis>,
    pub conversion: Analysis<ConversionAnalysis>,
    pub timing: Analysis<TimingAnalysis>,
}

impl Analyses {
    fn all_insufficient(&self) -> bool {
        self.content.is_insufficient() && self.conversion.is_insufficient() && self.timing.is_insufficient()
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// One tuning candidate as returned by the advisory service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: String,
    /// Subsystem the change targets. Inferred from `action` when absent.
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub adjustment: Value,
    #[serde(default)]
    pub expected_impact: Value,
    pub confidence: f64,
}

/// Action label keywords mapped to the component they touch. First match wins.
const COMPONENT_KEYWORDS: &[(&str, &str)] = &[
    ("posting", "posting_schedule"),
    ("schedule", "posting_schedule"),
    ("format", "content_format_weights"),
    ("threshold", "engagement_thresholds"),
    ("engagement", "engagement_thresholds"),
    ("ab_test", "ab_test_parameters"),
    ("experiment", "ab_test_parameters"),
    ("payment", "payment_processing"),
    ("pricing", "payment_processing"),
    ("discount", "payment_processing"),
    ("user", "user_data"),
    ("member", "user_data"),
    ("moderation", "moderation_rules"),
];

/// Best-effort component for an action label, `"unknown"` when nothing matches.
pub fn infer_component(action: &str) -> &'static str {
    let lower = action.to_ascii_lowercase();
    COMPONENT_KEYWORDS
        .iter()
        .find(|(kw, _)| lower.contains(kw))
        .map(|(_, component)| *component)
        .unwrap_or("unknown")
}

/// Parse an advisory reply into candidates. Items that do not deserialize are
/// dropped; a reply with no JSON array yields an empty list.
pub fn parse_recommendations(text: &str) -> Vec<Recommendation> {
    let Some(items) = extract_json_array(text) else {
        warn!(target: "optimizer::recommend", "recommendation reply was not a JSON array");
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<Recommendation>(item).ok())
        .map(|mut r| {
            if r.component.trim().is_empty() {
                r.component = infer_component(&r.action).to_string();
            }
            r
        })
        .collect()
}

/// Keep candidates at or above `min_confidence`, rank by confidence, drop
/// repeated (component, action) pairs and cap the list at `max`.
pub fn filter_and_rank(candidates: Vec<Recommendation>, min_confidence: f64, max: usize) -> Vec<Recommendation> {
    let mut kept: Vec<Recommendation> = candidates
        .into_iter()
        .filter(|r| r.confidence >= min_confidence)
        .collect();
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut seen = HashSet::new();
    kept.retain(|r| seen.insert((r.component.clone(), r.action.clone())));
    kept.truncate(max);
    kept
}

// ---------------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------------

pub struct RecommendationSynthesizer {
    store: Store,
    advisor: Arc<dyn AdvisoryService>,
    config: StrategyTuningSettings,
}

impl RecommendationSynthesizer {
    pub fn new(store: Store, advisor: Arc<dyn AdvisoryService>, config: StrategyTuningSettings) -> Self {
        Self { store, advisor, config }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.config.window_days)
    }

    pub fn analyze_content_at(&self, now: DateTime<Utc>) -> OptimizerResult<Analysis<ContentAnalysis>> {
        let content = self.store.content_since(self.cutoff(now))?;
        if content.len() < self.config.min_data_points {
            return Ok(Analysis::InsufficientData {
                message: format!(
                    "Need {} data points, have {}",
                    self.config.min_data_points,
                    content.len()
                ),
            });
        }

        let mut by_format: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        let mut by_type: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for c in &content {
            let weighted = (c.likes + 2 * c.comments + 3 * c.shares) as f64;
            let e = by_format.entry(c.format.clone()).or_default();
            e.0 += weighted;
            e.1 += 1;
            if let Some(t) = &c.insight_type {
                let e = by_type.entry(t.clone()).or_default();
                e.0 += c.engagement_rate;
                e.1 += 1;
            }
        }
        let finish = |m: BTreeMap<String, (f64, usize)>| -> BTreeMap<String, GroupStats> {
            m.into_iter()
                .map(|(k, (sum, n))| (k, GroupStats { count: n, avg_engagement: sum / n as f64 }))
                .collect()
        };
        Ok(Analysis::Ready(ContentAnalysis {
            total_content_analyzed: content.len(),
            format_performance: finish(by_format),
            insight_performance: finish(by_type),
        }))
    }

    pub fn analyze_conversions_at(&self, now: DateTime<Utc>) -> OptimizerResult<Analysis<ConversionAnalysis>> {
        let attempts = self.store.conversion_attempts_since(self.cutoff(now))?;
        if attempts.is_empty() {
            return Ok(Analysis::InsufficientData { message: "no conversion attempts".into() });
        }
        let total = attempts.len();
        let converted = attempts.iter().filter(|a| a.status == AttemptStatus::Converted).count();
        let clicked = attempts.iter().filter(|a| a.clicked_at.is_some()).count();

        let mut tiers: BTreeMap<u32, DiscountStats> = BTreeMap::new();
        for a in &attempts {
            let t = tiers
                .entry(a.discount_percentage)
                .or_insert(DiscountStats { count: 0, conversions: 0, conversion_rate: 0.0 });
            t.count += 1;
            if a.status == AttemptStatus::Converted {
                t.conversions += 1;
            }
        }
        for t in tiers.values_mut() {
            t.conversion_rate = t.conversions as f64 / t.count as f64;
        }

        Ok(Analysis::Ready(ConversionAnalysis {
            total_attempts_analyzed: total,
            overall_conversion_rate: converted as f64 / total as f64,
            overall_click_rate: clicked as f64 / total as f64,
            discount_performance: tiers,
        }))
    }

    pub fn analyze_timing_at(&self, now: DateTime<Utc>) -> OptimizerResult<Analysis<TimingAnalysis>> {
        let content = self.store.content_since(self.cutoff(now))?;
        if content.is_empty() {
            return Ok(Analysis::InsufficientData { message: "no published content".into() });
        }
        let mut sums: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
        for c in &content {
            let e = sums.entry(c.published_at.hour()).or_default();
            e.0 += c.engagement_rate;
            e.1 += 1;
        }
        let hourly: BTreeMap<u32, HourStats> = sums
            .into_iter()
            .map(|(h, (sum, n))| (h, HourStats { count: n, avg_engagement_rate: sum / n as f64 }))
            .collect();

        let mut ranked: Vec<(u32, f64)> = hourly.iter().map(|(h, s)| (*h, s.avg_engagement_rate)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let best = ranked.iter().take(5).map(|(h, _)| *h).collect();
        let worst = ranked[ranked.len().saturating_sub(3)..].iter().map(|(h, _)| *h).collect();

        Ok(Analysis::Ready(TimingAnalysis {
            hourly_performance: hourly,
            best_posting_hours: best,
            worst_posting_hours: worst,
        }))
    }

    pub fn analyses_at(&self, now: DateTime<Utc>) -> OptimizerResult<Analyses> {
        Ok(Analyses {
            content: self.analyze_content_at(now)?,
            conversion: self.analyze_conversions_at(now)?,
            timing: self.analyze_timing_at(now)?,
        })
    }

    pub async fn synthesize(&self) -> OptimizerResult<Vec<Recommendation>> {
        self.synthesize_at(Utc::now()).await
    }

    /// Ranked candidates for the window ending at `now`.
    pub async fn synthesize_at(&self, now: DateTime<Utc>) -> OptimizerResult<Vec<Recommendation>> {
        let analyses = self.analyses_at(now)?;
        if analyses.all_insufficient() {
            info!(target: "optimizer::recommend", "insufficient data for recommendations");
            return Ok(Vec::new());
        }

        let prompt = format!(
            "You are a strategic optimization expert. Analyze this system performance data and \
             provide concrete tuning recommendations.\n\nPerformance data:\n{}\n\n\
             Generate 3-5 actionable recommendations as a JSON array of objects with keys \
             \"action\", \"component\", \"reason\", \"adjustment\" (object of parameter changes), \
             \"expected_impact\" and \"confidence\" (0-1). Valid components: posting_schedule, \
             content_format_weights, engagement_thresholds, ab_test_parameters.",
            serde_json::to_string_pretty(&analyses).unwrap_or_default()
        );
        let candidates = match self
            .advisor
            .complete(AdvisoryRequest::new(AdvisoryPurpose::Recommendations, prompt))
            .await
        {
            Ok(text) => parse_recommendations(&text),
            Err(e) => {
                warn!(target: "optimizer::recommend", error = %e, "recommendations unavailable");
                Vec::new()
            }
        };
        let total = candidates.len();
        let ranked = filter_and_rank(
            candidates,
            self.config.confidence_level,
            self.config.max_adjustments_per_run,
        );
        info!(
            target: "optimizer::recommend",
            candidates = total,
            kept = ranked.len(),
            "recommendations synthesized"
        );
        Ok(ranked)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::testing::ScriptedAdvisor;
    use crate::models::{ContentRecord, ConversionAttempt};
    use chrono::TimeZone;
    use rstest::rstest;

    fn rec(action: &str, component: &str, confidence: f64) -> Recommendation {
        Recommendation {
            action: action.into(),
            component: component.into(),
            reason: String::new(),
            adjustment: Value::Null,
            expected_impact: Value::Null,
            confidence,
        }
    }

    fn synth(advisor: ScriptedAdvisor, min_points: usize) -> (RecommendationSynthesizer, Store) {
        let store = Store::open_in_memory().unwrap();
        let config = StrategyTuningSettings { min_data_points: min_points, ..StrategyTuningSettings::default() };
        (RecommendationSynthesizer::new(store.clone(), Arc::new(advisor), config), store)
    }

    // ===== parsing =====

    #[rstest]
    #[case("adjust_posting_schedule", "posting_schedule")]
    #[case("increase_thread_format_weight", "content_format_weights")]
    #[case("raise_engagement_threshold", "engagement_thresholds")]
    #[case("extend_ab_test_duration", "ab_test_parameters")]
    #[case("change_discount_tiers", "payment_processing")]
    #[case("purge_user_records", "user_data")]
    #[case("relax_moderation", "moderation_rules")]
    #[case("do_something_else", "unknown")]
    fn test_infer_component(#[case] action: &str, #[case] expected: &str) {
        assert_eq!(infer_component(action), expected);
    }

    #[test]
    fn test_parse_fills_missing_component() {
        let text = r#"[{"action":"adjust_posting_schedule","reason":"r","adjustment":{"hour":9},
                       "expected_impact":"+10%","confidence":0.9}]"#;
        let recs = parse_recommendations(text);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].component, "posting_schedule");
        assert_eq!(recs[0].adjustment["hour"], 9);
    }

    #[test]
    fn test_parse_keeps_explicit_component() {
        let text = r#"[{"action":"x","component":"ab_test_parameters","confidence":0.9}]"#;
        assert_eq!(parse_recommendations(text)[0].component, "ab_test_parameters");
    }

    #[test]
    fn test_parse_malformed_is_empty() {
        assert!(parse_recommendations("I cannot help with that").is_empty());
        assert!(parse_recommendations("[{broken").is_empty());
    }

    #[test]
    fn test_parse_skips_items_without_confidence() {
        let text = r#"[{"action":"a"}, {"action":"b","confidence":0.85}]"#;
        let recs = parse_recommendations(text);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].action, "b");
    }

    // ===== filter / rank =====

    #[test]
    fn test_filter_rank_dedup_truncate() {
        let cands = vec![
            rec("a", "posting_schedule", 0.82),
            rec("b", "content_format_weights", 0.95),
            rec("a", "posting_schedule", 0.90),
            rec("low", "posting_schedule", 0.5),
            rec("c", "engagement_thresholds", 0.88),
        ];
        let out = filter_and_rank(cands, 0.8, 2);
        let actions: Vec<_> = out.iter().map(|r| (r.action.as_str(), r.confidence)).collect();
        assert_eq!(actions, vec![("b", 0.95), ("a", 0.90)]);
    }

    #[test]
    fn test_filter_drops_nan_confidence() {
        assert!(filter_and_rank(vec![rec("a", "x", f64::NAN)], 0.8, 5).is_empty());
    }

    // ===== analyses =====

    #[test]
    fn test_content_analysis_marks_insufficient() {
        let (s, store) = synth(ScriptedAdvisor::always_failing(), 50);
        store.record_content(&ContentRecord::new("thread", Utc::now())).unwrap();
        assert!(s.analyze_content_at(Utc::now()).unwrap().is_insufficient());
        assert!(s.analyze_conversions_at(Utc::now()).unwrap().is_insufficient());
        assert!(!s.analyze_timing_at(Utc::now()).unwrap().is_insufficient());
    }

    #[test]
    fn test_content_analysis_weighted_engagement() {
        let (s, store) = synth(ScriptedAdvisor::always_failing(), 2);
        let now = Utc::now();
        for (likes, comments, shares) in [(1, 1, 1), (3, 0, 0)] {
            let mut c = ContentRecord::new("thread", now);
            c.likes = likes;
            c.comments = comments;
            c.shares = shares;
            c.insight_type = Some("breakout".into());
            c.engagement_rate = 0.2;
            store.record_content(&c).unwrap();
        }
        let a = s.analyze_content_at(now).unwrap();
        let a = a.ready().unwrap();
        assert_eq!(a.format_performance["thread"].count, 2);
        assert!((a.format_performance["thread"].avg_engagement - 4.5).abs() < 1e-12);
        assert!((a.insight_performance["breakout"].avg_engagement - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_conversion_analysis_by_tier() {
        let (s, store) = synth(ScriptedAdvisor::always_failing(), 50);
        let now = Utc::now();
        let rows = [(10, AttemptStatus::Sent, false), (10, AttemptStatus::Converted, true), (20, AttemptStatus::Clicked, true)];
        for (i, (discount, status, clicked)) in rows.into_iter().enumerate() {
            store
                .record_conversion_attempt(&ConversionAttempt {
                    id: format!("a{i}"),
                    discount_percentage: discount,
                    status,
                    clicked_at: clicked.then_some(now),
                    sent_at: now,
                })
                .unwrap();
        }
        let a = s.analyze_conversions_at(now).unwrap();
        let a = a.ready().unwrap();
        assert_eq!(a.total_attempts_analyzed, 3);
        assert!((a.overall_conversion_rate - 1.0 / 3.0).abs() < 1e-12);
        assert!((a.overall_click_rate - 2.0 / 3.0).abs() < 1e-12);
        assert!((a.discount_performance[&10].conversion_rate - 0.5).abs() < 1e-12);
        assert_eq!(a.discount_performance[&20].conversions, 0);
    }

    #[test]
    fn test_timing_best_and_worst_hours() {
        let (s, store) = synth(ScriptedAdvisor::always_failing(), 50);
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 23, 30, 0).unwrap();
        for hour in 0..8u32 {
            let at = Utc.with_ymd_and_hms(2026, 3, 10, hour, 0, 0).unwrap();
            let mut c = ContentRecord::new("thread", at);
            c.engagement_rate = hour as f64 / 100.0;
            store.record_content(&c).unwrap();
        }
        let a = s.analyze_timing_at(now).unwrap();
        let a = a.ready().unwrap();
        assert_eq!(a.best_posting_hours, vec![7, 6, 5, 4, 3]);
        assert_eq!(a.worst_posting_hours, vec![2, 1, 0]);
    }

    // ===== synthesize =====

    #[tokio::test]
    async fn test_synthesize_ranks_advisor_reply() {
        let reply = r#"[
            {"action":"adjust_posting_schedule","reason":"r","adjustment":{},"expected_impact":"x","confidence":0.81},
            {"action":"shift_format_mix","component":"content_format_weights","reason":"r","adjustment":{},"expected_impact":"x","confidence":0.93},
            {"action":"weak","component":"posting_schedule","reason":"r","adjustment":{},"expected_impact":"x","confidence":0.4}
        ]"#;
        let (s, store) = synth(ScriptedAdvisor::new(vec![Ok(reply.into())]), 50);
        store.record_content(&ContentRecord::new("thread", Utc::now())).unwrap();
        let recs = s.synthesize().await.unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].action, "shift_format_mix");
        assert_eq!(recs[1].component, "posting_schedule");
    }

    #[tokio::test]
    async fn test_synthesize_advisor_failure_is_empty() {
        let (s, store) = synth(ScriptedAdvisor::always_failing(), 50);
        store.record_content(&ContentRecord::new("thread", Utc::now())).unwrap();
        assert!(s.synthesize().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_synthesize_skips_advisor_without_data() {
        let advisor = Arc::new(ScriptedAdvisor::always_failing());
        let store = Store::open_in_memory().unwrap();
        let s = RecommendationSynthesizer::new(store, advisor.clone(), StrategyTuningSettings::default());
        assert!(s.synthesize().await.unwrap().is_empty());
        assert!(advisor.purposes().is_empty());
    }
}
