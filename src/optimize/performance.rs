//! # Stage: Performance Tracker
//!
//! ## Responsibility
//! Rolls published content, membership and revenue up into periodic
//! [`PerformanceSnapshot`]s, then reads the daily series back for trend and
//! anomaly passes, predictions, executive summaries and ROI.
//!
//! ## Guarantees
//! - Idempotent: one snapshot per (period, UTC calendar day); a repeat call
//!   returns the stored row unchanged
//! - Bounded: snapshots older than the retention window are pruned after each
//!   new snapshot
//! - Non-panicking: empty or flat series yield `None`, never NaN
//!
//! ## NOT Responsible For
//! - Acting on trends or anomalies (feedback coordinator)
//! - Collecting raw engagement counters (content stages)

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::advisory::{extract_json_array, AdvisoryPurpose, AdvisoryRequest, AdvisoryService};
use crate::config::PerformanceSettings;
use crate::error::OptimizerResult;
use crate::models::{days_before, ContentRecord, PerformanceSnapshot, PeriodType};
use crate::store::Store;

const TREND_WINDOW_DAYS: i64 = 30;
const ANOMALY_WINDOW_DAYS: i64 = 14;
const PREDICTION_WINDOW_DAYS: i64 = 30;
const PREDICTION_POINTS: usize = 14;

// ---------------------------------------------------------------------------
// Trend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trend {
    pub direction: TrendDirection,
    pub slope: f64,
    pub change_pct: f64,
    pub significance: Significance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricTrend {
    pub metric: &'static str,
    #[serde(flatten)]
    pub trend: Trend,
}

/// Least-squares trend over a chronological series.
///
/// `None` for fewer than two points, a zero denominator, or a first-to-last
/// change under 5%.
pub fn analyze_trend(series: &[f64]) -> Option<Trend> {
    let n = series.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let sum_x: f64 = (0..n).map(|i| i as f64).sum();
    let sum_y: f64 = series.iter().sum();
    let sum_xy: f64 = series.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let sum_x2: f64 = (0..n).map(|i| (i * i) as f64).sum();
    let denom = nf * sum_x2 - sum_x * sum_x;
    if denom == 0.0 {
        return None;
    }
    let slope = (nf * sum_xy - sum_x * sum_y) / denom;

    let first = series[0];
    let last = series[n - 1];
    let change_pct = if first == 0.0 { 0.0 } else { (last - first) / first.abs() * 100.0 };
    if change_pct.abs() < 5.0 {
        return None;
    }
    Some(Trend {
        direction: if slope > 0.0 { TrendDirection::Increasing } else { TrendDirection::Decreasing },
        slope,
        change_pct,
        significance: if change_pct.abs() > 20.0 { Significance::High } else { Significance::Medium },
    })
}

// ---------------------------------------------------------------------------
// Anomaly
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyDirection {
    Spike,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub metric: String,
    pub direction: AnomalyDirection,
    pub severity: Severity,
    pub current_value: f64,
    pub expected_value: f64,
    /// z-score of the current value against the history.
    pub deviation: f64,
}

/// Z-score check of the most recent value against the rest.
///
/// `series` is most-recent-first. Needs at least three points; the history
/// is every value after the first, scored with its population std.
pub fn detect_anomaly(series: &[f64], metric: &str) -> Option<Anomaly> {
    if series.len() < 3 {
        return None;
    }
    let current = series[0];
    let history = &series[1..];
    let mean = history.iter().sum::<f64>() / history.len() as f64;
    let variance = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / history.len() as f64;
    let std = variance.sqrt();
    if std == 0.0 {
        return None;
    }
    let z = (current - mean).abs() / std;
    if z <= 2.0 {
        return None;
    }
    Some(Anomaly {
        metric: metric.to_string(),
        direction: if current > mean { AnomalyDirection::Spike } else { AnomalyDirection::Drop },
        severity: if z > 3.0 { Severity::Critical } else { Severity::Warning },
        current_value: current,
        expected_value: mean,
        deviation: z,
    })
}

// ---------------------------------------------------------------------------
// ROI
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoiMetrics {
    pub period_days: i64,
    pub total_revenue: f64,
    pub estimated_costs: f64,
    pub net_profit: f64,
    pub roi_percentage: f64,
    pub content_produced: u64,
    pub revenue_per_content: f64,
    pub conversion_attempts: u64,
    pub conversions: u64,
    pub conversion_efficiency: f64,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

/// Key of the group with the highest mean engagement rate. Ties resolve to
/// the lexicographically smallest key.
fn top_group<'a, F>(content: &'a [ContentRecord], key: F) -> Option<String>
where
    F: Fn(&'a ContentRecord) -> Option<&'a str>,
{
    let mut groups: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for c in content {
        if let Some(k) = key(c) {
            let e = groups.entry(k).or_insert((0.0, 0));
            e.0 += c.engagement_rate;
            e.1 += 1;
        }
    }
    let mut best: Option<(&str, f64)> = None;
    for (k, (sum, n)) in groups {
        let m = sum / n as f64;
        if best.map_or(true, |(_, b)| m > b) {
            best = Some((k, m));
        }
    }
    best.map(|(k, _)| k.to_string())
}

// ---------------------------------------------------------------------------
// PerformanceTracker
// ---------------------------------------------------------------------------

pub struct PerformanceTracker {
    store: Store,
    advisor: Arc<dyn AdvisoryService>,
    config: PerformanceSettings,
}

impl PerformanceTracker {
    pub fn new(store: Store, advisor: Arc<dyn AdvisoryService>, config: PerformanceSettings) -> Self {
        Self { store, advisor, config }
    }

    pub fn create_snapshot(&self, period: PeriodType) -> OptimizerResult<PerformanceSnapshot> {
        self.create_snapshot_at(period, Utc::now())
    }

    /// Aggregate the `period` window ending at `now` into a snapshot, or
    /// return today's existing snapshot for that period.
    pub fn create_snapshot_at(
        &self,
        period: PeriodType,
        now: DateTime<Utc>,
    ) -> OptimizerResult<PerformanceSnapshot> {
        let day = now.format("%Y-%m-%d").to_string();
        if let Some(existing) = self.store.snapshot_for_day(period, &day)? {
            info!(target: "optimizer::performance", period = %period, day = %day, "snapshot already exists");
            return Ok(existing);
        }

        let cutoff = now - period.window();
        let content = self.store.content_since(cutoff)?;
        let (total_members, total_paying) = self.store.member_counts()?;
        let new_conversions = self.store.conversions_since(cutoff)?;
        let revenue = self.store.active_revenue()?;
        let insights = self.store.insights_since(cutoff)?;

        let snapshot = PerformanceSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            period_type: period,
            snapshot_date: now,
            snapshot_day: day,
            content_published_count: content.len() as u64,
            avg_engagement_rate: mean(content.iter().map(|c| c.engagement_rate)),
            total_impressions: content.iter().map(|c| c.views).sum(),
            total_clicks: content.iter().map(|c| c.interactions()).sum(),
            new_conversions,
            total_paying_members: total_paying,
            revenue,
            conversion_rate: if total_members == 0 {
                0.0
            } else {
                new_conversions as f64 / total_members as f64
            },
            top_performing_format: top_group(&content, |c| Some(c.format.as_str())),
            top_performing_asset: top_group(&content, |c| c.asset.as_deref()),
            top_performing_insight_type: top_group(&content, |c| c.insight_type.as_deref()),
            avg_insight_confidence: mean(insights.iter().map(|i| i.confidence)),
        };

        let stored = self.store.insert_snapshot(&snapshot)?;
        let pruned = self
            .store
            .prune_snapshots(now - Duration::days(self.config.snapshot_retention_days))?;
        info!(
            target: "optimizer::performance",
            period = %period,
            content = stored.content_published_count,
            engagement = stored.avg_engagement_rate,
            pruned,
            "snapshot created"
        );
        Ok(stored)
    }

    // ----- stored-series passes -----

    pub fn analyze_trends(&self) -> OptimizerResult<Option<Vec<MetricTrend>>> {
        self.analyze_trends_at(Utc::now())
    }

    /// Trends over the last 30 daily snapshots. `None` when there are too few
    /// snapshots to say anything.
    pub fn analyze_trends_at(&self, now: DateTime<Utc>) -> OptimizerResult<Option<Vec<MetricTrend>>> {
        let snaps = self.store.snapshots_since(
            PeriodType::Daily,
            now - Duration::days(TREND_WINDOW_DAYS),
            false,
            None,
        )?;
        if snaps.len() < self.config.min_snapshots_for_analysis {
            info!(target: "optimizer::performance", snapshots = snaps.len(), "insufficient data for trends");
            return Ok(None);
        }
        let series: [(&'static str, Vec<f64>); 3] = [
            ("engagement_rate", snaps.iter().map(|s| s.avg_engagement_rate).collect()),
            ("conversion_rate", snaps.iter().map(|s| s.conversion_rate).collect()),
            ("revenue", snaps.iter().map(|s| s.revenue).collect()),
        ];
        Ok(Some(
            series
                .into_iter()
                .filter_map(|(metric, values)| analyze_trend(&values).map(|trend| MetricTrend { metric, trend }))
                .collect(),
        ))
    }

    pub fn detect_anomalies(&self) -> OptimizerResult<Option<Vec<Anomaly>>> {
        self.detect_anomalies_at(Utc::now())
    }

    /// Anomalies in the last 14 daily snapshots, most recent first.
    pub fn detect_anomalies_at(&self, now: DateTime<Utc>) -> OptimizerResult<Option<Vec<Anomaly>>> {
        let snaps = self.store.snapshots_since(
            PeriodType::Daily,
            now - Duration::days(ANOMALY_WINDOW_DAYS),
            true,
            None,
        )?;
        if snaps.len() < self.config.min_snapshots_for_analysis {
            info!(target: "optimizer::performance", snapshots = snaps.len(), "insufficient data for anomalies");
            return Ok(None);
        }
        let engagement: Vec<f64> = snaps.iter().map(|s| s.avg_engagement_rate).collect();
        let conversion: Vec<f64> = snaps.iter().map(|s| s.conversion_rate).collect();
        let found: Vec<Anomaly> = [
            detect_anomaly(&engagement, "engagement_rate"),
            detect_anomaly(&conversion, "conversion_rate"),
        ]
        .into_iter()
        .flatten()
        .collect();
        for a in &found {
            warn!(
                target: "optimizer::performance",
                metric = %a.metric,
                severity = ?a.severity,
                current = a.current_value,
                expected = a.expected_value,
                "performance anomaly"
            );
        }
        Ok(Some(found))
    }

    // ----- advisory-backed reports -----

    pub async fn predictions(&self) -> OptimizerResult<Vec<Value>> {
        self.predictions_at(Utc::now()).await
    }

    /// Forward-looking predictions from the 14 most recent daily snapshots.
    /// Empty when data is short or the advisory call fails.
    pub async fn predictions_at(&self, now: DateTime<Utc>) -> OptimizerResult<Vec<Value>> {
        let snaps = self.store.snapshots_since(
            PeriodType::Daily,
            now - Duration::days(PREDICTION_WINDOW_DAYS),
            true,
            Some(PREDICTION_WINDOW_DAYS as usize),
        )?;
        if snaps.len() < self.config.min_snapshots_for_analysis {
            info!(target: "optimizer::performance", snapshots = snaps.len(), "insufficient data for predictions");
            return Ok(Vec::new());
        }
        let window: Vec<Value> = snaps
            .iter()
            .take(PREDICTION_POINTS)
            .map(|s| {
                json!({
                    "date": s.snapshot_day,
                    "content_count": s.content_published_count,
                    "engagement_rate": s.avg_engagement_rate,
                    "conversions": s.new_conversions,
                    "revenue": s.revenue,
                })
            })
            .collect();
        let prompt = format!(
            "You are a data scientist analyzing performance metrics for a content business. \
             Based on the last 14 days of data, provide 2-3 actionable predictions for the next 7 days.\n\n\
             Performance data (most recent first):\n{}\n\n\
             Respond with a JSON array of objects with keys \"prediction\", \"confidence\", \
             \"recommendation\" and \"expected_impact\".",
            Value::Array(window)
        );
        match self
            .advisor
            .complete(AdvisoryRequest::new(AdvisoryPurpose::Predictions, prompt))
            .await
        {
            Ok(text) => Ok(extract_json_array(&text).unwrap_or_else(|| {
                warn!(target: "optimizer::performance", "predictions reply was not a JSON array");
                Vec::new()
            })),
            Err(e) => {
                warn!(target: "optimizer::performance", error = %e, "predictions unavailable");
                Ok(Vec::new())
            }
        }
    }

    pub async fn executive_summary(&self, days: i64) -> OptimizerResult<String> {
        self.executive_summary_at(days, Utc::now()).await
    }

    pub async fn executive_summary_at(&self, days: i64, now: DateTime<Utc>) -> OptimizerResult<String> {
        let snaps = self.store.snapshots_since(PeriodType::Daily, days_before(now, days), true, None)?;
        if snaps.is_empty() {
            return Ok("Insufficient data for executive summary.".to_string());
        }
        let total_content: u64 = snaps.iter().map(|s| s.content_published_count).sum();
        let avg_engagement = mean(snaps.iter().map(|s| s.avg_engagement_rate));
        let total_conversions: u64 = snaps.iter().map(|s| s.new_conversions).sum();
        let total_revenue: f64 = snaps.iter().map(|s| s.revenue).sum();

        let fallback = format!(
            "Performance Summary ({days} days): {total_content} content published, \
             {:.2}% avg engagement, {total_conversions} conversions, ${total_revenue:.2} revenue",
            avg_engagement * 100.0
        );

        let trends = self.analyze_trends_at(now)?.unwrap_or_default();
        let anomalies = self.detect_anomalies_at(now)?.unwrap_or_default();
        let prompt = format!(
            "You are a business analyst. Generate a concise executive summary report.\n\n\
             Period: last {days} days\nTotal content published: {total_content}\n\
             Average engagement rate: {:.2}%\nTotal conversions: {total_conversions}\n\
             Total revenue: ${total_revenue:.2}\n\nTrends:\n{}\n\nAnomalies:\n{}\n\n\
             Write three short paragraphs: highlights, key trends, next steps.",
            avg_engagement * 100.0,
            serde_json::to_string(&trends).unwrap_or_default(),
            serde_json::to_string(&anomalies).unwrap_or_default(),
        );
        match self
            .advisor
            .complete(AdvisoryRequest::new(AdvisoryPurpose::ExecutiveSummary, prompt))
            .await
        {
            Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(_) => Ok(fallback),
            Err(e) => {
                warn!(target: "optimizer::performance", error = %e, "executive summary fallback");
                Ok(fallback)
            }
        }
    }

    pub fn roi_metrics(&self, days: i64) -> OptimizerResult<RoiMetrics> {
        self.roi_metrics_at(days, Utc::now())
    }

    pub fn roi_metrics_at(&self, days: i64, now: DateTime<Utc>) -> OptimizerResult<RoiMetrics> {
        let cutoff = days_before(now, days);
        let (conversions, revenue) = self.store.active_subscriptions_since(cutoff)?;
        let content_produced = self.store.content_since(cutoff)?.len() as u64;
        let attempts = self.store.conversion_attempts_since(cutoff)?.len() as u64;
        let costs = content_produced as f64 * self.config.cost_per_content;

        Ok(RoiMetrics {
            period_days: days,
            total_revenue: revenue,
            estimated_costs: costs,
            net_profit: revenue - costs,
            roi_percentage: if costs > 0.0 { (revenue - costs) / costs * 100.0 } else { 0.0 },
            content_produced,
            revenue_per_content: if content_produced > 0 { revenue / content_produced as f64 } else { 0.0 },
            conversion_attempts: attempts,
            conversions,
            conversion_efficiency: if attempts > 0 {
                conversions as f64 / attempts as f64 * 100.0
            } else {
                0.0
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::testing::ScriptedAdvisor;
    use crate::models::{
        AttemptStatus, ConversionAttempt, MemberRecord, MemberTier, SubscriptionRecord,
        SubscriptionStatus,
    };
    use rstest::rstest;

    fn tracker(advisor: ScriptedAdvisor) -> (PerformanceTracker, Store) {
        let store = Store::open_in_memory().unwrap();
        let t = PerformanceTracker::new(store.clone(), Arc::new(advisor), PerformanceSettings::default());
        (t, store)
    }

    fn content(format: &str, rate: f64, at: DateTime<Utc>) -> ContentRecord {
        let mut c = ContentRecord::new(format, at);
        c.engagement_rate = rate;
        c.views = 100;
        c.likes = 5;
        c.comments = 2;
        c.shares = 1;
        c
    }

    /// Store one daily snapshot per day for `rates.len()` days ending at
    /// `now`, oldest first.
    fn seed_daily(store: &Store, now: DateTime<Utc>, rates: &[f64]) {
        let n = rates.len() as i64;
        for (i, rate) in rates.iter().enumerate() {
            let at = now - Duration::days(n - 1 - i as i64);
            store
                .insert_snapshot(&PerformanceSnapshot {
                    id: uuid::Uuid::new_v4().to_string(),
                    period_type: PeriodType::Daily,
                    snapshot_date: at,
                    snapshot_day: at.format("%Y-%m-%d").to_string(),
                    content_published_count: 2,
                    avg_engagement_rate: *rate,
                    total_impressions: 0,
                    total_clicks: 0,
                    new_conversions: 1,
                    total_paying_members: 0,
                    revenue: 10.0,
                    conversion_rate: 0.1,
                    top_performing_format: None,
                    top_performing_asset: None,
                    top_performing_insight_type: None,
                    avg_insight_confidence: 0.0,
                })
                .unwrap();
        }
    }

    // ===== trend =====

    #[test]
    fn test_steady_rise_is_high_increasing() {
        let t = analyze_trend(&[1.0, 1.2, 1.4, 1.6, 1.8, 2.0]).unwrap();
        assert_eq!(t.direction, TrendDirection::Increasing);
        assert_eq!(t.significance, Significance::High);
        assert!((t.change_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_series_has_no_trend() {
        assert!(analyze_trend(&[1.0, 1.01, 1.02, 1.01, 1.0, 1.01]).is_none());
    }

    #[rstest]
    #[case(&[])]
    #[case(&[1.0])]
    fn test_short_series_has_no_trend(#[case] series: &[f64]) {
        assert!(analyze_trend(series).is_none());
    }

    #[test]
    fn test_moderate_decline_is_medium() {
        let t = analyze_trend(&[1.0, 0.95, 0.9]).unwrap();
        assert_eq!(t.direction, TrendDirection::Decreasing);
        assert_eq!(t.significance, Significance::Medium);
    }

    #[test]
    fn test_zero_first_value_means_no_trend() {
        assert!(analyze_trend(&[0.0, 5.0, 10.0]).is_none());
    }

    // ===== anomaly =====

    #[test]
    fn test_spike_detected() {
        let a = detect_anomaly(&[5.0, 1.0, 1.1, 1.0, 1.1, 1.0], "x").unwrap();
        assert_eq!(a.direction, AnomalyDirection::Spike);
        assert_eq!(a.severity, Severity::Critical);
        assert_eq!(a.metric, "x");
        assert!((a.current_value - 5.0).abs() < 1e-12);
        assert!((a.expected_value - 1.04).abs() < 1e-9);
    }

    #[test]
    fn test_drop_detected() {
        let a = detect_anomaly(&[0.0, 1.0, 1.1, 1.0, 1.1, 1.0], "x").unwrap();
        assert_eq!(a.direction, AnomalyDirection::Drop);
    }

    #[test]
    fn test_flat_history_no_anomaly() {
        assert!(detect_anomaly(&[9.0, 1.0, 1.0, 1.0], "x").is_none());
    }

    #[test]
    fn test_anomaly_needs_three_points() {
        assert!(detect_anomaly(&[9.0, 1.0], "x").is_none());
    }

    #[test]
    fn test_within_two_sigma_not_anomalous() {
        assert!(detect_anomaly(&[1.1, 1.0, 1.2, 1.0, 1.2], "x").is_none());
    }

    // ===== snapshot =====

    #[test]
    fn test_snapshot_aggregates_window() {
        let (t, store) = tracker(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        store.record_content(&content("thread", 0.10, now - Duration::hours(2))).unwrap();
        store.record_content(&content("thread", 0.20, now - Duration::hours(3))).unwrap();
        store.record_content(&content("image", 0.12, now - Duration::hours(1))).unwrap();
        // Outside the daily window.
        store.record_content(&content("video", 0.90, now - Duration::days(3))).unwrap();
        store
            .record_member(&MemberRecord {
                id: "m1".into(),
                tier: MemberTier::Paid,
                converted_at: Some(now - Duration::hours(5)),
                joined_at: now - Duration::days(20),
            })
            .unwrap();
        store
            .record_member(&MemberRecord {
                id: "m2".into(),
                tier: MemberTier::Free,
                converted_at: None,
                joined_at: now - Duration::days(20),
            })
            .unwrap();
        store
            .record_subscription(&SubscriptionRecord {
                id: "s1".into(),
                amount: 29.0,
                status: SubscriptionStatus::Active,
                created_at: now - Duration::days(40),
            })
            .unwrap();

        let s = t.create_snapshot_at(PeriodType::Daily, now).unwrap();
        assert_eq!(s.content_published_count, 3);
        assert_eq!(s.total_impressions, 300);
        assert_eq!(s.total_clicks, 24);
        assert!((s.avg_engagement_rate - 0.14).abs() < 1e-9);
        assert_eq!(s.top_performing_format.as_deref(), Some("thread"));
        assert_eq!(s.new_conversions, 1);
        assert_eq!(s.total_paying_members, 1);
        assert!((s.conversion_rate - 0.5).abs() < 1e-12);
        assert!((s.revenue - 29.0).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_same_day_returns_identical_row() {
        let (t, store) = tracker(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        let first = t.create_snapshot_at(PeriodType::Weekly, now).unwrap();
        store.record_content(&content("thread", 0.5, now)).unwrap();
        let second = t.create_snapshot_at(PeriodType::Weekly, now).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_snapshot_prunes_old_rows() {
        let (t, store) = tracker(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        seed_daily(&store, now - Duration::days(120), &[0.1]);
        t.create_snapshot_at(PeriodType::Daily, now).unwrap();
        let all = store
            .snapshots_since(PeriodType::Daily, now - Duration::days(365), true, None)
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    // ===== stored passes =====

    #[test]
    fn test_trends_need_seven_snapshots() {
        let (t, store) = tracker(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        seed_daily(&store, now, &[0.1, 0.2, 0.3]);
        assert!(t.analyze_trends_at(now).unwrap().is_none());
    }

    #[test]
    fn test_trends_over_rising_engagement() {
        let (t, store) = tracker(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        seed_daily(&store, now, &[0.10, 0.11, 0.12, 0.13, 0.14, 0.15, 0.16, 0.17]);
        let trends = t.analyze_trends_at(now).unwrap().unwrap();
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].metric, "engagement_rate");
        assert_eq!(trends[0].trend.direction, TrendDirection::Increasing);
    }

    #[test]
    fn test_anomalies_flag_latest_spike() {
        let (t, store) = tracker(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        seed_daily(&store, now, &[0.10, 0.11, 0.10, 0.11, 0.10, 0.11, 0.10, 0.60]);
        let found = t.detect_anomalies_at(now).unwrap().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metric, "engagement_rate");
        assert_eq!(found[0].direction, AnomalyDirection::Spike);
    }

    // ===== advisory-backed =====

    #[tokio::test]
    async fn test_predictions_parse_advisor_array() {
        let reply = "Sure:\n[{\"prediction\": \"up\", \"confidence\": 0.7}]";
        let (t, store) = tracker(ScriptedAdvisor::new(vec![Ok(reply.into())]));
        let now = Utc::now();
        seed_daily(&store, now, &[0.1; 8]);
        let p = t.predictions_at(now).await.unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p[0]["prediction"], "up");
    }

    #[tokio::test]
    async fn test_predictions_empty_on_failure_or_short_data() {
        let (t, store) = tracker(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        seed_daily(&store, now, &[0.1; 3]);
        assert!(t.predictions_at(now).await.unwrap().is_empty());
        seed_daily(&store, now - Duration::days(3), &[0.1; 8]);
        assert!(t.predictions_at(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_executive_summary_fallback_text() {
        let (t, store) = tracker(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        seed_daily(&store, now, &[0.05, 0.07]);
        let s = t.executive_summary_at(7, now).await.unwrap();
        assert_eq!(
            s,
            "Performance Summary (7 days): 4 content published, 6.00% avg engagement, 2 conversions, $20.00 revenue"
        );
    }

    #[tokio::test]
    async fn test_executive_summary_without_data() {
        let (t, _) = tracker(ScriptedAdvisor::always_failing());
        assert_eq!(t.executive_summary(7).await.unwrap(), "Insufficient data for executive summary.");
    }

    // ===== roi =====

    #[test]
    fn test_roi_metrics() {
        let (t, store) = tracker(ScriptedAdvisor::always_failing());
        let now = Utc::now();
        for i in 0..4 {
            store.record_content(&content("thread", 0.1, now - Duration::days(i))).unwrap();
            store
                .record_conversion_attempt(&ConversionAttempt {
                    id: format!("a{i}"),
                    discount_percentage: 20,
                    status: AttemptStatus::Sent,
                    clicked_at: None,
                    sent_at: now - Duration::days(i),
                })
                .unwrap();
        }
        store
            .record_subscription(&SubscriptionRecord {
                id: "s1".into(),
                amount: 10.0,
                status: SubscriptionStatus::Active,
                created_at: now - Duration::days(1),
            })
            .unwrap();
        let roi = t.roi_metrics_at(30, now).unwrap();
        assert_eq!(roi.content_produced, 4);
        assert!((roi.estimated_costs - 2.0).abs() < 1e-12);
        assert!((roi.roi_percentage - 400.0).abs() < 1e-9);
        assert!((roi.net_profit - 8.0).abs() < 1e-12);
        assert!((roi.conversion_efficiency - 25.0).abs() < 1e-9);
        assert!((roi.revenue_per_content - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_roi_without_costs_is_zero() {
        let (t, _) = tracker(ScriptedAdvisor::always_failing());
        let roi = t.roi_metrics(30).unwrap();
        assert_eq!(roi.roi_percentage, 0.0);
        assert_eq!(roi.conversion_efficiency, 0.0);
    }
}
