//! # Stage: Experiment Engine
//!
//! ## Responsibility
//! Runs the A/B test lifecycle over published content: creates tests from
//! high-confidence insights, refreshes variant counters from the content
//! tagged with each variant, decides winners with a two-proportion z-test and
//! completes tests that have a winner or have run out of time.
//!
//! ## Guarantees
//! - Capacity-bounded: never more than `max_active_tests` active tests
//! - Atomic creation: a test and its variants are written in one transaction
//! - Terminal completion: a completed test is never re-evaluated
//! - Non-panicking: degenerate statistics yield zero confidence, not errors
//!
//! ## NOT Responsible For
//! - Routing content to variants (the content stage tags records)
//! - Applying winning configurations (feedback coordinator)

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{info, warn};

use crate::advisory::{extract_json_array, AdvisoryPurpose, AdvisoryRequest, AdvisoryService};
use crate::config::AbTestingSettings;
use crate::error::{OptimizerError, OptimizerResult};
use crate::models::{
    days_before, ExperimentTest, ExperimentVariant, InsightRecord, TestStatus, VariantConfig, VariantSpec,
};
use crate::store::Store;

/// Variables a new test may vary.
pub const TESTABLE_VARIABLES: [&str; 6] = [
    "headline",
    "format",
    "posting_time",
    "call_to_action",
    "emoji_usage",
    "hashtag_count",
];

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Map a z statistic onto the confidence bucket used for winner decisions.
pub fn confidence_from_z(z: f64) -> f64 {
    if z >= 2.58 {
        0.99
    } else if z >= 1.96 {
        0.95
    } else if z >= 1.645 {
        0.90
    } else {
        (z / 1.96 * 0.95).min(0.85)
    }
}

/// Two-proportion z-test confidence that the rates `cs/ct` and `vs/vt` differ.
///
/// Returns 0.0 when either total is zero or the pooled standard error is
/// zero or not finite.
pub fn two_proportion_confidence(cs: u64, ct: u64, vs: u64, vt: u64) -> f64 {
    if ct == 0 || vt == 0 {
        return 0.0;
    }
    let (cs, ct, vs, vt) = (cs as f64, ct as f64, vs as f64, vt as f64);
    let p1 = cs / ct;
    let p2 = vs / vt;
    let pooled = (cs + vs) / (ct + vt);
    let se = (pooled * (1.0 - pooled) * (1.0 / ct + 1.0 / vt)).sqrt();
    if !se.is_finite() || se == 0.0 {
        return 0.0;
    }
    confidence_from_z((p2 - p1).abs() / se)
}

/// Relative lift of `variant_rate` over `control_rate`, in percent.
pub fn improvement_pct(control_rate: f64, variant_rate: f64) -> f64 {
    if control_rate == 0.0 {
        0.0
    } else {
        (variant_rate - control_rate) / control_rate * 100.0
    }
}

/// A variant that beat the control.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Winner {
    pub variant_id: String,
    pub variant_name: String,
    pub config: VariantConfig,
    pub confidence: f64,
    pub improvement: f64,
}

/// Pick the winning variant, if any.
///
/// The control is the variant flagged `is_control`, else the first one. A
/// candidate wins when its confidence reaches `threshold` and its improvement
/// strictly exceeds every earlier candidate's (starting from zero).
pub fn evaluate_variants(
    variants: &[ExperimentVariant],
    min_sample_size: u64,
    threshold: f64,
) -> Option<Winner> {
    if variants.len() < 2 {
        return None;
    }
    let control = variants.iter().find(|v| v.is_control).unwrap_or(&variants[0]);
    if control.sample_size < min_sample_size {
        return None;
    }

    let mut best: Option<Winner> = None;
    let mut best_improvement = 0.0;
    for v in variants.iter().filter(|v| v.id != control.id) {
        if v.sample_size < min_sample_size {
            continue;
        }
        let confidence = two_proportion_confidence(
            control.engagement_count,
            control.impressions,
            v.engagement_count,
            v.impressions,
        );
        let improvement = improvement_pct(control.engagement_rate, v.engagement_rate);
        if confidence >= threshold && improvement > best_improvement {
            best_improvement = improvement;
            best = Some(Winner {
                variant_id: v.id.clone(),
                variant_name: v.name.clone(),
                config: v.config.clone(),
                confidence,
                improvement,
            });
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Outcomes / reports
// ---------------------------------------------------------------------------

/// What happened to one active test during an analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub enum TestOutcome {
    /// Completed with a winner; `insight` explains the result.
    Winner { test_id: String, winner: Winner, insight: String },
    /// Completed without a winner after the test duration elapsed.
    Inconclusive { test_id: String },
    /// Still collecting data.
    Pending { test_id: String },
}

impl TestOutcome {
    pub fn is_completed(&self) -> bool {
        !matches!(self, TestOutcome::Pending { .. })
    }
}

/// Identity of the insight a test is created for.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSubject {
    pub insight_id: Option<String>,
    pub asset: String,
    pub insight_type: String,
}

impl From<&InsightRecord> for TestSubject {
    fn from(i: &InsightRecord) -> Self {
        Self {
            insight_id: Some(i.id.clone()),
            asset: i.asset.clone(),
            insight_type: i.insight_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResults {
    pub test: ExperimentTest,
    pub variants: Vec<ExperimentVariant>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Learning {
    pub test_name: String,
    pub variable: String,
    pub winner_config: VariantConfig,
    pub improvement: f64,
    pub confidence: f64,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ExperimentEngine
// ---------------------------------------------------------------------------

pub struct ExperimentEngine {
    store: Store,
    advisor: Arc<dyn AdvisoryService>,
    config: AbTestingSettings,
}

impl ExperimentEngine {
    pub fn new(store: Store, advisor: Arc<dyn AdvisoryService>, config: AbTestingSettings) -> Self {
        Self { store, advisor, config }
    }

    pub fn config(&self) -> &AbTestingSettings {
        &self.config
    }

    /// [`evaluate_variants`] with this engine's sample size and threshold.
    pub fn evaluate(&self, variants: &[ExperimentVariant]) -> Option<Winner> {
        evaluate_variants(variants, self.config.min_sample_size, self.config.confidence_threshold)
    }

    // ----- creation -----

    pub fn create_test(
        &self,
        variable: &str,
        subject: &TestSubject,
        variants: Vec<VariantSpec>,
    ) -> OptimizerResult<ExperimentTest> {
        self.create_test_at(variable, subject, variants, Utc::now())
    }

    pub fn create_test_at(
        &self,
        variable: &str,
        subject: &TestSubject,
        variants: Vec<VariantSpec>,
        now: DateTime<Utc>,
    ) -> OptimizerResult<ExperimentTest> {
        let active = self.store.count_active_tests()?;
        if active >= self.config.max_active_tests {
            return Err(OptimizerError::CapacityExceeded {
                active,
                max: self.config.max_active_tests,
            });
        }
        validate_variants(&variants)?;

        let test = ExperimentTest {
            id: uuid::Uuid::new_v4().to_string(),
            name: format!("{}_{}_{}_test", subject.asset, subject.insight_type, variable),
            hypothesis: format!(
                "Testing different {variable} variations for {} {}",
                subject.asset, subject.insight_type
            ),
            variable: variable.to_string(),
            insight_id: subject.insight_id.clone(),
            asset: Some(subject.asset.clone()),
            status: TestStatus::Active,
            started_at: now,
            completed_at: None,
            winning_variant_id: None,
            confidence_level: None,
            improvement_percentage: None,
            updated_at: now,
        };
        let rows: Vec<ExperimentVariant> = variants
            .into_iter()
            .map(|spec| ExperimentVariant {
                id: uuid::Uuid::new_v4().to_string(),
                test_id: test.id.clone(),
                name: spec.name,
                is_control: spec.is_control,
                config: spec.config,
                impressions: 0,
                engagement_count: 0,
                sample_size: 0,
                engagement_rate: 0.0,
                click_through_rate: 0.0,
                updated_at: now,
            })
            .collect();

        self.store.insert_test_with_variants(&test, &rows)?;
        info!(
            target: "optimizer::experiment",
            test_id = %test.id,
            name = %test.name,
            variants = rows.len(),
            "experiment created"
        );
        Ok(test)
    }

    /// Turn recent high-confidence, unpublished insights into new tests until
    /// capacity is reached.
    pub async fn create_tests_from_insights(&self) -> OptimizerResult<Vec<ExperimentTest>> {
        self.create_tests_from_insights_at(Utc::now()).await
    }

    pub async fn create_tests_from_insights_at(
        &self,
        now: DateTime<Utc>,
    ) -> OptimizerResult<Vec<ExperimentTest>> {
        let cutoff = now - Duration::hours(self.config.insight_lookback_hours);
        let insights = self.store.testable_insights(
            cutoff,
            self.config.insight_min_confidence,
            self.config.max_new_tests_per_run,
        )?;
        if insights.is_empty() {
            info!(target: "optimizer::experiment", "no testable insights");
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for insight in &insights {
            let variable = {
                let mut rng = rand::thread_rng();
                TESTABLE_VARIABLES.choose(&mut rng).copied().unwrap_or("headline")
            };
            let variants = self.generate_variants(insight, variable).await;
            match self.create_test_at(variable, &TestSubject::from(insight), variants, now) {
                Ok(test) => created.push(test),
                Err(OptimizerError::CapacityExceeded { active, max }) => {
                    info!(
                        target: "optimizer::experiment",
                        active,
                        max,
                        "experiment capacity reached, deferring remaining insights"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    async fn generate_variants(&self, insight: &InsightRecord, variable: &str) -> Vec<VariantSpec> {
        let prompt = format!(
            "You are a content optimization expert. Generate 2 variations to A/B test.\n\n\
             Insight: {}\nAsset: {}\nType: {}\n\nVariable to test: {variable}\n\n\
             Generate a control variant and one test variant. Respond with a JSON array of \
             objects with keys \"name\", \"is_control\" and \"config\" (an object holding the \
             {variable} configuration).",
            insight.details, insight.asset, insight.insight_type
        );
        let parsed = match self
            .advisor
            .complete(AdvisoryRequest::new(AdvisoryPurpose::TestVariants, prompt))
            .await
        {
            Ok(text) => extract_json_array(&text).and_then(|items| {
                items
                    .into_iter()
                    .map(serde_json::from_value::<VariantSpec>)
                    .collect::<Result<Vec<_>, _>>()
                    .ok()
            }),
            Err(e) => {
                warn!(target: "optimizer::experiment", error = %e, "variant generation failed, using defaults");
                None
            }
        };
        match parsed {
            Some(v) if validate_variants(&v).is_ok() => v,
            _ => default_variants(variable),
        }
    }

    // ----- metrics -----

    /// Recompute a variant's counters from the content tagged with it.
    pub fn update_variant_metrics(&self, variant_id: &str) -> OptimizerResult<ExperimentVariant> {
        self.update_variant_metrics_at(variant_id, Utc::now())
    }

    pub fn update_variant_metrics_at(
        &self,
        variant_id: &str,
        now: DateTime<Utc>,
    ) -> OptimizerResult<ExperimentVariant> {
        let mut variant = self
            .store
            .get_variant(variant_id)?
            .ok_or_else(|| OptimizerError::NotFound(format!("variant {variant_id}")))?;
        let content = self.store.content_for_variant(variant_id)?;
        if content.is_empty() {
            return Ok(variant);
        }

        variant.impressions = content.iter().map(|c| c.views).sum();
        variant.engagement_count = content.iter().map(|c| c.interactions()).sum();
        variant.sample_size = content.len() as u64;
        if variant.impressions > 0 {
            let clicks: u64 = content.iter().map(|c| c.likes + c.shares).sum();
            variant.engagement_rate = variant.engagement_count as f64 / variant.impressions as f64;
            variant.click_through_rate = clicks as f64 / variant.impressions as f64;
        }
        variant.updated_at = now;
        self.store.save_variant(&variant)?;
        Ok(variant)
    }

    // ----- lifecycle -----

    pub async fn analyze_active_tests(&self) -> OptimizerResult<Vec<TestOutcome>> {
        self.analyze_active_tests_at(Utc::now()).await
    }

    /// Refresh, evaluate and, where decided, complete every active test.
    pub async fn analyze_active_tests_at(&self, now: DateTime<Utc>) -> OptimizerResult<Vec<TestOutcome>> {
        let tests = self.store.tests_with_status(TestStatus::Active)?;
        let mut outcomes = Vec::with_capacity(tests.len());

        for mut test in tests {
            let mut variants = Vec::new();
            for v in self.store.variants_for_test(&test.id)? {
                variants.push(self.update_variant_metrics_at(&v.id, now)?);
            }

            if let Some(winner) = self.evaluate(&variants) {
                test.status = TestStatus::Completed;
                test.completed_at = Some(now);
                test.winning_variant_id = Some(winner.variant_id.clone());
                test.confidence_level = Some(winner.confidence);
                test.improvement_percentage = Some(winner.improvement);
                test.updated_at = now;
                self.store.complete_test(&test)?;

                let insight = self.winner_insight(&test, &variants, &winner).await;
                info!(
                    target: "optimizer::experiment",
                    test_id = %test.id,
                    winner = %winner.variant_name,
                    confidence = winner.confidence,
                    improvement = winner.improvement,
                    insight = %insight,
                    "experiment completed with winner"
                );
                outcomes.push(TestOutcome::Winner { test_id: test.id, winner, insight });
            } else if (now - test.started_at).num_days() > self.config.test_duration_days {
                test.status = TestStatus::Completed;
                test.completed_at = Some(now);
                test.updated_at = now;
                self.store.complete_test(&test)?;
                info!(target: "optimizer::experiment", test_id = %test.id, "experiment inconclusive");
                outcomes.push(TestOutcome::Inconclusive { test_id: test.id });
            } else {
                outcomes.push(TestOutcome::Pending { test_id: test.id });
            }
        }
        Ok(outcomes)
    }

    async fn winner_insight(
        &self,
        test: &ExperimentTest,
        variants: &[ExperimentVariant],
        winner: &Winner,
    ) -> String {
        let fallback = format!(
            "Variant {} performed {:.1}% better than control",
            winner.variant_name, winner.improvement
        );
        let Some(control) = variants.iter().find(|v| v.is_control).or_else(|| variants.first()) else {
            return fallback;
        };
        let prompt = format!(
            "You are an A/B testing expert. Test: {}\nVariable tested: {}\n\
             Control config: {}\n- Engagement rate: {:.2}%\n\
             Winning config: {}\n- Improvement: {:.1}%\n\n\
             Provide a single-sentence insight explaining why the winning variant likely performed better.",
            test.name,
            test.variable,
            serde_json::Value::Object(control.config.clone()),
            control.engagement_rate * 100.0,
            serde_json::Value::Object(winner.config.clone()),
            winner.improvement,
        );
        match self
            .advisor
            .complete(AdvisoryRequest::new(AdvisoryPurpose::TestInsight, prompt))
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback,
            Err(e) => {
                warn!(target: "optimizer::experiment", error = %e, "insight generation failed, using fallback");
                fallback
            }
        }
    }

    // ----- queries -----

    pub fn test_results(&self, test_id: &str) -> OptimizerResult<TestResults> {
        let test = self.store.get_test(test_id).map_err(|e| match e {
            crate::store::StoreError::NotFound(what) => OptimizerError::NotFound(what),
            other => OptimizerError::Store(other),
        })?;
        let variants = self.store.variants_for_test(test_id)?;
        Ok(TestResults { test, variants })
    }

    pub fn learnings(&self, days: i64) -> OptimizerResult<Vec<Learning>> {
        self.learnings_at(days, Utc::now())
    }

    /// Completed tests with a winner whose completion falls inside the window.
    pub fn learnings_at(&self, days: i64, now: DateTime<Utc>) -> OptimizerResult<Vec<Learning>> {
        let cutoff = days_before(now, days);
        let mut out = Vec::new();
        for test in self.store.tests_completed_since(cutoff)? {
            let Some(winner_id) = test.winning_variant_id.as_deref() else {
                continue;
            };
            let winner_config = self
                .store
                .get_variant(winner_id)?
                .map(|v| v.config)
                .unwrap_or_default();
            out.push(Learning {
                test_name: test.name,
                variable: test.variable,
                winner_config,
                improvement: test.improvement_percentage.unwrap_or(0.0),
                confidence: test.confidence_level.unwrap_or(0.0),
                completed_at: test.completed_at.unwrap_or(test.updated_at),
            });
        }
        Ok(out)
    }
}

fn validate_variants(variants: &[VariantSpec]) -> OptimizerResult<()> {
    if variants.len() < 2 {
        return Err(OptimizerError::InvalidVariants(format!(
            "need at least 2 variants, got {}",
            variants.len()
        )));
    }
    let controls = variants.iter().filter(|v| v.is_control).count();
    if controls != 1 {
        return Err(OptimizerError::InvalidVariants(format!(
            "exactly one control required, got {controls}"
        )));
    }
    Ok(())
}

fn default_variants(variable: &str) -> Vec<VariantSpec> {
    let config = |value: &str| {
        let mut m = VariantConfig::new();
        m.insert(variable.to_string(), serde_json::Value::String(value.to_string()));
        m
    };
    vec![
        VariantSpec::new("control", true, config("standard")),
        VariantSpec::new("variant_a", false, config("optimized")),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
