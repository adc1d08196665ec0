//! Persisted entities and collaborator input records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque key/value configuration attached to an experiment variant.
pub type VariantConfig = serde_json::Map<String, serde_json::Value>;

/// Start of a lookback window of `days` ending at `now`. Saturates at the
/// earliest representable instant instead of overflowing.
pub fn days_before(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    chrono::Duration::try_days(days)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Active,
    Completed,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            _ => Self::Completed,
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregation period of a performance snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "weekly" => Self::Weekly,
            "monthly" => Self::Monthly,
            _ => Self::Daily,
        }
    }

    /// Length of the aggregation window ending at snapshot time.
    pub fn window(self) -> chrono::Duration {
        match self {
            Self::Daily => chrono::Duration::days(1),
            Self::Weekly => chrono::Duration::days(7),
            Self::Monthly => chrono::Duration::days(30),
        }
    }
}

impl std::fmt::Display for PeriodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberTier {
    Free,
    Paid,
}

impl MemberTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "paid" => Self::Paid,
            _ => Self::Free,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            _ => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Sent,
    Clicked,
    Converted,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Clicked => "clicked",
            Self::Converted => "converted",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "clicked" => Self::Clicked,
            "converted" => Self::Converted,
            _ => Self::Sent,
        }
    }
}

// ---------------------------------------------------------------------------
// Experiment entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTest {
    pub id: String,
    pub name: String,
    pub hypothesis: String,
    /// The variable under test, e.g. `headline`.
    pub variable: String,
    pub insight_id: Option<String>,
    pub asset: Option<String>,
    pub status: TestStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub winning_variant_id: Option<String>,
    pub confidence_level: Option<f64>,
    pub improvement_percentage: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentVariant {
    pub id: String,
    pub test_id: String,
    pub name: String,
    pub is_control: bool,
    pub config: VariantConfig,
    pub impressions: u64,
    pub engagement_count: u64,
    pub sample_size: u64,
    pub engagement_rate: f64,
    pub click_through_rate: f64,
    pub updated_at: DateTime<Utc>,
}

/// Input for one variant when creating a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    pub is_control: bool,
    #[serde(default)]
    pub config: VariantConfig,
}

impl VariantSpec {
    pub fn new(name: impl Into<String>, is_control: bool, config: VariantConfig) -> Self {
        Self { name: name.into(), is_control, config }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub id: String,
    pub period_type: PeriodType,
    pub snapshot_date: DateTime<Utc>,
    /// Calendar day (`YYYY-MM-DD`, UTC) the snapshot belongs to.
    pub snapshot_day: String,
    pub content_published_count: u64,
    pub avg_engagement_rate: f64,
    pub total_impressions: u64,
    pub total_clicks: u64,
    pub new_conversions: u64,
    pub total_paying_members: u64,
    pub revenue: f64,
    pub conversion_rate: f64,
    pub top_performing_format: Option<String>,
    pub top_performing_asset: Option<String>,
    pub top_performing_insight_type: Option<String>,
    pub avg_insight_confidence: f64,
}

// ---------------------------------------------------------------------------
// Action log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationAction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub component: String,
    pub parameters: serde_json::Value,
    pub rationale: String,
    pub confidence: f64,
}

/// One scheduler invocation, as recorded in the job run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunRecord {
    pub id: String,
    pub job_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub steps: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Collaborator input records
// ---------------------------------------------------------------------------

/// Engagement counters for one published content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: String,
    /// Experiment variant this content was produced under, if any.
    pub variant_id: Option<String>,
    pub format: String,
    pub asset: Option<String>,
    pub insight_type: Option<String>,
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub engagement_rate: f64,
    pub published_at: DateTime<Utc>,
}

impl ContentRecord {
    /// A record with zero counters, published at `published_at`.
    pub fn new(format: impl Into<String>, published_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            variant_id: None,
            format: format.into(),
            asset: None,
            insight_type: None,
            views: 0,
            likes: 0,
            comments: 0,
            shares: 0,
            engagement_rate: 0.0,
            published_at,
        }
    }

    /// likes + comments + shares.
    pub fn interactions(&self) -> u64 {
        self.likes + self.comments + self.shares
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightRecord {
    pub id: String,
    pub asset: String,
    pub insight_type: String,
    pub confidence: f64,
    pub is_published: bool,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub id: String,
    pub tier: MemberTier,
    pub converted_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: String,
    pub amount: f64,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionAttempt {
    pub id: String,
    pub discount_percentage: u32,
    pub status: AttemptStatus,
    pub clicked_at: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for s in [TestStatus::Active, TestStatus::Completed] {
            assert_eq!(TestStatus::from_str(s.as_str()), s);
        }
        for p in [PeriodType::Daily, PeriodType::Weekly, PeriodType::Monthly] {
            assert_eq!(PeriodType::from_str(p.as_str()), p);
        }
    }

    #[test]
    fn test_days_before_saturates() {
        let now = Utc::now();
        assert_eq!(days_before(now, 2), now - chrono::Duration::days(2));
        assert_eq!(days_before(now, i64::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_period_windows() {
        assert_eq!(PeriodType::Daily.window().num_days(), 1);
        assert_eq!(PeriodType::Weekly.window().num_days(), 7);
        assert_eq!(PeriodType::Monthly.window().num_days(), 30);
    }

    #[test]
    fn test_content_interactions() {
        let mut c = ContentRecord::new("thread", Utc::now());
        c.likes = 3;
        c.comments = 2;
        c.shares = 1;
        assert_eq!(c.interactions(), 6);
    }

    #[test]
    fn test_unknown_attempt_status_defaults_to_sent() {
        assert_eq!(AttemptStatus::from_str("bogus"), AttemptStatus::Sent);
    }

    #[test]
    fn test_period_type_serde_snake_case() {
        let json = serde_json::to_string(&PeriodType::Weekly).unwrap();
        assert_eq!(json, "\"weekly\"");
    }
}
