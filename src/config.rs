//! # Settings
//!
//! ## Responsibility
//! Typed configuration for every component, loaded from a TOML file. Every
//! section has defaults so a missing file or a partial file is valid.
//!
//! ## Guarantees
//! - Validated: [`Settings::validate`] rejects out-of-range thresholds, zero
//!   capacities and unknown phases before any component is constructed
//! - Secret-aware: the advisory API key can be supplied via `ADVISORY_API_KEY`
//!   instead of the file
//!
//! ## NOT Responsible For
//! - Log filtering (`RUST_LOG`, read by the binary)
//! - Live reload

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OptimizerError, OptimizerResult};

/// Environment variable that overrides `advisory.api_key`.
pub const API_KEY_ENV: &str = "ADVISORY_API_KEY";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite file path, or `:memory:`.
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self { path: "optimizer.sqlite".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorySettings {
    /// When false every advisory call fails fast and fallbacks are used.
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub cooldown_secs: u64,
}

impl Default for AdvisorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.anthropic.com".into(),
            model: "claude-3-5-sonnet-20241022".into(),
            api_key: String::new(),
            connect_timeout_secs: 5,
            request_timeout_secs: 60,
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

impl AdvisorySettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbTestingSettings {
    pub min_sample_size: u64,
    pub confidence_threshold: f64,
    pub max_active_tests: usize,
    pub test_duration_days: i64,
    /// Insights below this confidence are not turned into tests.
    pub insight_min_confidence: f64,
    pub insight_lookback_hours: i64,
    pub max_new_tests_per_run: usize,
}

impl Default for AbTestingSettings {
    fn default() -> Self {
        Self {
            min_sample_size: 100,
            confidence_threshold: 0.95,
            max_active_tests: 5,
            test_duration_days: 7,
            insight_min_confidence: 0.85,
            insight_lookback_hours: 24,
            max_new_tests_per_run: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyTuningSettings {
    pub min_data_points: usize,
    pub confidence_level: f64,
    pub max_adjustments_per_run: usize,
    pub window_days: i64,
}

impl Default for StrategyTuningSettings {
    fn default() -> Self {
        Self {
            min_data_points: 50,
            confidence_level: 0.8,
            max_adjustments_per_run: 5,
            window_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    pub snapshot_retention_days: i64,
    /// Estimated production cost of one content item, in currency units.
    pub cost_per_content: f64,
    /// Daily snapshots required before trend / anomaly passes run.
    pub min_snapshots_for_analysis: usize,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            snapshot_retention_days: 90,
            cost_per_content: 0.50,
            min_snapshots_for_analysis: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackLoopSettings {
    pub optimization_cycle_hours: u64,
    pub min_confidence_for_changes: f64,
}

impl Default for FeedbackLoopSettings {
    fn default() -> Self {
        Self { optimization_cycle_hours: 24, min_confidence_for_changes: 0.85 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Rollout phase 1..=4; higher phases register more jobs.
    pub phase: u8,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { phase: 4 }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub advisory: AdvisorySettings,
    pub ab_testing: AbTestingSettings,
    pub strategy_tuning: StrategyTuningSettings,
    pub performance: PerformanceSettings,
    pub feedback_loop: FeedbackLoopSettings,
    pub scheduler: SchedulerSettings,
}

impl Settings {
    /// Parse settings from a TOML string and validate them.
    pub fn from_toml_str(text: &str) -> OptimizerResult<Self> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| OptimizerError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `path` when given, defaults otherwise, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> OptimizerResult<Self> {
        let mut settings = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| {
                    OptimizerError::Config(format!("cannot read {}: {e}", p.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                settings.advisory.api_key = key;
            }
        }
        Ok(settings)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> OptimizerResult<()> {
        fn unit(name: &str, v: f64) -> OptimizerResult<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(OptimizerError::Config(format!("{name} must be in [0, 1], got {v}")))
            }
        }

        if !(1..=4).contains(&self.scheduler.phase) {
            return Err(OptimizerError::Config(format!(
                "scheduler.phase must be 1..=4, got {}",
                self.scheduler.phase
            )));
        }
        unit("ab_testing.confidence_threshold", self.ab_testing.confidence_threshold)?;
        unit("ab_testing.insight_min_confidence", self.ab_testing.insight_min_confidence)?;
        unit("strategy_tuning.confidence_level", self.strategy_tuning.confidence_level)?;
        unit(
            "feedback_loop.min_confidence_for_changes",
            self.feedback_loop.min_confidence_for_changes,
        )?;
        if self.ab_testing.max_active_tests == 0 {
            return Err(OptimizerError::Config("ab_testing.max_active_tests must be >= 1".into()));
        }
        if self.strategy_tuning.max_adjustments_per_run == 0 {
            return Err(OptimizerError::Config(
                "strategy_tuning.max_adjustments_per_run must be >= 1".into(),
            ));
        }
        if self.advisory.failure_threshold == 0 {
            return Err(OptimizerError::Config("advisory.failure_threshold must be >= 1".into()));
        }
        if self.performance.snapshot_retention_days <= 0 {
            return Err(OptimizerError::Config(
                "performance.snapshot_retention_days must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ===== defaults =====

    #[test]
    fn test_defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.ab_testing.min_sample_size, 100);
        assert!((s.ab_testing.confidence_threshold - 0.95).abs() < 1e-12);
        assert_eq!(s.ab_testing.max_active_tests, 5);
        assert_eq!(s.ab_testing.test_duration_days, 7);
        assert_eq!(s.strategy_tuning.min_data_points, 50);
        assert!((s.strategy_tuning.confidence_level - 0.8).abs() < 1e-12);
        assert_eq!(s.strategy_tuning.max_adjustments_per_run, 5);
        assert_eq!(s.performance.snapshot_retention_days, 90);
        assert_eq!(s.feedback_loop.optimization_cycle_hours, 24);
        assert!((s.feedback_loop.min_confidence_for_changes - 0.85).abs() < 1e-12);
        assert_eq!(s.scheduler.phase, 4);
    }

    #[test]
    fn test_default_validates() {
        assert!(Settings::default().validate().is_ok());
    }

    // ===== parsing =====

    #[test]
    fn test_partial_toml_fills_defaults() {
        let s = Settings::from_toml_str("[scheduler]\nphase = 2\n").unwrap();
        assert_eq!(s.scheduler.phase, 2);
        assert_eq!(s.ab_testing.max_active_tests, 5);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(Settings::from_toml_str("").unwrap(), Settings::default());
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = Settings::from_toml_str("[scheduler\nphase = ").unwrap_err();
        assert!(matches!(err, OptimizerError::Config(_)));
    }

    #[test]
    fn test_load_reads_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[ab_testing]\nmax_active_tests = 9").unwrap();
        let s = Settings::load(Some(f.path())).unwrap();
        assert_eq!(s.ab_testing.max_active_tests, 9);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = Settings::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, OptimizerError::Config(_)));
    }

    // ===== validation =====

    #[test]
    fn test_phase_out_of_range_rejected() {
        let mut s = Settings::default();
        s.scheduler.phase = 5;
        assert!(s.validate().is_err());
        s.scheduler.phase = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_threshold_above_one_rejected() {
        let mut s = Settings::default();
        s.ab_testing.confidence_threshold = 1.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut s = Settings::default();
        s.ab_testing.max_active_tests = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_durations_from_seconds() {
        let a = AdvisorySettings::default();
        assert_eq!(a.cooldown(), Duration::from_secs(60));
        assert_eq!(a.connect_timeout(), Duration::from_secs(5));
    }
}
