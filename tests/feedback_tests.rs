//! Full optimization cycles against an in-memory store.

mod common;

use chrono::Utc;
use serde_json::json;

use adaptive_optimizer::advisory::AdvisoryPurpose;
use adaptive_optimizer::optimize::feedback::{HealthStatus, RejectReason};

use common::{seed_content, services, ScriptedAdvisor};

fn recommendations_reply() -> String {
    json!([
        {
            "action": "shift_posting_schedule",
            "component": "posting_schedule",
            "reason": "evening posts outperform",
            "adjustment": {"hours": [18, 19]},
            "expected_impact": "+10% engagement",
            "confidence": 0.92
        },
        {
            "action": "raise_discount",
            "component": "payment_processing",
            "reason": "more conversions",
            "adjustment": {"discount": 30},
            "confidence": 0.97
        },
        {
            "action": "rebalance_formats",
            "component": "content_format_weights",
            "reason": "threads do better",
            "confidence": 0.82
        },
        {
            "action": "rerank_search",
            "component": "search_ranking",
            "reason": "unrelated",
            "confidence": 0.95
        },
        {
            "action": "posting_experiment",
            "reason": "weak signal",
            "confidence": 0.5
        }
    ])
    .to_string()
}

#[tokio::test]
async fn test_cycle_applies_only_gated_recommendations() {
    let advisor = ScriptedAdvisor::new(vec![Ok(recommendations_reply())]);
    let svc = services(advisor.clone());
    seed_content(&svc.store, 60, Utc::now() - chrono::Duration::hours(2));

    let report = svc.coordinator.run_cycle().await.unwrap();

    assert_eq!(advisor.purposes(), vec![AdvisoryPurpose::Recommendations]);
    assert_eq!(report.snapshot.content_published_count, 60);
    assert_eq!(report.candidates, 4);
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].component, "posting_schedule");
    assert_eq!(report.applied[0].parameters, json!({"hours": [18, 19]}));
    assert_eq!(report.applied[0].rationale, "evening posts outperform");

    let reasons: Vec<_> = report.rejected.iter().map(|r| r.reason.clone()).collect();
    assert_eq!(
        reasons,
        vec![
            RejectReason::Denylisted { component: "payment_processing".into() },
            RejectReason::NotAllowlisted { component: "search_ranking".into() },
            RejectReason::LowConfidence { confidence: 0.82, required: 0.85 },
        ]
    );

    let history = svc.coordinator.optimization_history(7).unwrap();
    assert_eq!(history.period_days, 7);
    assert_eq!(history.total_optimizations, 1);
    assert_eq!(history.optimizations[0].action, "shift_posting_schedule");

    let status = svc.coordinator.status_snapshot();
    assert_eq!(status.cycles_completed, 1);
    assert_eq!(status.total_applied, 1);
}

#[tokio::test]
async fn test_second_cycle_same_day_reuses_snapshot() {
    let svc = services(ScriptedAdvisor::failing());
    let first = svc.coordinator.run_cycle().await.unwrap();
    let second = svc.coordinator.run_cycle().await.unwrap();
    assert_eq!(first.snapshot.id, second.snapshot.id);
    assert!(second.applied.is_empty());
}

#[tokio::test]
async fn test_health_after_cycle_is_known() {
    let svc = services(ScriptedAdvisor::failing());
    assert_eq!(svc.coordinator.system_health_score().unwrap().status, HealthStatus::Unknown);

    seed_content(&svc.store, 12, Utc::now() - chrono::Duration::hours(1));
    svc.coordinator.run_cycle().await.unwrap();

    let health = svc.coordinator.system_health_score().unwrap();
    assert_ne!(health.status, HealthStatus::Unknown);
    let components = health.components.unwrap();
    assert_eq!(components.content_production, 100.0);
    assert!(health.health_score >= 20.0);
}

#[tokio::test]
async fn test_learning_report_falls_back_to_markdown() {
    let advisor = ScriptedAdvisor::new(vec![Ok(recommendations_reply())]);
    let svc = services(advisor.clone());
    seed_content(&svc.store, 60, Utc::now() - chrono::Duration::hours(2));
    svc.coordinator.run_cycle().await.unwrap();

    let report = svc.coordinator.learning_report(7).await.unwrap();
    assert!(report.starts_with("# System Learning Report (7 days)"));
    assert!(report.contains("## Executive Summary\nPerformance Summary (7 days): 60 content published"));
    assert!(report.contains("## Optimizations Applied\n1 optimizations"));
    assert!(report.contains("## ROI\n- Revenue: $0.00"));
    assert_eq!(
        advisor.purposes(),
        vec![
            AdvisoryPurpose::Recommendations,
            AdvisoryPurpose::ExecutiveSummary,
            AdvisoryPurpose::LearningReport
        ]
    );
}
