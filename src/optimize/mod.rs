//! Optimization components and the handle bundle that wires them together.
//!
//! Every component takes its [`Store`] and advisory handle at construction;
//! [`Services::build`] is the one place they are assembled from [`Settings`].

pub mod experiment;
pub mod feedback;
pub mod performance;
pub mod recommend;

use std::sync::Arc;

use crate::advisory::AdvisoryService;
use crate::config::Settings;
use crate::store::Store;

use experiment::ExperimentEngine;
use feedback::FeedbackCoordinator;
use performance::PerformanceTracker;
use recommend::RecommendationSynthesizer;

/// Shared handles to every optimization component.
#[derive(Clone)]
pub struct Services {
    pub store: Store,
    pub advisor: Arc<dyn AdvisoryService>,
    pub experiments: Arc<ExperimentEngine>,
    pub tracker: Arc<PerformanceTracker>,
    pub synthesizer: Arc<RecommendationSynthesizer>,
    pub coordinator: Arc<FeedbackCoordinator>,
}

impl Services {
    pub fn build(store: Store, advisor: Arc<dyn AdvisoryService>, settings: &Settings) -> Self {
        let experiments = Arc::new(ExperimentEngine::new(
            store.clone(),
            Arc::clone(&advisor),
            settings.ab_testing.clone(),
        ));
        let tracker = Arc::new(PerformanceTracker::new(
            store.clone(),
            Arc::clone(&advisor),
            settings.performance.clone(),
        ));
        let synthesizer = Arc::new(RecommendationSynthesizer::new(
            store.clone(),
            Arc::clone(&advisor),
            settings.strategy_tuning.clone(),
        ));
        let coordinator = Arc::new(FeedbackCoordinator::new(
            store.clone(),
            Arc::clone(&advisor),
            Arc::clone(&tracker),
            Arc::clone(&experiments),
            Arc::clone(&synthesizer),
            settings.feedback_loop.clone(),
            settings.strategy_tuning.max_adjustments_per_run,
        ));
        Self { store, advisor, experiments, tracker, synthesizer, coordinator }
    }
}
