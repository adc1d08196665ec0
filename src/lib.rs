//! Adaptive optimization loop for a content and monetization pipeline.
//!
//! ```text
//! Store ──► PerformanceTracker ──► snapshots, trends, anomalies
//!   │
//!   ├────► ExperimentEngine ─────► A/B tests, winners, learnings
//!   │
//!   └────► RecommendationSynthesizer ──► candidates
//!                                           │
//!               FeedbackCoordinator ◄───────┘  (gate + apply + log)
//!                        ▲
//!               PipelineScheduler (phased jobs)
//! ```

pub mod advisory;
pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod optimize;
pub mod scheduler;
pub mod store;

pub use error::{OptimizerError, OptimizerResult};
pub use optimize::Services;
