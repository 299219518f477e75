mod clustering;
mod improver;
mod metrics;

use thiserror::Error;

pub use clustering::{Assignment, AssignmentInput, ClusteringEngine, select_nearest};
pub use improver::{PrototypeImprover, RefinementReport};
pub use metrics::{DriftMonitor, MetricsTracker, QualityReport, QualityScores, quality_scores};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("config error: {0}")]
    Config(#[from] faultline_config::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] faultline_store::StoreError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Cross-namespace or cross-dimension comparison. Never coerced.
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("candidate vector has no direction")]
    EmptyVector,
}
