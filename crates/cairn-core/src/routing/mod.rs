//! Content-aware backend routing
//!
//! This module provides:
//! - Request and history types (content descriptors, decisions, outcomes)
//! - The seven-factor weight vector and strategy/priority transforms
//! - The scoring engine with its learned success table
//! - The routing manager façade used by in-process and remote callers

mod manager;
mod scoring;
mod types;
mod weights;

pub use manager::{RoutingInsights, RoutingManager, RoutingManagerBuilder};
pub use scoring::{BackendInsight, BackendObservations, LearnedKey, LearnedScore, ScoringEngine};
pub use types::{
    metric_names, normalize_content_type, BackendId, BackendMetric, BackendProfile,
    ContentDescriptor, MetricType, RoutingDecision, RoutingOutcome, RoutingPriority,
    RoutingStrategy, ScoredBackend, REGION_METADATA_KEY,
};
pub use weights::{
    Factor, OptimizationWeights, PriorityOverlay, WeightTransforms, WeightsUpdate,
    WEIGHT_SUM_TOLERANCE,
};
