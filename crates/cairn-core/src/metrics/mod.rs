//! Routing history: durable store and the asynchronous writer in front of it

mod recorder;
mod store;

pub use recorder::{MetricsRecorder, RecorderStats};
pub use store::{
    LatencyStats, MetricsStore, PruneReport, RowCounts, SuccessRate, UsageStats,
    CREATE_METRICS_TABLES_SQL,
};
