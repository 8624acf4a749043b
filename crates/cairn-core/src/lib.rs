//! Cairn Core Library
//!
//! This crate provides the content-aware storage routing engine, including:
//! - Routing (multi-factor scoring, strategies, priority overlays)
//! - Online learning from reported outcomes
//! - Routing configuration with validation and atomic persistence
//! - Metrics history (SQLite) with windowed aggregates and retention
//! - Optional background metric collection and pruning
//! - Cross-process access over a local socket

pub mod background;
pub mod config;
pub mod error;
pub mod ipc;
pub mod metrics;
pub mod routing;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigManager, ConfigUpdate, EngineSettings, RoutingConfig};
    pub use crate::error::{Error, Result};
    pub use crate::routing::{
        BackendId, ContentDescriptor, RoutingDecision, RoutingManager, RoutingPriority,
        RoutingStrategy,
    };
}
