//! Types for content-aware storage routing
//!
//! This module defines the request, decision and feedback types exchanged
//! between callers, the routing manager and the metrics store.

use std::collections::BTreeMap;
use std::path::Path;

use bincode::{Decode, Encode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Identifier of a storage backend (e.g. "s3-standard", "ipfs", "glacier")
pub type BackendId = String;

/// Metadata key carrying the caller's preferred region
pub const REGION_METADATA_KEY: &str = "region";

/// Attributes of one piece of content a caller wants to persist or fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    /// MIME-like content type (e.g. "application/pdf")
    pub content_type: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Optional content address or hash
    pub content_hash: Option<String>,
    /// Free-form metadata (filename, tags, region, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ContentDescriptor {
    /// Create a new content descriptor
    pub fn new(content_type: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            content_type: content_type.into(),
            size_bytes,
            content_hash: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the content hash
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Region requested through metadata, if any
    pub fn region(&self) -> Option<&str> {
        self.metadata.get(REGION_METADATA_KEY).map(String::as_str)
    }

    /// Normalized content type used as the learning key
    pub fn content_key(&self) -> String {
        normalize_content_type(&self.content_type)
    }

    /// Describe a file on disk: size plus SHA-256 content address
    pub async fn from_file(path: &Path, content_type: impl Into<String>) -> Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;

        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            size += read as u64;
        }

        let mut descriptor = Self::new(content_type, size).with_hash(hex::encode(hasher.finalize()));
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            descriptor = descriptor.with_metadata("filename", name);
        }
        Ok(descriptor)
    }

    /// Reject descriptors that cannot be routed
    pub fn validate(&self) -> Result<()> {
        if self.content_type.trim().is_empty() {
            return Err(Error::InvalidInput("content type must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Lowercase a content type and strip parameters ("text/html; charset=utf-8" -> "text/html")
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Which factor family drives scoring for a request
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Rank purely by content-type affinity
    ContentType,
    /// Rank purely by cost efficiency
    Cost,
    /// Rank by network quality, load and proximity
    Performance,
    /// Rank by declared reliability and learned success
    Reliability,
    /// Weighted combination of all factors
    #[default]
    Hybrid,
}

impl RoutingStrategy {
    pub const ALL: [RoutingStrategy; 5] = [
        Self::ContentType,
        Self::Cost,
        Self::Performance,
        Self::Reliability,
        Self::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentType => "content_type",
            Self::Cost => "cost",
            Self::Performance => "performance",
            Self::Reliability => "reliability",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "content_type" | "content-type" => Ok(Self::ContentType),
            "cost" => Ok(Self::Cost),
            "performance" => Ok(Self::Performance),
            "reliability" => Ok(Self::Reliability),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(Error::InvalidInput(format!("Unknown routing strategy: {}", s))),
        }
    }
}

/// Named preset that biases the weight vector before scoring
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPriority {
    #[default]
    Balanced,
    Performance,
    Cost,
    Reliability,
}

impl RoutingPriority {
    pub const ALL: [RoutingPriority; 4] =
        [Self::Balanced, Self::Performance, Self::Cost, Self::Reliability];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Performance => "performance",
            Self::Cost => "cost",
            Self::Reliability => "reliability",
        }
    }
}

impl std::fmt::Display for RoutingPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoutingPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "balanced" => Ok(Self::Balanced),
            "performance" => Ok(Self::Performance),
            "cost" => Ok(Self::Cost),
            "reliability" => Ok(Self::Reliability),
            _ => Err(Error::InvalidInput(format!("Unknown routing priority: {}", s))),
        }
    }
}

/// A backend together with the score it received for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredBackend {
    pub backend_id: BackendId,
    pub score: f64,
}

/// Result of a routing decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Decision identifier
    pub id: String,
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
    /// Selected backend
    pub backend_id: BackendId,
    /// Strategy used for scoring
    pub strategy: RoutingStrategy,
    /// Priority overlay used for scoring
    pub priority: RoutingPriority,
    /// Score of the selected backend (0.0 to 1.0)
    pub score: f64,
    /// Content type of the routed request
    pub content_type: String,
    /// Content size of the routed request
    pub content_size: u64,
    /// Remaining candidates in rank order (not persisted)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<ScoredBackend>,
}

impl RoutingDecision {
    /// Create a new routing decision stamped with a fresh id and the current time
    pub fn new(
        backend_id: impl Into<BackendId>,
        score: f64,
        strategy: RoutingStrategy,
        priority: RoutingPriority,
        content: &ContentDescriptor,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            backend_id: backend_id.into(),
            strategy,
            priority,
            score,
            content_type: content.content_type.clone(),
            content_size: content.size_bytes,
            alternatives: Vec::new(),
        }
    }

    /// Add ranked alternatives
    pub fn with_alternatives(mut self, alternatives: Vec<ScoredBackend>) -> Self {
        self.alternatives = alternatives;
        self
    }
}

/// Later-reported outcome of a routed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingOutcome {
    pub backend_id: BackendId,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub content_type: String,
    pub content_size: u64,
    pub timestamp: DateTime<Utc>,
}

impl RoutingOutcome {
    /// Create an outcome stamped with the current time
    pub fn new(backend_id: impl Into<BackendId>, content: &ContentDescriptor, success: bool) -> Self {
        Self {
            backend_id: backend_id.into(),
            success,
            duration_ms: None,
            content_type: content.content_type.clone(),
            content_size: content.size_bytes,
            timestamp: Utc::now(),
        }
    }

    /// Set the observed duration
    pub fn with_duration(mut self, duration_ms: Option<u64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Override the timestamp (used for imports and tests)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Family of a raw backend measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Performance,
    Reliability,
    Cost,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::Reliability => "reliability",
            Self::Cost => "cost",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "performance" => Ok(Self::Performance),
            "reliability" => Ok(Self::Reliability),
            "cost" => Ok(Self::Cost),
            _ => Err(Error::InvalidInput(format!("Unknown metric type: {}", s))),
        }
    }
}

/// Well-known metric names understood by the scoring engine
pub mod metric_names {
    /// Round-trip latency in milliseconds (performance)
    pub const LATENCY_MS: &str = "latency_ms";
    /// Fraction of capacity in use, 0.0 to 1.0 (performance)
    pub const UTILIZATION: &str = "utilization";
    /// 1.0 when the backend answered its probe, 0.0 otherwise (reliability)
    pub const AVAILABILITY: &str = "availability";
    /// Externally observed success rate, 0.0 to 1.0 (reliability)
    pub const SUCCESS_RATE: &str = "success_rate";
    /// Storage price in USD per GB-month (cost)
    pub const COST_PER_GB: &str = "cost_per_gb";
}

/// Raw measurement about a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendMetric {
    pub backend_id: BackendId,
    pub metric_type: MetricType,
    pub metric_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl BackendMetric {
    /// Create a metric stamped with the current time
    pub fn new(
        backend_id: impl Into<BackendId>,
        metric_type: MetricType,
        metric_name: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            backend_id: backend_id.into(),
            metric_type,
            metric_name: metric_name.into(),
            value,
            timestamp: Utc::now(),
        }
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Declared characteristics of a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendProfile {
    /// Storage price in USD per GB-month
    pub cost_per_gb: f64,
    /// Typical operation latency in milliseconds
    pub latency_ms: f64,
    /// Declared reliability (0.0 to 1.0)
    pub reliability: f64,
    /// Region the backend lives in
    pub region: Option<String>,
    /// Content types this backend is suited for ("image/png", "video/*")
    pub content_types: Vec<String>,
    /// Largest object the backend accepts
    pub max_object_size: Option<u64>,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self {
            cost_per_gb: 0.023,
            latency_ms: 100.0,
            reliability: 0.99,
            region: None,
            content_types: Vec::new(),
            max_object_size: None,
        }
    }
}

impl BackendProfile {
    /// Set pricing
    pub fn with_cost(mut self, cost_per_gb: f64) -> Self {
        self.cost_per_gb = cost_per_gb;
        self
    }

    /// Set typical latency
    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set declared reliability
    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability.clamp(0.0, 1.0);
        self
    }

    /// Set region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set content-type affinities
    pub fn with_content_types(mut self, types: &[&str]) -> Self {
        self.content_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Set maximum object size
    pub fn with_max_object_size(mut self, size: u64) -> Self {
        self.max_object_size = Some(size);
        self
    }

    /// Check that declared values are usable for scoring
    pub fn validate(&self, backend_id: &str) -> Result<()> {
        if !self.cost_per_gb.is_finite() || self.cost_per_gb < 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "backend '{}' cost_per_gb is {}, expected a non-negative number",
                backend_id, self.cost_per_gb
            )));
        }
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "backend '{}' latency_ms is {}, expected a non-negative number",
                backend_id, self.latency_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.reliability) {
            return Err(Error::InvalidConfiguration(format!(
                "backend '{}' reliability is {}, expected a value in [0, 1]",
                backend_id, self.reliability
            )));
        }
        Ok(())
    }
}
