//! Multi-factor scoring with online learning from outcomes
//!
//! ## Algorithm Overview
//!
//! For every candidate backend the engine computes seven normalized factor
//! values in `[0, 1]` and combines them with the effective weight vector:
//!
//! ```text
//! score(b) = Σ weight[f] × value[f, b]
//! ```
//!
//! `historical_success` is an exponential moving average of outcomes per
//! (backend, content type):
//!
//! ```text
//! ema_new = ema_old × (1 − α) + outcome × α      outcome ∈ {0.0, 1.0}
//! ```
//!
//! The highest score wins. Equal scores are resolved by backend id so the
//! same inputs always produce the same ranking.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{
    metric_names, normalize_content_type, BackendId, BackendMetric, BackendProfile,
    ContentDescriptor, MetricType, RoutingPriority, RoutingStrategy, ScoredBackend,
};
use super::weights::{Factor, OptimizationWeights, WeightTransforms};
use crate::config::{RoutingConfig, ScoringTuning};
use crate::error::{Error, Result};

/// Content-match value for an exact affinity
const EXACT_MATCH: f64 = 1.0;
/// Content-match value for a `type/*` affinity
const WILDCARD_MATCH: f64 = 0.75;
/// Content-match value for generalist backends
const NO_AFFINITY: f64 = 0.5;
/// Content-match value for a declared mismatch
const MISMATCH: f64 = 0.1;

/// Key of the learned-score table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LearnedKey {
    pub backend_id: BackendId,
    pub content_type: String,
}

impl LearnedKey {
    pub fn new(backend_id: impl Into<BackendId>, content_type: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            content_type: content_type.into(),
        }
    }
}

/// Learned success estimate for a (backend, content type) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedScore {
    /// Exponential moving average of outcomes (0.0 to 1.0)
    pub ema: f64,
    pub samples: u64,
    pub successes: u64,
    pub failures: u64,
    pub updated_at: DateTime<Utc>,
}

impl LearnedScore {
    /// Fresh entry seeded at the neutral score
    pub fn seeded(neutral_score: f64) -> Self {
        Self {
            ema: neutral_score.clamp(0.0, 1.0),
            samples: 0,
            successes: 0,
            failures: 0,
            updated_at: Utc::now(),
        }
    }

    /// Fold one outcome into the average
    pub fn observe(&mut self, success: bool, learning_rate: f64) {
        let outcome = if success { 1.0 } else { 0.0 };
        let alpha = learning_rate.clamp(0.0, 1.0);
        self.ema = (self.ema * (1.0 - alpha) + outcome * alpha).clamp(0.0, 1.0);
        self.samples += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.updated_at = Utc::now();
    }
}

/// Live measurements about a backend, independent of content type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendObservations {
    /// Moving average of observed latency
    pub latency_ema_ms: Option<f64>,
    /// Moving average of probe availability (0.0 to 1.0)
    pub availability: Option<f64>,
    /// Last reported utilization (0.0 to 1.0)
    pub utilization: Option<f64>,
    /// Last externally reported success rate (0.0 to 1.0)
    pub success_rate: Option<f64>,
    /// Last reported price, overriding the declared one
    pub cost_per_gb: Option<f64>,
}

fn ema(previous: Option<f64>, value: f64, alpha: f64) -> f64 {
    match previous {
        Some(prev) => prev * (1.0 - alpha) + value * alpha,
        None => value,
    }
}

/// Everything known about a backend, for insights
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendInsight {
    /// Learned score per content type
    pub learned: BTreeMap<String, LearnedScore>,
    pub observations: BackendObservations,
}

/// Scoring and learning engine
///
/// Owns the learned-score table. Entries are updated under per-entry locks
/// of the sharded map, so outcomes for different backends never contend.
#[derive(Debug, Default)]
pub struct ScoringEngine {
    transforms: WeightTransforms,
    learned: DashMap<LearnedKey, LearnedScore>,
    observations: DashMap<BackendId, BackendObservations>,
}

impl ScoringEngine {
    /// Create an engine with the default transform table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine with a custom transform table
    pub fn with_transforms(transforms: WeightTransforms) -> Self {
        Self {
            transforms,
            ..Default::default()
        }
    }

    pub fn transforms(&self) -> &WeightTransforms {
        &self.transforms
    }

    /// Effective weight vector for a strategy/priority pair
    pub fn effective_weights(
        &self,
        config: &RoutingConfig,
        strategy: RoutingStrategy,
        priority: RoutingPriority,
    ) -> OptimizationWeights {
        self.transforms
            .effective(&config.optimization_weights, strategy, priority)
    }

    /// Rank candidates, best first
    pub fn rank(
        &self,
        config: &RoutingConfig,
        content: &ContentDescriptor,
        candidates: &[BackendId],
        strategy: RoutingStrategy,
        priority: RoutingPriority,
    ) -> Result<Vec<ScoredBackend>> {
        if candidates.is_empty() {
            return Err(Error::NoBackendsAvailable(format!(
                "no candidate backend for content type '{}'",
                content.content_type
            )));
        }

        let weights = self.effective_weights(config, strategy, priority);

        let mut ranked: Vec<ScoredBackend> = candidates
            .iter()
            .map(|backend_id| {
                let values = self.factor_values(config, content, backend_id);
                let score = Factor::ALL
                    .iter()
                    .map(|f| weights.get(*f) * values.get(f).copied().unwrap_or_default())
                    .sum::<f64>()
                    .clamp(0.0, 1.0);
                ScoredBackend {
                    backend_id: backend_id.clone(),
                    score,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.backend_id.cmp(&b.backend_id))
        });

        Ok(ranked)
    }

    /// Normalized factor values of one backend for one request
    pub fn factor_values(
        &self,
        config: &RoutingConfig,
        content: &ContentDescriptor,
        backend_id: &str,
    ) -> BTreeMap<Factor, f64> {
        let profile = config.profile(backend_id);
        let tuning = &config.tuning;
        let observed = self
            .observations
            .get(backend_id)
            .map(|o| o.value().clone())
            .unwrap_or_default();
        let learned = self
            .learned
            .get(&LearnedKey::new(backend_id, content.content_key()))
            .map(|entry| entry.ema)
            .unwrap_or(tuning.neutral_score);

        let mut values = BTreeMap::new();
        values.insert(Factor::NetworkQuality, network_quality(&profile, &observed, tuning));
        values.insert(Factor::ContentMatch, content_match(&profile, content));
        values.insert(Factor::CostEfficiency, cost_efficiency(&profile, &observed, tuning));
        values.insert(
            Factor::GeographicProximity,
            geographic_proximity(&profile, content, tuning),
        );
        values.insert(
            Factor::LoadBalancing,
            1.0 - observed.utilization.unwrap_or(0.5),
        );
        values.insert(Factor::Reliability, reliability(&profile, &observed));
        values.insert(Factor::HistoricalSuccess, learned);

        for value in values.values_mut() {
            *value = value.clamp(0.0, 1.0);
        }
        values
    }

    /// Absorb an outcome report
    ///
    /// Returns the updated learned score.
    pub fn record_outcome(
        &self,
        backend_id: &str,
        content_type: &str,
        success: bool,
        duration_ms: Option<u64>,
        tuning: &ScoringTuning,
    ) -> LearnedScore {
        let key = LearnedKey::new(backend_id, normalize_content_type(content_type));
        let updated = {
            let mut entry = self
                .learned
                .entry(key)
                .or_insert_with(|| LearnedScore::seeded(tuning.neutral_score));
            entry.observe(success, tuning.learning_rate);
            entry.value().clone()
        };

        if let Some(duration) = duration_ms {
            let mut observed = self.observations.entry(backend_id.to_string()).or_default();
            observed.latency_ema_ms = Some(ema(
                observed.latency_ema_ms,
                duration as f64,
                tuning.learning_rate,
            ));
        }

        debug!(
            backend_id = %backend_id,
            content_type = %content_type,
            success = success,
            ema = updated.ema,
            "Updated learned score"
        );
        updated
    }

    /// Absorb a raw backend measurement
    ///
    /// Returns `false` for metrics the engine does not use.
    pub fn observe_metric(&self, metric: &BackendMetric, tuning: &ScoringTuning) -> bool {
        if !metric.value.is_finite() {
            return false;
        }
        let alpha = tuning.learning_rate;
        let mut observed = self
            .observations
            .entry(metric.backend_id.clone())
            .or_default();

        match (metric.metric_type, metric.metric_name.as_str()) {
            (MetricType::Performance, metric_names::LATENCY_MS) => {
                observed.latency_ema_ms =
                    Some(ema(observed.latency_ema_ms, metric.value.max(0.0), alpha));
            }
            (MetricType::Performance, metric_names::UTILIZATION) => {
                observed.utilization = Some(metric.value.clamp(0.0, 1.0));
            }
            (MetricType::Reliability, metric_names::AVAILABILITY) => {
                observed.availability = Some(ema(
                    observed.availability,
                    metric.value.clamp(0.0, 1.0),
                    alpha,
                ));
            }
            (MetricType::Reliability, metric_names::SUCCESS_RATE) => {
                observed.success_rate = Some(metric.value.clamp(0.0, 1.0));
            }
            (MetricType::Cost, metric_names::COST_PER_GB) => {
                observed.cost_per_gb = Some(metric.value.max(0.0));
            }
            _ => return false,
        }
        true
    }

    /// Learned score for a pair, if any outcome has been seen
    pub fn learned_score(&self, backend_id: &str, content_type: &str) -> Option<LearnedScore> {
        self.learned
            .get(&LearnedKey::new(
                backend_id,
                normalize_content_type(content_type),
            ))
            .map(|entry| entry.value().clone())
    }

    /// Live observations for a backend
    pub fn observations(&self, backend_id: &str) -> Option<BackendObservations> {
        self.observations.get(backend_id).map(|o| o.value().clone())
    }

    /// Per-backend snapshot of everything learned
    pub fn snapshot(&self) -> BTreeMap<BackendId, BackendInsight> {
        let mut insights: BTreeMap<BackendId, BackendInsight> = BTreeMap::new();
        for entry in self.learned.iter() {
            insights
                .entry(entry.key().backend_id.clone())
                .or_default()
                .learned
                .insert(entry.key().content_type.clone(), entry.value().clone());
        }
        for entry in self.observations.iter() {
            insights.entry(entry.key().clone()).or_default().observations = entry.value().clone();
        }
        insights
    }

    /// Export the learned table (for persistence)
    pub fn export_learned(&self) -> Vec<(LearnedKey, LearnedScore)> {
        let mut rows: Vec<_> = self
            .learned
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Import learned rows, replacing existing entries with the same key
    pub fn import_learned(&self, rows: impl IntoIterator<Item = (LearnedKey, LearnedScore)>) {
        for (key, score) in rows {
            self.learned.insert(key, score);
        }
    }

    /// Drop everything learned for a backend
    pub fn forget_backend(&self, backend_id: &str) {
        self.learned.retain(|key, _| key.backend_id != backend_id);
        self.observations.remove(backend_id);
    }
}

fn network_quality(
    profile: &BackendProfile,
    observed: &BackendObservations,
    tuning: &ScoringTuning,
) -> f64 {
    let latency = observed.latency_ema_ms.unwrap_or(profile.latency_ms).max(0.0);
    let reference = tuning.reference_latency_ms;
    let quality = reference / (reference + latency);
    quality * observed.availability.unwrap_or(1.0)
}

fn content_match(profile: &BackendProfile, content: &ContentDescriptor) -> f64 {
    if let Some(max) = profile.max_object_size {
        if content.size_bytes > max {
            return 0.0;
        }
    }
    if profile.content_types.is_empty() {
        return NO_AFFINITY;
    }

    let requested = content.content_key();
    let major = requested.split('/').next().unwrap_or_default();

    profile
        .content_types
        .iter()
        .map(|affinity| {
            let affinity = normalize_content_type(affinity);
            if affinity == requested {
                EXACT_MATCH
            } else if affinity == "*" || affinity == "*/*" {
                NO_AFFINITY
            } else if let Some(prefix) = affinity.strip_suffix("/*") {
                if prefix == major { WILDCARD_MATCH } else { MISMATCH }
            } else {
                MISMATCH
            }
        })
        .fold(MISMATCH, f64::max)
}

fn cost_efficiency(
    profile: &BackendProfile,
    observed: &BackendObservations,
    tuning: &ScoringTuning,
) -> f64 {
    let cost = observed.cost_per_gb.unwrap_or(profile.cost_per_gb).max(0.0);
    let reference = tuning.reference_cost_per_gb;
    reference / (reference + cost)
}

fn geographic_proximity(
    profile: &BackendProfile,
    content: &ContentDescriptor,
    tuning: &ScoringTuning,
) -> f64 {
    let requested = content.region().or(tuning.local_region.as_deref());
    match (requested, profile.region.as_deref()) {
        (Some(want), Some(have)) if want.eq_ignore_ascii_case(have) => 1.0,
        (Some(_), Some(_)) => 0.2,
        _ => 0.5,
    }
}

fn reliability(profile: &BackendProfile, observed: &BackendObservations) -> f64 {
    let measured = match (observed.availability, observed.success_rate) {
        (Some(a), Some(s)) => Some((a + s) / 2.0),
        (Some(a), None) => Some(a),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    };
    match measured {
        Some(m) => 0.5 * profile.reliability + 0.5 * m,
        None => profile.reliability,
    }
}
