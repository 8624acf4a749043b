//! Optimization weights and the strategy/priority transform table
//!
//! A request is scored against a weight vector derived from the configured
//! `OptimizationWeights` in three steps:
//!
//! 1. the strategy restricts the vector to its factor family,
//! 2. the priority overlay multiplies individual factors,
//! 3. the result is renormalized to sum to 1.0.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::{RoutingPriority, RoutingStrategy};
use crate::error::{Error, Result};

/// Allowed deviation of the weight sum from 1.0
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

/// The named scoring factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    NetworkQuality,
    ContentMatch,
    CostEfficiency,
    GeographicProximity,
    LoadBalancing,
    Reliability,
    HistoricalSuccess,
}

impl Factor {
    pub const ALL: [Factor; 7] = [
        Self::NetworkQuality,
        Self::ContentMatch,
        Self::CostEfficiency,
        Self::GeographicProximity,
        Self::LoadBalancing,
        Self::Reliability,
        Self::HistoricalSuccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkQuality => "network_quality",
            Self::ContentMatch => "content_match",
            Self::CostEfficiency => "cost_efficiency",
            Self::GeographicProximity => "geographic_proximity",
            Self::LoadBalancing => "load_balancing",
            Self::Reliability => "reliability",
            Self::HistoricalSuccess => "historical_success",
        }
    }
}

impl std::fmt::Display for Factor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-factor weights; non-negative and summing to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizationWeights {
    pub network_quality: f64,
    pub content_match: f64,
    pub cost_efficiency: f64,
    pub geographic_proximity: f64,
    pub load_balancing: f64,
    pub reliability: f64,
    pub historical_success: f64,
}

impl Default for OptimizationWeights {
    fn default() -> Self {
        Self {
            network_quality: 0.15,
            content_match: 0.20,
            cost_efficiency: 0.15,
            geographic_proximity: 0.10,
            load_balancing: 0.10,
            reliability: 0.15,
            historical_success: 0.15,
        }
    }
}

impl OptimizationWeights {
    /// All weights zero (not valid on its own; used as an accumulator)
    pub fn zero() -> Self {
        Self::from_fn(|_| 0.0)
    }

    /// Build a vector by evaluating `f` for each factor
    pub fn from_fn(mut f: impl FnMut(Factor) -> f64) -> Self {
        Self {
            network_quality: f(Factor::NetworkQuality),
            content_match: f(Factor::ContentMatch),
            cost_efficiency: f(Factor::CostEfficiency),
            geographic_proximity: f(Factor::GeographicProximity),
            load_balancing: f(Factor::LoadBalancing),
            reliability: f(Factor::Reliability),
            historical_success: f(Factor::HistoricalSuccess),
        }
    }

    pub fn get(&self, factor: Factor) -> f64 {
        match factor {
            Factor::NetworkQuality => self.network_quality,
            Factor::ContentMatch => self.content_match,
            Factor::CostEfficiency => self.cost_efficiency,
            Factor::GeographicProximity => self.geographic_proximity,
            Factor::LoadBalancing => self.load_balancing,
            Factor::Reliability => self.reliability,
            Factor::HistoricalSuccess => self.historical_success,
        }
    }

    pub fn set(&mut self, factor: Factor, value: f64) {
        match factor {
            Factor::NetworkQuality => self.network_quality = value,
            Factor::ContentMatch => self.content_match = value,
            Factor::CostEfficiency => self.cost_efficiency = value,
            Factor::GeographicProximity => self.geographic_proximity = value,
            Factor::LoadBalancing => self.load_balancing = value,
            Factor::Reliability => self.reliability = value,
            Factor::HistoricalSuccess => self.historical_success = value,
        }
    }

    pub fn sum(&self) -> f64 {
        Factor::ALL.iter().map(|f| self.get(*f)).sum()
    }

    /// Iterate `(factor, weight)` pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (Factor, f64)> + '_ {
        Factor::ALL.iter().map(move |f| (*f, self.get(*f)))
    }

    /// Validate non-negativity and the unit sum
    pub fn validate(&self) -> Result<()> {
        for (factor, weight) in self.iter() {
            if !weight.is_finite() {
                return Err(Error::InvalidConfiguration(format!(
                    "weight {} is {}, expected a finite number",
                    factor, weight
                )));
            }
            if weight < 0.0 {
                return Err(Error::InvalidConfiguration(format!(
                    "weight {} is {}, expected a non-negative number",
                    factor, weight
                )));
            }
        }

        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(Error::InvalidConfiguration(format!(
                "weights sum to {:.3}, expected 1.0",
                sum
            )));
        }
        Ok(())
    }

    /// Scale so the weights sum to 1.0; `None` when every weight is zero
    pub fn normalized(&self) -> Option<Self> {
        let sum = self.sum();
        if sum <= f64::EPSILON {
            return None;
        }
        Some(Self::from_fn(|f| self.get(f) / sum))
    }
}

/// Partial update of a weight vector; `None` fields keep their value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsUpdate {
    pub network_quality: Option<f64>,
    pub content_match: Option<f64>,
    pub cost_efficiency: Option<f64>,
    pub geographic_proximity: Option<f64>,
    pub load_balancing: Option<f64>,
    pub reliability: Option<f64>,
    pub historical_success: Option<f64>,
}

impl WeightsUpdate {
    pub fn set(mut self, factor: Factor, value: f64) -> Self {
        let slot = match factor {
            Factor::NetworkQuality => &mut self.network_quality,
            Factor::ContentMatch => &mut self.content_match,
            Factor::CostEfficiency => &mut self.cost_efficiency,
            Factor::GeographicProximity => &mut self.geographic_proximity,
            Factor::LoadBalancing => &mut self.load_balancing,
            Factor::Reliability => &mut self.reliability,
            Factor::HistoricalSuccess => &mut self.historical_success,
        };
        *slot = Some(value);
        self
    }

    /// Full replacement of every factor
    pub fn replace_all(weights: &OptimizationWeights) -> Self {
        Factor::ALL
            .iter()
            .fold(Self::default(), |update, f| update.set(*f, weights.get(*f)))
    }

    /// Apply onto `weights`
    pub fn apply(&self, weights: &mut OptimizationWeights) {
        let fields = [
            (Factor::NetworkQuality, self.network_quality),
            (Factor::ContentMatch, self.content_match),
            (Factor::CostEfficiency, self.cost_efficiency),
            (Factor::GeographicProximity, self.geographic_proximity),
            (Factor::LoadBalancing, self.load_balancing),
            (Factor::Reliability, self.reliability),
            (Factor::HistoricalSuccess, self.historical_success),
        ];
        for (factor, value) in fields {
            if let Some(value) = value {
                weights.set(factor, value);
            }
        }
    }
}

/// Per-factor multipliers applied by a priority preset
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityOverlay {
    multipliers: HashMap<Factor, f64>,
}

impl PriorityOverlay {
    /// Overlay that leaves every factor unchanged
    pub fn identity() -> Self {
        Self {
            multipliers: HashMap::new(),
        }
    }

    /// Multiply `factor` by `multiplier` (negative values are clamped to zero)
    pub fn boost(mut self, factor: Factor, multiplier: f64) -> Self {
        self.multipliers.insert(factor, multiplier.max(0.0));
        self
    }

    pub fn multiplier(&self, factor: Factor) -> f64 {
        self.multipliers.get(&factor).copied().unwrap_or(1.0)
    }
}

/// Registration table mapping strategies to factor families and
/// priorities to overlays
#[derive(Debug, Clone)]
pub struct WeightTransforms {
    families: HashMap<RoutingStrategy, Vec<Factor>>,
    overlays: HashMap<RoutingPriority, PriorityOverlay>,
}

impl Default for WeightTransforms {
    fn default() -> Self {
        let mut families = HashMap::new();
        families.insert(RoutingStrategy::Hybrid, Factor::ALL.to_vec());
        families.insert(RoutingStrategy::ContentType, vec![Factor::ContentMatch]);
        families.insert(RoutingStrategy::Cost, vec![Factor::CostEfficiency]);
        families.insert(
            RoutingStrategy::Performance,
            vec![
                Factor::NetworkQuality,
                Factor::LoadBalancing,
                Factor::GeographicProximity,
            ],
        );
        families.insert(
            RoutingStrategy::Reliability,
            vec![Factor::Reliability, Factor::HistoricalSuccess],
        );

        let mut overlays = HashMap::new();
        overlays.insert(RoutingPriority::Balanced, PriorityOverlay::identity());
        overlays.insert(
            RoutingPriority::Performance,
            PriorityOverlay::identity()
                .boost(Factor::NetworkQuality, 3.0)
                .boost(Factor::LoadBalancing, 1.5)
                .boost(Factor::GeographicProximity, 1.5),
        );
        overlays.insert(
            RoutingPriority::Cost,
            PriorityOverlay::identity().boost(Factor::CostEfficiency, 4.0),
        );
        overlays.insert(
            RoutingPriority::Reliability,
            PriorityOverlay::identity()
                .boost(Factor::Reliability, 2.5)
                .boost(Factor::HistoricalSuccess, 2.5),
        );

        Self { families, overlays }
    }
}

impl WeightTransforms {
    /// Replace the factor family used by a strategy
    pub fn register_strategy(&mut self, strategy: RoutingStrategy, family: Vec<Factor>) {
        self.families.insert(strategy, family);
    }

    /// Replace the overlay used by a priority
    pub fn register_priority(&mut self, priority: RoutingPriority, overlay: PriorityOverlay) {
        self.overlays.insert(priority, overlay);
    }

    /// Factors consulted by a strategy
    pub fn family(&self, strategy: RoutingStrategy) -> &[Factor] {
        self.families
            .get(&strategy)
            .map(Vec::as_slice)
            .unwrap_or(&Factor::ALL)
    }

    /// Derive the effective weight vector for a strategy/priority pair
    pub fn effective(
        &self,
        base: &OptimizationWeights,
        strategy: RoutingStrategy,
        priority: RoutingPriority,
    ) -> OptimizationWeights {
        let family = self.family(strategy);

        let mut restricted = OptimizationWeights::from_fn(|f| {
            if family.contains(&f) {
                base.get(f)
            } else {
                0.0
            }
        });
        if restricted.sum() <= f64::EPSILON {
            // Operator zeroed the whole family; fall back to an even split
            restricted = OptimizationWeights::from_fn(|f| if family.contains(&f) { 1.0 } else { 0.0 });
        }

        let overlay = self
            .overlays
            .get(&priority)
            .cloned()
            .unwrap_or_else(PriorityOverlay::identity);
        let biased = OptimizationWeights::from_fn(|f| restricted.get(f) * overlay.multiplier(f));

        biased
            .normalized()
            .or_else(|| restricted.normalized())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_are_valid() {
        OptimizationWeights::default().validate().unwrap();
    }

    #[test]
    fn test_validation_names_the_sum() {
        let mut weights = OptimizationWeights::default();
        weights.content_match = 0.07;
        let err = weights.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: weights sum to 0.870, expected 1.0"
        );
    }

    #[test]
    fn test_validation_rejects_negative() {
        let mut weights = OptimizationWeights::default();
        weights.content_match = -0.05;
        weights.reliability = 0.40;
        let err = weights.validate().unwrap_err();
        assert!(err.to_string().contains("content_match"));
    }

    #[test]
    fn test_weights_update_merges_fields() {
        let mut weights = OptimizationWeights::default();
        WeightsUpdate::default()
            .set(Factor::ContentMatch, 0.10)
            .set(Factor::CostEfficiency, 0.25)
            .apply(&mut weights);
        assert_eq!(weights.content_match, 0.10);
        assert_eq!(weights.cost_efficiency, 0.25);
        assert_eq!(weights.reliability, 0.15);
    }

    #[test]
    fn test_hybrid_balanced_is_identity() {
        let transforms = WeightTransforms::default();
        let base = OptimizationWeights::default();
        let effective =
            transforms.effective(&base, RoutingStrategy::Hybrid, RoutingPriority::Balanced);
        for (factor, weight) in base.iter() {
            assert!((effective.get(factor) - weight).abs() < 1e-9);
        }
    }

    #[test]
    fn test_cost_strategy_is_pure_cost() {
        let transforms = WeightTransforms::default();
        let effective = transforms.effective(
            &OptimizationWeights::default(),
            RoutingStrategy::Cost,
            RoutingPriority::Performance,
        );
        assert!((effective.cost_efficiency - 1.0).abs() < 1e-9);
        assert_eq!(effective.network_quality, 0.0);
    }

    #[test]
    fn test_reliability_priority_upweights_and_renormalizes() {
        let transforms = WeightTransforms::default();
        let base = OptimizationWeights::default();
        let effective =
            transforms.effective(&base, RoutingStrategy::Hybrid, RoutingPriority::Reliability);

        assert!(effective.reliability > base.reliability);
        assert!(effective.historical_success > base.historical_success);
        assert!(effective.cost_efficiency < base.cost_efficiency);
        assert!((effective.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zeroed_family_falls_back_to_even_split() {
        let transforms = WeightTransforms::default();
        let mut base = OptimizationWeights::default();
        base.reliability = 0.0;
        base.historical_success = 0.0;
        base.content_match = 0.50;

        let effective =
            transforms.effective(&base, RoutingStrategy::Reliability, RoutingPriority::Balanced);
        assert!((effective.reliability - 0.5).abs() < 1e-9);
        assert!((effective.historical_success - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_registered_overlay_is_used() {
        let mut transforms = WeightTransforms::default();
        transforms.register_priority(
            RoutingPriority::Balanced,
            PriorityOverlay::identity().boost(Factor::GeographicProximity, 0.0),
        );
        let effective = transforms.effective(
            &OptimizationWeights::default(),
            RoutingStrategy::Hybrid,
            RoutingPriority::Balanced,
        );
        assert_eq!(effective.geographic_proximity, 0.0);
        assert!((effective.sum() - 1.0).abs() < 1e-9);
    }
}
