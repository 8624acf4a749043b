//! Routing configuration with validated, atomic file persistence
//!
//! The routing configuration is a JSON document. Updates are merged into a
//! copy of the live configuration, validated, written to a temporary file in
//! the same directory and renamed over the original. Only then is the new
//! configuration published to readers, so a rejected or failed update leaves
//! both the in-memory and the on-disk copy untouched.

mod settings;

pub use settings::{BackgroundSettings, EngineSettings, ServerSettings};

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::routing::{
    BackendId, BackendProfile, OptimizationWeights, RoutingPriority, RoutingStrategy,
    WeightsUpdate,
};

/// Tunable constants of the scoring and learning engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringTuning {
    /// EMA learning rate applied to each outcome
    pub learning_rate: f64,
    /// Learned score assumed before any outcome is observed
    pub neutral_score: f64,
    /// Latency at which the network quality factor is 0.5
    pub reference_latency_ms: f64,
    /// Price at which the cost efficiency factor is 0.5
    pub reference_cost_per_gb: f64,
    /// Region assumed for requests that do not name one
    pub local_region: Option<String>,
}

impl Default for ScoringTuning {
    fn default() -> Self {
        Self {
            learning_rate: 0.2,
            neutral_score: 0.5,
            reference_latency_ms: 100.0,
            reference_cost_per_gb: 0.023,
            local_region: None,
        }
    }
}

impl ScoringTuning {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(Error::InvalidConfiguration(format!(
                "learning_rate is {}, expected a value in (0, 1]",
                self.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.neutral_score) {
            return Err(Error::InvalidConfiguration(format!(
                "neutral_score is {}, expected a value in [0, 1]",
                self.neutral_score
            )));
        }
        if !(self.reference_latency_ms > 0.0 && self.reference_latency_ms.is_finite()) {
            return Err(Error::InvalidConfiguration(format!(
                "reference_latency_ms is {}, expected a positive number",
                self.reference_latency_ms
            )));
        }
        if !(self.reference_cost_per_gb > 0.0 && self.reference_cost_per_gb.is_finite()) {
            return Err(Error::InvalidConfiguration(format!(
                "reference_cost_per_gb is {}, expected a positive number",
                self.reference_cost_per_gb
            )));
        }
        Ok(())
    }
}

/// Persisted routing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub default_strategy: RoutingStrategy,
    pub default_priority: RoutingPriority,
    pub optimization_weights: OptimizationWeights,
    /// Ordered backend roster
    pub backends: Vec<BackendId>,
    pub enabled: bool,
    pub retention_days: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backend_profiles: BTreeMap<BackendId, BackendProfile>,
    #[serde(default)]
    pub tuning: ScoringTuning,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: RoutingStrategy::Hybrid,
            default_priority: RoutingPriority::Balanced,
            optimization_weights: OptimizationWeights::default(),
            backends: Vec::new(),
            enabled: true,
            retention_days: 30,
            backend_profiles: BTreeMap::new(),
            tuning: ScoringTuning::default(),
        }
    }
}

impl RoutingConfig {
    /// Validate every invariant of the configuration
    pub fn validate(&self) -> Result<()> {
        self.optimization_weights.validate()?;

        let mut seen = HashSet::new();
        for id in &self.backends {
            if id.trim().is_empty() {
                return Err(Error::InvalidConfiguration(
                    "backend ids must not be empty".to_string(),
                ));
            }
            if !seen.insert(id.as_str()) {
                return Err(Error::InvalidConfiguration(format!(
                    "backend '{}' appears more than once, expected distinct ids",
                    id
                )));
            }
        }

        if self.retention_days == 0 {
            return Err(Error::InvalidConfiguration(
                "retention_days is 0, expected at least 1".to_string(),
            ));
        }

        for (id, profile) in &self.backend_profiles {
            profile.validate(id)?;
        }

        self.tuning.validate()
    }

    /// Whether `backend_id` is part of the roster
    pub fn has_backend(&self, backend_id: &str) -> bool {
        self.backends.iter().any(|b| b == backend_id)
    }

    /// Declared profile of a backend, or the neutral default
    pub fn profile(&self, backend_id: &str) -> BackendProfile {
        self.backend_profiles
            .get(backend_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Partial update merged into the live configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub default_strategy: Option<RoutingStrategy>,
    pub default_priority: Option<RoutingPriority>,
    pub optimization_weights: Option<WeightsUpdate>,
    pub backends: Option<Vec<BackendId>>,
    pub enabled: Option<bool>,
    pub retention_days: Option<u32>,
    /// Profiles to insert or replace
    pub backend_profiles: Option<BTreeMap<BackendId, BackendProfile>>,
    pub tuning: Option<ScoringTuning>,
}

impl ConfigUpdate {
    /// Set the default strategy
    pub fn strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    /// Set the default priority
    pub fn priority(mut self, priority: RoutingPriority) -> Self {
        self.default_priority = Some(priority);
        self
    }

    /// Merge weight fields
    pub fn weights(mut self, weights: WeightsUpdate) -> Self {
        self.optimization_weights = Some(weights);
        self
    }

    /// Replace the backend roster
    pub fn backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<BackendId>,
    {
        self.backends = Some(backends.into_iter().map(Into::into).collect());
        self
    }

    /// Insert or replace one backend profile
    pub fn profile(mut self, backend_id: impl Into<BackendId>, profile: BackendProfile) -> Self {
        self.backend_profiles
            .get_or_insert_with(BTreeMap::new)
            .insert(backend_id.into(), profile);
        self
    }

    /// Set the retention window
    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = Some(days);
        self
    }

    /// Enable or disable scoring
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Replace the tuning section
    pub fn tuning(mut self, tuning: ScoringTuning) -> Self {
        self.tuning = Some(tuning);
        self
    }

    /// Merge this update into `config`
    pub fn apply_to(&self, config: &mut RoutingConfig) {
        if let Some(strategy) = self.default_strategy {
            config.default_strategy = strategy;
        }
        if let Some(priority) = self.default_priority {
            config.default_priority = priority;
        }
        if let Some(weights) = &self.optimization_weights {
            weights.apply(&mut config.optimization_weights);
        }
        if let Some(backends) = &self.backends {
            config.backends = backends.clone();
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(days) = self.retention_days {
            config.retention_days = days;
        }
        if let Some(profiles) = &self.backend_profiles {
            for (id, profile) in profiles {
                config.backend_profiles.insert(id.clone(), profile.clone());
            }
        }
        if let Some(tuning) = &self.tuning {
            config.tuning = tuning.clone();
        }
    }
}

/// Owner of the live routing configuration
///
/// Readers take a cheap snapshot through [`ConfigManager::current`] and never
/// wait on writers; writers serialize on an internal mutex while they
/// validate and persist.
pub struct ConfigManager {
    path: PathBuf,
    current: ArcSwap<RoutingConfig>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConfigManager {
    /// Open the configuration at `path`, creating a default one on first run
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_or_init(path, RoutingConfig::default)
    }

    /// Open the configuration at `path`, creating it from `init` if absent
    pub fn open_or_init(
        path: impl Into<PathBuf>,
        init: impl FnOnce() -> RoutingConfig,
    ) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            read_config(&path)?
        } else {
            let config = init();
            config.validate()?;
            write_config_atomic(&path, &config)?;
            info!(path = %path.display(), "Created default routing configuration");
            config
        };

        Ok(Self {
            path,
            current: ArcSwap::from_pointee(config),
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the persisted configuration
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the live configuration
    pub fn current(&self) -> Arc<RoutingConfig> {
        self.current.load_full()
    }

    /// Re-read the persisted configuration and publish it
    ///
    /// Creates the default configuration if the file has been removed.
    pub fn load_config(&self) -> Result<RoutingConfig> {
        self.load_config_with(|_, _| {})
    }

    /// Like [`ConfigManager::load_config`], calling `on_change` with the
    /// previous and the reloaded configuration while writers are held off
    pub fn load_config_with(
        &self,
        on_change: impl FnOnce(&RoutingConfig, &RoutingConfig),
    ) -> Result<RoutingConfig> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let config = if self.path.exists() {
            read_config(&self.path)?
        } else {
            let config = RoutingConfig::default();
            write_config_atomic(&self.path, &config)?;
            config
        };
        let previous = self.current.swap(Arc::new(config.clone()));
        on_change(previous.as_ref(), &config);
        Ok(config)
    }

    /// Merge, validate, persist and publish an update
    pub fn update_config(&self, update: &ConfigUpdate) -> Result<RoutingConfig> {
        self.update_config_with(update, |_, _| {})
    }

    /// Like [`ConfigManager::update_config`], calling `on_change` with the
    /// previous and the published configuration before the next writer runs
    pub fn update_config_with(
        &self,
        update: &ConfigUpdate,
        on_change: impl FnOnce(&RoutingConfig, &RoutingConfig),
    ) -> Result<RoutingConfig> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = self.current.load_full();
        let mut next = (*previous).clone();
        update.apply_to(&mut next);
        next.validate()?;

        write_config_atomic(&self.path, &next)?;
        self.current.store(Arc::new(next.clone()));
        on_change(previous.as_ref(), &next);

        debug!(path = %self.path.display(), "Routing configuration updated");
        Ok(next)
    }
}

fn read_config(path: &Path) -> Result<RoutingConfig> {
    let contents = fs::read_to_string(path)?;
    let config: RoutingConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Write `config` to a temporary file next to `path` and atomically rename it
fn write_config_atomic(path: &Path, config: &RoutingConfig) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| Error::persistence("routing config", e))?;

    let contents = serde_json::to_vec_pretty(config)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| Error::persistence("routing config", e))?;
    tmp.write_all(&contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::persistence("routing config", e))?;
    tmp.persist(path)
        .map_err(|e| Error::persistence("routing config", e.error))?;
    Ok(())
}
