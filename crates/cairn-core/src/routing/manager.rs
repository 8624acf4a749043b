//! Routing manager: the entry point callers talk to
//!
//! The manager owns the live configuration, the scoring engine with its
//! learned table, the metrics store and the background tasks. Selection is
//! pure in-memory work; decision and outcome rows go through the recorder
//! queue so that callers never wait on the database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::scoring::{BackendInsight, ScoringEngine};
use super::types::{
    BackendId, BackendMetric, ContentDescriptor, RoutingDecision, RoutingOutcome,
    RoutingPriority, RoutingStrategy,
};
use super::weights::{OptimizationWeights, WeightTransforms};
use crate::background::{collect_once, BackendProbe, BackgroundTasks, COLLECTOR_TASK, PRUNER_TASK};
use crate::config::{ConfigManager, ConfigUpdate, EngineSettings, RoutingConfig};
use crate::error::{Error, Result};
use crate::metrics::{MetricsRecorder, MetricsStore, RecorderStats};

/// Read-only snapshot of the engine state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingInsights {
    pub enabled: bool,
    pub default_strategy: RoutingStrategy,
    pub default_priority: RoutingPriority,
    /// Configured weight vector
    pub factor_weights: OptimizationWeights,
    /// Weight vector actually applied with the default strategy and priority
    pub effective_weights: OptimizationWeights,
    /// Learned scores and live observations for every roster backend
    pub backend_scores: BTreeMap<BackendId, BackendInsight>,
    /// Outcome reports dropped because the backend was not in the roster
    pub unknown_outcomes: u64,
    pub recorder: RecorderStats,
}

/// Builder for [`RoutingManager`]
pub struct RoutingManagerBuilder {
    settings: EngineSettings,
    probe: Option<Arc<dyn BackendProbe>>,
    transforms: WeightTransforms,
    store: Option<MetricsStore>,
    initial_config: Option<RoutingConfig>,
}

impl RoutingManagerBuilder {
    /// Probe used by the metric collector
    pub fn with_probe(mut self, probe: Arc<dyn BackendProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Replace the strategy/priority transform table
    pub fn with_transforms(mut self, transforms: WeightTransforms) -> Self {
        self.transforms = transforms;
        self
    }

    /// Use an already opened store instead of `settings.database_path`
    pub fn with_store(mut self, store: MetricsStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Configuration written on first run instead of the defaults
    pub fn with_initial_config(mut self, config: RoutingConfig) -> Self {
        self.initial_config = Some(config);
        self
    }

    /// Initialize the manager; must be called inside a Tokio runtime
    pub async fn build(self) -> Result<RoutingManager> {
        let initial = self.initial_config;
        let config = Arc::new(ConfigManager::open_or_init(
            self.settings.config_path.clone(),
            || initial.unwrap_or_default(),
        )?);

        let store = match self.store {
            Some(store) => Arc::new(store),
            None => Arc::new(MetricsStore::connect(&self.settings.database_path).await?),
        };

        let scoring = Arc::new(ScoringEngine::with_transforms(self.transforms));
        match store.load_learned_scores().await {
            Ok(rows) => {
                let roster = config.current().backends.clone();
                let rows: Vec<_> = rows
                    .into_iter()
                    .filter(|(key, _)| roster.contains(&key.backend_id))
                    .collect();
                let count = rows.len();
                scoring.import_learned(rows);
                if count > 0 {
                    info!(count = count, "Restored learned scores");
                }
            }
            Err(e) => warn!(error = %e, "Could not restore learned scores, starting fresh"),
        }

        let recorder = Arc::new(MetricsRecorder::spawn(
            store.clone(),
            self.settings.background.metrics_queue_capacity,
        ));

        let manager = RoutingManager {
            settings: self.settings,
            config,
            scoring,
            store,
            recorder,
            tasks: BackgroundTasks::new(),
            unknown_outcomes: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        };
        manager.start_background(self.probe);

        let current = manager.config();
        info!(
            backends = current.backends.len(),
            strategy = %current.default_strategy,
            priority = %current.default_priority,
            enabled = current.enabled,
            "Routing manager started"
        );
        Ok(manager)
    }
}

/// Content-aware backend selector
pub struct RoutingManager {
    settings: EngineSettings,
    config: Arc<ConfigManager>,
    scoring: Arc<ScoringEngine>,
    store: Arc<MetricsStore>,
    recorder: Arc<MetricsRecorder>,
    tasks: BackgroundTasks,
    unknown_outcomes: AtomicU64,
    stopped: AtomicBool,
}

impl std::fmt::Debug for RoutingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingManager")
            .field("config_path", &self.settings.config_path)
            .field("database_path", &self.settings.database_path)
            .field("tasks", &self.tasks.names())
            .finish_non_exhaustive()
    }
}

impl RoutingManager {
    pub fn builder(settings: EngineSettings) -> RoutingManagerBuilder {
        RoutingManagerBuilder {
            settings,
            probe: None,
            transforms: WeightTransforms::default(),
            store: None,
            initial_config: None,
        }
    }

    /// Load the configuration, open the metrics store and start enabled
    /// background tasks
    pub async fn create(settings: EngineSettings) -> Result<Self> {
        Self::builder(settings).build().await
    }

    fn start_background(&self, probe: Option<Arc<dyn BackendProbe>>) {
        let background = &self.settings.background;

        if background.collect_metrics {
            match probe {
                Some(probe) => {
                    let config = self.config.clone();
                    let scoring = self.scoring.clone();
                    let recorder = self.recorder.clone();
                    self.tasks.spawn_periodic(
                        COLLECTOR_TASK,
                        background.collection_interval(),
                        move || {
                            let probe = probe.clone();
                            let config = config.clone();
                            let scoring = scoring.clone();
                            let recorder = recorder.clone();
                            async move {
                                let current = config.current();
                                let metrics = collect_once(probe.as_ref(), &current.backends).await;
                                for metric in metrics {
                                    scoring.observe_metric(&metric, &current.tuning);
                                    recorder.record_metric(metric);
                                }
                            }
                        },
                    );
                }
                None => warn!("Metric collection enabled but no backend probe configured"),
            }
        }

        if background.prune_metrics {
            let config = self.config.clone();
            let store = self.store.clone();
            self.tasks
                .spawn_periodic(PRUNER_TASK, background.prune_interval(), move || {
                    let config = config.clone();
                    let store = store.clone();
                    async move {
                        let retention_days = config.current().retention_days;
                        if let Err(e) = store.prune(retention_days).await {
                            warn!(error = %e, "Metrics pruning failed");
                        }
                    }
                });
        }
    }

    /// Snapshot of the live configuration
    pub fn config(&self) -> Arc<RoutingConfig> {
        self.config.current()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Candidate set: roster order, restricted to `available` when given
    fn candidates(config: &RoutingConfig, available: Option<&[BackendId]>) -> Vec<BackendId> {
        match available {
            None => config.backends.clone(),
            Some(available) => {
                let allowed: BTreeSet<&str> = available.iter().map(String::as_str).collect();
                for id in &allowed {
                    if !config.has_backend(id) {
                        debug!(backend_id = %id, "Ignoring available backend outside the roster");
                    }
                }
                config
                    .backends
                    .iter()
                    .filter(|id| allowed.contains(id.as_str()))
                    .cloned()
                    .collect()
            }
        }
    }

    /// Choose a backend and return the full decision
    ///
    /// An explicitly empty `available` list fails rather than falling back to
    /// the whole roster. The decision row is queued, not awaited.
    pub fn route(
        &self,
        content: &ContentDescriptor,
        strategy: Option<RoutingStrategy>,
        priority: Option<RoutingPriority>,
        available: Option<&[BackendId]>,
    ) -> Result<RoutingDecision> {
        content.validate()?;

        let config = self.config.current();
        let candidates = Self::candidates(&config, available);
        if candidates.is_empty() {
            return Err(Error::NoBackendsAvailable(match available {
                Some(list) if list.is_empty() => "available backend list is empty".to_string(),
                Some(_) => "none of the available backends is in the roster".to_string(),
                None => "the backend roster is empty".to_string(),
            }));
        }

        let strategy = strategy.unwrap_or(config.default_strategy);
        let priority = priority.unwrap_or(config.default_priority);

        let decision = if config.enabled {
            let mut ranked = self
                .scoring
                .rank(&config, content, &candidates, strategy, priority)?;
            let best = ranked.remove(0);
            RoutingDecision::new(best.backend_id, best.score, strategy, priority, content)
                .with_alternatives(ranked)
        } else {
            RoutingDecision::new(candidates[0].clone(), 0.0, strategy, priority, content)
        };

        debug!(
            decision_id = %decision.id,
            backend_id = %decision.backend_id,
            score = decision.score,
            strategy = %strategy,
            priority = %priority,
            content_type = %decision.content_type,
            "Routing decision"
        );

        self.recorder.record_decision(decision.clone());
        Ok(decision)
    }

    /// Choose a backend for `content`
    pub fn select_backend(
        &self,
        content: &ContentDescriptor,
        strategy: Option<RoutingStrategy>,
        priority: Option<RoutingPriority>,
        available: Option<&[BackendId]>,
    ) -> Result<BackendId> {
        self.route(content, strategy, priority, available)
            .map(|decision| decision.backend_id)
    }

    /// Feed a real-world outcome back into the engine
    ///
    /// Reports for backends outside the roster are logged, counted and
    /// dropped; this never fails.
    pub fn record_routing_outcome(
        &self,
        backend_id: &str,
        content: &ContentDescriptor,
        success: bool,
        duration_ms: Option<u64>,
    ) {
        let config = self.config.current();
        if !config.has_backend(backend_id) {
            let count = self.unknown_outcomes.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                backend_id = %backend_id,
                unknown_outcomes = count,
                "Dropping outcome for unknown backend"
            );
            return;
        }

        self.scoring.record_outcome(
            backend_id,
            &content.content_type,
            success,
            duration_ms,
            &config.tuning,
        );
        self.recorder
            .record_outcome(RoutingOutcome::new(backend_id, content, success).with_duration(duration_ms));
    }

    /// Ingest a backend measurement from an operator or external collector
    pub fn record_backend_metric(&self, metric: BackendMetric) -> Result<()> {
        let config = self.config.current();
        if !config.has_backend(&metric.backend_id) {
            return Err(Error::UnknownBackend(metric.backend_id));
        }
        if !metric.value.is_finite() {
            return Err(Error::InvalidInput(format!(
                "metric '{}' has non-finite value",
                metric.metric_name
            )));
        }

        if !self.scoring.observe_metric(&metric, &config.tuning) {
            debug!(
                backend_id = %metric.backend_id,
                metric_name = %metric.metric_name,
                "Metric stored but not used for scoring"
            );
        }
        self.recorder.record_metric(metric);
        Ok(())
    }

    /// Snapshot of weights and per-backend learned state
    pub fn get_routing_insights(&self) -> RoutingInsights {
        let config = self.config.current();
        let mut snapshot = self.scoring.snapshot();
        let backend_scores = config
            .backends
            .iter()
            .map(|id| (id.clone(), snapshot.remove(id).unwrap_or_default()))
            .collect();

        RoutingInsights {
            enabled: config.enabled,
            default_strategy: config.default_strategy,
            default_priority: config.default_priority,
            factor_weights: config.optimization_weights,
            effective_weights: self.scoring.effective_weights(
                &config,
                config.default_strategy,
                config.default_priority,
            ),
            backend_scores,
            unknown_outcomes: self.unknown_outcomes.load(Ordering::Relaxed),
            recorder: self.recorder.stats(),
        }
    }

    /// Merge, validate and persist a configuration update
    ///
    /// Learned state of backends removed from the roster is discarded.
    pub fn update_config(&self, update: &ConfigUpdate) -> Result<RoutingConfig> {
        self.config
            .update_config_with(update, |before, after| self.forget_removed(before, after))
    }

    /// Re-read the configuration from disk
    ///
    /// Backends missing from the reloaded roster are forgotten as well.
    pub fn reload_config(&self) -> Result<RoutingConfig> {
        self.config
            .load_config_with(|before, after| self.forget_removed(before, after))
    }

    fn forget_removed(&self, before: &RoutingConfig, after: &RoutingConfig) {
        for removed in before.backends.iter().filter(|id| !after.has_backend(id)) {
            self.scoring.forget_backend(removed);
            info!(backend_id = %removed, "Backend removed from roster");
        }
    }

    /// Wait until every queued metrics row has been written
    pub async fn flush_metrics(&self) {
        self.recorder.flush().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop background tasks, persist learned scores, drain the metrics
    /// queue and close the store
    ///
    /// Safe to call more than once.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.tasks.shutdown().await;

        let saved = self
            .store
            .save_learned_scores(&self.scoring.export_learned())
            .await;
        if let Err(e) = &saved {
            warn!(error = %e, "Failed to save learned scores");
        }

        self.recorder.shutdown().await;
        self.store.close().await;
        info!("Routing manager stopped");
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::ProbeReport;
    use crate::config::BackgroundSettings;
    use crate::routing::{metric_names, MetricType};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn quiet_settings(dir: &TempDir) -> EngineSettings {
        let mut settings = EngineSettings::in_dir(dir.path());
        settings.background = BackgroundSettings {
            prune_metrics: false,
            ..Default::default()
        };
        settings
    }

    fn roster(ids: &[&str]) -> RoutingConfig {
        RoutingConfig {
            backends: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn create_test_manager(ids: &[&str]) -> (RoutingManager, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = RoutingManager::builder(quiet_settings(&dir))
            .with_store(MetricsStore::in_memory().await.unwrap())
            .with_initial_config(roster(ids))
            .build()
            .await
            .unwrap();
        (manager, dir)
    }

    fn pdf() -> ContentDescriptor {
        ContentDescriptor::new("application/pdf", 1_048_576)
    }

    #[tokio::test]
    async fn test_available_filter_intersects_roster() {
        let (manager, _dir) = create_test_manager(&["a", "b", "c"]).await;
        let available = vec!["c".to_string(), "zzz".to_string()];

        let selected = manager
            .select_backend(&pdf(), None, None, Some(&available))
            .unwrap();
        assert_eq!(selected, "c");
    }

    #[tokio::test]
    async fn test_empty_available_list_fails() {
        let (manager, _dir) = create_test_manager(&["a", "b"]).await;
        let err = manager
            .select_backend(&pdf(), None, None, Some(&[][..]))
            .unwrap_err();
        assert!(matches!(err, Error::NoBackendsAvailable(_)));
    }

    #[tokio::test]
    async fn test_empty_roster_fails() {
        let (manager, _dir) = create_test_manager(&[]).await;
        assert!(matches!(
            manager.select_backend(&pdf(), None, None, None),
            Err(Error::NoBackendsAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_routing_uses_roster_order() {
        let (manager, _dir) = create_test_manager(&["b", "a"]).await;
        manager
            .update_config(&ConfigUpdate::default().enabled(false))
            .unwrap();

        let decision = manager.route(&pdf(), None, None, None).unwrap();
        assert_eq!(decision.backend_id, "b");
        assert_eq!(decision.score, 0.0);

        manager.flush_metrics().await;
        assert_eq!(manager.store().row_counts().await.unwrap().decisions, 1);
    }

    #[tokio::test]
    async fn test_unknown_outcome_is_counted_not_fatal() {
        let (manager, _dir) = create_test_manager(&["a"]).await;
        manager.record_routing_outcome("ghost", &pdf(), false, None);
        manager.record_routing_outcome("ghost", &pdf(), true, Some(3));

        let insights = manager.get_routing_insights();
        assert_eq!(insights.unknown_outcomes, 2);
        assert!(!insights.backend_scores.contains_key("ghost"));
    }

    #[tokio::test]
    async fn test_outcomes_reach_store_and_insights() {
        let (manager, _dir) = create_test_manager(&["a", "b"]).await;
        manager.record_routing_outcome("a", &pdf(), false, Some(250));
        manager.flush_metrics().await;

        let insights = manager.get_routing_insights();
        let a = &insights.backend_scores["a"];
        assert!(a.learned["application/pdf"].ema < 0.5);
        assert_eq!(a.observations.latency_ema_ms, Some(250.0));
        assert!(insights.backend_scores["b"].learned.is_empty());

        let rates = manager.store().get_backend_success_rates(1).await;
        assert_eq!(rates["a"].total, 1);
    }

    #[tokio::test]
    async fn test_metric_for_unknown_backend_rejected() {
        let (manager, _dir) = create_test_manager(&["a"]).await;
        let metric = BackendMetric::new("x", MetricType::Performance, metric_names::LATENCY_MS, 5.0);
        assert!(matches!(
            manager.record_backend_metric(metric),
            Err(Error::UnknownBackend(_))
        ));
    }

    #[tokio::test]
    async fn test_removing_backend_forgets_learned_state() {
        let (manager, _dir) = create_test_manager(&["a", "b"]).await;
        manager.record_routing_outcome("a", &pdf(), true, None);
        manager
            .update_config(&ConfigUpdate::default().backends(["b"]))
            .unwrap();
        assert!(manager.scoring().learned_score("a", "application/pdf").is_none());
    }

    #[tokio::test]
    async fn test_reload_forgets_backends_removed_on_disk() {
        let (manager, dir) = create_test_manager(&["a", "b"]).await;
        manager.record_routing_outcome("a", &pdf(), true, None);

        // another process rewrites the roster
        let other = ConfigManager::open(dir.path().join("routing.json")).unwrap();
        other
            .update_config(&ConfigUpdate::default().backends(["b"]))
            .unwrap();

        let reloaded = manager.reload_config().unwrap();
        assert_eq!(reloaded.backends, vec!["b".to_string()]);
        assert!(manager.scoring().learned_score("a", "application/pdf").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_forget_every_removed_backend() {
        let ids = ["a", "b", "c", "d", "e", "f"];
        let (manager, _dir) = create_test_manager(&ids).await;
        for id in ids {
            manager.record_routing_outcome(id, &pdf(), true, None);
        }

        let manager = Arc::new(manager);
        let mut handles = Vec::new();
        for keep in [["a", "b", "c"], ["d", "e", "f"], ["a", "c", "e"], ["b", "d", "f"]] {
            let manager = manager.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                manager
                    .update_config(&ConfigUpdate::default().backends(keep))
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let config = manager.config();
        for id in ids {
            if !config.has_backend(id) {
                assert!(
                    manager.scoring().learned_score(id, "application/pdf").is_none(),
                    "learned state of removed backend {id} survived"
                );
            }
        }
    }

    struct StaticProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BackendProbe for StaticProbe {
        async fn probe(&self, backend_id: &str) -> Result<ProbeReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match backend_id {
                "a" => Ok(ProbeReport::available(30.0).with_utilization(0.25)),
                _ => Err(Error::InvalidInput(format!("{backend_id} is down"))),
            }
        }
    }

    #[tokio::test]
    async fn test_collector_feeds_probe_reports_into_scoring() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = quiet_settings(&dir);
        settings.background.collect_metrics = true;
        settings.background.collection_interval_secs = 1;

        let probe = Arc::new(StaticProbe {
            calls: AtomicUsize::new(0),
        });
        let manager = RoutingManager::builder(settings)
            .with_store(MetricsStore::in_memory().await.unwrap())
            .with_initial_config(roster(&["a", "b"]))
            .with_probe(probe.clone())
            .build()
            .await
            .unwrap();
        assert!(manager.background().is_running(COLLECTOR_TASK));

        // the first collection runs immediately
        let mut insights = manager.get_routing_insights();
        for _ in 0..200 {
            if insights.backend_scores["b"].observations.availability.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            insights = manager.get_routing_insights();
        }

        let a = &insights.backend_scores["a"].observations;
        assert_eq!(a.availability, Some(1.0));
        assert_eq!(a.latency_ema_ms, Some(30.0));
        assert_eq!(a.utilization, Some(0.25));
        assert_eq!(insights.backend_scores["b"].observations.availability, Some(0.0));
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);

        assert!(manager.background().stop_task(COLLECTOR_TASK).await);
        assert!(!manager.background().is_running(COLLECTOR_TASK));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_learned_scores_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let settings = quiet_settings(&dir);

        let manager = RoutingManager::builder(settings.clone())
            .with_initial_config(roster(&["a", "b"]))
            .build()
            .await
            .unwrap();
        for _ in 0..3 {
            manager.record_routing_outcome("a", &pdf(), false, None);
        }
        let before = manager
            .scoring()
            .learned_score("a", "application/pdf")
            .unwrap();
        manager.stop().await.unwrap();
        manager.stop().await.unwrap();

        let restarted = RoutingManager::create(settings).await.unwrap();
        let after = restarted
            .scoring()
            .learned_score("a", "application/pdf")
            .unwrap();
        assert!((after.ema - before.ema).abs() < 1e-9);
        assert_eq!(after.failures, 3);
        restarted.stop().await.unwrap();
    }
}
