//! SQLite-backed history of routing decisions, outcomes and backend metrics
//!
//! Writes are individually atomic and surface failures to the caller.
//! Aggregate reads are best-effort: if the database cannot be queried they
//! log a warning and return empty results, so a metrics outage never blocks
//! routing.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::routing::{
    BackendId, BackendMetric, LearnedKey, LearnedScore, RoutingDecision, RoutingOutcome,
};

/// Default maximum connections in the pool
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQL creating the metrics schema
pub const CREATE_METRICS_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS routing_decisions (
    id TEXT PRIMARY KEY,
    recorded_at_ms INTEGER NOT NULL,
    backend_id TEXT NOT NULL,
    strategy TEXT NOT NULL,
    priority TEXT NOT NULL,
    score REAL NOT NULL,
    content_type TEXT NOT NULL,
    content_size INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_routing_decisions_time ON routing_decisions(recorded_at_ms);
CREATE INDEX IF NOT EXISTS idx_routing_decisions_backend ON routing_decisions(backend_id);

CREATE TABLE IF NOT EXISTS routing_outcomes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at_ms INTEGER NOT NULL,
    backend_id TEXT NOT NULL,
    success INTEGER NOT NULL,
    duration_ms INTEGER,
    content_type TEXT NOT NULL,
    content_size INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_routing_outcomes_time ON routing_outcomes(recorded_at_ms);
CREATE INDEX IF NOT EXISTS idx_routing_outcomes_backend ON routing_outcomes(backend_id);

CREATE TABLE IF NOT EXISTS backend_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at_ms INTEGER NOT NULL,
    backend_id TEXT NOT NULL,
    metric_type TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    value REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backend_metrics_time ON backend_metrics(recorded_at_ms);

CREATE TABLE IF NOT EXISTS learned_scores (
    backend_id TEXT NOT NULL,
    content_type TEXT NOT NULL,
    ema REAL NOT NULL,
    samples INTEGER NOT NULL DEFAULT 0,
    successes INTEGER NOT NULL DEFAULT 0,
    failures INTEGER NOT NULL DEFAULT 0,
    updated_at_ms INTEGER NOT NULL,
    UNIQUE(backend_id, content_type)
);
"#;

/// Outcome counts for one backend within a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuccessRate {
    pub total: u64,
    pub successes: u64,
    /// successes / total
    pub rate: f64,
}

/// Reported durations for one backend within a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Routing volume for one backend within a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub decisions: u64,
    pub total_bytes: u64,
    /// Decisions per content type
    pub content_types: BTreeMap<String, u64>,
}

/// Rows removed by a pruning pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub decisions: u64,
    pub outcomes: u64,
    pub metrics: u64,
}

impl PruneReport {
    pub fn total(&self) -> u64 {
        self.decisions + self.outcomes + self.metrics
    }
}

/// Number of stored rows per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub decisions: u64,
    pub outcomes: u64,
    pub metrics: u64,
}

fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// `now - span`, saturating at the earliest representable instant
fn cutoff_before(span: Duration) -> DateTime<Utc> {
    Utc::now()
        .checked_sub_signed(span)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn window_start_ms(time_window_hours: u32) -> i64 {
    to_millis(&cutoff_before(Duration::hours(i64::from(time_window_hours))))
}

/// Store for routing history
#[derive(Debug, Clone)]
pub struct MetricsStore {
    pool: SqlitePool,
}

impl MetricsStore {
    /// Create a store from an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database file and initialize the schema
    pub async fn connect(database_path: &Path) -> Result<Self> {
        if let Some(parent) = database_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}", database_path.display());
        let options = SqliteConnectOptions::from_str(&url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        info!(path = %database_path.display(), "Metrics store opened");
        Ok(store)
    }

    /// Open a private in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // In-memory databases live as long as their single connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_METRICS_TABLES_SQL)
            .execute(&self.pool)
            .await?;
        debug!("Metrics tables initialized");
        Ok(())
    }

    /// Release the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Append a routing decision
    pub async fn record_routing_decision(&self, decision: &RoutingDecision) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO routing_decisions (
                id, recorded_at_ms, backend_id, strategy, priority, score,
                content_type, content_size
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&decision.id)
        .bind(to_millis(&decision.timestamp))
        .bind(&decision.backend_id)
        .bind(decision.strategy.as_str())
        .bind(decision.priority.as_str())
        .bind(decision.score)
        .bind(&decision.content_type)
        .bind(decision.content_size as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::persistence("routing decision", e))?;

        Ok(())
    }

    /// Append a routing outcome
    pub async fn record_routing_outcome(&self, outcome: &RoutingOutcome) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO routing_outcomes (
                recorded_at_ms, backend_id, success, duration_ms, content_type, content_size
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_millis(&outcome.timestamp))
        .bind(&outcome.backend_id)
        .bind(outcome.success)
        .bind(outcome.duration_ms.map(|d| d as i64))
        .bind(&outcome.content_type)
        .bind(outcome.content_size as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::persistence("routing outcome", e))?;

        Ok(())
    }

    /// Append a raw backend measurement
    pub async fn record_backend_metric(&self, metric: &BackendMetric) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backend_metrics (
                recorded_at_ms, backend_id, metric_type, metric_name, value
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_millis(&metric.timestamp))
        .bind(&metric.backend_id)
        .bind(metric.metric_type.as_str())
        .bind(&metric.metric_name)
        .bind(metric.value)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::persistence("backend metric", e))?;

        Ok(())
    }

    /// Outcome success rate per backend over the last `time_window_hours`
    pub async fn get_backend_success_rates(
        &self,
        time_window_hours: u32,
    ) -> BTreeMap<BackendId, SuccessRate> {
        let rows = sqlx::query(
            r#"
            SELECT backend_id, COUNT(*) AS total, SUM(success) AS successes
            FROM routing_outcomes
            WHERE recorded_at_ms >= ?
            GROUP BY backend_id
            "#,
        )
        .bind(window_start_ms(time_window_hours))
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Success rate query failed, returning empty result");
                return BTreeMap::new();
            }
        };

        rows.into_iter()
            .map(|row| {
                let total = row.get::<i64, _>("total").max(0) as u64;
                let successes = row
                    .get::<Option<i64>, _>("successes")
                    .unwrap_or(0)
                    .max(0) as u64;
                let rate = if total == 0 {
                    0.0
                } else {
                    successes as f64 / total as f64
                };
                (
                    row.get::<String, _>("backend_id"),
                    SuccessRate {
                        total,
                        successes,
                        rate,
                    },
                )
            })
            .collect()
    }

    /// Duration statistics per backend over the last `time_window_hours`
    pub async fn get_backend_latency_stats(
        &self,
        time_window_hours: u32,
    ) -> BTreeMap<BackendId, LatencyStats> {
        let rows = sqlx::query(
            r#"
            SELECT backend_id,
                   COUNT(duration_ms) AS samples,
                   AVG(duration_ms) AS avg_ms,
                   MIN(duration_ms) AS min_ms,
                   MAX(duration_ms) AS max_ms
            FROM routing_outcomes
            WHERE recorded_at_ms >= ? AND duration_ms IS NOT NULL
            GROUP BY backend_id
            "#,
        )
        .bind(window_start_ms(time_window_hours))
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Latency query failed, returning empty result");
                return BTreeMap::new();
            }
        };

        rows.into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("backend_id"),
                    LatencyStats {
                        samples: row.get::<i64, _>("samples").max(0) as u64,
                        avg_ms: row.get::<Option<f64>, _>("avg_ms").unwrap_or(0.0),
                        min_ms: row.get::<Option<i64>, _>("min_ms").unwrap_or(0).max(0) as u64,
                        max_ms: row.get::<Option<i64>, _>("max_ms").unwrap_or(0).max(0) as u64,
                    },
                )
            })
            .collect()
    }

    /// Decision volume per backend over the last `time_window_hours`
    pub async fn get_backend_usage_stats(
        &self,
        time_window_hours: u32,
    ) -> BTreeMap<BackendId, UsageStats> {
        let rows = sqlx::query(
            r#"
            SELECT backend_id, content_type,
                   COUNT(*) AS decisions,
                   SUM(content_size) AS total_bytes
            FROM routing_decisions
            WHERE recorded_at_ms >= ?
            GROUP BY backend_id, content_type
            "#,
        )
        .bind(window_start_ms(time_window_hours))
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Usage query failed, returning empty result");
                return BTreeMap::new();
            }
        };

        let mut usage: BTreeMap<BackendId, UsageStats> = BTreeMap::new();
        for row in rows {
            let decisions = row.get::<i64, _>("decisions").max(0) as u64;
            let bytes = row.get::<Option<i64>, _>("total_bytes").unwrap_or(0).max(0) as u64;
            let stats = usage.entry(row.get::<String, _>("backend_id")).or_default();
            stats.decisions += decisions;
            stats.total_bytes += bytes;
            *stats
                .content_types
                .entry(row.get::<String, _>("content_type"))
                .or_default() += decisions;
        }
        usage
    }

    /// Most recent decisions, newest first
    pub async fn recent_decisions(&self, limit: u32) -> Vec<RoutingDecision> {
        let rows = sqlx::query(
            r#"
            SELECT id, recorded_at_ms, backend_id, strategy, priority, score,
                   content_type, content_size
            FROM routing_decisions
            ORDER BY recorded_at_ms DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows
                .into_iter()
                .map(|row| RoutingDecision {
                    id: row.get("id"),
                    timestamp: from_millis(row.get("recorded_at_ms")),
                    backend_id: row.get("backend_id"),
                    strategy: row
                        .get::<String, _>("strategy")
                        .parse()
                        .unwrap_or_default(),
                    priority: row
                        .get::<String, _>("priority")
                        .parse()
                        .unwrap_or_default(),
                    score: row.get("score"),
                    content_type: row.get("content_type"),
                    content_size: row.get::<i64, _>("content_size").max(0) as u64,
                    alternatives: Vec::new(),
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Recent decisions query failed, returning empty result");
                Vec::new()
            }
        }
    }

    /// Count stored rows per kind
    pub async fn row_counts(&self) -> Result<RowCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM routing_decisions) AS decisions,
                (SELECT COUNT(*) FROM routing_outcomes) AS outcomes,
                (SELECT COUNT(*) FROM backend_metrics) AS metrics
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(RowCounts {
            decisions: row.get::<i64, _>("decisions").max(0) as u64,
            outcomes: row.get::<i64, _>("outcomes").max(0) as u64,
            metrics: row.get::<i64, _>("metrics").max(0) as u64,
        })
    }

    /// Delete rows strictly older than `cutoff`
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<PruneReport> {
        let cutoff_ms = to_millis(&cutoff);
        let mut tx = self.pool.begin().await?;

        let decisions = sqlx::query("DELETE FROM routing_decisions WHERE recorded_at_ms < ?")
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let outcomes = sqlx::query("DELETE FROM routing_outcomes WHERE recorded_at_ms < ?")
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let metrics = sqlx::query("DELETE FROM backend_metrics WHERE recorded_at_ms < ?")
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        let report = PruneReport {
            decisions,
            outcomes,
            metrics,
        };
        if report.total() > 0 {
            info!(
                decisions = decisions,
                outcomes = outcomes,
                metrics = metrics,
                "Pruned metrics history"
            );
        }
        Ok(report)
    }

    /// Delete rows older than `retention_days`
    pub async fn prune(&self, retention_days: u32) -> Result<PruneReport> {
        self.prune_older_than(cutoff_before(Duration::days(i64::from(retention_days))))
            .await
    }

    /// Save the learned-score table, replacing rows with the same key
    pub async fn save_learned_scores(&self, rows: &[(LearnedKey, LearnedScore)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::persistence("learned scores", e))?;

        for (key, score) in rows {
            sqlx::query(
                r#"
                INSERT INTO learned_scores (
                    backend_id, content_type, ema, samples, successes, failures, updated_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(backend_id, content_type) DO UPDATE SET
                    ema = excluded.ema,
                    samples = excluded.samples,
                    successes = excluded.successes,
                    failures = excluded.failures,
                    updated_at_ms = excluded.updated_at_ms
                "#,
            )
            .bind(&key.backend_id)
            .bind(&key.content_type)
            .bind(score.ema)
            .bind(score.samples as i64)
            .bind(score.successes as i64)
            .bind(score.failures as i64)
            .bind(to_millis(&score.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::persistence("learned scores", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::persistence("learned scores", e))?;

        info!(count = rows.len(), "Saved learned scores");
        Ok(())
    }

    /// Load the persisted learned-score table
    pub async fn load_learned_scores(&self) -> Result<Vec<(LearnedKey, LearnedScore)>> {
        let rows = sqlx::query(
            r#"
            SELECT backend_id, content_type, ema, samples, successes, failures, updated_at_ms
            FROM learned_scores
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let result: Vec<_> = rows
            .into_iter()
            .map(|row| {
                (
                    LearnedKey::new(
                        row.get::<String, _>("backend_id"),
                        row.get::<String, _>("content_type"),
                    ),
                    LearnedScore {
                        ema: row.get::<f64, _>("ema").clamp(0.0, 1.0),
                        samples: row.get::<i64, _>("samples").max(0) as u64,
                        successes: row.get::<i64, _>("successes").max(0) as u64,
                        failures: row.get::<i64, _>("failures").max(0) as u64,
                        updated_at: from_millis(row.get("updated_at_ms")),
                    },
                )
            })
            .collect();

        debug!(count = result.len(), "Loaded learned scores");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{ContentDescriptor, MetricType, RoutingPriority, RoutingStrategy};
    use tempfile::{tempdir, TempDir};

    async fn create_test_store() -> (MetricsStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = MetricsStore::connect(&dir.path().join("metrics.db"))
            .await
            .unwrap();
        (store, dir)
    }

    fn pdf() -> ContentDescriptor {
        ContentDescriptor::new("application/pdf", 1_048_576)
    }

    fn decision(backend: &str) -> RoutingDecision {
        RoutingDecision::new(
            backend,
            0.7,
            RoutingStrategy::Hybrid,
            RoutingPriority::Balanced,
            &pdf(),
        )
    }

    #[tokio::test]
    async fn test_success_rate_over_last_hour() {
        let (store, _temp) = create_test_store().await;

        for i in 0..10 {
            let outcome = RoutingOutcome::new("a", &pdf(), i < 8);
            store.record_routing_outcome(&outcome).await.unwrap();
        }

        let rates = store.get_backend_success_rates(1).await;
        let a = rates.get("a").unwrap();
        assert_eq!(a.total, 10);
        assert_eq!(a.successes, 8);
        assert!((a.rate - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_window_returns_empty() {
        let store = MetricsStore::in_memory().await.unwrap();
        assert!(store.get_backend_success_rates(1).await.is_empty());
        assert!(store.get_backend_latency_stats(1).await.is_empty());
        assert!(store.get_backend_usage_stats(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_window_excludes_old_rows() {
        let store = MetricsStore::in_memory().await.unwrap();
        let old = RoutingOutcome::new("a", &pdf(), false).at(Utc::now() - Duration::hours(5));
        store.record_routing_outcome(&old).await.unwrap();
        store
            .record_routing_outcome(&RoutingOutcome::new("a", &pdf(), true))
            .await
            .unwrap();

        assert_eq!(store.get_backend_success_rates(1).await["a"].rate, 1.0);
        assert_eq!(store.get_backend_success_rates(24).await["a"].total, 2);
    }

    #[tokio::test]
    async fn test_latency_stats() {
        let store = MetricsStore::in_memory().await.unwrap();
        for ms in [10, 20, 30] {
            let outcome = RoutingOutcome::new("a", &pdf(), true).with_duration(Some(ms));
            store.record_routing_outcome(&outcome).await.unwrap();
        }
        store
            .record_routing_outcome(&RoutingOutcome::new("a", &pdf(), true))
            .await
            .unwrap();

        let stats = store.get_backend_latency_stats(1).await;
        let a = stats.get("a").unwrap();
        assert_eq!(a.samples, 3);
        assert!((a.avg_ms - 20.0).abs() < 1e-9);
        assert_eq!(a.min_ms, 10);
        assert_eq!(a.max_ms, 30);
    }

    #[tokio::test]
    async fn test_usage_stats_group_content_types() {
        let store = MetricsStore::in_memory().await.unwrap();
        store.record_routing_decision(&decision("a")).await.unwrap();
        store.record_routing_decision(&decision("a")).await.unwrap();
        let png = RoutingDecision::new(
            "a",
            0.5,
            RoutingStrategy::Cost,
            RoutingPriority::Cost,
            &ContentDescriptor::new("image/png", 100),
        );
        store.record_routing_decision(&png).await.unwrap();

        let usage = store.get_backend_usage_stats(1).await;
        let a = usage.get("a").unwrap();
        assert_eq!(a.decisions, 3);
        assert_eq!(a.total_bytes, 2 * 1_048_576 + 100);
        assert_eq!(a.content_types["application/pdf"], 2);
        assert_eq!(a.content_types["image/png"], 1);
    }

    #[tokio::test]
    async fn test_recent_decisions_round_trip() {
        let store = MetricsStore::in_memory().await.unwrap();
        let original = decision("b");
        store.record_routing_decision(&original).await.unwrap();

        let recent = store.recent_decisions(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, original.id);
        assert_eq!(recent[0].strategy, RoutingStrategy::Hybrid);
        assert_eq!(recent[0].content_size, 1_048_576);
    }

    #[tokio::test]
    async fn test_prune_is_idempotent() {
        let store = MetricsStore::in_memory().await.unwrap();
        let old = Utc::now() - Duration::days(40);

        store
            .record_routing_outcome(&RoutingOutcome::new("a", &pdf(), true).at(old))
            .await
            .unwrap();
        store
            .record_backend_metric(
                &BackendMetric::new("a", MetricType::Performance, "latency_ms", 12.0).at(old),
            )
            .await
            .unwrap();
        store
            .record_routing_outcome(&RoutingOutcome::new("a", &pdf(), true))
            .await
            .unwrap();

        let cutoff = Utc::now() - Duration::days(30);
        let first = store.prune_older_than(cutoff).await.unwrap();
        assert_eq!(first.outcomes, 1);
        assert_eq!(first.metrics, 1);

        let second = store.prune_older_than(cutoff).await.unwrap();
        assert_eq!(second.total(), 0);

        let counts = store.row_counts().await.unwrap();
        assert_eq!(counts.outcomes, 1);
    }

    #[tokio::test]
    async fn test_huge_windows_cover_all_history() {
        let store = MetricsStore::in_memory().await.unwrap();
        let old = Utc::now() - Duration::days(400);
        store
            .record_routing_outcome(&RoutingOutcome::new("a", &pdf(), true).at(old))
            .await
            .unwrap();
        store
            .record_routing_outcome(&RoutingOutcome::new("a", &pdf(), false))
            .await
            .unwrap();

        let rates = store.get_backend_success_rates(u32::MAX).await;
        assert_eq!(rates["a"].total, 2);
        assert!(!store.get_backend_latency_stats(u32::MAX).await.contains_key("b"));
        assert!(store.get_backend_usage_stats(u32::MAX).await.is_empty());

        let report = store.prune(1_000_000_000).await.unwrap();
        assert_eq!(report.total(), 0);
        let report = store.prune(u32::MAX).await.unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(store.row_counts().await.unwrap().outcomes, 2);
    }

    #[tokio::test]
    async fn test_closed_store_fails_writes_but_not_reads() {
        let store = MetricsStore::in_memory().await.unwrap();
        store.close().await;

        let err = store
            .record_routing_decision(&decision("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PersistenceFailure { .. }));
        assert!(store.get_backend_success_rates(1).await.is_empty());
        assert!(store.recent_decisions(5).await.is_empty());
    }

    #[tokio::test]
    async fn test_learned_scores_upsert() {
        let (store, _temp) = create_test_store().await;
        let key = LearnedKey::new("a", "application/pdf");
        let mut score = LearnedScore::seeded(0.5);

        store
            .save_learned_scores(&[(key.clone(), score.clone())])
            .await
            .unwrap();
        score.observe(false, 0.2);
        store
            .save_learned_scores(&[(key.clone(), score.clone())])
            .await
            .unwrap();

        let loaded = store.load_learned_scores().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, key);
        assert!((loaded[0].1.ema - 0.4).abs() < 1e-9);
        assert_eq!(loaded[0].1.failures, 1);
    }
}
