//! Backend health probing collaborator

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::routing::{metric_names, BackendId, BackendMetric, MetricType};

/// Result of probing one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub available: bool,
    /// Round-trip latency of the probe, if it completed
    pub latency_ms: Option<f64>,
    /// Current load (0.0 to 1.0), if the backend reports one
    pub utilization: Option<f64>,
}

impl ProbeReport {
    pub fn available(latency_ms: f64) -> Self {
        Self {
            available: true,
            latency_ms: Some(latency_ms),
            utilization: None,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            latency_ms: None,
            utilization: None,
        }
    }

    pub fn with_utilization(mut self, utilization: f64) -> Self {
        self.utilization = Some(utilization);
        self
    }

    /// Convert into metric rows for `backend_id`
    pub fn into_metrics(self, backend_id: &str) -> Vec<BackendMetric> {
        let mut metrics = vec![BackendMetric::new(
            backend_id,
            MetricType::Reliability,
            metric_names::AVAILABILITY,
            if self.available { 1.0 } else { 0.0 },
        )];

        if self.available {
            if let Some(latency) = self.latency_ms {
                metrics.push(BackendMetric::new(
                    backend_id,
                    MetricType::Performance,
                    metric_names::LATENCY_MS,
                    latency,
                ));
            }
        }
        if let Some(utilization) = self.utilization {
            metrics.push(BackendMetric::new(
                backend_id,
                MetricType::Performance,
                metric_names::UTILIZATION,
                utilization,
            ));
        }
        metrics
    }
}

/// Health probe supplied by the component that talks to real backends
///
/// The engine never performs storage operations itself; it only asks the
/// collaborator how a backend is doing.
#[async_trait]
pub trait BackendProbe: Send + Sync {
    async fn probe(&self, backend_id: &str) -> Result<ProbeReport>;
}

/// Probe every backend concurrently
///
/// A failing probe counts as the backend being unavailable.
pub async fn collect_once(probe: &dyn BackendProbe, backends: &[BackendId]) -> Vec<BackendMetric> {
    let reports = join_all(backends.iter().map(|id| async move {
        let report = match probe.probe(id).await {
            Ok(report) => report,
            Err(e) => {
                warn!(backend_id = %id, error = %e, "Backend probe failed");
                ProbeReport::unavailable()
            }
        };
        report.into_metrics(id)
    }))
    .await;

    reports.into_iter().flatten().collect()
}
