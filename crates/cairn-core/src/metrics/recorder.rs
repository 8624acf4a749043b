//! Fire-and-forget writer in front of the metrics store
//!
//! Callers enqueue rows without waiting; a single worker task drains the
//! queue in order. Because one worker handles every row, a decision is always
//! written before any outcome enqueued after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::store::MetricsStore;
use crate::routing::{BackendMetric, RoutingDecision, RoutingOutcome};

enum Command {
    Decision(RoutingDecision),
    Outcome(RoutingOutcome),
    Metric(BackendMetric),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Counters of the recorder queue
#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of the recorder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStats {
    /// Rows persisted
    pub written: u64,
    /// Rows the store rejected
    pub failed: u64,
    /// Rows discarded because the queue was full or closed
    pub dropped: u64,
}

/// Queue-backed metrics writer
#[derive(Debug)]
pub struct MetricsRecorder {
    tx: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Decision(_) => "Decision",
            Command::Outcome(_) => "Outcome",
            Command::Metric(_) => "Metric",
            Command::Flush(_) => "Flush",
            Command::Shutdown(_) => "Shutdown",
        };
        f.write_str(name)
    }
}

impl MetricsRecorder {
    /// Start the writer task; must be called inside a Tokio runtime
    pub fn spawn(store: Arc<MetricsStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_worker(store, rx, counters.clone()));

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            counters,
        }
    }

    /// Queue a decision row
    pub fn record_decision(&self, decision: RoutingDecision) -> bool {
        self.enqueue(Command::Decision(decision))
    }

    /// Queue an outcome row
    pub fn record_outcome(&self, outcome: RoutingOutcome) -> bool {
        self.enqueue(Command::Outcome(outcome))
    }

    /// Queue a backend metric row
    pub fn record_metric(&self, metric: BackendMetric) -> bool {
        self.enqueue(Command::Metric(metric))
    }

    fn enqueue(&self, command: Command) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "recorder stopped",
                };
                warn!(reason = reason, dropped = dropped, "Dropped metrics row");
                false
            }
        }
    }

    /// Wait until every row queued before this call has been handled
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Drain the queue and stop the writer
    ///
    /// Rows queued afterwards are dropped. Calling this twice is harmless.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Metrics writer task failed");
            }
        }
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    store: Arc<MetricsStore>,
    mut rx: mpsc::Receiver<Command>,
    counters: Arc<Counters>,
) {
    debug!("Metrics writer started");

    while let Some(command) = rx.recv().await {
        let result = match command {
            Command::Decision(decision) => store.record_routing_decision(&decision).await,
            Command::Outcome(outcome) => store.record_routing_outcome(&outcome).await,
            Command::Metric(metric) => store.record_backend_metric(&metric).await,
            Command::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
            Command::Shutdown(ack) => {
                rx.close();
                // Rows that raced in ahead of the close are still written
                while let Ok(rest) = rx.try_recv() {
                    write_leftover(&store, rest, &counters).await;
                }
                let _ = ack.send(());
                break;
            }
        };
        tally(&counters, result);
    }

    debug!("Metrics writer stopped");
}

async fn write_leftover(store: &MetricsStore, command: Command, counters: &Counters) {
    let result = match command {
        Command::Decision(decision) => store.record_routing_decision(&decision).await,
        Command::Outcome(outcome) => store.record_routing_outcome(&outcome).await,
        Command::Metric(metric) => store.record_backend_metric(&metric).await,
        Command::Flush(ack) | Command::Shutdown(ack) => {
            let _ = ack.send(());
            return;
        }
    };
    tally(counters, result);
}

fn tally(counters: &Counters, result: crate::Result<()>) {
    match result {
        Ok(()) => {
            counters.written.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Metrics write failed");
        }
    }
}
