//! Optional periodic work: metric collection and retention pruning
//!
//! Every task runs under its own child of a root cancellation token, so
//! tasks can be stopped one at a time or all together. Routing never depends
//! on any of them.

mod probe;

pub use probe::{collect_once, BackendProbe, ProbeReport};

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Task name of the metric collector
pub const COLLECTOR_TASK: &str = "metrics-collector";
/// Task name of the retention pruner
pub const PRUNER_TASK: &str = "metrics-pruner";

#[derive(Debug)]
struct TaskHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of named, individually cancellable tasks
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    root: CancellationToken,
    tasks: DashMap<String, TaskHandle>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period` until the task is stopped
    ///
    /// The first tick fires immediately. A tick in progress is abandoned
    /// when the task is cancelled. Replaces a running task with the same name.
    pub fn spawn_periodic<F, Fut>(&self, name: &str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let task_token = token.clone();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = tick() => {}
                }
            }
            debug!(task = %task_name, "Background task exited");
        });

        info!(task = %name, period_secs = period.as_secs(), "Started background task");
        if let Some(previous) = self
            .tasks
            .insert(name.to_string(), TaskHandle { token, handle })
        {
            previous.token.cancel();
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Names of registered tasks, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Stop one task and wait for it to exit
    ///
    /// Returns `false` if no task has that name.
    pub async fn stop_task(&self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some((_, task)) => {
                task.token.cancel();
                join(name, task.handle).await;
                true
            }
            None => false,
        }
    }

    /// Stop every task and wait for all of them
    pub async fn shutdown(&self) {
        self.root.cancel();
        let names = self.names();
        for name in names {
            if let Some((_, task)) = self.tasks.remove(&name) {
                join(&name, task.handle).await;
            }
        }
    }
}

async fn join(name: &str, handle: JoinHandle<()>) {
    match handle.await {
        Ok(()) => info!(task = %name, "Stopped background task"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!(task = %name, error = %e, "Background task panicked"),
    }
}
