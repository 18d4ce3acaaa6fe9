//! Named background tasks that share one shutdown broadcast.

use std::{future::Future, time::Duration};

use futures::{StreamExt, stream::FuturesUnordered};
use tokio::{
    sync::broadcast,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info, warn};

use crate::metrics::registry::{SHUTDOWN_TIMEOUTS_TOTAL, TASKS_ACTIVE, TASKS_FINISHED_TOTAL};

/// How the tasks ended during [`TaskSet::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: usize,
    pub cancelled: usize,
    pub panicked: usize,
    pub timed_out: bool,
}

impl ShutdownReport {
    fn record(&mut self, name: &str, result: Result<(), JoinError>) {
        let outcome = match result {
            Ok(()) => {
                self.completed += 1;
                debug!(event.name = "task.completed", task.name = %name, "task completed");
                "completed"
            }
            Err(e) if e.is_cancelled() => {
                self.cancelled += 1;
                warn!(event.name = "task.cancelled", task.name = %name, "task cancelled forcefully");
                "cancelled"
            }
            Err(e) => {
                self.panicked += 1;
                error!(event.name = "task.panic", task.name = %name, error.message = ?e, "task panicked");
                "panicked"
            }
        };
        TASKS_ACTIVE.with_label_values(&[name]).dec();
        TASKS_FINISHED_TOTAL.with_label_values(&[name, outcome]).inc();
    }
}

pub struct TaskSet {
    tasks: Vec<(String, JoinHandle<()>)>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            tasks: Vec::new(),
            shutdown_tx,
        }
    }

    /// A receiver that observes the next [`initiate_shutdown`](Self::initiate_shutdown).
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name.to_string(), tokio::spawn(future)));
        TASKS_ACTIVE.with_label_values(&[name]).inc();
        debug!(event.name = "task.spawned", task.name = %name, "task spawned");
    }

    /// Spawns `make(shutdown_rx)` with a freshly subscribed receiver.
    pub fn spawn_with_shutdown<F, Fut>(&mut self, name: &str, make: F)
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let future = make(self.subscribe());
        self.spawn(name, future);
    }

    pub fn initiate_shutdown(&self) {
        info!(
            event.name = "tasks.shutdown_initiated",
            active_tasks = self.tasks.len(),
            "broadcasting shutdown signal to all tasks"
        );
        // no receivers left is fine, everyone is already gone
        let _ = self.shutdown_tx.send(());
    }

    /// Broadcasts shutdown and waits up to `limit` for every task. Tasks still
    /// running at the deadline are aborted.
    pub async fn shutdown(self, limit: Duration) -> ShutdownReport {
        self.initiate_shutdown();

        let mut report = ShutdownReport::default();
        let aborts: Vec<_> = self.tasks.iter().map(|(_, h)| h.abort_handle()).collect();
        let mut pending: FuturesUnordered<_> = self
            .tasks
            .into_iter()
            .map(|(name, handle)| async move { (name, handle.await) })
            .collect();

        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((name, result)) => report.record(&name, result),
                    None => return report,
                },
                _ = &mut deadline => break,
            }
        }

        warn!(
            event.name = "tasks.shutdown_timeout",
            timeout_ms = limit.as_millis() as u64,
            remaining = pending.len(),
            "graceful shutdown timed out, cancelling remaining tasks"
        );
        SHUTDOWN_TIMEOUTS_TOTAL.inc();
        report.timed_out = true;

        // aborting a finished task is a no-op
        for abort in &aborts {
            abort.abort();
        }
        while let Some((name, result)) = pending.next().await {
            report.record(&name, result);
        }
        report
    }
}
