//! Generic background worker.
//!
//! A [`BackgroundWorker`] drives a [`BackgroundRunnable`] on its own tokio
//! task: queued tasks are handed to `run`, a periodic tick calls `on_tick`,
//! and `shutdown` runs once when the worker stops.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const TASK_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// BackgroundRunnable
// ---------------------------------------------------------------------------

/// Work executed on a [`BackgroundWorker`]'s task.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on every tick after the first. No-op by default.
    async fn on_tick(&mut self) {}

    /// Called once after the loop exits. No-op by default.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a running background task.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns `runnable` on a new task, ticking every `tick_interval`.
    ///
    /// Must be called from within a tokio runtime. A zero interval is
    /// raised to one millisecond.
    #[must_use]
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(tick_interval.max(Duration::from_millis(1)));
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticks.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticks.tick() => runnable.on_tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues `task` for the runnable.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the task and waits for `shutdown` to complete.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
