//! Background sweep over in-flight operations.
//!
//! [`SweepRunnable`] runs on a [`BackgroundWorker`]: every tick calls
//! [`TrackingRegistry::check_ops_in_flight`], and on-demand checks and dumps
//! arrive as [`SweepTask`]s, so admin requests never render a registry-wide
//! dump on a request worker.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use optrack_core::{FormatError, JsonFormatter};
use serde_json::Value;
use tokio::sync::oneshot;

use super::registry::{millis, SlowOpReport, TrackingRegistry};
use super::worker::{BackgroundRunnable, BackgroundWorker};

/// Requests served by the sweep task.
#[derive(Debug)]
pub enum SweepTask {
    /// Run a slow-op check now instead of waiting for the next tick.
    CheckNow(oneshot::Sender<SlowOpReport>),
    /// Render every in-flight op as JSON.
    DumpInFlight(oneshot::Sender<Result<Value, FormatError>>),
    /// Render the retained completed ops as JSON.
    DumpHistoric(oneshot::Sender<Result<Value, FormatError>>),
}

pub struct SweepRunnable {
    registry: TrackingRegistry,
}

impl SweepRunnable {
    #[must_use]
    pub fn new(registry: TrackingRegistry) -> Self {
        Self { registry }
    }

    fn check(&self) -> SlowOpReport {
        let report = self.registry.check_ops_in_flight(self.registry.now());
        tracing::trace!(
            in_flight = report.in_flight,
            slow = report.slow,
            "op sweep complete"
        );
        report
    }
}

#[async_trait]
impl BackgroundRunnable for SweepRunnable {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        // A dropped reply receiver only means the caller stopped waiting.
        match task {
            SweepTask::CheckNow(reply) => {
                let _ = reply.send(self.check());
            }
            SweepTask::DumpInFlight(reply) => {
                let mut f = JsonFormatter::new();
                let value = self
                    .registry
                    .dump_ops_in_flight(self.registry.now(), &mut f)
                    .and_then(|()| f.finish());
                let _ = reply.send(value);
            }
            SweepTask::DumpHistoric(reply) => {
                let mut f = JsonFormatter::new();
                let value = self
                    .registry
                    .dump_historic_ops(self.registry.now(), &mut f)
                    .and_then(|()| f.finish());
                let _ = reply.send(value);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.check();
    }

    async fn shutdown(&mut self) {
        tracing::debug!(in_flight = self.registry.in_flight_count(), "op sweep stopped");
    }
}

/// The sweep task's handle.
pub type SweepWorker = BackgroundWorker<SweepRunnable>;

impl BackgroundWorker<SweepRunnable> {
    /// Spawns the sweep, ticking every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn sweep(registry: TrackingRegistry, interval: Duration) -> Self {
        tracing::debug!(interval_ms = millis(interval), "op sweep started");
        Self::start(SweepRunnable::new(registry), interval)
    }

    /// Starts the sweep using the registry's configured interval.
    #[must_use]
    pub fn from_config(registry: TrackingRegistry) -> Self {
        let interval = registry.config().sweep_interval();
        Self::sweep(registry, interval)
    }

    /// Runs a slow-op check on the sweep task and returns its report.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn check_now(&self) -> anyhow::Result<SlowOpReport> {
        let (reply, rx) = oneshot::channel();
        self.submit(SweepTask::CheckNow(reply)).await?;
        rx.await.context("sweep worker dropped the check")
    }

    /// Renders the in-flight dump on the sweep task.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or rendering failed.
    pub async fn dump_in_flight(&self) -> anyhow::Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.submit(SweepTask::DumpInFlight(reply)).await?;
        Ok(rx.await.context("sweep worker dropped the dump")??)
    }

    /// Renders the historic-ops dump on the sweep task.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or rendering failed.
    pub async fn dump_historic(&self) -> anyhow::Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.submit(SweepTask::DumpHistoric(reply)).await?;
        Ok(rx.await.context("sweep worker dropped the dump")??)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use optrack_core::{Envelope, ManualClock, Message, Ping, Stamp};

    use super::*;
    use crate::network::Request;
    use crate::tracker::TrackerConfig;

    const T0: u64 = 1_700_000_000_000;

    fn setup(complaint_time_ms: u64) -> (TrackingRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Stamp::from_millis(T0)));
        let config = TrackerConfig {
            complaint_time_ms,
            ..TrackerConfig::default()
        };
        (TrackingRegistry::with_clock(config, clock.clone()), clock)
    }

    fn request() -> Arc<Request> {
        let envelope = Envelope {
            recv_stamp: Stamp::from_millis(T0),
            ..Envelope::default()
        };
        Arc::new(Request::new(envelope, Message::Ping(Ping { seq: 4 }), None))
    }

    #[tokio::test]
    async fn check_now_reports_slow_ops() {
        let (registry, clock) = setup(1_000);
        let _op = registry.create_request(request()).unwrap();
        clock.advance(Duration::from_secs(3));

        let mut worker = SweepWorker::sweep(registry, Duration::from_secs(60));
        let report = worker.check_now().await.unwrap();
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.slow, 1);
        assert_eq!(report.warned[0].description, "ping(seq=4)");

        worker.stop().await;
    }

    #[tokio::test]
    async fn dumps_render_json() {
        let (registry, clock) = setup(1_000);
        let op = registry.create_request(request()).unwrap();
        clock.advance(Duration::from_millis(500));

        let mut worker = SweepWorker::sweep(registry.clone(), Duration::from_secs(60));
        let in_flight = worker.dump_in_flight().await.unwrap();
        assert_eq!(in_flight["ops_in_flight"]["num_ops"], 1);
        assert_eq!(in_flight["ops_in_flight"]["ops"][0]["age"], 0.5);

        drop(op);
        let historic = worker.dump_historic().await.unwrap();
        assert_eq!(historic["op_history"]["ops"].as_array().unwrap().len(), 1);

        worker.stop().await;
    }

    #[tokio::test]
    async fn ticks_run_checks_in_background() {
        let (registry, clock) = setup(1_000);
        let _op = registry.create_request(request()).unwrap();
        clock.advance(Duration::from_secs(2));

        let mut worker = SweepWorker::sweep(registry.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        worker.stop().await;

        // The background ticks already warned once, so an immediate re-check
        // is inside the backoff window.
        let report = registry.check_ops_in_flight(registry.now());
        assert_eq!(report.slow, 1);
        assert!(report.warned.is_empty());
    }

    #[tokio::test]
    async fn calls_after_stop_fail() {
        let (registry, _clock) = setup(1_000);
        let mut worker = SweepWorker::from_config(registry);
        worker.stop().await;

        assert!(worker.check_now().await.is_err());
        assert!(worker.dump_in_flight().await.is_err());
    }
}
