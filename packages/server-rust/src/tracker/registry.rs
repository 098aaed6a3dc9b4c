//! The tracking registry: owner of every in-flight operation's timeline.
//!
//! Timelines live here, not in the trackers. They are spread over a fixed set
//! of `parking_lot::Mutex` shards keyed by tracker id, and every append and
//! every read goes through the owning shard's lock. A registry-wide dump or
//! sweep can therefore walk many timelines under a handful of locks without
//! any per-tracker lock ordering.
//!
//! Trackers are created only through [`TrackingRegistry::create_request`]
//! and unregister themselves when their last reference is dropped; their
//! final timeline then moves into a bounded history of completed ops.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use optrack_core::{ClockSource, FormatError, Formatter, Stamp, SystemClock};
use parking_lot::Mutex;

use super::config::TrackerConfig;
use super::error::TrackError;
use super::op::OperationTracker;
use super::timeline::{dump_events, labels, TimelineEvent};
use crate::network::Request;

/// Identifier of a tracked operation, unique within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerId(pub u64);

// ---------------------------------------------------------------------------
// Shard state
// ---------------------------------------------------------------------------

struct Slot {
    description: String,
    initiated_at: Stamp,
    timeline: Vec<TimelineEvent>,
    /// Number of slow-op warnings already issued for this op.
    warnings: u32,
}

#[derive(Default)]
struct Shard {
    slots: HashMap<TrackerId, Slot>,
}

/// Point-in-time copy of an in-flight op, taken under its shard lock.
struct InFlightSnapshot {
    id: TrackerId,
    description: String,
    initiated_at: Stamp,
    timeline: Vec<TimelineEvent>,
}

/// A completed operation retained for post-mortem dumps.
#[derive(Debug, Clone)]
pub struct HistoricOp {
    pub id: TrackerId,
    pub description: String,
    pub initiated_at: Stamp,
    pub completed_at: Stamp,
    pub timeline: Vec<TimelineEvent>,
}

impl HistoricOp {
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.completed_at.saturating_sub(self.initiated_at)
    }
}

// ---------------------------------------------------------------------------
// Slow-op report
// ---------------------------------------------------------------------------

/// An in-flight op that was warned about during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowOp {
    pub id: TrackerId,
    pub description: String,
    pub age: Duration,
    /// Label of the most recent timeline entry, if any.
    pub current_stage: Option<String>,
}

/// Outcome of [`TrackingRegistry::check_ops_in_flight`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlowOpReport {
    pub in_flight: usize,
    /// Ops older than the complaint time, warned or not.
    pub slow: usize,
    pub oldest_age: Duration,
    /// Ops warned about in this sweep, oldest first.
    pub warned: Vec<SlowOp>,
}

impl SlowOpReport {
    #[must_use]
    pub fn has_slow_ops(&self) -> bool {
        self.slow > 0
    }
}

// ---------------------------------------------------------------------------
// RegistryInner
// ---------------------------------------------------------------------------

/// Shared state behind a [`TrackingRegistry`]. Each tracker keeps an `Arc`
/// to it so it can append events and unregister on drop.
pub(crate) struct RegistryInner {
    config: TrackerConfig,
    clock: Arc<dyn ClockSource>,
    shards: Box<[Mutex<Shard>]>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    history: Mutex<VecDeque<HistoricOp>>,
}

impl RegistryInner {
    fn shard(&self, id: TrackerId) -> &Mutex<Shard> {
        #[allow(clippy::cast_possible_truncation)]
        let index = (id.0 % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    pub(crate) fn now(&self) -> Stamp {
        self.clock.now()
    }

    pub(crate) fn acquire_slot(
        &self,
        description: String,
        initiated_at: Stamp,
    ) -> Result<TrackerId, TrackError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(TrackError::Closed);
        }
        let id = TrackerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shard(id).lock().slots.insert(
            id,
            Slot {
                description,
                initiated_at,
                timeline: Vec::new(),
                warnings: 0,
            },
        );
        metrics::gauge!("optrack_ops_in_flight").increment(1.0);
        Ok(id)
    }

    pub(crate) fn mark_event(&self, id: TrackerId, label: Cow<'static, str>, stamp: Stamp) {
        let mut shard = self.shard(id).lock();
        match shard.slots.get_mut(&id) {
            Some(slot) => slot.timeline.push(TimelineEvent { stamp, label }),
            None => tracing::debug!(op = id.0, event = %label, "event for retired op dropped"),
        }
    }

    /// Runs `f` over the timeline of `id` while holding its shard lock.
    ///
    /// The guard is released when `f` returns, on success and on error.
    pub(crate) fn with_timeline<R>(&self, id: TrackerId, f: impl FnOnce(&[TimelineEvent]) -> R) -> R {
        let shard = self.shard(id).lock();
        let events = shard.slots.get(&id).map_or(&[][..], |slot| &slot.timeline[..]);
        f(events)
    }

    /// Unregisters `id` and files its timeline into history.
    pub(crate) fn retire(&self, id: TrackerId) {
        let Some(slot) = self.shard(id).lock().slots.remove(&id) else {
            return;
        };
        let completed_at = self.now();
        let mut timeline = slot.timeline;
        timeline.push(TimelineEvent::new(completed_at, labels::DONE));

        let op = HistoricOp {
            id,
            description: slot.description,
            initiated_at: slot.initiated_at,
            completed_at,
            timeline,
        };
        metrics::gauge!("optrack_ops_in_flight").decrement(1.0);
        metrics::histogram!("optrack_op_duration_seconds").record(op.duration().as_secs_f64());
        tracing::trace!(op = id.0, duration_ms = millis(op.duration()), "op retired");

        let mut history = self.history.lock();
        if self.config.history_size > 0 {
            history.push_back(op);
        }
        self.prune_history(&mut history, completed_at);
    }

    fn prune_history(&self, history: &mut VecDeque<HistoricOp>, now: Stamp) {
        while history.len() > self.config.history_size {
            history.pop_front();
        }
        let max_age = self.config.history_duration();
        while history
            .front()
            .is_some_and(|op| now.saturating_sub(op.completed_at) > max_age)
        {
            history.pop_front();
        }
    }

    fn snapshot_in_flight(&self) -> Vec<InFlightSnapshot> {
        let mut ops = Vec::new();
        for shard in &*self.shards {
            let shard = shard.lock();
            ops.extend(shard.slots.iter().map(|(id, slot)| InFlightSnapshot {
                id: *id,
                description: slot.description.clone(),
                initiated_at: slot.initiated_at,
                timeline: slot.timeline.clone(),
            }));
        }
        ops.sort_by_key(|op| (op.initiated_at, op.id));
        ops
    }
}

// ---------------------------------------------------------------------------
// TrackingRegistry
// ---------------------------------------------------------------------------

/// Admits inbound requests into tracking and answers "what is in flight".
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct TrackingRegistry {
    inner: Arc<RegistryInner>,
}

impl TrackingRegistry {
    /// Creates a registry reading time from the system clock.
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(config: TrackerConfig, clock: Arc<dyn ClockSource>) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(RegistryInner {
                config,
                clock,
                shards,
                next_id: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn now(&self) -> Stamp {
        self.inner.now()
    }

    /// Wraps `request` in a new tracked operation.
    ///
    /// # Errors
    ///
    /// Returns [`TrackError::Closed`] after [`TrackingRegistry::shutdown`]
    /// and [`TrackError::AlreadyTracked`] while another tracker still wraps
    /// `request`.
    /// A rejected request keeps no extra reference to it, its connection, or
    /// its session.
    pub fn create_request(&self, request: Arc<Request>) -> Result<Arc<OperationTracker>, TrackError> {
        let op = OperationTracker::from_request(request, &self.inner)?;
        tracing::debug!(op = op.id().0, kind = op.message().kind_name(), "op admitted");
        Ok(Arc::new(op))
    }

    /// Appends `label` at `stamp` to the timeline of `id`. Events for ops
    /// that already retired are dropped.
    pub fn mark_event(&self, id: TrackerId, label: impl Into<Cow<'static, str>>, stamp: Stamp) {
        self.inner.mark_event(id, label.into(), stamp);
    }

    /// Stops admitting new requests. Ops already in flight are unaffected.
    pub fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        tracing::info!(in_flight = self.in_flight_count(), "op tracking shut down");
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().slots.len()).sum()
    }

    /// Completed ops still retained, oldest first.
    #[must_use]
    pub fn historic_ops(&self) -> Vec<HistoricOp> {
        let mut history = self.inner.history.lock();
        self.inner.prune_history(&mut history, self.now());
        history.iter().cloned().collect()
    }

    /// Renders every in-flight op, oldest first.
    ///
    /// Timelines are copied shard by shard under their locks and rendered
    /// after the locks are released, so a failing sink never holds a shard.
    ///
    /// # Errors
    ///
    /// Propagates the first error raised by the formatter.
    pub fn dump_ops_in_flight(&self, now: Stamp, f: &mut dyn Formatter) -> Result<(), FormatError> {
        let ops = self.inner.snapshot_in_flight();
        f.open_object_section("ops_in_flight")?;
        f.open_array_section("ops")?;
        for op in &ops {
            dump_op(
                f,
                &op.description,
                op.initiated_at,
                now.saturating_sub(op.initiated_at),
                &op.timeline,
            )?;
        }
        f.close_section()?;
        f.dump_field("num_ops", ops.len().into())?;
        f.close_section()
    }

    /// Renders the retained completed ops, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates the first error raised by the formatter.
    pub fn dump_historic_ops(&self, now: Stamp, f: &mut dyn Formatter) -> Result<(), FormatError> {
        let ops = {
            let mut history = self.inner.history.lock();
            self.inner.prune_history(&mut history, now);
            history.iter().cloned().collect::<Vec<_>>()
        };
        f.open_object_section("op_history")?;
        f.dump_field("size", self.inner.config.history_size.into())?;
        f.dump_field("duration", self.inner.config.history_duration().as_secs_f64().into())?;
        f.open_array_section("ops")?;
        for op in &ops {
            dump_op(f, &op.description, op.initiated_at, op.duration(), &op.timeline)?;
        }
        f.close_section()?;
        f.close_section()
    }

    /// Finds ops older than the complaint time and warns about the oldest.
    ///
    /// At most `log_threshold` ops are warned about per call. Each op is
    /// re-warned only after its age crosses the next backoff step
    /// (`complaint_time * warn_backoff_multiplier^warnings`). Deciding what
    /// to do about a slow op is left to the caller.
    pub fn check_ops_in_flight(&self, now: Stamp) -> SlowOpReport {
        let config = &self.inner.config;
        let complaint = config.complaint_time();
        let mut report = SlowOpReport::default();
        if complaint.is_zero() {
            report.in_flight = self.in_flight_count();
            return report;
        }

        let mut due = Vec::new();
        for shard in &*self.inner.shards {
            let shard = shard.lock();
            report.in_flight += shard.slots.len();
            for (id, slot) in &shard.slots {
                let age = now.saturating_sub(slot.initiated_at);
                report.oldest_age = report.oldest_age.max(age);
                if age <= complaint {
                    continue;
                }
                report.slow += 1;
                if age > warn_threshold(complaint, config.warn_backoff_multiplier, slot.warnings) {
                    due.push((slot.initiated_at, *id, age));
                }
            }
        }

        due.sort_by_key(|(initiated_at, id, _)| (*initiated_at, *id));
        due.truncate(config.log_threshold);

        for (_, id, age) in due {
            let mut shard = self.inner.shard(id).lock();
            // Retired between the two passes.
            let Some(slot) = shard.slots.get_mut(&id) else {
                continue;
            };
            slot.warnings = slot.warnings.saturating_add(1);
            let current_stage = slot.timeline.last().map(|e| e.label.to_string());
            tracing::warn!(
                op = id.0,
                age_ms = millis(age),
                initiated_at = %slot.initiated_at,
                stage = current_stage.as_deref().unwrap_or("none"),
                "slow request: {}",
                slot.description
            );
            report.warned.push(SlowOp {
                id,
                description: slot.description.clone(),
                age,
                current_stage,
            });
        }

        if report.has_slow_ops() {
            metrics::counter!("optrack_slow_op_warnings_total")
                .increment(u64::try_from(report.warned.len()).unwrap_or(u64::MAX));
            tracing::warn!(
                slow = report.slow,
                oldest_ms = millis(report.oldest_age),
                "{} slow requests, oldest blocked for {:.3}s",
                report.slow,
                report.oldest_age.as_secs_f64()
            );
        }
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("optrack_ops_slow").set(report.slow as f64);
        report
    }
}

impl std::fmt::Debug for TrackingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingRegistry")
            .field("config", &self.inner.config)
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn warn_threshold(complaint: Duration, multiplier: u32, warnings: u32) -> Duration {
    let factor = multiplier.max(1).checked_pow(warnings).unwrap_or(u32::MAX);
    complaint.saturating_mul(factor)
}

fn dump_op(
    f: &mut dyn Formatter,
    description: &str,
    initiated_at: Stamp,
    age: Duration,
    timeline: &[TimelineEvent],
) -> Result<(), FormatError> {
    f.open_object_section("op")?;
    f.dump_field("description", description.into())?;
    f.dump_field("initiated_at", initiated_at.into())?;
    f.dump_field("age", age.as_secs_f64().into())?;
    f.open_object_section("type_data")?;
    f.open_array_section("events")?;
    dump_events(timeline, f)?;
    f.close_section()?;
    f.close_section()?;
    f.close_section()
}
