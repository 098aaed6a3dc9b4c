//! Operation lifecycle tracking.
//!
//! 1. **Admission** (`registry`): `TrackingRegistry::create_request` wraps an
//!    inbound `Request` in an `OperationTracker` and records its transport stages.
//! 2. **Tracking** (`op`): workers append stages, attach sessions and reply
//!    through the shared `Arc<OperationTracker>`.
//! 3. **Diagnostics** (`registry`, `sweep`): in-flight and historic dumps and
//!    the periodic slow-op check, run on a `worker::BackgroundWorker`.

pub mod config;
pub mod error;
pub mod op;
pub mod registry;
pub mod sweep;
pub mod timeline;
pub mod worker;

pub use config::TrackerConfig;
pub use error::{ReplyError, TrackError};
pub use op::OperationTracker;
pub use registry::{HistoricOp, SlowOp, SlowOpReport, TrackerId, TrackingRegistry};
pub use sweep::{SweepRunnable, SweepTask, SweepWorker};
pub use timeline::{labels, TimelineEvent};
pub use worker::{BackgroundRunnable, BackgroundWorker};
