//! Timeline entries and the stage labels recorded by the tracker.

use std::borrow::Cow;

use optrack_core::{FormatError, Formatter, Stamp};

/// Stage labels recorded on every tracked operation.
pub mod labels {
    pub const HEADER_READ: &str = "header_read";
    pub const THROTTLED: &str = "throttled";
    pub const ALL_READ: &str = "all_read";
    pub const DISPATCHED: &str = "dispatched";
    pub const DEQUEUED: &str = "dequeued";
    pub const REPLY_SENT: &str = "reply_sent";
    /// Appended to the historic copy when the operation is torn down.
    pub const DONE: &str = "done";
}

/// One (timestamp, label) entry of an operation's timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEvent {
    pub stamp: Stamp,
    pub label: Cow<'static, str>,
}

impl TimelineEvent {
    #[must_use]
    pub fn new(stamp: Stamp, label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            stamp,
            label: label.into(),
        }
    }
}

/// Writes `events` as `{time, event}` objects into the currently open section.
pub(crate) fn dump_events(
    events: &[TimelineEvent],
    f: &mut dyn Formatter,
) -> Result<(), FormatError> {
    for event in events {
        f.open_object_section("event")?;
        f.dump_field("time", event.stamp.into())?;
        f.dump_field("event", event.label.as_ref().into())?;
        f.close_section()?;
    }
    Ok(())
}
