//! Wall-clock timestamps for operation timelines.
//!
//! A [`Stamp`] is a seconds/nanoseconds pair since the Unix epoch. The
//! all-zero value [`Stamp::UNSET`] is the sentinel the transport layer leaves
//! in place when it never recorded a stage; it is a valid value everywhere a
//! `Stamp` is accepted.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A point in wall-clock time, or the unset sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Whole seconds since the Unix epoch.
    pub secs: u64,
    /// Sub-second nanoseconds, always below one billion.
    pub nanos: u32,
}

impl Stamp {
    /// Sentinel for a lifecycle stage that never occurred or was never recorded.
    pub const UNSET: Stamp = Stamp { secs: 0, nanos: 0 };

    /// Builds a stamp, carrying excess nanoseconds into seconds.
    #[must_use]
    pub fn new(secs: u64, nanos: u32) -> Self {
        let carry = u64::from(nanos) / NANOS_PER_SEC;
        #[allow(clippy::cast_possible_truncation)]
        let nanos = (u64::from(nanos) % NANOS_PER_SEC) as u32;
        Self {
            secs: secs.saturating_add(carry),
            nanos,
        }
    }

    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let nanos = ((millis % 1000) * 1_000_000) as u32;
        Self {
            secs: millis / 1000,
            nanos,
        }
    }

    #[must_use]
    pub fn as_millis(&self) -> u64 {
        self.secs
            .saturating_mul(1000)
            .saturating_add(u64::from(self.nanos) / 1_000_000)
    }

    /// Returns `true` for the [`Stamp::UNSET`] sentinel.
    #[must_use]
    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[must_use]
    pub fn saturating_sub(&self, earlier: Stamp) -> Duration {
        self.as_duration()
            .checked_sub(earlier.as_duration())
            .unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn checked_add(&self, delta: Duration) -> Option<Stamp> {
        self.as_duration().checked_add(delta).map(Stamp::from)
    }

    fn as_duration(self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }
}

impl From<Duration> for Stamp {
    fn from(since_epoch: Duration) -> Self {
        Self {
            secs: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.nanos / 1000)
    }
}

/// Abstraction over the wall clock so registries and sweeps can be driven
/// deterministically in tests.
pub trait ClockSource: Send + Sync {
    fn now(&self) -> Stamp;
}

/// Reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> Stamp {
        // A clock set before the epoch reads as the sentinel.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Stamp::from)
            .unwrap_or(Stamp::UNSET)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Stamp) -> Self {
        Self {
            nanos: AtomicU64::new(to_nanos(start)),
        }
    }

    pub fn set(&self, stamp: Stamp) {
        self.nanos.store(to_nanos(stamp), Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Duration) {
        let delta = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> Stamp {
        Stamp::from(Duration::from_nanos(self.nanos.load(Ordering::SeqCst)))
    }
}

fn to_nanos(stamp: Stamp) -> u64 {
    stamp
        .secs
        .saturating_mul(NANOS_PER_SEC)
        .saturating_add(u64::from(stamp.nanos))
}
