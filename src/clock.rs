//! Time sources used for pacing, RTT and one-way delay.
//!
//! Two clocks are involved in every probe:
//!
//! - a **monotonic** clock ([`std::time::Instant`]) for scheduling and RTT, which
//!   never goes backwards and is unaffected by NTP adjustments;
//! - a **wall** clock (`CLOCK_REALTIME`) whose readings travel inside the
//!   heartbeat so the peer can estimate one-way delay.
//!
//! One-way delay is only as good as the synchronisation between the two hosts'
//! wall clocks, so negative values are expected and tracked separately.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const NANOS_PER_SEC: u32 = 1_000_000_000;

/// A point in time as whole seconds plus nanoseconds.
///
/// `nanos` is always normalised to `[0, 1e9)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, nanos: 0 };

    /// Creates a timestamp, carrying any excess nanoseconds into seconds.
    pub fn new(secs: u64, nanos: u32) -> Self {
        Self {
            secs: secs + u64::from(nanos / NANOS_PER_SEC),
            nanos: nanos % NANOS_PER_SEC,
        }
    }

    /// Builds a timestamp from the `(sec, nsec)` pair carried on the wire.
    pub fn from_wire(sec: u32, nsec: u32) -> Self {
        Self::new(u64::from(sec), nsec)
    }

    /// Splits into the 32-bit `(sec, nsec)` pair carried on the wire.
    ///
    /// Seconds are truncated to 32 bits, which wraps in 2106.
    pub fn to_wire(self) -> (u32, u32) {
        (self.secs as u32, self.nanos)
    }

    pub fn from_duration(d: Duration) -> Self {
        Self::new(d.as_secs(), d.subsec_nanos())
    }

    /// Negative and non-finite inputs clamp to [`Timestamp::ZERO`].
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::ZERO;
        }
        Self::from_duration(Duration::from_secs_f64(secs))
    }

    pub fn as_secs_f64(self) -> f64 {
        self.secs as f64 + f64::from(self.nanos) / f64::from(NANOS_PER_SEC)
    }

    /// Signed difference `self - earlier` in seconds.
    pub fn seconds_since(self, earlier: Timestamp) -> f64 {
        let secs = self.secs as i128 - earlier.secs as i128;
        let nanos = i128::from(self.nanos) - i128::from(earlier.nanos);
        (secs * i128::from(NANOS_PER_SEC) + nanos) as f64 / f64::from(NANOS_PER_SEC)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.nanos / 1_000)
    }
}

/// Process clock pairing a monotonic origin with wall-clock reads.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Current monotonic instant.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Monotonic time elapsed since this clock was created.
    pub fn monotonic(&self) -> Timestamp {
        Timestamp::from_duration(self.origin.elapsed())
    }

    /// Current wall-clock time since the UNIX epoch.
    ///
    /// A clock set before 1970 reads as [`Timestamp::ZERO`].
    pub fn wall(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Timestamp::from_duration)
            .unwrap_or(Timestamp::ZERO)
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable local time, used in end-of-run summaries.
pub fn local_time_string() -> String {
    chrono::Local::now()
        .format("%a %b %e %H:%M:%S %Y")
        .to_string()
}
