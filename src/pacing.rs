//! Fine-grained send pacing.
//!
//! Timer sleeps on a general-purpose OS routinely overshoot by tens to hundreds
//! of microseconds. The pacer splits each wait in two phases:
//!
//! 1. a **coarse** phase that sleeps on the tokio timer until shortly before the
//!    target, leaving a safety margin;
//! 2. a **fine** phase that polls the monotonic clock until the target, yielding
//!    to the runtime while more than [`YIELD_THRESHOLD`] remains and spinning
//!    only for the last few microseconds.
//!
//! The tokio timer fires on millisecond ticks, so every spin margin is at least
//! [`TIMER_RESOLUTION`]. The adaptive strategy feeds the observed overshoot of
//! each coarse sleep into a scalar Kalman filter and wakes earlier by the
//! estimate on top of that margin.
//!
//! Targets come from a [`PacingSchedule`] anchored at the start of the run, so a
//! late wake-up never shifts later probes.

use crate::config::PacingStrategy;
use log::trace;
use std::time::{Duration, Instant};
use tokio::time;

/// Coarse sleeps shorter than this are skipped in favour of spinning.
pub const SLEEP_THRESHOLD: Duration = Duration::from_micros(10);

/// Granularity of the tokio timer wheel.
pub const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// The fine phase yields to other tasks while more than this remains.
pub const YIELD_THRESHOLD: Duration = Duration::from_micros(50);

/// Spin margin used by the fixed two-phase strategy.
pub const COARSE_FINE_MARGIN: Duration = Duration::from_micros(1_500);

/// Spin margin used by the adaptive strategy, before the overshoot estimate.
pub const ADAPTIVE_MARGIN: Duration = TIMER_RESOLUTION;

/// One-dimensional Kalman filter tracking sleep overshoot in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KalmanFilter {
    /// Process noise covariance.
    pub q: f64,
    /// Measurement noise covariance.
    pub r: f64,
    /// Current estimate.
    pub x: f64,
    /// Estimate error covariance.
    pub p: f64,
    /// Last computed gain.
    pub k: f64,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self {
            q: 1e-5,
            r: 0.1,
            x: 0.0,
            p: 1.0,
            k: 0.75,
        }
    }
}

impl KalmanFilter {
    pub fn new(q: f64, r: f64) -> Self {
        Self {
            q,
            r,
            ..Default::default()
        }
    }

    /// Folds one measurement into the estimate and returns the new estimate.
    pub fn update(&mut self, measurement: f64) -> f64 {
        self.p += self.q;
        self.k = self.p / (self.p + self.r);
        self.x += self.k * (measurement - self.x);
        self.p *= 1.0 - self.k;
        self.x
    }

    pub fn estimate(&self) -> f64 {
        self.x
    }
}

/// Absolute send times `start + n * interval`.
#[derive(Debug, Clone, Copy)]
pub struct PacingSchedule {
    next: Instant,
    interval: Duration,
}

impl PacingSchedule {
    pub fn new(start: Instant, interval: Duration) -> Self {
        Self {
            next: start,
            interval,
        }
    }

    pub fn next_wakeup(&self) -> Instant {
        self.next
    }

    /// Moves to the following slot and returns it.
    pub fn advance(&mut self) -> Instant {
        self.next += self.interval;
        self.next
    }
}

/// Counters describing how well the pacer has hit its targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacerStats {
    pub waits: u64,
    pub coarse_sleeps: u64,
    /// Coarse sleeps that woke after the target itself.
    pub late_wakeups: u64,
    /// Worst delay past the target at which any wait returned.
    pub max_lateness: Duration,
}

/// Sleeps until absolute monotonic deadlines.
#[derive(Debug, Clone)]
pub struct Pacer {
    strategy: PacingStrategy,
    margin: Duration,
    filter: KalmanFilter,
    stats: PacerStats,
}

impl Pacer {
    pub fn new(strategy: PacingStrategy) -> Self {
        let margin = match strategy {
            PacingStrategy::CoarseFine => COARSE_FINE_MARGIN,
            PacingStrategy::Adaptive => ADAPTIVE_MARGIN,
        };
        Self {
            strategy,
            margin: margin.max(TIMER_RESOLUTION),
            filter: KalmanFilter::default(),
            stats: PacerStats::default(),
        }
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }

    pub fn filter(&self) -> &KalmanFilter {
        &self.filter
    }

    /// Current overshoot correction applied to coarse sleeps.
    fn correction(&self) -> Duration {
        match self.strategy {
            PacingStrategy::CoarseFine => Duration::ZERO,
            PacingStrategy::Adaptive => {
                Duration::from_nanos(self.filter.estimate().max(0.0) as u64)
            }
        }
    }

    /// Returns once the monotonic clock reaches `target`; never earlier.
    ///
    /// A target already in the past returns immediately.
    pub async fn delay_until(&mut self, target: Instant) {
        let now = Instant::now();
        if target <= now {
            return;
        }
        self.stats.waits += 1;

        if let Some(coarse) = coarse_request(target - now, self.margin, self.correction()) {
            let requested = now + coarse;
            time::sleep_until(requested.into()).await;
            self.stats.coarse_sleeps += 1;

            let woke = Instant::now();
            if let PacingStrategy::Adaptive = self.strategy {
                let overshoot = signed_nanos(woke, requested);
                self.filter.update(overshoot);
            }
            if woke > target {
                self.stats.late_wakeups += 1;
                trace!("coarse sleep overshot target by {:?}", woke - target);
            }
        }

        loop {
            let now = Instant::now();
            if now >= target {
                self.stats.max_lateness = self.stats.max_lateness.max(now - target);
                return;
            }
            if target - now > YIELD_THRESHOLD {
                tokio::task::yield_now().await;
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// Length of the coarse sleep for a wait of `remaining`, or `None` when the
/// whole wait belongs to the fine phase.
pub fn coarse_request(
    remaining: Duration,
    margin: Duration,
    correction: Duration,
) -> Option<Duration> {
    let coarse = remaining.saturating_sub(margin).saturating_sub(correction);
    if coarse < SLEEP_THRESHOLD {
        None
    } else {
        Some(coarse)
    }
}

fn signed_nanos(later: Instant, earlier: Instant) -> f64 {
    match later.checked_duration_since(earlier) {
        Some(d) => d.as_nanos() as f64,
        None => -((earlier - later).as_nanos() as f64),
    }
}
