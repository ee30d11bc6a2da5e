//! Dual wall-clock/monotonic timestamps.

use std::{
    sync::OnceLock,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// A point in time sampled from two clocks at once: the system wall clock
/// (for human consumption and cross-machine correlation) and the local
/// monotonic clock (for interval arithmetic that must survive wall-clock
/// adjustments).
///
/// Monotonic values are expressed relative to an arbitrary per-process
/// epoch, so they are comparable within one process only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    system: Duration,
    monotonic: Duration,
}

impl Timestamp {
    /// Samples both clocks now.
    #[must_use]
    pub fn now() -> Self {
        let system = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self { system, monotonic: monotonic_epoch().elapsed() }
    }

    /// Constructs a timestamp from raw clock readings.
    #[must_use]
    pub fn from_parts(system: Duration, monotonic: Duration) -> Self {
        Self { system, monotonic }
    }

    /// Wall-clock reading as a duration since the Unix epoch.
    #[must_use]
    pub fn system(&self) -> Duration {
        self.system
    }

    /// Monotonic reading relative to the per-process epoch.
    #[must_use]
    pub fn monotonic(&self) -> Duration {
        self.monotonic
    }

    /// Wall-clock reading in seconds.
    #[must_use]
    pub fn system_secs_f64(&self) -> f64 {
        self.system.as_secs_f64()
    }

    /// Monotonic reading in seconds.
    #[must_use]
    pub fn monotonic_secs_f64(&self) -> f64 {
        self.monotonic.as_secs_f64()
    }
}

fn monotonic_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_non_decreasing() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b.monotonic() >= a.monotonic());
    }

    #[test]
    fn parts_round_trip() {
        let ts = Timestamp::from_parts(Duration::from_secs(5), Duration::from_millis(17));
        assert_eq!(ts.system_secs_f64(), 5.0);
        assert_eq!(ts.monotonic(), Duration::from_millis(17));
    }
}
