//! Conversion between millisecond durations and the two-field
//! (seconds, nanoseconds) representation the scheduler backends work with.

use std::time::Duration;

const MILLIS_PER_SEC: u64 = 1_000;
const NANOS_PER_MILLI: u32 = 1_000_000;

/// A point or span expressed as whole seconds plus a sub-second part.
///
/// The all-zero value means "no interval": as a first delay it disarms a
/// timer, as a repeat interval it makes the timer one-shot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IntervalValue {
    pub secs: u64,
    pub nanos: u32,
}

impl IntervalValue {
    pub const ZERO: IntervalValue = IntervalValue { secs: 0, nanos: 0 };

    pub fn is_zero(&self) -> bool {
        self.secs == 0 && self.nanos == 0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }
}

impl From<Duration> for IntervalValue {
    fn from(duration: Duration) -> Self {
        IntervalValue {
            secs: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        }
    }
}

impl From<IntervalValue> for Duration {
    fn from(value: IntervalValue) -> Self {
        value.as_duration()
    }
}

/// First-expiration delay and repeat interval handed to a [`TimerEngine`].
///
/// [`TimerEngine`]: crate::scheduler::TimerEngine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSpec {
    /// Time until the next expiration.
    pub value: IntervalValue,
    /// Time between subsequent expirations; zero for one-shot.
    pub interval: IntervalValue,
}

impl TimerSpec {
    /// A spec that disarms the engine it is applied to.
    pub const DISARMED: TimerSpec = TimerSpec {
        value: IntervalValue::ZERO,
        interval: IntervalValue::ZERO,
    };

    pub fn from_millis(value_ms: u64, interval_ms: u64) -> Self {
        TimerSpec {
            value: to_interval(value_ms),
            interval: to_interval(interval_ms),
        }
    }

    pub fn new(value: Duration, interval: Duration) -> Self {
        TimerSpec {
            value: value.into(),
            interval: interval.into(),
        }
    }

    pub fn is_disarmed(&self) -> bool {
        self.value.is_zero()
    }
}

/// Splits a millisecond count into seconds and nanoseconds.
pub fn to_interval(ms: u64) -> IntervalValue {
    if ms == 0 {
        return IntervalValue::ZERO;
    }
    IntervalValue {
        secs: ms / MILLIS_PER_SEC,
        nanos: (ms % MILLIS_PER_SEC) as u32 * NANOS_PER_MILLI,
    }
}

/// Folds seconds and nanoseconds back into milliseconds, truncating any
/// sub-millisecond remainder.
pub fn from_interval(value: IntervalValue) -> u64 {
    value
        .secs
        .saturating_mul(MILLIS_PER_SEC)
        .saturating_add(u64::from(value.nanos / NANOS_PER_MILLI))
}
