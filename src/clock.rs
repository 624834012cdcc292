/// Time sources for the pipeline.
///
/// Interval logic (debounce, durations, backoff) only ever uses
/// `MonotonicTime`. Wall-clock time is attached to events for display and may
/// jump when the system clock is resynchronized.
use std::cell::Cell;
use std::ops::{Add, Sub};
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, FixedOffset, Offset, TimeZone, Utc};
use chrono_tz::Tz;

pub type WallClockTime = DateTime<FixedOffset>;

/// Time since the clock's origin. Never goes backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonotonicTime(Duration);

impl MonotonicTime {
    pub const ZERO: MonotonicTime = MonotonicTime(Duration::ZERO);

    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Elapsed time since `earlier`, or zero if `earlier` is in the future.
    pub fn saturating_since(&self, earlier: MonotonicTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for MonotonicTime {
    type Output = MonotonicTime;

    fn add(self, rhs: Duration) -> MonotonicTime {
        MonotonicTime(self.0.saturating_add(rhs))
    }
}

impl Sub<Duration> for MonotonicTime {
    type Output = MonotonicTime;

    fn sub(self, rhs: Duration) -> MonotonicTime {
        MonotonicTime(self.0.saturating_sub(rhs))
    }
}

/// Both clocks read at the same instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Now {
    pub monotonic: MonotonicTime,
    pub wall: WallClockTime,
    pub wall_synced: bool,
}

impl Now {
    /// Wall-clock time that corresponds to an earlier monotonic reading.
    pub fn wall_at(&self, at: MonotonicTime) -> WallClockTime {
        let back = self.monotonic.saturating_since(at);
        let back_ms = i64::try_from(back.as_millis()).unwrap_or(i64::MAX);
        self.wall - chrono::Duration::milliseconds(back_ms)
    }
}

pub trait Clock {
    fn monotonic_now(&self) -> MonotonicTime;
    fn wall_clock_now(&self) -> WallClockTime;

    /// Whether the wall clock has been set from an external source.
    fn is_synchronized(&self) -> bool;

    fn now(&self) -> Now {
        Now {
            monotonic: self.monotonic_now(),
            wall: self.wall_clock_now(),
            wall_synced: self.is_synchronized(),
        }
    }
}

/// System clocks, with wall time rendered in the configured zone.
pub struct SystemClock {
    origin: Instant,
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self {
            origin: Instant::now(),
            tz,
        }
    }
}

impl Clock for SystemClock {
    fn monotonic_now(&self) -> MonotonicTime {
        MonotonicTime(self.origin.elapsed())
    }

    fn wall_clock_now(&self) -> WallClockTime {
        to_fixed(Utc::now().with_timezone(&self.tz))
    }

    fn is_synchronized(&self) -> bool {
        // An unset RTC boots at the epoch (or the firmware build date).
        Utc::now().year() >= 2021
    }
}

fn to_fixed<Z: TimeZone>(t: DateTime<Z>) -> WallClockTime {
    let offset = t.offset().fix();
    t.with_timezone(&offset)
}

/// Hand-driven clock for tests and replays. Clones share the same time.
#[derive(Clone)]
pub struct ManualClock {
    elapsed: Rc<Cell<Duration>>,
    wall_origin: WallClockTime,
    synced: Rc<Cell<bool>>,
}

impl ManualClock {
    pub fn new(wall_origin: WallClockTime) -> Self {
        Self {
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
            wall_origin,
            synced: Rc::new(Cell::new(true)),
        }
    }

    /// Starts at 2024-06-01T08:00:00-07:00.
    pub fn starting_at_default() -> Self {
        let offset = FixedOffset::west_opt(7 * 3600).unwrap_or_else(|| Utc.fix());
        let origin = offset
            .with_ymd_and_hms(2024, 6, 1, 8, 0, 0)
            .single()
            .unwrap_or_else(|| to_fixed(Utc::now()));
        Self::new(origin)
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }

    pub fn set_synchronized(&self, synced: bool) {
        self.synced.set(synced);
    }
}

impl Clock for ManualClock {
    fn monotonic_now(&self) -> MonotonicTime {
        MonotonicTime(self.elapsed.get())
    }

    fn wall_clock_now(&self) -> WallClockTime {
        let ms = i64::try_from(self.elapsed.get().as_millis()).unwrap_or(i64::MAX);
        self.wall_origin + chrono::Duration::milliseconds(ms)
    }

    fn is_synchronized(&self) -> bool {
        self.synced.get()
    }
}
