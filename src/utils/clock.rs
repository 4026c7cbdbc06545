use std::{cmp::Ordering, marker::PhantomData, time::Duration};

use rustix::time::{ClockId, Timespec};

/// Marker for clock source that never returns a negative [`Time`]
pub trait NonNegativeClockSource: ClockSource {}

/// Monotonic clock
///
/// Page-flip timestamps reported by DRM and submission times of frames are measured against
/// this clock.
#[derive(Debug)]
pub struct Monotonic;

impl ClockSource for Monotonic {
    fn id() -> ClockId {
        ClockId::Monotonic
    }
}

impl NonNegativeClockSource for Monotonic {}

/// Realtime clock
#[derive(Debug)]
pub struct Realtime;

impl ClockSource for Realtime {
    fn id() -> ClockId {
        ClockId::Realtime
    }
}

/// Id for a clock according to unix clockid_t
pub trait ClockSource {
    /// Gets the id of the clock source
    fn id() -> ClockId;
}

/// Defines a clock with a specific kind
#[derive(Debug)]
pub struct Clock<Kind> {
    _kind: PhantomData<Kind>,
}

impl<Kind: ClockSource> Clock<Kind> {
    /// Initialize a new clock
    pub fn new() -> Self {
        Clock { _kind: PhantomData }
    }

    /// Returns the current time
    pub fn now(&self) -> Time<Kind> {
        rustix::time::clock_gettime(Kind::id()).into()
    }

    /// Gets the id of the clock
    pub fn id(&self) -> ClockId {
        Kind::id()
    }
}

impl<Kind: ClockSource> Default for Clock<Kind> {
    fn default() -> Self {
        Self::new()
    }
}

/// A point in time for a clock with a specific kind
pub struct Time<Kind> {
    tp: Timespec,
    _kind: PhantomData<Kind>,
}

impl<Kind> Time<Kind> {
    /// Gets the duration between self and a later time
    ///
    /// Returns [`Duration::ZERO`] if `later` is actually earlier.
    pub fn duration_since(&self, later: Time<Kind>) -> Duration {
        saturating_sub_timespec(later.tp, self.tp).unwrap_or(Duration::ZERO)
    }
}

impl<Kind> Clone for Time<Kind> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Time<Kind> {}

impl<Kind: NonNegativeClockSource> From<Time<Kind>> for Duration {
    fn from(time: Time<Kind>) -> Self {
        debug_assert!(time.tp.tv_sec >= 0);
        debug_assert!(time.tp.tv_nsec >= 0);
        Duration::new(time.tp.tv_sec as u64, time.tp.tv_nsec as u32)
    }
}

impl<Kind> std::fmt::Debug for Time<Kind> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Time")
            .field("tv_sec", &self.tp.tv_sec)
            .field("tv_nsec", &self.tp.tv_nsec)
            .finish()
    }
}

impl<Kind> PartialEq for Time<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.tp.tv_sec == other.tp.tv_sec && self.tp.tv_nsec == other.tp.tv_nsec
    }
}

impl<Kind> Eq for Time<Kind> {}

impl<Kind> PartialOrd for Time<Kind> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Kind> Ord for Time<Kind> {
    fn cmp(&self, other: &Self) -> Ordering {
        let tv_sec = self.tp.tv_sec.cmp(&other.tp.tv_sec);

        if tv_sec == Ordering::Equal {
            self.tp.tv_nsec.cmp(&other.tp.tv_nsec)
        } else {
            tv_sec
        }
    }
}

impl<Kind: NonNegativeClockSource> From<Duration> for Time<Kind> {
    fn from(tp: Duration) -> Self {
        Time {
            tp: Timespec {
                tv_sec: tp.as_secs() as _,
                tv_nsec: tp.subsec_nanos() as _,
            },
            _kind: PhantomData,
        }
    }
}

impl<Kind> From<Timespec> for Time<Kind> {
    fn from(tp: Timespec) -> Self {
        Time { tp, _kind: PhantomData }
    }
}

const NANOS_PER_SEC: i64 = 1_000_000_000;

fn saturating_sub_timespec(lhs: Timespec, rhs: Timespec) -> Option<Duration> {
    let lhs_nsec = lhs.tv_nsec as i64;
    let rhs_nsec = rhs.tv_nsec as i64;
    let mut secs = (lhs.tv_sec as i64).checked_sub(rhs.tv_sec as i64)?;
    let nanos = if lhs_nsec >= rhs_nsec {
        lhs_nsec - rhs_nsec
    } else {
        secs = secs.checked_sub(1)?;
        lhs_nsec + NANOS_PER_SEC - rhs_nsec
    };
    if secs < 0 {
        return None;
    }
    debug_assert!(nanos < NANOS_PER_SEC);
    Some(Duration::new(secs as u64, nanos as u32))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::utils::{Clock, Monotonic, Time};

    #[test]
    fn monotonic() {
        let clock_source: Clock<Monotonic> = Clock::new();
        let now = clock_source.now();
        let zero = Time::<Monotonic>::from(Duration::ZERO);
        assert_eq!(zero.duration_since(now), now.into());
    }

    #[test]
    fn earlier_time_saturates() {
        let earlier = Time::<Monotonic>::from(Duration::from_millis(10));
        let later = Time::<Monotonic>::from(Duration::from_millis(1500));
        assert_eq!(earlier.duration_since(later), Duration::from_millis(1490));
        assert_eq!(later.duration_since(earlier), Duration::ZERO);
        assert!(earlier < later);
    }
}
