// crates/reelkit-core/src/range.rs
//
// Half-open time ranges over RationalTime. A range covers
// [start, start + duration); the inclusive end is one tick earlier.

use serde::{Deserialize, Serialize};

use crate::time::RationalTime;

/// A span of composition or media time. `duration.value >= 0`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start:    RationalTime,
    pub duration: RationalTime,
}

impl TimeRange {
    pub fn new(start: RationalTime, duration: RationalTime) -> Self {
        Self { start, duration }
    }

    /// Range of `count` frames starting at frame `start`, all at `rate`.
    pub fn from_frames(start: f64, count: f64, rate: f64) -> Self {
        Self {
            start:    RationalTime::new(start, rate),
            duration: RationalTime::new(count, rate),
        }
    }

    pub fn end_time_exclusive(&self) -> RationalTime {
        self.start + self.duration
    }

    pub fn end_time_inclusive(&self) -> RationalTime {
        self.end_time_exclusive() - RationalTime::one_tick(self.start.rate)
    }

    /// Half-open containment: `start <= t < start + duration`.
    pub fn contains(&self, time: RationalTime) -> bool {
        let t = time.rescaled_to(self.start.rate).value;
        t >= self.start.value && t < self.end_time_exclusive().value
    }

    pub fn intersects(&self, other: &TimeRange) -> bool {
        let a0 = self.start.value;
        let a1 = self.end_time_exclusive().value;
        let b0 = other.start.rescaled_to(self.start.rate).value;
        let b1 = other.end_time_exclusive().rescaled_to(self.start.rate).value;
        a0 < b1 && b0 < a1
    }

    /// Overlap with `other`, expressed at this range's rate.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let rate = self.start.rate;
        let a0 = self.start.value;
        let a1 = self.end_time_exclusive().value;
        let b0 = other.start.rescaled_to(rate).value;
        let b1 = other.end_time_exclusive().rescaled_to(rate).value;
        let start = a0.max(b0);
        let end = a1.min(b1);
        if start < end {
            Some(TimeRange {
                start:    RationalTime::new(start, rate),
                duration: RationalTime::new(end - start, rate),
            })
        } else {
            None
        }
    }

    pub fn translated(&self, offset: RationalTime) -> TimeRange {
        TimeRange { start: self.start + offset, duration: self.duration }
    }

    /// The whole composition seconds this range touches, for audio
    /// bucketing: `[floor(start_s), ceil(end_s))`.
    pub fn whole_seconds(&self) -> std::ops::Range<i64> {
        let s0 = self.start.to_seconds().floor() as i64;
        let s1 = self.end_time_exclusive().to_seconds().ceil() as i64;
        s0..s1.max(s0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_half_open() {
        let r = TimeRange::from_frames(0.0, 24.0, 24.0);
        assert!(r.contains(RationalTime::new(0.0, 24.0)));
        assert!(r.contains(RationalTime::new(23.0, 24.0)));
        assert!(!r.contains(RationalTime::new(24.0, 24.0)));
    }

    #[test]
    fn end_inclusive_is_one_tick_back() {
        let r = TimeRange::from_frames(0.0, 24.0, 24.0);
        assert_eq!(r.end_time_inclusive(), RationalTime::new(23.0, 24.0));
        assert_eq!(r.end_time_exclusive(), RationalTime::new(24.0, 24.0));
    }

    #[test]
    fn intersect_across_rates() {
        let a = TimeRange::from_frames(0.0, 48.0, 24.0);
        let b = TimeRange::new(
            RationalTime::new(1.0, 1.0),
            RationalTime::new(4.0, 1.0),
        );
        let i = a.intersect(&b).unwrap();
        assert_eq!(i.start, RationalTime::new(24.0, 24.0));
        assert_eq!(i.duration, RationalTime::new(24.0, 24.0));
        assert!(a.intersects(&b));
    }

    #[test]
    fn disjoint_ranges_do_not_intersect() {
        let a = TimeRange::from_frames(0.0, 24.0, 24.0);
        let b = TimeRange::from_frames(24.0, 24.0, 24.0);
        assert!(!a.intersects(&b));
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn whole_seconds_buckets() {
        let r = TimeRange::from_frames(12.0, 48.0, 24.0); // 0.5 s .. 2.5 s
        assert_eq!(r.whole_seconds(), 0..3);
        let empty = TimeRange::from_frames(24.0, 0.0, 24.0);
        assert_eq!(empty.whole_seconds().count(), 0);
    }

    #[test]
    fn translated_shifts_start_only() {
        let r = TimeRange::from_frames(0.0, 24.0, 24.0);
        let t = r.translated(RationalTime::new(12.0, 24.0));
        assert_eq!(t.start.value, 12.0);
        assert_eq!(t.duration.value, 24.0);
    }
}
