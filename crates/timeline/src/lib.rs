//! Playback timeline model: the valid time interval of a media source, its
//! sampling step, excluded gap intervals and a per-sample fading curve.
//!
//! Everything here is pure data so the playback engine can reason about
//! positions without touching the decode pipeline. Time is expressed in
//! nanoseconds; [`TIME_INVALID`] marks an unset value.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod fading;
mod interval;

pub use fading::{FadingCurve, FADING_ARRAY_SIZE};
pub use interval::{TimeInterval, TimeIntervalSet};

/// Time in nanoseconds.
pub type Time = u64;

/// Distinguished "no value" timestamp.
pub const TIME_INVALID: Time = u64::MAX;

pub const SECOND: Time = 1_000_000_000;

pub fn to_seconds(t: Time) -> f64 {
    if t == TIME_INVALID {
        return f64::NAN;
    }
    t as f64 / SECOND as f64
}

pub fn from_seconds(s: f64) -> Time {
    if !s.is_finite() || s < 0.0 {
        return TIME_INVALID;
    }
    (s * SECOND as f64).round() as Time
}

/// Direction of travel along the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("invalid interval: [{0}, {1})")]
    InvalidInterval(Time, Time),
    #[error("gap outside timeline: [{0}, {1})")]
    GapOutOfRange(Time, Time),
    #[error("gap overlaps an existing gap: [{0}, {1})")]
    GapOverlap(Time, Time),
}

/// Resolve a position against a set of gap intervals: a position resting
/// inside a gap is moved to the gap boundary matching the direction of
/// travel (forward exits at the gap end, backward at the gap begin).
///
/// Pure so it can be exercised without any pipeline behind it.
pub fn resolve(position: Time, direction: Direction, gaps: &TimeIntervalSet) -> Time {
    let mut p = position;
    while let Some(gap) = gaps.covering(p) {
        match direction {
            Direction::Forward => p = gap.end,
            Direction::Backward => {
                if gap.begin == p {
                    break;
                }
                p = gap.begin;
            }
        }
    }
    p
}

/// Valid interval, step size, excluded gaps and fading curve of one media
/// source. The invariant `begin <= first <= last <= end` holds whenever the
/// timeline [`is_valid`](Timeline::is_valid).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    interval: TimeInterval,
    first: Time,
    step: Time,
    gaps: TimeIntervalSet,
    fading: FadingCurve,
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            interval: TimeInterval::default(),
            first: TIME_INVALID,
            step: TIME_INVALID,
            gaps: TimeIntervalSet::default(),
            fading: FadingCurve::default(),
        }
    }
}

impl Timeline {
    /// Timeline over `[0, duration)` sampled every `step` nanoseconds.
    pub fn new(duration: Time, step: Time) -> Self {
        Self {
            interval: TimeInterval::new(0, duration),
            first: 0,
            step,
            gaps: TimeIntervalSet::default(),
            fading: FadingCurve::default(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.interval.is_valid()
            && self.step != TIME_INVALID
            && (self.step > 0 || self.single_frame())
            && self.first >= self.interval.begin
            && self.first <= self.interval.end
    }

    pub fn begin(&self) -> Time {
        self.interval.begin
    }

    pub fn end(&self) -> Time {
        self.interval.end
    }

    pub fn duration(&self) -> Time {
        self.interval.duration()
    }

    pub fn step(&self) -> Time {
        self.step
    }

    /// First playable sample.
    pub fn first(&self) -> Time {
        if self.first == TIME_INVALID {
            self.interval.begin
        } else {
            self.first
        }
    }

    /// Last playable sample (one step before the end).
    pub fn last(&self) -> Time {
        if !self.interval.is_valid() {
            return TIME_INVALID;
        }
        let last = self.interval.end.saturating_sub(self.step);
        last.max(self.first())
    }

    /// A timeline holding at most one sample.
    pub fn single_frame(&self) -> bool {
        self.step == TIME_INVALID || self.interval.duration() <= self.step
    }

    pub fn set_end(&mut self, end: Time) {
        self.interval.end = end;
    }

    pub fn set_step(&mut self, step: Time) {
        self.step = step;
    }

    /// Record the timestamp of the first sample actually produced by the
    /// source. Not clamped; the caller registers a leading gap when the
    /// source starts late.
    pub fn set_first(&mut self, first: Time) {
        self.first = first.min(self.interval.end);
    }

    /// Align an arbitrary position onto the sampling grid.
    pub fn snap(&self, t: Time) -> Time {
        if self.step == TIME_INVALID || self.step == 0 {
            return t.clamp(self.interval.begin, self.interval.end);
        }
        let t = t.clamp(self.interval.begin, self.interval.end);
        t - ((t - self.interval.begin) % self.step)
    }

    /// One step forward from `t`, skipping gaps, clamped to the last sample.
    pub fn next(&self, t: Time) -> Time {
        if self.single_frame() {
            return self.first();
        }
        let advanced = self.snap(t).saturating_add(self.step);
        resolve(advanced, Direction::Forward, &self.gaps).min(self.last())
    }

    /// One step backward from `t`, skipping gaps, clamped to the first sample.
    pub fn previous(&self, t: Time) -> Time {
        if self.single_frame() {
            return self.first();
        }
        let receded = self.snap(t).saturating_sub(self.step);
        resolve(receded, Direction::Backward, &self.gaps).max(self.first())
    }

    /// Move a position out of any gap it rests in, exiting toward `direction`.
    pub fn resolve(&self, t: Time, direction: Direction) -> Time {
        resolve(t, direction, &self.gaps)
    }

    pub fn add_gap(&mut self, begin: Time, end: Time) -> Result<(), TimelineError> {
        let gap = TimeInterval::new(begin, end);
        if !gap.is_valid() {
            return Err(TimelineError::InvalidInterval(begin, end));
        }
        if begin < self.interval.begin || end > self.interval.end {
            return Err(TimelineError::GapOutOfRange(begin, end));
        }
        if !self.gaps.insert(gap) {
            return Err(TimelineError::GapOverlap(begin, end));
        }
        Ok(())
    }

    pub fn remove_gap(&mut self, begin: Time) -> bool {
        self.gaps.remove_at(begin)
    }

    pub fn clear_gaps(&mut self) {
        self.gaps.clear();
    }

    pub fn num_gaps(&self) -> usize {
        self.gaps.len()
    }

    pub fn gap_at(&self, t: Time) -> Option<TimeInterval> {
        self.gaps.covering(t).copied()
    }

    pub fn in_gap(&self, t: Time) -> bool {
        self.gaps.covering(t).is_some()
    }

    pub fn gaps(&self) -> &TimeIntervalSet {
        &self.gaps
    }

    /// Fading weight at a position, in `[0, 1]`.
    pub fn fading_at(&self, t: Time) -> f32 {
        self.fading.value_at(t, &self.interval)
    }

    pub fn fading(&self) -> &FadingCurve {
        &self.fading
    }

    pub fn fading_mut(&mut self) -> &mut FadingCurve {
        &mut self.fading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Time = 1_000_000;

    fn timeline_10s_30fps() -> Timeline {
        // 10 s at 30 fps: step of one frame duration.
        Timeline::new(10 * SECOND, SECOND / 30)
    }

    #[test]
    fn test_advancing_stays_in_bounds_and_monotonic() {
        let tl = timeline_10s_30fps();
        let mut pos = tl.first();
        let mut prev = pos;
        for _ in 0..1000 {
            pos = tl.next(pos);
            assert!(pos >= tl.begin() && pos <= tl.end());
            assert!(pos >= prev);
            prev = pos;
        }
        assert_eq!(pos, tl.last());
        for _ in 0..1000 {
            pos = tl.previous(pos);
            assert!(pos >= tl.begin() && pos <= tl.end());
            assert!(pos <= prev);
            prev = pos;
        }
        assert_eq!(pos, tl.first());
    }

    #[test]
    fn test_gap_resolution_by_direction() {
        let mut gaps = TimeIntervalSet::default();
        gaps.insert(TimeInterval::new(100 * MS, 500 * MS));
        let inside = 250 * MS;
        assert_eq!(resolve(inside, Direction::Forward, &gaps), 500 * MS);
        assert_eq!(resolve(inside, Direction::Backward, &gaps), 100 * MS);
        // Positions outside the gap are untouched.
        assert_eq!(resolve(500 * MS, Direction::Forward, &gaps), 500 * MS);
        assert_eq!(resolve(50 * MS, Direction::Backward, &gaps), 50 * MS);
    }

    #[test]
    fn test_gap_resolution_chains_adjacent_gaps_forward() {
        let mut gaps = TimeIntervalSet::default();
        gaps.insert(TimeInterval::new(100 * MS, 200 * MS));
        gaps.insert(TimeInterval::new(200 * MS, 300 * MS));
        assert_eq!(resolve(150 * MS, Direction::Forward, &gaps), 300 * MS);
        assert_eq!(resolve(250 * MS, Direction::Backward, &gaps), 200 * MS);
    }

    #[test]
    fn test_next_skips_gap() {
        let mut tl = Timeline::new(10 * SECOND, 100 * MS);
        tl.add_gap(200 * MS, SECOND).unwrap();
        let pos = tl.next(100 * MS);
        assert_eq!(pos, SECOND);
    }

    #[test]
    fn test_add_gap_rejects_overlap_and_range() {
        let mut tl = Timeline::new(SECOND, 10 * MS);
        tl.add_gap(0, 100 * MS).unwrap();
        assert!(tl.add_gap(50 * MS, 200 * MS).is_err());
        assert!(tl.add_gap(500 * MS, 2 * SECOND).is_err());
        assert!(tl.add_gap(300 * MS, 300 * MS).is_err());
        assert_eq!(tl.num_gaps(), 1);
    }

    #[test]
    fn test_snap_aligns_to_step_grid() {
        let tl = Timeline::new(SECOND, 40 * MS);
        assert_eq!(tl.snap(0), 0);
        assert_eq!(tl.snap(39 * MS), 0);
        assert_eq!(tl.snap(41 * MS), 40 * MS);
        assert_eq!(tl.snap(5 * SECOND), SECOND);
    }

    #[test]
    fn test_single_frame_timeline() {
        let tl = Timeline::new(30 * MS, 33 * MS);
        assert!(tl.single_frame());
        assert_eq!(tl.next(0), tl.first());
        assert_eq!(tl.previous(0), tl.first());
    }

    #[test]
    fn test_first_sample_and_leading_gap() {
        let mut tl = timeline_10s_30fps();
        tl.set_first(500 * MS);
        tl.add_gap(0, 500 * MS).unwrap();
        assert_eq!(tl.first(), 500 * MS);
        assert_eq!(tl.resolve(250 * MS, Direction::Forward), 500 * MS);
        assert!(tl.is_valid());
    }

    #[test]
    fn test_seconds_round_trip() {
        assert_eq!(from_seconds(1.5), 1_500_000_000);
        assert!((to_seconds(2 * SECOND + SECOND / 2) - 2.5).abs() < 1e-9);
        assert_eq!(from_seconds(f64::NAN), TIME_INVALID);
        assert!(to_seconds(TIME_INVALID).is_nan());
    }
}
