use serde::{Deserialize, Serialize};

use crate::{Time, TimeInterval};

/// Number of samples of the fading curve, spread evenly over the timeline
/// interval.
pub const FADING_ARRAY_SIZE: usize = 1000;

/// Per-sample fading weights in `[0, 1]`, linearly interpolated between
/// samples. A flat curve at 1.0 means no fading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FadingCurve {
    samples: Vec<f32>,
}

impl Default for FadingCurve {
    fn default() -> Self {
        Self {
            samples: vec![1.0; FADING_ARRAY_SIZE],
        }
    }
}

impl FadingCurve {
    /// Fading weight at `t` inside `interval`; 1.0 outside a valid interval.
    pub fn value_at(&self, t: Time, interval: &TimeInterval) -> f32 {
        if !interval.is_valid() {
            return 1.0;
        }
        let t = t.clamp(interval.begin, interval.end);
        let span = (interval.end - interval.begin) as f64;
        let x = (t - interval.begin) as f64 / span * (FADING_ARRAY_SIZE - 1) as f64;
        let i = x.floor() as usize;
        let frac = (x - i as f64) as f32;
        if i + 1 >= FADING_ARRAY_SIZE {
            return self.samples[FADING_ARRAY_SIZE - 1];
        }
        self.samples[i] * (1.0 - frac) + self.samples[i + 1] * frac
    }

    /// Set all samples covering `[begin, end)` of `interval` to `value`.
    pub fn set_span(&mut self, begin: Time, end: Time, value: f32, interval: &TimeInterval) {
        if !interval.is_valid() || begin >= end {
            return;
        }
        let value = value.clamp(0.0, 1.0);
        let span = (interval.end - interval.begin) as f64;
        let to_index = |t: Time| -> usize {
            let t = t.clamp(interval.begin, interval.end);
            ((t - interval.begin) as f64 / span * (FADING_ARRAY_SIZE - 1) as f64).round() as usize
        };
        for s in &mut self.samples[to_index(begin)..=to_index(end)] {
            *s = value;
        }
    }

    /// Linear ramp from 0 to 1 over the first `duration` of the interval.
    pub fn fade_in(&mut self, duration: Time, interval: &TimeInterval) {
        self.ramp(duration, interval, false);
    }

    /// Linear ramp from 1 to 0 over the last `duration` of the interval.
    pub fn fade_out(&mut self, duration: Time, interval: &TimeInterval) {
        self.ramp(duration, interval, true);
    }

    fn ramp(&mut self, duration: Time, interval: &TimeInterval, out: bool) {
        if !interval.is_valid() || duration == 0 {
            return;
        }
        let total = interval.duration();
        let duration = duration.min(total);
        let n = ((duration as f64 / total as f64) * (FADING_ARRAY_SIZE - 1) as f64).round() as usize;
        if n == 0 {
            return;
        }
        for k in 0..=n {
            let v = k as f32 / n as f32;
            if out {
                self.samples[FADING_ARRAY_SIZE - 1 - (n - k)] = 1.0 - v;
            } else {
                self.samples[k] = v;
            }
        }
    }

    pub fn is_flat(&self) -> bool {
        self.samples.iter().all(|&s| (s - 1.0).abs() < f32::EPSILON)
    }

    pub fn reset(&mut self) {
        self.samples.fill(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SECOND;

    #[test]
    fn test_default_curve_is_flat() {
        let curve = FadingCurve::default();
        let iv = TimeInterval::new(0, 10 * SECOND);
        assert!(curve.is_flat());
        assert_eq!(curve.value_at(0, &iv), 1.0);
        assert_eq!(curve.value_at(5 * SECOND, &iv), 1.0);
    }

    #[test]
    fn test_fade_in_ramps_up() {
        let mut curve = FadingCurve::default();
        let iv = TimeInterval::new(0, 10 * SECOND);
        curve.fade_in(2 * SECOND, &iv);
        assert!(curve.value_at(0, &iv) < 0.01);
        let mid = curve.value_at(SECOND, &iv);
        assert!(mid > 0.4 && mid < 0.6, "mid fade {mid}");
        assert!((curve.value_at(3 * SECOND, &iv) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_fade_out_ramps_down() {
        let mut curve = FadingCurve::default();
        let iv = TimeInterval::new(0, 10 * SECOND);
        curve.fade_out(2 * SECOND, &iv);
        assert!((curve.value_at(7 * SECOND, &iv) - 1.0).abs() < 0.01);
        assert!(curve.value_at(10 * SECOND, &iv) < 0.01);
    }

    #[test]
    fn test_set_span_and_reset() {
        let mut curve = FadingCurve::default();
        let iv = TimeInterval::new(0, 10 * SECOND);
        curve.set_span(4 * SECOND, 6 * SECOND, 0.25, &iv);
        assert!((curve.value_at(5 * SECOND, &iv) - 0.25).abs() < 0.01);
        assert_eq!(curve.value_at(SECOND, &iv), 1.0);
        curve.reset();
        assert!(curve.is_flat());
    }
}
