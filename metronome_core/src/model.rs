// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Rolling model of per-frame CPU and GPU cost.
//!
//! [`FrameTimeModel`] keeps the last `window` [`FrameDuration`] samples plus
//! exponential moving averages of the serialized and pipelined cost. The
//! pacing core picks a swap interval from [`FrameTimeModel::cost`], the larger
//! of the window's worst case and the smoothed cost: a single slow frame holds
//! the interval up until it ages out of the window, and a long slow stretch
//! holds it up until the average recovers.

use crate::queue::BoundedQueue;
use crate::time::Duration;

/// Default number of frames the model remembers.
pub const DEFAULT_FRAME_WINDOW: usize = 10;

/// Measured cost of one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameDuration {
    /// Time the host spent on the CPU between frame start and pre-swap.
    pub cpu: Duration,
    /// Time the GPU needed to finish the previous frame's work.
    pub gpu: Duration,
}

impl FrameDuration {
    /// Creates a sample.
    #[must_use]
    pub const fn new(cpu: Duration, gpu: Duration) -> Self {
        Self { cpu, gpu }
    }

    /// Time the frame occupies the display cadence.
    ///
    /// Without pipelining CPU and GPU work are serialized, so the cost is the
    /// sum. With pipelining they overlap and the slower of the two dominates.
    #[must_use]
    pub fn time(&self, pipelined: bool) -> Duration {
        if pipelined {
            self.cpu.max(self.gpu)
        } else {
            self.cpu.saturating_add(self.gpu)
        }
    }
}

/// Exponential moving average tracker.
#[derive(Clone, Copy, Debug)]
struct Ema {
    value: f32,
    alpha: f32,
    initialized: bool,
}

impl Ema {
    const fn new(alpha: f32) -> Self {
        Self {
            value: 0.0,
            alpha,
            initialized: false,
        }
    }

    fn update(&mut self, sample: f32) {
        if self.initialized {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        } else {
            self.value = sample;
            self.initialized = true;
        }
    }

    const fn get(&self) -> f32 {
        self.value
    }

    const fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}

/// Bounded window of recent frame costs.
#[derive(Clone, Debug)]
pub struct FrameTimeModel {
    samples: BoundedQueue<FrameDuration>,
    serialized_ema: Ema,
    pipelined_ema: Ema,
}

impl FrameTimeModel {
    /// Creates an empty model.
    ///
    /// `window` is promoted to at least one frame; `ema_alpha` is clamped to
    /// `0.0..=1.0`.
    #[must_use]
    pub fn new(window: usize, ema_alpha: f32) -> Self {
        let alpha = ema_alpha.clamp(0.0, 1.0);
        Self {
            samples: BoundedQueue::with_capacity(window),
            serialized_ema: Ema::new(alpha),
            pipelined_ema: Ema::new(alpha),
        }
    }

    /// Adds one frame's measurements, evicting the oldest when full.
    pub fn record(&mut self, sample: FrameDuration) {
        let _ = self.samples.push(sample);
        self.serialized_ema.update(sample.time(false).nanos() as f32);
        self.pipelined_ema.update(sample.time(true).nanos() as f32);
    }

    /// Largest [`FrameDuration::time`] in the window, or zero when empty.
    #[must_use]
    pub fn worst_case(&self, pipelined: bool) -> Duration {
        self.samples
            .iter()
            .map(|s| s.time(pipelined))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Mean CPU and GPU cost over the window.
    #[must_use]
    pub fn average(&self) -> FrameDuration {
        let n = self.samples.len() as u64;
        if n == 0 {
            return FrameDuration::default();
        }
        let (cpu, gpu) = self.samples.iter().fold((0_u64, 0_u64), |(c, g), s| {
            (c.saturating_add(s.cpu.nanos()), g.saturating_add(s.gpu.nanos()))
        });
        FrameDuration::new(Duration(cpu / n), Duration(gpu / n))
    }

    /// Exponentially smoothed [`FrameDuration::time`].
    #[must_use]
    pub fn smoothed(&self, pipelined: bool) -> Duration {
        let ema = if pipelined {
            &self.pipelined_ema
        } else {
            &self.serialized_ema
        };
        #[expect(
            clippy::cast_possible_truncation,
            reason = "smoothed nanosecond frame cost fits in u64"
        )]
        Duration(ema.get().max(0.0) as u64)
    }

    /// Cost the swap interval has to cover: the larger of
    /// [`worst_case`](Self::worst_case) and [`smoothed`](Self::smoothed).
    #[must_use]
    pub fn cost(&self, pipelined: bool) -> Duration {
        self.worst_case(pipelined).max(self.smoothed(pipelined))
    }

    /// Number of samples currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` before the first sample and after a reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Forgets every sample, e.g. after a refresh-rate change.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.serialized_ema.reset();
        self.pipelined_ema.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn pipelined_time_is_the_slower_stage() {
        let s = FrameDuration::new(ms(10), ms(6));
        assert_eq!(s.time(false), ms(16));
        assert_eq!(s.time(true), ms(10));
    }

    #[test]
    fn worst_case_tracks_window_max() {
        let mut model = FrameTimeModel::new(3, 0.2);
        assert_eq!(model.worst_case(false), Duration::ZERO);

        model.record(FrameDuration::new(ms(5), ms(1)));
        model.record(FrameDuration::new(ms(20), ms(1)));
        model.record(FrameDuration::new(ms(4), ms(1)));
        assert_eq!(model.worst_case(false), ms(21));

        // The 20ms frame ages out after three more samples.
        for _ in 0..3 {
            model.record(FrameDuration::new(ms(4), ms(1)));
        }
        assert_eq!(model.worst_case(false), ms(5));
        assert_eq!(model.len(), 3);
    }

    #[test]
    fn average_is_per_stage_mean() {
        let mut model = FrameTimeModel::new(4, 0.2);
        model.record(FrameDuration::new(ms(2), ms(4)));
        model.record(FrameDuration::new(ms(4), ms(8)));
        assert_eq!(model.average(), FrameDuration::new(ms(3), ms(6)));
    }

    #[test]
    fn ema_seeds_with_first_sample_and_smooths() {
        let mut model = FrameTimeModel::new(10, 0.5);
        model.record(FrameDuration::new(ms(10), ms(2)));
        assert_eq!(model.smoothed(false), ms(12));
        assert_eq!(model.smoothed(true), ms(10));
        model.record(FrameDuration::new(ms(20), ms(2)));
        assert_eq!(model.smoothed(false), ms(17));
        assert_eq!(model.smoothed(true), ms(15));
    }

    #[test]
    fn cost_remembers_a_slow_stretch_after_the_window() {
        let mut model = FrameTimeModel::new(2, 0.25);
        for _ in 0..4 {
            model.record(FrameDuration::new(ms(40), Duration::ZERO));
        }
        model.record(FrameDuration::new(ms(8), Duration::ZERO));
        model.record(FrameDuration::new(ms(8), Duration::ZERO));
        assert_eq!(model.worst_case(false), ms(8));
        assert!(model.cost(false) > ms(20), "{:?}", model.cost(false));

        let mut raw = FrameTimeModel::new(2, 1.0);
        raw.record(FrameDuration::new(ms(40), Duration::ZERO));
        raw.record(FrameDuration::new(ms(8), Duration::ZERO));
        raw.record(FrameDuration::new(ms(8), Duration::ZERO));
        assert_eq!(raw.cost(false), ms(8), "alpha 1 tracks the last sample");
    }

    #[test]
    fn reset_forgets_everything() {
        let mut model = FrameTimeModel::new(4, 0.2);
        model.record(FrameDuration::new(ms(30), ms(3)));
        model.reset();
        assert!(model.is_empty());
        assert_eq!(model.worst_case(true), Duration::ZERO);
        assert_eq!(model.smoothed(false), Duration::ZERO);
        assert_eq!(model.cost(true), Duration::ZERO);
    }
}
