// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Presentation statistics from compositor frame timestamps.
//!
//! [`FrameStatistics`] is fed once per swap via [`FrameStatistics::capture`].
//! Each call registers the frame about to be presented with the compositor's
//! id and then tries to resolve the oldest pending frame. Compositors report
//! timestamps a few frames late, so most captures resolve a frame submitted
//! earlier; [`TimestampQuery::Pending`] leaves the frame queued for the next
//! capture.
//!
//! Every histogram buckets a time delta by whole refresh periods. Deltas of
//! [`MAX_FRAME_BUCKETS`] periods or more land in the last bucket.
//!
//! Statistics are diagnostic. Apart from the last recorded latency, which
//! drives the buffer-stuffing recovery in [`Pacer`](crate::pacer::Pacer),
//! nothing here feeds back into pacing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::queue::BoundedQueue;
use crate::time::{Duration, HostTime};

/// Number of histogram buckets.
pub const MAX_FRAME_BUCKETS: usize = 6;

/// How far the newest frame id may run ahead of the oldest pending one
/// before the backlog is dropped.
pub const MAX_FRAME_LAG: u64 = 10;

/// Hard cap on frames awaiting timestamps.
const MAX_PENDING_FRAMES: usize = 20;

/// Minimum time between two histogram dumps to the log.
const LOG_EVERY: Duration = Duration::from_millis(1_000);

/// Aggregated histograms, indexed by frame delta in refresh periods.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PacingStats {
    /// Frames with complete timestamps.
    pub total_frames: u64,
    /// Rendering completed to composition latched.
    pub idle_frames: [u64; MAX_FRAME_BUCKETS],
    /// Requested present to actual present.
    pub late_frames: [u64; MAX_FRAME_BUCKETS],
    /// Previous present to this present.
    pub offset_from_previous_frame: [u64; MAX_FRAME_BUCKETS],
    /// Frame start to composition latched.
    pub latency_frames: [u64; MAX_FRAME_BUCKETS],
}

/// Compositor timestamps for one presented frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTimestamps {
    /// When the host asked for the frame to be shown.
    pub requested: HostTime,
    /// When the GPU finished rendering it.
    pub rendering_completed: HostTime,
    /// When the compositor latched the buffer.
    pub composition_latched: HostTime,
    /// When the frame reached the display.
    pub presented: HostTime,
}

/// Result of asking the compositor for a frame's timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampQuery {
    /// All timestamps are known.
    Ready(FrameTimestamps),
    /// Not known yet; ask again on a later frame.
    Pending,
    /// The compositor will never report this frame.
    Unavailable,
}

/// Compositor-side source of frame ids and presentation timestamps.
pub trait FrameTimestampSource {
    /// Id the compositor will assign to the next presented frame, if any.
    fn next_frame_id(&self) -> Option<u64>;

    /// Timestamps for a previously presented frame.
    fn frame_timestamps(&self, frame_id: u64) -> TimestampQuery;
}

/// Which statistics are collected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StatsMode {
    /// Only the last frame latency, for buffer-stuffing detection.
    #[default]
    LatencyOnly,
    /// Latency plus all histograms.
    Full,
}

/// A frame registered with the compositor and awaiting its timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingFrame {
    frame_id: u64,
    submission_time: HostTime,
}

#[derive(Debug)]
struct Inner {
    pending: BoundedQueue<PendingFrame>,
    prev_present: Option<HostTime>,
    stats: PacingStats,
    last_log: Option<HostTime>,
}

/// Frame statistics collector.
#[derive(Debug)]
pub struct FrameStatistics {
    mode: StatsMode,
    inner: Mutex<Inner>,
    last_latency: AtomicU64,
}

/// Number of whole `refresh_period`s between `start` and `end`, clamped to
/// a valid bucket index.
///
/// Negative deltas and a zero period both yield 0.
#[must_use]
pub fn frame_delta(start: HostTime, end: HostTime, refresh_period: Duration) -> usize {
    let periods = end
        .saturating_duration_since(start)
        .periods_floor(refresh_period);
    usize::try_from(periods)
        .unwrap_or(usize::MAX)
        .min(MAX_FRAME_BUCKETS - 1)
}

impl FrameStatistics {
    /// Creates an empty collector.
    #[must_use]
    pub fn new(mode: StatsMode) -> Self {
        Self {
            mode,
            inner: Mutex::new(Inner {
                pending: BoundedQueue::with_capacity(MAX_PENDING_FRAMES),
                prev_present: None,
                stats: PacingStats::default(),
                last_log: None,
            }),
            last_latency: AtomicU64::new(0),
        }
    }

    /// The collection mode.
    #[must_use]
    pub fn mode(&self) -> StatsMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the frame starting at `now` and resolves the oldest pending
    /// frame if the compositor has its timestamps.
    ///
    /// Called once per swap.
    pub fn capture(&self, source: &dyn FrameTimestampSource, refresh_period: Duration, now: HostTime) {
        let next_id = source.next_frame_id();
        let mut inner = self.lock();

        if let Some(frame_id) = next_id {
            let evicted = inner.pending.push(PendingFrame {
                frame_id,
                submission_time: now,
            });
            if let Some(old) = evicted {
                log::warn!(
                    "frame statistics backlog full, dropped frame {}",
                    old.frame_id
                );
            }
        }

        let Some(&oldest) = inner.pending.front() else {
            return;
        };

        if let Some(newest) = next_id
            && newest.saturating_sub(oldest.frame_id) > MAX_FRAME_LAG
        {
            let dropped = inner.pending.keep_newest();
            inner.prev_present = None;
            log::warn!("frame statistics lagging, dropped {dropped} pending frames");
        }

        let Some(&frame) = inner.pending.front() else {
            return;
        };
        let timestamps = match source.frame_timestamps(frame.frame_id) {
            TimestampQuery::Ready(ts) => ts,
            TimestampQuery::Pending => return,
            TimestampQuery::Unavailable => {
                log::debug!("no timestamps for frame {}", frame.frame_id);
                let _ = inner.pending.pop();
                return;
            }
        };
        let _ = inner.pending.pop();

        let latency = frame_delta(
            frame.submission_time,
            timestamps.composition_latched,
            refresh_period,
        );
        self.last_latency.store(latency as u64, Ordering::Relaxed);
        log::trace!("frame {} latency {latency}", frame.frame_id);

        if self.mode == StatsMode::Full {
            let inner = &mut *inner;
            let stats = &mut inner.stats;
            stats.total_frames += 1;
            stats.idle_frames[frame_delta(
                timestamps.rendering_completed,
                timestamps.composition_latched,
                refresh_period,
            )] += 1;
            stats.late_frames[frame_delta(timestamps.requested, timestamps.presented, refresh_period)] += 1;
            if let Some(prev) = inner.prev_present {
                stats.offset_from_previous_frame
                    [frame_delta(prev, timestamps.presented, refresh_period)] += 1;
            }
            inner.prev_present = Some(timestamps.presented);
            stats.latency_frames[latency] += 1;

            let due = inner
                .last_log
                .is_none_or(|last| now.saturating_duration_since(last) >= LOG_EVERY);
            if due {
                inner.last_log = Some(now);
                log_stats(&inner.stats);
            }
        }
    }

    /// Latency of the most recently resolved frame, in refresh periods.
    ///
    /// Lock-free; 0 before any frame resolves.
    #[must_use]
    pub fn last_latency_recorded(&self) -> u64 {
        self.last_latency.load(Ordering::Relaxed)
    }

    /// A copy of the histograms, or `None` in [`StatsMode::LatencyOnly`].
    #[must_use]
    pub fn stats(&self) -> Option<PacingStats> {
        match self.mode {
            StatsMode::Full => Some(self.lock().stats),
            StatsMode::LatencyOnly => None,
        }
    }

    /// Number of frames still waiting for timestamps.
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.lock().pending.len()
    }

    /// Frames dropped by the overflow and lag policies since creation.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.lock().pending.dropped_count()
    }
}

fn log_stats(stats: &PacingStats) {
    fn row(values: &[u64; MAX_FRAME_BUCKETS]) -> String {
        values.iter().map(|v| format!("\t{v}")).collect()
    }
    let header: String = (0..MAX_FRAME_BUCKETS).map(|i| format!("\t[{i}]")).collect();
    log::info!("== frame statistics ==");
    log::info!("total frames: {}", stats.total_frames);
    log::info!("buckets:                   {header}");
    log::info!("idle frames:               {}", row(&stats.idle_frames));
    log::info!("late frames:               {}", row(&stats.late_frames));
    log::info!(
        "offset from previous frame:{}",
        row(&stats.offset_from_previous_frame)
    );
    log::info!("frame latency:             {}", row(&stats.latency_frames));
}
