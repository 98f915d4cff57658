// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The pacing core: when to present, and how many vsyncs apart.
//!
//! The host calls [`Pacer::on_pre_swap`] right before presenting and
//! [`Pacer::on_post_swap`] right after. Between the two hooks the [`Pacer`]
//! walks each frame through a fixed cycle:
//!
//! ```text
//!   Idle ──► FrameStart ──► Waiting ──► Presented ──► AwaitingGpuTimestamp
//!               ▲                                            │
//!               └──────────────── on_post_swap ──────────────┘
//! ```
//!
//! # Swap interval
//!
//! Every frame's CPU time (frame start to pre-swap) and the previous frame's
//! GPU time go into a [`FrameTimeModel`]. After each present the swap
//! interval becomes the smallest `n` with `n * refresh_period` at least the
//! modeled cost, clamped to
//! `[ceil(swap_duration / period), max_auto_swap_duration / period]`. The
//! modeled cost is the window's worst case or its moving average, whichever
//! is larger (see [`FrameTimeModel::cost`]).
//! Increases apply at once. Decreases move at most
//! [`PacerConfig::swap_interval_step`] per frame, and only when the cost
//! fits the smaller interval with [`PacerConfig::hysteresis`] to spare.
//!
//! # Pipelining
//!
//! With auto pipelining the interval is sized from `max(cpu, gpu)` and the
//! core lets the CPU run one frame ahead of the GPU whenever `cpu + gpu` no
//! longer fits. A pipelined frame targets a presentation time two intervals
//! out instead of one.
//!
//! # Waiting
//!
//! Pre-swap blocks until the frame's target vsync, then one refresh period at
//! a time while the previous frame's GPU work is still running, up to
//! [`PacerConfig::max_late_frames`]. Every wait is bounded by a few refresh
//! periods of wall time, so a vsync source that stops never deadlocks the
//! render thread. Until the refresh period is known, the core does not block
//! at all and the swap interval stays at 1.
//!
//! # Vsync
//!
//! By default vsync arrives through an internal [`ChoreographerSource`]. The
//! first call to [`Pacer::on_choreographer`] switches to host-driven vsync
//! and tears the internal source down for good.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use crate::choreographer::{ChoreographerRequest, ChoreographerSource, Strategy, VsyncPlatform};
use crate::error::PacingError;
use crate::model::{DEFAULT_FRAME_WINDOW, FrameDuration, FrameTimeModel};
use crate::settings::{DisplayTimings, ListenerId, Settings};
use crate::time::{Clock, Duration, HostTime};
use crate::trace::{
    PacingTracer, PostSwapEvent, PostWaitEvent, PreSwapEvent, PreWaitEvent, StartFrameEvent,
    SwapIntervalChangedEvent, TracerRegistry,
};

/// Refresh periods a vsync wait may overrun its target before giving up.
const VSYNC_WAIT_SLACK_PERIODS: u64 = 4;

/// What the pacing core needs from the presentation layer.
pub trait SwapHandlers {
    /// Non-blocking: has the previous frame's GPU work finished?
    fn last_frame_is_complete(&self) -> bool;

    /// GPU time of the previous frame, as last measured.
    fn prev_frame_gpu_time(&self) -> Duration;
}

/// Where the current frame is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FramePhase {
    /// No frame started yet.
    Idle,
    /// The host is building the frame.
    FrameStart,
    /// Pre-swap is waiting for the target vsync.
    Waiting,
    /// Cleared to present.
    Presented,
    /// Presented; the frame's GPU time is not known yet.
    AwaitingGpuTimestamp,
}

/// Recovery from compositor queues that fill up silently.
///
/// When the measured frame latency exceeds the expected latency (the swap
/// interval, doubled while pipelined, plus `latency_slack_frames`) for
/// `trigger_frames` consecutive frames, the core waits one extra vsync and
/// then presents `fix_wait` frames at interval 1 before returning to auto
/// pacing. Latency comes from [`Pacer::record_latency`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferStuffingPolicy {
    /// Frames forced to interval 1 after detection. 0 disables the fix.
    pub fix_wait: u32,
    /// Consecutive over-latency frames that trigger the fix.
    pub trigger_frames: u32,
    /// Latency tolerated above the expected value, in refresh periods.
    pub latency_slack_frames: u32,
}

impl BufferStuffingPolicy {
    /// The fix switched off.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            fix_wait: 0,
            trigger_frames: 3,
            latency_slack_frames: 0,
        }
    }
}

impl Default for BufferStuffingPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Configuration for the [`Pacer`].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PacerConfig {
    /// Adapt the swap interval to the measured frame cost.
    pub auto_swap_interval: bool,
    /// Allow the CPU one frame ahead of the GPU when that keeps the interval
    /// down.
    pub auto_pipeline: bool,
    /// Longest interval auto pacing may choose. Beyond it the core stops
    /// blocking and lets the host run flat out.
    pub max_auto_swap_duration: Duration,
    /// Largest decrease of the swap interval in one frame.
    pub swap_interval_step: u32,
    /// Headroom the modeled cost must leave before the interval decreases.
    pub hysteresis: Duration,
    /// Frames in the cost model.
    pub frame_window: usize,
    /// Weight of the newest frame in the cost model's moving average, from
    /// 0.0 to 1.0. Lower values keep the interval up longer after a slow
    /// stretch; 1.0 leaves only the window's worst case.
    pub ema_alpha: f32,
    /// Refresh periods pre-swap may add while the previous frame's GPU work
    /// is unfinished.
    pub max_late_frames: u32,
    /// Buffer-stuffing recovery.
    pub buffer_stuffing: BufferStuffingPolicy,
}

impl PacerConfig {
    /// Default configuration: auto interval and auto pipelining.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            auto_swap_interval: true,
            auto_pipeline: true,
            max_auto_swap_duration: Duration::from_millis(50),
            swap_interval_step: 1,
            hysteresis: Duration::from_millis(1),
            frame_window: DEFAULT_FRAME_WINDOW,
            ema_alpha: 0.2,
            max_late_frames: 3,
            buffer_stuffing: BufferStuffingPolicy::disabled(),
        }
    }

    /// Strict single-frame-ahead pacing that gives up on slow GPUs sooner.
    #[must_use]
    pub const fn low_latency() -> Self {
        Self {
            auto_swap_interval: true,
            auto_pipeline: false,
            max_auto_swap_duration: Duration::from_millis(34),
            swap_interval_step: 1,
            hysteresis: Duration::from_micros(500),
            frame_window: 5,
            ema_alpha: 0.3,
            max_late_frames: 1,
            buffer_stuffing: BufferStuffingPolicy::disabled(),
        }
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Allowed swap interval range for `period`.
///
/// The lower bound honors the host's minimum presentation interval; the upper
/// bound is the auto-pacing limit, never below the lower bound.
#[must_use]
pub fn interval_bounds(period: Duration, swap_duration: Duration, max_auto: Duration) -> (u32, u32) {
    let min = u32::try_from(swap_duration.periods_ceil(period))
        .unwrap_or(u32::MAX)
        .max(1);
    let max = u32::try_from(max_auto.periods_floor(period))
        .unwrap_or(u32::MAX)
        .max(min);
    (min, max)
}

/// Picks the next swap interval from the current one and the modeled frame
/// cost.
#[must_use]
pub fn next_swap_interval(
    current: u32,
    cost: Duration,
    period: Duration,
    (min, max): (u32, u32),
    step: u32,
    hysteresis: Duration,
) -> u32 {
    let current = current.clamp(min, max);
    let needed = u32::try_from(cost.periods_ceil(period))
        .unwrap_or(u32::MAX)
        .clamp(min, max);
    if needed >= current {
        return needed;
    }
    let candidate = current.saturating_sub(step.max(1)).max(needed);
    let budget = period.saturating_mul(u64::from(candidate));
    if cost.saturating_add(hysteresis) <= budget {
        candidate
    } else {
        current
    }
}

#[derive(Debug, Default)]
struct VsyncState {
    count: u64,
    last: Option<HostTime>,
    blocked_on: Option<u64>,
}

#[derive(Debug, Default)]
struct StuffingState {
    last_latency: Option<u64>,
    over_latency_frames: u32,
    forced_frames: u32,
}

#[derive(Debug)]
struct FrameState {
    config: PacerConfig,
    phase: FramePhase,
    frame_index: u64,
    timings: DisplayTimings,
    swap_duration: Duration,
    swap_interval: u32,
    pipelined: bool,
    model: FrameTimeModel,
    frame_start: Option<HostTime>,
    target_vsync: u64,
    presentation_time: Option<HostTime>,
    needs_presentation_time: bool,
    sample: FrameDuration,
    stuffing: StuffingState,
}

impl FrameState {
    fn new(config: PacerConfig) -> Self {
        Self {
            config,
            phase: FramePhase::Idle,
            frame_index: 0,
            timings: DisplayTimings::default(),
            swap_duration: Duration::ZERO,
            swap_interval: 1,
            pipelined: false,
            model: FrameTimeModel::new(config.frame_window, config.ema_alpha),
            frame_start: None,
            target_vsync: 0,
            presentation_time: None,
            needs_presentation_time: false,
            sample: FrameDuration::default(),
            stuffing: StuffingState::default(),
        }
    }

    fn period(&self) -> Duration {
        self.timings.refresh_period
    }

    fn bounds(&self) -> (u32, u32) {
        interval_bounds(
            self.period(),
            self.swap_duration,
            self.config.max_auto_swap_duration,
        )
    }

    fn intervals_ahead(&self) -> u64 {
        if self.pipelined { 2 } else { 1 }
    }

    /// Re-clamps the interval after a timing or configuration change.
    fn clamp_interval(&mut self) {
        if self.period().is_zero() {
            self.swap_interval = 1;
            return;
        }
        let (min, max) = self.bounds();
        self.swap_interval = if self.config.auto_swap_interval {
            self.swap_interval.clamp(min, max)
        } else {
            min
        };
    }

    /// Returns `(old_interval, new_interval, pipelined)` if anything changed.
    fn update_swap_interval(&mut self) -> Option<(u32, u32, bool)> {
        let old = (self.swap_interval, self.pipelined);
        let period = self.period();
        if period.is_zero() {
            self.swap_interval = 1;
            self.pipelined = false;
        } else {
            let allow_pipeline = self.config.auto_pipeline;
            let bounds = self.bounds();
            self.swap_interval = if self.config.auto_swap_interval {
                next_swap_interval(
                    self.swap_interval,
                    self.model.cost(allow_pipeline),
                    period,
                    bounds,
                    self.config.swap_interval_step,
                    self.config.hysteresis,
                )
            } else {
                bounds.0
            };

            let serialized = self.model.cost(false);
            let budget = period.saturating_mul(u64::from(self.swap_interval));
            self.pipelined = allow_pipeline
                && if self.pipelined {
                    serialized.saturating_add(self.config.hysteresis) > budget
                } else {
                    serialized > budget
                };
        }
        ((self.swap_interval, self.pipelined) != old).then_some((
            old.0,
            self.swap_interval,
            self.pipelined,
        ))
    }

    /// Returns the extra vsyncs to wait this frame.
    fn check_buffer_stuffing(&mut self) -> u64 {
        let policy = self.config.buffer_stuffing;
        if policy.fix_wait == 0 || self.stuffing.forced_frames > 0 {
            return 0;
        }
        let Some(latency) = self.stuffing.last_latency.take() else {
            return 0;
        };
        let expected = u64::from(self.swap_interval) * self.intervals_ahead()
            + u64::from(policy.latency_slack_frames);
        if latency <= expected {
            self.stuffing.over_latency_frames = 0;
            return 0;
        }
        self.stuffing.over_latency_frames += 1;
        if self.stuffing.over_latency_frames < policy.trigger_frames.max(1) {
            return 0;
        }
        log::debug!(
            "buffer stuffing detected (latency {latency}, expected {expected}), forcing {} frames",
            policy.fix_wait
        );
        self.stuffing.over_latency_frames = 0;
        self.stuffing.forced_frames = policy.fix_wait;
        1
    }
}

struct Inner {
    clock: Arc<dyn Clock>,
    settings: Arc<Settings>,
    vsync: Mutex<VsyncState>,
    vsync_arrived: Condvar,
    frame: Mutex<FrameState>,
    tracers: TracerRegistry,
    external: AtomicBool,
}

impl Inner {
    fn vsync(&self) -> MutexGuard<'_, VsyncState> {
        self.vsync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn frame(&self) -> MutexGuard<'_, FrameState> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_timings(&self) {
        let timings = self.settings.display_timings();
        let swap_duration = self.settings.swap_duration();
        let mut frame = self.frame();
        if frame.timings.refresh_period != timings.refresh_period {
            log::info!(
                "refresh period {} -> {}, resetting frame model",
                frame.timings.refresh_period,
                timings.refresh_period
            );
            frame.model.reset();
        }
        frame.timings = timings;
        frame.swap_duration = swap_duration;
        frame.clamp_interval();
    }

    fn record_vsync(&self, timestamp: HostTime) {
        {
            let mut vsync = self.vsync();
            vsync.count += 1;
            vsync.last = Some(timestamp);
        }
        self.vsync_arrived.notify_all();

        let mut frame = self.frame();
        let period = frame.period();
        if frame.phase != FramePhase::Idle && frame.presentation_time.is_none() && !period.is_zero() {
            let ahead = u64::from(frame.swap_interval) * frame.intervals_ahead();
            frame.presentation_time = Some(timestamp.saturating_add(period.saturating_mul(ahead)));
        }
    }

    fn wait_for_vsync(&self, target: u64, period: Duration) {
        let vsync = self.vsync();
        if vsync.count >= target {
            return;
        }
        let missing = target - vsync.count;
        let timeout = period.saturating_mul(missing + VSYNC_WAIT_SLACK_PERIODS);
        let mut vsync = vsync;
        vsync.blocked_on = Some(target);
        let (mut vsync, result) = self
            .vsync_arrived
            .wait_timeout_while(vsync, timeout.to_std(), |v| v.count < target)
            .unwrap_or_else(PoisonError::into_inner);
        vsync.blocked_on = None;
        if result.timed_out() {
            log::debug!("vsync {target} not delivered within {timeout}, continuing");
        }
    }

    fn start_frame(&self) {
        let (count, last_vsync) = {
            let vsync = self.vsync();
            (vsync.count, vsync.last)
        };
        let now = self.clock.now();
        let event = {
            let mut frame = self.frame();
            frame.frame_index += 1;
            let extra = frame.check_buffer_stuffing();
            let forced = frame.stuffing.forced_frames > 0;
            if forced {
                frame.stuffing.forced_frames -= 1;
            }
            let interval = if forced { 1 } else { u64::from(frame.swap_interval) };
            let period = frame.period();

            frame.target_vsync = count + interval + extra;
            frame.presentation_time = if period.is_zero() {
                None
            } else {
                let ahead = interval * frame.intervals_ahead() + extra;
                last_vsync.map(|v| v.saturating_add(period.saturating_mul(ahead)))
            };
            frame.frame_start = Some(now);
            frame.sample = FrameDuration::default();
            frame.phase = FramePhase::FrameStart;

            StartFrameEvent {
                frame_index: frame.frame_index,
                timestamp: now,
                target_vsync: frame.target_vsync,
                desired_present: frame.presentation_time,
            }
        };
        self.tracers
            .emit("start_frame", |t| t.on_start_frame(&event));
    }
}

/// Frame pacing state machine.
///
/// See the [module docs](self) for the pacing policy.
pub struct Pacer {
    inner: Arc<Inner>,
    choreographer: Mutex<Option<ChoreographerSource>>,
    strategy: Strategy,
    listener: ListenerId,
}

impl fmt::Debug for Pacer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pacer")
            .field("strategy", &self.strategy)
            .field("external", &self.uses_external_choreographer())
            .field("frame", &*self.inner.frame())
            .field("tracers", &self.inner.tracers)
            .finish_non_exhaustive()
    }
}

impl Pacer {
    /// Creates a pacer and starts its choreographer source.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::Spawn`] if the choreographer needs a timer
    /// thread and it cannot be started.
    pub fn new(
        config: PacerConfig,
        settings: Arc<Settings>,
        clock: Arc<dyn Clock>,
        platform: &dyn VsyncPlatform,
        request: ChoreographerRequest,
    ) -> Result<Self, PacingError> {
        let inner = Arc::new(Inner {
            clock,
            settings: Arc::clone(&settings),
            vsync: Mutex::new(VsyncState::default()),
            vsync_arrived: Condvar::new(),
            frame: Mutex::new(FrameState::new(config)),
            tracers: TracerRegistry::default(),
            external: AtomicBool::new(false),
        });
        inner.refresh_timings();

        let on_frame = {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            move |timestamp| {
                if let Some(inner) = weak.upgrade()
                    && !inner.external.load(Ordering::Acquire)
                {
                    inner.record_vsync(timestamp);
                }
            }
        };
        let on_refresh_rate_changed = {
            let weak = Arc::downgrade(&inner);
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.refresh_timings();
                }
            }
        };
        let source = ChoreographerSource::create(
            request,
            platform,
            Arc::clone(&settings),
            on_frame,
            on_refresh_rate_changed,
        )?;
        let strategy = source.strategy();

        let listener = {
            let weak = Arc::downgrade(&inner);
            settings.add_listener(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.refresh_timings();
                }
            })
        };

        Ok(Self {
            inner,
            choreographer: Mutex::new(Some(source)),
            strategy,
            listener,
        })
    }

    fn choreographer(&self) -> MutexGuard<'_, Option<ChoreographerSource>> {
        self.choreographer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn post_frame_callbacks(&self) {
        if let Some(source) = &*self.choreographer() {
            source.post_frame_callbacks();
        }
    }

    /// Host-driven vsync at `vsync_timestamp`.
    ///
    /// The first call tears down the internal choreographer; from then on
    /// only these calls advance the vsync count.
    pub fn on_choreographer(&self, vsync_timestamp: HostTime) {
        if !self.inner.external.swap(true, Ordering::AcqRel) {
            let source = self.choreographer().take();
            if source.is_some() {
                log::info!("switching to app-driven choreographer");
            }
            drop(source);
        }
        self.inner.record_vsync(vsync_timestamp);
    }

    /// Blocks until the current frame may be presented.
    pub fn on_pre_swap(&self, handlers: &dyn SwapHandlers) {
        let inner = &*self.inner;
        if inner.frame().phase == FramePhase::Idle {
            inner.start_frame();
        }
        if !self.uses_external_choreographer() {
            self.post_frame_callbacks();
        }

        let now = inner.clock.now();
        let (frame_index, cpu_time, target, period, max_late_frames, sleep) = {
            let mut frame = inner.frame();
            frame.phase = FramePhase::Waiting;
            let cpu_time = frame
                .frame_start
                .map_or(Duration::ZERO, |start| now.saturating_duration_since(start));
            frame.sample.cpu = cpu_time;
            let period = frame.period();
            let sleep = !period.is_zero()
                && period.saturating_mul(u64::from(frame.swap_interval))
                    <= frame.config.max_auto_swap_duration;
            frame.needs_presentation_time = sleep;
            (
                frame.frame_index,
                cpu_time,
                frame.target_vsync,
                period,
                frame.config.max_late_frames,
                sleep,
            )
        };

        inner.tracers.emit("pre_wait", |t| {
            t.on_pre_wait(&PreWaitEvent {
                frame_index,
                timestamp: now,
            });
        });

        let mut late_frames = 0_u32;
        if sleep {
            inner.wait_for_vsync(target, period);
            while !handlers.last_frame_is_complete() && late_frames < max_late_frames {
                late_frames += 1;
                let next = inner.vsync().count + 1;
                inner.wait_for_vsync(next, period);
            }
            if late_frames > 0 {
                log::trace!("frame {frame_index} waited {late_frames} extra vsyncs for the GPU");
            }
        }

        let gpu_time = handlers.prev_frame_gpu_time();
        let after = inner.clock.now();
        {
            let mut frame = inner.frame();
            frame.sample.gpu = gpu_time;
            if late_frames > 0 {
                let extra = period.saturating_mul(u64::from(late_frames));
                frame.presentation_time = frame.presentation_time.map(|t| t.saturating_add(extra));
            }
            frame.phase = FramePhase::Presented;
        }

        inner.tracers.emit("post_wait", |t| {
            t.on_post_wait(&PostWaitEvent {
                frame_index,
                timestamp: after,
                cpu_time,
                gpu_time,
                late_frames,
            });
        });
        inner.tracers.emit("pre_swap_buffers", |t| {
            t.on_pre_swap_buffers(&PreSwapEvent {
                frame_index,
                timestamp: after,
            });
        });
    }

    /// Records the presented frame, updates the swap interval and starts the
    /// next frame.
    pub fn on_post_swap(&self, handlers: &dyn SwapHandlers) {
        let inner = &*self.inner;
        let now = inner.clock.now();
        let gpu_time = handlers.prev_frame_gpu_time();
        let (frame_index, desired_present, change) = {
            let mut frame = inner.frame();
            frame.phase = FramePhase::AwaitingGpuTimestamp;
            frame.sample.gpu = frame.sample.gpu.max(gpu_time);
            let sample = frame.sample;
            frame.model.record(sample);
            let change = frame.update_swap_interval();
            let desired = if frame.needs_presentation_time {
                frame.presentation_time
            } else {
                None
            };
            (frame.frame_index, desired, change)
        };

        inner.tracers.emit("post_swap_buffers", |t| {
            t.on_post_swap_buffers(&PostSwapEvent {
                frame_index,
                timestamp: now,
                desired_present,
            });
        });

        if let Some((old_interval, new_interval, pipelined)) = change {
            log::debug!("swap interval {old_interval} -> {new_interval}, pipelined={pipelined}");
            inner.tracers.emit("swap_interval_changed", |t| {
                t.on_swap_interval_changed(&SwapIntervalChangedEvent {
                    frame_index,
                    timestamp: now,
                    old_interval,
                    new_interval,
                    pipelined,
                });
            });
        }

        if !self.uses_external_choreographer() {
            self.post_frame_callbacks();
        }
        inner.start_frame();
    }

    /// Enables or disables the adaptive swap interval.
    pub fn set_auto_swap_interval(&self, enabled: bool) {
        let mut frame = self.inner.frame();
        frame.config.auto_swap_interval = enabled;
        frame.clamp_interval();
    }

    /// Enables or disables auto pipelining.
    pub fn set_auto_pipeline_mode(&self, enabled: bool) {
        let mut frame = self.inner.frame();
        frame.config.auto_pipeline = enabled;
        if !enabled {
            frame.pipelined = false;
        }
    }

    /// Sets the longest interval auto pacing may choose.
    pub fn set_max_auto_swap_duration(&self, duration: Duration) {
        let mut frame = self.inner.frame();
        frame.config.max_auto_swap_duration = duration;
        frame.clamp_interval();
    }

    /// Sets how many frames are forced to interval 1 once buffer stuffing is
    /// detected. 0 disables the fix.
    pub fn set_buffer_stuffing_fix_wait(&self, frames: u32) {
        let mut frame = self.inner.frame();
        frame.config.buffer_stuffing.fix_wait = frames;
        if frames == 0 {
            frame.stuffing = StuffingState::default();
        }
    }

    /// Replaces the whole buffer-stuffing policy.
    pub fn set_buffer_stuffing_policy(&self, policy: BufferStuffingPolicy) {
        let mut frame = self.inner.frame();
        frame.config.buffer_stuffing = policy;
        frame.stuffing = StuffingState::default();
    }

    /// Feeds the latest measured frame latency, in refresh periods.
    pub fn record_latency(&self, frames: u64) {
        self.inner.frame().stuffing.last_latency = Some(frames);
    }

    /// Latency passed to [`record_latency`](Self::record_latency) that no
    /// pre-swap has consumed yet.
    #[must_use]
    pub fn pending_latency(&self) -> Option<u64> {
        self.inner.frame().stuffing.last_latency
    }

    /// Registers a tracer. The same tracer may be registered more than once.
    pub fn add_tracer(&self, tracer: Arc<dyn PacingTracer>) {
        self.inner.tracers.add(tracer);
    }

    /// Unregisters one registration of `tracer`, matched by identity.
    pub fn remove_tracer(&self, tracer: &Arc<dyn PacingTracer>) -> bool {
        self.inner.tracers.remove(tracer)
    }

    /// Current swap interval times the refresh period.
    #[must_use]
    pub fn swap_duration(&self) -> Duration {
        let frame = self.inner.frame();
        frame
            .period()
            .saturating_mul(u64::from(frame.swap_interval))
    }

    /// Current swap interval in refresh periods.
    #[must_use]
    pub fn swap_interval(&self) -> u32 {
        self.inner.frame().swap_interval
    }

    /// Refresh period in use, zero while unknown.
    #[must_use]
    pub fn refresh_period(&self) -> Duration {
        self.inner.frame().period()
    }

    /// Whether the CPU currently runs a frame ahead of the GPU.
    #[must_use]
    pub fn pipeline_mode(&self) -> bool {
        self.inner.frame().pipelined
    }

    /// When the current frame should reach the display, if known.
    #[must_use]
    pub fn presentation_time(&self) -> Option<HostTime> {
        self.inner.frame().presentation_time
    }

    /// Latest time the current frame can be handed to the compositor.
    #[must_use]
    pub fn presentation_deadline(&self) -> Option<HostTime> {
        let frame = self.inner.frame();
        frame
            .presentation_time
            .map(|t| t.saturating_sub(frame.timings.sf_offset))
    }

    /// Whether the host should pass [`presentation_time`](Self::presentation_time)
    /// to the present call.
    #[must_use]
    pub fn needs_presentation_time(&self) -> bool {
        self.inner.frame().needs_presentation_time
    }

    /// Where the current frame is in its cycle.
    #[must_use]
    pub fn phase(&self) -> FramePhase {
        self.inner.frame().phase
    }

    /// Frames started so far.
    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.inner.frame().frame_index
    }

    /// Vsyncs delivered so far.
    #[must_use]
    pub fn vsync_count(&self) -> u64 {
        self.inner.vsync().count
    }

    /// Vsync count the current frame presents at.
    #[must_use]
    pub fn target_vsync(&self) -> u64 {
        self.inner.frame().target_vsync
    }

    /// The vsync count pre-swap is blocked on, if it is blocked.
    #[must_use]
    pub fn blocked_on_vsync(&self) -> Option<u64> {
        let vsync = self.inner.vsync();
        vsync.blocked_on.filter(|&target| vsync.count < target)
    }

    /// Whether the host drives vsync through [`on_choreographer`](Self::on_choreographer).
    #[must_use]
    pub fn uses_external_choreographer(&self) -> bool {
        self.inner.external.load(Ordering::Acquire)
    }

    /// The strategy the internal choreographer was created with.
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Current configuration, including changes made through setters.
    #[must_use]
    pub fn config(&self) -> PacerConfig {
        self.inner.frame().config
    }

    /// Average per-stage cost over the model window.
    #[must_use]
    pub fn average_frame_duration(&self) -> FrameDuration {
        self.inner.frame().model.average()
    }
}

impl Drop for Pacer {
    fn drop(&mut self) {
        self.inner.settings.remove_listener(self.listener);
        let source = self.choreographer().take();
        drop(source);
    }
}
