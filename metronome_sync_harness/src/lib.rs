// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Simulated display, GPU and compositor for deterministic pacing tests.
//!
//! Every simulated component reads the same [`SimulatedTimeline`], a clock
//! that only moves when the test moves it. The pacing core reads it too
//! (it implements [`Clock`]), so a test controls exactly how much time each
//! frame's CPU work takes and when each vsync fires.
//!
//! [`Harness`] runs a render loop against a [`Pacer`] while a helper thread
//! plays the display: whenever pre-swap blocks on a vsync, the helper fires
//! the next one. Time never advances while the render thread is outside the
//! pacer except through [`Harness::advance`], so runs are reproducible
//! regardless of scheduling.
//!
//! [`PacingTracker`] grades a run from its present-to-present intervals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use metronome_core::choreographer::{ManagedVsync, NativeVsync, VsyncHandle, VsyncPlatform};
use metronome_core::error::ProbeError;
use metronome_core::fence::{FenceProvider, FenceStatus, FenceWait};
use metronome_core::pacer::{Pacer, SwapHandlers};
use metronome_core::settings::DisplayTimings;
use metronome_core::stats::{FrameTimestampSource, FrameTimestamps, TimestampQuery};
use metronome_core::time::{Clock, Duration, HostTime};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// Simulated time shared by every harness component.
#[derive(Debug)]
pub struct SimulatedTimeline {
    now: Mutex<HostTime>,
    changed: Condvar,
}

impl SimulatedTimeline {
    /// Creates a timeline reading `start`.
    #[must_use]
    pub fn new(start: HostTime) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
            changed: Condvar::new(),
        })
    }

    /// Current simulated time.
    #[must_use]
    pub fn now(&self) -> HostTime {
        *lock(&self.now)
    }

    /// Moves time forward to `t`. Earlier times are ignored.
    pub fn advance_to(&self, t: HostTime) {
        {
            let mut now = lock(&self.now);
            if t <= *now {
                return;
            }
            *now = t;
        }
        self.changed.notify_all();
    }

    /// Moves time forward by `d`.
    pub fn advance(&self, d: Duration) {
        let target = self.now() + d;
        self.advance_to(target);
    }

    /// Blocks until simulated time reaches `t`, for at most `real_timeout`
    /// of wall time. Returns whether `t` was reached.
    pub fn wait_until(&self, t: HostTime, real_timeout: std::time::Duration) -> bool {
        let (now, _) = self
            .changed
            .wait_timeout_while(lock(&self.now), real_timeout, |now| *now < t)
            .unwrap_or_else(PoisonError::into_inner);
        *now >= t
    }
}

impl Clock for SimulatedTimeline {
    fn now(&self) -> HostTime {
        Self::now(self)
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Which vsync strategies the simulated platform offers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlatformSupport {
    /// The native vsync API resolves.
    pub native: bool,
    /// Managed-runtime callbacks resolve.
    pub managed: bool,
}

#[derive(Debug, Default)]
struct Requests {
    frame: Vec<VsyncHandle>,
    refresh: Option<VsyncHandle>,
    posted: u64,
}

/// A [`VsyncPlatform`] whose callbacks are fired by a [`SimulatedDisplay`].
#[derive(Clone, Debug, Default)]
pub struct SimulatedPlatform {
    support: PlatformSupport,
    requests: Arc<Mutex<Requests>>,
}

impl SimulatedPlatform {
    /// Creates a platform offering `support`.
    #[must_use]
    pub fn new(support: PlatformSupport) -> Self {
        Self {
            support,
            requests: Arc::default(),
        }
    }

    /// Frame callbacks posted so far.
    #[must_use]
    pub fn posted_callbacks(&self) -> u64 {
        lock(&self.requests).posted
    }

    /// Frame callbacks waiting for the next vsync.
    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        lock(&self.requests).frame.len()
    }
}

struct SimulatedNative(Arc<Mutex<Requests>>);

impl NativeVsync for SimulatedNative {
    fn post_frame_callback(&mut self, handle: VsyncHandle) {
        let mut requests = lock(&self.0);
        requests.frame.push(handle);
        requests.posted += 1;
    }

    fn register_refresh_rate_callback(&mut self, handle: VsyncHandle) -> bool {
        lock(&self.0).refresh = Some(handle);
        true
    }

    fn unregister_refresh_rate_callback(&mut self) {
        lock(&self.0).refresh = None;
    }
}

struct SimulatedManaged(Arc<Mutex<Requests>>);

impl ManagedVsync for SimulatedManaged {
    fn post_frame_callback(&mut self, handle: VsyncHandle) {
        let mut requests = lock(&self.0);
        requests.frame.push(handle);
        requests.posted += 1;
    }
}

impl VsyncPlatform for SimulatedPlatform {
    fn resolve_native(&self) -> Result<Box<dyn NativeVsync>, ProbeError> {
        if self.support.native {
            Ok(Box::new(SimulatedNative(Arc::clone(&self.requests))))
        } else {
            Err(ProbeError::MissingEntryPoint("post_frame_callback"))
        }
    }

    fn resolve_managed(&self) -> Result<Box<dyn ManagedVsync>, ProbeError> {
        if self.support.managed {
            Ok(Box::new(SimulatedManaged(Arc::clone(&self.requests))))
        } else {
            Err(ProbeError::Unsupported)
        }
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct DisplayState {
    period: Duration,
    next_vsync: HostTime,
    fired: u64,
}

/// A display that fires vsync on a fixed grid of simulated time.
///
/// Vsync goes to every frame callback pending on the [`SimulatedPlatform`]
/// the display was built with, and is returned to the caller so it can be
/// forwarded to [`Pacer::on_choreographer`] when the host drives vsync.
#[derive(Debug)]
pub struct SimulatedDisplay {
    timeline: Arc<SimulatedTimeline>,
    requests: Arc<Mutex<Requests>>,
    state: Mutex<DisplayState>,
}

impl SimulatedDisplay {
    /// Creates a display whose first vsync is one `period` from now.
    #[must_use]
    pub fn new(timeline: Arc<SimulatedTimeline>, period: Duration, platform: &SimulatedPlatform) -> Self {
        let next_vsync = timeline.now() + period;
        Self {
            timeline,
            requests: Arc::clone(&platform.requests),
            state: Mutex::new(DisplayState {
                period,
                next_vsync,
                fired: 0,
            }),
        }
    }

    /// The timeline this display fires on.
    #[must_use]
    pub fn timeline(&self) -> &Arc<SimulatedTimeline> {
        &self.timeline
    }

    /// Refresh period.
    #[must_use]
    pub fn period(&self) -> Duration {
        lock(&self.state).period
    }

    /// Vsyncs fired so far.
    #[must_use]
    pub fn vsyncs(&self) -> u64 {
        lock(&self.state).fired
    }

    /// Display timings matching the current refresh period.
    #[must_use]
    pub fn timings(&self) -> DisplayTimings {
        DisplayTimings {
            refresh_period: self.period(),
            ..DisplayTimings::default()
        }
    }

    /// Fires the next vsync, moving time to it.
    pub fn fire_next_vsync(&self) -> HostTime {
        let mut state = lock(&self.state);
        let t = state.next_vsync;
        self.fire(&mut state, t);
        t
    }

    /// Moves time forward by `d`, firing every vsync on the way.
    pub fn advance_by(&self, d: Duration) -> Vec<HostTime> {
        let target = self.timeline.now() + d;
        let mut state = lock(&self.state);
        let mut fired = Vec::new();
        while state.next_vsync <= target {
            let t = state.next_vsync;
            self.fire(&mut state, t);
            fired.push(t);
        }
        self.timeline.advance_to(target);
        fired
    }

    /// Switches the refresh period and notifies the registered refresh-rate
    /// listener. The new grid starts at the next vsync.
    pub fn set_period(&self, period: Duration) {
        {
            let mut state = lock(&self.state);
            let last = state.next_vsync.saturating_sub(state.period);
            state.period = period;
            state.next_vsync = last + period;
        }
        let listener = lock(&self.requests).refresh.clone();
        if let Some(handle) = listener {
            handle.on_refresh_rate_changed(self.timings());
        }
    }

    fn fire(&self, state: &mut DisplayState, t: HostTime) {
        self.timeline.advance_to(t);
        state.fired += 1;
        state.next_vsync = t + state.period;
        let handles = std::mem::take(&mut lock(&self.requests).frame);
        for handle in handles {
            handle.on_vsync(t);
        }
    }
}

// ---------------------------------------------------------------------------
// GPU
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GpuState {
    next_id: u64,
    gpu_time: Option<Duration>,
    /// Live fences and the simulated time each one signals at.
    fences: HashMap<u64, Option<HostTime>>,
    destroyed: u64,
    destroyed_unsignaled: u64,
}

#[derive(Debug)]
struct GpuInner {
    timeline: Arc<SimulatedTimeline>,
    state: Mutex<GpuState>,
}

/// A [`FenceProvider`] whose fences signal a fixed GPU time after creation,
/// or never.
#[derive(Clone, Debug)]
pub struct SimulatedGpu {
    inner: Arc<GpuInner>,
}

impl SimulatedGpu {
    /// Creates a GPU that takes `gpu_time` per frame. `None` never signals.
    #[must_use]
    pub fn new(timeline: Arc<SimulatedTimeline>, gpu_time: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(GpuInner {
                timeline,
                state: Mutex::new(GpuState {
                    gpu_time,
                    ..GpuState::default()
                }),
            }),
        }
    }

    /// Changes the GPU time of fences created from now on.
    pub fn set_gpu_time(&self, gpu_time: Option<Duration>) {
        lock(&self.inner.state).gpu_time = gpu_time;
    }

    /// Fences created and not yet destroyed.
    #[must_use]
    pub fn live_fences(&self) -> usize {
        lock(&self.inner.state).fences.len()
    }

    /// Fences destroyed so far.
    #[must_use]
    pub fn destroyed_fences(&self) -> u64 {
        lock(&self.inner.state).destroyed
    }

    /// Fences destroyed before they signaled.
    #[must_use]
    pub fn destroyed_unsignaled(&self) -> u64 {
        lock(&self.inner.state).destroyed_unsignaled
    }

    fn signal_time(&self, fence: u64) -> Option<HostTime> {
        lock(&self.inner.state).fences.get(&fence).copied().flatten()
    }
}

impl FenceProvider for SimulatedGpu {
    type Fence = u64;

    fn create_fence(&self) -> Option<u64> {
        let now = self.inner.timeline.now();
        let mut state = lock(&self.inner.state);
        let id = state.next_id;
        state.next_id += 1;
        let signal_at = state.gpu_time.map(|d| now + d);
        state.fences.insert(id, signal_at);
        Some(id)
    }

    fn client_wait(&self, fence: u64, timeout: Duration) -> FenceWait {
        let Some(signal_at) = self.signal_time(fence) else {
            thread::sleep(timeout.to_std());
            return FenceWait::TimedOut;
        };
        if self.inner.timeline.wait_until(signal_at, timeout.to_std()) {
            FenceWait::Signaled
        } else {
            FenceWait::TimedOut
        }
    }

    fn status(&self, fence: u64) -> FenceStatus {
        match self.signal_time(fence) {
            Some(t) if self.inner.timeline.now() >= t => FenceStatus::Signaled,
            _ => FenceStatus::Unsignaled,
        }
    }

    fn destroy(&self, fence: u64) {
        let now = self.inner.timeline.now();
        let mut state = lock(&self.inner.state);
        if let Some(signal_at) = state.fences.remove(&fence) {
            state.destroyed += 1;
            if signal_at.is_none_or(|t| now < t) {
                state.destroyed_unsignaled += 1;
            }
        } else {
            log::error!("fence {fence} destroyed twice");
        }
    }
}

// ---------------------------------------------------------------------------
// Compositor
// ---------------------------------------------------------------------------

/// A [`FrameTimestampSource`] that latches each frame a fixed number of
/// refresh periods after it was registered.
#[derive(Debug)]
pub struct SimulatedCompositor {
    timeline: Arc<SimulatedTimeline>,
    period: Duration,
    latency_frames: u64,
    submitted: Mutex<HashMap<u64, HostTime>>,
    next_id: AtomicU64,
    stalled: AtomicBool,
}

impl SimulatedCompositor {
    /// Creates a compositor with `latency_frames` periods of latency.
    #[must_use]
    pub fn new(timeline: Arc<SimulatedTimeline>, period: Duration, latency_frames: u64) -> Self {
        Self {
            timeline,
            period,
            latency_frames,
            submitted: Mutex::default(),
            next_id: AtomicU64::new(1),
            stalled: AtomicBool::new(false),
        }
    }

    /// While stalled, every query reports [`TimestampQuery::Pending`].
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Relaxed);
    }
}

impl FrameTimestampSource for SimulatedCompositor {
    fn next_frame_id(&self) -> Option<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.submitted).insert(id, self.timeline.now());
        Some(id)
    }

    fn frame_timestamps(&self, frame_id: u64) -> TimestampQuery {
        if self.stalled.load(Ordering::Relaxed) {
            return TimestampQuery::Pending;
        }
        let Some(&submitted) = lock(&self.submitted).get(&frame_id) else {
            return TimestampQuery::Unavailable;
        };
        let latched = submitted + self.period * self.latency_frames;
        if self.timeline.now() < latched {
            return TimestampQuery::Pending;
        }
        lock(&self.submitted).remove(&frame_id);
        TimestampQuery::Ready(FrameTimestamps {
            requested: submitted,
            rendering_completed: submitted,
            composition_latched: latched,
            presented: latched + self.period,
        })
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// [`SwapHandlers`] with answers set by the test.
#[derive(Debug)]
pub struct FixedHandlers {
    complete: AtomicBool,
    gpu_time: AtomicU64,
}

impl FixedHandlers {
    /// Handlers reporting the GPU idle.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            complete: AtomicBool::new(true),
            gpu_time: AtomicU64::new(0),
        }
    }

    /// Sets whether the previous frame's GPU work has finished.
    pub fn set_complete(&self, complete: bool) {
        self.complete.store(complete, Ordering::Relaxed);
    }

    /// Sets the reported GPU time.
    pub fn set_gpu_time(&self, gpu_time: Duration) {
        self.gpu_time.store(gpu_time.nanos(), Ordering::Relaxed);
    }
}

impl Default for FixedHandlers {
    fn default() -> Self {
        Self::idle()
    }
}

impl SwapHandlers for FixedHandlers {
    fn last_frame_is_complete(&self) -> bool {
        self.complete.load(Ordering::Relaxed)
    }

    fn prev_frame_gpu_time(&self) -> Duration {
        Duration(self.gpu_time.load(Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// How vsync reaches the pacer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VsyncRoute {
    /// Through the pacer's own choreographer and the simulated platform.
    Platform,
    /// The host forwards every vsync to [`Pacer::on_choreographer`].
    External,
}

/// One present observed by [`Harness::run_frames`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentRecord {
    /// Frame counter.
    pub frame_index: u64,
    /// Simulated time of the present.
    pub presented_at: HostTime,
    /// Vsyncs fired before the present.
    pub vsync: u64,
    /// Swap interval when presenting.
    pub swap_interval: u32,
    /// Presentation time the pacer asked for.
    pub desired: Option<HostTime>,
    /// Latest hand-off time for the frame.
    pub deadline: Option<HostTime>,
}

/// Drives a render loop against a pacer with a simulated display.
#[derive(Debug)]
pub struct Harness<'a> {
    pacer: &'a Pacer,
    display: &'a SimulatedDisplay,
    route: VsyncRoute,
}

impl<'a> Harness<'a> {
    /// Creates a harness.
    ///
    /// With [`VsyncRoute::External`] the pacer is switched to host-driven
    /// vsync right away, with a vsync at the current time.
    #[must_use]
    pub fn new(pacer: &'a Pacer, display: &'a SimulatedDisplay, route: VsyncRoute) -> Self {
        if route == VsyncRoute::External && !pacer.uses_external_choreographer() {
            pacer.on_choreographer(display.timeline.now());
        }
        Self {
            pacer,
            display,
            route,
        }
    }

    fn forward(&self, fired: &[HostTime]) {
        if self.route == VsyncRoute::External {
            for &t in fired {
                self.pacer.on_choreographer(t);
            }
        }
    }

    /// Simulates `d` of host work, firing the vsyncs that fall inside it.
    pub fn advance(&self, d: Duration) {
        let fired = self.display.advance_by(d);
        self.forward(&fired);
    }

    /// Runs `body` while a helper thread fires one vsync each time the pacer
    /// blocks on one.
    pub fn run<R>(&self, body: impl FnOnce(&Self) -> R) -> R {
        let done = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    if self.pacer.blocked_on_vsync().is_some() {
                        let t = self.display.fire_next_vsync();
                        self.forward(&[t]);
                    } else {
                        thread::yield_now();
                    }
                }
            });
            let result = body(self);
            done.store(true, Ordering::Release);
            result
        })
    }

    /// Runs `frames` frames, with `cpu(i)` of host work before frame `i`'s
    /// pre-swap.
    pub fn run_frames(
        &self,
        frames: u64,
        handlers: &dyn SwapHandlers,
        mut cpu: impl FnMut(u64) -> Duration,
    ) -> Vec<PresentRecord> {
        self.run(|h| {
            (0..frames)
                .map(|i| {
                    h.advance(cpu(i));
                    h.pacer.on_pre_swap(handlers);
                    let record = PresentRecord {
                        frame_index: h.pacer.frame_index(),
                        presented_at: h.display.timeline.now(),
                        vsync: h.display.vsyncs(),
                        swap_interval: h.pacer.swap_interval(),
                        desired: h
                            .pacer
                            .needs_presentation_time()
                            .then(|| h.pacer.presentation_time())
                            .flatten(),
                        deadline: h.pacer.presentation_deadline(),
                    };
                    h.pacer.on_post_swap(handlers);
                    record
                })
                .collect()
        })
    }
}

// ---------------------------------------------------------------------------
// Grading
// ---------------------------------------------------------------------------

/// Letter grade for pacing quality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacingGrade {
    /// Steady intervals and almost no misses.
    A,
    /// Occasional misses.
    B,
    /// Degraded but usable.
    C,
    /// Poor pacing.
    D,
}

impl PacingGrade {
    /// Returns a short label for HUD rendering.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        }
    }
}

/// Aggregated report returned by [`PacingTracker::observe`].
#[derive(Clone, Copy, Debug)]
pub struct PacingReport {
    /// Current grade.
    pub grade: PacingGrade,
    /// Misses per 1000 observed frames.
    pub miss_rate_per_1000: f64,
    /// Total frames observed.
    pub total_frames: u64,
    /// Frames whose interval was off by half a period or more.
    pub missed_frames: u64,
}

/// Rolling tracker of present-to-present intervals.
#[derive(Debug)]
pub struct PacingTracker<const N: usize> {
    deltas_ms: [f64; N],
    cursor: usize,
    total_frames: u64,
    missed_frames: u64,
}

impl<const N: usize> Default for PacingTracker<N> {
    fn default() -> Self {
        Self::new(16.67)
    }
}

impl<const N: usize> PacingTracker<N> {
    /// Creates a tracker with `seed_delta_ms` prefilled in the ring buffer.
    #[must_use]
    pub const fn new(seed_delta_ms: f64) -> Self {
        Self {
            deltas_ms: [seed_delta_ms; N],
            cursor: 0,
            total_frames: 0,
            missed_frames: 0,
        }
    }

    /// Observes one present interval against the expected one.
    #[must_use]
    pub fn observe(&mut self, delta: Duration, expected: Duration, period: Duration) -> PacingReport {
        self.total_frames = self.total_frames.saturating_add(1);
        let delta_ms = delta.nanos() as f64 / 1_000_000.0;
        self.deltas_ms[self.cursor % N] = delta_ms;
        self.cursor = (self.cursor + 1) % N;

        let error = delta.nanos().abs_diff(expected.nanos());
        if error.saturating_mul(2) >= period.nanos() {
            self.missed_frames = self.missed_frames.saturating_add(1);
        }

        let miss_rate = self.missed_frames as f64 * 1000.0 / self.total_frames as f64;
        PacingReport {
            grade: grade_for(miss_rate),
            miss_rate_per_1000: miss_rate,
            total_frames: self.total_frames,
            missed_frames: self.missed_frames,
        }
    }

    /// Returns ring-buffer deltas oldest→newest, in milliseconds.
    #[must_use]
    pub fn frame_deltas(&self) -> [f64; N] {
        std::array::from_fn(|i| self.deltas_ms[(self.cursor + i) % N])
    }

    /// Returns an ASCII sparkline over `frame_deltas()`.
    #[must_use]
    pub fn sparkline_ascii(&self, min_ms: f64, max_ms: f64) -> String {
        const LEVELS: &[u8] = b" .:-=+*#%@";
        self.frame_deltas()
            .iter()
            .map(|&v| {
                let t = (v.clamp(min_ms, max_ms) - min_ms) / (max_ms - min_ms);
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "index is clamped to ASCII level count"
                )]
                let level = (t * (LEVELS.len() as f64 - 1.0) + 0.5) as usize;
                char::from(LEVELS[level])
            })
            .collect()
    }
}

fn grade_for(miss_rate_per_1000: f64) -> PacingGrade {
    if miss_rate_per_1000 < 10.0 {
        PacingGrade::A
    } else if miss_rate_per_1000 < 30.0 {
        PacingGrade::B
    } else if miss_rate_per_1000 < 80.0 {
        PacingGrade::C
    } else {
        PacingGrade::D
    }
}
