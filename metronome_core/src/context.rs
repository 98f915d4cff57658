// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host-facing context that wires the pacing components together.
//!
//! A [`PacingContext`] owns the [`Settings`], the [`Pacer`] (which in turn
//! owns the choreographer source) and a [`FenceProbe`]. Hosts that want
//! explicit ownership construct one directly; hosts that need a single
//! process-wide instance go through [`global`].
//!
//! Each present goes through [`PacingContext::swap`]:
//!
//! ```text
//!   on_pre_swap ─► desired time ─► reset_sync_fence ─► present(..) ─► on_post_swap
//! ```
//!
//! A disabled context (see [`ContextConfig::from_env`]) skips all of it and
//! calls `present(None)` straight away.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::choreographer::{ChoreographerRequest, VsyncPlatform};
use crate::error::PacingError;
use crate::fence::{DEFAULT_FENCE_TIMEOUT, FenceProbe, FenceProvider, PresentationProbe};
use crate::pacer::{Pacer, PacerConfig, SwapHandlers};
use crate::settings::{DisplayTimings, Settings};
use crate::stats::{FrameStatistics, FrameTimestampSource, PacingStats, StatsMode};
use crate::time::{Clock, Duration, HostTime, MonotonicClock};
use crate::trace::PacingTracer;

/// Environment variable that disables pacing when set to `1`.
pub const DISABLE_ENV: &str = "METRONOME_DISABLE";

/// Configuration for a [`PacingContext`].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextConfig {
    /// When `false`, presents pass straight through.
    pub enabled: bool,
    /// Pacing core configuration.
    pub pacer: PacerConfig,
    /// Fence waiter timeout.
    pub fence_timeout: Duration,
    /// Pin the fence waiter and timer choreographer threads to efficiency
    /// cores. See [`Settings::set_use_affinity`].
    pub use_affinity: bool,
    /// Which choreographer to prefer.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub choreographer: ChoreographerRequest,
}

impl ContextConfig {
    /// Enabled, with default pacing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: true,
            pacer: PacerConfig::new(),
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            use_affinity: true,
            choreographer: ChoreographerRequest::Auto,
        }
    }

    /// Default configuration, disabled if `METRONOME_DISABLE=1`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(DISABLE_ENV).ok().as_deref())
    }

    /// [`from_env`](Self::from_env) with the variable's value passed in.
    #[must_use]
    pub fn from_env_value(disable: Option<&str>) -> Self {
        let disabled = disable.is_some_and(|v| v.trim() == "1");
        if disabled {
            log::info!("{DISABLE_ENV}=1, frame pacing disabled");
        }
        Self {
            enabled: !disabled,
            ..Self::new()
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts a fence probe to the pacing core's handler interface.
struct ProbeHandlers<'a>(&'a dyn PresentationProbe);

impl SwapHandlers for ProbeHandlers<'_> {
    fn last_frame_is_complete(&self) -> bool {
        self.0.last_frame_is_complete()
    }

    fn prev_frame_gpu_time(&self) -> Duration {
        self.0.fence_pending_time()
    }
}

struct Active {
    pacer: Pacer,
    probe: Box<dyn PresentationProbe>,
}

/// One host's frame pacing state.
pub struct PacingContext {
    settings: Arc<Settings>,
    clock: Arc<dyn Clock>,
    active: Option<Active>,
    stats: Mutex<Arc<FrameStatistics>>,
}

impl fmt::Debug for PacingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("PacingContext");
        s.field("settings", &self.settings);
        if let Some(active) = &self.active {
            s.field("pacer", &active.pacer)
                .field("fence_timeout", &active.probe.fence_timeout());
        } else {
            s.field("enabled", &false);
        }
        s.finish_non_exhaustive()
    }
}

impl PacingContext {
    /// Creates a context on the monotonic clock.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::Spawn`] if a worker thread cannot be started.
    pub fn new<P: FenceProvider>(
        config: ContextConfig,
        platform: &dyn VsyncPlatform,
        fences: P,
    ) -> Result<Self, PacingError> {
        Self::with_clock(config, platform, fences, Arc::new(MonotonicClock))
    }

    /// Creates a context that reads time from `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::Spawn`] if a worker thread cannot be started.
    pub fn with_clock<P: FenceProvider>(
        config: ContextConfig,
        platform: &dyn VsyncPlatform,
        fences: P,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PacingError> {
        let settings = Settings::new();
        settings.set_use_affinity(config.use_affinity);
        let stats = Mutex::new(Arc::new(FrameStatistics::new(StatsMode::LatencyOnly)));
        if !config.enabled {
            return Ok(Self {
                settings,
                clock,
                active: None,
                stats,
            });
        }

        let probe = FenceProbe::with_settings(fences, Arc::clone(&settings))?;
        probe.set_fence_timeout(config.fence_timeout);
        let pacer = Pacer::new(
            config.pacer,
            Arc::clone(&settings),
            Arc::clone(&clock),
            platform,
            config.choreographer,
        )?;
        log::info!(
            "frame pacing initialized with {:?} choreographer",
            pacer.strategy()
        );
        Ok(Self {
            settings,
            clock,
            active: Some(Active {
                pacer,
                probe: Box::new(probe),
            }),
            stats,
        })
    }

    fn active(&self) -> Result<&Active, PacingError> {
        self.active.as_ref().ok_or(PacingError::Disabled)
    }

    fn stats_lock(&self) -> MutexGuard<'_, Arc<FrameStatistics>> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether pacing is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    /// Shared settings for this context.
    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Reports the display's timings.
    pub fn set_display_timings(&self, timings: DisplayTimings) {
        self.settings.set_display_timings(timings);
    }

    /// The pacing core.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::Disabled`] for a disabled context.
    pub fn pacer(&self) -> Result<&Pacer, PacingError> {
        self.active().map(|a| &a.pacer)
    }

    /// Paces one present.
    ///
    /// `present` receives the desired presentation time when the pacer wants
    /// the host to pass one to the compositor.
    pub fn swap<R>(&self, present: impl FnOnce(Option<HostTime>) -> R) -> R {
        let Some(active) = &self.active else {
            return present(None);
        };
        let handlers = ProbeHandlers(active.probe.as_ref());
        active.pacer.on_pre_swap(&handlers);
        let desired = if active.pacer.needs_presentation_time() {
            active.pacer.presentation_time()
        } else {
            None
        };
        active.probe.reset_sync_fence();
        let result = present(desired);
        active.pacer.on_post_swap(&handlers);
        result
    }

    /// Host-driven vsync. No-op for a disabled context.
    pub fn on_choreographer(&self, vsync_timestamp: HostTime) {
        if let Some(active) = &self.active {
            active.pacer.on_choreographer(vsync_timestamp);
        }
    }

    /// Switches between latency-only and full statistics.
    ///
    /// Switching resets the collected histograms.
    pub fn enable_stats(&self, enabled: bool) {
        let mode = if enabled {
            StatsMode::Full
        } else {
            StatsMode::LatencyOnly
        };
        let mut stats = self.stats_lock();
        if stats.mode() != mode {
            log::debug!("statistics mode now {mode:?}");
            *stats = Arc::new(FrameStatistics::new(mode));
        }
    }

    /// Registers the frame about to be presented with the compositor and
    /// feeds the latest measured latency to the pacer.
    ///
    /// Call once per frame, before [`swap`](Self::swap).
    pub fn record_frame_start(&self, source: &dyn FrameTimestampSource) {
        let Some(active) = &self.active else {
            return;
        };
        let stats = Arc::clone(&*self.stats_lock());
        stats.capture(source, active.pacer.refresh_period(), self.clock.now());
        active.pacer.record_latency(stats.last_latency_recorded());
    }

    /// Collected histograms, if full statistics are enabled.
    #[must_use]
    pub fn stats(&self) -> Option<PacingStats> {
        self.stats_lock().stats()
    }

    /// Sets the fence waiter timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::Disabled`] for a disabled context.
    pub fn set_fence_timeout(&self, timeout: Duration) -> Result<(), PacingError> {
        self.active()?.probe.set_fence_timeout(timeout);
        Ok(())
    }

    /// The fence waiter timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::Disabled`] for a disabled context.
    pub fn fence_timeout(&self) -> Result<Duration, PacingError> {
        Ok(self.active()?.probe.fence_timeout())
    }

    /// Registers a tracer.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::Disabled`] for a disabled context.
    pub fn add_tracer(&self, tracer: Arc<dyn PacingTracer>) -> Result<(), PacingError> {
        self.active()?.pacer.add_tracer(tracer);
        Ok(())
    }

    /// Unregisters a tracer. Returns `false` if it was not registered.
    pub fn remove_tracer(&self, tracer: &Arc<dyn PacingTracer>) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.pacer.remove_tracer(tracer))
    }
}

/// Process-wide context for hosts that cannot thread one through.
pub mod global {
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use super::{ContextConfig, PacingContext};
    use crate::choreographer::VsyncPlatform;
    use crate::error::PacingError;
    use crate::fence::FenceProvider;

    static GLOBAL: Mutex<Option<Arc<PacingContext>>> = Mutex::new(None);

    fn lock() -> MutexGuard<'static, Option<Arc<PacingContext>>> {
        GLOBAL.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the process-wide context.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::AlreadyInitialized`] if one exists, or any
    /// error from [`PacingContext::new`].
    pub fn init<P: FenceProvider>(
        config: ContextConfig,
        platform: &dyn VsyncPlatform,
        fences: P,
    ) -> Result<(), PacingError> {
        let mut global = lock();
        if global.is_some() {
            return Err(PacingError::AlreadyInitialized);
        }
        *global = Some(Arc::new(PacingContext::new(config, platform, fences)?));
        Ok(())
    }

    /// Tears down the process-wide context.
    ///
    /// Calls already running inside [`with`] finish on the old context.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::NotInitialized`] if there is none.
    pub fn destroy() -> Result<(), PacingError> {
        let context = lock().take().ok_or(PacingError::NotInitialized)?;
        drop(context);
        log::info!("frame pacing destroyed");
        Ok(())
    }

    /// Runs `f` with the process-wide context.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::NotInitialized`] if there is none.
    pub fn with<R>(f: impl FnOnce(&PacingContext) -> R) -> Result<R, PacingError> {
        let context = lock().clone().ok_or(PacingError::NotInitialized)?;
        Ok(f(&context))
    }

    /// Whether the process-wide context exists.
    #[must_use]
    pub fn is_initialized() -> bool {
        lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::thread;

    use crate::choreographer::NoPlatform;
    use crate::fence::{FenceStatus, FenceWait};
    use crate::stats::{FrameTimestamps, TimestampQuery};
    use crate::time::ManualClock;

    use super::*;

    /// GPU that finishes everything instantly.
    #[derive(Default)]
    struct IdleGpu {
        created: AtomicU64,
    }

    impl FenceProvider for IdleGpu {
        type Fence = u64;

        fn create_fence(&self) -> Option<u64> {
            Some(self.created.fetch_add(1, Ordering::Relaxed))
        }

        fn client_wait(&self, _: u64, _: Duration) -> FenceWait {
            FenceWait::Signaled
        }

        fn status(&self, _: u64) -> FenceStatus {
            FenceStatus::Signaled
        }

        fn destroy(&self, _: u64) {}
    }

    #[test]
    fn env_value_disables() {
        assert!(ContextConfig::from_env_value(None).enabled);
        assert!(ContextConfig::from_env_value(Some("0")).enabled);
        assert!(!ContextConfig::from_env_value(Some("1")).enabled);
        assert!(!ContextConfig::from_env_value(Some(" 1\n")).enabled);
    }

    #[test]
    fn disabled_context_passes_through() {
        let config = ContextConfig {
            enabled: false,
            ..ContextConfig::new()
        };
        let context = PacingContext::new(config, &NoPlatform, IdleGpu::default()).unwrap();
        assert!(!context.is_enabled());
        assert_eq!(context.swap(|desired| desired), None);
        assert!(matches!(context.pacer(), Err(PacingError::Disabled)));
        assert!(matches!(context.fence_timeout(), Err(PacingError::Disabled)));
    }

    #[test]
    fn swap_presents_with_desired_time() {
        let clock = Arc::new(ManualClock::new(HostTime(0)));
        let context = PacingContext::with_clock(
            ContextConfig::new(),
            &NoPlatform,
            IdleGpu::default(),
            clock.clone(),
        )
        .unwrap();
        context.set_display_timings(DisplayTimings::from_refresh_rate(60));
        let period = context.pacer().unwrap().refresh_period();
        context.on_choreographer(HostTime(period.nanos()));

        let done = AtomicBool::new(false);
        let mut presented = 0;
        let desired = thread::scope(|s| {
            // Plays the display: one vsync whenever pre-swap blocks.
            s.spawn(|| {
                let mut n = 1;
                while !done.load(Ordering::Acquire) {
                    if context.pacer().unwrap().blocked_on_vsync().is_some() {
                        n += 1;
                        clock.set(HostTime(n * period.nanos()));
                        context.on_choreographer(HostTime(n * period.nanos()));
                    } else {
                        thread::yield_now();
                    }
                }
            });
            let desired = context.swap(|desired| {
                presented += 1;
                desired
            });
            done.store(true, Ordering::Release);
            desired
        });

        assert_eq!(presented, 1);
        assert_eq!(desired, Some(HostTime(2 * period.nanos())));
        assert!(context.pacer().unwrap().uses_external_choreographer());
        assert_eq!(context.fence_timeout().unwrap(), DEFAULT_FENCE_TIMEOUT);
    }

    /// Compositor that reports every frame two periods after its id is
    /// handed out.
    struct Compositor {
        next: AtomicU64,
        latency: u64,
        period: Duration,
    }

    impl FrameTimestampSource for Compositor {
        fn next_frame_id(&self) -> Option<u64> {
            Some(self.next.fetch_add(1, Ordering::Relaxed))
        }

        fn frame_timestamps(&self, frame_id: u64) -> TimestampQuery {
            if frame_id + 1 >= self.next.load(Ordering::Relaxed) {
                return TimestampQuery::Pending;
            }
            let base = HostTime(frame_id * self.period.nanos());
            let latched = base + self.period * self.latency;
            TimestampQuery::Ready(FrameTimestamps {
                requested: base,
                rendering_completed: base,
                composition_latched: latched,
                presented: latched + self.period,
            })
        }
    }

    #[test]
    fn stats_follow_enable_flag() {
        let clock = Arc::new(ManualClock::new(HostTime(0)));
        let context = PacingContext::with_clock(
            ContextConfig::new(),
            &NoPlatform,
            IdleGpu::default(),
            clock.clone(),
        )
        .unwrap();
        context.set_display_timings(DisplayTimings::from_refresh_rate(60));
        let period = context.pacer().unwrap().refresh_period();
        let compositor = Compositor {
            next: AtomicU64::new(0),
            latency: 2,
            period,
        };

        assert_eq!(context.stats(), None);
        context.enable_stats(true);
        for frame in 0..4 {
            clock.set(HostTime(frame * period.nanos()));
            context.record_frame_start(&compositor);
        }
        let stats = context.stats().unwrap();
        assert!(stats.total_frames > 0);
        assert!(stats.latency_frames[2] > 0);

        context.enable_stats(false);
        assert_eq!(context.stats(), None);
    }

    #[test]
    fn affinity_choice_is_applied_before_threads_start() {
        let config = ContextConfig {
            use_affinity: false,
            ..ContextConfig::new()
        };
        let context = PacingContext::new(config, &NoPlatform, IdleGpu::default()).unwrap();
        assert!(!context.settings().use_affinity());

        let context =
            PacingContext::new(ContextConfig::new(), &NoPlatform, IdleGpu::default()).unwrap();
        assert!(context.settings().use_affinity());
    }

    #[test]
    fn zero_latency_reaches_the_pacer() {
        let clock = Arc::new(ManualClock::new(HostTime(0)));
        let context = PacingContext::with_clock(
            ContextConfig::new(),
            &NoPlatform,
            IdleGpu::default(),
            clock.clone(),
        )
        .unwrap();
        context.set_display_timings(DisplayTimings::from_refresh_rate(60));
        let pacer = context.pacer().unwrap();
        let period = pacer.refresh_period();
        let compositor = Compositor {
            next: AtomicU64::new(0),
            latency: 0,
            period,
        };
        assert_eq!(pacer.pending_latency(), None);

        context.enable_stats(true);
        for frame in 0..3 {
            clock.set(HostTime(frame * period.nanos()));
            context.record_frame_start(&compositor);
        }
        assert_eq!(pacer.pending_latency(), Some(0));
    }

    #[test]
    fn global_lifecycle() {
        assert!(matches!(global::destroy(), Err(PacingError::NotInitialized)));
        assert!(matches!(
            global::with(|_| ()),
            Err(PacingError::NotInitialized)
        ));

        global::init(ContextConfig::new(), &NoPlatform, IdleGpu::default()).unwrap();
        assert!(global::is_initialized());
        assert!(matches!(
            global::init(ContextConfig::new(), &NoPlatform, IdleGpu::default()),
            Err(PacingError::AlreadyInitialized)
        ));
        assert!(global::with(|c| c.is_enabled()).unwrap());

        global::destroy().unwrap();
        assert!(!global::is_initialized());
    }
}
