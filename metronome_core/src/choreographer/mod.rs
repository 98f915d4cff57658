// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Vsync callback delivery.
//!
//! [`ChoreographerSource`] hides how vsync notifications reach the pacing
//! core. At creation it probes the host's [`VsyncPlatform`] once, most precise
//! strategy first:
//!
//! 1. [`Strategy::Native`]: the platform's low-level vsync API.
//! 2. [`Strategy::Managed`]: callbacks relayed through a managed runtime.
//! 3. [`Strategy::Fallback`]: a timer thread on the steady clock.
//!
//! A strategy that fails to resolve is logged and never retried. The timer
//! fallback always works, even when the display never reports timing, so
//! the pacing core is guaranteed forward progress.
//!
//! # Arming
//!
//! [`ChoreographerSource::post_frame_callbacks`] arms one callback and refills
//! a burst budget of [`MAX_CALLBACKS_BEFORE_IDLE`]. Each delivered vsync
//! spends one unit and re-arms while budget remains, so a render loop that
//! keeps posting stays locked to vsync, and one that stops goes quiet after
//! the burst. Posting while a callback is already pending only refills the
//! budget; it never schedules a second callback.
//!
//! # Platform contract
//!
//! Platforms receive a [`VsyncHandle`] with every request and call
//! [`VsyncHandle::on_vsync`] when the vsync fires, from any thread. The call
//! must not happen synchronously inside `post_frame_callback`. Handles are
//! weak: calls after the source is dropped are ignored.

mod timer;

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::{PacingError, ProbeError};
use crate::settings::{DisplayTimings, Settings};
use crate::time::{Duration, HostTime};

use self::timer::TimerThread;

/// Vsync callbacks delivered per [`ChoreographerSource::post_frame_callbacks`]
/// before the source goes idle.
pub const MAX_CALLBACKS_BEFORE_IDLE: u32 = 10;

/// Refresh period the timer strategy assumes when the display never reports
/// one.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration(16_666_667);

/// How long the timer strategy waits for display timings at startup.
pub const REFRESH_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// The platform's low-level vsync API.
pub trait NativeVsync: Send {
    /// Requests one callback at the next vsync.
    fn post_frame_callback(&mut self, handle: VsyncHandle);

    /// Subscribes `handle` to refresh-rate changes.
    ///
    /// Returns `false` when the platform cannot report them.
    fn register_refresh_rate_callback(&mut self, handle: VsyncHandle) -> bool {
        _ = handle;
        false
    }

    /// Cancels the subscription made by
    /// [`register_refresh_rate_callback`](Self::register_refresh_rate_callback).
    fn unregister_refresh_rate_callback(&mut self) {}
}

/// Vsync callbacks relayed through a managed runtime.
pub trait ManagedVsync: Send {
    /// Requests one callback at the next vsync.
    fn post_frame_callback(&mut self, handle: VsyncHandle);

    /// Releases the runtime-side callback object.
    fn terminate(&mut self) {}
}

/// Capability probe supplied by the host.
pub trait VsyncPlatform {
    /// Resolves the native vsync API.
    fn resolve_native(&self) -> Result<Box<dyn NativeVsync>, ProbeError>;

    /// Resolves managed-runtime vsync callbacks.
    fn resolve_managed(&self) -> Result<Box<dyn ManagedVsync>, ProbeError>;
}

/// A platform with no vsync facility at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPlatform;

impl VsyncPlatform for NoPlatform {
    fn resolve_native(&self) -> Result<Box<dyn NativeVsync>, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    fn resolve_managed(&self) -> Result<Box<dyn ManagedVsync>, ProbeError> {
        Err(ProbeError::Unsupported)
    }
}

/// Which delivery strategy a source ended up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Strategy {
    /// Platform low-level vsync API.
    Native,
    /// Managed-runtime callbacks.
    Managed,
    /// Steady-clock timer thread.
    Fallback,
}

/// How the caller wants vsync delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChoreographerRequest {
    /// Probe the platform and pick the best strategy.
    #[default]
    Auto,
    /// The host drives vsync itself; only the timer runs until it does.
    App,
}

/// Lifecycle of a [`ChoreographerSource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourcePhase {
    /// Created, never armed.
    Uninitialized,
    /// A callback is pending.
    Armed,
    /// Inside a vsync callback.
    Firing,
    /// Burst exhausted; nothing pending.
    Idle,
    /// Torn down.
    Destroyed,
}

type FrameCallback = Box<dyn Fn(HostTime) + Send + Sync>;
type RefreshCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct SourceState {
    phase: SourcePhase,
    armed: bool,
    callbacks_remaining: u32,
    delivered: u64,
}

enum Backend {
    Native {
        vsync: Box<dyn NativeVsync>,
        refresh_registered: bool,
    },
    Managed(Box<dyn ManagedVsync>),
    Fallback(TimerThread),
    Detached,
}

struct Shared {
    state: Mutex<SourceState>,
    backend: Mutex<Backend>,
    settings: Arc<Settings>,
    on_frame: FrameCallback,
    on_refresh_rate_changed: RefreshCallback,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backend(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(self: &Arc<Self>) {
        let handle = VsyncHandle {
            shared: Arc::downgrade(self),
        };
        match &mut *self.backend() {
            Backend::Native { vsync, .. } => vsync.post_frame_callback(handle),
            Backend::Managed(managed) => managed.post_frame_callback(handle),
            Backend::Fallback(timer) => timer.arm(),
            Backend::Detached => {}
        }
    }

    fn on_choreographer(self: &Arc<Self>, timestamp: HostTime) {
        let rearm = {
            let mut state = self.state();
            if state.phase == SourcePhase::Destroyed {
                return;
            }
            state.phase = SourcePhase::Firing;
            state.armed = false;
            state.delivered += 1;
            state.callbacks_remaining = state.callbacks_remaining.saturating_sub(1);
            if state.callbacks_remaining > 0 {
                state.armed = true;
                true
            } else {
                false
            }
        };
        if rearm {
            self.arm();
        }

        (self.on_frame)(timestamp);

        let mut state = self.state();
        if state.phase == SourcePhase::Firing {
            state.phase = if state.armed {
                SourcePhase::Armed
            } else {
                SourcePhase::Idle
            };
        }
    }
}

/// Weak handle through which the platform delivers vsync.
#[derive(Clone)]
pub struct VsyncHandle {
    shared: Weak<Shared>,
}

impl fmt::Debug for VsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VsyncHandle")
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl VsyncHandle {
    /// Reports a vsync at `timestamp`.
    pub fn on_vsync(&self, timestamp: HostTime) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_choreographer(timestamp);
        }
    }

    /// Reports new display timings after a refresh-rate switch.
    pub fn on_refresh_rate_changed(&self, timings: DisplayTimings) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.state().phase == SourcePhase::Destroyed {
            return;
        }
        log::info!("refresh rate changed: period={}", timings.refresh_period);
        shared.settings.set_display_timings(timings);
        (shared.on_refresh_rate_changed)();
    }

    /// Returns `false` once the source is gone.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

/// Delivers vsync callbacks to the pacing core.
pub struct ChoreographerSource {
    shared: Arc<Shared>,
    strategy: Strategy,
}

impl fmt::Debug for ChoreographerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChoreographerSource")
            .field("strategy", &self.strategy)
            .field("state", &*self.shared.state())
            .finish_non_exhaustive()
    }
}

impl ChoreographerSource {
    /// Probes `platform` and starts the best available strategy.
    ///
    /// `on_frame` runs on the delivering thread for every vsync.
    /// `on_refresh_rate_changed` runs after the platform reports new display
    /// timings, which are already stored in `settings` by then.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::Spawn`] if the timer thread cannot be started.
    pub fn create<F, R>(
        request: ChoreographerRequest,
        platform: &dyn VsyncPlatform,
        settings: Arc<Settings>,
        on_frame: F,
        on_refresh_rate_changed: R,
    ) -> Result<Self, PacingError>
    where
        F: Fn(HostTime) + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(SourceState {
                phase: SourcePhase::Uninitialized,
                armed: false,
                callbacks_remaining: 0,
                delivered: 0,
            }),
            backend: Mutex::new(Backend::Detached),
            settings: Arc::clone(&settings),
            on_frame: Box::new(on_frame),
            on_refresh_rate_changed: Box::new(on_refresh_rate_changed),
        });
        let handle = VsyncHandle {
            shared: Arc::downgrade(&shared),
        };

        let (strategy, backend) = match request {
            ChoreographerRequest::Auto => match probe(platform, &handle) {
                Some(found) => found,
                None => {
                    log::info!("using timer choreographer");
                    let timer = TimerThread::spawn(settings, handle)?;
                    (Strategy::Fallback, Backend::Fallback(timer))
                }
            },
            ChoreographerRequest::App => {
                log::info!("app-driven choreographer requested, timer until first vsync");
                let timer = TimerThread::spawn(settings, handle)?;
                (Strategy::Fallback, Backend::Fallback(timer))
            }
        };
        *shared.backend() = backend;

        Ok(Self { shared, strategy })
    }

    /// The strategy chosen at creation.
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SourcePhase {
        self.shared.state().phase
    }

    /// Vsync callbacks delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.shared.state().delivered
    }

    /// Arms the next vsync callback unless one is already pending, and
    /// refills the burst budget.
    pub fn post_frame_callbacks(&self) {
        let arm = {
            let mut state = self.shared.state();
            if state.phase == SourcePhase::Destroyed {
                return;
            }
            state.callbacks_remaining = MAX_CALLBACKS_BEFORE_IDLE;
            if state.armed {
                false
            } else {
                state.armed = true;
                if state.phase != SourcePhase::Firing {
                    state.phase = SourcePhase::Armed;
                }
                true
            }
        };
        if arm {
            self.shared.arm();
        }
    }
}

impl Drop for ChoreographerSource {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state();
            state.phase = SourcePhase::Destroyed;
            state.armed = false;
        }
        let backend = mem::replace(&mut *self.shared.backend(), Backend::Detached);
        match backend {
            Backend::Native {
                mut vsync,
                refresh_registered,
            } => {
                if refresh_registered {
                    vsync.unregister_refresh_rate_callback();
                }
            }
            Backend::Managed(mut managed) => managed.terminate(),
            // Joins the timer thread.
            Backend::Fallback(timer) => drop(timer),
            Backend::Detached => {}
        }
        log::debug!("choreographer source destroyed");
    }
}

fn probe(platform: &dyn VsyncPlatform, handle: &VsyncHandle) -> Option<(Strategy, Backend)> {
    match platform.resolve_native() {
        Ok(mut vsync) => {
            let refresh_registered = vsync.register_refresh_rate_callback(handle.clone());
            if !refresh_registered {
                log::debug!("native choreographer cannot report refresh-rate changes");
            }
            log::info!("using native choreographer");
            return Some((
                Strategy::Native,
                Backend::Native {
                    vsync,
                    refresh_registered,
                },
            ));
        }
        Err(err) => log::warn!("native choreographer unavailable: {err}"),
    }
    match platform.resolve_managed() {
        Ok(managed) => {
            log::info!("using managed choreographer");
            Some((Strategy::Managed, Backend::Managed(managed)))
        }
        Err(err) => {
            log::warn!("managed choreographer unavailable: {err}");
            None
        }
    }
}
