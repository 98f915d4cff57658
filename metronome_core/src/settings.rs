// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Display timing parameters and user pacing options.
//!
//! [`Settings`] is the single source of truth for the display's refresh
//! cadence. The platform may update it at any time from its own callback
//! thread while the render thread reads it; every read returns a whole
//! [`DisplayTimings`] snapshot.
//!
//! Listeners registered with [`Settings::add_listener`] run synchronously on
//! the thread that called the setter, after the settings lock is released, so
//! a listener may read the settings back without deadlocking.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::time::Duration;

/// Refresh period and compositor offsets reported by the display.
///
/// A zero `refresh_period` means the display has not reported yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DisplayTimings {
    /// Time between two vsyncs.
    pub refresh_period: Duration,
    /// Offset from vsync at which the app is woken.
    pub app_offset: Duration,
    /// Offset from vsync at which the compositor latches buffers.
    pub sf_offset: Duration,
}

impl DisplayTimings {
    /// Timings for a display running at `hz` with no compositor offsets.
    #[must_use]
    pub fn from_refresh_rate(hz: u32) -> Self {
        let refresh_period = if hz == 0 {
            Duration::ZERO
        } else {
            Duration(1_000_000_000 / u64::from(hz))
        };
        Self {
            refresh_period,
            ..Self::default()
        }
    }

    /// Returns `true` once the refresh period is known.
    #[inline]
    #[must_use]
    pub const fn is_known(&self) -> bool {
        !self.refresh_period.is_zero()
    }
}

/// Identifies a listener registered with [`Settings::add_listener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn() + Send + Sync>;

struct State {
    timings: DisplayTimings,
    swap_duration: Duration,
    use_affinity: bool,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

/// Process-wide display timings and pacing options.
///
/// Shared as `Arc<Settings>` between the context, the choreographer source
/// and the pacing core.
pub struct Settings {
    state: Mutex<State>,
    refresh_known: Condvar,
}

impl core::fmt::Debug for Settings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("Settings")
            .field("timings", &state.timings)
            .field("swap_duration", &state.swap_duration)
            .field("use_affinity", &state.use_affinity)
            .field("listeners", &state.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Creates settings with unknown display timings.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                timings: DisplayTimings::default(),
                swap_duration: Duration::ZERO,
                use_affinity: true,
                listeners: Vec::new(),
                next_listener: 0,
            }),
            refresh_known: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the display timings and notifies listeners.
    pub fn set_display_timings(&self, timings: DisplayTimings) {
        let listeners = {
            let mut state = self.lock();
            state.timings = timings;
            self.refresh_known.notify_all();
            snapshot(&state.listeners)
        };
        log::debug!(
            "display timings: period={} app_offset={} sf_offset={}",
            timings.refresh_period,
            timings.app_offset,
            timings.sf_offset
        );
        for listener in listeners {
            listener();
        }
    }

    /// Returns the latest display timings, or zeros if never set.
    #[must_use]
    pub fn display_timings(&self) -> DisplayTimings {
        self.lock().timings
    }

    /// Sets the host's requested minimum presentation interval and notifies
    /// listeners.
    pub fn set_swap_duration(&self, duration: Duration) {
        let listeners = {
            let mut state = self.lock();
            state.swap_duration = duration;
            snapshot(&state.listeners)
        };
        for listener in listeners {
            listener();
        }
    }

    /// Returns the host's requested minimum presentation interval.
    #[must_use]
    pub fn swap_duration(&self) -> Duration {
        self.lock().swap_duration
    }

    /// Sets whether the timer choreographer thread pins itself to efficiency
    /// cores when it starts. Enabled by default.
    pub fn set_use_affinity(&self, use_affinity: bool) {
        let listeners = {
            let mut state = self.lock();
            state.use_affinity = use_affinity;
            snapshot(&state.listeners)
        };
        for listener in listeners {
            listener();
        }
    }

    /// Returns whether pacing threads should prefer efficiency cores.
    #[must_use]
    pub fn use_affinity(&self) -> bool {
        self.lock().use_affinity
    }

    /// Registers a callback fired after every setter.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Unregisters a listener. Unknown ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        self.lock().listeners.retain(|(l, _)| *l != id);
    }

    /// Blocks until the refresh period is known or `timeout` elapses.
    ///
    /// Returns the refresh period if it became known in time.
    #[must_use]
    pub fn wait_for_refresh_period(&self, timeout: Duration) -> Option<Duration> {
        let state = self.lock();
        let (state, _) = self
            .refresh_known
            .wait_timeout_while(state, timeout.to_std(), |s| !s.timings.is_known())
            .unwrap_or_else(PoisonError::into_inner);
        state
            .timings
            .is_known()
            .then_some(state.timings.refresh_period)
    }
}

fn snapshot(listeners: &[(ListenerId, Listener)]) -> Vec<Listener> {
    listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn unset_timings_read_as_zero() {
        let settings = Settings::new();
        assert_eq!(settings.display_timings(), DisplayTimings::default());
        assert!(!settings.display_timings().is_known());
    }

    #[test]
    fn display_timings_round_trip() {
        let settings = Settings::new();
        let timings = DisplayTimings {
            refresh_period: Duration(16_666_666),
            app_offset: Duration(1_000_000),
            sf_offset: Duration(4_000_000),
        };
        settings.set_display_timings(timings);
        assert_eq!(settings.display_timings(), timings);
    }

    #[test]
    fn listeners_fire_and_can_read_back() {
        let settings = Settings::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&settings);
        let seen_in = Arc::clone(&seen);
        let _id = settings.add_listener(move || {
            if let Some(s) = weak.upgrade() {
                let period = s.display_timings().refresh_period.nanos();
                seen_in.store(usize::try_from(period).unwrap(), Ordering::SeqCst);
            }
        });
        settings.set_display_timings(DisplayTimings::from_refresh_rate(120));
        assert_eq!(seen.load(Ordering::SeqCst), 8_333_333);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let settings = Settings::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let id = settings.add_listener(move || {
            calls_in.fetch_add(1, Ordering::SeqCst);
        });
        settings.set_swap_duration(Duration::from_millis(16));
        settings.remove_listener(id);
        settings.set_use_affinity(false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!settings.use_affinity());
        assert_eq!(settings.swap_duration(), Duration::from_millis(16));
    }

    #[test]
    fn wait_for_refresh_period_unblocks_on_set() {
        let settings = Settings::new();
        let waiter = {
            let settings = Arc::clone(&settings);
            thread::spawn(move || settings.wait_for_refresh_period(Duration::from_millis(5_000)))
        };
        settings.set_display_timings(DisplayTimings::from_refresh_rate(60));
        assert_eq!(waiter.join().unwrap(), Some(Duration(16_666_666)));
    }

    #[test]
    fn wait_for_refresh_period_times_out() {
        let settings = Settings::new();
        assert_eq!(
            settings.wait_for_refresh_period(Duration::from_millis(5)),
            None
        );
    }
}
