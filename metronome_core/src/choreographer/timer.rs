// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Steady-clock fallback for platforms without a vsync API.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::affinity;
use crate::error::PacingError;
use crate::settings::{ListenerId, Settings};
use crate::time::{Duration, HostTime, MonotonicClock};

use super::{DEFAULT_REFRESH_PERIOD, REFRESH_WAIT_TIMEOUT, VsyncHandle};

const THREAD_NAME: &str = "metronome-choreographer";

#[derive(Debug, Default)]
struct TimerState {
    armed: bool,
    stop: bool,
}

#[derive(Debug, Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Thread that fakes vsync on a grid of refresh periods.
#[derive(Debug)]
pub(super) struct TimerThread {
    shared: Arc<TimerShared>,
    settings: Arc<Settings>,
    listener: ListenerId,
    thread: Option<JoinHandle<()>>,
}

impl TimerThread {
    pub(super) fn spawn(settings: Arc<Settings>, handle: VsyncHandle) -> Result<Self, PacingError> {
        let shared = Arc::new(TimerShared::default());
        // Wakes the startup wait when display timings arrive.
        let listener = {
            let shared = Arc::downgrade(&shared);
            settings.add_listener(move || {
                if let Some(shared) = shared.upgrade() {
                    drop(shared.lock());
                    shared.wake.notify_all();
                }
            })
        };
        let worker = Arc::clone(&shared);
        let worker_settings = Arc::clone(&settings);
        let thread = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || run(&worker, &worker_settings, &handle));
        let thread = match thread {
            Ok(thread) => thread,
            Err(source) => {
                settings.remove_listener(listener);
                return Err(PacingError::Spawn {
                    name: THREAD_NAME,
                    source,
                });
            }
        };
        Ok(Self {
            shared,
            settings,
            listener,
            thread: Some(thread),
        })
    }

    /// Requests one tick at the next grid point.
    pub(super) fn arm(&self) {
        self.shared.lock().armed = true;
        self.shared.wake.notify_one();
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.settings.remove_listener(self.listener);
        self.shared.lock().stop = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("{THREAD_NAME} thread panicked");
        }
    }
}

/// First grid point strictly after `now`, with the grid anchored at
/// `offset` and spaced by `period`.
fn next_grid_point(now: HostTime, period: Duration, offset: Duration) -> HostTime {
    let since_anchor = now.saturating_sub(offset).saturating_duration_since(HostTime::ZERO);
    let ticks = since_anchor.periods_floor(period) + 1;
    HostTime(offset.nanos()).saturating_add(period.saturating_mul(ticks))
}

fn run(shared: &TimerShared, settings: &Settings, handle: &VsyncHandle) {
    affinity::pin_current_thread(settings, THREAD_NAME);

    {
        let (state, _) = shared
            .wake
            .wait_timeout_while(shared.lock(), REFRESH_WAIT_TIMEOUT.to_std(), |s| {
                !s.stop && !settings.display_timings().is_known()
            })
            .unwrap_or_else(PoisonError::into_inner);
        if state.stop {
            log::debug!("{THREAD_NAME} stopped before display timings arrived");
            return;
        }
    }
    if !settings.display_timings().is_known() {
        log::warn!("no refresh period reported, assuming {DEFAULT_REFRESH_PERIOD}");
    }

    loop {
        {
            let mut state = shared
                .wake
                .wait_while(shared.lock(), |s| !s.armed && !s.stop)
                .unwrap_or_else(PoisonError::into_inner);
            if state.stop {
                break;
            }
            state.armed = false;
        }

        let timings = settings.display_timings();
        let period = if timings.is_known() {
            timings.refresh_period
        } else {
            DEFAULT_REFRESH_PERIOD
        };
        let now = MonotonicClock::now();
        let target = next_grid_point(now, period, timings.app_offset);

        {
            let (state, _) = shared
                .wake
                .wait_timeout_while(shared.lock(), (target - now).to_std(), |s| !s.stop)
                .unwrap_or_else(PoisonError::into_inner);
            if state.stop {
                break;
            }
        }

        if !handle.is_alive() {
            break;
        }
        handle.on_vsync(target);
    }
    log::debug!("{THREAD_NAME} exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_point_is_strictly_after_now() {
        let period = Duration(10);
        assert_eq!(next_grid_point(HostTime(0), period, Duration::ZERO), HostTime(10));
        assert_eq!(next_grid_point(HostTime(9), period, Duration::ZERO), HostTime(10));
        assert_eq!(next_grid_point(HostTime(10), period, Duration::ZERO), HostTime(20));
    }

    #[test]
    fn grid_honors_offset() {
        let period = Duration(10);
        assert_eq!(next_grid_point(HostTime(14), period, Duration(3)), HostTime(23));
        assert_eq!(next_grid_point(HostTime(1), period, Duration(3)), HostTime(13));
    }
}
