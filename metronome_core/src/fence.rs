// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! GPU completion tracking through presentation fences.
//!
//! After every present, [`FenceProbe::reset_sync_fence`] swaps in a fresh
//! fence and hands it to a dedicated waiter thread. The waiter blocks on the
//! fence (bounded by the fence timeout) and records how long the GPU took,
//! which the pacing core reads back lock-free as the previous frame's GPU
//! time.
//!
//! Two locks keep the submission path short: the submission lock serializes
//! fence creation and destruction, while the waiter lock guards the fence
//! slot and is never held across a blocking wait.
//!
//! A fence that times out or fails is destroyed by the waiter and counted as
//! abandoned. The slot is then empty, so [`FenceProbe::last_frame_is_complete`]
//! reports `true` and pacing carries on instead of stalling behind a lost
//! GPU signal.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::affinity;
use crate::error::PacingError;
use crate::settings::Settings;
use crate::time::{Duration, MonotonicClock};

/// Fence timeout used until the host sets one.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_millis(50);

const THREAD_NAME: &str = "metronome-fence-waiter";

/// Outcome of a blocking fence wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FenceWait {
    /// The GPU reached the fence.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
    /// The wait itself failed.
    Failed,
}

/// Non-blocking fence state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FenceStatus {
    /// The GPU reached the fence.
    Signaled,
    /// GPU work before the fence is still running.
    Unsignaled,
}

/// Platform synchronization objects.
///
/// Fence handles are plain copyable ids, like the pointers or integers that
/// graphics APIs hand out. A handle is only used between its
/// [`create_fence`](Self::create_fence) and [`destroy`](Self::destroy).
pub trait FenceProvider: Send + Sync + 'static {
    /// Platform fence handle.
    type Fence: Copy + Send + 'static;

    /// Inserts a fence after the work submitted so far.
    ///
    /// Returns `None` if the platform could not create one.
    fn create_fence(&self) -> Option<Self::Fence>;

    /// Blocks until `fence` signals or `timeout` elapses.
    fn client_wait(&self, fence: Self::Fence, timeout: Duration) -> FenceWait;

    /// Polls `fence` without blocking.
    fn status(&self, fence: Self::Fence) -> FenceStatus;

    /// Releases `fence`.
    fn destroy(&self, fence: Self::Fence);
}

/// Object-safe view of a fence probe, for holders that don't care about
/// the provider type.
pub trait PresentationProbe: Send + Sync {
    /// Destroys the previous fence and inserts one for the frame just
    /// submitted.
    fn reset_sync_fence(&self);

    /// Non-blocking: has the previous frame's GPU work finished?
    fn last_frame_is_complete(&self) -> bool;

    /// How long the waiter last blocked on a fence. May lag by one frame.
    fn fence_pending_time(&self) -> Duration;

    /// Sets the waiter's timeout.
    fn set_fence_timeout(&self, timeout: Duration);

    /// Returns the waiter's timeout.
    fn fence_timeout(&self) -> Duration;
}

#[derive(Debug)]
struct Slot<F> {
    fence: Option<F>,
    pending: bool,
    waiting: bool,
    stop: bool,
}

struct Shared<P: FenceProvider> {
    provider: P,
    slot: Mutex<Slot<P::Fence>>,
    fence_created: Condvar,
    wait_done: Condvar,
    pending_time: AtomicU64,
    timeout: AtomicU64,
    abandoned: AtomicU64,
}

impl<P: FenceProvider> Shared<P> {
    fn slot(&self) -> MutexGuard<'_, Slot<P::Fence>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timeout(&self) -> Duration {
        Duration(self.timeout.load(Ordering::Relaxed))
    }
}

/// Tracks GPU completion of presented frames with a waiter thread.
pub struct FenceProbe<P: FenceProvider> {
    shared: Arc<Shared<P>>,
    submit: Mutex<()>,
    thread: Option<JoinHandle<()>>,
}

impl<P: FenceProvider> fmt::Debug for FenceProbe<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceProbe")
            .field("timeout", &self.shared.timeout())
            .field("pending_time", &self.fence_pending_time())
            .field("abandoned", &self.abandoned_fences())
            .finish_non_exhaustive()
    }
}

impl<P: FenceProvider> FenceProbe<P> {
    /// Starts the waiter thread with [`DEFAULT_FENCE_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::Spawn`] if the waiter thread cannot be started.
    pub fn new(provider: P) -> Result<Self, PacingError> {
        Self::spawn(provider, None)
    }

    /// Like [`new`](Self::new), but the waiter thread honors
    /// [`Settings::use_affinity`] when it starts.
    ///
    /// # Errors
    ///
    /// Returns [`PacingError::Spawn`] if the waiter thread cannot be started.
    pub fn with_settings(provider: P, settings: Arc<Settings>) -> Result<Self, PacingError> {
        Self::spawn(provider, Some(settings))
    }

    fn spawn(provider: P, settings: Option<Arc<Settings>>) -> Result<Self, PacingError> {
        let shared = Arc::new(Shared {
            provider,
            slot: Mutex::new(Slot {
                fence: None,
                pending: false,
                waiting: false,
                stop: false,
            }),
            fence_created: Condvar::new(),
            wait_done: Condvar::new(),
            pending_time: AtomicU64::new(0),
            timeout: AtomicU64::new(DEFAULT_FENCE_TIMEOUT.nanos()),
            abandoned: AtomicU64::new(0),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                if let Some(settings) = settings {
                    affinity::pin_current_thread(&settings, THREAD_NAME);
                }
                wait_for_fences(&worker);
            })
            .map_err(|source| PacingError::Spawn {
                name: THREAD_NAME,
                source,
            })?;
        Ok(Self {
            shared,
            submit: Mutex::new(()),
            thread: Some(thread),
        })
    }

    /// The underlying provider.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.shared.provider
    }

    /// Fences destroyed by the waiter after a timeout or failed wait.
    #[must_use]
    pub fn abandoned_fences(&self) -> u64 {
        self.shared.abandoned.load(Ordering::Relaxed)
    }

    /// Destroys the previous fence once the waiter is done with it, then
    /// inserts a new one and wakes the waiter.
    pub fn reset_sync_fence(&self) {
        let _submit = self.submit.lock().unwrap_or_else(PoisonError::into_inner);
        let shared = &self.shared;

        let old = {
            let mut slot = shared
                .wait_done
                .wait_while(shared.slot(), |s| s.waiting)
                .unwrap_or_else(PoisonError::into_inner);
            slot.pending = false;
            slot.fence.take()
        };
        if let Some(old) = old {
            shared.provider.destroy(old);
        }

        let fence = shared.provider.create_fence();
        if fence.is_none() {
            log::warn!("could not create presentation fence");
        }
        let mut slot = shared.slot();
        slot.fence = fence;
        slot.pending = fence.is_some();
        drop(slot);
        shared.fence_created.notify_one();
    }

    /// Returns `true` when no fence exists yet or the GPU signaled it.
    #[must_use]
    pub fn last_frame_is_complete(&self) -> bool {
        let slot = self.shared.slot();
        match slot.fence {
            None => true,
            Some(fence) => self.shared.provider.status(fence) == FenceStatus::Signaled,
        }
    }

    /// Time the waiter spent on the most recent fence.
    #[must_use]
    pub fn fence_pending_time(&self) -> Duration {
        Duration(self.shared.pending_time.load(Ordering::Relaxed))
    }

    /// Sets the waiter timeout, applied from the next fence on.
    pub fn set_fence_timeout(&self, timeout: Duration) {
        self.shared.timeout.store(timeout.nanos(), Ordering::Relaxed);
    }

    /// Returns the waiter timeout.
    #[must_use]
    pub fn fence_timeout(&self) -> Duration {
        self.shared.timeout()
    }
}

impl<P: FenceProvider> Drop for FenceProbe<P> {
    fn drop(&mut self) {
        self.shared.slot().stop = true;
        self.shared.fence_created.notify_all();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("{THREAD_NAME} thread panicked");
        }
        if let Some(fence) = self.shared.slot().fence.take() {
            self.shared.provider.destroy(fence);
        }
    }
}

impl<P: FenceProvider> PresentationProbe for FenceProbe<P> {
    fn reset_sync_fence(&self) {
        Self::reset_sync_fence(self);
    }

    fn last_frame_is_complete(&self) -> bool {
        Self::last_frame_is_complete(self)
    }

    fn fence_pending_time(&self) -> Duration {
        Self::fence_pending_time(self)
    }

    fn set_fence_timeout(&self, timeout: Duration) {
        Self::set_fence_timeout(self, timeout);
    }

    fn fence_timeout(&self) -> Duration {
        Self::fence_timeout(self)
    }
}

fn wait_for_fences<P: FenceProvider>(shared: &Shared<P>) {
    loop {
        let fence = {
            let mut slot = shared
                .fence_created
                .wait_while(shared.slot(), |s| !s.pending && !s.stop)
                .unwrap_or_else(PoisonError::into_inner);
            if slot.stop {
                break;
            }
            slot.pending = false;
            slot.waiting = true;
            slot.fence
        };

        let Some(fence) = fence else {
            shared.slot().waiting = false;
            shared.wait_done.notify_all();
            continue;
        };

        let timeout = shared.timeout();
        let start = MonotonicClock::now();
        let result = shared.provider.client_wait(fence, timeout);
        let elapsed = MonotonicClock::now().saturating_duration_since(start);
        shared.pending_time.store(elapsed.nanos(), Ordering::Relaxed);

        let mut slot = shared.slot();
        slot.waiting = false;
        match result {
            FenceWait::Signaled => {
                log::trace!("fence signaled after {elapsed}");
            }
            FenceWait::TimedOut | FenceWait::Failed => {
                log::warn!("fence wait {result:?} after {elapsed} (timeout {timeout}), abandoning fence");
                if let Some(stale) = slot.fence.take() {
                    shared.provider.destroy(stale);
                }
                shared.abandoned.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(slot);
        shared.wait_done.notify_all();
    }
    log::debug!("{THREAD_NAME} exiting");
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Instant;

    use super::*;

    #[derive(Default)]
    struct Gpu {
        next: AtomicU64,
        live: Mutex<HashSet<u64>>,
        signaled: Mutex<HashSet<u64>>,
        signal_on_create: bool,
    }

    impl FenceProvider for Gpu {
        type Fence = u64;

        fn create_fence(&self) -> Option<u64> {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            self.live.lock().unwrap().insert(id);
            if self.signal_on_create {
                self.signaled.lock().unwrap().insert(id);
            }
            Some(id)
        }

        fn client_wait(&self, fence: u64, timeout: Duration) -> FenceWait {
            if self.signaled.lock().unwrap().contains(&fence) {
                return FenceWait::Signaled;
            }
            thread::sleep(timeout.to_std());
            FenceWait::TimedOut
        }

        fn status(&self, fence: u64) -> FenceStatus {
            if self.signaled.lock().unwrap().contains(&fence) {
                FenceStatus::Signaled
            } else {
                FenceStatus::Unsignaled
            }
        }

        fn destroy(&self, fence: u64) {
            assert!(self.live.lock().unwrap().remove(&fence), "double destroy of {fence}");
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(std::time::Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn complete_before_first_fence() {
        let probe = FenceProbe::new(Gpu::default()).unwrap();
        assert!(probe.last_frame_is_complete());
        assert_eq!(probe.fence_timeout(), DEFAULT_FENCE_TIMEOUT);
    }

    #[test]
    fn signaled_fences_are_recycled() {
        let probe = FenceProbe::new(Gpu {
            signal_on_create: true,
            ..Gpu::default()
        })
        .unwrap();
        for _ in 0..5 {
            probe.reset_sync_fence();
            assert!(probe.last_frame_is_complete());
        }
        assert_eq!(probe.abandoned_fences(), 0);
        assert_eq!(probe.provider().live.lock().unwrap().len(), 1, "only the newest fence is live");
        drop(probe);
    }

    #[test]
    fn stalled_fence_is_abandoned() {
        let probe = FenceProbe::new(Gpu::default()).unwrap();
        probe.set_fence_timeout(Duration::from_millis(100));
        probe.reset_sync_fence();
        assert!(!probe.last_frame_is_complete(), "fresh fence is unsignaled");

        assert!(
            wait_until(|| probe.last_frame_is_complete()),
            "waiter never gave up on the fence"
        );
        assert_eq!(probe.abandoned_fences(), 1);
        assert!(probe.fence_pending_time() >= Duration::from_millis(100));
        assert!(probe.provider().live.lock().unwrap().is_empty());
    }

    #[test]
    fn drop_releases_outstanding_fence() {
        let probe = FenceProbe::new(Gpu {
            signal_on_create: true,
            ..Gpu::default()
        })
        .unwrap();
        probe.reset_sync_fence();
        let shared = Arc::clone(&probe.shared);
        drop(probe);
        assert!(shared.provider.live.lock().unwrap().is_empty());
    }
}
