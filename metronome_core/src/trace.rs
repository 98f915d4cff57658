// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observation hooks for the pacing core.
//!
//! This module provides a [`PacingTracer`] trait with one method per pacing
//! event. All method bodies default to no-ops, so implementing only the events
//! you care about is fine.
//!
//! Tracers are registered on a [`Pacer`](crate::pacer::Pacer) as
//! `Arc<dyn PacingTracer>` and removed by identity. They are invoked in
//! registration order, on the thread that drives the event, with no pacing
//! lock held. A tracer that panics is logged and skipped; the remaining
//! tracers still see the event and the frame proceeds.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::time::{Duration, HostTime};

// ---------------------------------------------------------------------------
// Event structs
// ---------------------------------------------------------------------------

/// Emitted when the pacing core begins a new frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartFrameEvent {
    /// Monotonic frame counter.
    pub frame_index: u64,
    /// Host time at frame start.
    pub timestamp: HostTime,
    /// Vsync count the frame will be presented at.
    pub target_vsync: u64,
    /// Desired presentation time, if the vsync phase is known.
    pub desired_present: Option<HostTime>,
}

/// Emitted at the top of pre-swap, before any blocking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreWaitEvent {
    /// Frame counter.
    pub frame_index: u64,
    /// Host time before waiting.
    pub timestamp: HostTime,
}

/// Emitted once pre-swap has finished waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostWaitEvent {
    /// Frame counter.
    pub frame_index: u64,
    /// Host time after waiting.
    pub timestamp: HostTime,
    /// CPU time measured for this frame.
    pub cpu_time: Duration,
    /// GPU time reported for the previous frame.
    pub gpu_time: Duration,
    /// Extra refresh periods waited for the previous frame's GPU work.
    pub late_frames: u32,
}

/// Emitted right before the host presents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreSwapEvent {
    /// Frame counter.
    pub frame_index: u64,
    /// Host time before presenting.
    pub timestamp: HostTime,
}

/// Emitted right after the host presented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostSwapEvent {
    /// Frame counter.
    pub frame_index: u64,
    /// Host time after presenting.
    pub timestamp: HostTime,
    /// Presentation time the frame asked for, if any.
    pub desired_present: Option<HostTime>,
}

/// Emitted when the swap interval or pipeline mode changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapIntervalChangedEvent {
    /// Frame counter.
    pub frame_index: u64,
    /// Host time of the decision.
    pub timestamp: HostTime,
    /// Previous interval in refresh periods.
    pub old_interval: u32,
    /// New interval in refresh periods.
    pub new_interval: u32,
    /// Whether pipelining is engaged after the change.
    pub pipelined: bool,
}

// ---------------------------------------------------------------------------
// PacingTracer trait
// ---------------------------------------------------------------------------

/// Receives pacing events.
///
/// All methods have default no-op implementations, so you only need to
/// override the events you care about.
pub trait PacingTracer: Send + Sync {
    /// Called when a frame starts.
    fn on_start_frame(&self, e: &StartFrameEvent) {
        _ = e;
    }

    /// Called before pre-swap waits.
    fn on_pre_wait(&self, e: &PreWaitEvent) {
        _ = e;
    }

    /// Called after pre-swap waits.
    fn on_post_wait(&self, e: &PostWaitEvent) {
        _ = e;
    }

    /// Called right before presenting.
    fn on_pre_swap_buffers(&self, e: &PreSwapEvent) {
        _ = e;
    }

    /// Called right after presenting.
    fn on_post_swap_buffers(&self, e: &PostSwapEvent) {
        _ = e;
    }

    /// Called when the swap interval or pipeline mode changes.
    fn on_swap_interval_changed(&self, e: &SwapIntervalChangedEvent) {
        _ = e;
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Ordered set of tracers with panic isolation.
#[derive(Default)]
pub(crate) struct TracerRegistry {
    tracers: Mutex<Vec<Arc<dyn PacingTracer>>>,
}

impl core::fmt::Debug for TracerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TracerRegistry")
            .field("tracers", &self.lock().len())
            .finish()
    }
}

impl TracerRegistry {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn PacingTracer>>> {
        self.tracers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, tracer: Arc<dyn PacingTracer>) {
        self.lock().push(tracer);
    }

    /// Removes the first registration of `tracer`. Returns whether one was
    /// found.
    pub(crate) fn remove(&self, tracer: &Arc<dyn PacingTracer>) -> bool {
        let mut tracers = self.lock();
        match tracers.iter().position(|t| Arc::ptr_eq(t, tracer)) {
            Some(i) => {
                tracers.remove(i);
                true
            }
            None => false,
        }
    }

    /// Invokes `f` on every tracer in registration order.
    pub(crate) fn emit(&self, event: &'static str, f: impl Fn(&dyn PacingTracer)) {
        let tracers = {
            let tracers = self.lock();
            if tracers.is_empty() {
                return;
            }
            tracers.clone()
        };
        for (index, tracer) in tracers.iter().enumerate() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(tracer.as_ref())));
            if result.is_err() {
                log::error!("tracer #{index} panicked in {event}");
            }
        }
    }
}
