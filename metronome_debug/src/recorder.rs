// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Compact binary event recording and decoding.
//!
//! [`RecorderTracer`] implements [`PacingTracer`] and encodes events into a
//! `Vec<u8>` as fixed-size little-endian records. [`decode`] reads them back
//! as an iterator of [`RecordedEvent`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use metronome_core::time::{Duration, HostTime};
use metronome_core::trace::{
    PacingTracer, PostSwapEvent, PostWaitEvent, PreSwapEvent, PreWaitEvent, StartFrameEvent,
    SwapIntervalChangedEvent,
};

// ---------------------------------------------------------------------------
// Event type discriminants
// ---------------------------------------------------------------------------

const TAG_START_FRAME: u8 = 1;
const TAG_PRE_WAIT: u8 = 2;
const TAG_POST_WAIT: u8 = 3;
const TAG_PRE_SWAP: u8 = 4;
const TAG_POST_SWAP: u8 = 5;
const TAG_SWAP_INTERVAL: u8 = 6;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Writer<'a>(MutexGuard<'a, Vec<u8>>);

impl Writer<'_> {
    fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn time(&mut self, t: HostTime) -> &mut Self {
        self.u64(t.nanos())
    }

    fn option_time(&mut self, t: Option<HostTime>) -> &mut Self {
        match t {
            Some(t) => self.u8(1).time(t),
            None => self.u8(0).u64(0),
        }
    }
}

/// A [`PacingTracer`] that encodes events into a compact binary buffer.
///
/// Events from every thread land in one buffer, in the order they were
/// emitted.
#[derive(Debug, Default)]
pub struct RecorderTracer {
    buf: Mutex<Vec<u8>>,
}

impl RecorderTracer {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the bytes recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().0.clone()
    }

    /// Consumes the recorder and returns the recorded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> Writer<'_> {
        Writer(self.buf.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl PacingTracer for RecorderTracer {
    fn on_start_frame(&self, e: &StartFrameEvent) {
        self.lock()
            .u8(TAG_START_FRAME)
            .u64(e.frame_index)
            .time(e.timestamp)
            .u64(e.target_vsync)
            .option_time(e.desired_present);
    }

    fn on_pre_wait(&self, e: &PreWaitEvent) {
        self.lock()
            .u8(TAG_PRE_WAIT)
            .u64(e.frame_index)
            .time(e.timestamp);
    }

    fn on_post_wait(&self, e: &PostWaitEvent) {
        self.lock()
            .u8(TAG_POST_WAIT)
            .u64(e.frame_index)
            .time(e.timestamp)
            .u64(e.cpu_time.nanos())
            .u64(e.gpu_time.nanos())
            .u32(e.late_frames);
    }

    fn on_pre_swap_buffers(&self, e: &PreSwapEvent) {
        self.lock()
            .u8(TAG_PRE_SWAP)
            .u64(e.frame_index)
            .time(e.timestamp);
    }

    fn on_post_swap_buffers(&self, e: &PostSwapEvent) {
        self.lock()
            .u8(TAG_POST_SWAP)
            .u64(e.frame_index)
            .time(e.timestamp)
            .option_time(e.desired_present);
    }

    fn on_swap_interval_changed(&self, e: &SwapIntervalChangedEvent) {
        self.lock()
            .u8(TAG_SWAP_INTERVAL)
            .u64(e.frame_index)
            .time(e.timestamp)
            .u32(e.old_interval)
            .u32(e.new_interval)
            .u8(u8::from(e.pipelined));
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// A decoded event from a binary recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordedEvent {
    /// A [`StartFrameEvent`].
    StartFrame(StartFrameEvent),
    /// A [`PreWaitEvent`].
    PreWait(PreWaitEvent),
    /// A [`PostWaitEvent`].
    PostWait(PostWaitEvent),
    /// A [`PreSwapEvent`].
    PreSwap(PreSwapEvent),
    /// A [`PostSwapEvent`].
    PostSwap(PostSwapEvent),
    /// A [`SwapIntervalChangedEvent`].
    SwapIntervalChanged(SwapIntervalChangedEvent),
}

impl RecordedEvent {
    /// Frame counter of the event.
    #[must_use]
    pub fn frame_index(&self) -> u64 {
        match self {
            Self::StartFrame(e) => e.frame_index,
            Self::PreWait(e) => e.frame_index,
            Self::PostWait(e) => e.frame_index,
            Self::PreSwap(e) => e.frame_index,
            Self::PostSwap(e) => e.frame_index,
            Self::SwapIntervalChanged(e) => e.frame_index,
        }
    }
}

/// Decodes a byte slice produced by [`RecorderTracer`] into an iterator of
/// [`RecordedEvent`].
///
/// Iteration stops at the first unknown tag or truncated record.
pub fn decode(bytes: &[u8]) -> DecodeIter<'_> {
    DecodeIter { data: bytes }
}

/// Iterator over decoded events.
#[derive(Debug)]
pub struct DecodeIter<'a> {
    data: &'a [u8],
}

impl DecodeIter<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let (head, rest) = self.data.split_first_chunk::<N>()?;
        self.data = rest;
        Some(*head)
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[v]| v)
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    fn read_u64(&mut self) -> Option<u64> {
        self.take().map(u64::from_le_bytes)
    }

    fn read_time(&mut self) -> Option<HostTime> {
        self.read_u64().map(HostTime)
    }

    fn read_duration(&mut self) -> Option<Duration> {
        self.read_u64().map(Duration)
    }

    fn read_option_time(&mut self) -> Option<Option<HostTime>> {
        let present = self.read_u8()?;
        let t = self.read_time()?;
        Some((present != 0).then_some(t))
    }

    fn decode_start_frame(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::StartFrame(StartFrameEvent {
            frame_index: self.read_u64()?,
            timestamp: self.read_time()?,
            target_vsync: self.read_u64()?,
            desired_present: self.read_option_time()?,
        }))
    }

    fn decode_pre_wait(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::PreWait(PreWaitEvent {
            frame_index: self.read_u64()?,
            timestamp: self.read_time()?,
        }))
    }

    fn decode_post_wait(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::PostWait(PostWaitEvent {
            frame_index: self.read_u64()?,
            timestamp: self.read_time()?,
            cpu_time: self.read_duration()?,
            gpu_time: self.read_duration()?,
            late_frames: self.read_u32()?,
        }))
    }

    fn decode_pre_swap(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::PreSwap(PreSwapEvent {
            frame_index: self.read_u64()?,
            timestamp: self.read_time()?,
        }))
    }

    fn decode_post_swap(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::PostSwap(PostSwapEvent {
            frame_index: self.read_u64()?,
            timestamp: self.read_time()?,
            desired_present: self.read_option_time()?,
        }))
    }

    fn decode_swap_interval(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::SwapIntervalChanged(SwapIntervalChangedEvent {
            frame_index: self.read_u64()?,
            timestamp: self.read_time()?,
            old_interval: self.read_u32()?,
            new_interval: self.read_u32()?,
            pipelined: self.read_u8()? != 0,
        }))
    }
}

impl Iterator for DecodeIter<'_> {
    type Item = RecordedEvent;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_u8()? {
            TAG_START_FRAME => self.decode_start_frame(),
            TAG_PRE_WAIT => self.decode_pre_wait(),
            TAG_POST_WAIT => self.decode_post_wait(),
            TAG_PRE_SWAP => self.decode_pre_swap(),
            TAG_POST_SWAP => self.decode_post_swap(),
            TAG_SWAP_INTERVAL => self.decode_swap_interval(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
