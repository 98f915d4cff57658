// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Human-readable trace output.
//!
//! [`PrettyPrintTracer`] implements [`PacingTracer`] and writes one line per
//! event to a [`Write`] destination (default: stderr). Timestamps are printed
//! in microseconds, durations in milliseconds.

use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use metronome_core::time::HostTime;
use metronome_core::trace::{
    PacingTracer, PostSwapEvent, PostWaitEvent, PreSwapEvent, PreWaitEvent, StartFrameEvent,
    SwapIntervalChangedEvent,
};

/// Writes human-readable trace lines to a [`Write`] destination.
pub struct PrettyPrintTracer<W: Write + Send = Box<dyn Write + Send>> {
    writer: Mutex<W>,
}

impl<W: Write + Send> std::fmt::Debug for PrettyPrintTracer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrettyPrintTracer").finish_non_exhaustive()
    }
}

impl PrettyPrintTracer {
    /// Creates a tracer that writes to stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self::with_writer(Box::new(std::io::stderr()))
    }
}

impl<W: Write + Send> PrettyPrintTracer<W> {
    /// Creates a tracer that writes to the given destination.
    #[must_use]
    pub fn with_writer(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consumes the tracer and returns the writer.
    pub fn into_writer(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, W> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn us(t: HostTime) -> f64 {
    t.nanos() as f64 / 1000.0
}

fn opt_us(t: Option<HostTime>) -> String {
    t.map_or_else(|| "-".to_owned(), |t| format!("{:.1}µs", us(t)))
}

impl<W: Write + Send> PacingTracer for PrettyPrintTracer<W> {
    fn on_start_frame(&self, e: &StartFrameEvent) {
        let _ = writeln!(
            self.writer(),
            "[start] frame={} at {:.1}µs target_vsync={} present={}",
            e.frame_index,
            us(e.timestamp),
            e.target_vsync,
            opt_us(e.desired_present),
        );
    }

    fn on_pre_wait(&self, e: &PreWaitEvent) {
        let _ = writeln!(
            self.writer(),
            "[wait:begin] frame={} at {:.1}µs",
            e.frame_index,
            us(e.timestamp),
        );
    }

    fn on_post_wait(&self, e: &PostWaitEvent) {
        let late = if e.late_frames > 0 { "LATE" } else { "ok" };
        let _ = writeln!(
            self.writer(),
            "[wait:end] frame={} at {:.1}µs cpu={} gpu={} late_frames={} ({late})",
            e.frame_index,
            us(e.timestamp),
            e.cpu_time,
            e.gpu_time,
            e.late_frames,
        );
    }

    fn on_pre_swap_buffers(&self, e: &PreSwapEvent) {
        let _ = writeln!(
            self.writer(),
            "[swap:begin] frame={} at {:.1}µs",
            e.frame_index,
            us(e.timestamp),
        );
    }

    fn on_post_swap_buffers(&self, e: &PostSwapEvent) {
        let _ = writeln!(
            self.writer(),
            "[swap:end] frame={} at {:.1}µs desired={}",
            e.frame_index,
            us(e.timestamp),
            opt_us(e.desired_present),
        );
    }

    fn on_swap_interval_changed(&self, e: &SwapIntervalChangedEvent) {
        let _ = writeln!(
            self.writer(),
            "[interval] frame={} {} -> {} pipelined={}",
            e.frame_index,
            e.old_interval,
            e.new_interval,
            e.pipelined,
        );
    }
}

#[cfg(test)]
mod tests {
    use metronome_core::time::Duration;

    use super::*;

    fn output(f: impl FnOnce(&PrettyPrintTracer<Vec<u8>>)) -> String {
        let tracer = PrettyPrintTracer::with_writer(Vec::new());
        f(&tracer);
        String::from_utf8(tracer.into_writer()).unwrap()
    }

    #[test]
    fn start_frame_line() {
        let out = output(|t| {
            t.on_start_frame(&StartFrameEvent {
                frame_index: 3,
                timestamp: HostTime(2_000),
                target_vsync: 12,
                desired_present: None,
            });
        });
        assert_eq!(out, "[start] frame=3 at 2.0µs target_vsync=12 present=-\n");
    }

    #[test]
    fn late_wait_is_flagged() {
        let out = output(|t| {
            t.on_post_wait(&PostWaitEvent {
                frame_index: 9,
                timestamp: HostTime(1_500),
                cpu_time: Duration::from_millis(4),
                gpu_time: Duration::from_micros(2_500),
                late_frames: 1,
            });
        });
        assert!(out.contains("cpu=4.000ms"), "{out}");
        assert!(out.contains("gpu=2.500ms"), "{out}");
        assert!(out.ends_with("(LATE)\n"), "{out}");
    }

    #[test]
    fn interval_change_line() {
        let out = output(|t| {
            t.on_swap_interval_changed(&SwapIntervalChangedEvent {
                frame_index: 40,
                timestamp: HostTime(0),
                old_interval: 1,
                new_interval: 2,
                pipelined: false,
            });
        });
        assert_eq!(out, "[interval] frame=40 1 -> 2 pipelined=false\n");
    }
}
