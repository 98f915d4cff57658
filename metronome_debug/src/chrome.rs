// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Chrome Trace Event Format exporter.
//!
//! [`export`] reads recorded bytes from a [`RecorderTracer`](super::recorder::RecorderTracer)
//! and writes [Chrome Trace Event Format][format] JSON to the given writer.
//!
//! Each frame becomes a `Frame` slice from start to post-swap, with the
//! pre-swap wait as a nested `Wait` slice and the present as a `Swap` slice.
//! Swap interval changes are global instant events.
//!
//! [format]: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU

use std::io::{self, Write};

use serde_json::{Value, json};

use metronome_core::time::HostTime;

use crate::recorder::{RecordedEvent, decode};

/// Exports recorded events as Chrome Trace Event Format JSON.
///
/// The output is a complete JSON array of trace event objects, suitable for
/// loading into `chrome://tracing` or [Perfetto](https://ui.perfetto.dev/).
pub fn export(bytes: &[u8], writer: &mut dyn Write) -> io::Result<()> {
    let mut events: Vec<Value> = Vec::new();

    for recorded in decode(bytes) {
        match recorded {
            RecordedEvent::StartFrame(e) => {
                events.push(json!({
                    "ph": "B",
                    "name": "Frame",
                    "cat": "Frame",
                    "ts": to_us(e.timestamp),
                    "pid": 0,
                    "tid": 0,
                    "args": {
                        "frame_index": e.frame_index,
                        "target_vsync": e.target_vsync,
                        "desired_present_us": e.desired_present.map(to_us),
                    }
                }));
            }
            RecordedEvent::PreWait(e) => {
                events.push(json!({
                    "ph": "B",
                    "name": "Wait",
                    "cat": "Pacing",
                    "ts": to_us(e.timestamp),
                    "pid": 0,
                    "tid": 0,
                    "args": {
                        "frame_index": e.frame_index,
                    }
                }));
            }
            RecordedEvent::PostWait(e) => {
                events.push(json!({
                    "ph": "E",
                    "name": "Wait",
                    "cat": "Pacing",
                    "ts": to_us(e.timestamp),
                    "pid": 0,
                    "tid": 0,
                    "args": {
                        "frame_index": e.frame_index,
                        "cpu_us": e.cpu_time.nanos() as f64 / 1000.0,
                        "gpu_us": e.gpu_time.nanos() as f64 / 1000.0,
                        "late_frames": e.late_frames,
                    }
                }));
            }
            RecordedEvent::PreSwap(e) => {
                events.push(json!({
                    "ph": "B",
                    "name": "Swap",
                    "cat": "Frame",
                    "ts": to_us(e.timestamp),
                    "pid": 0,
                    "tid": 0,
                    "args": {
                        "frame_index": e.frame_index,
                    }
                }));
            }
            RecordedEvent::PostSwap(e) => {
                let args = json!({
                    "frame_index": e.frame_index,
                    "desired_present_us": e.desired_present.map(to_us),
                });
                events.push(json!({
                    "ph": "E",
                    "name": "Swap",
                    "cat": "Frame",
                    "ts": to_us(e.timestamp),
                    "pid": 0,
                    "tid": 0,
                    "args": args.clone(),
                }));
                events.push(json!({
                    "ph": "E",
                    "name": "Frame",
                    "cat": "Frame",
                    "ts": to_us(e.timestamp),
                    "pid": 0,
                    "tid": 0,
                    "args": args,
                }));
            }
            RecordedEvent::SwapIntervalChanged(e) => {
                events.push(json!({
                    "ph": "i",
                    "name": "SwapIntervalChanged",
                    "cat": "Pacing",
                    "ts": to_us(e.timestamp),
                    "pid": 0,
                    "tid": 0,
                    "s": "g",
                    "args": {
                        "frame_index": e.frame_index,
                        "old_interval": e.old_interval,
                        "new_interval": e.new_interval,
                        "pipelined": e.pipelined,
                    }
                }));
            }
        }
    }

    log::debug!("exporting {} chrome trace events", events.len());
    serde_json::to_writer_pretty(writer, &events)?;
    Ok(())
}

fn to_us(t: HostTime) -> f64 {
    t.nanos() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use metronome_core::time::Duration;
    use metronome_core::trace::{
        PacingTracer, PostSwapEvent, PostWaitEvent, PreSwapEvent, PreWaitEvent, StartFrameEvent,
        SwapIntervalChangedEvent,
    };

    use super::*;
    use crate::recorder::RecorderTracer;

    #[test]
    fn export_produces_valid_json() {
        let rec = RecorderTracer::new();
        rec.on_start_frame(&StartFrameEvent {
            frame_index: 0,
            timestamp: HostTime(1_000_000),
            target_vsync: 1,
            desired_present: None,
        });
        rec.on_pre_wait(&PreWaitEvent {
            frame_index: 0,
            timestamp: HostTime(5_000_000),
        });
        rec.on_post_wait(&PostWaitEvent {
            frame_index: 0,
            timestamp: HostTime(16_000_000),
            cpu_time: Duration::from_millis(4),
            gpu_time: Duration::ZERO,
            late_frames: 0,
        });
        rec.on_pre_swap_buffers(&PreSwapEvent {
            frame_index: 0,
            timestamp: HostTime(16_000_000),
        });
        rec.on_post_swap_buffers(&PostSwapEvent {
            frame_index: 0,
            timestamp: HostTime(16_100_000),
            desired_present: Some(HostTime(16_666_667)),
        });

        let mut out = Vec::new();
        export(&rec.into_bytes(), &mut out).unwrap();
        let json_str = String::from_utf8(out).unwrap();

        let parsed: Vec<Value> = serde_json::from_str(&json_str).unwrap();
        let phases: Vec<_> = parsed
            .iter()
            .map(|e| (e["ph"].as_str().unwrap(), e["name"].as_str().unwrap()))
            .collect();
        assert_eq!(
            phases,
            [
                ("B", "Frame"),
                ("B", "Wait"),
                ("E", "Wait"),
                ("B", "Swap"),
                ("E", "Swap"),
                ("E", "Frame"),
            ]
        );
        assert_eq!(parsed[0]["ts"], 1000.0);
        assert_eq!(parsed[2]["args"]["cpu_us"], 4000.0);
        assert_eq!(parsed[4]["args"]["desired_present_us"], 16_666.667);
    }

    #[test]
    fn interval_change_is_global_instant() {
        let rec = RecorderTracer::new();
        rec.on_swap_interval_changed(&SwapIntervalChangedEvent {
            frame_index: 12,
            timestamp: HostTime(2_000),
            old_interval: 1,
            new_interval: 3,
            pipelined: false,
        });

        let mut out = Vec::new();
        export(&rec.into_bytes(), &mut out).unwrap();
        let parsed: Vec<Value> = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["ph"], "i");
        assert_eq!(parsed[0]["s"], "g");
        assert_eq!(parsed[0]["args"]["new_interval"], 3);
    }

    #[test]
    fn export_empty_recording() {
        let mut out = Vec::new();
        export(&[], &mut out).unwrap();
        let parsed: Vec<Value> = serde_json::from_slice(&out).unwrap();
        assert!(parsed.is_empty());
    }
}
