// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Simulated render loop paced by a [`PacingContext`].
//!
//! Runs a frame loop on a simulated 60 Hz display whose CPU load spikes for a
//! while in the middle of the run, so the swap interval climbs and then
//! recovers. Events go to a
//! [`PrettyPrintTracer`](metronome_debug::pretty::PrettyPrintTracer) on stdout
//! and a [`RecorderTracer`](metronome_debug::recorder::RecorderTracer), which
//! is exported as a Chrome trace at the end.
//!
//! Usage: `pacing_demo [trace.json]`. Set `RUST_LOG=debug` to see pacing
//! decisions.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use metronome_core::settings::DisplayTimings;
use metronome_core::stats::PacingStats;
use metronome_core::time::{Clock, Duration, HostTime};
use metronome_core::{ContextConfig, PacingContext};
use metronome_debug::pretty::PrettyPrintTracer;
use metronome_debug::recorder::RecorderTracer;
use metronome_sync_harness::{
    Harness, PacingTracker, PlatformSupport, SimulatedCompositor, SimulatedDisplay, SimulatedGpu,
    SimulatedPlatform, SimulatedTimeline, VsyncRoute,
};

const FRAME_COUNT: u64 = 180;
const REFRESH_RATE_HZ: u32 = 60;

/// CPU time for frame `i`: light, then a heavy stretch, then light again.
fn cpu_load(i: u64, period: Duration) -> Duration {
    match i {
        60..120 => period * 9 / 4,
        _ => Duration::from_millis(6),
    }
}

fn main() {
    env_logger::init();
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "pacing_trace.json".to_owned());

    // -- simulated hardware ------------------------------------------------
    let timeline = SimulatedTimeline::new(HostTime(1_000_000_000));
    let platform = SimulatedPlatform::new(PlatformSupport {
        native: true,
        managed: false,
    });
    let timings = DisplayTimings::from_refresh_rate(REFRESH_RATE_HZ);
    let period = timings.refresh_period;
    let display = SimulatedDisplay::new(Arc::clone(&timeline), period, &platform);
    let gpu = SimulatedGpu::new(Arc::clone(&timeline), Some(Duration::from_millis(4)));
    let compositor = SimulatedCompositor::new(Arc::clone(&timeline), period, 2);

    // -- pacing ------------------------------------------------------------
    let clock: Arc<dyn Clock> = timeline.clone();
    let context = PacingContext::with_clock(ContextConfig::from_env(), &platform, gpu, clock)
        .expect("failed to start frame pacing");
    context.set_display_timings(timings);
    context.enable_stats(true);

    let recorder = Arc::new(RecorderTracer::new());
    let _ = context.add_tracer(Arc::new(PrettyPrintTracer::with_writer(std::io::stdout())));
    let _ = context.add_tracer(recorder.clone());

    // -- frame loop --------------------------------------------------------
    let Ok(pacer) = context.pacer() else {
        println!("Frame pacing disabled, nothing to simulate");
        return;
    };
    let harness = Harness::new(pacer, &display, VsyncRoute::Platform);
    let presents = harness.run(|h| {
        (0..FRAME_COUNT)
            .map(|i| {
                context.record_frame_start(&compositor);
                h.advance(cpu_load(i, period));
                context.swap(|_desired| timeline.now())
            })
            .collect::<Vec<HostTime>>()
    });

    // -- summary -----------------------------------------------------------
    let mut tracker = PacingTracker::<32>::default();
    let mut report = None;
    for w in presents.windows(2) {
        let delta = w[1] - w[0];
        let expected = period * delta.periods_ceil(period).max(1);
        report = Some(tracker.observe(delta, expected, period));
    }
    if let Some(report) = report {
        println!(
            "grade {} ({} of {} frames missed), last deltas {}",
            report.grade.as_str(),
            report.missed_frames,
            report.total_frames,
            tracker.sparkline_ascii(0.0, 50.0),
        );
    }
    if let Some(stats) = context.stats() {
        print_stats(&stats);
    }

    // -- export Chrome trace -----------------------------------------------
    let file = File::create(&path).expect("failed to create trace file");
    let mut writer = BufWriter::new(file);
    metronome_debug::chrome::export(&recorder.snapshot(), &mut writer)
        .expect("failed to write Chrome trace");

    println!("Wrote {path} ({FRAME_COUNT} frames)");
}

fn print_stats(stats: &PacingStats) {
    println!("{} frames with compositor timestamps", stats.total_frames);
    let rows = [
        ("latency", &stats.latency_frames),
        ("late", &stats.late_frames),
        ("idle", &stats.idle_frames),
        ("offset", &stats.offset_from_previous_frame),
    ];
    for (name, histogram) in rows {
        let buckets: Vec<String> = histogram.iter().map(u64::to_string).collect();
        println!("{name:>8}: [{}]", buckets.join(" "));
    }
}
