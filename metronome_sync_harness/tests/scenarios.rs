// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end pacing scenarios on simulated hardware.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use metronome_core::choreographer::{
    ChoreographerRequest, ChoreographerSource, NoPlatform, Strategy,
};
use metronome_core::fence::FenceProbe;
use metronome_core::settings::{DisplayTimings, Settings};
use metronome_core::time::{Clock, Duration, HostTime, MonotonicClock};
use metronome_core::trace::{PacingTracer, StartFrameEvent};
use metronome_core::{ContextConfig, Pacer, PacerConfig, PacingContext};
use metronome_debug::recorder::{RecordedEvent, RecorderTracer, decode};
use metronome_sync_harness::{
    FixedHandlers, Harness, PacingGrade, PacingTracker, PlatformSupport, PresentRecord,
    SimulatedDisplay, SimulatedGpu, SimulatedPlatform, SimulatedTimeline, VsyncRoute,
};

const START: HostTime = HostTime(1_000_000_000);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Setup {
    timeline: Arc<SimulatedTimeline>,
    platform: SimulatedPlatform,
    display: SimulatedDisplay,
    settings: Arc<Settings>,
    timings: DisplayTimings,
}

impl Setup {
    fn new(hz: u32, support: PlatformSupport) -> Self {
        init_logging();
        let timeline = SimulatedTimeline::new(START);
        let platform = SimulatedPlatform::new(support);
        let timings = DisplayTimings::from_refresh_rate(hz);
        let display = SimulatedDisplay::new(Arc::clone(&timeline), timings.refresh_period, &platform);
        let settings = Settings::new();
        settings.set_display_timings(timings);
        Self {
            timeline,
            platform,
            display,
            settings,
            timings,
        }
    }

    fn pacer(&self, config: PacerConfig) -> Pacer {
        let clock: Arc<dyn Clock> = self.timeline.clone();
        Pacer::new(
            config,
            Arc::clone(&self.settings),
            clock,
            &self.platform,
            ChoreographerRequest::Auto,
        )
        .unwrap()
    }

    fn period(&self) -> Duration {
        self.timings.refresh_period
    }
}

fn deltas(records: &[PresentRecord]) -> Vec<Duration> {
    records
        .windows(2)
        .map(|w| w[1].presented_at - w[0].presented_at)
        .collect()
}

#[test]
fn idle_load_presents_every_vsync() {
    let setup = Setup::new(60, PlatformSupport::default());
    let pacer = setup.pacer(PacerConfig {
        auto_swap_interval: false,
        ..PacerConfig::new()
    });
    let harness = Harness::new(&pacer, &setup.display, VsyncRoute::External);
    let handlers = FixedHandlers::idle();

    let records = harness.run_frames(120, &handlers, |_| Duration::ZERO);

    let period = setup.period();
    for (i, record) in records.iter().enumerate() {
        let vsync = i as u64 + 1;
        assert_eq!(record.vsync, vsync, "frame {i}");
        assert_eq!(record.presented_at, START + period * vsync, "frame {i}");
        assert_eq!(record.swap_interval, 1, "frame {i}");
    }

    let mut tracker = PacingTracker::<32>::default();
    let report = deltas(&records)
        .into_iter()
        .map(|d| tracker.observe(d, period, period))
        .last()
        .unwrap();
    assert_eq!(report.missed_frames, 0, "{report:?}");
    assert_eq!(report.grade, PacingGrade::A, "{report:?}");
}

#[test]
fn heavy_cpu_settles_on_three_periods() {
    let setup = Setup::new(60, PlatformSupport::default());
    let pacer = setup.pacer(PacerConfig::new());
    let harness = Harness::new(&pacer, &setup.display, VsyncRoute::External);
    let handlers = FixedHandlers::idle();
    let period = setup.period();

    let records = harness.run_frames(60, &handlers, |_| period * 5 / 2);

    let settled = &records[10..];
    assert!(
        settled.iter().all(|r| r.swap_interval == 3),
        "intervals: {:?}",
        settled.iter().map(|r| r.swap_interval).collect::<Vec<_>>()
    );
    let mut tracker = PacingTracker::<16>::new(50.0);
    for delta in deltas(settled) {
        assert_eq!(delta, period * 3);
        let report = tracker.observe(delta, period * 3, period);
        assert_eq!(report.grade, PacingGrade::A, "{report:?}");
    }
    assert!(!pacer.pipeline_mode(), "serialized cost fits the interval");
}

#[test]
fn deadlines_never_move_backwards() {
    let setup = Setup::new(60, PlatformSupport::default());
    let pacer = setup.pacer(PacerConfig::new());
    let harness = Harness::new(&pacer, &setup.display, VsyncRoute::External);
    let handlers = FixedHandlers::idle();
    let period = setup.period();

    // Alternate light and heavy frames so the interval moves both ways.
    let records = harness.run_frames(80, &handlers, |i| {
        if (i / 20) % 2 == 1 {
            period * 3 / 2
        } else {
            Duration::from_millis(3)
        }
    });

    let deadlines: Vec<HostTime> = records.iter().filter_map(|r| r.deadline).collect();
    assert!(!deadlines.is_empty(), "no deadlines reported");
    assert!(
        deadlines.windows(2).all(|w| w[0] <= w[1]),
        "deadlines: {deadlines:?}"
    );
    let desired: Vec<HostTime> = records.iter().filter_map(|r| r.desired).collect();
    assert!(
        desired.windows(2).all(|w| w[0] < w[1]),
        "desired times: {desired:?}"
    );
}

#[test]
fn native_platform_drives_pacing_and_follows_refresh_changes() {
    let setup = Setup::new(
        60,
        PlatformSupport {
            native: true,
            managed: false,
        },
    );
    let pacer = setup.pacer(PacerConfig::new());
    assert_eq!(pacer.strategy(), Strategy::Native);
    assert!(!pacer.uses_external_choreographer());

    let harness = Harness::new(&pacer, &setup.display, VsyncRoute::Platform);
    let handlers = FixedHandlers::idle();

    let records = harness.run_frames(30, &handlers, |_| Duration::from_millis(2));
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.vsync, i as u64 + 1, "frame {i}");
    }
    assert!(setup.platform.posted_callbacks() >= 30);

    let fast = DisplayTimings::from_refresh_rate(90).refresh_period;
    setup.display.set_period(fast);
    assert_eq!(pacer.refresh_period(), fast);
    assert_eq!(setup.settings.display_timings().refresh_period, fast);

    let records = harness.run_frames(30, &handlers, |_| Duration::from_millis(2));
    for delta in deltas(&records[5..]) {
        assert_eq!(delta, fast);
    }
}

#[test]
fn stalled_gpu_fences_are_abandoned() {
    let setup = Setup::new(
        60,
        PlatformSupport {
            native: true,
            managed: false,
        },
    );
    let gpu = SimulatedGpu::new(Arc::clone(&setup.timeline), None);
    let config = ContextConfig {
        fence_timeout: Duration::from_millis(20),
        ..ContextConfig::new()
    };
    let clock: Arc<dyn Clock> = setup.timeline.clone();
    let context = PacingContext::with_clock(config, &setup.platform, gpu.clone(), clock).unwrap();
    context.set_display_timings(setup.timings);
    let pacer = context.pacer().unwrap();

    let harness = Harness::new(pacer, &setup.display, VsyncRoute::Platform);
    let presented = harness.run(|h| {
        (0..6)
            .map(|_| {
                h.advance(Duration::from_millis(2));
                context.swap(|desired| desired)
            })
            .count()
    });
    assert_eq!(presented, 6);
    assert_eq!(pacer.frame_index(), 7);
    assert!(gpu.destroyed_unsignaled() >= 5, "{gpu:?}");

    drop(context);
    assert_eq!(gpu.live_fences(), 0);
}

#[test]
fn abandoned_fence_reports_frame_complete() {
    init_logging();
    let timeline = SimulatedTimeline::new(START);
    let gpu = SimulatedGpu::new(Arc::clone(&timeline), None);
    let probe = FenceProbe::new(gpu.clone()).unwrap();
    probe.set_fence_timeout(Duration::from_millis(10));

    probe.reset_sync_fence();
    assert!(!probe.last_frame_is_complete());

    let deadline = Instant::now() + std::time::Duration::from_secs(1);
    while probe.abandoned_fences() == 0 && Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    assert_eq!(probe.abandoned_fences(), 1);
    assert!(probe.last_frame_is_complete());
    assert!(probe.fence_pending_time() >= Duration::from_millis(10));
    assert_eq!(gpu.destroyed_unsignaled(), 1);
    assert_eq!(gpu.live_fences(), 0);
}

#[test]
fn timer_fallback_delivers_grid_aligned_vsync() {
    init_logging();
    let settings = Settings::new();
    let timings = DisplayTimings {
        refresh_period: Duration::from_millis(10),
        app_offset: Duration::from_micros(250),
        sf_offset: Duration::ZERO,
    };
    settings.set_display_timings(timings);

    // (vsync timestamp, steady clock at delivery)
    let seen = Arc::new(Mutex::new(Vec::<(HostTime, HostTime)>::new()));
    let source = {
        let seen = Arc::clone(&seen);
        ChoreographerSource::create(
            ChoreographerRequest::Auto,
            &NoPlatform,
            settings,
            move |t| seen.lock().unwrap().push((t, MonotonicClock::now())),
            || {},
        )
        .unwrap()
    };
    assert_eq!(source.strategy(), Strategy::Fallback);
    source.post_frame_callbacks();

    let deadline = Instant::now() + std::time::Duration::from_secs(1);
    while seen.lock().unwrap().len() < 5 && Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    drop(source);

    let seen = seen.lock().unwrap().clone();
    assert!(seen.len() >= 5, "only {} vsyncs delivered", seen.len());
    let period = timings.refresh_period;
    for &(t, delivered) in &seen {
        assert_eq!((t.nanos() - timings.app_offset.nanos()) % period.nanos(), 0, "{t:?}");
        assert!(delivered >= t, "vsync {t:?} delivered early at {delivered:?}");
    }
    for w in seen.windows(2) {
        assert_eq!(w[1].0 - w[0].0, period, "vsyncs {:?} and {:?}", w[0].0, w[1].0);
    }
    let first = seen[0].1;
    let last = seen[seen.len() - 1].1;
    let spacing = (last - first) / (seen.len() as u64 - 1);
    assert!(
        spacing >= period - Duration::from_millis(2),
        "callbacks {spacing} apart, expected about {period}"
    );
}

struct PanickingTracer;

impl PacingTracer for PanickingTracer {
    fn on_start_frame(&self, _: &StartFrameEvent) {
        panic!("tracer failure");
    }
}

#[test]
fn panicking_tracer_does_not_starve_later_tracers() {
    let setup = Setup::new(60, PlatformSupport::default());
    let pacer = setup.pacer(PacerConfig::new());
    let recorder = Arc::new(RecorderTracer::new());
    pacer.add_tracer(Arc::new(PanickingTracer));
    pacer.add_tracer(recorder.clone());

    let harness = Harness::new(&pacer, &setup.display, VsyncRoute::External);
    let handlers = FixedHandlers::idle();
    let records = harness.run_frames(4, &handlers, |_| Duration::from_millis(1));
    assert_eq!(records.len(), 4);

    let bytes = recorder.snapshot();
    let starts: Vec<u64> = decode(&bytes)
        .filter_map(|e| match e {
            RecordedEvent::StartFrame(s) => Some(s.frame_index),
            _ => None,
        })
        .collect();
    assert_eq!(starts, [1, 2, 3, 4, 5]);
    let swaps = decode(&bytes)
        .filter(|e| matches!(e, RecordedEvent::PostSwap(_)))
        .count();
    assert_eq!(swaps, 4);
}
