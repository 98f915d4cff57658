// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Frame pacing for hosts that present through a compositor.
//!
//! `metronome_core` decides when each frame is presented and how many vsync
//! periods apart consecutive presents land, from the display's refresh
//! timings and the measured CPU and GPU cost of recent frames.
//!
//! # Architecture
//!
//! The crate is organized around a frame loop that turns vsync signals and
//! GPU completion into present decisions:
//!
//! ```text
//!   VsyncPlatform ──► ChoreographerSource ──► Pacer::on_choreographer
//!                                                   │
//!                 ┌─────────────────────────────────┘
//!                 ▼
//!   Pacer::on_pre_swap ──► present(desired time) ──► Pacer::on_post_swap
//!          ▲                       │                        │
//!          │                       ▼                        ▼
//!   FenceProbe ◄──────── reset_sync_fence        FrameTimeModel ──► swap interval
//! ```
//!
//! **[`settings`]**: Display timings and host options, shared by every
//! component, with change listeners.
//!
//! **[`choreographer`]**: Vsync delivery. Probes the platform's native and
//! managed APIs and falls back to a timer thread on a refresh-period grid.
//!
//! **[`fence`]**: GPU completion tracking with a dedicated fence waiter
//! thread.
//!
//! **[`stats`]**: Compositor timestamp collection, frame latency and
//! presentation histograms.
//!
//! **[`model`]**: Windowed worst case and smoothed average of frame cost.
//!
//! **[`pacer`]**: The pacing core: swap interval policy, pipelining, the
//! blocking pre-swap wait and buffer-stuffing recovery.
//!
//! **[`trace`]**: [`PacingTracer`](trace::PacingTracer) hooks for frame
//! instrumentation.
//!
//! **[`context`]**: [`PacingContext`](context::PacingContext), which wires
//! it all together, and the process-wide [`global`](context::global) entry
//! points.
//!
//! **[`time`]**: Integer-nanosecond host time and injectable clocks.
//!
//! # Crate features
//!
//! - `serde` (disabled by default): Derives `Serialize`/`Deserialize` for
//!   configuration, display timings and statistics.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod affinity;
pub mod choreographer;
pub mod context;
pub mod error;
pub mod fence;
pub mod model;
pub mod pacer;
mod queue;
pub mod settings;
pub mod stats;
pub mod time;
pub mod trace;

pub use context::{ContextConfig, PacingContext};
pub use error::PacingError;
pub use pacer::{Pacer, PacerConfig};
