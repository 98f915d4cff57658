// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Recording, pretty-printing, and Chrome trace export for metronome
//! pacing diagnostics.
//!
//! This crate provides [`PacingTracer`](metronome_core::trace::PacingTracer)
//! implementations for development and post-mortem analysis:
//!
//! - [`pretty::PrettyPrintTracer`]: human-readable one-line-per-event output.
//! - [`recorder::RecorderTracer`]: compact binary recording with
//!   [`recorder::decode`] for playback.
//! - [`chrome::export`]: writes Chrome Trace Event Format JSON from recorded
//!   bytes.

pub mod chrome;
pub mod pretty;
pub mod recorder;
