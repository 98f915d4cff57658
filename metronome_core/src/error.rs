// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types surfaced to the host.
//!
//! Only initialization and lifecycle failures reach the caller. Everything
//! that can go wrong per frame (a missing timestamp, a timed-out fence, an
//! overflowing queue) is absorbed where it happens and logged.

use std::io;

use thiserror::Error;

/// Lifecycle errors returned by [`PacingContext`](crate::context::PacingContext)
/// construction and the [`global`](crate::context::global) entry points.
#[derive(Debug, Error)]
pub enum PacingError {
    /// A process-wide context already exists.
    #[error("frame pacing is already initialized")]
    AlreadyInitialized,
    /// No process-wide context exists yet, or it was destroyed.
    #[error("frame pacing is not initialized")]
    NotInitialized,
    /// Pacing was disabled by configuration; presents pass straight through.
    #[error("frame pacing is disabled")]
    Disabled,
    /// A pacing worker thread could not be started.
    #[error("failed to spawn thread `{name}`")]
    Spawn {
        /// Name of the thread.
        name: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// Why a platform capability could not be resolved during probing.
///
/// Probe failures are permanent for the lifetime of the component that
/// probed: the next strategy is used and the failed one is never retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// A required platform entry point is missing.
    #[error("missing platform entry point `{0}`")]
    MissingEntryPoint(&'static str),
    /// The platform does not offer this strategy at all.
    #[error("strategy not supported on this platform")]
    Unsupported,
}
