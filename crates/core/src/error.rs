// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for FrameFlow.
//!
//! The scheduler communicates a handful of distinct outcomes to its tasks;
//! most of them are control-flow signals rather than failures. They are all
//! carried in one enum so they travel cleanly through `?`, and the helpers
//! at the bottom encode the "EOF is success at task scope" policy used when
//! task exit statuses are merged.

use thiserror::Error;

/// Main error type for FrameFlow operations.
///
/// The first three variants are control-flow signals: `Eof` is the natural
/// end of a stream or queue, `Exit` means the scheduler is terminating and
/// the task should wind down, `Again` means no data is available yet.
/// Everything else is a real failure.
#[derive(Debug, Error)]
pub enum FrameFlowError {
    /// Natural end of stream for the edge or queue in question.
    #[error("end of stream")]
    Eof,

    /// The scheduler is terminating; the task should wind down immediately.
    #[error("scheduler is terminating")]
    Exit,

    /// No data available yet, try again.
    ///
    /// Only surfaced by filter receive when the filter requested no input.
    #[error("no data available yet")]
    Again,

    /// Configuration or parameter validation error.
    ///
    /// Examples:
    /// - Endpoints left unconnected when the scheduler starts
    /// - A cycle in the transcoding graph
    /// - Out-of-range node or stream indices
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Resource exhaustion or limit exceeded.
    ///
    /// Examples:
    /// - Pre-mux buffering limit reached for an output stream
    #[error("resource exhaustion: {0}")]
    ResourceExhausted(String),

    /// An internal invariant was violated. Callers should treat this as a
    /// defect in the calling code, not a recoverable condition.
    #[error("internal error: {0}")]
    Bug(String),

    /// I/O error from a user callback (header or SDP writer).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `FrameFlowError`.
pub type Result<T> = std::result::Result<T, FrameFlowError>;

impl FrameFlowError {
    /// Whether this is the end-of-stream signal.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    /// Whether this outcome counts as a failure at task scope.
    ///
    /// `Eof` and `Exit` are normal termination; everything else is not.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::Eof | Self::Exit)
    }
}

/// Merge two task statuses, keeping the first real failure.
///
/// EOF (and `Exit`) outcomes never override a real error, and a real error
/// in `next` is preserved when `acc` is still clean.
#[must_use]
pub fn merge_status(acc: Result<()>, next: Result<()>) -> Result<()> {
    match (&acc, &next) {
        (Err(e), _) if e.is_failure() => acc,
        (_, Err(e)) if e.is_failure() => next,
        (Err(_), _) => acc,
        _ => next,
    }
}

/// Normalize a task exit status: EOF and Exit are normal termination.
#[must_use]
pub fn task_exit_status(status: Result<()>) -> Result<()> {
    match status {
        Err(e) if !e.is_failure() => Ok(()),
        other => other,
    }
}
