// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared sizing and pacing constants for the scheduler.
//!
//! This module provides the canonical default values for queue depths and
//! flow-control pacing. Everything that buffers between tasks references
//! these constants so the relationships below stay true in one place.
//!
//! # Queue depth guidelines
//!
//! Queue depths are measured in packets/frames, not bytes:
//! - **Deeper queues** = more buffering, more memory, looser coupling
//! - **Shallower queues** = tighter backpressure, lower peak memory
//!
//! Decoders size their codec-side frame pools assuming the frame queue
//! depth below; it must not be changed per-queue.

/// Default depth of a packet queue (demuxer → decoder, producer → muxer).
///
/// For muxing this can be overridden per muxer when it is added.
pub const DEFAULT_PACKET_QUEUE_DEPTH: usize = 8;

/// Default depth of a frame queue (decoder/filter → encoder, filter inputs).
///
/// This depth is a contract with decoding code, which keeps enough entries
/// in its fixed-size frame pools to cover frames held in these queues.
pub const DEFAULT_FRAME_QUEUE_DEPTH: usize = 8;

/// How far ahead (in microseconds) an output stream may run past the
/// trailing stream before its source stops being unchoked.
pub const SCHEDULE_TOLERANCE_US: i64 = 100 * 1000;

/// Initial capacity of a pre-mux queue, before the grow policy kicks in.
pub const PREMUX_INITIAL_CAPACITY: usize = 8;
