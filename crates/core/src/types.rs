// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core data types that flow through FrameFlow pipelines.
//!
//! This module defines the fundamental data structures used throughout the
//! system:
//! - [`Rational`]: exact time bases and the canonical microsecond base
//! - [`Timestamp`]: a timestamp paired with its time base
//! - [`Packet`]: a demuxed or encoded unit with timing metadata
//! - [`Frame`]: a decoded unit with timing metadata
//!
//! The scheduler never looks inside payloads; packets and frames exist here
//! only so that timing metadata can be inspected for flow control and so
//! that fan-out can clone them cheaply (payloads are `Bytes`-backed).

use bytes::Bytes;
use smallvec::SmallVec;
use std::cmp::Ordering;

/// An exact rational number used as a stream time base.
///
/// `den` is always positive for a valid time base; comparisons and
/// rescaling are exact (128-bit intermediates), so cross-stream timestamp
/// ordering never suffers from rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

/// The canonical time base: microseconds.
///
/// All cross-stream comparisons in the scheduler rescale into this base.
pub const TIME_BASE_Q: Rational = Rational::new(1, 1_000_000);

/// One second of ticks in the canonical time base.
pub const TIME_BASE: i64 = 1_000_000;

impl Rational {
    #[must_use]
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Whether this is a usable time base (strictly positive).
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.num > 0 && self.den > 0
    }
}

/// Compare two timestamps expressed in different time bases.
///
/// Returns the ordering of `a / a_tb` vs `b / b_tb` computed exactly.
#[must_use]
pub fn compare_ts(a: i64, a_tb: Rational, b: i64, b_tb: Rational) -> Ordering {
    let lhs = i128::from(a) * i128::from(a_tb.num) * i128::from(b_tb.den);
    let rhs = i128::from(b) * i128::from(b_tb.num) * i128::from(a_tb.den);
    lhs.cmp(&rhs)
}

/// Rescale a timestamp from one time base to another, rounding to the
/// nearest representable value (ties away from zero).
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn rescale_q(v: i64, from: Rational, to: Rational) -> i64 {
    let num = i128::from(v) * i128::from(from.num) * i128::from(to.den);
    let den = i128::from(from.den) * i128::from(to.num);
    if den == 0 {
        return 0;
    }
    let rounded = if num >= 0 { num + den / 2 } else { num - den / 2 } / den;
    rounded as i64
}

/// A timestamp paired with the time base it is expressed in.
///
/// `ts == None` means "no timestamp known".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub ts: Option<i64>,
    pub tb: Rational,
}

impl Timestamp {
    /// A timestamp that is not set.
    pub const NONE: Self = Self { ts: None, tb: TIME_BASE_Q };

    #[must_use]
    pub const fn new(ts: i64, tb: Rational) -> Self {
        Self { ts: Some(ts), tb }
    }
}

/// A demuxed or encoded data unit.
///
/// The scheduler moves packets between tasks without inspecting the payload;
/// only `dts`/`duration`/`time_base` (flow control) and `stream_index`
/// (routing, with `None` as the demuxer flush sentinel) are interpreted.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Opaque compressed data. `None` for props-only packets such as
    /// flush sentinels and subtitle heartbeats.
    pub payload: Option<Bytes>,
    /// Stream this packet belongs to within its producing demuxer or
    /// consuming muxer. `None` signals a demuxer flush.
    pub stream_index: Option<usize>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub time_base: Rational,
    pub flags: u32,
    /// Opaque per-packet side data blobs; carried along, never inspected.
    pub side_data: SmallVec<[Bytes; 1]>,
    /// Free-form tag for the surrounding application.
    pub opaque: u64,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            payload: None,
            stream_index: None,
            pts: None,
            dts: None,
            duration: 0,
            time_base: TIME_BASE_Q,
            flags: 0,
            side_data: SmallVec::new(),
            opaque: 0,
        }
    }
}

impl Packet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this packet is empty of both payload and side data.
    ///
    /// Such packets act as decoder flush requests.
    #[must_use]
    pub fn is_flush(&self) -> bool {
        self.payload.is_none() && self.side_data.is_empty()
    }

    /// Payload size in bytes (0 for props-only packets).
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }

    /// End timestamp (`dts + duration`) used as the flow-control key.
    #[must_use]
    pub fn end_dts(&self) -> Option<i64> {
        self.dts.map(|dts| dts + self.duration)
    }

    /// End timestamp (`pts + duration`) used for presentation ordering.
    #[must_use]
    pub fn end_pts(&self) -> Option<i64> {
        self.pts.map(|pts| pts + self.duration)
    }

    /// A payload-less copy carrying only properties (timing, flags, side
    /// data). Used for subtitle heartbeats.
    #[must_use]
    pub fn props(&self) -> Self {
        Self { payload: None, ..self.clone() }
    }

    /// Clear to the default state, keeping allocated capacity.
    pub fn reset(&mut self) {
        self.payload = None;
        self.stream_index = None;
        self.pts = None;
        self.dts = None;
        self.duration = 0;
        self.time_base = TIME_BASE_Q;
        self.flags = 0;
        self.side_data.clear();
        self.opaque = 0;
    }

    /// Move this packet out, leaving the default state behind.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// A decoded data unit.
///
/// The scheduler forwards frames without interpretation; `nb_samples` and
/// `sample_rate` exist so the sync queue can re-chunk audio to a fixed
/// encoder frame size.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Opaque decoded data. `None` for props-only frames (e.g. carrying an
    /// end-of-stream timestamp).
    pub payload: Option<Bytes>,
    pub pts: Option<i64>,
    pub duration: i64,
    pub time_base: Rational,
    /// Number of audio samples in the payload; 0 for video.
    pub nb_samples: usize,
    /// Audio sample rate; 0 for video.
    pub sample_rate: u32,
    /// Free-form tag for the surrounding application.
    pub opaque: u64,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            payload: None,
            pts: None,
            duration: 0,
            time_base: TIME_BASE_Q,
            nb_samples: 0,
            sample_rate: 0,
            opaque: 0,
        }
    }
}

impl Frame {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the frame carries actual data (as opposed to props only).
    #[must_use]
    pub const fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// End timestamp (`pts + duration`).
    #[must_use]
    pub fn end_pts(&self) -> Option<i64> {
        self.pts.map(|pts| pts + self.duration)
    }

    /// Clear to the default state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Move this frame out, leaving the default state behind.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}
