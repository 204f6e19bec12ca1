// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Packet buffering for output streams whose muxer has not started yet.
//!
//! A muxer thread only starts once all its streams are ready (the header
//! may depend on encoder parameters that only exist after the first frame).
//! Until then, arriving packets are parked here. Growth is deliberately
//! two-phase: below `data_threshold` bytes the queue grows freely; above
//! it, capacity doubles only up to `max_packets`, after which the producer
//! gets an error instead of unbounded buffering.

use crate::constants::PREMUX_INITIAL_CAPACITY;
use frameflow_core::{ContainerFifo, FrameFlowError, ObjectPool, Packet, Rational, Result};

/// What the drain loop sees at the head of a pre-mux queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PreMuxHead {
    /// A packet with the given dts (`None` = no timestamp).
    Packet { dts: Option<i64>, tb: Rational },
    /// All packets drained and the stream saw EOF before muxing started.
    Eof,
}

pub(crate) struct PreMuxQueue {
    fifo: ContainerFifo<Packet>,
    /// An EOF marker follows the queued packets.
    eof: bool,
    capacity: usize,
    /// Total payload bytes currently queued.
    data_size: usize,
    /// Byte threshold after which `max_packets` takes effect.
    data_threshold: usize,
    /// Packet cap once the threshold is reached.
    max_packets: usize,
}

impl PreMuxQueue {
    pub(crate) fn new() -> Self {
        Self {
            fifo: ContainerFifo::new(ObjectPool::packets()),
            eof: false,
            capacity: PREMUX_INITIAL_CAPACITY,
            data_size: 0,
            data_threshold: 0,
            max_packets: 0,
        }
    }

    pub(crate) fn set_limits(&mut self, data_threshold: usize, max_packets: usize) {
        self.data_threshold = data_threshold;
        self.max_packets = max_packets;
    }

    /// Park a packet, or record EOF when `pkt` is `None`.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when the grow policy refuses more buffering.
    pub(crate) fn push(&mut self, pkt: Option<&mut Packet>) -> Result<()> {
        let Some(pkt) = pkt else {
            self.eof = true;
            return Ok(());
        };

        if self.fifo.len() >= self.capacity {
            let threshold_reached = self.data_size + pkt.size() > self.data_threshold;
            let max_packets = if threshold_reached { self.max_packets } else { usize::MAX };
            let grown = (self.capacity * 2).min(max_packets);
            if grown <= self.fifo.len() {
                return Err(FrameFlowError::ResourceExhausted(
                    "too many packets buffered for output stream".into(),
                ));
            }
            self.capacity = grown;
        }

        self.data_size += pkt.size();
        self.fifo.write(pkt);
        Ok(())
    }

    /// Non-destructive look at what the drain would take next.
    pub(crate) fn head(&self) -> Option<PreMuxHead> {
        if let Some(pkt) = self.fifo.peek() {
            return Some(PreMuxHead::Packet { dts: pkt.dts, tb: pkt.time_base });
        }
        self.eof.then_some(PreMuxHead::Eof)
    }

    /// Pop the head packet, if any.
    pub(crate) fn pop(&mut self) -> Option<Packet> {
        let pkt = self.fifo.read()?;
        self.data_size = self.data_size.saturating_sub(pkt.size());
        Some(pkt)
    }

    /// Consume the EOF marker once all packets are gone.
    pub(crate) fn take_eof(&mut self) -> bool {
        if self.fifo.is_empty() && self.eof {
            self.eof = false;
            return true;
        }
        false
    }
}
