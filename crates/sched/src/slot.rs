// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A blocking channel with a capacity of one.
//!
//! Used for the decoder → demuxer end-timestamp round trip: after a flush
//! the demuxer blocks on [`SlotChannel::recv`] until the decoder publishes
//! the terminal timestamp of the flushed stream. Closing the channel wakes
//! both sides with EOF so a decoder that exits early cannot strand its
//! demuxer.

use frameflow_core::{FrameFlowError, Result};
use parking_lot::{Condvar, Mutex};

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

pub struct SlotChannel<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

impl<T> Default for SlotChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotChannel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { slot: Mutex::new(Slot { value: None, closed: false }), cond: Condvar::new() }
    }

    /// Put a value into the slot, blocking while it is occupied.
    ///
    /// # Errors
    ///
    /// Returns `Eof` when the channel has been closed.
    pub fn send(&self, value: T) -> Result<()> {
        let mut slot = self.slot.lock();
        while slot.value.is_some() && !slot.closed {
            self.cond.wait(&mut slot);
        }
        if slot.closed {
            return Err(FrameFlowError::Eof);
        }
        slot.value = Some(value);
        self.cond.notify_all();
        Ok(())
    }

    /// Take the value out of the slot, blocking while it is empty.
    ///
    /// # Errors
    ///
    /// Returns `Eof` when the channel has been closed and drained.
    pub fn recv(&self) -> Result<T> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                self.cond.notify_all();
                return Ok(value);
            }
            if slot.closed {
                return Err(FrameFlowError::Eof);
            }
            self.cond.wait(&mut slot);
        }
    }

    /// Close the channel; pending and future operations see EOF.
    pub fn close(&self) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        self.cond.notify_all();
    }
}
