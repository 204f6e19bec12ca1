// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Cooperative choking of source tasks.
//!
//! Demuxers and pure-source filter graphs are the only tasks the scheduler
//! can throttle directly; everything downstream self-throttles by blocking
//! on its input queue. A [`Waiter`] is the parking spot: the task calls
//! [`Waiter::wait`] at the top of its loop and blocks while choked, until
//! either the scheduler unchokes it or termination is requested.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Waiter {
    lock: Mutex<()>,
    cond: Condvar,
    choked: AtomicBool,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    #[must_use]
    pub fn new() -> Self {
        Self { lock: Mutex::new(()), cond: Condvar::new(), choked: AtomicBool::new(false) }
    }

    /// Block while choked, unless termination has been requested.
    ///
    /// Returns `true` when the caller should terminate instead of
    /// proceeding.
    pub fn wait(&self, terminate: &AtomicBool) -> bool {
        if !self.choked.load(Ordering::Acquire) {
            return false;
        }

        let mut guard = self.lock.lock();
        while self.choked.load(Ordering::Acquire) && !terminate.load(Ordering::Acquire) {
            self.cond.wait(&mut guard);
        }
        terminate.load(Ordering::Acquire)
    }

    /// Choke or unchoke, waking the parked task if there is one.
    pub fn set(&self, choked: bool) {
        let _guard = self.lock.lock();
        self.choked.store(choked, Ordering::Release);
        self.cond.notify_one();
    }

    /// Current choke state.
    #[must_use]
    pub fn is_choked(&self) -> bool {
        self.choked.load(Ordering::Acquire)
    }
}
