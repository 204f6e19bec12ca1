// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded blocking queue shared by N logical sub-streams.
//!
//! One ring buffer carries interleaved items for several sub-streams, with
//! independent end-of-stream state per sub-stream on both the send and the
//! receive side:
//!
//! - a producer that keeps sending after the consumer called
//!   [`ThreadQueue::receive_finish`] gets EOF back (once) instead of
//!   blocking forever;
//! - the consumer sees exactly one [`Received::StreamEnd`] per finished
//!   sub-stream, then [`Received::Finished`] when every sub-stream is done;
//! - items already queued for a receive-finished sub-stream are discarded
//!   silently on drain.
//!
//! All waiting happens on one condvar; any state change broadcasts.

use frameflow_core::{FrameFlowError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

const FINISHED_SEND: u8 = 1 << 0;
const FINISHED_RECV: u8 = 1 << 1;

/// Outcome of [`ThreadQueue::receive`].
#[derive(Debug)]
pub enum Received<T> {
    /// An item for the given sub-stream.
    Item { stream: usize, item: T },
    /// The given sub-stream is finished; reported at most once per stream.
    StreamEnd(usize),
    /// Every sub-stream is finished; no more items will ever arrive.
    Finished,
}

struct Inner<T> {
    fifo: VecDeque<(usize, T)>,
    finished: Vec<u8>,
}

pub struct ThreadQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
    depth: usize,
}

impl<T> ThreadQueue<T> {
    /// Create a queue with `nb_streams` sub-streams sharing a ring of
    /// `depth` entries.
    #[must_use]
    pub fn new(nb_streams: usize, depth: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                fifo: VecDeque::with_capacity(depth),
                finished: vec![0; nb_streams],
            }),
            cond: Condvar::new(),
            depth,
        }
    }

    #[must_use]
    pub fn nb_streams(&self) -> usize {
        self.inner.lock().finished.len()
    }

    /// Queue an item for a sub-stream, blocking while the ring is full.
    ///
    /// # Errors
    ///
    /// - `Eof` when the receiver has finished this sub-stream; the send
    ///   side is latched finished as a side effect.
    /// - `Bug` when sending on a sub-stream that already send-finished.
    pub fn send(&self, stream: usize, item: T) -> Result<()> {
        let mut inner = self.inner.lock();
        assert!(stream < inner.finished.len());

        if inner.finished[stream] & FINISHED_SEND != 0 {
            return Err(FrameFlowError::Bug(format!(
                "send on sub-stream {stream} after send_finish"
            )));
        }

        while inner.finished[stream] & FINISHED_RECV == 0 && inner.fifo.len() >= self.depth {
            self.cond.wait(&mut inner);
        }

        if inner.finished[stream] & FINISHED_RECV != 0 {
            inner.finished[stream] |= FINISHED_SEND;
            return Err(FrameFlowError::Eof);
        }

        inner.fifo.push_back((stream, item));
        self.cond.notify_all();
        Ok(())
    }

    /// Take the next item, blocking while the ring is empty and at least
    /// one sub-stream can still produce.
    pub fn receive(&self) -> Received<T> {
        let mut inner = self.inner.lock();
        loop {
            let fifo_len = inner.fifo.len();
            let out = Self::receive_locked(&mut inner);

            // wake producers if the ring state changed
            if inner.fifo.len() != fifo_len {
                self.cond.notify_all();
            }

            match out {
                Some(received) => return received,
                None => self.cond.wait(&mut inner),
            }
        }
    }

    fn receive_locked(inner: &mut Inner<T>) -> Option<Received<T>> {
        while let Some((stream, item)) = inner.fifo.pop_front() {
            if inner.finished[stream] & FINISHED_RECV != 0 {
                // receiver already gave up on this sub-stream
                drop(item);
                continue;
            }
            return Some(Received::Item { stream, item });
        }

        let mut nb_finished = 0;
        for stream in 0..inner.finished.len() {
            if inner.finished[stream] == 0 {
                continue;
            }

            // report EOF to the consumer at most once for each sub-stream
            if inner.finished[stream] & FINISHED_RECV == 0 {
                inner.finished[stream] |= FINISHED_RECV;
                return Some(Received::StreamEnd(stream));
            }

            nb_finished += 1;
        }

        (nb_finished == inner.finished.len()).then_some(Received::Finished)
    }

    /// Mark a sub-stream as finished on the send side. Idempotent.
    pub fn send_finish(&self, stream: usize) {
        let mut inner = self.inner.lock();
        assert!(stream < inner.finished.len());
        inner.finished[stream] |= FINISHED_SEND;
        self.cond.notify_all();
    }

    /// Mark a sub-stream as finished on the receive side. Idempotent.
    ///
    /// Future sends on the sub-stream return EOF.
    pub fn receive_finish(&self, stream: usize) {
        let mut inner = self.inner.lock();
        assert!(stream < inner.finished.len());
        inner.finished[stream] |= FINISHED_RECV;
        self.cond.notify_all();
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn send_receive_round_trip() {
        let tq = ThreadQueue::new(2, 8);
        tq.send(1, "a").expect("send failed");
        tq.send(0, "b").expect("send failed");

        match tq.receive() {
            Received::Item { stream, item } => {
                assert_eq!((stream, item), (1, "a"));
            }
            other => panic!("unexpected receive outcome: {other:?}"),
        }
        match tq.receive() {
            Received::Item { stream, item } => {
                assert_eq!((stream, item), (0, "b"));
            }
            other => panic!("unexpected receive outcome: {other:?}"),
        }
    }

    #[test]
    fn eof_once_per_stream_then_terminal() {
        let tq: ThreadQueue<u32> = ThreadQueue::new(2, 8);
        tq.send_finish(0);
        tq.send_finish(1);

        let mut ended = Vec::new();
        for _ in 0..2 {
            match tq.receive() {
                Received::StreamEnd(stream) => ended.push(stream),
                other => panic!("expected StreamEnd, got {other:?}"),
            }
        }
        ended.sort_unstable();
        assert_eq!(ended, vec![0, 1]);

        assert!(matches!(tq.receive(), Received::Finished));
        // terminal state is sticky
        assert!(matches!(tq.receive(), Received::Finished));
    }

    #[test]
    fn send_after_receive_finish_returns_eof_and_latches() {
        let tq = ThreadQueue::new(1, 8);
        tq.receive_finish(0);

        assert!(matches!(tq.send(0, 1u32), Err(FrameFlowError::Eof)));
        // the send side is now finished; a further send is a caller bug
        assert!(matches!(tq.send(0, 2u32), Err(FrameFlowError::Bug(_))));
    }

    #[test]
    fn queued_items_for_finished_receiver_are_discarded() {
        let tq = ThreadQueue::new(2, 8);
        tq.send(0, 10u32).expect("send failed");
        tq.send(1, 20u32).expect("send failed");
        tq.receive_finish(0);
        tq.send_finish(1);

        // stream 0's queued item is dropped silently; stream 1 still flows
        match tq.receive() {
            Received::Item { stream, item } => assert_eq!((stream, item), (1, 20)),
            other => panic!("unexpected receive outcome: {other:?}"),
        }
        assert!(matches!(tq.receive(), Received::StreamEnd(1)));
        assert!(matches!(tq.receive(), Received::Finished));
    }

    #[test]
    fn full_ring_blocks_sender_until_receive() {
        let tq = Arc::new(ThreadQueue::new(1, 2));
        tq.send(0, 0u32).expect("send failed");
        tq.send(0, 1u32).expect("send failed");

        let sender = {
            let tq = Arc::clone(&tq);
            std::thread::spawn(move || tq.send(0, 2u32))
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!sender.is_finished(), "sender should block on a full ring");

        assert!(matches!(tq.receive(), Received::Item { item: 0, .. }));
        sender.join().expect("sender panicked").expect("blocked send failed");

        assert!(matches!(tq.receive(), Received::Item { item: 1, .. }));
        assert!(matches!(tq.receive(), Received::Item { item: 2, .. }));
    }

    #[test]
    fn receive_finish_unblocks_stuck_sender() {
        let tq = Arc::new(ThreadQueue::new(1, 1));
        tq.send(0, 0u32).expect("send failed");

        let sender = {
            let tq = Arc::clone(&tq);
            std::thread::spawn(move || tq.send(0, 1u32))
        };

        std::thread::sleep(Duration::from_millis(50));
        tq.receive_finish(0);
        assert!(matches!(
            sender.join().expect("sender panicked"),
            Err(FrameFlowError::Eof)
        ));
    }
}
