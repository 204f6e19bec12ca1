// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Time-ordered reordering of items across streams.
//!
//! A [`SyncQueue`] buffers frames (or packets) for several streams and
//! releases them in cross-stream timestamp order, so that a set of encoders
//! feeding one muxer stays paced against each other. The essential state is
//! the *queue head*: the limiting stream whose largest-seen timestamp is
//! smallest. An item may leave the queue only once it does not end after
//! the queue head — releasing it can then never break ordering, no matter
//! what the other streams produce later.
//!
//! Two escape hatches keep this from stalling:
//! - a **finish cascade**: when a limiting stream finishes, streams already
//!   ahead of its final timestamp can never produce anything the output
//!   still needs, so they are finished too;
//! - an **overflow heartbeat**: when one stream has buffered more than the
//!   configured duration because a peer has gone silent, the silent peers
//!   get a synthetic timestamp bump so the buffered items can drain.
//!
//! Streams attached to a fixed-frame-size audio encoder additionally get
//! re-chunked: [`SyncQueue::set_frame_samples`] makes the queue emit items
//! of exactly that many samples, splitting and coalescing as needed.
//!
//! The queue does no locking; the owner is expected to serialize access.

use frameflow_core::{compare_ts, rescale_q, FrameFlowError, Frame, Packet, Rational, Result,
                     TIME_BASE_Q};
use std::cmp::Ordering;
use std::collections::VecDeque;

/// An item a [`SyncQueue`] can order: something with an end timestamp, and
/// optionally a run of audio samples that can be split and coalesced.
pub trait SyncItem: Sized {
    /// End timestamp (`pts + duration`) in the stream's time base, if known.
    fn end_ts(&self) -> Option<i64>;

    /// Number of audio samples carried; 0 when not applicable.
    fn samples(&self) -> usize {
        0
    }

    /// End timestamp the item would have if truncated to `n` samples.
    fn ts_after_samples(&self, n: usize) -> Option<i64> {
        let _ = n;
        self.end_ts()
    }

    /// Split `n` samples off the front into a new item, leaving the rest in
    /// place. `None` when the item cannot be split.
    fn split_samples(&mut self, n: usize) -> Option<Self> {
        let _ = n;
        None
    }

    /// Append all samples of `other` onto `self`. `false` when the items
    /// cannot be coalesced.
    fn merge_samples(&mut self, other: &Self) -> bool {
        let _ = other;
        false
    }
}

fn samples_to_tb(n: usize, sample_rate: u32, tb: Rational) -> i64 {
    rescale_q(n as i64, Rational::new(1, i32::try_from(sample_rate).unwrap_or(i32::MAX)), tb)
}

impl SyncItem for Frame {
    fn end_ts(&self) -> Option<i64> {
        self.end_pts()
    }

    fn samples(&self) -> usize {
        self.nb_samples
    }

    fn ts_after_samples(&self, n: usize) -> Option<i64> {
        if self.sample_rate == 0 {
            return self.end_ts();
        }
        self.pts.map(|pts| pts + samples_to_tb(n, self.sample_rate, self.time_base))
    }

    fn split_samples(&mut self, n: usize) -> Option<Self> {
        let payload = self.payload.as_ref()?;
        if n == 0 || n >= self.nb_samples || self.sample_rate == 0 {
            return None;
        }
        if payload.len() % self.nb_samples != 0 {
            return None;
        }

        let bytes_per_sample = payload.len() / self.nb_samples;
        let head_payload = payload.slice(..n * bytes_per_sample);
        let rest_payload = payload.slice(n * bytes_per_sample..);

        let head_duration = samples_to_tb(n, self.sample_rate, self.time_base);
        let head = Self {
            payload: Some(head_payload),
            pts: self.pts,
            duration: head_duration,
            time_base: self.time_base,
            nb_samples: n,
            sample_rate: self.sample_rate,
            opaque: self.opaque,
        };

        self.payload = Some(rest_payload);
        self.pts = self.pts.map(|pts| pts + head_duration);
        self.nb_samples -= n;
        self.duration =
            samples_to_tb(self.nb_samples, self.sample_rate, self.time_base);

        Some(head)
    }

    fn merge_samples(&mut self, other: &Self) -> bool {
        let (Some(payload), Some(other_payload)) = (&self.payload, &other.payload) else {
            return false;
        };
        if self.nb_samples == 0
            || other.nb_samples == 0
            || self.sample_rate != other.sample_rate
            || self.sample_rate == 0
            || payload.len() % self.nb_samples != 0
            || other_payload.len() % other.nb_samples != 0
            || payload.len() / self.nb_samples != other_payload.len() / other.nb_samples
        {
            return false;
        }

        let mut merged = bytes::BytesMut::with_capacity(payload.len() + other_payload.len());
        merged.extend_from_slice(payload);
        merged.extend_from_slice(other_payload);
        self.payload = Some(merged.freeze());
        self.nb_samples += other.nb_samples;
        self.duration = samples_to_tb(self.nb_samples, self.sample_rate, self.time_base);
        true
    }
}

impl SyncItem for Packet {
    fn end_ts(&self) -> Option<i64> {
        self.end_pts()
    }
}

struct SqStream<T> {
    fifo: VecDeque<T>,
    tb: Rational,
    tb_set: bool,
    /// Largest end timestamp ever seen on this stream.
    head_ts: Option<i64>,
    limiting: bool,
    /// No more items will be accepted for this stream.
    finished: bool,
    frames_sent: u64,
    frames_max: u64,
    /// When non-zero, items leave this stream re-chunked to exactly this
    /// many samples.
    frame_samples: usize,
}

pub struct SyncQueue<T> {
    /// All streams are finished; nothing more will ever be released.
    finished: bool,
    /// The limiting stream with the smallest head timestamp; gates output.
    head_stream: Option<usize>,
    /// The finished limiting stream with the smallest head timestamp.
    head_finished_stream: Option<usize>,
    /// Maximum buffering duration in microseconds before the overflow
    /// heartbeat fires.
    buf_size_us: i64,
    streams: Vec<SqStream<T>>,
}

impl<T: SyncItem> SyncQueue<T> {
    #[must_use]
    pub fn new(buf_size_us: i64) -> Self {
        Self {
            finished: false,
            head_stream: None,
            head_finished_stream: None,
            buf_size_us,
            streams: Vec::new(),
        }
    }

    /// Append a stream. A limiting stream participates in choosing the
    /// queue head; non-limiting streams are only gated by it.
    pub fn add_stream(&mut self, limiting: bool) -> usize {
        self.streams.push(SqStream {
            fifo: VecDeque::new(),
            // a valid default, so a pathological stream that never even
            // gets a time base cannot stall all the others
            tb: Rational::new(1, 1),
            tb_set: false,
            head_ts: None,
            limiting,
            finished: false,
            frames_sent: 0,
            frames_max: u64::MAX,
            frame_samples: 0,
        });
        self.streams.len() - 1
    }

    /// Set the stream's time base. Must be called before any item is sent
    /// for the stream.
    pub fn set_tb(&mut self, stream: usize, tb: Rational) {
        let st = &mut self.streams[stream];
        assert!(st.fifo.is_empty());

        if let Some(head_ts) = st.head_ts {
            st.head_ts = Some(rescale_q(head_ts, st.tb, tb));
        }
        st.tb = tb;
        st.tb_set = true;
    }

    /// Whether [`Self::set_tb`] has been called for the stream.
    #[must_use]
    pub fn has_tb(&self, stream: usize) -> bool {
        self.streams[stream].tb_set
    }

    /// Finish the stream after it has emitted `max_frames` items.
    pub fn limit_frames(&mut self, stream: usize, max_frames: u64) {
        self.streams[stream].frames_max = max_frames;
        if self.streams[stream].frames_sent >= max_frames {
            self.finish_stream(stream);
        }
    }

    /// Emit fixed-size items of `nb_samples` samples for this stream.
    pub fn set_frame_samples(&mut self, stream: usize, nb_samples: usize) {
        self.streams[stream].frame_samples = nb_samples;
    }

    #[must_use]
    pub fn nb_streams(&self) -> usize {
        self.streams.len()
    }

    /// Submit an item for a stream; `None` finishes the stream.
    ///
    /// # Errors
    ///
    /// Returns `Eof` when the stream is already finished.
    pub fn send(&mut self, stream: usize, item: Option<T>) -> Result<()> {
        assert!(stream < self.streams.len());

        let Some(item) = item else {
            self.finish_stream(stream);
            return Ok(());
        };

        if self.streams[stream].finished {
            return Err(FrameFlowError::Eof);
        }

        let ts = item.end_ts();
        self.streams[stream].fifo.push_back(item);
        self.stream_update_ts(stream, ts);

        let st = &mut self.streams[stream];
        st.frames_sent += 1;
        if st.frames_sent >= st.frames_max {
            self.finish_stream(stream);
        }

        Ok(())
    }

    /// Take a releasable item, for one stream or for any.
    ///
    /// # Errors
    ///
    /// - `Again` when more input is needed before anything can be released.
    /// - `Eof` when the requested stream (or, with `None`, every stream)
    ///   will never release anything again.
    pub fn receive(&mut self, stream: Option<usize>) -> Result<(usize, T)> {
        match self.receive_internal(stream) {
            // one retry when the queue overflowed and the heartbeat gave
            // lagging streams a synthetic timestamp
            Err(FrameFlowError::Again) if self.overflow_heartbeat(stream) => {
                self.receive_internal(stream)
            }
            other => other,
        }
    }

    fn receive_internal(&mut self, stream: Option<usize>) -> Result<(usize, T)> {
        if let Some(stream) = stream {
            return self.receive_for_stream(stream).map(|item| (stream, item));
        }

        let mut nb_eof = 0;
        for idx in 0..self.streams.len() {
            match self.receive_for_stream(idx) {
                Ok(item) => return Ok((idx, item)),
                Err(FrameFlowError::Eof) => nb_eof += 1,
                Err(FrameFlowError::Again) => {}
                Err(err) => return Err(err),
            }
        }

        if nb_eof == self.streams.len() {
            Err(FrameFlowError::Eof)
        } else {
            Err(FrameFlowError::Again)
        }
    }

    fn receive_for_stream(&mut self, stream: usize) -> Result<T> {
        assert!(stream < self.streams.len());

        let head = self
            .head_stream
            .and_then(|h| self.streams[h].head_ts.map(|ts| (ts, self.streams[h].tb)));

        let frame_samples = self.streams[stream].frame_samples;
        if frame_samples > 0 {
            self.coalesce_front(stream, frame_samples);
        }

        let st = &mut self.streams[stream];
        if let Some(front) = st.fifo.front() {
            let chunked = frame_samples > 0 && front.samples() > 0;
            let enough = !chunked || front.samples() >= frame_samples || st.finished;

            if enough {
                let ts = if chunked && front.samples() > frame_samples {
                    front.ts_after_samples(frame_samples)
                } else {
                    front.end_ts()
                };

                // release items that do not end after the queue head; items
                // with no timestamp pass through unconditionally
                let releasable = match (ts, head) {
                    (None, _) => true,
                    (Some(ts), Some((head_ts, head_tb))) => {
                        compare_ts(ts, st.tb, head_ts, head_tb) != Ordering::Greater
                    }
                    (Some(_), None) => false,
                };

                if releasable {
                    let item = if chunked && st.fifo.front().map_or(0, T::samples) > frame_samples
                    {
                        st.fifo
                            .front_mut()
                            .and_then(|front| front.split_samples(frame_samples))
                    } else {
                        None
                    };
                    if let Some(item) = item {
                        return Ok(item);
                    }
                    if let Some(item) = st.fifo.pop_front() {
                        return Ok(item);
                    }
                }
            }
        }

        if self.finished || (st.finished && st.fifo.is_empty()) {
            Err(FrameFlowError::Eof)
        } else {
            Err(FrameFlowError::Again)
        }
    }

    /// Grow the front item of a chunked stream to at least `nb_samples`
    /// samples by coalescing successor items into it.
    fn coalesce_front(&mut self, stream: usize, nb_samples: usize) {
        let st = &mut self.streams[stream];
        while st.fifo.front().map_or(0, T::samples) > 0
            && st.fifo.front().map_or(0, T::samples) < nb_samples
            && st.fifo.len() > 1
        {
            let Some(next) = st.fifo.remove(1) else { break };
            let Some(front) = st.fifo.front_mut() else { break };
            // items that cannot be coalesced are released as-is
            if !front.merge_samples(&next) {
                st.fifo.insert(1, next);
                break;
            }
        }
    }

    fn finish_stream(&mut self, stream: usize) {
        self.streams[stream].finished = true;

        let st = &self.streams[stream];
        if st.limiting && st.head_ts.is_some() {
            // check whether this stream is the new finished head
            let is_new_head = self.head_finished_stream.is_none_or(|old| {
                let old_st = &self.streams[old];
                match (st.head_ts, old_st.head_ts) {
                    (Some(ts), Some(old_ts)) => {
                        compare_ts(ts, st.tb, old_ts, old_st.tb) == Ordering::Less
                    }
                    _ => false,
                }
            });
            if is_new_head {
                self.head_finished_stream = Some(stream);
            }

            // finish all streams already ahead of the finished head: they
            // can never produce anything the output still needs
            if let Some(finished_head) = self.head_finished_stream {
                let (head_ts, head_tb) =
                    (self.streams[finished_head].head_ts, self.streams[finished_head].tb);
                if let Some(head_ts) = head_ts {
                    for idx in 0..self.streams.len() {
                        let other = &mut self.streams[idx];
                        if idx != finished_head {
                            if let Some(other_ts) = other.head_ts {
                                if compare_ts(head_ts, head_tb, other_ts, other.tb)
                                    != Ordering::Greater
                                {
                                    other.finished = true;
                                }
                            }
                        }
                    }
                }
            }
        }

        if self.streams.iter().all(|st| st.finished) {
            self.finished = true;
        }
    }

    fn queue_head_update(&mut self) {
        if self.head_stream.is_none() {
            // wait for one timestamp in each limiting stream before
            // determining the queue head
            if self.streams.iter().any(|st| st.limiting && st.head_ts.is_none()) {
                return;
            }
            // placeholder value, the correct one is found below
            self.head_stream = Some(0);
        }

        let Some(mut head) = self.head_stream else { return };
        for idx in 0..self.streams.len() {
            let other = &self.streams[idx];
            let head_st = &self.streams[head];
            if other.limiting {
                if let (Some(other_ts), Some(head_ts)) = (other.head_ts, head_st.head_ts) {
                    if compare_ts(other_ts, other.tb, head_ts, head_st.tb) == Ordering::Less {
                        head = idx;
                    }
                } else if other.head_ts.is_some() && head_st.head_ts.is_none() {
                    head = idx;
                }
            }
        }
        self.head_stream = Some(head);
    }

    /// Advance the stream's head timestamp (monotone max).
    fn stream_update_ts(&mut self, stream: usize, ts: Option<i64>) {
        let Some(ts) = ts else { return };
        {
            let st = &mut self.streams[stream];
            if st.head_ts.is_some_and(|head| head >= ts) {
                return;
            }
            st.head_ts = Some(ts);
        }

        // this stream overtaking a finished stream finishes it too
        if let Some(finished_head) = self.head_finished_stream {
            let fh = &self.streams[finished_head];
            if let Some(fh_ts) = fh.head_ts {
                if compare_ts(fh_ts, fh.tb, ts, self.streams[stream].tb) != Ordering::Greater {
                    self.finish_stream(stream);
                }
            }
        }

        let st = &self.streams[stream];
        if st.limiting && (self.head_stream.is_none() || self.head_stream == Some(stream)) {
            self.queue_head_update();
        }
    }

    /// When the given stream (or the most-ahead one) has buffered more than
    /// `buf_size_us`, bump the head timestamp of every stream holding it
    /// back. Returns whether anything changed.
    fn overflow_heartbeat(&mut self, stream: Option<usize>) -> bool {
        let stream = stream.or_else(|| {
            // pick the stream that is most ahead
            let mut best: Option<usize> = None;
            for (idx, st) in self.streams.iter().enumerate() {
                if let Some(ts) = st.head_ts {
                    let ahead = best.is_none_or(|b| {
                        self.streams[b].head_ts.is_none_or(|best_ts| {
                            compare_ts(best_ts, self.streams[b].tb, ts, st.tb) == Ordering::Less
                        })
                    });
                    if ahead {
                        best = Some(idx);
                    }
                }
            }
            best
        });
        // no stream has a timestamp yet, nothing to do
        let Some(stream) = stream else { return false };

        let st = &self.streams[stream];
        let Some(head_ts) = st.head_ts else { return false };
        let tb = st.tb;

        // the chosen stream's tail timestamp: oldest known end timestamp
        let tail_ts = st.fifo.iter().find_map(SyncItem::end_ts);
        let Some(tail_ts) = tail_ts else { return false };

        // overflow triggers when the tail is more than the configured
        // duration behind the head
        if tail_ts >= head_ts || rescale_q(head_ts - tail_ts, tb, TIME_BASE_Q) < self.buf_size_us
        {
            return false;
        }

        // signal a synthetic timestamp to all streams preventing the tail
        // from being released
        let tail_ts = tail_ts + 1;
        for idx in 0..self.streams.len() {
            let other = &self.streams[idx];
            if idx == stream || other.finished {
                continue;
            }
            if let Some(other_ts) = other.head_ts {
                if compare_ts(tail_ts, tb, other_ts, other.tb) != Ordering::Greater {
                    continue;
                }
            }

            let mut ts = rescale_q(tail_ts, tb, other.tb);
            if let Some(other_ts) = other.head_ts {
                ts = ts.max(other_ts + 1);
            }
            self.stream_update_ts(idx, Some(ts));
        }

        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const MS: Rational = Rational::new(1, 1000);

    fn frame(pts: i64, duration: i64) -> Frame {
        Frame {
            payload: Some(Bytes::from_static(b"x")),
            pts: Some(pts),
            duration,
            time_base: MS,
            ..Frame::default()
        }
    }

    fn audio_frame(pts: i64, nb_samples: usize) -> Frame {
        Frame {
            payload: Some(Bytes::from(vec![0u8; nb_samples * 4])),
            pts: Some(pts),
            duration: i64::try_from(nb_samples).unwrap(),
            time_base: Rational::new(1, 48_000),
            nb_samples,
            sample_rate: 48_000,
            ..Frame::default()
        }
    }

    #[test]
    fn releases_in_cross_stream_timestamp_order() {
        let mut sq: SyncQueue<Frame> = SyncQueue::new(1_000_000);
        let a = sq.add_stream(true);
        let b = sq.add_stream(true);
        sq.set_tb(a, MS);
        sq.set_tb(b, MS);

        sq.send(a, Some(frame(0, 10))).unwrap();
        sq.send(a, Some(frame(10, 10))).unwrap();
        // until b has a timestamp, nothing is releasable
        assert!(matches!(sq.receive(None), Err(FrameFlowError::Again)));

        sq.send(b, Some(frame(0, 15))).unwrap();
        // head is b at 15: a's frames ending at 10 and 20 gate accordingly
        let (stream, item) = sq.receive(None).unwrap();
        assert_eq!((stream, item.pts), (a, Some(0)));
        let (stream, item) = sq.receive(None).unwrap();
        assert_eq!((stream, item.pts), (b, Some(0)));
        assert!(matches!(sq.receive(None), Err(FrameFlowError::Again)));

        sq.send(b, Some(frame(15, 10))).unwrap();
        let (stream, _) = sq.receive(None).unwrap();
        assert_eq!(stream, a);
    }

    #[test]
    fn untimed_items_pass_through() {
        let mut sq: SyncQueue<Frame> = SyncQueue::new(1_000_000);
        let a = sq.add_stream(true);
        sq.set_tb(a, MS);

        let mut untimed = frame(0, 0);
        untimed.pts = None;
        sq.send(a, Some(untimed)).unwrap();
        assert!(sq.receive(None).is_ok());
    }

    #[test]
    fn finishing_cascades_to_streams_ahead() {
        let mut sq: SyncQueue<Frame> = SyncQueue::new(1_000_000);
        let a = sq.add_stream(true);
        let b = sq.add_stream(true);
        sq.set_tb(a, MS);
        sq.set_tb(b, MS);

        sq.send(a, Some(frame(0, 10))).unwrap();
        sq.send(b, Some(frame(0, 20))).unwrap();
        // a finishes at head 10; b's head 20 is ahead, so b finishes too
        sq.send(a, None).unwrap();
        assert!(matches!(sq.send(b, Some(frame(20, 10))), Err(FrameFlowError::Eof)));

        // everything already queued still drains, then EOF
        assert!(sq.receive(None).is_ok());
        assert!(sq.receive(None).is_ok());
        assert!(matches!(sq.receive(None), Err(FrameFlowError::Eof)));
    }

    #[test]
    fn frame_limit_finishes_stream() {
        let mut sq: SyncQueue<Frame> = SyncQueue::new(1_000_000);
        let a = sq.add_stream(true);
        sq.set_tb(a, MS);
        sq.limit_frames(a, 2);

        sq.send(a, Some(frame(0, 10))).unwrap();
        sq.send(a, Some(frame(10, 10))).unwrap();
        assert!(matches!(sq.send(a, Some(frame(20, 10))), Err(FrameFlowError::Eof)));
    }

    #[test]
    fn heartbeat_unblocks_lagging_silent_stream() {
        let mut sq: SyncQueue<Frame> = SyncQueue::new(100_000);
        let a = sq.add_stream(true);
        let b = sq.add_stream(true);
        sq.set_tb(a, MS);
        sq.set_tb(b, MS);

        // a buffers 200ms while b stays silent; past buf_size_us=100ms the
        // heartbeat must bump b and let a's tail out
        for i in 0..20 {
            sq.send(a, Some(frame(i * 10, 10))).unwrap();
        }
        let (stream, item) = sq.receive(None).unwrap();
        assert_eq!(stream, a);
        assert_eq!(item.pts, Some(0));
    }

    #[test]
    fn heartbeat_is_noop_without_any_timestamps() {
        let mut sq: SyncQueue<Frame> = SyncQueue::new(0);
        let a = sq.add_stream(true);
        let b = sq.add_stream(true);
        sq.set_tb(a, MS);
        sq.set_tb(b, MS);

        // an untimed item leaves head_ts unset everywhere
        let mut untimed = frame(0, 0);
        untimed.pts = None;
        untimed.duration = 0;
        sq.send(a, Some(untimed)).unwrap();
        let _ = b;

        // untimed items pass through; after that, Again without panicking
        assert!(sq.receive(None).is_ok());
        assert!(matches!(sq.receive(None), Err(FrameFlowError::Again)));
    }

    #[test]
    fn chunked_stream_emits_fixed_size_frames() {
        let mut sq: SyncQueue<Frame> = SyncQueue::new(1_000_000);
        let a = sq.add_stream(true);
        sq.set_tb(a, Rational::new(1, 48_000));
        sq.set_frame_samples(a, 1024);

        sq.send(a, Some(audio_frame(0, 2400))).unwrap();

        let (_, first) = sq.receive(None).unwrap();
        assert_eq!(first.nb_samples, 1024);
        assert_eq!(first.pts, Some(0));
        assert_eq!(first.payload.unwrap().len(), 1024 * 4);

        let (_, second) = sq.receive(None).unwrap();
        assert_eq!(second.nb_samples, 1024);
        assert_eq!(second.pts, Some(1024));

        // the 352-sample remainder is held for more input...
        assert!(matches!(sq.receive(None), Err(FrameFlowError::Again)));

        // ...and flushed once the stream finishes
        sq.send(a, None).unwrap();
        let (_, tail) = sq.receive(None).unwrap();
        assert_eq!(tail.nb_samples, 352);
        assert_eq!(tail.pts, Some(2048));
        assert!(matches!(sq.receive(None), Err(FrameFlowError::Eof)));
    }

    #[test]
    fn chunked_stream_coalesces_small_frames() {
        let mut sq: SyncQueue<Frame> = SyncQueue::new(1_000_000);
        let a = sq.add_stream(true);
        sq.set_tb(a, Rational::new(1, 48_000));
        sq.set_frame_samples(a, 1024);

        sq.send(a, Some(audio_frame(0, 600))).unwrap();
        assert!(matches!(sq.receive(None), Err(FrameFlowError::Again)));
        sq.send(a, Some(audio_frame(600, 600))).unwrap();

        let (_, item) = sq.receive(None).unwrap();
        assert_eq!(item.nb_samples, 1024);
        assert_eq!(item.pts, Some(0));
        assert_eq!(item.payload.unwrap().len(), 1024 * 4);
    }
}
