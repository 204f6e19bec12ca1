// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-node task APIs and the send/receive plumbing between nodes.
//!
//! Every task thread receives a typed context exposing exactly the calls
//! that node kind may make: a demuxer sends packets (and flushes), a
//! decoder receives packets and sends frames, and so on. All routing to
//! downstream nodes happens here; the contexts never talk to each other,
//! only through the scheduler.
//!
//! Ownership follows one rule throughout: sending consumes the payload.
//! For fan-out the scheduler clones for every destination but the last,
//! which is cheap because payloads are reference-counted.

use crate::graph::SchedulerNode;
use crate::scheduler::Scheduler;
use crate::thread_queue::Received;
use frameflow_core::{
    compare_ts, merge_status, Frame, FrameFlowError, Packet, Result, Timestamp,
};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;

/// Flags modifying [`DemuxContext::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DemuxSendFlags {
    /// Treat the packet as EOF for muxer destinations (a streamcopy output
    /// that reached its duration limit); decoders still receive it.
    pub streamcopy_eof: bool,
}

/// API handle for a demuxer task.
pub struct DemuxContext {
    sch: Scheduler,
    idx: usize,
}

/// API handle for a decoder task.
pub struct DecoderContext {
    sch: Scheduler,
    idx: usize,
}

/// API handle for a filter-graph task.
pub struct FilterContext {
    sch: Scheduler,
    idx: usize,
}

/// API handle for an encoder task.
pub struct EncoderContext {
    sch: Scheduler,
    idx: usize,
}

/// API handle for a muxer task.
pub struct MuxContext {
    sch: Scheduler,
    idx: usize,
}

macro_rules! ctx_common {
    ($ctx:ident) => {
        impl $ctx {
            pub(crate) fn new(sch: Scheduler, idx: usize) -> Self {
                Self { sch, idx }
            }

            /// A scheduler handle, for runtime surface calls from this task.
            #[must_use]
            pub fn scheduler(&self) -> Scheduler {
                self.sch.clone()
            }
        }
    };
}

ctx_common!(DemuxContext);
ctx_common!(DecoderContext);
ctx_common!(FilterContext);
ctx_common!(EncoderContext);
ctx_common!(MuxContext);

impl DemuxContext {
    /// Send a demuxed packet downstream, or flush after a seek.
    ///
    /// A packet with `stream_index == None` is a flush request: every
    /// decoder downstream gets an empty flush packet, and on return
    /// `pkt.pts`/`pkt.time_base` carry the largest end timestamp any
    /// flushed decoder reported (for loop playback). Normal packets are
    /// consumed on success.
    ///
    /// This call is also the demuxer's pacing point: it blocks while the
    /// demuxer is choked.
    ///
    /// # Errors
    ///
    /// - `Exit` when the scheduler is terminating.
    /// - `Eof` when every consumer of the packet's stream is finished.
    pub fn send(&self, pkt: &mut Packet, flags: DemuxSendFlags) -> Result<()> {
        let core = &self.sch.core;
        let d = &core.demux[self.idx];

        if d.waiter.wait(&core.terminate) {
            return Err(FrameFlowError::Exit);
        }

        // flush the downstreams after a seek
        let Some(stream_idx) = pkt.stream_index else {
            return demux_flush(&self.sch, self.idx, pkt);
        };

        if stream_idx >= d.streams.len() {
            return Err(FrameFlowError::Bug(format!(
                "packet for nonexistent stream {stream_idx}"
            )));
        }

        demux_send_for_stream(&self.sch, self.idx, stream_idx, Some(pkt), flags)
    }
}

fn demux_flush(sch: &Scheduler, demux_idx: usize, pkt: &mut Packet) -> Result<()> {
    let core = &sch.core;
    let d = &core.demux[demux_idx];

    if !pkt.is_flush() {
        return Err(FrameFlowError::Bug("flush packet must carry no data".into()));
    }

    let mut max_end_ts = Timestamp::NONE;

    let send_state = d.send_state.lock();
    for (stream_idx, stream) in d.streams.iter().enumerate() {
        for (dst_idx, dst) in stream.dst.iter().enumerate() {
            let SchedulerNode::DecoderIn { dec } = *dst else { continue };
            if send_state[stream_idx][dst_idx] {
                continue;
            }

            let dec = &core.dec[dec];
            dec.queue.send(0, Packet::default())?;

            if let Some(channel) = &dec.end_ts {
                let ts = channel.recv()?;

                let larger = match (max_end_ts.ts, ts.ts) {
                    (None, _) => true,
                    (Some(_), None) => false,
                    (Some(max), Some(new)) => {
                        compare_ts(max, max_end_ts.tb, new, ts.tb) == CmpOrdering::Less
                    }
                };
                if larger {
                    max_end_ts = ts;
                }
            }
        }
    }

    pkt.pts = max_end_ts.ts;
    pkt.time_base = max_end_ts.tb;

    Ok(())
}

fn demux_send_for_stream(
    sch: &Scheduler,
    demux_idx: usize,
    stream_idx: usize,
    mut pkt: Option<&mut Packet>,
    flags: DemuxSendFlags,
) -> Result<()> {
    let core = &sch.core;
    let d = &core.demux[demux_idx];
    let nb_dst = d.streams[stream_idx].dst.len();

    let mut send_state = d.send_state.lock();
    let mut nb_done = 0;

    for dst_idx in 0..nb_dst {
        let dst = d.streams[stream_idx].dst[dst_idx];

        // sending consumes the packet; all but the last destination get a
        // reference-counted clone
        let to_send = pkt.as_deref_mut().map(|p| {
            if dst_idx + 1 < nb_dst {
                p.clone()
            } else {
                p.take()
            }
        });

        let finished = &mut send_state[stream_idx][dst_idx];
        match demux_stream_send_to_dst(sch, dst, finished, to_send, flags) {
            Ok(()) => {}
            Err(FrameFlowError::Eof) => nb_done += 1,
            Err(err) => return Err(err),
        }
    }

    if nb_done == nb_dst {
        Err(FrameFlowError::Eof)
    } else {
        Ok(())
    }
}

fn demux_stream_send_to_dst(
    sch: &Scheduler,
    dst: SchedulerNode,
    finished: &mut bool,
    pkt: Option<Packet>,
    flags: DemuxSendFlags,
) -> Result<()> {
    let core = &sch.core;

    if *finished {
        return Err(FrameFlowError::Eof);
    }

    // a streamcopy output that hit its duration limit: muxers get EOF,
    // other destinations still get the packet
    let pkt = match (&dst, pkt) {
        (SchedulerNode::MuxStream { .. }, Some(_)) if flags.streamcopy_eof => None,
        (_, pkt) => pkt,
    };

    if let Some(pkt) = pkt {
        let ret = match dst {
            SchedulerNode::MuxStream { mux, stream } => send_to_mux(sch, mux, stream, Some(pkt)),
            SchedulerNode::DecoderIn { dec } => core.dec[dec].queue.send(0, pkt),
            other => Err(FrameFlowError::Bug(format!("demuxer connected to {other}"))),
        };
        match ret {
            Err(FrameFlowError::Eof) => {}
            other => return other,
        }
    } else {
        match dst {
            SchedulerNode::MuxStream { mux, stream } => {
                let _ = send_to_mux(sch, mux, stream, None);
            }
            SchedulerNode::DecoderIn { dec } => core.dec[dec].queue.send_finish(0),
            _ => {}
        }
        *finished = true;
        return Err(FrameFlowError::Eof);
    }

    // the destination reported EOF for a live packet: finish it
    match dst {
        SchedulerNode::MuxStream { mux, stream } => {
            let _ = send_to_mux(sch, mux, stream, None);
        }
        SchedulerNode::DecoderIn { dec } => core.dec[dec].queue.send_finish(0),
        _ => {}
    }
    *finished = true;
    Err(FrameFlowError::Eof)
}

pub(crate) fn demux_done(sch: &Scheduler, demux_idx: usize) -> Result<()> {
    let core = &sch.core;
    let d = &core.demux[demux_idx];

    let mut status = Ok(());
    for stream_idx in 0..d.streams.len() {
        let err =
            demux_send_for_stream(sch, demux_idx, stream_idx, None, DemuxSendFlags::default());
        if !matches!(err, Err(FrameFlowError::Eof)) {
            status = merge_status(status, err);
        }
    }

    let mut st = core.schedule.lock();
    st.demux[demux_idx].task_exited = true;
    core.schedule_update_locked(&mut st);

    status
}

impl DecoderContext {
    /// Receive the next packet to decode, overwriting `pkt`.
    ///
    /// An empty packet is a flush request with more packets to follow.
    /// When this decoder was created with `send_end_ts`, the call after a
    /// flush packet must carry the stream's post-flush end timestamp in
    /// `pkt.pts`/`pkt.time_base`; it is relayed back to the demuxer before
    /// the next packet is fetched.
    ///
    /// # Errors
    ///
    /// `Eof` when no more packets will arrive.
    pub fn receive(&self, pkt: &mut Packet) -> Result<()> {
        let core = &self.sch.core;
        let dec = &core.dec[self.idx];

        // the decoder delivered the post-flush end timestamp in pkt
        if dec.expect_end_ts.swap(false, Ordering::AcqRel) {
            let Some(channel) = &dec.end_ts else {
                return Err(FrameFlowError::Bug("end timestamp expected without channel".into()));
            };
            channel.send(Timestamp { ts: pkt.pts, tb: pkt.time_base })?;
        }

        match dec.queue.receive() {
            Received::Item { item, .. } => {
                *pkt = item;
                // a flush packet; the next call brings the end timestamp
                if pkt.is_flush() && dec.end_ts.is_some() {
                    dec.expect_end_ts.store(true, Ordering::Release);
                }
                Ok(())
            }
            Received::StreamEnd(_) | Received::Finished => Err(FrameFlowError::Eof),
        }
    }

    /// Send a decoded frame to all destinations of the given output.
    ///
    /// # Errors
    ///
    /// `Eof` when every destination of this output is finished.
    pub fn send(&self, out_idx: usize, frame: Frame) -> Result<()> {
        let core = &self.sch.core;
        let dec = &core.dec[self.idx];
        assert!(out_idx < dec.outputs.len());

        let nb_dst = dec.outputs[out_idx].len();
        let mut send_state = dec.send_state.lock();
        let mut frame = Some(frame);
        let mut nb_done = 0;

        for dst_idx in 0..nb_dst {
            let dst = dec.outputs[out_idx][dst_idx];
            let to_send = if dst_idx + 1 < nb_dst {
                frame.clone()
            } else {
                frame.take()
            };

            let finished = &mut send_state[out_idx][dst_idx];
            match dec_send_to_dst(&self.sch, dst, finished, to_send) {
                Ok(()) => {}
                Err(FrameFlowError::Eof) => nb_done += 1,
                Err(err) => return Err(err),
            }
        }

        if nb_done == nb_dst {
            Err(FrameFlowError::Eof)
        } else {
            Ok(())
        }
    }
}

fn dec_send_to_dst(
    sch: &Scheduler,
    dst: SchedulerNode,
    finished: &mut bool,
    frame: Option<Frame>,
) -> Result<()> {
    if *finished {
        return Err(FrameFlowError::Eof);
    }

    if let Some(frame) = frame {
        let ret = match dst {
            SchedulerNode::FilterIn { graph, input } => {
                send_to_filter(sch, graph, input, Some(frame))
            }
            SchedulerNode::Encoder { enc } => send_to_enc(sch, enc, Some(frame)),
            other => Err(FrameFlowError::Bug(format!("decoder connected to {other}"))),
        };
        match ret {
            Err(FrameFlowError::Eof) => {}
            other => return other,
        }
    }

    match dst {
        SchedulerNode::FilterIn { graph, input } => {
            let _ = send_to_filter(sch, graph, input, None);
        }
        SchedulerNode::Encoder { enc } => {
            let _ = send_to_enc(sch, enc, None);
        }
        _ => {}
    }
    *finished = true;
    Err(FrameFlowError::Eof)
}

pub(crate) fn dec_done(sch: &Scheduler, dec_idx: usize) -> Result<()> {
    let core = &sch.core;
    let dec = &core.dec[dec_idx];

    dec.queue.receive_finish(0);

    // the demuxer must not get stuck waiting for end timestamps that will
    // never arrive
    if let Some(channel) = &dec.end_ts {
        channel.close();
    }

    let mut status = Ok(());
    let mut send_state = dec.send_state.lock();
    for out_idx in 0..dec.outputs.len() {
        for dst_idx in 0..dec.outputs[out_idx].len() {
            let dst = dec.outputs[out_idx][dst_idx];
            let err = dec_send_to_dst(sch, dst, &mut send_state[out_idx][dst_idx], None);
            if !matches!(err, Err(FrameFlowError::Eof)) {
                status = merge_status(status, err);
            }
        }
    }

    status
}

pub(crate) fn send_to_filter(
    sch: &Scheduler,
    fg_idx: usize,
    in_idx: usize,
    frame: Option<Frame>,
) -> Result<()> {
    let fg = &sch.core.filters[fg_idx];

    if let Some(frame) = frame {
        return fg.queue.send(in_idx, frame);
    }

    if in_idx < fg.inputs.len() && !fg.inputs[in_idx].send_finished.swap(true, Ordering::AcqRel) {
        fg.queue.send_finish(in_idx);

        // close the control stream when all actual inputs are done
        if fg.nb_send_finished.fetch_add(1, Ordering::AcqRel) + 1 == fg.inputs.len() {
            fg.queue.send_finish(fg.inputs.len());
        }
    }
    Ok(())
}

impl FilterContext {
    /// Receive a frame for filtering.
    ///
    /// `in_idx` carries the input the filter most wants data on; it is the
    /// scheduler's throttling hint and is replaced with the input of the
    /// returned frame. A frame on index `nb_inputs` is a command frame.
    ///
    /// Pure-source graphs that need no input right now pass
    /// `in_idx == nb_inputs`; the call then parks on the graph's waiter
    /// and returns `Again` once filtering should resume.
    ///
    /// # Errors
    ///
    /// - `Again` after a pacing park (only with `in_idx == nb_inputs`).
    /// - `Eof` when no more frames will arrive.
    pub fn receive(&self, in_idx: &mut usize) -> Result<Frame> {
        let core = &self.sch.core;
        let fg = &core.filters[self.idx];
        let nb_inputs = fg.inputs.len();
        assert!(*in_idx <= nb_inputs);

        // account for the desired input, if it changed; this is the hook
        // that picks which upstream source gets unchoked
        {
            let mut st = core.schedule.lock();
            if st.filters[self.idx].best_input != *in_idx {
                st.filters[self.idx].best_input = *in_idx;
                core.schedule_update_locked(&mut st);
            }
        }

        if *in_idx == nb_inputs {
            return if fg.waiter.wait(&core.terminate) {
                Err(FrameFlowError::Eof)
            } else {
                Err(FrameFlowError::Again)
            };
        }

        loop {
            match fg.queue.receive() {
                Received::Item { stream, item } => {
                    *in_idx = stream;
                    return Ok(item);
                }
                Received::Finished => return Err(FrameFlowError::Eof),
                // per-stream EOFs are always preceded by an EOF frame from
                // the producer; nothing to report here
                Received::StreamEnd(_) => {}
            }
        }
    }

    /// Declare that this input will not be read anymore.
    pub fn receive_finish(&self, in_idx: usize) {
        let fg = &self.sch.core.filters[self.idx];
        assert!(in_idx < fg.inputs.len());

        let mut recv = fg.recv_state.lock();
        if !recv.receive_finished[in_idx] {
            recv.receive_finished[in_idx] = true;
            fg.queue.receive_finish(in_idx);

            // close the control stream when all actual inputs are done
            recv.nb_finished += 1;
            if recv.nb_finished == fg.inputs.len() {
                fg.queue.receive_finish(fg.inputs.len());
            }
        }
    }

    /// Send a filtered frame to the consumer of the given output; `None`
    /// signals that the output is done.
    ///
    /// # Errors
    ///
    /// `Eof` when the consumer is finished.
    pub fn send(&self, out_idx: usize, frame: Option<Frame>) -> Result<()> {
        let fg = &self.sch.core.filters[self.idx];
        assert!(out_idx < fg.outputs.len());

        match fg.outputs[out_idx] {
            SchedulerNode::Encoder { enc } => send_to_enc(&self.sch, enc, frame),
            SchedulerNode::FilterIn { graph, input } => {
                send_to_filter(&self.sch, graph, input, frame)
            }
            other => Err(FrameFlowError::Bug(format!("filter output connected to {other}"))),
        }
    }
}

pub(crate) fn filter_done(sch: &Scheduler, fg_idx: usize) -> Result<()> {
    let core = &sch.core;
    let fg = &core.filters[fg_idx];

    for in_idx in 0..=fg.inputs.len() {
        fg.queue.receive_finish(in_idx);
    }

    let mut status = Ok(());
    for out_idx in 0..fg.outputs.len() {
        let err = match fg.outputs[out_idx] {
            SchedulerNode::Encoder { enc } => send_to_enc(sch, enc, None),
            SchedulerNode::FilterIn { graph, input } => send_to_filter(sch, graph, input, None),
            _ => Ok(()),
        };
        if !matches!(err, Err(FrameFlowError::Eof)) {
            status = merge_status(status, err);
        }
    }

    let mut st = core.schedule.lock();
    st.filters[fg_idx].source.task_exited = true;
    core.schedule_update_locked(&mut st);

    status
}

fn enc_open(sch: &Scheduler, enc_idx: usize, frame: &Frame) -> Result<()> {
    let core = &sch.core;
    let enc = &core.enc[enc_idx];

    let Some(open_cb) = &enc.open_cb else { return Ok(()) };
    let frame_size = open_cb(sch, frame)?;

    // a positive frame size means the encoder wants fixed-size audio
    // frames, which only the sync queue can produce
    if frame_size > 0 {
        let Some((sq_idx, sq_stream)) = enc.sq else {
            return Err(FrameFlowError::Bug(
                "encoder requires a fixed frame size but has no sync queue".into(),
            ));
        };
        core.sq_enc[sq_idx].queue.lock().set_frame_samples(sq_stream, frame_size);
    }

    Ok(())
}

fn send_to_enc_thread(sch: &Scheduler, enc_idx: usize, frame: Option<Frame>) -> Result<()> {
    let enc = &sch.core.enc[enc_idx];

    let Some(frame) = frame else {
        enc.queue.send_finish(0);
        return Ok(());
    };

    if enc.in_finished.load(Ordering::Acquire) {
        return Err(FrameFlowError::Eof);
    }

    let ret = enc.queue.send(0, frame);
    if ret.is_err() {
        enc.in_finished.store(true, Ordering::Release);
    }
    ret
}

fn send_to_enc_sq(sch: &Scheduler, enc_idx: usize, frame: Option<Frame>) -> Result<()> {
    let core = &sch.core;
    let enc = &core.enc[enc_idx];
    let Some((sq_idx, sq_stream)) = enc.sq else {
        return Err(FrameFlowError::Bug("encoder has no sync queue".into()));
    };

    // the sync queue may hold the EOF back until other streams catch up,
    // but the scheduler must stop unchoking this path immediately
    if frame.is_none() {
        for dst in &enc.dst {
            let SchedulerNode::MuxStream { mux, stream } = dst else { continue };

            let mut st = core.schedule.lock();
            st.mux_streams[*mux][*stream].source_finished = true;
            core.schedule_update_locked(&mut st);
        }
    }

    let sq = &core.sq_enc[sq_idx];
    let mut queue = sq.queue.lock();

    // the stream runs in the time base of the frames entering it
    if let Some(frame) = &frame {
        if !queue.has_tb(sq_stream) {
            queue.set_tb(sq_stream, frame.time_base);
        }
    }

    queue.send(sq_stream, frame)?;

    let mut status = Ok(());
    loop {
        match queue.receive(None) {
            Ok((released_stream, item)) => {
                let dst_enc = sq.enc_idx[released_stream];
                match send_to_enc_thread(sch, dst_enc, Some(item)) {
                    Ok(()) => {}
                    Err(FrameFlowError::Eof) => {
                        // that encoder is done; finish its sync-queue
                        // stream and keep draining the others
                        let _ = queue.send(released_stream, None);
                    }
                    Err(err) => {
                        status = Err(err);
                        break;
                    }
                }
            }
            Err(FrameFlowError::Again) => break,
            Err(err) => {
                status = Err(err);
                break;
            }
        }
    }

    if status.is_err() {
        // close every encoder fed from this sync queue; a real error from
        // closing outranks a plain EOF
        for &other_enc in &sq.enc_idx {
            let err = send_to_enc_thread(sch, other_enc, None);
            status = merge_status(status, err);
        }
    }

    status
}

fn send_to_enc(sch: &Scheduler, enc_idx: usize, frame: Option<Frame>) -> Result<()> {
    let core = &sch.core;
    let enc = &core.enc[enc_idx];

    if let Some(frame) = &frame {
        if enc.open_cb.is_some() && !enc.opened.load(Ordering::Acquire) {
            enc_open(sch, enc_idx, frame)?;
            enc.opened.store(true, Ordering::Release);

            // discard empty frames that only carried init parameters
            if !frame.has_payload() {
                return Ok(());
            }
        }
    }

    if enc.sq.is_some() {
        send_to_enc_sq(sch, enc_idx, frame)
    } else {
        send_to_enc_thread(sch, enc_idx, frame)
    }
}

impl EncoderContext {
    /// Receive the next frame to encode.
    ///
    /// # Errors
    ///
    /// `Eof` when no more frames will arrive; the encoder should flush and
    /// terminate.
    pub fn receive(&self) -> Result<Frame> {
        let enc = &self.sch.core.enc[self.idx];
        match enc.queue.receive() {
            Received::Item { item, .. } => Ok(item),
            Received::StreamEnd(_) | Received::Finished => Err(FrameFlowError::Eof),
        }
    }

    /// Send an encoded packet to all destinations.
    ///
    /// Destinations that are already finished are skipped silently; the
    /// encoder learns about the end of its work from [`Self::receive`].
    ///
    /// # Errors
    ///
    /// Real failures only.
    pub fn send(&self, pkt: Packet) -> Result<()> {
        let core = &self.sch.core;
        let enc = &core.enc[self.idx];

        let nb_dst = enc.dst.len();
        let mut send_state = enc.send_state.lock();
        let mut pkt = Some(pkt);

        for dst_idx in 0..nb_dst {
            let dst = enc.dst[dst_idx];
            let to_send = if dst_idx + 1 < nb_dst { pkt.clone() } else { pkt.take() };

            match enc_send_to_dst(&self.sch, dst, &mut send_state[dst_idx], to_send) {
                Ok(()) | Err(FrameFlowError::Eof) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

fn enc_send_to_dst(
    sch: &Scheduler,
    dst: SchedulerNode,
    finished: &mut bool,
    pkt: Option<Packet>,
) -> Result<()> {
    let core = &sch.core;

    if *finished {
        return Err(FrameFlowError::Eof);
    }

    if let Some(pkt) = pkt {
        let ret = match dst {
            SchedulerNode::MuxStream { mux, stream } => send_to_mux(sch, mux, stream, Some(pkt)),
            // subtitle encode -> decode loopback
            SchedulerNode::DecoderIn { dec } => core.dec[dec].queue.send(0, pkt),
            other => Err(FrameFlowError::Bug(format!("encoder connected to {other}"))),
        };
        match ret {
            Err(FrameFlowError::Eof) => {}
            other => return other,
        }
    }

    match dst {
        SchedulerNode::MuxStream { mux, stream } => {
            let _ = send_to_mux(sch, mux, stream, None);
        }
        SchedulerNode::DecoderIn { dec } => core.dec[dec].queue.send_finish(0),
        _ => {}
    }
    *finished = true;
    Err(FrameFlowError::Eof)
}

pub(crate) fn enc_done(sch: &Scheduler, enc_idx: usize) -> Result<()> {
    let core = &sch.core;
    let enc = &core.enc[enc_idx];

    enc.queue.receive_finish(0);

    let mut status = Ok(());
    let mut send_state = enc.send_state.lock();
    for dst_idx in 0..enc.dst.len() {
        let err = enc_send_to_dst(sch, enc.dst[dst_idx], &mut send_state[dst_idx], None);
        if !matches!(err, Err(FrameFlowError::Eof)) {
            status = merge_status(status, err);
        }
    }

    status
}

fn send_to_mux(
    sch: &Scheduler,
    mux_idx: usize,
    stream_idx: usize,
    mut pkt: Option<Packet>,
) -> Result<()> {
    let core = &sch.core;
    let mux = &core.mux[mux_idx];

    let is_eof = pkt.is_none();
    let dts = pkt.as_ref().and_then(|p| {
        p.dts.map(|dts| {
            frameflow_core::rescale_q(dts + p.duration, p.time_base, frameflow_core::TIME_BASE_Q)
        })
    });

    // park the packet while the muxer cannot be started yet
    let mut queued = false;
    if !mux.mux_started.load(Ordering::Acquire) {
        let mut ready = core.mux_ready.lock();
        // the muxer could have started between the check and the lock,
        // in which case this falls through to the normal send path
        if !mux.mux_started.load(Ordering::Acquire) {
            ready.per_mux[mux_idx].premux[stream_idx].push(pkt.as_mut())?;
            queued = true;
        }
    }

    if !queued {
        match pkt {
            Some(pkt) => {
                if mux.streams[stream_idx].init_eof.load(Ordering::Relaxed) {
                    return Err(FrameFlowError::Eof);
                }
                mux.queue.send(stream_idx, pkt)?;
            }
            None => mux.queue.send_finish(stream_idx),
        }
    }

    if dts.is_some() || is_eof {
        let mut st = core.schedule.lock();
        if is_eof {
            st.mux_streams[mux_idx][stream_idx].source_finished = true;
        } else {
            st.mux_streams[mux_idx][stream_idx].last_dts = dts;
        }
        core.schedule_update_locked(&mut st);
    }

    Ok(())
}

impl MuxContext {
    /// Receive the next packet to mux, overwriting `pkt`. On success
    /// `pkt.stream_index` names the muxed stream.
    ///
    /// # Errors
    ///
    /// `Eof` with `pkt.stream_index == Some(i)` when stream `i` is done;
    /// `Eof` with `pkt.stream_index == None` when everything is done and
    /// the muxer should flush and terminate.
    pub fn receive(&self, pkt: &mut Packet) -> Result<()> {
        let mux = &self.sch.core.mux[self.idx];
        match mux.queue.receive() {
            Received::Item { stream, item } => {
                *pkt = item;
                pkt.stream_index = Some(stream);
                Ok(())
            }
            Received::StreamEnd(stream) => {
                pkt.reset();
                pkt.stream_index = Some(stream);
                Err(FrameFlowError::Eof)
            }
            Received::Finished => {
                pkt.reset();
                Err(FrameFlowError::Eof)
            }
        }
    }

    /// Declare that a stream will not accept any more packets.
    pub fn receive_finish(&self, stream_idx: usize) {
        let core = &self.sch.core;
        let mux = &core.mux[self.idx];
        assert!(stream_idx < mux.streams.len());

        mux.queue.receive_finish(stream_idx);

        let mut st = core.schedule.lock();
        st.mux_streams[self.idx][stream_idx].source_finished = true;
        core.schedule_update_locked(&mut st);
    }

    /// Forward a subtitle heartbeat (timing only, no payload) to the
    /// decoders registered for this stream.
    ///
    /// Delivery is best-effort: a heartbeat racing a closing decoder is
    /// dropped rather than failing the muxer.
    pub fn sub_heartbeat(&self, stream_idx: usize, pkt: &Packet) {
        let core = &self.sch.core;
        let mux = &core.mux[self.idx];
        assert!(stream_idx < mux.streams.len());

        for &dec_idx in &mux.streams[stream_idx].sub_heartbeat_dst {
            let _ = core.dec[dec_idx].queue.send(0, pkt.props());
        }
    }
}
