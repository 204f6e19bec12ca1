// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Topology assembly for the scheduler.
//!
//! A [`SchedulerBuilder`] collects nodes, edges and callbacks, then
//! [`SchedulerBuilder::start`] validates the graph, freezes it and spawns
//! the task threads. Because the builder is consumed, the topology is
//! immutable once the pipeline runs; there is no window where a task could
//! observe a half-built graph.
//!
//! All `add_*` methods return dense indices starting at 0, which stay valid
//! for the life of the scheduler and are how endpoints are addressed in
//! [`connect`](SchedulerBuilder::connect).

use crate::constants::{DEFAULT_FRAME_QUEUE_DEPTH, DEFAULT_PACKET_QUEUE_DEPTH};
use crate::graph::{check_acyclic, SchedulerNode};
use crate::premux::PreMuxQueue;
use crate::scheduler::{
    Core, DecTaskFn, DemuxTaskFn, EncTaskFn, FilterRecvState, FilterSched, FilterTaskFn,
    InitCallback, MuxReady, MuxReadyState, MuxStreamSched, MuxTaskFn, OpenCallback, Scheduler,
    SchDec, SchDemux, SchDemuxStream, SchEnc, SchFilterGraph, SchFilterIn, SchMux, SchMuxStream,
    SchSyncQueue, ScheduleState, SdpCallback, SourceSched, TaskSlot,
};
use crate::slot::SlotChannel;
use crate::sync_queue::SyncQueue;
use crate::thread_queue::ThreadQueue;
use crate::waiter::Waiter;
use frameflow_core::{Frame, FrameFlowError, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicUsize};

struct DemuxDef {
    func: DemuxTaskFn,
    streams: Vec<SmallVec<[SchedulerNode; 2]>>,
}

struct DecDef {
    func: DecTaskFn,
    src: Option<SchedulerNode>,
    outputs: Vec<SmallVec<[SchedulerNode; 2]>>,
    send_end_ts: bool,
}

struct EncDef {
    func: EncTaskFn,
    open_cb: Option<OpenCallback>,
    src: Option<SchedulerNode>,
    dst: SmallVec<[SchedulerNode; 2]>,
    sq: Option<(usize, usize)>,
}

struct FilterDef {
    func: FilterTaskFn,
    inputs: Vec<Option<SchedulerNode>>,
    outputs: Vec<Option<SchedulerNode>>,
}

struct MuxStreamDef {
    src: Option<SchedulerNode>,
    sub_heartbeat_dst: Vec<usize>,
    data_threshold: usize,
    max_packets: usize,
}

struct MuxDef {
    func: MuxTaskFn,
    init_cb: InitCallback,
    queue_size: usize,
    streams: Vec<MuxStreamDef>,
    nb_streams_ready: usize,
}

struct SqDef {
    queue: SyncQueue<Frame>,
    enc_idx: Vec<usize>,
}

/// Assembles a transcode pipeline; see the module docs.
pub struct SchedulerBuilder {
    demux: Vec<DemuxDef>,
    dec: Vec<DecDef>,
    enc: Vec<EncDef>,
    filters: Vec<FilterDef>,
    mux: Vec<MuxDef>,
    sq_enc: Vec<SqDef>,
    sdp_filename: Option<String>,
    sdp_auto: bool,
    sdp_cb: Option<SdpCallback>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            demux: Vec::new(),
            dec: Vec::new(),
            enc: Vec::new(),
            filters: Vec::new(),
            mux: Vec::new(),
            sq_enc: Vec::new(),
            sdp_filename: None,
            sdp_auto: true,
            sdp_cb: None,
        }
    }

    /// Add a demuxer running `func`; returns its index.
    pub fn add_demux(
        &mut self,
        func: impl FnOnce(crate::DemuxContext) -> Result<()> + Send + 'static,
    ) -> usize {
        self.demux.push(DemuxDef { func: Box::new(func), streams: Vec::new() });
        self.demux.len() - 1
    }

    /// Add a demuxed stream to a demuxer; returns the stream index.
    pub fn add_demux_stream(&mut self, demux_idx: usize) -> usize {
        let d = &mut self.demux[demux_idx];
        d.streams.push(SmallVec::new());
        d.streams.len() - 1
    }

    /// Add a decoder running `func`; one default output is created.
    ///
    /// With `send_end_ts`, the decoder participates in the loop-flush
    /// handshake: after each flush packet it reports the stream's end
    /// timestamp back to its demuxer.
    pub fn add_dec(
        &mut self,
        func: impl FnOnce(crate::DecoderContext) -> Result<()> + Send + 'static,
        send_end_ts: bool,
    ) -> usize {
        self.dec.push(DecDef {
            func: Box::new(func),
            src: None,
            outputs: vec![SmallVec::new()],
            send_end_ts,
        });
        self.dec.len() - 1
    }

    /// Add another output to a decoder (e.g. for multiview video).
    pub fn add_dec_output(&mut self, dec_idx: usize) -> usize {
        let dec = &mut self.dec[dec_idx];
        dec.outputs.push(SmallVec::new());
        dec.outputs.len() - 1
    }

    /// Add a filter graph with the given number of inputs and outputs.
    pub fn add_filtergraph(
        &mut self,
        nb_inputs: usize,
        nb_outputs: usize,
        func: impl FnOnce(crate::FilterContext) -> Result<()> + Send + 'static,
    ) -> usize {
        self.filters.push(FilterDef {
            func: Box::new(func),
            inputs: vec![None; nb_inputs],
            outputs: vec![None; nb_outputs],
        });
        self.filters.len() - 1
    }

    /// Add an encoder.
    ///
    /// `open_cb` is invoked with the first frame delivered to the encoder;
    /// for audio encoders with a fixed frame size it must return that size
    /// in samples, otherwise 0.
    pub fn add_enc(
        &mut self,
        func: impl FnOnce(crate::EncoderContext) -> Result<()> + Send + 'static,
        open_cb: impl Fn(&Scheduler, &Frame) -> Result<usize> + Send + Sync + 'static,
    ) -> usize {
        self.enc.push(EncDef {
            func: Box::new(func),
            open_cb: Some(Box::new(open_cb)),
            src: None,
            dst: SmallVec::new(),
            sq: None,
        });
        self.enc.len() - 1
    }

    /// Add a muxer. `init_cb` writes the container header once all the
    /// muxer's streams are ready.
    ///
    /// `queue_size` is the runtime packet queue depth; 0 selects the
    /// default depth. `sdp_auto` opts this muxer into automatic session
    /// description writing; the SDP barrier is active when every muxer
    /// opts in or an SDP path is set explicitly.
    pub fn add_mux(
        &mut self,
        func: impl FnOnce(crate::MuxContext) -> Result<()> + Send + 'static,
        init_cb: impl Fn() -> Result<()> + Send + Sync + 'static,
        sdp_auto: bool,
        queue_size: usize,
    ) -> usize {
        self.mux.push(MuxDef {
            func: Box::new(func),
            init_cb: Box::new(init_cb),
            queue_size,
            streams: Vec::new(),
            nb_streams_ready: 0,
        });
        self.sdp_auto &= sdp_auto;
        self.mux.len() - 1
    }

    /// Add a muxed stream to a muxer; returns the stream index.
    pub fn add_mux_stream(&mut self, mux_idx: usize) -> usize {
        let mux = &mut self.mux[mux_idx];
        mux.streams.push(MuxStreamDef {
            src: None,
            sub_heartbeat_dst: Vec::new(),
            data_threshold: 0,
            max_packets: 0,
        });
        mux.streams.len() - 1
    }

    /// Configure pre-mux buffering limits for a muxed stream: past
    /// `data_threshold` buffered bytes, at most `max_packets` packets are
    /// held before producers see an error.
    pub fn mux_stream_buffering(
        &mut self,
        mux_idx: usize,
        stream_idx: usize,
        data_threshold: usize,
        max_packets: usize,
    ) {
        let ms = &mut self.mux[mux_idx].streams[stream_idx];
        ms.data_threshold = data_threshold;
        ms.max_packets = max_packets;
    }

    /// Mark a muxed stream ready before the pipeline starts (streamcopy
    /// streams, whose parameters are known up front).
    pub fn mux_stream_ready(&mut self, mux_idx: usize, stream_idx: usize) {
        let mux = &mut self.mux[mux_idx];
        assert!(stream_idx < mux.streams.len());
        assert!(mux.nb_streams_ready < mux.streams.len());
        mux.nb_streams_ready += 1;
    }

    /// Register a decoder to receive subtitle heartbeats whenever a packet
    /// is muxed for the given stream.
    pub fn mux_sub_heartbeat_add(&mut self, mux_idx: usize, stream_idx: usize, dec_idx: usize) {
        assert!(dec_idx < self.dec.len());
        self.mux[mux_idx].streams[stream_idx].sub_heartbeat_dst.push(dec_idx);
    }

    /// Set the session description path; setting it activates the SDP
    /// barrier regardless of per-muxer `sdp_auto`.
    pub fn sdp_filename(&mut self, path: impl Into<String>) {
        self.sdp_filename = Some(path.into());
    }

    /// Register the callback that writes the session description once all
    /// muxer headers are written.
    pub fn sdp_writer(
        &mut self,
        cb: impl Fn(Option<&str>) -> Result<()> + Send + Sync + 'static,
    ) {
        self.sdp_cb = Some(Box::new(cb));
    }

    /// Add a pre-encoding sync queue buffering at most `buf_size_us`
    /// microseconds; returns its index.
    pub fn add_sq_enc(&mut self, buf_size_us: i64) -> usize {
        self.sq_enc.push(SqDef { queue: SyncQueue::new(buf_size_us), enc_idx: Vec::new() });
        self.sq_enc.len() - 1
    }

    /// Bind an encoder to a sync queue. Frames for the encoder then pass
    /// through the queue for cross-stream pacing; `max_frames` caps its
    /// output (`u64::MAX` for no limit).
    ///
    /// # Errors
    ///
    /// `Configuration` when the encoder is already bound to a sync queue.
    pub fn sq_add_enc(
        &mut self,
        sq_idx: usize,
        enc_idx: usize,
        limiting: bool,
        max_frames: u64,
    ) -> Result<()> {
        assert!(sq_idx < self.sq_enc.len());
        assert!(enc_idx < self.enc.len());

        if self.enc[enc_idx].sq.is_some() {
            return Err(FrameFlowError::Configuration(format!(
                "encoder {enc_idx} is already bound to a sync queue"
            )));
        }

        let sq = &mut self.sq_enc[sq_idx];
        let stream = sq.queue.add_stream(limiting);
        sq.enc_idx.push(enc_idx);
        if max_frames != u64::MAX {
            sq.queue.limit_frames(stream, max_frames);
        }

        self.enc[enc_idx].sq = Some((sq_idx, stream));
        Ok(())
    }

    /// Connect two endpoints. Singular destinations (decoder and encoder
    /// inputs, filter inputs, muxed streams) accept exactly one source.
    ///
    /// # Errors
    ///
    /// `Configuration` for illegal edge types or a second source on a
    /// singular destination.
    pub fn connect(&mut self, src: SchedulerNode, dst: SchedulerNode) -> Result<()> {
        if !src.can_feed(&dst) {
            tracing::error!("cannot connect {src} to {dst}");
            return Err(FrameFlowError::Configuration(format!(
                "cannot connect {src} to {dst}"
            )));
        }

        // record the edge on the source side
        match src {
            SchedulerNode::DemuxStream { demux, stream } => {
                self.demux[demux].streams[stream].push(dst);
            }
            SchedulerNode::DecoderOut { dec, output } => {
                self.dec[dec].outputs[output].push(dst);
            }
            SchedulerNode::FilterOut { graph, output } => {
                let slot = &mut self.filters[graph].outputs[output];
                if slot.is_some() {
                    return Err(already_connected(src));
                }
                *slot = Some(dst);
            }
            SchedulerNode::Encoder { enc } => {
                self.enc[enc].dst.push(dst);
            }
            _ => unreachable!("can_feed admits no other source kinds"),
        }

        // record the source on the destination side
        let slot = match dst {
            SchedulerNode::DecoderIn { dec } => &mut self.dec[dec].src,
            SchedulerNode::Encoder { enc } => &mut self.enc[enc].src,
            SchedulerNode::FilterIn { graph, input } => &mut self.filters[graph].inputs[input],
            SchedulerNode::MuxStream { mux, stream } => &mut self.mux[mux].streams[stream].src,
            _ => unreachable!("can_feed admits no other destination kinds"),
        };
        if slot.is_some() {
            return Err(already_connected(dst));
        }
        *slot = Some(src);

        Ok(())
    }

    /// Validate the topology, freeze it, spawn the task threads and run
    /// the initial schedule update.
    ///
    /// # Errors
    ///
    /// `Configuration` for unconnected endpoints or a cyclic graph; any
    /// failure from header callbacks or thread spawning. On failure,
    /// everything already started is stopped again.
    pub fn start(self) -> Result<Scheduler> {
        let core = self.into_core()?;
        let sch = Scheduler::from_core(core);

        if let Err(err) = sch.start_runtime() {
            let _ = sch.stop();
            return Err(err);
        }

        Ok(sch)
    }

    #[allow(clippy::too_many_lines)]
    fn into_core(self) -> Result<Core> {
        let Self { demux, dec, enc, filters, mux, sq_enc, sdp_filename, sdp_auto, sdp_cb } = self;

        let mut sched_demux = Vec::with_capacity(demux.len());
        for (idx, def) in demux.into_iter().enumerate() {
            for (stream_idx, stream) in def.streams.iter().enumerate() {
                if stream.is_empty() {
                    tracing::error!("demuxer {idx} stream {stream_idx} not connected to any sink");
                    return Err(FrameFlowError::Configuration(format!(
                        "demuxer {idx} stream {stream_idx} not connected to any sink"
                    )));
                }
            }

            let send_state = def.streams.iter().map(|s| vec![false; s.len()]).collect();
            sched_demux.push(SchDemux {
                streams: def
                    .streams
                    .into_iter()
                    .map(|dst| SchDemuxStream { dst })
                    .collect(),
                waiter: Waiter::new(),
                send_state: Mutex::new(send_state),
                task: TaskSlot::new(def.func),
            });
        }

        let mut sched_dec = Vec::with_capacity(dec.len());
        for (idx, def) in dec.into_iter().enumerate() {
            let Some(src) = def.src else {
                tracing::error!("decoder {idx} not connected to a source");
                return Err(FrameFlowError::Configuration(format!(
                    "decoder {idx} not connected to a source"
                )));
            };
            for (out_idx, out) in def.outputs.iter().enumerate() {
                if out.is_empty() {
                    tracing::error!("decoder {idx} output {out_idx} not connected to any sink");
                    return Err(FrameFlowError::Configuration(format!(
                        "decoder {idx} output {out_idx} not connected to any sink"
                    )));
                }
            }

            let send_state = def.outputs.iter().map(|o| vec![false; o.len()]).collect();
            sched_dec.push(SchDec {
                src,
                outputs: def.outputs,
                queue: ThreadQueue::new(1, DEFAULT_PACKET_QUEUE_DEPTH),
                end_ts: def.send_end_ts.then(SlotChannel::new),
                expect_end_ts: AtomicBool::new(false),
                send_state: Mutex::new(send_state),
                task: TaskSlot::new(def.func),
            });
        }

        let mut sched_enc = Vec::with_capacity(enc.len());
        for (idx, def) in enc.into_iter().enumerate() {
            let Some(src) = def.src else {
                tracing::error!("encoder {idx} not connected to a source");
                return Err(FrameFlowError::Configuration(format!(
                    "encoder {idx} not connected to a source"
                )));
            };
            if def.dst.is_empty() {
                tracing::error!("encoder {idx} not connected to any sink");
                return Err(FrameFlowError::Configuration(format!(
                    "encoder {idx} not connected to any sink"
                )));
            }

            let nb_dst = def.dst.len();
            sched_enc.push(SchEnc {
                src,
                dst: def.dst,
                sq: def.sq,
                open_cb: def.open_cb,
                opened: AtomicBool::new(false),
                queue: ThreadQueue::new(1, DEFAULT_FRAME_QUEUE_DEPTH),
                in_finished: AtomicBool::new(false),
                send_state: Mutex::new(vec![false; nb_dst]),
                task: TaskSlot::new(def.func),
            });
        }

        let mut sched_filters = Vec::with_capacity(filters.len());
        for (idx, def) in filters.into_iter().enumerate() {
            let nb_inputs = def.inputs.len();
            let mut inputs = Vec::with_capacity(nb_inputs);
            for (in_idx, input) in def.inputs.into_iter().enumerate() {
                let Some(src) = input else {
                    tracing::error!("filter graph {idx} input {in_idx} not connected to a source");
                    return Err(FrameFlowError::Configuration(format!(
                        "filter graph {idx} input {in_idx} not connected to a source"
                    )));
                };

                let src_sched = match src {
                    SchedulerNode::FilterOut { .. } => src,
                    SchedulerNode::DecoderOut { dec, .. } => {
                        match sched_dec[dec].src {
                            s @ SchedulerNode::DemuxStream { .. } => s,
                            // decoder looped back from an encoder: pace on
                            // whatever feeds that encoder
                            SchedulerNode::Encoder { enc } => sched_enc[enc].src,
                            other => {
                                return Err(FrameFlowError::Bug(format!(
                                    "decoder {dec} has unexpected source {other}"
                                )))
                            }
                        }
                    }
                    other => {
                        return Err(FrameFlowError::Bug(format!(
                            "filter input has unexpected source {other}"
                        )))
                    }
                };

                inputs.push(SchFilterIn {
                    src,
                    src_sched,
                    send_finished: AtomicBool::new(false),
                });
            }

            let mut outputs = Vec::with_capacity(def.outputs.len());
            for (out_idx, output) in def.outputs.into_iter().enumerate() {
                let Some(dst) = output else {
                    tracing::error!("filter graph {idx} output {out_idx} not connected to a sink");
                    return Err(FrameFlowError::Configuration(format!(
                        "filter graph {idx} output {out_idx} not connected to a sink"
                    )));
                };
                outputs.push(dst);
            }

            sched_filters.push(SchFilterGraph {
                inputs,
                outputs,
                queue: ThreadQueue::new(nb_inputs + 1, DEFAULT_FRAME_QUEUE_DEPTH),
                waiter: Waiter::new(),
                nb_send_finished: AtomicUsize::new(0),
                recv_state: Mutex::new(FilterRecvState {
                    receive_finished: vec![false; nb_inputs],
                    nb_finished: 0,
                }),
                task: TaskSlot::new(def.func),
            });
        }

        let mut sched_mux = Vec::with_capacity(mux.len());
        let mut ready = MuxReadyState { nb_mux_ready: 0, per_mux: Vec::with_capacity(mux.len()) };
        for (idx, def) in mux.into_iter().enumerate() {
            let mut streams = Vec::with_capacity(def.streams.len());
            let mut premux = Vec::with_capacity(def.streams.len());

            for (stream_idx, ms) in def.streams.into_iter().enumerate() {
                let Some(src) = ms.src else {
                    tracing::error!("muxer {idx} stream {stream_idx} not connected to a source");
                    return Err(FrameFlowError::Configuration(format!(
                        "muxer {idx} stream {stream_idx} not connected to a source"
                    )));
                };

                let src_sched = match src {
                    SchedulerNode::DemuxStream { .. } => src,
                    SchedulerNode::Encoder { enc } => match sched_enc[enc].src {
                        SchedulerNode::DecoderOut { dec, .. } => {
                            let s = sched_dec[dec].src;
                            if !matches!(s, SchedulerNode::DemuxStream { .. }) {
                                return Err(FrameFlowError::Bug(format!(
                                    "decoder {dec} has unexpected source {s}"
                                )));
                            }
                            s
                        }
                        s @ SchedulerNode::FilterOut { .. } => s,
                        other => {
                            return Err(FrameFlowError::Bug(format!(
                                "encoder {enc} has unexpected source {other}"
                            )))
                        }
                    },
                    other => {
                        return Err(FrameFlowError::Bug(format!(
                            "muxed stream has unexpected source {other}"
                        )))
                    }
                };

                let mut queue = PreMuxQueue::new();
                queue.set_limits(ms.data_threshold, ms.max_packets);
                premux.push(queue);

                streams.push(SchMuxStream {
                    src,
                    src_sched,
                    sub_heartbeat_dst: ms.sub_heartbeat_dst,
                    init_eof: AtomicBool::new(false),
                });
            }

            let queue_size = if def.queue_size == 0 {
                DEFAULT_PACKET_QUEUE_DEPTH
            } else {
                def.queue_size
            };

            ready.per_mux.push(MuxReady { nb_streams_ready: def.nb_streams_ready, premux });
            sched_mux.push(SchMux {
                queue: ThreadQueue::new(streams.len(), queue_size),
                streams,
                init_cb: def.init_cb,
                mux_started: AtomicBool::new(false),
                task: TaskSlot::new(def.func),
            });
        }

        // the transcoding graph must not contain cycles
        let graph_inputs: Vec<Vec<SchedulerNode>> = sched_filters
            .iter()
            .map(|fg| fg.inputs.iter().map(|fi| fi.src_sched).collect())
            .collect();
        check_acyclic(&graph_inputs)?;

        let schedule = ScheduleState {
            mux_streams: sched_mux
                .iter()
                .map(|m| {
                    m.streams
                        .iter()
                        .map(|_| MuxStreamSched { last_dts: None, source_finished: false })
                        .collect()
                })
                .collect(),
            demux: sched_demux.iter().map(|_| SourceSched::default()).collect(),
            filters: sched_filters
                .iter()
                .map(|_| FilterSched { source: SourceSched::default(), best_input: 0 })
                .collect(),
        };

        let sq_enc = sq_enc
            .into_iter()
            .map(|def| SchSyncQueue { queue: Mutex::new(def.queue), enc_idx: def.enc_idx })
            .collect();

        Ok(Core::new(
            sched_demux,
            sched_dec,
            sched_enc,
            sched_filters,
            sched_mux,
            sq_enc,
            sdp_filename,
            sdp_auto,
            sdp_cb,
            schedule,
            ready,
        ))
    }
}

fn already_connected(node: SchedulerNode) -> FrameFlowError {
    tracing::error!("{node} already has a connection");
    FrameFlowError::Configuration(format!("{node} already has a connection"))
}
