// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The runtime scheduler: task lifecycle and flow control.
//!
//! A [`Scheduler`] is produced by
//! [`SchedulerBuilder::start`](crate::SchedulerBuilder::start) with the
//! topology already frozen. Every node runs a caller-supplied function on a
//! dedicated OS thread and talks only to the scheduler, which is the single
//! place that knows the whole pipeline.
//!
//! Flow control works on the *trailing DTS*: the smallest end timestamp any
//! active output stream has reached. Sources feeding streams that are more
//! than [`SCHEDULE_TOLERANCE_US`](crate::constants::SCHEDULE_TOLERANCE_US)
//! ahead of it are choked; everything else self-throttles on its bounded
//! input queue. All choke bookkeeping lives inside one mutex
//! ([`ScheduleState`]) so decisions always see a consistent snapshot.
//!
//! Muxer threads have a delayed start: a muxer only begins reading once all
//! of its streams are ready and its header callback ran. When an SDP is
//! wanted, no muxer starts until every header is written and the SDP
//! callback has run, with all muxers quiescent.

use crate::constants::SCHEDULE_TOLERANCE_US;
use crate::graph::SchedulerNode;
use crate::io::{
    dec_done, demux_done, enc_done, filter_done, send_to_filter, DecoderContext, DemuxContext,
    EncoderContext, FilterContext, MuxContext,
};
use crate::premux::{PreMuxHead, PreMuxQueue};
use crate::slot::SlotChannel;
use crate::sync_queue::SyncQueue;
use crate::thread_queue::ThreadQueue;
use crate::waiter::Waiter;
use frameflow_core::{
    compare_ts, merge_status, task_exit_status, Frame, FrameFlowError, Packet, Result, Timestamp,
};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Sentinel for "no timestamp" in the atomic trailing-DTS snapshot.
const NO_DTS: i64 = i64::MIN;

// Task functions: one closure per node, consumed when its thread starts.
pub type DemuxTaskFn = Box<dyn FnOnce(DemuxContext) -> Result<()> + Send + 'static>;
pub type DecTaskFn = Box<dyn FnOnce(DecoderContext) -> Result<()> + Send + 'static>;
pub type FilterTaskFn = Box<dyn FnOnce(FilterContext) -> Result<()> + Send + 'static>;
pub type EncTaskFn = Box<dyn FnOnce(EncoderContext) -> Result<()> + Send + 'static>;
pub type MuxTaskFn = Box<dyn FnOnce(MuxContext) -> Result<()> + Send + 'static>;

/// Writes the container header for a muxer once all its streams are ready.
pub type InitCallback = Box<dyn Fn() -> Result<()> + Send + Sync + 'static>;
/// Opens an encoder on its first frame; returns the fixed audio frame size
/// in samples, or 0 when the encoder has no fixed frame size.
pub type OpenCallback = Box<dyn Fn(&Scheduler, &Frame) -> Result<usize> + Send + Sync + 'static>;
/// Writes the session description once all muxer headers are written.
pub type SdpCallback = Box<dyn Fn(Option<&str>) -> Result<()> + Send + Sync + 'static>;

pub(crate) struct TaskSlot<F> {
    state: Mutex<TaskState<F>>,
}

struct TaskState<F> {
    func: Option<F>,
    join: Option<JoinHandle<Result<()>>>,
}

impl<F> TaskSlot<F> {
    pub(crate) fn new(func: F) -> Self {
        Self { state: Mutex::new(TaskState { func: Some(func), join: None }) }
    }

    fn take_func(&self) -> Option<F> {
        self.state.lock().func.take()
    }

    fn set_join(&self, join: JoinHandle<Result<()>>) {
        self.state.lock().join = Some(join);
    }

    fn take_join(&self) -> Option<JoinHandle<Result<()>>> {
        self.state.lock().join.take()
    }
}

pub(crate) struct SchDemuxStream {
    pub(crate) dst: SmallVec<[SchedulerNode; 2]>,
}

pub(crate) struct SchDemux {
    pub(crate) streams: Vec<SchDemuxStream>,
    pub(crate) waiter: Waiter,
    /// Per-stream, per-destination finished flags; touched only by the
    /// demuxer task and its cleanup.
    pub(crate) send_state: Mutex<Vec<Vec<bool>>>,
    pub(crate) task: TaskSlot<DemuxTaskFn>,
}

pub(crate) struct SchDec {
    pub(crate) src: SchedulerNode,
    pub(crate) outputs: Vec<SmallVec<[SchedulerNode; 2]>>,
    /// Input packets, one sub-stream.
    pub(crate) queue: ThreadQueue<Packet>,
    /// Channel carrying the post-flush end timestamp back to the demuxer.
    pub(crate) end_ts: Option<SlotChannel<Timestamp>>,
    /// The next receive call must publish the end timestamp first.
    pub(crate) expect_end_ts: AtomicBool,
    /// Per-output, per-destination finished flags.
    pub(crate) send_state: Mutex<Vec<Vec<bool>>>,
    pub(crate) task: TaskSlot<DecTaskFn>,
}

pub(crate) struct SchEnc {
    pub(crate) src: SchedulerNode,
    pub(crate) dst: SmallVec<[SchedulerNode; 2]>,
    /// Sync queue binding: (queue index, stream index within the queue).
    pub(crate) sq: Option<(usize, usize)>,
    pub(crate) open_cb: Option<OpenCallback>,
    pub(crate) opened: AtomicBool,
    /// Input frames, one sub-stream.
    pub(crate) queue: ThreadQueue<Frame>,
    /// Sending into the queue reported EOF.
    pub(crate) in_finished: AtomicBool,
    pub(crate) send_state: Mutex<Vec<bool>>,
    pub(crate) task: TaskSlot<EncTaskFn>,
}

pub(crate) struct SchMuxStream {
    pub(crate) src: SchedulerNode,
    /// Nearest choke-able node upstream (a demuxer stream or a filter
    /// output); resolved when the scheduler starts.
    pub(crate) src_sched: SchedulerNode,
    /// Decoders receiving subtitle heartbeats for this stream.
    pub(crate) sub_heartbeat_dst: Vec<usize>,
    /// An EOF was generated while draining the pre-mux queue.
    pub(crate) init_eof: AtomicBool,
}

pub(crate) struct SchMux {
    pub(crate) streams: Vec<SchMuxStream>,
    pub(crate) init_cb: InitCallback,
    pub(crate) queue: ThreadQueue<Packet>,
    /// Set once the muxer thread runs and the pre-mux queues are drained.
    pub(crate) mux_started: AtomicBool,
    pub(crate) task: TaskSlot<MuxTaskFn>,
}

pub(crate) struct SchFilterIn {
    pub(crate) src: SchedulerNode,
    pub(crate) src_sched: SchedulerNode,
    pub(crate) send_finished: AtomicBool,
}

pub(crate) struct FilterRecvState {
    pub(crate) receive_finished: Vec<bool>,
    pub(crate) nb_finished: usize,
}

pub(crate) struct SchFilterGraph {
    pub(crate) inputs: Vec<SchFilterIn>,
    pub(crate) outputs: Vec<SchedulerNode>,
    /// Input frames; `nb_inputs + 1` sub-streams, the last one carries
    /// filter commands.
    pub(crate) queue: ThreadQueue<Frame>,
    pub(crate) waiter: Waiter,
    pub(crate) nb_send_finished: AtomicUsize,
    pub(crate) recv_state: Mutex<FilterRecvState>,
    pub(crate) task: TaskSlot<FilterTaskFn>,
}

pub(crate) struct SchSyncQueue {
    pub(crate) queue: Mutex<SyncQueue<Frame>>,
    /// Encoder index for each sync-queue stream.
    pub(crate) enc_idx: Vec<usize>,
}

/// Per-mux-stream flow-control state.
pub(crate) struct MuxStreamSched {
    /// dts+duration of the last packet sent, in the canonical time base.
    pub(crate) last_dts: Option<i64>,
    /// This stream no longer accepts input.
    pub(crate) source_finished: bool,
}

/// Choke bookkeeping for a demuxer or filter graph.
#[derive(Default)]
pub(crate) struct SourceSched {
    pub(crate) task_exited: bool,
    choked_prev: bool,
    choked_next: bool,
}

pub(crate) struct FilterSched {
    pub(crate) source: SourceSched,
    /// The input the filter most wants data on; `nb_inputs` when it is
    /// running from internal sources.
    pub(crate) best_input: usize,
}

/// Everything the schedule lock protects, as one unit.
pub(crate) struct ScheduleState {
    /// Indexed `[mux][stream]`.
    pub(crate) mux_streams: Vec<Vec<MuxStreamSched>>,
    pub(crate) demux: Vec<SourceSched>,
    pub(crate) filters: Vec<FilterSched>,
}

pub(crate) struct MuxReady {
    pub(crate) nb_streams_ready: usize,
    pub(crate) premux: Vec<PreMuxQueue>,
}

pub(crate) struct MuxReadyState {
    pub(crate) nb_mux_ready: usize,
    pub(crate) per_mux: Vec<MuxReady>,
}

pub(crate) struct FinishState {
    pub(crate) nb_mux_done: usize,
    pub(crate) task_failed: bool,
}

pub(crate) struct Core {
    pub(crate) demux: Vec<SchDemux>,
    pub(crate) dec: Vec<SchDec>,
    pub(crate) enc: Vec<SchEnc>,
    pub(crate) filters: Vec<SchFilterGraph>,
    pub(crate) mux: Vec<SchMux>,
    pub(crate) sq_enc: Vec<SchSyncQueue>,

    pub(crate) sdp_filename: Option<String>,
    pub(crate) sdp_auto: bool,
    pub(crate) sdp_cb: Option<SdpCallback>,

    pub(crate) terminate: AtomicBool,
    pub(crate) schedule: Mutex<ScheduleState>,
    /// Snapshot of the trailing DTS for observers; `NO_DTS` when unset.
    pub(crate) last_dts: AtomicI64,
    pub(crate) mux_ready: Mutex<MuxReadyState>,
    pub(crate) finish: Mutex<FinishState>,
    pub(crate) finish_cond: Condvar,
    stopped: Mutex<bool>,
}

impl Core {
    pub(crate) fn new(
        demux: Vec<SchDemux>,
        dec: Vec<SchDec>,
        enc: Vec<SchEnc>,
        filters: Vec<SchFilterGraph>,
        mux: Vec<SchMux>,
        sq_enc: Vec<SchSyncQueue>,
        sdp_filename: Option<String>,
        sdp_auto: bool,
        sdp_cb: Option<SdpCallback>,
        schedule: ScheduleState,
        mux_ready: MuxReadyState,
    ) -> Self {
        Self {
            demux,
            dec,
            enc,
            filters,
            mux,
            sq_enc,
            sdp_filename,
            sdp_auto,
            sdp_cb,
            terminate: AtomicBool::new(false),
            schedule: Mutex::new(schedule),
            last_dts: AtomicI64::new(NO_DTS),
            mux_ready: Mutex::new(mux_ready),
            finish: Mutex::new(FinishState { nb_mux_done: 0, task_failed: false }),
            finish_cond: Condvar::new(),
            stopped: Mutex::new(false),
        }
    }

    fn sdp_wanted(&self) -> bool {
        self.sdp_filename.is_some() || self.sdp_auto
    }

    /// Minimum `last_dts` over mux streams, in the canonical time base.
    ///
    /// `None` as soon as any considered stream has not produced yet.
    pub(crate) fn trailing_dts(&self, st: &ScheduleState, count_finished: bool) -> Option<i64> {
        let mut min_dts: Option<i64> = None;

        for mux in &st.mux_streams {
            for ms in mux {
                if ms.source_finished && !count_finished {
                    continue;
                }
                let dts = ms.last_dts?;
                min_dts = Some(min_dts.map_or(dts, |min| min.min(dts)));
            }
        }

        min_dts
    }

    /// Walk from a mux stream's scheduling source to the node to unchoke.
    fn unchoke_for_stream(&self, st: &mut ScheduleState, mut src: SchedulerNode) {
        loop {
            match src {
                // fed directly by a demuxer, not through a filter graph
                SchedulerNode::DemuxStream { demux, .. } => {
                    st.demux[demux].choked_next = false;
                    return;
                }
                SchedulerNode::FilterOut { graph, .. } => {
                    let fg = &self.filters[graph];
                    let fs = &mut st.filters[graph];

                    // the filter graph runs from internal sources and asked
                    // to be scheduled directly
                    if fs.best_input == fg.inputs.len() {
                        fs.source.choked_next = false;
                        return;
                    }

                    src = fg.inputs[fs.best_input].src_sched;
                }
                other => {
                    debug_assert!(false, "unexpected scheduling source: {other}");
                    return;
                }
            }
        }
    }

    /// Recompute which sources may produce. Must hold the schedule lock.
    pub(crate) fn schedule_update_locked(&self, st: &mut ScheduleState) {
        // on termination all waiters stay choked; stop() handles wakeups
        if self.terminate.load(Ordering::Acquire) {
            return;
        }

        let dts = self.trailing_dts(st, false);
        self.last_dts.store(dts.unwrap_or(NO_DTS), Ordering::Release);

        for (idx, d) in st.demux.iter_mut().enumerate() {
            d.choked_prev = self.demux[idx].waiter.is_choked();
            d.choked_next = true;
        }
        for (idx, f) in st.filters.iter_mut().enumerate() {
            f.source.choked_prev = self.filters[idx].waiter.is_choked();
            f.source.choked_next = true;
        }

        // unblock sources for output streams that are neither finished nor
        // too far ahead of the trailing stream
        let mut have_unchoked = false;
        for (mux_idx, mux) in self.mux.iter().enumerate() {
            for (stream_idx, ms) in mux.streams.iter().enumerate() {
                let sched = &st.mux_streams[mux_idx][stream_idx];
                if sched.source_finished {
                    continue;
                }
                match (dts, sched.last_dts) {
                    (None, Some(_)) => continue,
                    (Some(dts), Some(last)) if last - dts >= SCHEDULE_TOLERANCE_US => continue,
                    _ => {}
                }

                self.unchoke_for_stream(st, ms.src_sched);
                have_unchoked = true;
            }
        }

        // make sure at least one source keeps running, if any still can
        if !have_unchoked {
            for d in st.demux.iter_mut().filter(|d| !d.task_exited).take(1) {
                d.choked_next = false;
                have_unchoked = true;
            }
        }
        if !have_unchoked {
            for f in st.filters.iter_mut().filter(|f| !f.source.task_exited).take(1) {
                f.source.choked_next = false;
            }
        }

        for (idx, d) in st.demux.iter().enumerate() {
            if d.choked_prev != d.choked_next {
                self.demux[idx].waiter.set(d.choked_next);
            }
        }
        for (idx, f) in st.filters.iter().enumerate() {
            if f.source.choked_prev != f.source.choked_next {
                self.filters[idx].waiter.set(f.source.choked_next);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskId {
    Demux(usize),
    Dec(usize),
    Filter(usize),
    Enc(usize),
    Mux(usize),
}

impl TaskId {
    fn thread_name(self) -> String {
        match self {
            Self::Demux(idx) => format!("demux-{idx}"),
            Self::Dec(idx) => format!("dec-{idx}"),
            Self::Filter(idx) => format!("filter-{idx}"),
            Self::Enc(idx) => format!("enc-{idx}"),
            Self::Mux(idx) => format!("mux-{idx}"),
        }
    }
}

/// The runtime scheduler handle. Cheap to clone; all clones refer to the
/// same pipeline.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) core: Arc<Core>,
}

impl Scheduler {
    pub(crate) fn from_core(core: Core) -> Self {
        Self { core: Arc::new(core) }
    }

    /// Spawn the initial task threads and run the first schedule update.
    /// Called once by the builder; on failure the caller stops the
    /// scheduler.
    pub(crate) fn start_runtime(&self) -> Result<()> {
        let core = &self.core;

        {
            let mut ready = core.mux_ready.lock();
            for mux_idx in 0..core.mux.len() {
                if ready.per_mux[mux_idx].nb_streams_ready == core.mux[mux_idx].streams.len() {
                    self.mux_init(&mut ready, mux_idx)?;
                }
            }
        }

        for idx in 0..core.enc.len() {
            self.start_task(TaskId::Enc(idx))?;
        }
        for idx in 0..core.filters.len() {
            self.start_task(TaskId::Filter(idx))?;
        }
        for idx in 0..core.dec.len() {
            self.start_task(TaskId::Dec(idx))?;
        }
        for idx in 0..core.demux.len() {
            // a demuxer with no streams has nothing to do
            if core.demux[idx].streams.is_empty() {
                continue;
            }
            self.start_task(TaskId::Demux(idx))?;
        }

        let mut st = core.schedule.lock();
        core.schedule_update_locked(&mut st);

        Ok(())
    }

    fn start_task(&self, id: TaskId) -> Result<()> {
        let core = &self.core;
        tracing::debug!("starting {} thread", id.thread_name());

        let run: Box<dyn FnOnce() -> Result<()> + Send> = match id {
            TaskId::Demux(idx) => {
                let func = core.demux[idx].task.take_func().ok_or_else(started_twice)?;
                let ctx = DemuxContext::new(self.clone(), idx);
                Box::new(move || func(ctx))
            }
            TaskId::Dec(idx) => {
                let func = core.dec[idx].task.take_func().ok_or_else(started_twice)?;
                let ctx = DecoderContext::new(self.clone(), idx);
                Box::new(move || func(ctx))
            }
            TaskId::Filter(idx) => {
                let func = core.filters[idx].task.take_func().ok_or_else(started_twice)?;
                let ctx = FilterContext::new(self.clone(), idx);
                Box::new(move || func(ctx))
            }
            TaskId::Enc(idx) => {
                let func = core.enc[idx].task.take_func().ok_or_else(started_twice)?;
                let ctx = EncoderContext::new(self.clone(), idx);
                Box::new(move || func(ctx))
            }
            TaskId::Mux(idx) => {
                let func = core.mux[idx].task.take_func().ok_or_else(started_twice)?;
                let ctx = MuxContext::new(self.clone(), idx);
                Box::new(move || func(ctx))
            }
        };

        let sch = self.clone();
        let join = std::thread::Builder::new()
            .name(id.thread_name())
            .spawn(move || task_wrapper(&sch, id, run))?;

        match id {
            TaskId::Demux(idx) => core.demux[idx].task.set_join(join),
            TaskId::Dec(idx) => core.dec[idx].task.set_join(join),
            TaskId::Filter(idx) => core.filters[idx].task.set_join(join),
            TaskId::Enc(idx) => core.enc[idx].task.set_join(join),
            TaskId::Mux(idx) => core.mux[idx].task.set_join(join),
        }

        Ok(())
    }

    /// Write the muxer's header and start its thread, honoring the SDP
    /// barrier. Caller holds the mux-ready lock.
    pub(crate) fn mux_init(&self, ready: &mut MuxReadyState, mux_idx: usize) -> Result<()> {
        let core = &self.core;

        (core.mux[mux_idx].init_cb)()?;

        ready.nb_mux_ready += 1;

        if core.sdp_wanted() {
            if ready.nb_mux_ready < core.mux.len() {
                return Ok(());
            }

            match &core.sdp_cb {
                Some(cb) => cb(core.sdp_filename.as_deref()).inspect_err(|err| {
                    tracing::error!("error writing the session description: {err}");
                })?,
                None => tracing::debug!("no session description writer registered"),
            }

            // the SDP is complete, now all the muxer threads start at once
            for idx in 0..core.mux.len() {
                self.mux_task_start(ready, idx)?;
            }
        } else {
            self.mux_task_start(ready, mux_idx)?;
        }

        Ok(())
    }

    /// Spawn the mux thread and drain the pre-mux queues into the runtime
    /// queue in cross-stream dts order.
    fn mux_task_start(&self, ready: &mut MuxReadyState, mux_idx: usize) -> Result<()> {
        let core = &self.core;
        let mux = &core.mux[mux_idx];

        self.start_task(TaskId::Mux(mux_idx))?;

        loop {
            // the stream with the earliest dts (or an EOF / untimed packet,
            // which always wins) goes next; re-peek every round
            let mut min_stream: Option<usize> = None;
            let mut min_ts: Option<(i64, frameflow_core::Rational)> = None;

            for (idx, q) in ready.per_mux[mux_idx].premux.iter().enumerate() {
                match q.head() {
                    None => {}
                    Some(PreMuxHead::Eof | PreMuxHead::Packet { dts: None, .. }) => {
                        min_stream = Some(idx);
                        break;
                    }
                    Some(PreMuxHead::Packet { dts: Some(dts), tb }) => {
                        let earlier = min_ts.is_none_or(|(min_dts, min_tb)| {
                            compare_ts(min_dts, min_tb, dts, tb) == CmpOrdering::Greater
                        });
                        if earlier {
                            min_stream = Some(idx);
                            min_ts = Some((dts, tb));
                        }
                    }
                }
            }

            let Some(stream_idx) = min_stream else { break };
            let q = &mut ready.per_mux[mux_idx].premux[stream_idx];

            if let Some(pkt) = q.pop() {
                if !mux.streams[stream_idx].init_eof.load(Ordering::Relaxed) {
                    match mux.queue.send(stream_idx, pkt) {
                        Ok(()) => {}
                        Err(FrameFlowError::Eof) => {
                            mux.streams[stream_idx].init_eof.store(true, Ordering::Relaxed);
                        }
                        Err(err) => return Err(err),
                    }
                }
            } else if q.take_eof() {
                mux.queue.send_finish(stream_idx);
            }
        }

        mux.mux_started.store(true, Ordering::Release);

        Ok(())
    }

    /// Signal that a muxed stream is fully initialized. Once all streams of
    /// a muxer are ready, its header is written and (subject to the SDP
    /// barrier) its thread starts.
    ///
    /// # Errors
    ///
    /// Propagates header/SDP callback failures and thread spawn errors.
    pub fn mux_stream_ready(&self, mux_idx: usize, stream_idx: usize) -> Result<()> {
        let core = &self.core;
        assert!(mux_idx < core.mux.len());
        assert!(stream_idx < core.mux[mux_idx].streams.len());

        let mut ready = core.mux_ready.lock();
        assert!(ready.per_mux[mux_idx].nb_streams_ready < core.mux[mux_idx].streams.len());

        ready.per_mux[mux_idx].nb_streams_ready += 1;
        if ready.per_mux[mux_idx].nb_streams_ready == core.mux[mux_idx].streams.len() {
            self.mux_init(&mut ready, mux_idx)?;
        }

        Ok(())
    }

    /// Send a command frame to a filter graph's control stream.
    ///
    /// # Errors
    ///
    /// Returns `Eof` when the filter graph is finished.
    pub fn filter_command(&self, fg_idx: usize, frame: Frame) -> Result<()> {
        assert!(fg_idx < self.core.filters.len());
        let nb_inputs = self.core.filters[fg_idx].inputs.len();
        send_to_filter(self, fg_idx, nb_inputs, Some(frame))
    }

    /// Block until transcoding finishes, a task fails, or the timeout
    /// elapses. Returns whether waiting is over, plus the current
    /// transcode timestamp in the canonical time base.
    pub fn wait(&self, timeout: Duration) -> (bool, Option<i64>) {
        let core = &self.core;
        let mut finish = core.finish.lock();

        if finish.nb_mux_done < core.mux.len() {
            let _ = core.finish_cond.wait_for(&mut finish, timeout);
        }

        // abort transcoding if any task failed
        let done = finish.nb_mux_done == core.mux.len() || finish.task_failed;
        drop(finish);

        (done, self.transcode_ts())
    }

    /// The current trailing DTS snapshot, in the canonical time base.
    #[must_use]
    pub fn transcode_ts(&self) -> Option<i64> {
        let dts = self.core.last_dts.load(Ordering::Acquire);
        (dts != NO_DTS).then_some(dts)
    }

    /// Terminate the pipeline: wake everything, join every task, and
    /// return the final timestamp reached.
    ///
    /// Producers are joined before consumers so queued data drains as EOF
    /// naturally. Safe to call more than once; only the first call does
    /// anything.
    ///
    /// # Errors
    ///
    /// The first real task failure, if any task exited with one.
    pub fn stop(&self) -> Result<Option<i64>> {
        let core = &self.core;

        {
            let mut stopped = core.stopped.lock();
            if *stopped {
                return Ok(None);
            }
            *stopped = true;
        }

        core.terminate.store(true, Ordering::Release);

        // wake every choke-able task; they observe the terminate flag
        for d in &core.demux {
            d.waiter.set(true);
        }
        for fg in &core.filters {
            fg.waiter.set(true);
        }

        let mut status = Ok(());
        for idx in 0..core.demux.len() {
            status = merge_status(status, self.task_stop(TaskId::Demux(idx)));
        }
        for idx in 0..core.dec.len() {
            status = merge_status(status, self.task_stop(TaskId::Dec(idx)));
        }
        for idx in 0..core.filters.len() {
            status = merge_status(status, self.task_stop(TaskId::Filter(idx)));
        }
        for idx in 0..core.enc.len() {
            status = merge_status(status, self.task_stop(TaskId::Enc(idx)));
        }
        for idx in 0..core.mux.len() {
            status = merge_status(status, self.task_stop(TaskId::Mux(idx)));
        }

        let finish_ts = {
            let st = core.schedule.lock();
            core.trailing_dts(&st, true)
        };

        task_exit_status(status).map(|()| finish_ts)
    }

    fn task_stop(&self, id: TaskId) -> Result<()> {
        let core = &self.core;
        let (join, func_pending) = match id {
            TaskId::Demux(idx) => {
                (core.demux[idx].task.take_join(), core.demux[idx].task.take_func().is_some())
            }
            TaskId::Dec(idx) => {
                (core.dec[idx].task.take_join(), core.dec[idx].task.take_func().is_some())
            }
            TaskId::Filter(idx) => {
                (core.filters[idx].task.take_join(), core.filters[idx].task.take_func().is_some())
            }
            TaskId::Enc(idx) => {
                (core.enc[idx].task.take_join(), core.enc[idx].task.take_func().is_some())
            }
            TaskId::Mux(idx) => {
                (core.mux[idx].task.take_join(), core.mux[idx].task.take_func().is_some())
            }
        };

        if let Some(join) = join {
            return join.join().unwrap_or_else(|_| {
                Err(FrameFlowError::Bug(format!("{} task panicked", id.thread_name())))
            });
        }

        if func_pending {
            // the task never ran; its cleanup still must, so peers see EOF
            // and completion bookkeeping happens
            return task_cleanup(self, id);
        }

        Ok(())
    }
}

fn started_twice() -> FrameFlowError {
    FrameFlowError::Bug("task started twice".into())
}

fn task_cleanup(sch: &Scheduler, id: TaskId) -> Result<()> {
    match id {
        TaskId::Demux(idx) => demux_done(sch, idx),
        TaskId::Dec(idx) => dec_done(sch, idx),
        TaskId::Filter(idx) => filter_done(sch, idx),
        TaskId::Enc(idx) => enc_done(sch, idx),
        TaskId::Mux(idx) => mux_done(sch, idx),
    }
}

fn task_wrapper(
    sch: &Scheduler,
    id: TaskId,
    run: Box<dyn FnOnce() -> Result<()> + Send>,
) -> Result<()> {
    let ret = run();
    if let Err(err) = &ret {
        if err.is_failure() {
            tracing::error!("{} task finished with error: {err}", id.thread_name());
        }
    }

    let cleanup = task_cleanup(sch, id);
    let status = task_exit_status(merge_status(ret, cleanup));

    match &status {
        Ok(()) => tracing::debug!("terminating {} thread: success", id.thread_name()),
        Err(err) => {
            tracing::error!("terminating {} thread with error: {err}", id.thread_name());
            let core = &sch.core;
            let mut finish = core.finish.lock();
            finish.task_failed = true;
            core.finish_cond.notify_all();
        }
    }

    status
}

pub(crate) fn mux_done(sch: &Scheduler, mux_idx: usize) -> Result<()> {
    let core = &sch.core;
    let mux = &core.mux[mux_idx];

    {
        let mut st = core.schedule.lock();
        for stream_idx in 0..mux.streams.len() {
            mux.queue.receive_finish(stream_idx);
            st.mux_streams[mux_idx][stream_idx].source_finished = true;
        }
        core.schedule_update_locked(&mut st);
    }

    let mut finish = core.finish.lock();
    assert!(finish.nb_mux_done < core.mux.len());
    finish.nb_mux_done += 1;
    core.finish_cond.notify_all();

    Ok(())
}
