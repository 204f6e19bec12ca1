// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! frameflow-sched: the inter-thread scheduler for transcode pipelines.
//!
//! A transcode run is a directed acyclic graph of components:
//! - **demuxers**, each producing any number of demuxed streams; demuxed
//!   packets go to decoders (transcoding) and/or muxers (streamcopy);
//! - **decoders**, turning packets into frames for filter graphs or
//!   encoders;
//! - **filter graphs**, with zero or more inputs (zero when the graph
//!   contains only internal sources) and one or more outputs;
//! - **encoders**, turning frames into packets for muxed streams (or, for
//!   subtitles, looping back into a decoder);
//! - **muxers**, each consuming any number of muxed streams.
//!
//! Every component runs a caller-supplied function on its own OS thread
//! and communicates exclusively through the scheduler, which is the one
//! place that knows the whole pipeline. The scheduler keeps all output
//! streams time-aligned by varying the rates at which the demuxers and
//! pure-source filter graphs are allowed to produce: whoever feeds the
//! output stream with the smallest reached timestamp gets to run, while
//! sources that are too far ahead are parked. The degree of control is
//! inherently limited — inputs interleaved very differently from the
//! outputs will buffer up and eventually fail the run — but for sanely
//! interleaved media it keeps every muxer within a fixed tolerance.
//!
//! Build a pipeline with [`SchedulerBuilder`], then drive it through the
//! [`Scheduler`] handle its [`start`](SchedulerBuilder::start) returns.
//! Each task function receives a typed context ([`DemuxContext`],
//! [`DecoderContext`], [`FilterContext`], [`EncoderContext`],
//! [`MuxContext`]) carrying exactly the operations that node may perform.

pub mod constants;

mod builder;
mod graph;
mod io;
mod premux;
mod scheduler;
mod slot;
mod sync_queue;
mod thread_queue;
mod waiter;

pub use builder::SchedulerBuilder;
pub use graph::SchedulerNode;
pub use io::{
    DecoderContext, DemuxContext, DemuxSendFlags, EncoderContext, FilterContext, MuxContext,
};
pub use scheduler::{InitCallback, OpenCallback, Scheduler, SdpCallback};
pub use sync_queue::{SyncItem, SyncQueue};
pub use thread_queue::{Received, ThreadQueue};
pub use waiter::Waiter;

// The error and data model types tasks interact with.
pub use frameflow_core::{
    Frame, FrameFlowError, Packet, Rational, Result, Timestamp, TIME_BASE_Q,
};
