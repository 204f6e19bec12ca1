// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Endpoint descriptors and structural checks for the transcode graph.
//!
//! A [`SchedulerNode`] names one endpoint of an edge: a demuxed stream, a
//! decoder input or output, an encoder, a filter-graph input or output, or
//! a muxed stream. The legal edges are:
//!
//! | source          | destinations                |
//! |-----------------|-----------------------------|
//! | `DemuxStream`   | `DecoderIn`, `MuxStream`    |
//! | `DecoderOut`    | `FilterIn`, `Encoder`       |
//! | `FilterOut`     | `Encoder`, `FilterIn`       |
//! | `Encoder`       | `MuxStream`, `DecoderIn`    |
//!
//! Fan-out is allowed on demuxed streams, decoder outputs and encoders;
//! decoder inputs, encoder inputs, filter inputs and muxed streams each
//! have exactly one source.

use frameflow_core::{FrameFlowError, Result};
use std::fmt;

/// One endpoint in the transcode graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerNode {
    /// A demuxed stream of a demuxer.
    DemuxStream { demux: usize, stream: usize },
    /// A muxed stream of a muxer.
    MuxStream { mux: usize, stream: usize },
    /// The packet input of a decoder.
    DecoderIn { dec: usize },
    /// A frame output of a decoder (several for multiview video).
    DecoderOut { dec: usize, output: usize },
    /// The frame input of an encoder.
    Encoder { enc: usize },
    /// A frame input of a filter graph.
    FilterIn { graph: usize, input: usize },
    /// A frame output of a filter graph.
    FilterOut { graph: usize, output: usize },
}

impl fmt::Display for SchedulerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DemuxStream { demux, stream } => write!(f, "demuxer {demux} stream {stream}"),
            Self::MuxStream { mux, stream } => write!(f, "muxer {mux} stream {stream}"),
            Self::DecoderIn { dec } => write!(f, "decoder {dec}"),
            Self::DecoderOut { dec, output } => write!(f, "decoder {dec} output {output}"),
            Self::Encoder { enc } => write!(f, "encoder {enc}"),
            Self::FilterIn { graph, input } => write!(f, "filter graph {graph} input {input}"),
            Self::FilterOut { graph, output } => {
                write!(f, "filter graph {graph} output {output}")
            }
        }
    }
}

impl SchedulerNode {
    /// Whether an edge from `self` to `dst` is structurally legal.
    #[must_use]
    pub const fn can_feed(&self, dst: &Self) -> bool {
        matches!(
            (self, dst),
            (Self::DemuxStream { .. }, Self::DecoderIn { .. } | Self::MuxStream { .. })
                | (Self::DecoderOut { .. }, Self::FilterIn { .. } | Self::Encoder { .. })
                | (Self::FilterOut { .. }, Self::Encoder { .. } | Self::FilterIn { .. })
                | (Self::Encoder { .. }, Self::MuxStream { .. } | Self::DecoderIn { .. })
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    Started,
    Done,
}

/// Verify that the filter-graph portion of the pipeline is acyclic.
///
/// `graph_inputs[g][i]` is the resolved upstream source (`DemuxStream` or
/// `FilterOut`) feeding input `i` of filter graph `g`. Demuxers terminate
/// a walk; filter outputs descend into the producing graph. Revisiting a
/// graph that is still on the walk's stack is a cycle.
///
/// # Errors
///
/// `Configuration` on the first cycle found.
pub(crate) fn check_acyclic(graph_inputs: &[Vec<SchedulerNode>]) -> Result<()> {
    let nb_graphs = graph_inputs.len();

    // trace the transcoding graph upstream from every filter graph
    for root in 0..nb_graphs {
        let mut visited = vec![Visit::New; nb_graphs];
        let mut stack: Vec<(usize, usize)> = Vec::new();
        let (mut graph, mut input) = (root, 0);

        loop {
            visited[graph] = Visit::Started;

            if input < graph_inputs[graph].len() {
                let src = graph_inputs[graph][input];
                input += 1;

                match src {
                    // fed by a demuxer, no cycle possible through here
                    SchedulerNode::DemuxStream { .. } => {}
                    SchedulerNode::FilterOut { graph: upstream, .. } => {
                        if visited[upstream] == Visit::Started {
                            return Err(FrameFlowError::Configuration(format!(
                                "transcoding graph has a cycle through filter graph {upstream}"
                            )));
                        }
                        stack.push((graph, input));
                        graph = upstream;
                        input = 0;
                    }
                    other => {
                        return Err(FrameFlowError::Bug(format!(
                            "filter input resolved to unexpected source: {other}"
                        )))
                    }
                }
                continue;
            }

            visited[graph] = Visit::Done;

            match stack.pop() {
                Some((parent, parent_input)) => {
                    graph = parent;
                    input = parent_input;
                }
                None => break,
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn demux(demux: usize) -> SchedulerNode {
        SchedulerNode::DemuxStream { demux, stream: 0 }
    }

    const fn fg_out(graph: usize) -> SchedulerNode {
        SchedulerNode::FilterOut { graph, output: 0 }
    }

    #[test]
    fn edge_matrix() {
        let src = SchedulerNode::DemuxStream { demux: 0, stream: 0 };
        assert!(src.can_feed(&SchedulerNode::DecoderIn { dec: 0 }));
        assert!(src.can_feed(&SchedulerNode::MuxStream { mux: 0, stream: 0 }));
        assert!(!src.can_feed(&SchedulerNode::Encoder { enc: 0 }));

        let src = SchedulerNode::Encoder { enc: 0 };
        assert!(src.can_feed(&SchedulerNode::MuxStream { mux: 0, stream: 0 }));
        assert!(src.can_feed(&SchedulerNode::DecoderIn { dec: 0 }));
        assert!(!src.can_feed(&SchedulerNode::FilterIn { graph: 0, input: 0 }));
    }

    #[test]
    fn chain_of_graphs_is_acyclic() {
        // fg1 <- fg0 <- demux
        let inputs = vec![vec![demux(0)], vec![fg_out(0)]];
        assert!(check_acyclic(&inputs).is_ok());
    }

    #[test]
    fn self_loop_is_rejected() {
        let inputs = vec![vec![fg_out(0)]];
        assert!(check_acyclic(&inputs).is_err());
    }

    #[test]
    fn two_graph_cycle_is_rejected() {
        let inputs = vec![vec![fg_out(1)], vec![fg_out(0)]];
        assert!(check_acyclic(&inputs).is_err());
    }

    #[test]
    fn diamond_is_acyclic() {
        // fg2 reads fg0 and fg1, both fed by demuxers
        let inputs = vec![vec![demux(0)], vec![demux(1)], vec![fg_out(0), fg_out(1)]];
        assert!(check_acyclic(&inputs).is_ok());
    }
}
