// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end pipeline tests: a full demux → decode → encode → mux chain,
//! fan-out with early consumer exit, and the post-seek flush handshake.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use frameflow_sched::{
    DecoderContext, DemuxContext, DemuxSendFlags, EncoderContext, Frame, FrameFlowError,
    MuxContext, Packet, Rational, Scheduler, SchedulerBuilder, SchedulerNode as Node, TIME_BASE_Q,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn wait_done(sch: &Scheduler, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let (done, _) = sch.wait(Duration::from_millis(100));
        if done {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
    }
}

fn packet(stream: usize, ts: i64, duration: i64, tb: Rational) -> Packet {
    Packet {
        payload: Some(Bytes::from_static(b"data")),
        stream_index: Some(stream),
        pts: Some(ts),
        dts: Some(ts),
        duration,
        time_base: tb,
        ..Packet::default()
    }
}

/// Decode loop forwarding each packet as a frame on output 0.
fn forwarding_decoder(ctx: &DecoderContext) -> frameflow_sched::Result<()> {
    let mut pkt = Packet::default();
    loop {
        match ctx.receive(&mut pkt) {
            Ok(()) => {
                let frame = Frame {
                    payload: pkt.payload.clone(),
                    pts: pkt.pts,
                    duration: pkt.duration,
                    time_base: pkt.time_base,
                    ..Frame::default()
                };
                match ctx.send(0, frame) {
                    Ok(()) | Err(FrameFlowError::Eof) => {}
                    Err(err) => return Err(err),
                }
            }
            Err(FrameFlowError::Eof) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

/// Encode loop forwarding each frame as a packet.
fn forwarding_encoder(ctx: &EncoderContext) -> frameflow_sched::Result<()> {
    loop {
        match ctx.receive() {
            Ok(frame) => {
                let pkt = Packet {
                    payload: frame.payload.clone(),
                    pts: frame.pts,
                    dts: frame.pts,
                    duration: frame.duration,
                    time_base: frame.time_base,
                    ..Packet::default()
                };
                ctx.send(pkt)?;
            }
            Err(FrameFlowError::Eof) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

/// Mux loop collecting the dts of every received packet.
fn collecting_muxer(
    ctx: &MuxContext,
    sink: &Mutex<Vec<(usize, Option<i64>)>>,
) -> frameflow_sched::Result<()> {
    let mut pkt = Packet::default();
    loop {
        match ctx.receive(&mut pkt) {
            Ok(()) => {
                sink.lock().unwrap().push((pkt.stream_index.expect("routed packet"), pkt.dts));
            }
            Err(FrameFlowError::Eof) if pkt.stream_index.is_some() => {}
            Err(FrameFlowError::Eof) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

#[test]
fn straight_pipe_delivers_in_order() {
    init_tracing();
    let received = Arc::new(Mutex::new(Vec::new()));

    let mut b = SchedulerBuilder::new();

    let mux = b.add_mux(
        {
            let received = Arc::clone(&received);
            move |ctx: MuxContext| collecting_muxer(&ctx, &received)
        },
        || Ok(()),
        false,
        0,
    );
    b.add_mux_stream(mux);

    let demux = b.add_demux(move |ctx: DemuxContext| {
        for i in 0..10 {
            let mut pkt = packet(0, i * 100, 100, TIME_BASE_Q);
            ctx.send(&mut pkt, DemuxSendFlags::default())?;
        }
        Ok(())
    });
    b.add_demux_stream(demux);

    let dec = b.add_dec(|ctx: DecoderContext| forwarding_decoder(&ctx), false);

    let enc = b.add_enc(
        |ctx: EncoderContext| forwarding_encoder(&ctx),
        move |sch: &Scheduler, _frame: &Frame| {
            sch.mux_stream_ready(mux, 0)?;
            Ok(0)
        },
    );

    b.connect(Node::DemuxStream { demux, stream: 0 }, Node::DecoderIn { dec }).unwrap();
    b.connect(Node::DecoderOut { dec, output: 0 }, Node::Encoder { enc }).unwrap();
    b.connect(Node::Encoder { enc }, Node::MuxStream { mux, stream: 0 }).unwrap();

    let sch = b.start().expect("pipeline failed to start");
    assert!(wait_done(&sch, Duration::from_secs(10)), "pipeline did not finish");

    let finish_ts = sch.stop().expect("stop failed");

    let got = received.lock().unwrap().clone();
    let expected: Vec<(usize, Option<i64>)> =
        (0..10).map(|i| (0, Some(i * 100))).collect();
    assert_eq!(got, expected);

    // the last packet ends at 900 + 100 in microseconds
    assert_eq!(finish_ts, Some(1000));
}

#[test]
fn fanout_reaches_all_consumers() {
    init_tracing();

    let counts = [Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))];

    let mut b = SchedulerBuilder::new();

    let mux = b.add_mux(
        move |ctx: MuxContext| {
            let mut pkt = Packet::default();
            loop {
                match ctx.receive(&mut pkt) {
                    Ok(()) => {}
                    Err(FrameFlowError::Eof) if pkt.stream_index.is_some() => {}
                    Err(FrameFlowError::Eof) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        },
        || Ok(()),
        false,
        0,
    );
    let s0 = b.add_mux_stream(mux);
    let s1 = b.add_mux_stream(mux);

    let demux = b.add_demux(move |ctx: DemuxContext| {
        for i in 0..5 {
            let mut pkt = packet(0, i * 10, 10, Rational::new(1, 1000));
            ctx.send(&mut pkt, DemuxSendFlags::default())?;
        }
        Ok(())
    });
    b.add_demux_stream(demux);

    // two decoders fed from the same demuxed stream
    let mut decs = Vec::new();
    for count in &counts {
        let count = Arc::clone(count);
        decs.push(b.add_dec(
            move |ctx: DecoderContext| {
                let mut pkt = Packet::default();
                loop {
                    match ctx.receive(&mut pkt) {
                        Ok(()) => {
                            count.fetch_add(1, Ordering::SeqCst);
                            let frame = Frame {
                                payload: pkt.payload.clone(),
                                pts: pkt.pts,
                                duration: pkt.duration,
                                time_base: pkt.time_base,
                                ..Frame::default()
                            };
                            match ctx.send(0, frame) {
                                Ok(()) | Err(FrameFlowError::Eof) => {}
                                Err(err) => return Err(err),
                            }
                        }
                        Err(FrameFlowError::Eof) => return Ok(()),
                        Err(err) => return Err(err),
                    }
                }
            },
            false,
        ));
    }

    for (i, &dec) in decs.iter().enumerate() {
        let stream = if i == 0 { s0 } else { s1 };
        let enc = b.add_enc(
            |ctx: EncoderContext| forwarding_encoder(&ctx),
            move |sch: &Scheduler, _: &Frame| {
                sch.mux_stream_ready(mux, stream)?;
                Ok(0)
            },
        );
        b.connect(Node::DemuxStream { demux, stream: 0 }, Node::DecoderIn { dec }).unwrap();
        b.connect(Node::DecoderOut { dec, output: 0 }, Node::Encoder { enc }).unwrap();
        b.connect(Node::Encoder { enc }, Node::MuxStream { mux, stream }).unwrap();
    }

    let sch = b.start().expect("pipeline failed to start");
    assert!(wait_done(&sch, Duration::from_secs(10)), "pipeline did not finish");
    sch.stop().expect("stop failed");

    // every decoder saw every packet
    assert_eq!(counts[0].load(Ordering::SeqCst), 5);
    assert_eq!(counts[1].load(Ordering::SeqCst), 5);
}

#[test]
fn demuxer_sees_eof_once_all_consumers_finish() {
    init_tracing();

    let sent = Arc::new(AtomicUsize::new(0));
    let got_eof = Arc::new(AtomicUsize::new(0));

    let mut b = SchedulerBuilder::new();

    let mux = b.add_mux(
        move |ctx: MuxContext| {
            let mut pkt = Packet::default();
            loop {
                match ctx.receive(&mut pkt) {
                    Ok(()) => {}
                    Err(FrameFlowError::Eof) if pkt.stream_index.is_some() => {}
                    Err(FrameFlowError::Eof) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        },
        || Ok(()),
        false,
        0,
    );
    b.add_mux_stream(mux);

    let demux = {
        let sent = Arc::clone(&sent);
        let got_eof = Arc::clone(&got_eof);
        b.add_demux(move |ctx: DemuxContext| {
            // keep producing until every consumer has bowed out
            for i in 0..10_000 {
                let mut pkt = packet(0, i, 1, Rational::new(1, 1000));
                match ctx.send(&mut pkt, DemuxSendFlags::default()) {
                    Ok(()) => {
                        sent.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(FrameFlowError::Eof) => {
                        got_eof.fetch_add(1, Ordering::SeqCst);
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })
    };
    b.add_demux_stream(demux);

    // consumer 1: a decoder that exits after two packets
    let dec_quitter = b.add_dec(
        |ctx: DecoderContext| {
            let mut pkt = Packet::default();
            for _ in 0..2 {
                match ctx.receive(&mut pkt) {
                    Ok(()) | Err(FrameFlowError::Eof) => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        },
        false,
    );
    // its mandatory output feeds an encoder that will only ever see EOF
    let enc_quitter = b.add_enc(
        |ctx: EncoderContext| match ctx.receive() {
            Ok(_) | Err(FrameFlowError::Eof) => Ok(()),
            Err(err) => Err(err),
        },
        |_: &Scheduler, _: &Frame| Ok(0),
    );

    // the muxed stream is known-ready up front; its encoder only relays EOF
    b.mux_stream_ready(mux, 0);

    b.connect(Node::DemuxStream { demux, stream: 0 }, Node::DecoderIn { dec: dec_quitter })
        .unwrap();
    b.connect(Node::DecoderOut { dec: dec_quitter, output: 0 }, Node::Encoder { enc: enc_quitter })
        .unwrap();
    b.connect(Node::Encoder { enc: enc_quitter }, Node::MuxStream { mux, stream: 0 }).unwrap();

    let sch = b.start().expect("pipeline failed to start");
    assert!(wait_done(&sch, Duration::from_secs(10)), "pipeline did not finish");
    sch.stop().expect("stop failed");

    // the demuxer terminated via EOF, not by exhausting its packet budget
    assert_eq!(got_eof.load(Ordering::SeqCst), 1);
    assert!(sent.load(Ordering::SeqCst) < 10_000);
}

#[test]
fn flush_round_trip_reports_decoder_end_timestamp() {
    init_tracing();

    let flush_result = Arc::new(Mutex::new(None));

    let mut b = SchedulerBuilder::new();

    let mux = b.add_mux(
        move |ctx: MuxContext| {
            let mut pkt = Packet::default();
            loop {
                match ctx.receive(&mut pkt) {
                    Ok(()) => {}
                    Err(FrameFlowError::Eof) if pkt.stream_index.is_some() => {}
                    Err(FrameFlowError::Eof) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        },
        || Ok(()),
        false,
        0,
    );
    b.add_mux_stream(mux);

    let demux = {
        let flush_result = Arc::clone(&flush_result);
        b.add_demux(move |ctx: DemuxContext| {
            for i in 0..3 {
                let mut pkt = packet(0, i * 100, 100, TIME_BASE_Q);
                ctx.send(&mut pkt, DemuxSendFlags::default())?;
            }

            // seek: flush downstream and learn the new loop base timestamp
            let mut flush = Packet::default();
            ctx.send(&mut flush, DemuxSendFlags::default())?;
            *flush_result.lock().unwrap() = Some((flush.pts, flush.time_base));

            for i in 0..2 {
                let mut pkt = packet(0, i * 100, 100, TIME_BASE_Q);
                ctx.send(&mut pkt, DemuxSendFlags::default())?;
            }
            Ok(())
        })
    };
    b.add_demux_stream(demux);

    let dec = b.add_dec(
        |ctx: DecoderContext| {
            let mut pkt = Packet::default();
            loop {
                match ctx.receive(&mut pkt) {
                    Ok(()) if pkt.is_flush() => {
                        // report the end timestamp of the flushed stream on
                        // the next receive call
                        pkt.pts = Some(5_000_000);
                        pkt.time_base = TIME_BASE_Q;
                    }
                    Ok(()) => {
                        let frame = Frame {
                            payload: pkt.payload.clone(),
                            pts: pkt.pts,
                            duration: pkt.duration,
                            time_base: pkt.time_base,
                            ..Frame::default()
                        };
                        match ctx.send(0, frame) {
                            Ok(()) | Err(FrameFlowError::Eof) => {}
                            Err(err) => return Err(err),
                        }
                    }
                    Err(FrameFlowError::Eof) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        },
        true,
    );

    let enc = b.add_enc(
        |ctx: EncoderContext| forwarding_encoder(&ctx),
        move |sch: &Scheduler, _: &Frame| {
            sch.mux_stream_ready(mux, 0)?;
            Ok(0)
        },
    );

    b.connect(Node::DemuxStream { demux, stream: 0 }, Node::DecoderIn { dec }).unwrap();
    b.connect(Node::DecoderOut { dec, output: 0 }, Node::Encoder { enc }).unwrap();
    b.connect(Node::Encoder { enc }, Node::MuxStream { mux, stream: 0 }).unwrap();

    let sch = b.start().expect("pipeline failed to start");
    assert!(wait_done(&sch, Duration::from_secs(10)), "pipeline did not finish");
    sch.stop().expect("stop failed");

    let (pts, tb) = flush_result.lock().unwrap().expect("flush never completed");
    assert_eq!(pts, Some(5_000_000));
    assert_eq!(tb, TIME_BASE_Q);
}
