// SPDX-FileCopyrightText: © 2026 FrameFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Sync-queue integration: an audio encoder with a fixed frame size gets
//! its input re-chunked by the sync queue, sized by the open callback.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use frameflow_sched::{
    DecoderContext, DemuxContext, DemuxSendFlags, EncoderContext, Frame, FrameFlowError,
    MuxContext, Packet, Rational, Scheduler, SchedulerBuilder, SchedulerNode as Node,
};
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

const AUDIO_TB: Rational = Rational::new(1, 48_000);

fn audio_frame(pts: i64, nb_samples: usize) -> Frame {
    Frame {
        payload: Some(Bytes::from(vec![0u8; nb_samples * 4])),
        pts: Some(pts),
        duration: i64::try_from(nb_samples).unwrap(),
        time_base: AUDIO_TB,
        nb_samples,
        sample_rate: 48_000,
        ..Frame::default()
    }
}

/// Encoder loop recording the sample count of every received frame.
fn recording_encoder(
    ctx: &EncoderContext,
    sizes: &Mutex<Vec<usize>>,
) -> frameflow_sched::Result<()> {
    loop {
        match ctx.receive() {
            Ok(frame) => {
                sizes.lock().unwrap().push(frame.nb_samples);
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

#[test]
fn open_callback_frame_size_rechunks_audio() {
    init_tracing();

    let sizes_a = Arc::new(Mutex::new(Vec::new()));
    let sizes_b = Arc::new(Mutex::new(Vec::new()));

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
    let s_a = b.add_mux_stream(mux);
    let s_b = b.add_mux_stream(mux);

    let demux = b.add_demux(move |ctx: DemuxContext| {
        let mut pkt = Packet {
            payload: Some(Bytes::from_static(b"data")),
            stream_index: Some(0),
            pts: Some(0),
            dts: Some(0),
            duration: 2400,
            time_base: AUDIO_TB,
            ..Packet::default()
        };
        ctx.send(&mut pkt, DemuxSendFlags::default())?;
        Ok(())
    });
    b.add_demux_stream(demux);

    // one decoded packet fans out as audio on two decoder outputs
    let dec = b.add_dec(
        |ctx: DecoderContext| {
            let mut pkt = Packet::default();
            loop {
                match ctx.receive(&mut pkt) {
                    Ok(()) => {
                        match ctx.send(0, audio_frame(0, 2400)) {
                            Ok(()) | Err(FrameFlowError::Eof) => {}
                            Err(err) => return Err(err),
                        }
                        match ctx.send(1, audio_frame(0, 100)) {
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
    );
    let dec_out_b = b.add_dec_output(dec);

    // encoder A wants fixed 1024-sample frames; encoder B takes anything
    let enc_a = b.add_enc(
        {
            let sizes = Arc::clone(&sizes_a);
            move |ctx: EncoderContext| recording_encoder(&ctx, &sizes)
        },
        move |sch: &Scheduler, _: &Frame| {
            sch.mux_stream_ready(mux, s_a)?;
            Ok(1024)
        },
    );
    let enc_b = b.add_enc(
        {
            let sizes = Arc::clone(&sizes_b);
            move |ctx: EncoderContext| recording_encoder(&ctx, &sizes)
        },
        move |sch: &Scheduler, _: &Frame| {
            sch.mux_stream_ready(mux, s_b)?;
            Ok(0)
        },
    );

    let sq = b.add_sq_enc(1_000_000);
    b.sq_add_enc(sq, enc_a, true, u64::MAX).unwrap();
    b.sq_add_enc(sq, enc_b, false, u64::MAX).unwrap();

    b.connect(Node::DemuxStream { demux, stream: 0 }, Node::DecoderIn { dec }).unwrap();
    b.connect(Node::DecoderOut { dec, output: 0 }, Node::Encoder { enc: enc_a }).unwrap();
    b.connect(Node::DecoderOut { dec, output: dec_out_b }, Node::Encoder { enc: enc_b })
        .unwrap();
    b.connect(Node::Encoder { enc: enc_a }, Node::MuxStream { mux, stream: s_a }).unwrap();
    b.connect(Node::Encoder { enc: enc_b }, Node::MuxStream { mux, stream: s_b }).unwrap();

    let sch = b.start().expect("pipeline failed to start");
    assert!(wait_done(&sch, Duration::from_secs(10)), "pipeline did not finish");
    sch.stop().expect("stop failed");

    // 2400 samples come out as two full encoder frames plus the flushed
    // remainder
    assert_eq!(sizes_a.lock().unwrap().clone(), vec![1024, 1024, 352]);
    // the pass-through encoder sees its frame unchanged
    assert_eq!(sizes_b.lock().unwrap().clone(), vec![100]);
}
