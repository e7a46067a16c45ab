//! Performance benchmarks for the voice relay hot paths
//!
//! Run with: cargo bench
//! Or for specific benchmarks: cargo bench -- <filter>

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::time::Duration;
use voice_relay::core::audio::PcmFormat;
use voice_relay::core::realtime::{ClientEvent, ServerEvent};
use voice_relay::core::relay::SpeakerArbiter;
use voice_relay::core::transcode::{InProcessTranscoder, TranscodeWorker};
use voice_relay::core::voice::SpeakerId;

/// Benchmark uplink and downlink transcoding of one 20ms frame
fn bench_transcode(c: &mut Criterion) {
    let mut group = c.benchmark_group("transcode");
    group.measurement_time(Duration::from_secs(5));

    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    let cases = [
        ("uplink_48k_stereo_to_24k_mono", PcmFormat::stereo(48000), PcmFormat::mono(24000)),
        ("downlink_24k_mono_to_48k_stereo", PcmFormat::mono(24000), PcmFormat::stereo(48000)),
        ("identity_24k_mono", PcmFormat::mono(24000), PcmFormat::mono(24000)),
    ];

    for (name, input, output) in cases {
        let frame = vec![0x11u8; input.frame_bytes()];
        let mut transcoder = InProcessTranscoder::new(input, output).unwrap();

        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::new(name, frame.len()), &frame, |b, frame| {
            b.iter(|| rt.block_on(transcoder.process(black_box(frame))).unwrap());
        });
    }

    group.finish();
}

/// Benchmark arbitration with contention for the floor
fn bench_arbiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("arbiter");

    let speakers: Vec<SpeakerId> = (0..4).map(|i| SpeakerId::new(format!("speaker-{}", i))).collect();
    let frame = Bytes::from(vec![0u8; 960]);

    group.bench_function("active_speaker_forward", |b| {
        let mut arbiter = SpeakerArbiter::default();
        arbiter.on_speech_start(&speakers[0]);
        b.iter(|| arbiter.on_frame(black_box(&speakers[0]), frame.clone()));
    });

    group.bench_function("queued_speaker_overflow", |b| {
        let mut arbiter = SpeakerArbiter::default();
        arbiter.on_speech_start(&speakers[0]);
        arbiter.on_speech_start(&speakers[1]);
        b.iter(|| arbiter.on_frame(black_box(&speakers[1]), frame.clone()));
    });

    group.bench_function("handoff_round", |b| {
        b.iter(|| {
            let mut arbiter = SpeakerArbiter::default();
            for speaker in &speakers {
                arbiter.on_speech_start(speaker);
                for _ in 0..10 {
                    arbiter.on_frame(speaker, frame.clone());
                }
            }
            for speaker in &speakers {
                black_box(arbiter.on_speech_end(speaker));
            }
        });
    });

    group.finish();
}

/// Benchmark wire event encoding and decoding
fn bench_wire_events(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_events");

    let frame = vec![0x22u8; 960];
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("audio_append_serialize", |b| {
        b.iter(|| {
            let event = ClientEvent::audio_append(black_box(&frame), Some("Alice".to_string()));
            serde_json::to_string(&event).unwrap()
        });
    });

    let delta = serde_json::to_string(&serde_json::json!({
        "type": "response.audio.delta",
        "response_id": "resp_1",
        "delta": base64_frame(4800),
    }))
    .unwrap();
    group.throughput(Throughput::Bytes(delta.len() as u64));
    group.bench_function("audio_delta_parse_decode", |b| {
        b.iter(|| {
            let event: ServerEvent = serde_json::from_str(black_box(&delta)).unwrap();
            if let ServerEvent::AudioDelta { delta, .. } = event {
                black_box(ServerEvent::decode_audio_delta(&delta).unwrap());
            }
        });
    });

    group.finish();
}

fn base64_frame(len: usize) -> String {
    use base64::prelude::*;
    BASE64_STANDARD.encode(vec![0x33u8; len])
}

criterion_group!(benches, bench_transcode, bench_arbiter, bench_wire_events);
criterion_main!(benches);
