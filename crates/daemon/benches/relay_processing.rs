//! Performance benchmarks for relay processing.
//!
//! These benchmarks measure the hot paths between a consumer and a session:
//! - Inbound frame classification (resize vs. keystrokes)
//! - Output framing of drained terminal bytes
//! - Transcript decoding

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protocol::{ControlFrame, Inbound, OutputFramer, TerminalSize};

/// Benchmark classification of consumer payloads.
fn bench_inbound_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("inbound_classify");

    let keystroke = b"l".to_vec();
    group.bench_function("keystroke_1B", |b| {
        b.iter(|| Inbound::classify(black_box(&keystroke)));
    });

    let pasted = "echo hello world && ls -la\n".repeat(64).into_bytes();
    group.throughput(Throughput::Bytes(pasted.len() as u64));
    group.bench_function("paste_1_7KB", |b| {
        b.iter(|| Inbound::classify(black_box(&pasted)));
    });

    let resize = ControlFrame::resize(TerminalSize::new(120, 40).unwrap())
        .to_json()
        .unwrap()
        .into_bytes();
    group.bench_function("resize_frame", |b| {
        b.iter(|| Inbound::classify(black_box(&resize)));
    });

    // Looks like JSON but is not a resize frame; falls through to input.
    let json_input = br#"{"type":"other","cols":1}"#.to_vec();
    group.bench_function("json_lookalike", |b| {
        b.iter(|| Inbound::classify(black_box(&json_input)));
    });

    group.finish();
}

/// Benchmark output framing over typical drain sizes.
fn bench_output_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_framing");

    for size in [64usize, 4096, 65536] {
        let ascii = vec![b'a'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("ascii", size), &ascii, |b, data| {
            let mut framer = OutputFramer::new();
            b.iter(|| framer.push(black_box(data)));
        });

        // Multi-byte text cut mid-character so the carry path is exercised.
        let mut split = "héllo wörld ✓ ".repeat(size / 16 + 1).into_bytes();
        split.truncate(size);
        group.bench_with_input(BenchmarkId::new("utf8_split", size), &split, |b, data| {
            let mut framer = OutputFramer::new();
            b.iter(|| framer.push(black_box(data)));
        });
    }

    group.finish();
}

/// Benchmark transcript decoding.
fn bench_transcript_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("transcript_decode");

    let mut log = Vec::new();
    for i in 0..2048 {
        log.extend_from_slice(format!("line {i}: ok ✓\r\n").as_bytes());
    }
    group.throughput(Throughput::Bytes(log.len() as u64));
    group.bench_function("lossy_64KB", |b| {
        b.iter(|| String::from_utf8_lossy(black_box(&log)).into_owned());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_inbound_classify,
    bench_output_framing,
    bench_transcript_decode,
);

criterion_main!(benches);
