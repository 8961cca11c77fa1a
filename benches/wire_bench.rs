// flowmux wire-level benchmarks using criterion.
//
// Measures:
//   - VLU encode/decode throughput
//   - Frame encode/decode throughput
//   - Session transmit-pass throughput end to end

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flowmux::{Carrier, Frame, Priority, Session};

// ---------------------------------------------------------------------------
// VLU encode/decode
// ---------------------------------------------------------------------------

fn bench_vlu_encode(c: &mut Criterion) {
    let values: &[u64] = &[0, 127, 128, 16_383, 1_048_575, u64::MAX];

    let mut group = c.benchmark_group("vlu_encode");
    for &value in values {
        group.bench_with_input(BenchmarkId::from_parameter(value), &value, |b, &v| {
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(16);
                flowmux::vlu::encode(black_box(v), &mut buf);
                black_box(buf);
            });
        });
    }
    group.finish();
}

fn bench_vlu_decode(c: &mut Criterion) {
    let values: &[u64] = &[0, 127, 128, 16_383, 1_048_575, u64::MAX];

    let mut group = c.benchmark_group("vlu_decode");
    for &value in values {
        let mut buf = BytesMut::with_capacity(16);
        flowmux::vlu::encode(value, &mut buf);
        let encoded = buf.freeze();
        group.bench_with_input(BenchmarkId::from_parameter(value), &encoded, |b, data| {
            b.iter(|| {
                black_box(flowmux::vlu::decode(black_box(data)).unwrap());
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Frame encode/decode throughput
// ---------------------------------------------------------------------------

fn bench_frame_encode(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 1024, 8192, 65536];

    let mut group = c.benchmark_group("frame_encode");
    for &size in sizes {
        let payload = Bytes::from(vec![0xABu8; size]);
        let frame = Frame::DataLast {
            flow_id: flowmux::FlowId(1),
            payload: payload.clone(),
        };
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &frame,
            |b, f| {
                b.iter(|| {
                    black_box(f.encode());
                });
            },
        );
    }
    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 1024, 8192, 65536];

    let mut group = c.benchmark_group("frame_decode");
    for &size in sizes {
        let payload = Bytes::from(vec![0xABu8; size]);
        let frame = Frame::DataLast {
            flow_id: flowmux::FlowId(1),
            payload,
        };
        let encoded = frame.encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &encoded,
            |b, data| {
                b.iter(|| {
                    black_box(Frame::decode(black_box(data)).unwrap());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// DATA_ACK frame encode/decode
// ---------------------------------------------------------------------------

fn bench_ack_frame(c: &mut Criterion) {
    let frame = Frame::DataAck {
        flow_id: flowmux::FlowId(7),
        received: 1_048_576,
        advertisement: 65_536,
    };

    c.bench_function("ack_frame_encode", |b| {
        b.iter(|| {
            black_box(frame.encode());
        });
    });

    let encoded = frame.encode();
    c.bench_function("ack_frame_decode", |b| {
        b.iter(|| {
            black_box(Frame::decode(black_box(&encoded)).unwrap());
        });
    });
}

// ---------------------------------------------------------------------------
// Session transmit-pass throughput
// ---------------------------------------------------------------------------

/// A carrier that discards everything it is given, so the benchmark measures
/// only the Session's own scheduling and framing cost.
struct NullCarrier;

impl Carrier for NullCarrier {
    fn send(&mut self, _frame: Bytes) -> std::io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

fn bench_session_open_write_close(c: &mut Criterion) {
    c.bench_function("session_open_write_close_1kb", |b| {
        b.iter(|| {
            let mut session = Session::with_defaults(NullCarrier);
            let flow = session
                .open_flow(Bytes::from_static(b"bench"), Priority::Routine)
                .unwrap();
            session
                .write(flow, Bytes::from(vec![0u8; 1024]), None, None)
                .unwrap();
            session.close_flow(flow).unwrap();
            black_box(session.drive_pending().unwrap());
        });
    });
}

fn bench_session_many_flows(c: &mut Criterion) {
    c.bench_function("session_100_flows_round_robin", |b| {
        b.iter(|| {
            let mut session = Session::with_defaults(NullCarrier);
            for _ in 0..100 {
                let flow = session
                    .open_flow(Bytes::new(), Priority::Routine)
                    .unwrap();
                session.write(flow, Bytes::from_static(b"payload"), None, None).unwrap();
                session.close_flow(flow).unwrap();
            }
            black_box(session.drive_pending().unwrap());
        });
    });
}

// ---------------------------------------------------------------------------
// Criterion harness
// ---------------------------------------------------------------------------

criterion_group! {
    name = wire_benches;
    config = Criterion::default()
        .sample_size(100)
        .measurement_time(Duration::from_secs(5));
    targets =
        bench_vlu_encode,
        bench_vlu_decode,
        bench_frame_encode,
        bench_frame_decode,
        bench_ack_frame,
        bench_session_open_write_close,
        bench_session_many_flows
}

criterion_main!(wire_benches);
