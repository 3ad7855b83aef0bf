//! Benchmarks for record sealing

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use helm_core::{crc32, StationName};
use helm_state::{codec, ActuatorCommand, DesiredActuatorState, DesiredState, PidMode};

fn full_document() -> DesiredState {
    let mut state = DesiredState::new(StationName::new("bench-station").unwrap());
    for slot in 0..64 {
        state.upsert_actuator(
            DesiredActuatorState::new(slot, ActuatorCommand::Pwm, slot as u8),
            64,
        );
    }
    for id in 0..64 {
        state.update_pid_loop(id, 64, |p| {
            p.mode = PidMode::Auto;
            p.setpoint = id as f32 * 0.5;
        });
    }
    state.seal();
    state
}

fn bench_crc32(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32");

    for size in [64usize, 512, 2048] {
        let data = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(crc32(black_box(data))))
        });
    }

    group.finish();
}

fn bench_compute_checksum(c: &mut Criterion) {
    let state = full_document();

    c.bench_function("compute_checksum_full_document", |b| {
        b.iter(|| black_box(codec::compute_checksum(black_box(&state))))
    });
}

fn bench_decode(c: &mut Criterion) {
    let bytes = codec::encode(&full_document());
    let limits = codec::DecodeLimits::default();

    c.bench_function("decode_full_document", |b| {
        b.iter(|| black_box(codec::decode(black_box(&bytes), &limits)))
    });
}

criterion_group!(benches, bench_crc32, bench_compute_checksum, bench_decode);
criterion_main!(benches);
