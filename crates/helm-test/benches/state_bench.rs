//! Benchmarks for desired-state operations

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use helm_core::StationName;
use helm_state::{ActuatorCommand, PidMode, ReconcilerConfig, StateReconciler};

fn reconciler(dir: &std::path::Path) -> StateReconciler {
    StateReconciler::new(ReconcilerConfig::default().with_persist_path(dir))
}

fn bench_set_actuator(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = reconciler(dir.path());
    let station = StationName::new("tank-1").unwrap();
    let mut slot = 0u16;

    c.bench_function("set_actuator", |b| {
        b.iter(|| {
            slot = (slot + 1) % 64;
            black_box(
                store
                    .set_actuator(&station, slot, ActuatorCommand::Pwm, slot as u8, 2)
                    .unwrap(),
            )
        })
    });
}

fn bench_reconcile(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = reconciler(dir.path());
    let station = StationName::new("tank-1").unwrap();
    for slot in 0..64 {
        store
            .set_actuator(&station, slot, ActuatorCommand::Pwm, slot as u8, 2)
            .unwrap();
        store.set_pid_loop(&station, slot, PidMode::Auto, 1.0).unwrap();
    }
    let mut actual = store.get_desired(&station).unwrap();
    actual.actuators[10].pwm_duty = 255;

    c.bench_function("reconcile_64_actuators_64_loops", |b| {
        b.iter(|| black_box(store.reconcile(&station, Some(black_box(&actual))).unwrap()))
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = reconciler(dir.path());
    let station = StationName::new("tank-1").unwrap();
    for slot in 0..64 {
        store
            .set_actuator(&station, slot, ActuatorCommand::On, 0, 2)
            .unwrap();
    }

    c.bench_function("snapshot_64_actuators", |b| {
        b.iter(|| black_box(store.snapshot(&station).unwrap()))
    });
}

criterion_group!(benches, bench_set_actuator, bench_reconcile, bench_snapshot);
criterion_main!(benches);
