//! Dispatch-table hot path: assignment churn and wait-set reconciliation.

use criterion::{criterion_group, criterion_main, Criterion};

use svcmux_runtime::DispatchTable;
use svcmux_core::registry::{Interest, Pollable};

fn bench_assign_release(c: &mut Criterion) {
    let table = DispatchTable::new();
    let worker = table.allocate_id();

    c.bench_function("assign_release", |b| {
        b.iter(|| {
            table.assign(7, worker);
            table.release(7, worker);
        })
    });
}

fn bench_reconcile(c: &mut Criterion) {
    let table = DispatchTable::new();
    let snapshot: Vec<Pollable> = (0..1024)
        .map(|descriptor| Pollable {
            descriptor,
            interest: Interest::READ,
        })
        .collect();
    for descriptor in 0..128 {
        table.assign(descriptor, table.allocate_id());
    }

    c.bench_function("reconcile_1024_pollables_128_busy", |b| {
        b.iter(|| table.reconcile(&snapshot))
    });
}

criterion_group!(benches, bench_assign_release, bench_reconcile);
criterion_main!(benches);
