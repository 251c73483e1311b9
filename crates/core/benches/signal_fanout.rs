// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use labwired_avr_core::{LineFlags, SimulationConfig, System};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn raise_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("raise_fanout");
    for subscribers in [1usize, 8, 64] {
        let mut sys = System::new(SimulationConfig::default(), 0x100);
        let line = sys.alloc_lines(None, &["src"], LineFlags::empty()).get(0);
        let seen = Arc::new(AtomicU64::new(0));
        for _ in 0..subscribers {
            let seen = seen.clone();
            sys.register_notify(line, move |_, sig| {
                seen.fetch_add(u64::from(sig.value), Ordering::Relaxed);
            });
        }
        let mut value = 0u32;
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    value = value.wrapping_add(1);
                    sys.raise(black_box(line), value);
                })
            },
        );
    }
    group.finish();
}

fn raise_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("raise_chain");
    for length in [2usize, 16, 48] {
        let mut sys = System::new(SimulationConfig::default(), 0x100);
        let names: Vec<String> = (0..length).map(|i| format!("l{}", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let lines = sys.alloc_lines(None, &names, LineFlags::BINARY);
        for i in 1..lines.len() {
            sys.connect(lines.get(i - 1), lines.get(i));
        }
        let head = lines.get(0);
        let mut level = 0u32;
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            b.iter(|| {
                level ^= 1;
                sys.raise(head, level);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, raise_fanout, raise_chain);
criterion_main!(benches);
