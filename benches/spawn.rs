// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use corio::{CoroExt, EventLoop, sleep, yield_now};
use criterion::{Criterion, criterion_group, criterion_main};
use std::time::Duration;

fn spawn_1k_yielders(c: &mut Criterion) {
    c.bench_function("spawn_1k_yielders", |b| {
        b.iter(|| {
            let lp = EventLoop::new().unwrap();
            for _ in 0..1_000 {
                lp.spawn(yield_now().and_then(|()| yield_now()));
            }
            lp.run_forever().unwrap();
        });
    });
}

fn spawn_1k_zero_sleepers(c: &mut Criterion) {
    c.bench_function("spawn_1k_zero_sleepers", |b| {
        b.iter(|| {
            let lp = EventLoop::new().unwrap();
            for _ in 0..1_000 {
                lp.spawn(sleep(Duration::ZERO));
            }
            lp.run_forever().unwrap();
        });
    });
}

criterion_group!(benches, spawn_1k_yielders, spawn_1k_zero_sleepers);
criterion_main!(benches);
