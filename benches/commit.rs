// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use criterion::{criterion_group, criterion_main, Criterion};
use edgefirst_overlay::{
    config::{OverlayConfig, SourceConfig},
    control::{ControlParam, OverlayControl},
    data::OverlayData,
    device::sim::SimBackend,
    format::YUYV,
    geometry::{Rect, Rotation},
};

pub fn benchmark_commit(c: &mut Criterion) {
    let sim = SimBackend::new().unwrap();
    let mut control = OverlayControl::new(sim, OverlayConfig::default()).unwrap();
    let id = control
        .create_overlay(640, 480, YUYV, SourceConfig::default())
        .unwrap();

    let mut group = c.benchmark_group("commit");
    group.bench_function("unchanged", |b| b.iter(|| control.commit(id).unwrap()));

    let windows = [Rect::new(0, 0, 240, 320), Rect::new(0, 0, 480, 640)];
    let rotations = [Rotation::Rotation90, Rotation::Rotation180];
    let mut n = 0;
    group.bench_function("changed", |b| {
        b.iter(|| {
            n += 1;
            control.set_position(id, windows[n % 2]).unwrap();
            control
                .set_parameter(id, ControlParam::Transform(rotations[n % 2].transform()))
                .unwrap();
            control.commit(id).unwrap();
        })
    });
    group.finish();
}

pub fn benchmark_queue(c: &mut Criterion) {
    let sim = SimBackend::new().unwrap();
    let config = OverlayConfig::default();
    let mut control = OverlayControl::new(sim.clone(), config).unwrap();
    let id = control
        .create_overlay(640, 480, YUYV, SourceConfig::default())
        .unwrap();
    control.commit(id).unwrap();

    let mut data = OverlayData::new(sim, config).unwrap();
    data.initialize(control.handle(id).unwrap()).unwrap();
    for buffer in 0..data.get_buffer_count().unwrap() {
        data.queue_buffer(buffer).unwrap();
    }

    c.bench_function("queue/dequeue", |b| {
        b.iter(|| {
            let buffer = data.dequeue_buffer().unwrap();
            data.queue_buffer(buffer).unwrap();
        })
    });
    data.close();
}

criterion_group!(benches, benchmark_commit, benchmark_queue);
criterion_main!(benches);
