// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hot-path latency of the SPMC ring and the UMP channel.

use criterion::{criterion_group, criterion_main, Criterion};

use strata::message::{Message, Tag};
use strata::transport::shm::ShmQueue;
use strata::transport::ump::ChannelPair;

fn ring_send_recv(c: &mut Criterion) {
    let (mut writer, mut readers) = ShmQueue::create(256, 1).expect("ring");
    let mut reader = readers.remove(0);
    let msg = Message::new(Tag::Request);

    c.bench_function("ring_send_recv", |b| {
        b.iter(|| {
            writer.send(&msg);
            criterion::black_box(reader.recv());
        });
    });
}

fn channel_round_trip(c: &mut Criterion) {
    let (mut a, mut b) = ChannelPair::create(64).expect("channel");
    let msg = Message::new(Tag::Request);

    c.bench_function("channel_round_trip", |bench| {
        bench.iter(|| {
            a.send(&msg);
            let got = b.recv();
            b.send(&got);
            criterion::black_box(a.recv());
        });
    });
}

criterion_group!(benches, ring_send_recv, channel_round_trip);
criterion_main!(benches);
