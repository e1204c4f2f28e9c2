// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end: Raft-style replication under client load, with heartbeats
//! keeping the followers from electing.

mod common;

use common::{assert_same_sequence, recording_factory, wait_for_count};
use strata::engine::{Engine, EngineConfig};
use strata::Algorithm;

#[test]
fn raft_applies_in_log_order() {
    const N: u64 = 200;

    common::init_logging();
    let (factory, registry) = recording_factory();
    let engine = Engine::init(EngineConfig {
        total_cores: 8,
        tier1: Algorithm::Raft,
        tier1_cores: vec![0, 1, 2],
        tier2: Algorithm::None,
        node_cores: vec![vec![], vec![], vec![]],
        client_cores: vec![3],
        kvs_keys: 64,
        use_tree: false,
        apply_factory: Some(factory),
    })
    .expect("engine init");

    let mut session = engine.client(3);
    for rid in 0..N {
        session.send_request([rid % 10, rid, 22]);
    }
    assert_eq!(session.request_count(), N as u32);

    let recorders = registry.lock().unwrap().clone();
    assert_eq!(recorders.len(), 3);
    wait_for_count(&recorders, N as usize);
    assert_same_sequence(&recorders);

    let applied: Vec<u64> = recorders[0].1.snapshot().iter().map(|p| p[1]).collect();
    assert_eq!(applied, (0..N).collect::<Vec<u64>>());

    drop(session);
    engine.shutdown();
}

#[test]
fn raft_stays_quiet_without_load() {
    // heartbeats must suppress elections on an idle cluster
    common::init_logging();
    let (factory, registry) = recording_factory();
    let engine = Engine::init(EngineConfig {
        total_cores: 8,
        tier1: Algorithm::Raft,
        tier1_cores: vec![0, 1, 2],
        tier2: Algorithm::None,
        node_cores: vec![vec![], vec![], vec![]],
        client_cores: vec![3],
        kvs_keys: 64,
        use_tree: false,
        apply_factory: Some(factory),
    })
    .expect("engine init");

    // several election-timeout periods of silence
    std::thread::sleep(std::time::Duration::from_millis(1200));

    // a request still commits afterwards, through the original leader
    let mut session = engine.client(3);
    session.send_request([1, 1, 1]);

    let recorders = registry.lock().unwrap().clone();
    wait_for_count(&recorders, 1);
    assert_same_sequence(&recorders);

    drop(session);
    engine.shutdown();
}
