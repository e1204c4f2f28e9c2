// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end: shared-memory fan-out as the sole protocol. One writer,
//! several readers, every reader sees the full sequence in order.

mod common;

use common::{recording_factory, wait_for_count};
use strata::engine::{Engine, EngineConfig};
use strata::Algorithm;

#[test]
fn every_reader_observes_the_full_sequence() {
    const N: u64 = 10_000;

    common::init_logging();
    let (factory, registry) = recording_factory();
    let engine = Engine::init(EngineConfig {
        total_cores: 8,
        tier1: Algorithm::Shm,
        tier1_cores: vec![0],
        tier2: Algorithm::None,
        node_cores: vec![vec![1, 2, 3, 4]],
        client_cores: vec![5],
        kvs_keys: 64,
        use_tree: false,
        apply_factory: Some(factory),
    })
    .expect("engine init");

    let mut session = engine.client(5);
    for rid in 0..N {
        // payload word 1 carries the sequence number
        session.send_request([0, rid, 0]);
    }

    let recorders = registry.lock().unwrap().clone();
    // writer core + 4 reader cores
    assert_eq!(recorders.len(), 5);
    wait_for_count(&recorders, N as usize);

    for (core, recorder) in &recorders {
        let seen: Vec<u64> = recorder.snapshot().iter().map(|p| p[1]).collect();
        assert_eq!(
            seen,
            (0..N).collect::<Vec<u64>>(),
            "core {core} missed or reordered messages"
        );
    }

    drop(session);
    engine.shutdown();
}

#[test]
fn shm_rejects_a_tier_below() {
    let err = Engine::init(EngineConfig {
        total_cores: 8,
        tier1: Algorithm::Shm,
        tier1_cores: vec![0],
        tier2: Algorithm::Broadcast,
        node_cores: vec![vec![1, 2]],
        client_cores: vec![3],
        kvs_keys: 16,
        use_tree: false,
        apply_factory: None,
    })
    .unwrap_err();
    assert!(matches!(err, strata::Error::InvalidConfiguration(_)));
}
