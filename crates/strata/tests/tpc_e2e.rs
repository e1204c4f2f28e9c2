// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end: two-phase commit with two concurrent clients. All
//! replicas must apply the same total order with no duplicates.

mod common;

use std::collections::HashSet;

use common::{assert_same_sequence, recording_factory, wait_for_count};
use strata::engine::{Engine, EngineConfig};
use strata::Algorithm;

#[test]
fn two_clients_agree_on_one_order() {
    const PER_CLIENT: u64 = 300;

    common::init_logging();
    let (factory, registry) = recording_factory();
    let engine = Engine::init(EngineConfig {
        total_cores: 8,
        tier1: Algorithm::TwoPhase,
        tier1_cores: vec![0, 1, 2],
        tier2: Algorithm::None,
        node_cores: vec![vec![], vec![], vec![]],
        client_cores: vec![3, 4],
        kvs_keys: 64,
        use_tree: false,
        apply_factory: Some(factory),
    })
    .expect("engine init");

    let mut workers = Vec::new();
    for client_core in [3u8, 4] {
        let mut session = engine.client(client_core);
        workers.push(std::thread::spawn(move || {
            let marker = session.id() as u64;
            for rid in 0..PER_CLIENT {
                session.send_request([0, rid, marker]);
            }
            session.request_count() as u64
        }));
    }
    let total: u64 = workers
        .into_iter()
        .map(|w| w.join().expect("client panicked"))
        .sum();
    assert_eq!(total, 2 * PER_CLIENT, "every request got its response");

    let recorders = registry.lock().unwrap().clone();
    assert_eq!(recorders.len(), 3);
    wait_for_count(&recorders, 2 * PER_CLIENT as usize);
    assert_same_sequence(&recorders);

    let reference = recorders[0].1.snapshot();

    // no duplicate applications
    let unique: HashSet<_> = reference.iter().map(|p| (p[1], p[2])).collect();
    assert_eq!(unique.len(), reference.len());
    assert_eq!(reference.len(), 2 * PER_CLIENT as usize);

    // per-client requests appear in issue order
    for marker in reference.iter().map(|p| p[2]).collect::<HashSet<_>>() {
        let rids: Vec<u64> = reference
            .iter()
            .filter(|p| p[2] == marker)
            .map(|p| p[1])
            .collect();
        assert!(rids.windows(2).all(|w| w[0] < w[1]));
    }

    engine.shutdown();
}

#[test]
fn tree_collectives_carry_the_same_contract() {
    const N: u64 = 100;

    common::init_logging();
    let (factory, registry) = recording_factory();
    let engine = Engine::init(EngineConfig {
        total_cores: 8,
        tier1: Algorithm::TwoPhase,
        tier1_cores: vec![0, 1, 2],
        tier2: Algorithm::None,
        node_cores: vec![vec![], vec![], vec![]],
        client_cores: vec![3],
        kvs_keys: 64,
        use_tree: true,
        apply_factory: Some(factory),
    })
    .expect("engine init");

    let mut session = engine.client(3);
    for rid in 0..N {
        session.send_request([rid % 4, rid, 7]);
    }

    let recorders = registry.lock().unwrap().clone();
    wait_for_count(&recorders, N as usize);
    assert_same_sequence(&recorders);

    drop(session);
    engine.shutdown();
}
