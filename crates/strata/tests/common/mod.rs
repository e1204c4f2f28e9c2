// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for the end-to-end tests.

// not every test binary uses every helper
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strata::engine::ApplyFactory;
use strata::kvs::Apply;
use strata::message::Payload;

/// Up-call that records every applied payload, so tests can compare the
/// exact apply sequence across replicas.
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Payload>>,
}

impl Recorder {
    pub fn snapshot(&self) -> Vec<Payload> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl Apply for Recorder {
    fn apply(&self, payload: &Payload) {
        self.seen.lock().unwrap().push(*payload);
    }
}

pub type Registry = Arc<Mutex<Vec<(u8, Arc<Recorder>)>>>;

/// Route `log` output into the test harness when `RUST_LOG` is set.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Factory installing one recorder per replica core.
pub fn recording_factory() -> (ApplyFactory, Registry) {
    let registry: Registry = Arc::default();
    let factory_registry = Arc::clone(&registry);
    let factory: ApplyFactory = Arc::new(move |core| {
        let recorder = Arc::new(Recorder::default());
        factory_registry
            .lock()
            .unwrap()
            .push((core, Arc::clone(&recorder)));
        recorder
    });
    (factory, registry)
}

/// Wait until every recorder applied at least `want` commands.
pub fn wait_for_count(recorders: &[(u8, Arc<Recorder>)], want: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if recorders.iter().all(|(_, r)| r.len() >= want) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "replicas did not apply all {want} commands"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Assert that every recorder holds exactly the same sequence.
pub fn assert_same_sequence(recorders: &[(u8, Arc<Recorder>)]) {
    let reference = recorders[0].1.snapshot();
    for (core, recorder) in &recorders[1..] {
        assert_eq!(
            recorder.snapshot(),
            reference,
            "replica on core {core} diverged"
        );
    }
}
