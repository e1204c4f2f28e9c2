// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application up-call and the demo key-value store.
//!
//! Every replica holds one [`Apply`] implementor and invokes it exactly
//! once per committed command. The supplied [`KvStore`] interprets the
//! payload as `{key, v1, v2}` and writes `kvs[2k] = v1; kvs[2k+1] = v2`
//! into replica-local memory.
//!
//! Clients on the same node read the store directly, without entering the
//! protocol. The cells are relaxed atomics: the reader accepts the
//! staleness inherent in a read racing a commit, exactly the coherence
//! contract the original relies on.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::Payload;

/// Number of keys a store holds by default.
pub const DEFAULT_KVS_KEYS: usize = 4096;

/// Committed-command up-call.
///
/// Implementors must be cheap and infallible: the protocols treat apply
/// as the commit point and never roll it back.
pub trait Apply: Send + Sync {
    fn apply(&self, payload: &Payload);
}

/// No-op up-call for protocol-only deployments.
pub struct NullApply;

impl Apply for NullApply {
    fn apply(&self, _payload: &Payload) {}
}

/// Replica-local key-value state.
pub struct KvStore {
    cells: Box<[AtomicU64]>,
    max_key: u64,
}

impl KvStore {
    pub fn new(num_keys: usize) -> KvStore {
        let cells = (0..num_keys * 2).map(|_| AtomicU64::new(0)).collect();
        KvStore {
            cells,
            max_key: num_keys.saturating_sub(1) as u64,
        }
    }

    /// Largest valid key.
    pub fn max_key(&self) -> u64 {
        self.max_key
    }

    /// Direct node-local read; never enters the protocol.
    pub fn get(&self, key: u64) -> crate::Result<(u64, u64)> {
        if key > self.max_key {
            return Err(crate::Error::KeyOutOfRange {
                key,
                max: self.max_key,
            });
        }
        let k = key as usize;
        Ok((
            self.cells[2 * k].load(Ordering::Relaxed),
            self.cells[2 * k + 1].load(Ordering::Relaxed),
        ))
    }
}

impl Apply for KvStore {
    fn apply(&self, payload: &Payload) {
        let key = payload[0];
        if key > self.max_key {
            // Dropping here would diverge replicas if any peer accepted
            // the key, so the client validates before submitting; this
            // guard only catches misbehaving clients.
            log::error!("kvs: key {key} too large (max {}), command dropped", self.max_key);
            return;
        }
        let k = key as usize;
        self.cells[2 * k].store(payload[1], Ordering::Relaxed);
        self.cells[2 * k + 1].store(payload[2], Ordering::Relaxed);
    }
}
