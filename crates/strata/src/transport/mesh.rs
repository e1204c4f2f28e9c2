// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-core message fabric.
//!
//! The mesh gives every participating core a point-to-point address. Each
//! core claims exactly one [`MeshPort`]; the port lazily creates one UMP
//! channel per peer on first contact and caches its endpoint. Channel
//! cores live in a shared registry so both sides attach to the same
//! buffers regardless of which side talks first.
//!
//! This module is the transport collaborator the protocols program
//! against: send to a core, probe a core, receive from a core.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::message::Message;
use crate::transport::ump::{ChannelCore, Endpoint};
use crate::{Error, Result};

/// Default per-direction channel capacity in messages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Process-wide channel registry.
pub struct Mesh {
    total_cores: u8,
    capacity: usize,
    channels: DashMap<(u8, u8), Arc<ChannelCore>>,
    claimed: DashMap<u8, ()>,
}

impl Mesh {
    /// Mesh over `total_cores` addressable cores with default channel
    /// capacity.
    pub fn new(total_cores: u8) -> Arc<Mesh> {
        Mesh::with_capacity(total_cores, DEFAULT_CHANNEL_CAPACITY)
            .expect("default channel capacity is valid")
    }

    /// Mesh with an explicit per-direction channel capacity.
    pub fn with_capacity(total_cores: u8, capacity: usize) -> Result<Arc<Mesh>> {
        if !capacity.is_power_of_two() || capacity < 2 {
            return Err(Error::InvalidArgument(format!(
                "channel capacity must be a power of two >= 2, got {capacity}"
            )));
        }
        Ok(Arc::new(Mesh {
            total_cores,
            capacity,
            channels: DashMap::new(),
            claimed: DashMap::new(),
        }))
    }

    pub fn total_cores(&self) -> u8 {
        self.total_cores
    }

    fn channel(&self, a: u8, b: u8) -> Arc<ChannelCore> {
        let key = (a.min(b), a.max(b));
        self.channels
            .entry(key)
            .or_insert_with(|| {
                ChannelCore::new(self.capacity).expect("capacity validated at mesh creation")
            })
            .clone()
    }

    /// Claim the port for `core`.
    ///
    /// Each core is owned by exactly one thread; claiming a core twice is
    /// a wiring bug and asserts.
    pub fn port(self: &Arc<Self>, core: u8) -> MeshPort {
        assert!(
            core < self.total_cores,
            "core {core} outside the mesh (total {})",
            self.total_cores
        );
        assert!(
            self.claimed.insert(core, ()).is_none(),
            "core {core} claimed twice"
        );
        MeshPort {
            mesh: Arc::clone(self),
            core,
            links: HashMap::new(),
        }
    }
}

/// A core's endpoint into the mesh. Not shareable between threads.
pub struct MeshPort {
    mesh: Arc<Mesh>,
    core: u8,
    links: HashMap<u8, Endpoint>,
}

impl MeshPort {
    pub fn core(&self) -> u8 {
        self.core
    }

    pub(crate) fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    fn link(&mut self, peer: u8) -> &mut Endpoint {
        debug_assert_ne!(peer, self.core, "no self-channel");
        let mesh = &self.mesh;
        let core = self.core;
        self.links.entry(peer).or_insert_with(|| {
            let chan = mesh.channel(core, peer);
            let side = if core < peer { 0 } else { 1 };
            Endpoint::new(chan, side)
        })
    }

    /// Blocking send to `peer`.
    pub fn send(&mut self, peer: u8, msg: &Message) {
        self.link(peer).send(msg);
    }

    /// Non-blocking send; `false` when the channel window is full.
    pub fn try_send(&mut self, peer: u8, msg: &Message) -> bool {
        self.link(peer).try_send(msg)
    }

    /// Non-blocking receive from `peer`.
    pub fn try_recv(&mut self, peer: u8) -> Option<Message> {
        self.link(peer).try_recv()
    }

    /// Blocking receive from `peer`.
    pub fn recv(&mut self, peer: u8) -> Message {
        self.link(peer).recv()
    }

    /// Probe: a data message from `peer` is ready.
    pub fn can_recv(&mut self, peer: u8) -> bool {
        self.link(peer).can_recv()
    }
}

impl Drop for MeshPort {
    fn drop(&mut self) {
        self.mesh.claimed.remove(&self.core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Tag;
    use std::thread;

    fn tagged(n: u64) -> Message {
        let mut msg = Message::new(Tag::Request);
        msg.set_payload([n, 0, 0]);
        msg
    }

    #[test]
    fn test_two_core_exchange() {
        let mesh = Mesh::new(4);
        let mut p0 = mesh.port(0);
        let mut p1 = mesh.port(1);

        p0.send(1, &tagged(11));
        assert!(p1.can_recv(0));
        assert_eq!(p1.recv(0).payload()[0], 11);
        assert!(!p1.can_recv(0));

        p1.send(0, &tagged(22));
        assert_eq!(p0.recv(1).payload()[0], 22);
    }

    #[test]
    #[should_panic(expected = "claimed twice")]
    fn test_double_claim_asserts() {
        let mesh = Mesh::new(2);
        let _a = mesh.port(0);
        let _b = mesh.port(0);
    }

    #[test]
    fn test_claim_released_on_drop() {
        let mesh = Mesh::new(2);
        drop(mesh.port(0));
        let _again = mesh.port(0);
    }

    #[test]
    fn test_fanin_from_many_peers() {
        let mesh = Mesh::new(8);
        let mut hub = mesh.port(0);

        let handles: Vec<_> = (1..8u8)
            .map(|core| {
                let mesh = Arc::clone(&mesh);
                thread::spawn(move || {
                    let mut p = mesh.port(core);
                    for i in 0..100u64 {
                        p.send(0, &tagged(core as u64 * 1000 + i));
                    }
                })
            })
            .collect();

        let mut per_peer: HashMap<u8, u64> = HashMap::new();
        let mut total = 0;
        while total < 700 {
            for core in 1..8u8 {
                if let Some(msg) = hub.try_recv(core) {
                    let v = msg.payload()[0];
                    let expect = per_peer.entry(core).or_insert(0);
                    // per-channel FIFO: values from one peer arrive in order
                    assert_eq!(v, core as u64 * 1000 + *expect);
                    *expect += 1;
                    total += 1;
                }
            }
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
