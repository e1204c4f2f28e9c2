// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tree-shaped collective operations.
//!
//! Every participant of the topology calls the same operation once per
//! collective round; the calls rendezvous along the tree edges. Broadcast
//! flows root-down, reduction leaf-up, both preserving the per-edge send
//! order the topology encodes.

use crate::message::Message;
use crate::topology::Topology;
use crate::transport::mesh::MeshPort;

/// Broadcast `msg` from the root to every core of `topo`.
///
/// The root passes the message to send; every other participant's `msg`
/// argument is ignored. Every participant (the root included) returns the
/// broadcast message.
pub fn broadcast(topo: &Topology, port: &mut MeshPort, msg: Message) -> Message {
    let core = port.core();
    debug_assert!(topo.contains(core), "core {core} not in topology");

    let out = if core == topo.root() {
        msg
    } else {
        let parent = topo.parent(core).expect("non-root core has a parent");
        port.recv(parent)
    };

    for &child in topo.children(core) {
        port.send(child, &out);
    }
    out
}

/// Reduce every participant's `contribution` into one value at the root.
///
/// Each internal node receives from its children in send order and folds
/// them left-to-right into its own contribution with `op`; the root
/// returns the final fold, every other participant returns its partial
/// fold after forwarding it up.
pub fn reduce<F>(topo: &Topology, port: &mut MeshPort, contribution: Message, op: F) -> Message
where
    F: Fn(&Message, &Message) -> Message,
{
    let core = port.core();
    debug_assert!(topo.contains(core), "core {core} not in topology");

    let mut acc = contribution;
    for &child in topo.children(core) {
        let from_child = port.recv(child);
        acc = op(&acc, &from_child);
    }

    if let Some(parent) = topo.parent(core) {
        port.send(parent, &acc);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Tag;
    use crate::transport::mesh::Mesh;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_broadcast_reaches_every_core() {
        let cores = [0u8, 1, 2, 3, 4, 5];
        let topo = Arc::new(Topology::generate(&cores, 2).unwrap());
        let mesh = Mesh::new(6);

        let handles: Vec<_> = cores[1..]
            .iter()
            .map(|&c| {
                let topo = Arc::clone(&topo);
                let mesh = Arc::clone(&mesh);
                thread::spawn(move || {
                    let mut port = mesh.port(c);
                    broadcast(&topo, &mut port, Message::default()).payload()[0]
                })
            })
            .collect();

        let mut root_port = mesh.port(0);
        let mut msg = Message::new(Tag::Request);
        msg.set_payload([77, 0, 0]);
        let back = broadcast(&topo, &mut root_port, msg);
        assert_eq!(back.payload()[0], 77);

        for h in handles {
            assert_eq!(h.join().unwrap(), 77);
        }
    }

    #[test]
    fn test_reduce_sums_contributions() {
        let cores = [0u8, 1, 2, 3, 4];
        let topo = Arc::new(Topology::generate(&cores, 2).unwrap());
        let mesh = Mesh::new(5);

        let sum = |a: &Message, b: &Message| {
            let mut out = *a;
            out.set_payload([a.payload()[0] + b.payload()[0], 0, 0]);
            out
        };

        let handles: Vec<_> = cores[1..]
            .iter()
            .map(|&c| {
                let topo = Arc::clone(&topo);
                let mesh = Arc::clone(&mesh);
                thread::spawn(move || {
                    let mut port = mesh.port(c);
                    let mut msg = Message::default();
                    msg.set_payload([c as u64, 0, 0]);
                    reduce(&topo, &mut port, msg, sum);
                })
            })
            .collect();

        let mut root_port = mesh.port(0);
        let mut own = Message::default();
        own.set_payload([0, 0, 0]);
        let folded = reduce(&topo, &mut root_port, own, sum);
        assert_eq!(folded.payload()[0], 1 + 2 + 3 + 4);

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_broadcast_then_reduce_round() {
        // The two-phase-commit shape: command down, votes up, repeated.
        let cores = [0u8, 1, 2];
        let topo = Arc::new(Topology::generate(&cores, 2).unwrap());
        let mesh = Mesh::new(3);
        let keep_first = |a: &Message, _b: &Message| *a;

        let handles: Vec<_> = cores[1..]
            .iter()
            .map(|&c| {
                let topo = Arc::clone(&topo);
                let mesh = Arc::clone(&mesh);
                thread::spawn(move || {
                    let mut port = mesh.port(c);
                    for round in 0..50u64 {
                        let cmd = broadcast(&topo, &mut port, Message::default());
                        assert_eq!(cmd.payload()[0], round);
                        reduce(&topo, &mut port, cmd, keep_first);
                    }
                })
            })
            .collect();

        let mut port = mesh.port(0);
        for round in 0..50u64 {
            let mut cmd = Message::new(Tag::TpcPrepare);
            cmd.set_payload([round, 0, 0]);
            let sent = broadcast(&topo, &mut port, cmd);
            let gathered = reduce(&topo, &mut port, sent, keep_first);
            assert_eq!(gathered.payload()[0], round);
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
