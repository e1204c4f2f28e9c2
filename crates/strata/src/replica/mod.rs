// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol state machines.
//!
//! All tier-1 protocols expose the same abstract machine: for every
//! REQUEST accepted by the leader, exactly one commit applied by every
//! replica in one agreed order. Tier-2 runs the same machines restricted
//! to one node (with the tier-1 replica as the single client), or the
//! shared-memory fan-out of [`shm_fanout`].
//!
//! Cross-cutting rules implemented in [`ReplicaBase`]:
//!
//! - at-most-once execution per `(client, request_id)` via the
//!   `last_applied_rid` table,
//! - responses go to the client core at node level and to `started_from`
//!   at core level,
//! - when a tier-2 engine is configured, a committed command is pushed
//!   down (and acknowledged) before the response is released.

pub mod broadcast;
pub mod chain;
pub mod paxos;
pub mod raft;
pub mod shm_fanout;
pub mod tpc;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::core_layer::CoreLayer;
use crate::kvs::Apply;
use crate::message::{Message, Tag};
use crate::transport::mesh::MeshPort;
use crate::{Error, Result};

/// Protocol selector. The integer ids are the CLI interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Paxos,
    TwoPhase,
    Broadcast,
    Chain,
    Raft,
    Shm,
    None,
}

impl Algorithm {
    pub fn from_id(id: u8) -> Result<Algorithm> {
        Ok(match id {
            0 => Algorithm::Paxos,
            1 => Algorithm::TwoPhase,
            2 => Algorithm::Broadcast,
            3 => Algorithm::Chain,
            4 => Algorithm::Raft,
            5 => Algorithm::Shm,
            6 => Algorithm::None,
            _ => {
                return Err(Error::InvalidConfiguration(format!(
                    "unknown protocol id {id}"
                )))
            }
        })
    }

    pub fn id(self) -> u8 {
        match self {
            Algorithm::Paxos => 0,
            Algorithm::TwoPhase => 1,
            Algorithm::Broadcast => 2,
            Algorithm::Chain => 3,
            Algorithm::Raft => 4,
            Algorithm::Shm => 5,
            Algorithm::None => 6,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Paxos => "1paxos",
            Algorithm::TwoPhase => "tpc",
            Algorithm::Broadcast => "broadcast",
            Algorithm::Chain => "chain",
            Algorithm::Raft => "raft",
            Algorithm::Shm => "shm",
            Algorithm::None => "none",
        };
        f.write_str(name)
    }
}

/// Which tier a replica runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Tier-1: representative cores across nodes; replies go to clients.
    Node,
    /// Tier-2: inside one node; replies go to `started_from`.
    Core,
}

/// Everything needed to start one replica thread.
#[derive(Debug, Clone)]
pub struct ReplicaSpec {
    pub id: u8,
    pub core: u8,
    pub algorithm: Algorithm,
    pub level: Level,
    pub alg_below: Algorithm,
    /// Core of each replica of this protocol instance, indexed by id.
    pub replicas: Vec<u8>,
    /// Core of each client, indexed by client id.
    pub clients: Vec<u8>,
    /// This node's tier-2 cores (tier-1 replicas only).
    pub node_cores: Vec<u8>,
    /// Core of the tier-1 replica that started this instance.
    pub started_from: u8,
}

/// State shared by every protocol variant. Owned by its thread; only the
/// stop flag and the committed counter are shared.
pub(crate) struct ReplicaBase {
    pub spec: ReplicaSpec,
    pub port: MeshPort,
    pub apply: Arc<dyn Apply>,
    pub below: Option<CoreLayer>,
    stop: Arc<AtomicBool>,
    committed: Arc<AtomicU64>,
    /// Highest applied request id per client; the at-most-once filter.
    last_applied_rid: Vec<Option<u64>>,
}

impl ReplicaBase {
    pub(crate) fn new(
        spec: ReplicaSpec,
        port: MeshPort,
        apply: Arc<dyn Apply>,
        below: Option<CoreLayer>,
        stop: Arc<AtomicBool>,
        committed: Arc<AtomicU64>,
    ) -> ReplicaBase {
        ReplicaBase {
            spec,
            port,
            apply,
            below,
            stop,
            committed,
            last_applied_rid: vec![None; crate::MAX_NUM_CLIENTS],
        }
    }

    #[inline]
    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Apply a committed command unless `(client, rid)` was applied
    /// before. Returns whether the up-call ran.
    pub(crate) fn execute(&mut self, msg: &Message) -> bool {
        let cid = msg.client_id() as usize;
        if cid >= self.last_applied_rid.len() {
            log::warn!(
                "replica {}: client id {cid} out of range, command dropped",
                self.spec.id
            );
            return false;
        }
        let rid = msg.request_id() as u64;
        if let Some(last) = self.last_applied_rid[cid] {
            if rid <= last {
                return false;
            }
        }
        self.apply.apply(&msg.payload());
        self.last_applied_rid[cid] = Some(rid);
        true
    }

    /// Push a committed command to this node's tier-2 engine and wait for
    /// its acknowledgement. No-op when no engine is stacked below.
    pub(crate) fn forward_below(&mut self, msg: &Message) {
        if let Some(layer) = self.below.as_mut() {
            layer.send_request(&mut self.port, msg);
        }
    }

    /// Release the response for a committed command.
    pub(crate) fn respond(&mut self, msg: &Message) {
        match self.spec.level {
            Level::Node => self.respond_to_client(msg),
            Level::Core => {
                let mut out = *msg;
                out.set_tag(Tag::Response);
                let dest = self.spec.started_from;
                self.port.send(dest, &out);
            }
        }
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Send a RESPONSE to the client that issued this command.
    pub(crate) fn respond_to_client(&mut self, msg: &Message) {
        let cid = msg.client_id() as usize;
        let Some(&client_core) = self.spec.clients.get(cid) else {
            log::warn!(
                "replica {}: response for unknown client {cid} dropped",
                self.spec.id
            );
            return;
        };
        let mut out = *msg;
        out.set_tag(Tag::Response);
        self.port.send(client_core, &out);
    }

    /// SETUP: answer with the client's index in our membership table.
    /// The reply carries the assigned id in payload word 0 and goes back
    /// to the requesting core, so a repeated SETUP yields the same id.
    pub(crate) fn handle_setup(&mut self, msg: &Message) {
        let requester = msg.client_id() as u8;
        let Some(idx) = self.spec.clients.iter().position(|&c| c == requester) else {
            log::warn!(
                "replica {}: SETUP from unknown core {requester} dropped",
                self.spec.id
            );
            return;
        };
        let mut reply = *msg;
        let payload = [idx as u64, 0, 0];
        reply.set_payload(payload);
        self.port.send(requester, &reply);
    }

    /// Forward a client REQUEST to another replica (the current leader).
    pub(crate) fn forward_to(&mut self, replica_id: u8, msg: &Message) {
        let core = self.spec.replicas[replica_id as usize];
        self.port.send(core, msg);
    }

    pub(crate) fn num_replicas(&self) -> usize {
        self.spec.replicas.len()
    }

    #[cfg(test)]
    pub(crate) fn port_mesh_for_tests(&self) -> Arc<crate::transport::mesh::Mesh> {
        Arc::clone(self.port.mesh())
    }

    /// Unexpected message for this role: log and drop.
    pub(crate) fn violation(&self, what: &str, msg: &Message) {
        log::warn!(
            "replica {}: {what} (tag {:?}), message dropped",
            self.spec.id,
            msg.tag()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvs::KvStore;
    use crate::transport::mesh::Mesh;

    /// Replica base bound to `core` on an existing mesh. The canonical
    /// test layout: replicas at cores 0,1,2 and clients from core 10 up.
    pub(crate) fn base_on(
        mesh: &Arc<Mesh>,
        id: u8,
        core: u8,
        num_clients: usize,
    ) -> (ReplicaBase, Arc<KvStore>) {
        let store = Arc::new(KvStore::new(64));
        let spec = ReplicaSpec {
            id,
            core,
            algorithm: Algorithm::Broadcast,
            level: Level::Node,
            alg_below: Algorithm::None,
            replicas: vec![0, 1, 2],
            clients: (0..num_clients as u8).map(|i| 10 + i).collect(),
            node_cores: vec![],
            started_from: 0,
        };
        let base = ReplicaBase::new(
            spec,
            mesh.port(core),
            store.clone() as Arc<dyn Apply>,
            None,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU64::new(0)),
        );
        (base, store)
    }

    pub(crate) fn test_base(num_clients: usize) -> (ReplicaBase, Arc<KvStore>) {
        base_on(&Mesh::new(16), 0, 0, num_clients)
    }

    #[test]
    fn test_execute_applies_once_per_rid() {
        let (mut base, store) = test_base(1);
        let msg = Message::request(0, 1, [5, 100, 200]);

        assert!(base.execute(&msg));
        assert_eq!(store.get(5).unwrap(), (100, 200));

        // same rid again: suppressed
        let replay = Message::request(0, 1, [5, 999, 999]);
        assert!(!base.execute(&replay));
        assert_eq!(store.get(5).unwrap(), (100, 200));

        // stale rid: suppressed
        let stale = Message::request(0, 0, [5, 111, 111]);
        assert!(!base.execute(&stale));

        // next rid: applied
        assert!(base.execute(&Message::request(0, 2, [5, 1, 2])));
        assert_eq!(store.get(5).unwrap(), (1, 2));
    }

    #[test]
    fn test_execute_tracks_clients_independently() {
        let (mut base, _) = test_base(2);
        assert!(base.execute(&Message::request(0, 1, [1, 0, 0])));
        assert!(base.execute(&Message::request(1, 1, [2, 0, 0])));
        assert!(!base.execute(&Message::request(0, 1, [1, 0, 0])));
    }

    #[test]
    fn test_algorithm_ids_roundtrip() {
        for id in 0..=6 {
            assert_eq!(Algorithm::from_id(id).unwrap().id(), id);
        }
        assert!(Algorithm::from_id(7).is_err());
    }
}
