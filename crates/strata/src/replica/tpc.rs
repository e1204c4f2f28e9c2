// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-phase commit ordering.
//!
//! The leader (replica 0) broadcasts PREPARE, counts READY votes, and at
//! quorum (all followers in this model) assigns the next index,
//! broadcasts COMMIT, applies and replies. Orderedness comes from the
//! single monotonically assigned index at the leader.
//!
//! When a tree topology is supplied, PREPARE/COMMIT travel down the tree
//! as collective broadcasts and READY is gathered by tree reduction
//! instead of point-to-point fan-in.

use std::sync::Arc;

use crate::message::{Message, Tag};
use crate::replica::ReplicaBase;
use crate::topology::{collective, Topology};
use crate::transport::shm::ring::Spinner;

pub struct TpcReplica {
    base: ReplicaBase,
    /// Next index to assign; leader only.
    index: u64,
    /// Outstanding READY votes per client request; leader only.
    ready_counter: Vec<u8>,
    /// Collective-operation mode when present.
    topo: Option<Arc<Topology>>,
}

impl TpcReplica {
    pub(crate) fn new(base: ReplicaBase, topo: Option<Arc<Topology>>) -> TpcReplica {
        TpcReplica {
            base,
            index: 0,
            ready_counter: vec![0; crate::MAX_NUM_CLIENTS],
            topo,
        }
    }

    fn is_leader(&self) -> bool {
        self.base.spec.id == 0
    }

    pub(crate) fn handle(&mut self, msg: Message) {
        match msg.tag() {
            Some(Tag::Setup) => self.base.handle_setup(&msg),
            Some(Tag::Request) => self.handle_request(msg),
            Some(Tag::TpcPrepare) => self.handle_prepare(msg),
            Some(Tag::TpcReady) => self.handle_ready(msg),
            Some(Tag::TpcCommit) => self.handle_commit(&msg),
            _ => self.base.violation("unexpected message", &msg),
        }
    }

    fn handle_request(&mut self, mut msg: Message) {
        if !self.is_leader() {
            self.base.forward_to(0, &msg);
            return;
        }
        self.ready_counter[msg.client_id() as usize] = 0;
        msg.set_tag(Tag::TpcPrepare);
        for id in 1..self.base.num_replicas() as u8 {
            self.base.forward_to(id, &msg);
        }
        // single-replica degenerate case: quorum is empty
        if self.base.num_replicas() == 1 {
            self.commit(msg);
        }
    }

    fn handle_prepare(&mut self, mut msg: Message) {
        if self.is_leader() {
            self.base.violation("leader received prepare", &msg);
            return;
        }
        msg.set_tag(Tag::TpcReady);
        self.base.forward_to(0, &msg);
    }

    fn handle_ready(&mut self, msg: Message) {
        if !self.is_leader() {
            self.base.violation("follower received ready", &msg);
            return;
        }
        let cid = msg.client_id() as usize;
        self.ready_counter[cid] += 1;
        if self.ready_counter[cid] as usize >= self.base.num_replicas() - 1 {
            self.commit(msg);
        }
    }

    /// Quorum reached: assign the index, broadcast COMMIT, apply, reply.
    fn commit(&mut self, mut msg: Message) {
        msg.set_tag(Tag::TpcCommit);
        self.index += 1;
        msg.set_index(self.index);
        for id in 1..self.base.num_replicas() as u8 {
            self.base.forward_to(id, &msg);
        }
        self.base.execute(&msg);
        self.base.forward_below(&msg);
        self.base.respond(&msg);
    }

    fn handle_commit(&mut self, msg: &Message) {
        if self.is_leader() {
            self.base.violation("leader received commit", msg);
            return;
        }
        self.base.execute(msg);
        self.base.forward_below(msg);
    }

    pub(crate) fn run(&mut self) {
        match self.topo.clone() {
            Some(topo) => self.run_tree(&topo),
            None => self.run_direct(),
        }
    }

    fn run_direct(&mut self) {
        let leader_core = self.base.spec.replicas[0];
        let replicas = self.base.spec.replicas.clone();
        let clients = self.base.spec.clients.clone();
        let mut spin = Spinner::new();

        while !self.base.should_stop() {
            let mut worked = false;
            if self.is_leader() {
                for &peer in replicas.iter().skip(1).chain(clients.iter()) {
                    if let Some(msg) = self.base.port.try_recv(peer) {
                        self.handle(msg);
                        worked = true;
                    }
                }
            } else if let Some(msg) = self.base.port.try_recv(leader_core) {
                self.handle(msg);
                worked = true;
            }
            if worked {
                spin.reset();
            } else {
                spin.idle();
            }
        }
    }

    /// Collective mode. Each request is one lockstep round over the tree:
    /// broadcast PREPARE, reduce READY, broadcast COMMIT.
    fn run_tree(&mut self, topo: &Arc<Topology>) {
        let clients = self.base.spec.clients.clone();
        let keep_first = |a: &Message, _: &Message| *a;
        let mut spin = Spinner::new();

        if self.is_leader() {
            while !self.base.should_stop() {
                let mut worked = false;
                for &client in &clients {
                    if let Some(msg) = self.base.port.try_recv(client) {
                        worked = true;
                        match msg.tag() {
                            Some(Tag::Setup) => self.base.handle_setup(&msg),
                            Some(Tag::Request) => {
                                let mut prep = msg;
                                prep.set_tag(Tag::TpcPrepare);
                                collective::broadcast(topo, &mut self.base.port, prep);
                                collective::reduce(topo, &mut self.base.port, prep, keep_first);

                                let mut commit = msg;
                                commit.set_tag(Tag::TpcCommit);
                                self.index += 1;
                                commit.set_index(self.index);
                                collective::broadcast(topo, &mut self.base.port, commit);
                                self.base.execute(&commit);
                                self.base.forward_below(&commit);
                                self.base.respond(&commit);
                            }
                            _ => self.base.violation("unexpected message", &msg),
                        }
                    }
                }
                if worked {
                    spin.reset();
                } else {
                    spin.idle();
                }
            }
        } else {
            let parent = topo
                .parent(self.base.spec.core)
                .expect("non-root replica has a parent");
            while !self.base.should_stop() {
                if !self.base.port.can_recv(parent) {
                    spin.idle();
                    continue;
                }
                spin.reset();
                let msg = collective::broadcast(topo, &mut self.base.port, Message::default());
                match msg.tag() {
                    Some(Tag::TpcPrepare) => {
                        let mut ready = msg;
                        ready.set_tag(Tag::TpcReady);
                        collective::reduce(topo, &mut self.base.port, ready, keep_first);
                    }
                    Some(Tag::TpcCommit) => {
                        self.base.execute(&msg);
                        self.base.forward_below(&msg);
                    }
                    _ => self.base.violation("unexpected broadcast", &msg),
                }
            }
        }
    }
}
