// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Simple broadcast ordering.
//!
//! The leader's local sequence IS the total order: on REQUEST it
//! broadcasts BROAD_COMMIT to every follower, applies locally and replies
//! to the client without waiting for follower acknowledgement. This
//! trades safety under leader failure (a reply may precede follower
//! delivery) for the best throughput of the five protocols; the trade-off
//! is intentional and documented.

use crate::message::{Message, Tag};
use crate::replica::ReplicaBase;
use crate::transport::shm::ring::Spinner;

pub struct BroadcastReplica {
    base: ReplicaBase,
}

impl BroadcastReplica {
    pub(crate) fn new(base: ReplicaBase) -> BroadcastReplica {
        BroadcastReplica { base }
    }

    fn is_leader(&self) -> bool {
        self.base.spec.id == 0
    }

    pub(crate) fn handle(&mut self, msg: Message) {
        match msg.tag() {
            Some(Tag::Setup) => self.base.handle_setup(&msg),
            Some(Tag::Request) => self.handle_request(msg),
            Some(Tag::BroadCommit) => self.handle_commit(&msg),
            _ => self.base.violation("unexpected message", &msg),
        }
    }

    fn handle_request(&mut self, mut msg: Message) {
        if !self.is_leader() {
            self.base.forward_to(0, &msg);
            return;
        }
        msg.set_tag(Tag::BroadCommit);
        for id in 1..self.base.num_replicas() as u8 {
            self.base.forward_to(id, &msg);
        }
        self.base.forward_below(&msg);
        self.base.execute(&msg);
        self.base.respond(&msg);
    }

    fn handle_commit(&mut self, msg: &Message) {
        if self.is_leader() {
            self.base.violation("leader received commit", msg);
            return;
        }
        self.base.forward_below(msg);
        self.base.execute(msg);
    }

    pub(crate) fn run(&mut self) {
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
}
