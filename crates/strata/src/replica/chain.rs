// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Chain replication.
//!
//! Fixed linear order over the replicas: replica 0 is the head, replica
//! `n-1` the tail. The head turns a REQUEST into CHAIN_COMMIT and sends
//! it right; every middle replica applies and forwards right; the tail
//! applies and is the only replica that ever talks to the client. Order
//! is the head's receive order, carried down the chain by per-channel
//! FIFO.

use crate::message::{Message, Tag};
use crate::replica::ReplicaBase;
use crate::transport::shm::ring::Spinner;

pub struct ChainReplica {
    base: ReplicaBase,
    is_tail: bool,
}

impl ChainReplica {
    pub(crate) fn new(base: ReplicaBase) -> ChainReplica {
        let is_tail = base.spec.id as usize == base.spec.replicas.len() - 1;
        ChainReplica { base, is_tail }
    }

    fn is_head(&self) -> bool {
        self.base.spec.id == 0
    }

    pub(crate) fn handle(&mut self, msg: Message) {
        match msg.tag() {
            Some(Tag::Setup) => self.base.handle_setup(&msg),
            Some(Tag::Request) => self.handle_request(msg),
            Some(Tag::ChainCommit) => self.handle_commit(msg),
            _ => self.base.violation("unexpected message", &msg),
        }
    }

    fn handle_request(&mut self, mut msg: Message) {
        if !self.is_head() {
            self.base.violation("only the head accepts requests", &msg);
            return;
        }
        msg.set_tag(Tag::ChainCommit);
        if self.base.num_replicas() > 1 {
            self.base.forward_to(1, &msg);
            self.base.forward_below(&msg);
            self.base.execute(&msg);
        } else {
            // single-replica chain: head is also the tail
            self.base.forward_below(&msg);
            self.base.execute(&msg);
            self.base.respond(&msg);
        }
    }

    fn handle_commit(&mut self, msg: Message) {
        if self.is_head() {
            self.base.violation("head received commit", &msg);
            return;
        }
        if self.is_tail {
            self.base.forward_below(&msg);
            self.base.execute(&msg);
            self.base.respond(&msg);
        } else {
            let next = self.base.spec.id + 1;
            self.base.forward_to(next, &msg);
            self.base.forward_below(&msg);
            self.base.execute(&msg);
        }
    }

    pub(crate) fn run(&mut self) {
        let clients = self.base.spec.clients.clone();
        let left = if self.is_head() {
            None
        } else {
            Some(self.base.spec.replicas[self.base.spec.id as usize - 1])
        };
        let mut spin = Spinner::new();

        while !self.base.should_stop() {
            let mut worked = false;
            match left {
                // head: requests and setups come from the clients
                None => {
                    for &client in &clients {
                        if let Some(msg) = self.base.port.try_recv(client) {
                            self.handle(msg);
                            worked = true;
                        }
                    }
                }
                // middle/tail: everything arrives from the left neighbor
                Some(left_core) => {
                    if let Some(msg) = self.base.port.try_recv(left_core) {
                        self.handle(msg);
                        worked = true;
                    }
                }
            }
            if worked {
                spin.reset();
            } else {
                spin.idle();
            }
        }
    }
}
