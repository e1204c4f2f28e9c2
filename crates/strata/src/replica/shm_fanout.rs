// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory fan-out: the tier-2 fast path.
//!
//! No protocol rounds at all. The tier-1 replica is the sole writer of
//! one SPMC ring per node; the node's other cores run reader loops that
//! apply every message. Order and completeness come from the ring's
//! contract; the writer's `send_acked` is the acknowledgement gate that
//! holds the tier-1 response until every core took the command.
//!
//! The writer can also serve as a node-level "protocol" of its own
//! (tier-1 = SHM, nothing below): it then accepts SETUP/REQUEST from
//! clients, publishes each command, applies locally and replies.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::kvs::Apply;
use crate::message::{Message, Tag};
use crate::replica::ReplicaBase;
use crate::transport::shm::ring::{ShmReader, ShmWriter, Spinner};

/// Node-level SHM writer replica: orders by arrival, disseminates by ring.
pub struct ShmWriterReplica {
    base: ReplicaBase,
    writer: ShmWriter,
}

impl ShmWriterReplica {
    pub(crate) fn new(base: ReplicaBase, writer: ShmWriter) -> ShmWriterReplica {
        ShmWriterReplica { base, writer }
    }

    pub(crate) fn handle(&mut self, msg: Message) {
        match msg.tag() {
            Some(Tag::Setup) => self.base.handle_setup(&msg),
            Some(Tag::Request) => {
                self.writer.send_acked(&msg);
                self.base.execute(&msg);
                self.base.respond(&msg);
            }
            _ => self.base.violation("unexpected message", &msg),
        }
    }

    pub(crate) fn run(&mut self) {
        let clients = self.base.spec.clients.clone();
        let mut spin = Spinner::new();
        while !self.base.should_stop() {
            let mut worked = false;
            for &client in &clients {
                if let Some(msg) = self.base.port.try_recv(client) {
                    self.handle(msg);
                    worked = true;
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

/// Reader loop: poll the ring, apply every command.
pub struct ShmReaderReplica {
    reader: ShmReader,
    apply: Arc<dyn Apply>,
    stop: Arc<AtomicBool>,
}

impl ShmReaderReplica {
    pub(crate) fn new(
        reader: ShmReader,
        apply: Arc<dyn Apply>,
        stop: Arc<AtomicBool>,
    ) -> ShmReaderReplica {
        ShmReaderReplica {
            reader,
            apply,
            stop,
        }
    }

    pub(crate) fn run(&mut self) {
        let mut spin = Spinner::new();
        while !self.stop.load(std::sync::atomic::Ordering::Relaxed) {
            match self.reader.try_recv() {
                Some(msg) => {
                    self.apply.apply(&msg.payload());
                    spin.reset();
                }
                None => spin.idle(),
            }
        }
        // drain what is already published so a writer parked in its
        // acknowledgement gate is never stranded by the shutdown
        while let Some(msg) = self.reader.try_recv() {
            self.apply.apply(&msg.payload());
        }
    }
}
