// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client session protocol.
//!
//! Lifecycle: UNINITIALIZED -> SETUP handshake (the leader assigns the
//! client its index in the membership table; repeating SETUP from the
//! same core yields the same id) -> READY -> one blocking request at a
//! time -> EXITED (drop).
//!
//! A request is correlated to its response by `(client_id, request_id)`;
//! with one request in flight that reduces to: anything with
//! `request_id < request_count` is a stale duplicate (a replay after a
//! leader change) and is discarded. There is no client-side timeout - a
//! wedged cluster stalls the client until the protocol recovers.

use std::sync::Arc;

use crate::kvs::KvStore;
use crate::message::{Message, Payload, Tag};
use crate::transport::mesh::{Mesh, MeshPort};
use crate::{Error, Result};

pub struct ClientSession {
    port: MeshPort,
    id: u16,
    request_count: u32,
    /// Core requests are submitted to.
    leader_core: u8,
    /// Core the responses come back from (the tail for chain).
    recv_from: u8,
}

impl ClientSession {
    /// Claim `core`'s port and run the SETUP handshake against the
    /// leader.
    pub fn connect(mesh: &Arc<Mesh>, core: u8, leader_core: u8, recv_from: u8) -> ClientSession {
        let mut port = mesh.port(core);

        let mut setup = Message::new(Tag::Setup);
        setup.set_client_id(core as u16);
        port.send(leader_core, &setup);
        let reply = port.recv(leader_core);
        let id = reply.payload()[0] as u16;

        log::info!("client {id}: initialized on core {core}");
        ClientSession {
            port,
            id,
            request_count: 0,
            leader_core,
            recv_from,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Request ids issued so far; the next request uses this value.
    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    /// Submit a command and block until the protocol reports commit.
    ///
    /// Returns nothing: state is read separately through node-local KVS
    /// gets.
    pub fn send_request(&mut self, payload: Payload) {
        let rid = self.request_count;
        let mut msg = Message::request(self.id, rid, payload);
        msg.set_reply_to(self.recv_from);
        self.port.send(self.leader_core, &msg);

        loop {
            let resp = self.port.recv(self.recv_from);
            match resp.tag() {
                Some(Tag::Response) if resp.request_id() == rid => break,
                Some(Tag::Response) if resp.request_id() < rid => {
                    // duplicate of an earlier response after a replay
                    continue;
                }
                other => {
                    log::warn!("client {}: unexpected {other:?} discarded", self.id);
                }
            }
        }
        self.request_count += 1;
    }
}

/// KVS facade: writes go through the protocol, reads hit node-local
/// replica state directly.
pub struct KvsClient {
    session: ClientSession,
    store: Arc<KvStore>,
}

impl KvsClient {
    pub fn new(session: ClientSession, store: Arc<KvStore>) -> KvsClient {
        KvsClient { session, store }
    }

    pub fn id(&self) -> u16 {
        self.session.id()
    }

    /// Replicated write. The key is validated here, before the command
    /// enters the protocol: a key only some replicas would reject must
    /// never be proposed at all.
    pub fn set(&mut self, key: u64, v1: u64, v2: u64) -> Result<()> {
        if key > self.store.max_key() {
            return Err(Error::KeyOutOfRange {
                key,
                max: self.store.max_key(),
            });
        }
        self.session.send_request([key, v1, v2]);
        Ok(())
    }

    /// Node-local read; accepts the staleness of racing a commit.
    pub fn get(&self, key: u64) -> Result<(u64, u64)> {
        self.store.get(key)
    }
}
