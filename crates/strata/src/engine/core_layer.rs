// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tier-1 to tier-2 join point.
//!
//! Each tier-1 replica owns one `CoreLayer` when a protocol (or the SHM
//! fan-out) is stacked beneath it. `send_request` is synchronous: it
//! returns only once the node's cores are guaranteed to apply the
//! command - either because every SHM reader consumed it, or because the
//! tier-2 leader answered the request - which is what lets the tier-1
//! replica release its own response afterwards.

use std::sync::Arc;

use crate::message::{Message, Tag};
use crate::replica::shm_fanout::ShmReaderReplica;
use crate::replica::{Algorithm, Level, ReplicaSpec};
use crate::transport::mesh::MeshPort;
use crate::transport::shm::{ShmQueue, ShmWriter, DEFAULT_RING_SLOTS};

use super::EngineShared;

pub(crate) enum CoreLayer {
    /// SHM fan-out: the tier-1 replica writes the ring directly.
    Shm { writer: ShmWriter, req_count: u64 },
    /// A protocol instance on the node's cores; we are its only client.
    Proto { leader_core: u8, req_count: u64 },
}

impl CoreLayer {
    /// Start the tier-2 engine for `spec`'s node and return the layer
    /// handle. Spawns the tier-2 threads; `None` when nothing is stacked
    /// below.
    pub(crate) fn init(shared: &Arc<EngineShared>, spec: &ReplicaSpec) -> Option<CoreLayer> {
        if spec.alg_below == Algorithm::None {
            return None;
        }
        if spec.node_cores.is_empty() {
            log::warn!(
                "replica {}: tier-2 {} configured but the node has no spare cores",
                spec.id,
                spec.alg_below
            );
            return None;
        }

        match spec.alg_below {
            Algorithm::Shm => {
                let (writer, readers) = ShmQueue::create(DEFAULT_RING_SLOTS, spec.node_cores.len())
                    .expect("node size bounded by configuration validation");
                for (reader, &core) in readers.into_iter().zip(spec.node_cores.iter()) {
                    let worker = Arc::clone(shared);
                    shared.spawn(format!("shm-reader-{core}"), move || {
                        crate::affinity::pin_current_thread(core as usize);
                        let apply = worker.make_apply(core);
                        ShmReaderReplica::new(reader, apply, Arc::clone(&worker.stop)).run();
                    });
                }
                Some(CoreLayer::Shm {
                    writer,
                    req_count: 0,
                })
            }
            algo => {
                // Protocol tier-2: followers first, the leader last so it
                // finds every peer already listening.
                let node_cores = spec.node_cores.clone();
                let order = (1..node_cores.len()).chain(std::iter::once(0));
                for j in order {
                    let sub = ReplicaSpec {
                        id: j as u8,
                        core: node_cores[j],
                        algorithm: algo,
                        level: Level::Core,
                        alg_below: Algorithm::None,
                        replicas: node_cores.clone(),
                        clients: vec![spec.core],
                        node_cores: Vec::new(),
                        started_from: spec.core,
                    };
                    let shared2 = Arc::clone(shared);
                    shared.spawn(format!("tier2-{algo}-{}", sub.core), move || {
                        super::run_replica(&shared2, sub, None);
                    });
                }
                Some(CoreLayer::Proto {
                    leader_core: node_cores[0],
                    req_count: 0,
                })
            }
        }
    }

    /// Propagate a committed command to the node and wait for the
    /// acknowledgement.
    pub(crate) fn send_request(&mut self, port: &mut MeshPort, msg: &Message) {
        match self {
            CoreLayer::Shm { writer, req_count } => {
                writer.send_acked(msg);
                *req_count += 1;
            }
            CoreLayer::Proto {
                leader_core,
                req_count,
            } => {
                let mut down = *msg;
                down.set_tag(Tag::Request);
                down.set_client_id(0);
                down.set_request_id(*req_count as u32);
                down.set_reply_to(port.core());
                port.send(*leader_core, &down);

                loop {
                    let resp = port.recv(*leader_core);
                    match resp.tag() {
                        Some(Tag::Response) if resp.request_id() == *req_count as u32 => break,
                        Some(Tag::Response) => continue, // stale replay
                        _ => log::warn!(
                            "core layer on {}: unexpected {:?} while awaiting tier-2 ack",
                            port.core(),
                            resp.tag()
                        ),
                    }
                }
                *req_count += 1;
            }
        }
    }
}
