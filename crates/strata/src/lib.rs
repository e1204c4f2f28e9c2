// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Strata - hierarchical replicated state-machine engine
//!
//! Strata totally orders client commands across the cores of a many-core
//! shared-memory machine using a two-tier protocol stack: a *tier-1*
//! protocol runs on one representative core per NUMA node and decides the
//! global order, and a *tier-2* engine beneath each representative
//! disseminates every committed command to the remaining cores of that
//! node. Every participating core applies the committed sequence to a
//! local copy of the application state (an in-memory key-value store in
//! the supplied demo), so all replicas converge.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                           Client layer                             |
//! |        ClientSession (SETUP / REQUEST / RESPONSE) / KvsClient      |
//! +--------------------------------------------------------------------+
//! |                        Composition layer                           |
//! |   Engine (spawn + wire replicas) | CoreLayer (tier-1 -> tier-2)    |
//! +--------------------------------------------------------------------+
//! |                        Protocol layer                              |
//! |   Paxos-like | TwoPhase | Broadcast | Chain | Raft | SHM fan-out   |
//! +--------------------------------------------------------------------+
//! |                        Transport layer                             |
//! |   Mesh (per-core ports) | UMP channels | SPMC shared-memory rings  |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`engine::Engine`] | Entry point: spawns one pinned replica thread per core |
//! | [`client::ClientSession`] | Blocking request/response session against the tier-1 leader |
//! | [`transport::shm::ShmQueue`] | Single-writer multi-reader broadcast ring |
//! | [`transport::mesh::Mesh`] | Point-to-point message fabric between cores |
//! | [`kvs::KvStore`] | Replica-local key-value state driven by the up-call |
//!
//! ## Failure model
//!
//! The failure domain is a single core or a single NUMA node inside one
//! process. There is no Byzantine tolerance, no durable log and no
//! dynamic membership; liveness relies on coarse wall-clock timeouts plus
//! randomized backoff.

use std::fmt;
use std::io;

/// Thread affinity, cycle counter and seeded backoff.
pub mod affinity;
/// Client session protocol and the KVS client facade.
pub mod client;
/// Plain-text cluster configuration parsing.
pub mod config;
/// Composition layer: replica spawning and tier-1/tier-2 wiring.
pub mod engine;
/// Application up-call trait and the in-memory key-value store.
pub mod kvs;
/// Fixed-size wire message and tag set.
pub mod message;
/// Tier-1/tier-2 protocol state machines.
pub mod replica;
/// Incremental statistics and benchmark result files.
pub mod stats;
/// Tree topology and collective operations.
pub mod topology;
/// Shared-memory rings, directional channels and the core mesh.
pub mod transport;

pub use client::{ClientSession, KvsClient};
pub use engine::{Engine, EngineConfig};
pub use kvs::{Apply, KvStore};
pub use message::{Message, Payload, Tag};
pub use replica::{Algorithm, Level};

/// Upper bound on clients a protocol instance tracks.
pub const MAX_NUM_CLIENTS: usize = 64;
/// Upper bound on replicas per protocol instance.
pub const MAX_NUM_REPLICAS: usize = 64;

/// Errors surfaced by the engine.
///
/// Recoverable protocol conditions (stale terms, duplicate request ids,
/// exhausted channel credit) are handled inside the protocol handlers and
/// never reach this type.
#[derive(Debug)]
pub enum Error {
    /// Incompatible protocol pair, unknown protocol id, out-of-range core
    /// or otherwise unusable cluster description.
    InvalidConfiguration(String),

    /// A constructor argument violated its contract (e.g. a channel
    /// capacity that is not a power of two).
    InvalidArgument(String),

    /// A send or receive at the transport layer failed.
    Transport(String),

    /// A replica received a message its role forbids.
    Protocol(String),

    /// KVS key beyond the allocated store.
    KeyOutOfRange { key: u64, max: u64 },

    /// Underlying I/O failure (config file, results file).
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Transport(msg) => write!(f, "transport failure: {msg}"),
            Error::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Error::KeyOutOfRange { key, max } => {
                write!(f, "key {key} out of range (max {max})")
            }
            Error::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
