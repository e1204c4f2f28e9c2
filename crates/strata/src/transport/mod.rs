// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Intra-process transport substrate.
//!
//! Three layers, bottom up:
//!
//! - [`shm`]: single-writer multi-reader broadcast rings. The tier-2 fast
//!   path, and the only structure with per-reader positions.
//! - [`ump`]: pairwise reliable FIFO channels built from two single-writer
//!   single-reader rings with credit/ACK flow control and cooperative
//!   sleep.
//! - [`mesh`]: the per-core addressing fabric the protocols use. Every
//!   participating core claims one [`mesh::MeshPort`]; ports create UMP
//!   channels to peers on first use.
//!
//! Ordering guarantees: strict FIFO within a single channel direction and
//! within a single ring; identical delivery sequence across all readers of
//! one ring; nothing across independent channels or rings.

pub mod mesh;
pub mod shm;
pub mod ump;

pub use mesh::{Mesh, MeshPort};
pub use ump::{ChannelPair, Endpoint};
