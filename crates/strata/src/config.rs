// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cluster configuration file.
//!
//! Plain text, whitespace-separated integers:
//!
//! ```text
//! num_cores
//! num_tier1_replicas
//! node_size
//! num_clients
//! <num_tier1_replicas lines of node_size core ids>   first id = representative
//! <one line of num_clients client core ids>
//! ```

use std::path::Path;

use crate::{Error, Result};

/// Parsed cluster description.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub num_cores: u8,
    pub num_replicas: u8,
    pub node_size: u8,
    pub num_clients: u8,
    /// Tier-1 representative core per node.
    pub replica_cores: Vec<u8>,
    /// Remaining (tier-2) cores per node, `node_size - 1` each.
    pub node_cores: Vec<Vec<u8>>,
    pub client_cores: Vec<u8>,
}

impl ClusterConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<ClusterConfig> {
        let text = std::fs::read_to_string(path)?;
        ClusterConfig::parse(&text)
    }

    /// Parse the whitespace-separated integer stream.
    pub fn parse(text: &str) -> Result<ClusterConfig> {
        let mut ints = text.split_whitespace().map(|tok| {
            tok.parse::<u64>()
                .map_err(|_| Error::InvalidConfiguration(format!("not an integer: {tok:?}")))
        });
        let mut next = |what: &str| -> Result<u64> {
            ints.next()
                .unwrap_or_else(|| Err(Error::InvalidConfiguration(format!("missing {what}"))))
        };

        let num_cores = next("num_cores")?;
        let num_replicas = next("num_replicas")?;
        let node_size = next("node_size")?;
        let num_clients = next("num_clients")?;

        if num_cores == 0 || num_cores > 255 {
            return Err(Error::InvalidConfiguration(format!(
                "num_cores must be in 1..=255, got {num_cores}"
            )));
        }
        if num_replicas == 0 || num_replicas as usize > crate::MAX_NUM_REPLICAS {
            return Err(Error::InvalidConfiguration(format!(
                "num_replicas must be in 1..={}, got {num_replicas}",
                crate::MAX_NUM_REPLICAS
            )));
        }
        if node_size == 0 {
            return Err(Error::InvalidConfiguration("node_size must be >= 1".into()));
        }
        if num_clients as usize > crate::MAX_NUM_CLIENTS {
            return Err(Error::InvalidConfiguration(format!(
                "num_clients must be <= {}, got {num_clients}",
                crate::MAX_NUM_CLIENTS
            )));
        }

        let core = |v: u64| -> Result<u8> {
            if v >= num_cores {
                return Err(Error::InvalidConfiguration(format!(
                    "core {v} out of range (num_cores {num_cores})"
                )));
            }
            Ok(v as u8)
        };

        let mut replica_cores = Vec::with_capacity(num_replicas as usize);
        let mut node_cores = Vec::with_capacity(num_replicas as usize);
        for _ in 0..num_replicas {
            replica_cores.push(core(next("replica core")?)?);
            let mut rest = Vec::with_capacity(node_size as usize - 1);
            for _ in 1..node_size {
                rest.push(core(next("node core")?)?);
            }
            node_cores.push(rest);
        }

        let mut client_cores = Vec::with_capacity(num_clients as usize);
        for _ in 0..num_clients {
            client_cores.push(core(next("client core")?)?);
        }

        let mut seen = std::collections::HashSet::new();
        for &c in replica_cores
            .iter()
            .chain(node_cores.iter().flatten())
            .chain(client_cores.iter())
        {
            if !seen.insert(c) {
                return Err(Error::InvalidConfiguration(format!(
                    "core {c} assigned twice"
                )));
            }
        }

        Ok(ClusterConfig {
            num_cores: num_cores as u8,
            num_replicas: num_replicas as u8,
            node_size: node_size as u8,
            num_clients: num_clients as u8,
            replica_cores,
            node_cores,
            client_cores,
        })
    }
}
