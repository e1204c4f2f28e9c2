// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! strata-bench - benchmark driver for the strata engine.
//!
//! Starts the configured replica hierarchy, lets benchmark clients hammer
//! it for a number of timed runs and leaves the per-run statistics under
//! `results/`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use strata::config::ClusterConfig;
use strata::engine::{BenchOptions, Engine, EngineConfig};
use strata::Algorithm;

/// Hierarchical consensus benchmark.
///
/// Protocol ids: 0=paxos-like, 1=two-phase commit, 2=broadcast, 3=chain,
/// 4=raft, 5=shared memory, 6=none.
#[derive(Parser, Debug)]
#[command(name = "strata-bench")]
#[command(version)]
struct Args {
    /// Tier-1 protocol id
    #[arg(default_value = "0")]
    tier1_algo: u8,

    /// Tier-2 protocol id
    #[arg(default_value = "5")]
    tier2_algo: u8,

    /// Cluster configuration file
    #[arg(default_value = "config.txt")]
    config_path: PathBuf,

    /// Tree topology index (reserved; only the adaptive tree is built in)
    #[arg(default_value = "0")]
    topo_idx: usize,

    /// Length of one measurement run in seconds
    #[arg(long, default_value = "20")]
    run_secs: u64,

    /// Number of measurement runs
    #[arg(long, default_value = "7")]
    runs: usize,

    /// Pause between client requests in milliseconds
    #[arg(long, default_value = "0")]
    sleep_ms: u64,

    /// Route two-phase commit over tree collectives
    #[arg(long)]
    use_tree: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let tier1 = match Algorithm::from_id(args.tier1_algo) {
        Ok(algo) => algo,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let tier2 = match Algorithm::from_id(args.tier2_algo) {
        Ok(algo) => algo,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let cluster = match ClusterConfig::load(&args.config_path) {
        Ok(cluster) => cluster,
        Err(err) => {
            eprintln!("no usable config at {}: {err}", args.config_path.display());
            return ExitCode::FAILURE;
        }
    };

    banner(&cluster, tier1, tier2);
    if args.topo_idx != 0 {
        log::warn!(
            "topology index {} requested; only the adaptive tree is built in",
            args.topo_idx
        );
    }

    let mut cfg = EngineConfig::from_cluster(&cluster, tier1, tier2);
    cfg.use_tree = args.use_tree;

    let engine = match Engine::init(cfg) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("engine init failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    // let the hierarchy settle before applying load
    std::thread::sleep(Duration::from_secs(1));

    let run_time = Duration::from_secs(args.run_secs);
    engine.spawn_bench_clients(BenchOptions {
        sleep: Duration::from_millis(args.sleep_ms),
        run_time,
        num_runs: args.runs,
        results_dir: PathBuf::from("results"),
        key_range: 10,
    });

    // wait out the measurement runs, then tear the cluster down
    let total = run_time * args.runs as u32 + Duration::from_secs(args.runs as u64 + 2);
    std::thread::sleep(total);
    engine.shutdown();
    println!("Exit");
    ExitCode::SUCCESS
}

fn banner(cluster: &ClusterConfig, tier1: Algorithm, tier2: Algorithm) {
    println!("###############################################");
    println!("Starting benchmark");
    println!("Protocol tier1 {tier1}");
    println!("Protocol tier2 {tier2}");
    println!("{} top level replicas", cluster.num_replicas);
    println!("{} node size", cluster.node_size);
    println!("{} clients", cluster.num_clients);
    println!("###############################################");
    println!("Tier1 cores");
    for core in &cluster.replica_cores {
        print!("{core} ");
    }
    println!();
    if cluster.node_size > 1 {
        println!("Tier2 cores");
        for node in &cluster.node_cores {
            for core in node {
                print!("{core} ");
            }
            println!();
        }
    }
    println!("Clients on cores:");
    for core in &cluster.client_cores {
        print!("{core} ");
    }
    println!();
    println!("###############################################");
}
