// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Composition and dispatch layer.
//!
//! The engine owns the process-wide view of which protocol runs at which
//! tier on which cores. [`Engine::init`] validates the protocol pair,
//! builds the mesh and the tier-1 tree topology, then spawns exactly one
//! pinned replica thread per participating core: the tier-1 leader first
//! (so it is ready to accept connections), the remaining tier-1 replicas
//! in ascending id order, and each tier-1 replica starts its own node's
//! tier-2 replicas as part of its init. Benchmark clients come last via
//! [`Engine::spawn_bench_clients`].
//!
//! Everything the engine spawns watches one stop flag; [`Engine::shutdown`]
//! raises it and joins every thread, which is what makes whole-cluster
//! tests hermetic.

pub(crate) mod core_layer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::client::{ClientSession, KvsClient};
use crate::kvs::{Apply, KvStore, DEFAULT_KVS_KEYS};
use crate::replica::broadcast::BroadcastReplica;
use crate::replica::chain::ChainReplica;
use crate::replica::paxos::PaxosReplica;
use crate::replica::raft::RaftReplica;
use crate::replica::shm_fanout::{ShmReaderReplica, ShmWriterReplica};
use crate::replica::tpc::TpcReplica;
use crate::replica::{Algorithm, Level, ReplicaBase, ReplicaSpec};
use crate::stats::{self, IncStats};
use crate::topology::Topology;
use crate::transport::mesh::Mesh;
use crate::transport::shm::{ShmQueue, DEFAULT_RING_SLOTS};
use crate::{Error, Result};

/// Factory for per-replica up-calls; defaults to one [`KvStore`] per core.
pub type ApplyFactory = Arc<dyn Fn(u8) -> Arc<dyn Apply> + Send + Sync>;

/// Cluster description handed to [`Engine::init`].
#[derive(Clone)]
pub struct EngineConfig {
    pub total_cores: u8,
    pub tier1: Algorithm,
    /// Representative core per node; index is the tier-1 replica id.
    pub tier1_cores: Vec<u8>,
    pub tier2: Algorithm,
    /// Remaining cores per node, parallel to `tier1_cores`.
    pub node_cores: Vec<Vec<u8>>,
    pub client_cores: Vec<u8>,
    /// Keys per replica-local KVS.
    pub kvs_keys: usize,
    /// Run two-phase commit over tree collectives instead of direct
    /// fan-out.
    pub use_tree: bool,
    /// Replace the default KVS up-call (tests install recorders here).
    pub apply_factory: Option<ApplyFactory>,
}

impl EngineConfig {
    /// Engine configuration from a parsed config file plus the protocol
    /// pair from the command line.
    pub fn from_cluster(
        cluster: &crate::config::ClusterConfig,
        tier1: Algorithm,
        tier2: Algorithm,
    ) -> EngineConfig {
        EngineConfig {
            total_cores: cluster.num_cores,
            tier1,
            tier1_cores: cluster.replica_cores.clone(),
            tier2,
            node_cores: cluster.node_cores.clone(),
            client_cores: cluster.client_cores.clone(),
            kvs_keys: DEFAULT_KVS_KEYS,
            use_tree: false,
            apply_factory: None,
        }
    }
}

/// State shared by every thread the engine spawns.
pub(crate) struct EngineShared {
    pub(crate) mesh: Arc<Mesh>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) topo: Arc<Topology>,
    pub(crate) use_tree: bool,
    pub(crate) kvs_keys: usize,
    pub(crate) apply_factory: Option<ApplyFactory>,
    stores: DashMap<u8, Arc<KvStore>>,
    committed: DashMap<u8, Arc<AtomicU64>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl EngineShared {
    pub(crate) fn spawn<F>(&self, name: String, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name)
            .spawn(f)
            .expect("thread spawn failed");
        self.handles.lock().push(handle);
    }

    /// Up-call for the replica on `core`; the default registers a fresh
    /// KVS store so clients on the node can read it.
    pub(crate) fn make_apply(&self, core: u8) -> Arc<dyn Apply> {
        if let Some(factory) = &self.apply_factory {
            return factory(core);
        }
        let store = Arc::new(KvStore::new(self.kvs_keys));
        self.stores.insert(core, Arc::clone(&store));
        store
    }

    pub(crate) fn committed_counter(&self, core: u8) -> Arc<AtomicU64> {
        self.committed
            .entry(core)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }
}

/// Build the replica for `spec` and run its message loop until the stop
/// flag rises. Tier-2 spawning happens here, inside the replica's own
/// thread, exactly like the replica init of the original layering.
pub(crate) fn run_replica(
    shared: &Arc<EngineShared>,
    spec: ReplicaSpec,
    ready: Option<mpsc::Sender<()>>,
) {
    crate::affinity::pin_current_thread(spec.core as usize);
    let apply = shared.make_apply(spec.core);
    let below = core_layer::CoreLayer::init(shared, &spec);
    let port = shared.mesh.port(spec.core);
    let committed = shared.committed_counter(spec.core);
    let algorithm = spec.algorithm;
    let level = spec.level;
    let base = ReplicaBase::new(
        spec,
        port,
        apply,
        below,
        Arc::clone(&shared.stop),
        committed,
    );
    log::info!(
        "replica {} ready on core {} ({algorithm}, {:?} level)",
        base.spec.id,
        base.spec.core,
        level
    );
    if let Some(tx) = ready {
        let _ = tx.send(());
    }

    match algorithm {
        Algorithm::Paxos => PaxosReplica::new(base).run(),
        Algorithm::TwoPhase => {
            let topo = (shared.use_tree && level == Level::Node).then(|| Arc::clone(&shared.topo));
            TpcReplica::new(base, topo).run();
        }
        Algorithm::Broadcast => BroadcastReplica::new(base).run(),
        Algorithm::Chain => ChainReplica::new(base).run(),
        Algorithm::Raft => RaftReplica::new(base).run(),
        Algorithm::Shm | Algorithm::None => {
            unreachable!("handled by the dedicated spawn paths")
        }
    }
}

/// Benchmark client parameters.
#[derive(Clone)]
pub struct BenchOptions {
    /// Pause between requests (zero for closed-loop load).
    pub sleep: Duration,
    /// Length of one measurement run.
    pub run_time: Duration,
    pub num_runs: usize,
    pub results_dir: PathBuf,
    /// Keys are drawn as `request_id % key_range`.
    pub key_range: u64,
}

/// A running cluster.
pub struct Engine {
    shared: Arc<EngineShared>,
    cfg: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Validate the configuration, wire the transport and start every
    /// replica thread.
    pub fn init(cfg: EngineConfig) -> Result<Engine> {
        Engine::validate(&cfg)?;

        let mesh = Mesh::new(cfg.total_cores);
        let topo = Arc::new(Topology::generate(
            &cfg.tier1_cores,
            crate::topology::DEFAULT_FANOUT,
        )?);
        let shared = Arc::new(EngineShared {
            mesh,
            stop: Arc::new(AtomicBool::new(false)),
            topo,
            use_tree: cfg.use_tree,
            kvs_keys: cfg.kvs_keys,
            apply_factory: cfg.apply_factory.clone(),
            stores: DashMap::new(),
            committed: DashMap::new(),
            handles: Mutex::new(Vec::new()),
        });

        let engine = Engine {
            shared: Arc::clone(&shared),
            cfg,
        };

        if engine.cfg.tier1 == Algorithm::Shm {
            engine.start_shm_node()?;
        } else {
            engine.start_protocol_replicas();
        }
        Ok(engine)
    }

    fn validate(cfg: &EngineConfig) -> Result<()> {
        if cfg.tier1 == Algorithm::None {
            return Err(Error::InvalidConfiguration(
                "a tier-1 protocol is required".into(),
            ));
        }
        if cfg.tier1 == Algorithm::Shm && cfg.tier2 != Algorithm::None {
            return Err(Error::InvalidConfiguration(
                "shared memory is a tier-2 protocol; it cannot carry another tier below it".into(),
            ));
        }
        if cfg.tier1_cores.is_empty() {
            return Err(Error::InvalidConfiguration("no tier-1 cores".into()));
        }
        if cfg.tier1_cores.len() > crate::MAX_NUM_REPLICAS {
            return Err(Error::InvalidConfiguration(format!(
                "at most {} tier-1 replicas",
                crate::MAX_NUM_REPLICAS
            )));
        }
        if cfg.node_cores.len() != cfg.tier1_cores.len() {
            return Err(Error::InvalidConfiguration(
                "node_cores must be parallel to tier1_cores".into(),
            ));
        }
        if cfg.client_cores.len() > crate::MAX_NUM_CLIENTS {
            return Err(Error::InvalidConfiguration(format!(
                "at most {} clients",
                crate::MAX_NUM_CLIENTS
            )));
        }
        if cfg.tier1 == Algorithm::Paxos && cfg.tier1_cores.len() < 2 {
            return Err(Error::InvalidConfiguration(
                "the paxos-like protocol needs a leader and an acceptor".into(),
            ));
        }
        if cfg.tier2 == Algorithm::Paxos && cfg.node_cores.iter().any(|n| n.len() < 2) {
            return Err(Error::InvalidConfiguration(
                "tier-2 paxos needs at least two cores per node".into(),
            ));
        }
        if cfg.tier2 != Algorithm::None && cfg.node_cores.iter().any(Vec::is_empty) {
            return Err(Error::InvalidConfiguration(
                "tier-2 configured but a node has no spare cores".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for &core in cfg
            .tier1_cores
            .iter()
            .chain(cfg.node_cores.iter().flatten())
            .chain(cfg.client_cores.iter())
        {
            if core >= cfg.total_cores {
                return Err(Error::InvalidConfiguration(format!(
                    "core {core} out of range (total {})",
                    cfg.total_cores
                )));
            }
            if !seen.insert(core) {
                return Err(Error::InvalidConfiguration(format!(
                    "core {core} assigned twice"
                )));
            }
        }
        Ok(())
    }

    /// Tier-1 protocol replicas: the leader first, then ascending ids.
    fn start_protocol_replicas(&self) {
        for (i, &core) in self.cfg.tier1_cores.iter().enumerate() {
            let spec = ReplicaSpec {
                id: i as u8,
                core,
                algorithm: self.cfg.tier1,
                level: Level::Node,
                alg_below: self.cfg.tier2,
                replicas: self.cfg.tier1_cores.clone(),
                clients: self.cfg.client_cores.clone(),
                node_cores: self.cfg.node_cores[i].clone(),
                started_from: core,
            };
            let shared = Arc::clone(&self.shared);
            let (ready_tx, ready_rx) = mpsc::channel();
            self.shared
                .spawn(format!("tier1-{}-{core}", self.cfg.tier1), move || {
                    run_replica(&shared, spec, Some(ready_tx));
                });
            // serialize startup so the leader is listening before its
            // followers try to talk to it
            let _ = ready_rx.recv();
        }
    }

    /// Tier-1 = SHM: a single-node fan-out with the writer as the
    /// client-facing replica.
    fn start_shm_node(&self) -> Result<()> {
        if self.cfg.tier1_cores.len() != 1 {
            return Err(Error::InvalidConfiguration(
                "shm tier-1 runs on exactly one node".into(),
            ));
        }
        let writer_core = self.cfg.tier1_cores[0];
        let readers_cores = self.cfg.node_cores[0].clone();
        if readers_cores.is_empty() {
            return Err(Error::InvalidConfiguration(
                "shm tier-1 needs reader cores".into(),
            ));
        }

        let (writer, readers) = ShmQueue::create(DEFAULT_RING_SLOTS, readers_cores.len())?;
        for (reader, &core) in readers.into_iter().zip(readers_cores.iter()) {
            let worker = Arc::clone(&self.shared);
            self.shared.spawn(format!("shm-reader-{core}"), move || {
                crate::affinity::pin_current_thread(core as usize);
                let apply = worker.make_apply(core);
                ShmReaderReplica::new(reader, apply, Arc::clone(&worker.stop)).run();
            });
        }

        let spec = ReplicaSpec {
            id: 0,
            core: writer_core,
            algorithm: Algorithm::Shm,
            level: Level::Node,
            alg_below: Algorithm::None,
            replicas: vec![writer_core],
            clients: self.cfg.client_cores.clone(),
            node_cores: readers_cores,
            started_from: writer_core,
        };
        let shared = Arc::clone(&self.shared);
        let (ready_tx, ready_rx) = mpsc::channel();
        self.shared.spawn(format!("shm-writer-{writer_core}"), move || {
            crate::affinity::pin_current_thread(spec.core as usize);
            let apply = shared.make_apply(spec.core);
            let port = shared.mesh.port(spec.core);
            let committed = shared.committed_counter(spec.core);
            let base = ReplicaBase::new(
                spec,
                port,
                apply,
                None,
                Arc::clone(&shared.stop),
                committed,
            );
            let _ = ready_tx.send(());
            ShmWriterReplica::new(base, writer).run();
        });
        let _ = ready_rx.recv();
        Ok(())
    }

    /// Core the clients submit requests to.
    pub fn leader_core(&self) -> u8 {
        self.cfg.tier1_cores[0]
    }

    /// Core that sends the responses (the tail for chain replication).
    pub fn respond_core(&self) -> u8 {
        match self.cfg.tier1 {
            Algorithm::Chain => *self.cfg.tier1_cores.last().expect("validated non-empty"),
            _ => self.cfg.tier1_cores[0],
        }
    }

    /// Connect a client session on `core`.
    pub fn client(&self, core: u8) -> ClientSession {
        ClientSession::connect(
            &self.shared.mesh,
            core,
            self.leader_core(),
            self.respond_core(),
        )
    }

    /// Connect a KVS client on `core`, reading from `read_from`'s store.
    pub fn kvs_client(&self, core: u8, read_from: u8) -> Result<KvsClient> {
        let store = self.store(read_from).ok_or_else(|| {
            Error::InvalidConfiguration(format!("no kvs store on core {read_from}"))
        })?;
        Ok(KvsClient::new(self.client(core), store))
    }

    /// Replica-local store of the replica pinned to `core`.
    pub fn store(&self, core: u8) -> Option<Arc<KvStore>> {
        self.shared.stores.get(&core).map(|s| Arc::clone(&s))
    }

    /// Commands committed (responses released) by the replica on `core`.
    pub fn committed(&self, core: u8) -> u64 {
        self.shared.committed_counter(core).load(Ordering::Relaxed)
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.shared.mesh
    }

    /// Spawn one benchmark client per configured client core, plus the
    /// leader throughput reporter. Clients run `num_runs` timed runs,
    /// then write their results file and exit.
    pub fn spawn_bench_clients(&self, opts: BenchOptions) {
        let algo = self.cfg.tier1.id();
        let below = self.cfg.tier2.id();
        let num_replicas = self.cfg.tier1_cores.len() as u8;
        let num_clients = self.cfg.client_cores.len() as u8;
        let leader_core = self.leader_core();
        let respond_core = self.respond_core();

        // throughput reporter over the leader's committed counter
        {
            let counter = self.shared.committed_counter(leader_core);
            let stop = Arc::clone(&self.shared.stop);
            let opts = opts.clone();
            self.shared.spawn("tp-reporter".into(), move || {
                let mut runs = Vec::with_capacity(opts.num_runs);
                for _ in 0..opts.num_runs {
                    let before = counter.load(Ordering::Relaxed);
                    let deadline = Instant::now() + opts.run_time;
                    while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(20));
                    }
                    let delta = counter.load(Ordering::Relaxed) - before;
                    let per_sec = delta as f64 / opts.run_time.as_secs_f64();
                    log::info!("leader throughput/s current {per_sec:10.6}");
                    runs.push(per_sec);
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                }
                let path = stats::replica_results_path(
                    &opts.results_dir,
                    algo,
                    below,
                    num_replicas,
                    num_clients,
                );
                if let Err(err) =
                    stats::write_replica_results(&path, below, num_clients, "adaptivetree", &runs)
                {
                    log::error!("could not write replica results: {err}");
                }
            });
        }

        for &core in &self.cfg.client_cores {
            let mesh = Arc::clone(&self.shared.mesh);
            let stop = Arc::clone(&self.shared.stop);
            let opts = opts.clone();
            self.shared.spawn(format!("bench-client-{core}"), move || {
                crate::affinity::pin_current_thread(core as usize);
                let mut session = ClientSession::connect(&mesh, core, leader_core, respond_core);
                log::info!("client {} ready on core {core}", session.id());

                let mut runs: Vec<IncStats> = Vec::with_capacity(opts.num_runs);
                for _ in 0..opts.num_runs {
                    let mut round_trips = IncStats::new();
                    let deadline = Instant::now() + opts.run_time;
                    while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
                        let rid = session.request_count() as u64;
                        let started = Instant::now();
                        session.send_request([rid % opts.key_range, rid, 22]);
                        let rt = started.elapsed();
                        // drop samples inflated by scheduling
                        if rt < Duration::from_millis(50) {
                            round_trips.add(rt.as_micros() as f64);
                        }
                        if !opts.sleep.is_zero() {
                            thread::sleep(opts.sleep);
                        }
                    }
                    log::info!(
                        "client {}: avg rt {:10.3}us stdv {:10.3} n {}",
                        session.id(),
                        round_trips.avg(),
                        round_trips.std_dev(),
                        round_trips.count()
                    );
                    runs.push(round_trips);
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                }
                let path = stats::client_results_path(
                    &opts.results_dir,
                    num_replicas,
                    session.id(),
                    algo,
                    below,
                    "adaptivetree",
                    num_clients,
                );
                if let Err(err) = stats::write_client_results(&path, algo, below, num_clients, &runs)
                {
                    log::error!("could not write client results: {err}");
                }
            });
        }
    }

    /// Raise the stop flag and join every spawned thread.
    pub fn shutdown(self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        let handles: Vec<_> = std::mem::take(&mut *self.shared.handles.lock());
        for handle in handles {
            if let Err(panic) = handle.join() {
                log::error!("engine thread panicked: {panic:?}");
            }
        }
    }
}
