//! Fast path lifecycle: load rules, attach interfaces, push updates, report.
//!
//! ```text
//! Unloaded --load--> Loaded --attach--> Attached(ifaces) --unload--> Unloaded
//!                                          |  ^
//!                                          detach
//! ```
//!
//! The active rule table is an immutable snapshot behind an `ArcSwap`;
//! updates compile a new table off to the side and swap it in, so the
//! polling loops never see a half-built table and never wait on a lock.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick, unbounded};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::classifier::{PacketClassifier, SlowPathPacket};
use crate::config::FastPathConfig;
use crate::conntrack::{ConnectionKey, ConnectionTable, IdleTimeouts};
use crate::error::{ConfigError, Error, Result};
use crate::lock;
use crate::rules::{Mapping, RuleCompiler, RuleSet, RuleTable, Service};
use crate::stats::{EngineStatsSnapshot, FastPathStats, StatsSnapshot, bump};
use crate::xsk::{Binding, EngineFault, PacketSocketFactory, TransportFactory, ZeroCopyEngine};

/// Point-in-time view returned by [`FastPathManager::get_stats`]
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    #[serde(flatten)]
    pub packets: StatsSnapshot,
    pub attached_interfaces: Vec<String>,
    pub program_loaded: bool,
    pub sync_errors: u64,
    pub program_errors: u64,
    /// Queues whose polling loop gave up, as `interface:queue`
    pub failed_queues: Vec<String>,
    pub active_connections: usize,
    pub rules_generation: u64,
    pub engines: Vec<EngineStatsSnapshot>,
    pub packets_per_second: u64,
    pub bytes_per_second: u64,
    pub last_update: DateTime<Utc>,
}

/// Counters and reports shared with the maintenance thread
#[derive(Default)]
struct Telemetry {
    sync_errors: AtomicU64,
    program_errors: AtomicU64,
    failed_queues: Mutex<Vec<String>>,
    packets_per_second: AtomicU64,
    bytes_per_second: AtomicU64,
}

impl Telemetry {
    fn record_fault(&self, fault: EngineFault) {
        error!(
            interface = %fault.interface,
            queue_id = fault.queue_id,
            consecutive_faults = fault.consecutive_faults,
            reason = %fault.reason,
            "Polling loop failed"
        );
        bump(&self.program_errors);
        let queue = format!("{}:{}", fault.interface, fault.queue_id);
        let mut failed = lock(&self.failed_queues);
        if !failed.contains(&queue) {
            failed.push(queue);
        }
    }

    fn drain_faults(&self, faults: &Receiver<EngineFault>) {
        while let Ok(fault) = faults.try_recv() {
            self.record_fault(fault);
        }
    }

    fn forget_interface(&self, interface: &str) {
        let prefix = format!("{interface}:");
        lock(&self.failed_queues).retain(|q| !q.starts_with(&prefix));
    }
}

struct State {
    services: Vec<Service>,
    mappings: Vec<Mapping>,
    attached: BTreeMap<String, Vec<ZeroCopyEngine>>,
}

pub struct FastPathManager {
    config: FastPathConfig,
    factory: Arc<dyn TransportFactory>,
    compiler: RuleCompiler,
    table: Arc<ArcSwap<RuleTable>>,
    connections: Arc<ConnectionTable>,
    stats: Arc<FastPathStats>,
    telemetry: Arc<Telemetry>,
    loaded: AtomicBool,
    state: Mutex<State>,
    slow_path_tx: Sender<SlowPathPacket>,
    slow_path_rx: Receiver<SlowPathPacket>,
    fault_tx: Sender<EngineFault>,
    fault_rx: Receiver<EngineFault>,
    maintenance: Mutex<Option<Maintenance>>,
}

impl FastPathManager {
    pub fn new(config: FastPathConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        config.validate()?;

        let compiler = RuleCompiler::from_config(&config);
        let (slow_path_tx, slow_path_rx) = bounded(config.slow_path_queue_depth);
        let (fault_tx, fault_rx) = unbounded();

        Ok(Self {
            table: Arc::new(ArcSwap::from_pointee(RuleTable::empty(compiler.scan_limit()))),
            connections: Arc::new(ConnectionTable::from_config(&config.conntrack)),
            stats: Arc::new(FastPathStats::new()),
            telemetry: Arc::new(Telemetry::default()),
            loaded: AtomicBool::new(false),
            state: Mutex::new(State {
                services: Vec::new(),
                mappings: Vec::new(),
                attached: BTreeMap::new(),
            }),
            compiler,
            config,
            factory,
            slow_path_tx,
            slow_path_rx,
            fault_tx,
            fault_rx,
            maintenance: Mutex::new(None),
        })
    }

    /// Manager that binds host interfaces through AF_PACKET sockets.
    pub fn with_packet_sockets(config: FastPathConfig) -> Result<Self> {
        Self::new(config, Arc::new(PacketSocketFactory))
    }

    pub fn config(&self) -> &FastPathConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Read, compile and install the rule artifact at `path`.
    pub fn load(&self, path: &Path) -> Result<()> {
        let mut state = lock(&self.state);
        if self.is_loaded() {
            return Err(ConfigError::AlreadyLoaded.into());
        }

        let rules = RuleSet::load(path)?;
        let table = self.compiler.compile(&rules.services, &rules.mappings)?;
        let maintenance = Maintenance::spawn(MaintenanceTask {
            stats: Arc::clone(&self.stats),
            connections: Arc::clone(&self.connections),
            telemetry: Arc::clone(&self.telemetry),
            faults: self.fault_rx.clone(),
            interval: self.config.stats_interval(),
            sweep_interval: self.config.conntrack.sweep_interval(),
            timeouts: IdleTimeouts::from_config(&self.config.conntrack),
        })
        .map_err(|e| Error::resource("failed to spawn maintenance thread", e))?;

        let generation = table.generation();
        self.table.store(Arc::new(table));
        *lock(&self.maintenance) = Some(maintenance);
        state.services = rules.services;
        state.mappings = rules.mappings;
        self.loaded.store(true, Ordering::Release);

        info!(
            path = %path.display(),
            generation,
            services = state.services.len(),
            mappings = state.mappings.len(),
            "Fast path loaded"
        );
        Ok(())
    }

    /// Detach everything and drop the installed rules. No-op when unloaded.
    pub fn unload(&self) {
        let mut state = lock(&self.state);
        if !self.is_loaded() {
            return;
        }

        for (name, engines) in std::mem::take(&mut state.attached) {
            stop_engines(&name, &engines);
        }
        state.services.clear();
        state.mappings.clear();
        self.loaded.store(false, Ordering::Release);

        if let Some(maintenance) = lock(&self.maintenance).take() {
            maintenance.stop();
        }
        self.table
            .store(Arc::new(RuleTable::empty(self.compiler.scan_limit())));
        self.connections.clear();
        lock(&self.telemetry.failed_queues).clear();
        info!("Fast path unloaded");
    }

    /// Start one engine per configured queue on `name`.
    ///
    /// Either every queue comes up or none stays bound.
    pub fn attach_to_interface(&self, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if !self.is_loaded() {
            return Err(Error::NotLoaded);
        }
        if state.attached.contains_key(name) {
            return Err(Error::AlreadyAttached(name.to_string()));
        }

        let queues = self.config.queues_per_interface;
        let mut engines = Vec::with_capacity(queues as usize);
        for queue_id in 0..queues {
            match self.start_queue(name, queue_id) {
                Ok(engine) => engines.push(engine),
                Err(e) => {
                    warn!(interface = name, queue_id, error = %e, "Attach failed");
                    stop_engines(name, &engines);
                    return Err(e);
                }
            }
        }

        info!(interface = name, queues, "Interface attached");
        state.attached.insert(name.to_string(), engines);
        Ok(())
    }

    fn start_queue(&self, name: &str, queue_id: u32) -> Result<ZeroCopyEngine> {
        let binding = Binding::new(name, queue_id)
            .with_queue_count(self.config.queues_per_interface)
            .with_bind_mode(self.config.engine.bind_mode);
        let engine = ZeroCopyEngine::new(binding, self.config.engine.clone(), self.factory.as_ref())?
            .with_fault_reporter(self.fault_tx.clone());
        engine.start(self.classifier().into_handler(self.config.allow_action))?;
        Ok(engine)
    }

    /// Stop the engines on `name`. Returns false if it was not attached.
    pub fn detach_from_interface(&self, name: &str) -> bool {
        let Some(engines) = lock(&self.state).attached.remove(name) else {
            debug!(interface = name, "Detach of unattached interface ignored");
            return false;
        };
        stop_engines(name, &engines);
        self.telemetry.forget_interface(name);
        info!(interface = name, "Interface detached");
        true
    }

    /// Replace the service list. On failure the active table is untouched.
    pub fn update_services(&self, services: Vec<Service>) -> Result<()> {
        let mut state = lock(&self.state);
        let table = self.compile_update(&services, &state.mappings)?;
        self.install(table);
        state.services = services;
        Ok(())
    }

    /// Replace the mapping list. On failure the active table is untouched.
    pub fn update_mappings(&self, mappings: Vec<Mapping>) -> Result<()> {
        let mut state = lock(&self.state);
        let table = self.compile_update(&state.services, &mappings)?;
        self.install(table);
        state.mappings = mappings;
        Ok(())
    }

    fn compile_update(&self, services: &[Service], mappings: &[Mapping]) -> Result<RuleTable> {
        self.compiler.compile(services, mappings).map_err(|e| {
            bump(&self.telemetry.sync_errors);
            error!(error = %e, "Rule update rejected; keeping active table");
            Error::from(e)
        })
    }

    /// Swap in `table` if loaded; otherwise it only validated the update.
    fn install(&self, table: RuleTable) {
        let generation = table.generation();
        if self.is_loaded() {
            self.table.store(Arc::new(table));
            info!(generation, "Rule table installed");
        } else {
            debug!(generation, "Rule update staged until load");
        }
    }

    /// True when the flow has to go through the authenticating slow path.
    ///
    /// Table-wide: any auth-required mapping sends all traffic to the slow
    /// path, whatever the tuple.
    pub fn should_fallback_to_slow_path(&self, _key: &ConnectionKey) -> bool {
        !self.is_loaded() || self.table.load().requires_auth_anywhere()
    }

    pub fn get_stats(&self) -> ManagerStats {
        self.telemetry.drain_faults(&self.fault_rx);

        let state = lock(&self.state);
        ManagerStats {
            packets: self.stats.snapshot(),
            attached_interfaces: state.attached.keys().cloned().collect(),
            program_loaded: self.is_loaded(),
            sync_errors: self.telemetry.sync_errors.load(Ordering::Relaxed),
            program_errors: self.telemetry.program_errors.load(Ordering::Relaxed),
            failed_queues: lock(&self.telemetry.failed_queues).clone(),
            active_connections: self.connections.len(),
            rules_generation: self.table.load().generation(),
            engines: state
                .attached
                .values()
                .flat_map(|engines| engines.iter().map(ZeroCopyEngine::stats))
                .collect(),
            packets_per_second: self.telemetry.packets_per_second.load(Ordering::Relaxed),
            bytes_per_second: self.telemetry.bytes_per_second.load(Ordering::Relaxed),
            last_update: Utc::now(),
        }
    }

    /// Zero the aggregate and per-queue counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
        for engines in lock(&self.state).attached.values() {
            for engine in engines {
                engine.counters().reset();
            }
        }
        for counter in [
            &self.telemetry.sync_errors,
            &self.telemetry.program_errors,
            &self.telemetry.packets_per_second,
            &self.telemetry.bytes_per_second,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        info!("Statistics reset");
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Consumer end of the queue of packets redirected to the slow path
    pub fn slow_path_receiver(&self) -> Receiver<SlowPathPacket> {
        self.slow_path_rx.clone()
    }

    /// Classifier wired to this manager's table, flows and counters
    pub fn classifier(&self) -> PacketClassifier {
        PacketClassifier::new(
            Arc::clone(&self.table),
            Arc::clone(&self.connections),
            Arc::clone(&self.stats),
        )
        .with_slow_path(self.slow_path_tx.clone())
    }
}

impl Drop for FastPathManager {
    fn drop(&mut self) {
        self.unload();
    }
}

fn stop_engines(interface: &str, engines: &[ZeroCopyEngine]) {
    for engine in engines {
        engine.stop();
    }
    debug!(interface, queues = engines.len(), "Engines stopped");
}

/// Handle of the background maintenance thread
struct Maintenance {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Maintenance {
    fn spawn(task: MaintenanceTask) -> std::io::Result<Self> {
        let (shutdown, shutdown_rx) = bounded(1);
        let thread = thread::Builder::new()
            .name("fastpath-maint".to_string())
            .spawn(move || task.run(shutdown_rx))?;
        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            error!("Maintenance thread panicked");
        }
    }
}

struct MaintenanceTask {
    stats: Arc<FastPathStats>,
    connections: Arc<ConnectionTable>,
    telemetry: Arc<Telemetry>,
    faults: Receiver<EngineFault>,
    interval: Duration,
    sweep_interval: Duration,
    timeouts: IdleTimeouts,
}

impl MaintenanceTask {
    fn run(self, shutdown: Receiver<()>) {
        debug!(interval_ms = self.interval.as_millis() as u64, "Maintenance started");
        let ticker = tick(self.interval);
        let mut rates = RateMeter::new(&self.stats.snapshot());
        let mut last_sweep = Instant::now();

        loop {
            select! {
                recv(ticker) -> _ => {
                    let (pps, bps) = rates.update(&self.stats.snapshot());
                    self.telemetry.packets_per_second.store(pps, Ordering::Relaxed);
                    self.telemetry.bytes_per_second.store(bps, Ordering::Relaxed);

                    if last_sweep.elapsed() >= self.sweep_interval {
                        self.connections.sweep(&self.timeouts);
                        last_sweep = Instant::now();
                    }

                    self.telemetry.drain_faults(&self.faults);
                }
                recv(shutdown) -> _ => break,
            }
        }
        debug!("Maintenance stopped");
    }
}

/// Packet and byte rates from successive counter snapshots
struct RateMeter {
    packets: u64,
    bytes: u64,
    at: Instant,
}

impl RateMeter {
    fn new(snapshot: &StatsSnapshot) -> Self {
        Self {
            packets: snapshot.total_packets,
            bytes: snapshot.total_bytes,
            at: Instant::now(),
        }
    }

    fn update(&mut self, snapshot: &StatsSnapshot) -> (u64, u64) {
        self.update_at(snapshot, Instant::now())
    }

    fn update_at(&mut self, snapshot: &StatsSnapshot, now: Instant) -> (u64, u64) {
        let elapsed = now.duration_since(self.at).as_secs_f64();
        // Counters may have been reset since the last tick
        let packets = snapshot.total_packets.saturating_sub(self.packets);
        let bytes = snapshot.total_bytes.saturating_sub(self.bytes);
        self.packets = snapshot.total_packets;
        self.bytes = snapshot.total_bytes;
        self.at = now;
        if elapsed <= 0.0 {
            return (0, 0);
        }
        (
            (packets as f64 / elapsed) as u64,
            (bytes as f64 / elapsed) as u64,
        )
    }
}
