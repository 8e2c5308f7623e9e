//! Bandwidth arbiter — the allocation control loop.
//!
//! Every two seconds the arbiter measures available bandwidth, enumerates
//! allocation candidates (tracked pool downloads, observed large-downloader
//! processes, and the synthetic `"installer"`), scores them, and publishes
//! an [`AllocationSnapshot`] through a watch channel. Tracked records in
//! auto mode get their rate handles updated in place; engines observe the
//! new rate at their next chunk boundary.

pub mod latency;
pub mod scoring;
pub mod server;
pub mod sysload;

pub use latency::{LatencyProbe, LatencySample, PingProbe, StaticLatency};
pub use scoring::{AllocationMods, Candidate, CandidateKind};
pub use sysload::{ProcessSample, StaticProbe, SysinfoProbe, SystemProbe};

use crate::config::Config;
use crate::error::Result;
use crate::supervisor::heartbeat;
use crate::types::{AllocationSnapshot, DownloadId, DownloadState, Event, Mode, RateHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// How long a latency measurement stays fresh
const LATENCY_TTL: std::time::Duration = std::time::Duration::from_secs(10);

/// Cap on retained external download reports
const MAX_EXTERNAL_REPORTS: usize = 100;

/// A download the arbiter allocates for, registered by the pool.
#[derive(Clone)]
pub struct TrackedDownload {
    /// Record id
    pub id: DownloadId,
    /// Display name (destination file name)
    pub name: String,
    /// Rate handle shared with the record's disk writer
    pub rate: RateHandle,
    /// Monotone bytes-written counter shared with the engine
    pub bytes_written: Arc<AtomicU64>,
    /// Total size when known
    pub total_size: Option<u64>,
    /// Current lifecycle state (pool keeps this fresh)
    pub state: DownloadState,
    /// Bandwidth mode; only `Auto` records follow the arbiter
    pub mode: Mode,
}

/// In-process registry of pool downloads, shared with the arbiter.
#[derive(Clone, Default)]
pub struct DownloadDirectory {
    inner: Arc<std::sync::Mutex<HashMap<DownloadId, TrackedDownload>>>,
}

impl DownloadDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a tracked download.
    pub fn upsert(&self, entry: TrackedDownload) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(entry.id, entry);
    }

    /// Update a record's state in place.
    pub fn set_state(&self, id: DownloadId, state: DownloadState) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = map.get_mut(&id) {
            entry.state = state;
        }
    }

    /// Remove a record.
    pub fn remove(&self, id: DownloadId) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(&id);
    }

    /// Snapshot of all tracked downloads.
    pub fn entries(&self) -> Vec<TrackedDownload> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.values().cloned().collect()
    }
}

/// State mutations arriving over IPC, applied by the owning loop each tick
#[derive(Debug)]
pub enum ArbiterCommand {
    /// Replace the priority-override map
    SetPriorities(HashMap<String, u8>),
    /// GUI configuration triple
    SetGuiConfig {
        /// Manual bandwidth, bytes/s
        bandwidth: Option<u64>,
        /// Requested parallelism
        threads: Option<u32>,
        /// `auto` or `manual`
        mode: String,
    },
    /// An externally observed download was reported
    ExternalDownload(serde_json::Value),
}

/// GUI-set configuration, kept for the snapshot-style `GUI` reply
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct GuiConfig {
    /// Manual bandwidth, bytes/s
    pub bandwidth: Option<u64>,
    /// Requested parallelism
    pub threads: Option<u32>,
    /// `auto` or `manual`
    pub mode: String,
}

/// Client-facing handle: read snapshots, enqueue commands, wake idle
/// engines.
#[derive(Clone)]
pub struct ArbiterHandle {
    snapshot_rx: watch::Receiver<AllocationSnapshot>,
    cmd_tx: mpsc::Sender<ArbiterCommand>,
    wake: Arc<Notify>,
}

impl ArbiterHandle {
    /// The most recently published snapshot.
    pub fn snapshot(&self) -> AllocationSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Enqueue a state mutation for the next tick.
    pub async fn send(&self, cmd: ArbiterCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| crate::error::Error::ShuttingDown)
    }

    /// Wake engines parked in `IDLE_WAIT`.
    pub fn wake_idle(&self) {
        self.wake.notify_waiters();
    }

    /// Future resolving when a wake is signalled.
    pub fn idle_wait(&self) -> impl std::future::Future<Output = ()> + use<> {
        let wake = self.wake.clone();
        async move { wake.notified().await }
    }
}

struct LatencyState {
    mean_ms: Option<f64>,
    measured_at: Option<Instant>,
    in_flight: bool,
}

/// The allocation loop. One instance owns all arbiter state; IPC sees
/// read-only snapshots.
pub struct Arbiter {
    config: Arc<Config>,
    directory: DownloadDirectory,
    probe: Arc<dyn SystemProbe>,
    latency_probe: Arc<dyn LatencyProbe>,
    events: tokio::sync::broadcast::Sender<Event>,

    snapshot_tx: watch::Sender<AllocationSnapshot>,
    cmd_rx: mpsc::Receiver<ArbiterCommand>,
    wake: Arc<Notify>,

    priority_overrides: HashMap<String, u8>,
    gui_config: GuiConfig,
    external_downloads: Vec<serde_json::Value>,
    latency: Arc<std::sync::Mutex<LatencyState>>,
}

impl Arbiter {
    /// Build the loop and its handle.
    pub fn new(
        config: Arc<Config>,
        directory: DownloadDirectory,
        probe: Arc<dyn SystemProbe>,
        latency_probe: Arc<dyn LatencyProbe>,
        events: tokio::sync::broadcast::Sender<Event>,
    ) -> (Self, ArbiterHandle) {
        let (snapshot_tx, snapshot_rx) = watch::channel(AllocationSnapshot::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let wake = Arc::new(Notify::new());
        let handle = ArbiterHandle {
            snapshot_rx,
            cmd_tx,
            wake: wake.clone(),
        };
        let arbiter = Self {
            config,
            directory,
            probe,
            latency_probe,
            events,
            snapshot_tx,
            cmd_rx,
            wake,
            priority_overrides: HashMap::new(),
            gui_config: GuiConfig {
                mode: "auto".to_string(),
                ..Default::default()
            },
            external_downloads: Vec::new(),
            latency: Arc::new(std::sync::Mutex::new(LatencyState {
                mean_ms: None,
                measured_at: None,
                in_flight: false,
            })),
        };
        (arbiter, handle)
    }

    /// Run the allocation loop until cancelled.
    ///
    /// Measurement failures fall back to the configured default, candidate
    /// enumeration failures skip a tick, and the heartbeat is best-effort:
    /// nothing in here ends the loop except cancellation.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Bandwidth arbiter started");
        loop {
            let tick_started = Instant::now();
            self.apply_pending_commands();
            self.tick().await;
            heartbeat::write(&self.config.supervisor.heartbeat_dir, "arbiter").await;

            let elapsed = tick_started.elapsed();
            let sleep = self.config.arbiter.period.saturating_sub(elapsed);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("Bandwidth arbiter stopped");
        Ok(())
    }

    fn apply_pending_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                ArbiterCommand::SetPriorities(map) => {
                    tracing::info!(overrides = map.len(), "Priority overrides updated");
                    self.priority_overrides = map;
                }
                ArbiterCommand::SetGuiConfig {
                    bandwidth,
                    threads,
                    mode,
                } => {
                    let next = GuiConfig {
                        bandwidth,
                        threads,
                        mode: if mode == "manual" { mode } else { "auto".to_string() },
                    };
                    if next != self.gui_config {
                        tracing::info!(?next, "GUI config updated");
                        self.gui_config = next;
                    }
                }
                ArbiterCommand::ExternalDownload(info) => {
                    tracing::info!(%info, "Received download event");
                    self.external_downloads.push(info);
                    if self.external_downloads.len() > MAX_EXTERNAL_REPORTS {
                        let excess = self.external_downloads.len() - MAX_EXTERNAL_REPORTS;
                        self.external_downloads.drain(..excess);
                    }
                }
            }
        }
    }

    async fn tick(&mut self) {
        let arbiter_cfg = &self.config.arbiter;

        let measured = self.probe.sample_bandwidth(arbiter_cfg.sample_window).await;
        let available_bps = match measured {
            Some(bps) if bps >= arbiter_cfg.measure_floor_bps => bps,
            _ => arbiter_cfg.fallback_bandwidth_bps,
        };

        let processes = self.probe.processes();
        let candidates = self.build_candidates(&processes);

        let load = self.probe.system_load();
        let idle_burst = load.cpu_percent < arbiter_cfg.idle_cpu_percent
            && load.net_bps < arbiter_cfg.idle_net_bps;

        let game_override = self.interactive_override(&processes);

        let allocations = scoring::allocate(
            &candidates,
            available_bps,
            &self.priority_overrides,
            arbiter_cfg,
            AllocationMods {
                idle_burst,
                game_override,
            },
        );
        self.apply_to_records(&allocations);

        let snapshot = AllocationSnapshot {
            measured_available_bps: available_bps,
            allocations,
            system_load: load,
            priority_overrides: self.priority_overrides.clone(),
            idle_burst,
        };
        self.events
            .send(Event::AllocationPublished {
                available_bps,
                candidates: snapshot.allocations.len(),
                idle_burst,
            })
            .ok();
        // A single watch publication per tick: readers never see a torn
        // snapshot.
        self.snapshot_tx.send_replace(snapshot);
    }

    fn build_candidates(&self, processes: &[ProcessSample]) -> Vec<Candidate> {
        let arbiter_cfg = &self.config.arbiter;
        let mut candidates = Vec::new();

        // Known downloader processes, classified by cumulative I/O
        for p in processes {
            let is_known = arbiter_cfg
                .large_downloaders
                .iter()
                .any(|n| n.eq_ignore_ascii_case(&p.name));
            if !is_known {
                continue;
            }
            let kind = if p.total_io_bytes >= arbiter_cfg.large_download_threshold {
                CandidateKind::Large
            } else {
                CandidateKind::Small
            };
            candidates.push(Candidate {
                id: None,
                name: p.name.clone(),
                pid: Some(p.pid),
                kind,
                size_bytes: p.total_io_bytes,
                recent_io_bytes: p.recent_io_bytes,
                cpu_saturation: (p.cpu_percent as f64 / 100.0).clamp(0.0, 1.0),
            });
        }

        // Pool-tracked records in flight
        for entry in self.directory.entries() {
            if !matches!(
                entry.state,
                DownloadState::Queued
                    | DownloadState::Probing
                    | DownloadState::Running
                    | DownloadState::Finalizing
            ) {
                continue;
            }
            let written = entry.bytes_written.load(Ordering::Relaxed);
            let kind = if entry.total_size.unwrap_or(written)
                >= arbiter_cfg.large_download_threshold
            {
                CandidateKind::Large
            } else {
                CandidateKind::Small
            };
            candidates.push(Candidate {
                id: Some(entry.id),
                name: entry.name.clone(),
                pid: None,
                kind,
                size_bytes: entry.total_size.unwrap_or(written),
                recent_io_bytes: written.min(100 * 1024 * 1024),
                cpu_saturation: 0.0,
            });
        }

        // This system's own work is always represented
        candidates.push(Candidate::installer());
        candidates
    }

    /// Push assigned rates into the rate handles of auto-mode records.
    fn apply_to_records(&self, allocations: &[crate::types::Allocation]) {
        for entry in self.directory.entries() {
            if entry.mode != Mode::Auto {
                continue;
            }
            if let Some(assigned) = allocations
                .iter()
                .find(|a| a.id == Some(entry.id))
                .map(|a| a.assigned_bps)
            {
                entry.rate.set(assigned);
            }
        }
    }

    /// Whether the interactive override should engage this tick: a known
    /// game is running and the last fresh latency measurement exceeded the
    /// threshold. Measurements refresh in the background so the loop never
    /// waits on the ping tool.
    fn interactive_override(&self, processes: &[ProcessSample]) -> bool {
        let names: Vec<String> = processes.iter().map(|p| p.name.clone()).collect();
        let games = latency::running_games(&names, &self.config.arbiter.game_processes);
        if games.is_empty() {
            return false;
        }

        let mut state = self.latency.lock().unwrap_or_else(|p| p.into_inner());
        let stale = state
            .measured_at
            .map(|at| at.elapsed() > LATENCY_TTL)
            .unwrap_or(true);
        if stale && !state.in_flight {
            state.in_flight = true;
            let probe = self.latency_probe.clone();
            let slot = self.latency.clone();
            let cfg = self.config.arbiter.clone();
            tokio::spawn(async move {
                let result = probe
                    .measure(&cfg.latency_host, cfg.latency_samples, cfg.latency_timeout)
                    .await;
                let mut state = slot.lock().unwrap_or_else(|p| p.into_inner());
                state.in_flight = false;
                match result {
                    Ok(sample) => {
                        state.mean_ms = Some(sample.mean_ms);
                        state.measured_at = Some(Instant::now());
                    }
                    Err(e) => tracing::warn!(error = %e, "Latency measurement failed"),
                }
            });
        }
        match state.mean_ms {
            Some(mean) if mean > self.config.arbiter.latency_threshold_ms => {
                tracing::info!(
                    games = ?games,
                    latency_ms = mean,
                    "High latency with games running, reserving game band"
                );
                true
            }
            _ => false,
        }
    }
}
