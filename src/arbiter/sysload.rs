//! System observation for the arbiter
//!
//! Everything the allocation loop learns about the machine comes through
//! the [`SystemProbe`] trait, so tests can inject deterministic values. The
//! production implementation reads `sysinfo` counters.

use crate::types::SystemLoad;
use async_trait::async_trait;
use std::time::Duration;
use sysinfo::{Networks, ProcessesToUpdate, System};

/// One observed process relevant to bandwidth arbitration
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessSample {
    /// Process id
    pub pid: u32,
    /// Executable name
    pub name: String,
    /// Cumulative read + written bytes
    pub total_io_bytes: u64,
    /// Read + written bytes since the previous refresh
    pub recent_io_bytes: u64,
    /// CPU usage percent (one core = 100)
    pub cpu_percent: f32,
}

/// Injectable source of machine state.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    /// Sample cumulative network counters over `window` and return the
    /// observed throughput in bytes/s. `None` when measurement failed.
    async fn sample_bandwidth(&self, window: Duration) -> Option<u64>;

    /// Current CPU/RAM/network load.
    fn system_load(&self) -> SystemLoad;

    /// Enumerate running processes. An error excludes process candidates
    /// for one tick, never kills the loop.
    fn processes(&self) -> Vec<ProcessSample>;
}

/// Production probe over `sysinfo`
pub struct SysinfoProbe {
    system: std::sync::Mutex<System>,
    networks: std::sync::Mutex<Networks>,
    last_net_bps: std::sync::atomic::AtomicU64,
}

impl SysinfoProbe {
    /// Probe with fresh sysinfo state
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(System::new()),
            networks: std::sync::Mutex::new(Networks::new_with_refreshed_list()),
            last_net_bps: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn total_net_bytes(networks: &Networks) -> u64 {
        networks
            .iter()
            .map(|(_, data)| data.total_received() + data.total_transmitted())
            .sum()
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn sample_bandwidth(&self, window: Duration) -> Option<u64> {
        let before = {
            let mut networks = self.networks.lock().ok()?;
            networks.refresh();
            Self::total_net_bytes(&networks)
        };
        tokio::time::sleep(window).await;
        let after = {
            let mut networks = self.networks.lock().ok()?;
            networks.refresh();
            Self::total_net_bytes(&networks)
        };
        let bps = ((after.saturating_sub(before)) as f64 / window.as_secs_f64()) as u64;
        self.last_net_bps
            .store(bps, std::sync::atomic::Ordering::Relaxed);
        Some(bps)
    }

    fn system_load(&self) -> SystemLoad {
        let mut sys = match self.system.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let total = sys.total_memory();
        let ram_percent = if total > 0 {
            (sys.used_memory() as f32 / total as f32) * 100.0
        } else {
            0.0
        };
        SystemLoad {
            cpu_percent: sys.global_cpu_usage(),
            ram_percent,
            net_bps: self
                .last_net_bps
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    fn processes(&self) -> Vec<ProcessSample> {
        let mut sys = match self.system.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes()
            .iter()
            .map(|(pid, proc_)| {
                let disk = proc_.disk_usage();
                ProcessSample {
                    pid: pid.as_u32(),
                    name: proc_.name().to_string_lossy().into_owned(),
                    total_io_bytes: disk.total_read_bytes + disk.total_written_bytes,
                    recent_io_bytes: disk.read_bytes + disk.written_bytes,
                    cpu_percent: proc_.cpu_usage(),
                }
            })
            .collect()
    }
}

/// Deterministic probe for tests and simulations.
pub struct StaticProbe {
    /// Bandwidth returned by every sample; None simulates measurement failure
    pub bandwidth_bps: Option<u64>,
    /// Fixed system load
    pub load: SystemLoad,
    /// Fixed process table
    pub process_table: Vec<ProcessSample>,
}

#[async_trait]
impl SystemProbe for StaticProbe {
    async fn sample_bandwidth(&self, _window: Duration) -> Option<u64> {
        self.bandwidth_bps
    }

    fn system_load(&self) -> SystemLoad {
        self.load.clone()
    }

    fn processes(&self) -> Vec<ProcessSample> {
        self.process_table.clone()
    }
}
