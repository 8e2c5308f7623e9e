//! Configuration types
//!
//! Every section has sensible defaults; `Config::default()` yields a working
//! single-host deployment. Byte quantities are bytes or bytes/s, durations
//! are `std::time::Duration`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One kibibyte
pub const KIB: u64 = 1024;
/// One mebibyte
pub const MIB: u64 = 1024 * 1024;
/// One gibibyte
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Download and disk-writer settings
    pub download: DownloadConfig,
    /// Bandwidth arbiter settings
    pub arbiter: ArbiterConfig,
    /// Filesystem monitor settings
    pub monitor: MonitorConfig,
    /// IPC ports and limits
    pub ipc: IpcConfig,
    /// Supervisor, watchdog, and system-manager settings
    pub supervisor: SupervisorConfig,
    /// Post-download scanner hook
    pub scanner: ScannerConfig,
}

/// Download engine and disk writer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Root that relative destination paths are resolved against
    pub download_root: PathBuf,
    /// Initial disk-writer chunk size
    pub chunk_size: usize,
    /// Lower bound for adaptive chunk sizing
    pub min_chunk_size: usize,
    /// Upper bound for adaptive chunk sizing
    pub max_chunk_size: usize,
    /// Seconds between periodic fsyncs
    pub fsync_interval: Duration,
    /// Per-request network timeout
    pub network_timeout: Duration,
    /// Hard cap on parallel range workers
    pub max_range_workers: usize,
    /// Replace an existing destination instead of refusing admission
    pub allow_replace: bool,
    /// Working directory for torrent transports
    pub torrent_workdir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from("downloads"),
            chunk_size: MIB as usize,
            min_chunk_size: 64 * KIB as usize,
            max_chunk_size: 8 * MIB as usize,
            fsync_interval: Duration::from_secs(5),
            network_timeout: Duration::from_secs(30),
            max_range_workers: 32,
            allow_replace: false,
            torrent_workdir: PathBuf::from("downloads/.torrent-work"),
        }
    }
}

/// Bandwidth arbiter settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Allocation loop period
    pub period: Duration,
    /// Bandwidth sampling window inside each tick
    pub sample_window: Duration,
    /// Substitute when measurement is absent or below `measure_floor_bps`
    pub fallback_bandwidth_bps: u64,
    /// Measurements below this are considered unusable
    pub measure_floor_bps: u64,
    /// Guaranteed minimum per running download, bytes/s
    pub min_allocation_bps: u64,
    /// Idle-burst floor, bytes/s
    pub burst_allocation_bps: u64,
    /// CPU percent below which the system counts as idle
    pub idle_cpu_percent: f32,
    /// Network bytes/s below which the system counts as idle
    pub idle_net_bps: u64,
    /// Cumulative process I/O that classifies a downloader as large
    pub large_download_threshold: u64,
    /// Process names treated as large downloaders
    pub large_downloaders: Vec<String>,
    /// Process names (lowercase, no extension) treated as games
    pub game_processes: Vec<String>,
    /// Latency probe target host
    pub latency_host: String,
    /// Latency samples per measurement
    pub latency_samples: u32,
    /// Per-sample latency timeout
    pub latency_timeout: Duration,
    /// Mean latency above which the interactive override engages, ms
    pub latency_threshold_ms: f64,
    /// Band reserved for games under the interactive override, bytes/s
    pub game_reserved_bps: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(2),
            sample_window: Duration::from_secs(1),
            fallback_bandwidth_bps: 100 * MIB,
            measure_floor_bps: 1_000_000,
            min_allocation_bps: 2 * MIB,
            burst_allocation_bps: 20 * MIB,
            idle_cpu_percent: 10.0,
            idle_net_bps: 5_000_000,
            large_download_threshold: GIB,
            large_downloaders: vec![
                "Steam.exe".to_string(),
                "XboxApp.exe".to_string(),
                "EpicGamesLauncher.exe".to_string(),
                "steam".to_string(),
                "epicgameslauncher".to_string(),
            ],
            game_processes: vec![
                "steam",
                "steamwebhelper",
                "gameoverlayui",
                "battle.net",
                "battlenet",
                "blizzard",
                "epicgameslauncher",
                "epicgames",
                "origin",
                "eaapp",
                "xboxapp",
                "xbox",
                "gamelaunchhelper",
                "riotclientservices",
                "valorant",
                "leagueclient",
                "csgo",
                "dota2",
                "fortnite",
                "apex",
                "overwatch",
                "eldenring",
                "starfield",
                "starcraft",
                "diablo",
                "rocketleague",
                "pubg",
                "minecraft",
                "roblox",
                "gta5",
                "rdr2",
                "fifa",
                "nba2k",
                "cod",
                "warzone",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            latency_host: "8.8.8.8".to_string(),
            latency_samples: 5,
            latency_timeout: Duration::from_secs(1),
            latency_threshold_ms: 60.0,
            game_reserved_bps: 10 * MIB,
        }
    }
}

/// Filesystem monitor settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Roots to watch recursively. Empty = user Downloads and Desktop.
    pub watch_roots: Vec<PathBuf>,
    /// Lowercase substrings that exclude a path
    pub skip_dirs: Vec<String>,
    /// Files above this size are ignored
    pub max_file_size: u64,
    /// Extensions of in-progress downloads to ignore
    pub partial_extensions: Vec<String>,
    /// Extensions considered download-like
    pub likely_extensions: Vec<String>,
    /// Per-path event coalescing window
    pub debounce: Duration,
    /// Compute a SHA-256 of observed artifacts (best effort)
    pub hash_artifacts: bool,
}

impl MonitorConfig {
    /// Effective watch roots: configured ones, or the user's Downloads and
    /// Desktop folders.
    pub fn effective_roots(&self) -> Vec<PathBuf> {
        if !self.watch_roots.is_empty() {
            return self.watch_roots.clone();
        }
        let mut roots = Vec::new();
        if let Some(d) = dirs::download_dir() {
            roots.push(d);
        }
        if let Some(d) = dirs::desktop_dir() {
            roots.push(d);
        }
        roots
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            watch_roots: Vec::new(),
            skip_dirs: vec![
                "windows",
                "program files",
                "system32",
                "recycle",
                "appdata",
                "tmp",
                "temp",
                "cache",
                "proc",
                "sys",
                "dev",
                "node_modules",
                "venv",
                "env",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_file_size: 50 * GIB,
            partial_extensions: vec![".part", ".crdownload", ".tmp", ".download", ".partial"]
                .into_iter()
                .map(String::from)
                .collect(),
            likely_extensions: vec![
                ".exe", ".msi", ".zip", ".rar", ".7z", ".iso", ".dmg", ".pdf", ".mp4", ".mp3",
                ".jpg", ".png", ".apk", ".bin", ".torrent",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            debounce: Duration::from_millis(500),
            hash_artifacts: true,
        }
    }
}

/// IPC ports and limits. All listeners bind 127.0.0.1 only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Arbiter control port
    pub arbiter_port: u16,
    /// Monitor progress-query port
    pub monitor_port: u16,
    /// Pool takeover port
    pub takeover_port: u16,
    /// Watchdog status port
    pub watchdog_port: u16,
    /// Supervisor status port
    pub supervisor_port: u16,
    /// System-manager TLS diagnostics port
    pub tls_port: u16,
    /// Pool command port
    pub pool_port: u16,
    /// Maximum accepted request payload
    pub max_payload: usize,
    /// Client-side connect/request timeout
    pub client_timeout: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            arbiter_port: 54321,
            monitor_port: 54322,
            takeover_port: 54323,
            watchdog_port: 54324,
            supervisor_port: 54325,
            tls_port: 54443,
            pool_port: 54506,
            max_payload: 64 * KIB as usize,
            client_timeout: Duration::from_secs(5),
        }
    }
}

/// Supervisor, watchdog, and system-manager settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory heartbeat files are written to
    pub heartbeat_dir: PathBuf,
    /// Interval between heartbeat writes
    pub heartbeat_interval: Duration,
    /// Heartbeat staleness that triggers a watchdog restart
    pub heartbeat_grace: Duration,
    /// Delay before respawning an exited role
    pub respawn_delay: Duration,
    /// Bounded teardown wait on cooperative shutdown
    pub shutdown_grace: Duration,
    /// Directory the certificate and key land in
    pub cert_dir: PathBuf,
    /// Token file written on first run
    pub token_file: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_dir: PathBuf::from("."),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_grace: Duration::from_secs(15),
            respawn_delay: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            cert_dir: PathBuf::from("certs"),
            token_file: PathBuf::from(".env"),
        }
    }
}

/// Post-download scanner hook settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Command that checks a file's signature; exit 0 + "Valid" on stdout
    /// means signed. None disables the hook.
    pub signature_command: Option<Vec<String>>,
    /// Command that scans a file; "No threats" on stdout means clean.
    pub scan_command: Option<Vec<String>>,
    /// Signature-check timeout
    pub signature_timeout: Duration,
    /// Scan timeout
    pub scan_timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            signature_command: None,
            scan_command: None,
            signature_timeout: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(60),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let c = Config::default();
        assert_eq!(c.arbiter.period, Duration::from_secs(2));
        assert_eq!(c.arbiter.min_allocation_bps, 2 * MIB);
        assert_eq!(c.arbiter.burst_allocation_bps, 20 * MIB);
        assert_eq!(c.arbiter.fallback_bandwidth_bps, 100 * MIB);
        assert_eq!(c.download.chunk_size, MIB as usize);
        assert_eq!(c.download.min_chunk_size, 64 * KIB as usize);
        assert_eq!(c.download.max_chunk_size, 8 * MIB as usize);
        assert_eq!(c.ipc.arbiter_port, 54321);
        assert_eq!(c.ipc.pool_port, 54506);
        assert_eq!(c.ipc.max_payload, 65536);
        assert_eq!(c.supervisor.heartbeat_grace, Duration::from_secs(15));
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let c = Config::default();
        let json = serde_json::to_string(&c).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ipc.tls_port, c.ipc.tls_port);
        assert_eq!(back.monitor.skip_dirs, c.monitor.skip_dirs);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let c: Config = serde_json::from_str(r#"{"ipc": {"arbiter_port": 6000}}"#).unwrap();
        assert_eq!(c.ipc.arbiter_port, 6000);
        // Untouched fields fall back to defaults
        assert_eq!(c.ipc.pool_port, 54506);
        assert_eq!(c.arbiter.latency_threshold_ms, 60.0);
    }
}
