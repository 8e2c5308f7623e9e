//! Core types for throttle-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;
use uuid::Uuid;

/// Unique identifier for a download record
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub Uuid);

impl DownloadId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DownloadId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Download lifecycle state
///
/// `queued → probing → running ⇄ paused → finalizing → done`; any
/// non-terminal state may transition to `failed`. Terminal states are
/// immutable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// Admitted, waiting for a worker
    Queued,
    /// Probing size and range support
    Probing,
    /// Bytes are flowing
    Running,
    /// Cooperatively halted; the in-flight chunk completes
    Paused,
    /// All bytes written, finalize/post-hooks in progress
    Finalizing,
    /// Successfully completed (terminal)
    Done,
    /// Failed with error (terminal)
    Failed,
}

impl DownloadState {
    /// Whether this state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Done | DownloadState::Failed)
    }
}

/// Bandwidth handling mode for a download
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Follow the arbiter's assigned rate
    #[default]
    Auto,
    /// Honor the record's `bandwidth_override`
    Manual,
    /// Maximum parallelism, throttling disabled. Wins over any
    /// `bandwidth_override` — the override is cleared for the run.
    MaxSpeed,
}

/// Immutable download request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadSpec {
    /// Source to fetch from
    pub source_uri: Url,
    /// Destination path. Absolute, or resolved against the pool's
    /// configured root before admission.
    pub dest_path: PathBuf,
    /// Caller-supplied size, if known ahead of the probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
    /// Run the post-download scanner hook
    #[serde(default = "default_true")]
    pub virus_check: bool,
    /// Requested parallelism; the engine may tune it down
    #[serde(default = "default_one")]
    pub thread_count_hint: usize,
    /// Fixed rate in bytes/s, overriding the arbiter (mode = manual)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_override: Option<u64>,
    /// Bandwidth handling mode
    #[serde(default)]
    pub mode: Mode,
    /// Preferred initial chunk size for the disk writer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size_hint: Option<usize>,
    /// Allow writing over an existing destination. Set for takeovers,
    /// where the observed artifact is the thing being replaced.
    #[serde(default)]
    pub replace: bool,
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

impl DownloadSpec {
    /// Minimal spec with defaults for everything but source and destination
    pub fn new(source_uri: Url, dest_path: PathBuf) -> Self {
        Self {
            source_uri,
            dest_path,
            size_hint: None,
            virus_check: true,
            thread_count_hint: 1,
            bandwidth_override: None,
            mode: Mode::Auto,
            chunk_size_hint: None,
            replace: false,
        }
    }
}

/// Metadata written next to an in-progress destination (`<dest>.meta`),
/// enabling the filesystem monitor to correlate an observed artifact with
/// its originating download.
///
/// Created before any bytes flow; removed after successful finalization or
/// unrecoverable failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SidecarMetadata {
    /// Originating URL
    pub url: String,
    /// Destination path
    pub dest: PathBuf,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// PID of the originating process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_pid: Option<u32>,
    /// URI scheme in use
    pub protocol: String,
}

/// Shared, atomically updated rate assignment for one download.
///
/// The arbiter stores the assigned bytes/s; the disk writer re-reads it at
/// every chunk boundary, so a new allocation takes effect within one
/// chunk-time. Zero means unthrottled.
#[derive(Clone, Debug, Default)]
pub struct RateHandle(Arc<AtomicU64>);

impl RateHandle {
    /// New handle, initially unthrottled
    pub fn new() -> Self {
        Self::default()
    }

    /// New handle with a fixed initial rate
    pub fn with_rate(bps: u64) -> Self {
        let h = Self::default();
        h.set(bps);
        h
    }

    /// Current assigned rate in bytes/s (0 = unthrottled)
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Publish a new assigned rate
    pub fn set(&self, bps: u64) {
        self.0.store(bps, Ordering::Relaxed);
    }

    /// Remove the throttle
    pub fn clear(&self) {
        self.set(0);
    }
}

/// Point-in-time system load observation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemLoad {
    /// CPU utilization percent across all cores
    pub cpu_percent: f32,
    /// RAM utilization percent
    pub ram_percent: f32,
    /// Network throughput over the sampling window, bytes/s
    pub net_bps: u64,
}

/// One candidate's allocation inside a snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Allocation {
    /// Record id for pool-tracked downloads; None for observed processes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<DownloadId>,
    /// Candidate name (process name, or `"installer"`)
    pub name: String,
    /// PID when the candidate is an observed process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Weighted multi-factor score
    pub score: f64,
    /// Assigned rate, bytes/s
    pub assigned_bps: u64,
    /// Assigned share of measured bandwidth, percent
    pub assigned_percent: f64,
}

/// The arbiter's published output for one tick.
///
/// Σ `assigned_bps` ≤ `measured_available_bps` except when `idle_burst` is
/// set (slack discovery is intentional).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocationSnapshot {
    /// Measured available bandwidth for this tick, bytes/s
    pub measured_available_bps: u64,
    /// Per-candidate allocations
    #[serde(default)]
    pub allocations: Vec<Allocation>,
    /// System load at measurement time
    #[serde(default)]
    pub system_load: SystemLoad,
    /// Active priority overrides (process name or `"installer"` → 0..=10)
    #[serde(default)]
    pub priority_overrides: std::collections::HashMap<String, u8>,
    /// Whether idle burst lifted assignments this tick
    #[serde(default)]
    pub idle_burst: bool,
}

impl AllocationSnapshot {
    /// Rate assigned to this system's own in-flight work
    pub fn installer_bps(&self) -> Option<u64> {
        self.allocations
            .iter()
            .find(|a| a.name == "installer")
            .map(|a| a.assigned_bps)
    }

    /// Rate assigned to a specific record, if present
    pub fn rate_for(&self, id: DownloadId) -> Option<u64> {
        self.allocations
            .iter()
            .find(|a| a.id == Some(id))
            .map(|a| a.assigned_bps)
    }
}

/// Event emitted during download and mesh lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Download admitted to the pool
    Queued {
        /// Record id
        id: DownloadId,
        /// Destination path
        dest: PathBuf,
    },
    /// Size probe started
    Probing {
        /// Record id
        id: DownloadId,
    },
    /// Progress update
    Progress {
        /// Record id
        id: DownloadId,
        /// Bytes written so far
        bytes_written: u64,
        /// Total size, when known
        #[serde(skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
        /// Observed rate over the reporting window, bytes/s
        rate_bps: u64,
    },
    /// Download paused
    Paused {
        /// Record id
        id: DownloadId,
    },
    /// Download resumed
    Resumed {
        /// Record id
        id: DownloadId,
    },
    /// All bytes written, finalization in progress
    Finalizing {
        /// Record id
        id: DownloadId,
    },
    /// Download fully complete
    Done {
        /// Record id
        id: DownloadId,
        /// Final path
        path: PathBuf,
    },
    /// Download failed
    Failed {
        /// Record id
        id: DownloadId,
        /// Error message
        error: String,
    },
    /// The filesystem monitor requested a takeover
    TakeoverRequested {
        /// Observed artifact path
        file_path: PathBuf,
        /// Correlated URL, when one was found
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// The arbiter published a new allocation snapshot
    AllocationPublished {
        /// Measured available bandwidth, bytes/s
        available_bps: u64,
        /// Number of candidates allocated
        candidates: usize,
        /// Whether idle burst was active
        idle_burst: bool,
    },
    /// A supervised role started
    RoleStarted {
        /// Role name
        role: String,
    },
    /// A supervised role exited and was respawned
    RoleRestarted {
        /// Role name
        role: String,
        /// Why the respawn happened
        reason: String,
    },
}
