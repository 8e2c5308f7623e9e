//! Filesystem monitor — observes user folders for newly-landed downloads
//! and hands them to the pool for takeover.
//!
//! Watches the configured roots recursively, filters out system paths and
//! non-download-like files, correlates artifacts with their sidecar (or
//! OS zone-identifier metadata), and emits a takeover request plus a
//! `DOWNLOAD_EVENT` report to the arbiter. Event handling is debounced per
//! path to keep write storms cheap.

use crate::auth::ControlToken;
use crate::config::Config;
use crate::engine::read_sidecar;
use crate::error::{Error, Result};
use crate::ipc::{self, Reply, Request};
use crate::supervisor::heartbeat;
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Hash read chunk size
const HASH_CHUNK: usize = 1024 * 1024;

/// Observation counters exposed over the monitor's status port
#[derive(Debug, Default)]
pub struct MonitorStats {
    /// Filesystem events seen
    pub events_seen: AtomicU64,
    /// Artifacts that passed all filters
    pub artifacts_detected: AtomicU64,
    /// Takeover requests delivered
    pub takeovers_sent: AtomicU64,
    /// Events dropped by filters or debounce
    pub skipped: AtomicU64,
}

/// What the monitor learned about one observed artifact
#[derive(Clone, Debug, serde::Serialize)]
pub struct ObservedArtifact {
    /// Artifact path
    pub path: PathBuf,
    /// File size
    pub size: u64,
    /// Correlated URL, when found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Source classification (Steam, Xbox, EpicGames, a URL, or Unknown)
    pub source: String,
    /// SHA-256 of the content, when hashing succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Originating PID, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Watches folders for completed downloads and triggers takeover.
pub struct FsMonitor {
    config: Arc<Config>,
    token: ControlToken,
    watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    debounce: HashMap<PathBuf, Instant>,
    stats: Arc<MonitorStats>,
}

impl FsMonitor {
    /// Create the monitor (watches are registered by [`start`](Self::start)).
    pub fn new(config: Arc<Config>, token: ControlToken) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                if let Err(e) = tx.send(res) {
                    tracing::error!("Failed to forward filesystem event: {}", e);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::Resource(format!("failed to initialize watcher: {e}")))?;
        Ok(Self {
            config,
            token,
            watcher,
            rx,
            debounce: HashMap::new(),
            stats: Arc::new(MonitorStats::default()),
        })
    }

    /// Shared observation counters.
    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    /// Register recursive watches on every configured root.
    ///
    /// Missing roots are skipped with a warning rather than failing the
    /// role: a user without a Desktop folder still gets their Downloads
    /// watched.
    pub fn start(&mut self) -> Result<()> {
        let roots = self.config.monitor.effective_roots();
        if roots.is_empty() {
            return Err(Error::Resource("no watchable roots configured".to_string()));
        }
        let mut watching = 0usize;
        for root in roots {
            if !root.exists() {
                tracing::warn!(root = %root.display(), "Watch root missing, skipping");
                continue;
            }
            match self.watcher.watch(&root, RecursiveMode::Recursive) {
                Ok(()) => {
                    watching += 1;
                    tracing::info!(root = %root.display(), "Watching for downloads");
                }
                Err(e) => tracing::error!(root = %root.display(), error = %e, "Failed to watch root"),
            }
        }
        if watching == 0 {
            return Err(Error::Resource("no watch root could be registered".to_string()));
        }
        Ok(())
    }

    /// Run the event loop until cancelled, heartbeating as it goes.
    pub async fn run(&mut self, cancel: CancellationToken) {
        tracing::info!("Filesystem monitor started");
        let mut heartbeat_tick =
            tokio::time::interval(self.config.supervisor.heartbeat_interval);
        heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                result = self.rx.recv() => {
                    match result {
                        Some(Ok(event)) => {
                            self.stats.events_seen.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = self.handle_event(event).await {
                                tracing::error!(error = %e, "Error handling folder event");
                            }
                        }
                        Some(Err(e)) => tracing::error!(error = %e, "Filesystem watcher error"),
                        None => break,
                    }
                }
                _ = heartbeat_tick.tick() => {
                    heartbeat::write(&self.config.supervisor.heartbeat_dir, "monitor").await;
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("Filesystem monitor stopped");
    }

    async fn handle_event(&mut self, event: notify::Event) -> Result<()> {
        if !matches!(event.kind, EventKind::Create(_)) {
            return Ok(());
        }
        for path in event.paths {
            if !self.debounced(&path) {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match self.inspect(&path).await {
                Ok(Some(artifact)) => {
                    self.stats
                        .artifacts_detected
                        .fetch_add(1, Ordering::Relaxed);
                    self.report(artifact).await;
                }
                Ok(None) => {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::error!(path = %path.display(), error = %e, "Inspect failed"),
            }
        }
        Ok(())
    }

    /// Per-path debounce: the same path is processed at most once per
    /// coalescing window.
    fn debounced(&mut self, path: &Path) -> bool {
        let now = Instant::now();
        let window = self.config.monitor.debounce;
        if let Some(last) = self.debounce.get(path) {
            if now.duration_since(*last) < window {
                return false;
            }
        }
        self.debounce.insert(path.to_path_buf(), now);
        // Evict stale entries so long-running monitors stay bounded
        self.debounce
            .retain(|_, t| now.duration_since(*t) < window * 20);
        true
    }

    /// Apply the ignore rules and, for survivors, collect artifact facts.
    async fn inspect(&self, path: &Path) -> Result<Option<ObservedArtifact>> {
        let mon = &self.config.monitor;
        let lower = path.to_string_lossy().to_lowercase();
        if mon.skip_dirs.iter().any(|d| lower.contains(d.as_str())) {
            return Ok(None);
        }
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return Ok(None);
        };
        if !meta.is_file() {
            return Ok(None);
        }
        let size = meta.len();
        if size == 0 || size > mon.max_file_size {
            return Ok(None);
        }
        if mon.partial_extensions.iter().any(|e| lower.ends_with(e)) {
            return Ok(None);
        }
        if !mon.likely_extensions.iter().any(|e| lower.ends_with(e)) {
            return Ok(None);
        }

        let url = match read_sidecar(path).await {
            Some(sidecar) => Some(sidecar.url),
            None => read_zone_identifier(path).await,
        };
        let source = classify_source(path, url.as_deref());
        let sha256 = if mon.hash_artifacts {
            hash_file(path).await
        } else {
            None
        };

        Ok(Some(ObservedArtifact {
            path: path.to_path_buf(),
            size,
            url,
            source,
            sha256,
            pid: None,
        }))
    }

    /// Deliver the takeover request and the arbiter report. Both are
    /// best-effort: a dead peer is the supervisor's problem, not ours.
    async fn report(&self, artifact: ObservedArtifact) {
        tracing::info!(
            path = %artifact.path.display(),
            url = ?artifact.url,
            source = %artifact.source,
            "Download detected"
        );

        let mut takeover = Request::flat(&self.token).with_field(
            "file_path",
            serde_json::json!(artifact.path.to_string_lossy()),
        );
        if let Some(url) = &artifact.url {
            takeover = takeover.with_field("url", serde_json::json!(url));
        }
        if let Some(pid) = artifact.pid {
            takeover = takeover.with_field("pid", serde_json::json!(pid));
        }
        match ipc::send_request(&self.config.ipc, self.config.ipc.takeover_port, &takeover).await
        {
            Ok(Reply::AuthError) => tracing::warn!("Takeover request rejected: bad token"),
            Ok(_) => {
                self.stats.takeovers_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::error!(error = %e, "Failed to send takeover request"),
        }

        let report = Request::event(
            &self.token,
            "DOWNLOAD_EVENT",
            serde_json::to_value(&artifact).ok(),
        );
        if let Err(e) =
            ipc::send_request(&self.config.ipc, self.config.ipc.arbiter_port, &report).await
        {
            tracing::error!(error = %e, "Failed to report download to arbiter");
        }
    }
}

/// Read a Windows zone-identifier alternate data stream, if present, and
/// extract the `HostUrl=` line. On other platforms the stream never exists
/// and this quietly returns `None`.
async fn read_zone_identifier(path: &Path) -> Option<String> {
    let ads = format!("{}:Zone.Identifier", path.display());
    let content = tokio::fs::read_to_string(&ads).await.ok()?;
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("HostUrl="))
        .map(|url| url.to_string())
}

/// Filename/URL heuristics mapping an artifact to its origin.
fn classify_source(path: &Path, url: Option<&str>) -> String {
    if let Some(url) = url {
        let lower = url.to_lowercase();
        if lower.contains("steampowered.com") || lower.contains("steam") {
            return "Steam".to_string();
        }
        if lower.contains("xbox") || lower.contains("microsoft.com") {
            return "Xbox".to_string();
        }
        if lower.contains("epicgames.com") || lower.contains("epic") {
            return "EpicGames".to_string();
        }
        return url.to_string();
    }
    let lower = path.to_string_lossy().to_lowercase();
    if lower.contains("steam") {
        "Steam".to_string()
    } else if lower.contains("xbox") {
        "Xbox".to_string()
    } else if lower.contains("epic") {
        "EpicGames".to_string()
    } else {
        "Unknown".to_string()
    }
}

/// Best-effort SHA-256 of a file's content.
async fn hash_file(path: &Path) -> Option<String> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Some(hex::encode(hasher.finalize()))
}

/// Run the monitor's progress-query endpoint (port 54322) until cancelled.
pub async fn run_status_server(
    config: Arc<Config>,
    token: ControlToken,
    stats: Arc<MonitorStats>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = ipc::bind_loopback(config.ipc.monitor_port).await?;
    tracing::info!(port = config.ipc.monitor_port, "Monitor status server listening");
    let max_payload = config.ipc.max_payload;
    let handler: ipc::Handler = Arc::new(move |req: Request| {
        let stats = stats.clone();
        Box::pin(async move {
            match req.verb() {
                Some("PROGRESS") | Some("STATUS") => Reply::Json(serde_json::json!({
                    "events_seen": stats.events_seen.load(Ordering::Relaxed),
                    "artifacts_detected": stats.artifacts_detected.load(Ordering::Relaxed),
                    "takeovers_sent": stats.takeovers_sent.load(Ordering::Relaxed),
                    "skipped": stats.skipped.load(Ordering::Relaxed),
                })),
                _ => Reply::UnknownCommand,
            }
        })
    });
    ipc::serve(listener, token, max_payload, handler, cancel).await;
    Ok(())
}
