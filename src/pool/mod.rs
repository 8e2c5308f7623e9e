//! Download manager pool — admission, classification, and lifecycle.
//!
//! Large records (size hint ≥ 1 GiB) each get a dedicated worker task;
//! everything else enters a FIFO drained by a single small-queue worker.
//! Records register with the arbiter's in-process directory so allocation
//! decisions reach their rate handles, and the pool keeps record state in
//! sync by listening to the engine's event stream.

pub mod server;

use crate::arbiter::{ArbiterHandle, DownloadDirectory, TrackedDownload};
use crate::config::Config;
use crate::engine::{DownloadEngine, EngineContext, EngineOutcome, cleanup_transients};
use crate::error::{Error, Result};
use crate::types::{DownloadId, DownloadSpec, DownloadState, Event, Mode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One record under pool ownership
struct RecordHandle {
    spec: DownloadSpec,
    dest: PathBuf,
    origin_pid: Option<u32>,
    started_at: DateTime<Utc>,
    total_size_known: Option<u64>,
    state: std::sync::Mutex<DownloadState>,
    last_activity_at: std::sync::Mutex<DateTime<Utc>>,
    ctx: std::sync::Mutex<EngineContext>,
}

impl RecordHandle {
    fn state(&self) -> DownloadState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Terminal states are immutable; everything else moves freely along
    /// the lifecycle.
    fn set_state(&self, next: DownloadState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    fn touch(&self) {
        *self
            .last_activity_at
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Utc::now();
    }

    fn ctx(&self) -> EngineContext {
        self.ctx.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Fresh cancellation scope for a resume; rate handle, byte counter and
    /// slot governor carry over so monotone counters stay monotone.
    fn renew_ctx(&self) -> EngineContext {
        let mut guard = self.ctx.lock().unwrap_or_else(|p| p.into_inner());
        let renewed = EngineContext {
            cancel: CancellationToken::new(),
            ..guard.clone()
        };
        *guard = renewed.clone();
        renewed
    }
}

/// Serializable record view for `STATUS` replies
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordInfo {
    /// Record id
    pub id: DownloadId,
    /// Source URI
    pub url: String,
    /// Resolved destination
    pub dest: PathBuf,
    /// Lifecycle state
    pub state: DownloadState,
    /// Bytes written so far
    pub bytes_written: u64,
    /// Total size when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    /// Arbiter-assigned rate, bytes/s (0 = unthrottled)
    pub assigned_rate_bps: u64,
    /// Last score the arbiter computed for this record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Admission time
    pub started_at: DateTime<Utc>,
    /// PID of the originating process, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_pid: Option<u32>,
}

/// Admission, classification, and lifecycle manager for download records.
#[derive(Clone)]
pub struct DownloadPool {
    config: Arc<Config>,
    engine: Arc<DownloadEngine>,
    directory: DownloadDirectory,
    arbiter: Option<ArbiterHandle>,
    events: tokio::sync::broadcast::Sender<Event>,
    records: Arc<std::sync::Mutex<HashMap<DownloadId, Arc<RecordHandle>>>>,
    small_tx: mpsc::UnboundedSender<DownloadId>,
    small_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DownloadId>>>,
    accepting: Arc<AtomicBool>,
}

impl DownloadPool {
    /// Build the pool.
    pub fn new(
        config: Arc<Config>,
        engine: Arc<DownloadEngine>,
        directory: DownloadDirectory,
        arbiter: Option<ArbiterHandle>,
        events: tokio::sync::broadcast::Sender<Event>,
    ) -> Self {
        let (small_tx, small_rx) = mpsc::unbounded_channel();
        Self {
            config,
            engine,
            directory,
            arbiter,
            events,
            records: Arc::new(std::sync::Mutex::new(HashMap::new())),
            small_tx,
            small_rx: Arc::new(tokio::sync::Mutex::new(small_rx)),
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Start the small-queue worker and the event-driven state sync.
    pub fn start(&self, cancel: CancellationToken) {
        let pool = self.clone();
        let c = cancel.clone();
        tokio::spawn(async move { pool.small_worker(c).await });
        let pool = self.clone();
        tokio::spawn(async move { pool.state_sync(cancel).await });
    }

    /// Stop accepting new records (shutdown path).
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Admit a new download. Returns the record id.
    ///
    /// Classification happens here: a size hint of 1 GiB or more gets a
    /// dedicated worker, everything else queues behind the single small
    /// worker.
    pub fn admit(&self, spec: DownloadSpec, origin_pid: Option<u32>) -> Result<DownloadId> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let dest = self.engine.resolve_dest(&spec.dest_path);
        if self.find_by_dest(&dest).is_some() {
            return Err(Error::InvalidInput(format!(
                "a record for {} already exists",
                dest.display()
            )));
        }

        let id = DownloadId::new();
        let ctx = EngineContext::new(id, self.events.clone());
        if let Some(bps) = spec.bandwidth_override {
            if spec.mode == Mode::Manual {
                ctx.rate.set(bps);
            }
        }
        let record = Arc::new(RecordHandle {
            dest: dest.clone(),
            origin_pid,
            started_at: Utc::now(),
            total_size_known: spec.size_hint,
            state: std::sync::Mutex::new(DownloadState::Queued),
            last_activity_at: std::sync::Mutex::new(Utc::now()),
            ctx: std::sync::Mutex::new(ctx.clone()),
            spec,
        });

        self.directory.upsert(TrackedDownload {
            id,
            name: dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dest.display().to_string()),
            rate: ctx.rate.clone(),
            bytes_written: ctx.bytes_written.clone(),
            total_size: record.total_size_known,
            state: DownloadState::Queued,
            mode: record.spec.mode,
        });

        let is_large = record
            .total_size_known
            .map(|s| s >= self.config.arbiter.large_download_threshold)
            .unwrap_or(false);
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, record.clone());
        self.events
            .send(Event::Queued {
                id,
                dest: dest.clone(),
            })
            .ok();
        if let Some(arbiter) = &self.arbiter {
            arbiter.wake_idle();
        }

        if is_large {
            let pool = self.clone();
            tokio::spawn(async move { pool.run_record(id).await });
        } else if self.small_tx.send(id).is_err() {
            return Err(Error::ShuttingDown);
        }
        tracing::info!(%id, dest = %dest.display(), large = is_large, "Download admitted");
        Ok(id)
    }

    /// Handle a takeover request from the filesystem monitor.
    ///
    /// An existing record for the same destination gets its URL updated in
    /// place; otherwise, when a URL is known, a new record is admitted with
    /// replacement allowed (the observed artifact is the thing being taken
    /// over). Observations without a URL are recorded as events only.
    pub fn takeover(
        &self,
        url: Option<url::Url>,
        file_path: PathBuf,
        origin_pid: Option<u32>,
    ) -> Result<Option<DownloadId>> {
        self.events
            .send(Event::TakeoverRequested {
                file_path: file_path.clone(),
                url: url.as_ref().map(|u| u.to_string()),
            })
            .ok();

        let dest = self.engine.resolve_dest(&file_path);
        if let Some((id, _record)) = self.find_by_dest(&dest) {
            if let Some(url) = url {
                let mut updated = false;
                let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(existing) = records.get(&id) {
                    if existing.spec.source_uri != url {
                        let mut spec = existing.spec.clone();
                        spec.source_uri = url;
                        let replacement = Arc::new(RecordHandle {
                            spec,
                            dest: existing.dest.clone(),
                            origin_pid: existing.origin_pid,
                            started_at: existing.started_at,
                            total_size_known: existing.total_size_known,
                            state: std::sync::Mutex::new(existing.state()),
                            last_activity_at: std::sync::Mutex::new(Utc::now()),
                            ctx: std::sync::Mutex::new(existing.ctx()),
                        });
                        records.insert(id, replacement);
                        updated = true;
                    }
                }
                drop(records);
                if updated {
                    tracing::info!(%id, dest = %dest.display(), "Takeover updated record URL");
                }
            }
            return Ok(Some(id));
        }

        let Some(url) = url else {
            tracing::debug!(path = %dest.display(), "Takeover observation without URL, not admitting");
            return Ok(None);
        };
        let mut spec = DownloadSpec::new(url, dest);
        spec.replace = true;
        self.admit(spec, origin_pid).map(Some)
    }

    /// Pause one record, or all non-terminal records.
    pub fn pause(&self, id: Option<DownloadId>) -> Result<()> {
        match id {
            Some(id) => self.pause_one(id),
            None => {
                for id in self.record_ids() {
                    // Terminal records simply refuse the transition
                    self.pause_one(id).ok();
                }
                Ok(())
            }
        }
    }

    fn pause_one(&self, id: DownloadId) -> Result<()> {
        let record = self.get(id)?;
        let state = record.state();
        if state.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "cannot pause download {id} in state {state:?}"
            )));
        }
        if state == DownloadState::Paused {
            return Ok(());
        }
        // Cooperative stop: the engine halts fresh chunk reads and lets the
        // in-flight chunk finish.
        record.ctx().cancel.cancel();
        record.set_state(DownloadState::Paused);
        self.directory.set_state(id, DownloadState::Paused);
        self.events.send(Event::Paused { id }).ok();
        Ok(())
    }

    /// Resume one record, or all paused records.
    pub fn resume(&self, id: Option<DownloadId>) -> Result<()> {
        match id {
            Some(id) => self.resume_one(id),
            None => {
                for id in self.record_ids() {
                    if let Ok(record) = self.get(id) {
                        if record.state() == DownloadState::Paused {
                            self.resume_one(id).ok();
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn resume_one(&self, id: DownloadId) -> Result<()> {
        let record = self.get(id)?;
        match record.state() {
            DownloadState::Paused => {}
            // Already active: idempotent
            DownloadState::Queued | DownloadState::Probing | DownloadState::Running => {
                return Ok(());
            }
            state => {
                return Err(Error::InvalidInput(format!(
                    "cannot resume download {id} in state {state:?}"
                )));
            }
        }
        record.renew_ctx();
        record.set_state(DownloadState::Queued);
        self.directory.set_state(id, DownloadState::Queued);
        self.events.send(Event::Resumed { id }).ok();

        let is_large = record
            .total_size_known
            .map(|s| s >= self.config.arbiter.large_download_threshold)
            .unwrap_or(false);
        if is_large {
            let pool = self.clone();
            tokio::spawn(async move { pool.run_record(id).await });
        } else if self.small_tx.send(id).is_err() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Reduce a running record's parallelism, best-effort.
    pub fn spin_down(&self, id: DownloadId, count: usize) -> Result<()> {
        let record = self.get(id)?;
        record.ctx().slots.spin_down(count);
        Ok(())
    }

    /// Snapshot of all records.
    pub fn status(&self) -> Vec<RecordInfo> {
        let snapshot = self.arbiter.as_ref().map(|a| a.snapshot());
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records
            .iter()
            .map(|(id, r)| {
                let ctx = r.ctx();
                let score = snapshot.as_ref().and_then(|s| {
                    s.allocations
                        .iter()
                        .find(|a| a.id == Some(*id))
                        .map(|a| a.score)
                });
                RecordInfo {
                    id: *id,
                    url: r.spec.source_uri.to_string(),
                    dest: r.dest.clone(),
                    state: r.state(),
                    bytes_written: ctx.bytes_written.load(Ordering::Relaxed),
                    total_size: r.total_size_known,
                    assigned_rate_bps: ctx.rate.get(),
                    score,
                    started_at: r.started_at,
                    origin_pid: r.origin_pid,
                }
            })
            .collect()
    }

    fn get(&self, id: DownloadId) -> Result<Arc<RecordHandle>> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("download {id}")))
    }

    fn record_ids(&self) -> Vec<DownloadId> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect()
    }

    fn find_by_dest(&self, dest: &Path) -> Option<(DownloadId, Arc<RecordHandle>)> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records
            .iter()
            .find(|(_, r)| r.dest == dest)
            .map(|(id, r)| (*id, r.clone()))
    }

    /// Execute one record to a terminal (or paused) state.
    async fn run_record(&self, id: DownloadId) {
        let Ok(record) = self.get(id) else {
            return;
        };
        if record.state() == DownloadState::Paused || record.state().is_terminal() {
            return;
        }
        record.set_state(DownloadState::Probing);
        self.directory.set_state(id, DownloadState::Probing);
        let ctx = record.ctx();
        let spec = record.spec.clone();

        match self.engine.run(&spec, &ctx).await {
            Ok(EngineOutcome::Completed(path)) => {
                record.set_state(DownloadState::Done);
                self.directory.remove(id);
                tracing::info!(%id, path = %path.display(), "Download complete");
            }
            Ok(EngineOutcome::Cancelled) => {
                // Pause already set the state; anything else cancelling the
                // context is a shutdown, which leaves the record paused too.
                record.set_state(DownloadState::Paused);
                self.directory.set_state(id, DownloadState::Paused);
                tracing::info!(%id, "Download halted cooperatively");
            }
            Err(e) => {
                record.set_state(DownloadState::Failed);
                self.directory.remove(id);
                cleanup_transients(&record.dest).await;
                tracing::error!(%id, error = %e, "Download failed");
            }
        }
        record.touch();
    }

    /// The single FIFO worker draining small records one at a time.
    async fn small_worker(&self, cancel: CancellationToken) {
        let mut rx = self.small_rx.lock().await;
        loop {
            let id = tokio::select! {
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            self.run_record(id).await;
        }
        tracing::debug!("Small-queue worker stopped");
    }

    /// Keep record state and activity in sync with the engine event stream.
    async fn state_sync(&self, cancel: CancellationToken) {
        let mut events = self.events.subscribe();
        loop {
            let event = tokio::select! {
                ev = events.recv() => ev,
                _ = cancel.cancelled() => break,
            };
            let event = match event {
                Ok(ev) => ev,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "State sync lagged behind event stream");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                Event::Probing { id } => self.sync_state(id, DownloadState::Probing),
                // Bytes flowing is what makes a record "running"
                Event::Progress {
                    id, bytes_written, ..
                } if bytes_written > 0 => self.sync_state(id, DownloadState::Running),
                Event::Finalizing { id } => self.sync_state(id, DownloadState::Finalizing),
                _ => {}
            }
        }
    }

    fn sync_state(&self, id: DownloadId, state: DownloadState) {
        if let Ok(record) = self.get(id) {
            if record.state() == DownloadState::Paused {
                return;
            }
            if record.set_state(state) {
                self.directory.set_state(id, state);
            }
            record.touch();
        }
    }
}
