//! Download engine — executes one [`DownloadSpec`] end-to-end.
//!
//! The engine probes the source, picks a strategy (one stream, or parallel
//! ranges joined in order), moves every payload byte through the throttled
//! disk writer into `<dest>.part`, and publishes the destination only
//! through an atomic rename. Post-download hooks (scanner, transient
//! cleanup) run after publication.

mod finalization;
mod strategy;

pub use finalization::{cleanup_transients, meta_path, read_sidecar, tmp_path, write_sidecar};
pub use strategy::{Strategy, auto_tune, choose, partition};

use crate::config::DownloadConfig;
use crate::disk_writer::{DiskWriter, part_path};
use crate::error::{Error, Result, TransportError};
use crate::scanner::{ArtifactScanner, scan_if_unsigned};
use crate::transport::torrent::TorrentProgress;
use crate::transport::{ByteRange, HttpTransport, Transport, TransportRegistry};
use crate::types::{DownloadId, Event, Mode, RateHandle, SidecarMetadata};
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Interval between progress event emissions
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Concurrency governor for parallel range fetches.
///
/// The pool's `SPIN_DOWN_THREAD` command lands here: permits are forgotten
/// best-effort, so ranges that have not yet started queue behind fewer
/// slots while in-flight ranges complete normally.
#[derive(Clone, Default)]
pub struct RangeSlots {
    inner: Arc<std::sync::Mutex<SlotState>>,
}

#[derive(Default)]
struct SlotState {
    sem: Option<Arc<Semaphore>>,
    pending_reduction: usize,
}

impl RangeSlots {
    /// Fresh, uninstalled governor
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the semaphore for a starting parallel run, applying any
    /// reduction requested before the run began.
    fn install(&self, threads: usize) -> Arc<Semaphore> {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let effective = threads.saturating_sub(state.pending_reduction).max(1);
        state.pending_reduction = 0;
        let sem = Arc::new(Semaphore::new(effective));
        state.sem = Some(sem.clone());
        sem
    }

    /// Reduce parallelism by `count`, best-effort.
    pub fn spin_down(&self, count: usize) {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match &state.sem {
            Some(sem) => {
                let forgotten = sem.forget_permits(count);
                tracing::info!(requested = count, forgotten, "Spun down range workers");
            }
            None => {
                state.pending_reduction = state.pending_reduction.saturating_add(count);
                tracing::info!(count, "Spin-down queued for next parallel run");
            }
        }
    }
}

/// Per-run control surface shared between the engine, the pool, and the
/// arbiter.
#[derive(Clone)]
pub struct EngineContext {
    /// Record id
    pub id: DownloadId,
    /// Arbiter-assigned rate (0 = unthrottled)
    pub rate: RateHandle,
    /// Cooperative stop: fresh chunk reads halt, in-flight chunks complete
    pub cancel: CancellationToken,
    /// Parallel-fetch governor
    pub slots: RangeSlots,
    /// Monotone count of payload bytes written
    pub bytes_written: Arc<AtomicU64>,
    /// Lifecycle event sink
    pub events: tokio::sync::broadcast::Sender<Event>,
}

impl EngineContext {
    /// Context for a new record.
    pub fn new(id: DownloadId, events: tokio::sync::broadcast::Sender<Event>) -> Self {
        Self {
            id,
            rate: RateHandle::new(),
            cancel: CancellationToken::new(),
            slots: RangeSlots::new(),
            bytes_written: Arc::new(AtomicU64::new(0)),
            events,
        }
    }
}

/// How a run ended when it did not error
#[derive(Debug, PartialEq, Eq)]
pub enum EngineOutcome {
    /// The artifact was published at this path
    Completed(PathBuf),
    /// The run was cooperatively cancelled (pause); transients remain for
    /// the caller to either resume-from-scratch or clean up
    Cancelled,
}

/// Executes downloads against a transport registry.
pub struct DownloadEngine {
    config: DownloadConfig,
    registry: Arc<TransportRegistry>,
    scanner: Arc<dyn ArtifactScanner>,
    fallback: HttpTransport,
}

impl DownloadEngine {
    /// Engine over the given registry and scanner hook.
    pub fn new(
        config: DownloadConfig,
        registry: Arc<TransportRegistry>,
        scanner: Arc<dyn ArtifactScanner>,
    ) -> Self {
        let fallback = HttpTransport::new(config.network_timeout);
        Self {
            config,
            registry,
            scanner,
            fallback,
        }
    }

    /// Resolve a destination against the configured root.
    pub fn resolve_dest(&self, dest: &Path) -> PathBuf {
        if dest.is_absolute() {
            dest.to_path_buf()
        } else {
            self.config.download_root.join(dest)
        }
    }

    /// Run one download to completion.
    ///
    /// On failure every transient file is removed and `dest` is never
    /// created; on success no transient file survives.
    pub async fn run(
        &self,
        spec: &crate::types::DownloadSpec,
        ctx: &EngineContext,
    ) -> Result<EngineOutcome> {
        let dest = self.resolve_dest(&spec.dest_path);
        if dest.exists() && !self.config.allow_replace && !spec.replace {
            return Err(Error::InvalidInput(format!(
                "destination {} already exists",
                dest.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let sidecar = SidecarMetadata {
            url: spec.source_uri.to_string(),
            dest: dest.clone(),
            created_at: chrono::Utc::now(),
            origin_pid: Some(std::process::id()),
            protocol: spec.source_uri.scheme().to_string(),
        };
        write_sidecar(&sidecar).await?;

        let progress = self.spawn_progress_reporter(ctx, None);
        let result = self.execute(spec, &dest, ctx).await;
        progress.abort();

        match result {
            Ok(EngineOutcome::Completed(path)) => {
                if spec.virus_check {
                    if let Err(e) = scan_if_unsigned(self.scanner.as_ref(), &path).await {
                        // Threat verdict: the published artifact is removed
                        // along with the transients, and the record fails.
                        tokio::fs::remove_file(&path).await.ok();
                        cleanup_transients(&dest).await;
                        return Err(e);
                    }
                }
                cleanup_transients(&dest).await;
                ctx.events
                    .send(Event::Done {
                        id: ctx.id,
                        path: path.clone(),
                    })
                    .ok();
                Ok(EngineOutcome::Completed(path))
            }
            Ok(EngineOutcome::Cancelled) => Ok(EngineOutcome::Cancelled),
            Err(e) => {
                cleanup_transients(&dest).await;
                ctx.events
                    .send(Event::Failed {
                        id: ctx.id,
                        error: e.to_string(),
                    })
                    .ok();
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        spec: &crate::types::DownloadSpec,
        dest: &Path,
        ctx: &EngineContext,
    ) -> Result<EngineOutcome> {
        if TransportRegistry::is_torrent(&spec.source_uri) {
            return self.run_torrent(spec, dest, ctx).await;
        }

        let adapter = self.registry.adapter_for(&spec.source_uri)?;
        ctx.events.send(Event::Probing { id: ctx.id }).ok();
        let probe = adapter.probe(&spec.source_uri).await?;
        tracing::debug!(
            id = %ctx.id,
            total = ?probe.total_bytes,
            ranges = probe.supports_range,
            "Probe complete"
        );

        // Rate policy: max_speed clears any override; manual pins the
        // override; auto leaves the handle to the arbiter.
        match spec.mode {
            Mode::MaxSpeed => ctx.rate.clear(),
            Mode::Manual => {
                if let Some(bps) = spec.bandwidth_override {
                    ctx.rate.set(bps);
                }
            }
            Mode::Auto => {}
        }

        let plan = strategy::choose(
            probe.total_bytes,
            probe.supports_range,
            spec.thread_count_hint,
            spec.mode == Mode::MaxSpeed,
            self.config.max_range_workers,
        );

        match plan {
            Strategy::SingleStream => {
                self.run_single_stream(spec, dest, probe.total_bytes, ctx, adapter)
                    .await
            }
            Strategy::ParallelRanges {
                threads,
                chunk_size,
            } => {
                // Strategy only picks parallel when the probe reported a size.
                let total = probe.total_bytes.unwrap_or(0);
                self.run_parallel(spec, dest, total, threads, chunk_size, ctx, adapter)
                    .await
            }
        }
    }

    async fn run_single_stream(
        &self,
        spec: &crate::types::DownloadSpec,
        dest: &Path,
        total: Option<u64>,
        ctx: &EngineContext,
        adapter: Arc<dyn Transport>,
    ) -> Result<EngineOutcome> {
        let source = adapter.open(&spec.source_uri, None).await?;

        // Halt fresh chunk reads on cancellation; the chunk already pulled
        // finishes its write.
        let cancel = ctx.cancel.clone();
        let counter = ctx.bytes_written.clone();
        let source = source
            .take_while(move |_| {
                let open = !cancel.is_cancelled();
                async move { open }
            })
            .map(move |item| {
                if let Ok(chunk) = &item {
                    counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                item
            });

        let writer = self.writer_for(spec, ctx);
        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        let written = writer.write_stream(&mut file, Box::pin(source)).await?;
        drop(file);

        if ctx.cancel.is_cancelled() {
            return Ok(EngineOutcome::Cancelled);
        }
        if let Some(expected) = total {
            if written != expected {
                return Err(TransportError::Truncated {
                    expected,
                    actual: written,
                }
                .into());
            }
        }

        ctx.events.send(Event::Finalizing { id: ctx.id }).ok();
        finalization::finalize(dest).await?;
        Ok(EngineOutcome::Completed(dest.to_path_buf()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        spec: &crate::types::DownloadSpec,
        dest: &Path,
        total: u64,
        threads: usize,
        chunk_size: usize,
        ctx: &EngineContext,
        adapter: Arc<dyn Transport>,
    ) -> Result<EngineOutcome> {
        let ranges = strategy::partition(total, threads);
        tracing::info!(
            id = %ctx.id,
            threads,
            chunk_size,
            total,
            "Starting parallel range download"
        );
        let slots = ctx.slots.install(threads);

        let workers = ranges.iter().enumerate().map(|(index, range)| {
            let adapter = adapter.clone();
            let uri = spec.source_uri.clone();
            let slots = slots.clone();
            let cancel = ctx.cancel.clone();
            let counter = ctx.bytes_written.clone();
            let fallback = &self.fallback;
            let range = *range;
            async move {
                // A closed semaphore cannot happen here; treat it as cancel.
                let _permit = match slots.acquire().await {
                    Ok(p) => p,
                    Err(_) => return Ok::<_, Error>((index, Bytes::new())),
                };
                if cancel.is_cancelled() {
                    return Ok((index, Bytes::new()));
                }
                let data = fetch_range_with_fallback(
                    adapter.as_ref(),
                    fallback,
                    &uri,
                    range,
                    index,
                )
                .await?;
                counter.fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok((index, data))
            }
        });

        let mut parts: Vec<Option<Bytes>> = vec![None; ranges.len()];
        for result in futures::future::join_all(workers).await {
            let (index, data) = result?;
            parts[index] = Some(data);
        }

        if ctx.cancel.is_cancelled() {
            return Ok(EngineOutcome::Cancelled);
        }

        // Concatenate in range order; an empty buffer means the range (and
        // its fallback) died, which fails the whole download.
        for (index, part) in parts.iter().enumerate() {
            let empty = part.as_ref().map(|b| b.is_empty()).unwrap_or(true);
            if empty {
                let r = ranges[index];
                return Err(TransportError::EmptyRange {
                    index,
                    lo: r.lo,
                    hi: r.hi,
                }
                .into());
            }
        }

        let writer = self.writer_for(spec, ctx).with_chunk_size(chunk_size);
        let part_file = part_path(dest);
        let mut file = tokio::fs::File::create(&part_file).await?;
        for part in parts.into_iter().flatten() {
            writer.write_buffer(&mut file, &part).await?;
        }
        drop(file);

        ctx.events.send(Event::Finalizing { id: ctx.id }).ok();
        finalization::finalize(dest).await?;
        Ok(EngineOutcome::Completed(dest.to_path_buf()))
    }

    async fn run_torrent(
        &self,
        spec: &crate::types::DownloadSpec,
        dest: &Path,
        ctx: &EngineContext,
    ) -> Result<EngineOutcome> {
        let provider = self.registry.torrent_provider().ok_or_else(|| {
            Error::InvalidInput("no torrent transport registered".to_string())
        })?;
        let workdir = self.config.torrent_workdir.join(ctx.id.to_string());
        tokio::fs::create_dir_all(&workdir).await?;

        let counter = ctx.bytes_written.clone();
        let progress = Box::new(move |p: TorrentProgress| {
            counter.store(p.done_bytes, Ordering::Relaxed);
        });
        let outputs = provider
            .download(&spec.source_uri, &workdir, ctx.rate.clone(), progress)
            .await?;
        if ctx.cancel.is_cancelled() {
            return Ok(EngineOutcome::Cancelled);
        }

        // Largest produced file becomes the destination artifact.
        let largest = crate::transport::torrent::largest_output(&outputs)
            .await
            .ok_or_else(|| Error::Other("torrent produced no files".to_string()))?;
        tokio::fs::rename(&largest, dest).await?;
        Ok(EngineOutcome::Completed(dest.to_path_buf()))
    }

    fn writer_for(&self, spec: &crate::types::DownloadSpec, ctx: &EngineContext) -> DiskWriter {
        let mut writer = DiskWriter::new(&self.config, ctx.rate.clone()).with_prefetch(true);
        if let Some(chunk) = spec.chunk_size_hint {
            writer = writer.with_chunk_size(chunk);
        }
        writer
    }

    fn spawn_progress_reporter(
        &self,
        ctx: &EngineContext,
        total: Option<u64>,
    ) -> tokio::task::JoinHandle<()> {
        let id = ctx.id;
        let counter = ctx.bytes_written.clone();
        let events = ctx.events.clone();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last = 0u64;
            let mut last_at = std::time::Instant::now();
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = counter.load(Ordering::Relaxed);
                        let elapsed = last_at.elapsed().as_secs_f64();
                        let rate = if elapsed > 0.0 {
                            ((now - last) as f64 / elapsed) as u64
                        } else {
                            0
                        };
                        last = now;
                        last_at = std::time::Instant::now();
                        events
                            .send(Event::Progress {
                                id,
                                bytes_written: now,
                                total_bytes: total,
                                rate_bps: rate,
                            })
                            .ok();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

/// Fetch one range, retrying exactly once over the plain fallback client
/// for HTTP sources (other transports retry through the same adapter).
async fn fetch_range_with_fallback(
    adapter: &dyn Transport,
    fallback: &HttpTransport,
    uri: &Url,
    range: ByteRange,
    index: usize,
) -> Result<Bytes> {
    match adapter.fetch_range(uri, range.lo, range.hi).await {
        Ok(data) if !data.is_empty() => return Ok(data),
        Ok(_) => {
            tracing::warn!(index, "Range fetch returned empty body, retrying via fallback");
        }
        Err(e) => {
            tracing::warn!(index, error = %e, "Range fetch failed, retrying via fallback");
        }
    }
    let retry = if matches!(uri.scheme(), "http" | "https") {
        fallback.fetch_range_fallback(uri, range.lo, range.hi).await
    } else {
        adapter.fetch_range(uri, range.lo, range.hi).await
    };
    match retry {
        Ok(data) if !data.is_empty() => Ok(data),
        Ok(_) => Ok(Bytes::new()),
        Err(e) => {
            tracing::error!(index, error = %e, "Range fallback failed");
            // The empty buffer is detected at join time and fails the
            // download with an EmptyRange error carrying the range bounds.
            Ok(Bytes::new())
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::NoOpScanner;
    use crate::types::DownloadSpec;

    fn engine_with_root(root: &Path) -> DownloadEngine {
        let config = DownloadConfig {
            download_root: root.to_path_buf(),
            ..Default::default()
        };
        let registry = Arc::new(TransportRegistry::new(&config));
        DownloadEngine::new(config, registry, Arc::new(NoOpScanner))
    }

    fn ctx() -> EngineContext {
        let (tx, _rx) = tokio::sync::broadcast::channel(64);
        EngineContext::new(DownloadId::new(), tx)
    }

    #[tokio::test]
    async fn test_data_url_download() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_root(dir.path());
        let spec = DownloadSpec::new(
            Url::parse("data:;base64,aGVsbG8gd29ybGQ=").unwrap(),
            PathBuf::from("greeting.txt"),
        );
        let ctx = ctx();
        let outcome = engine.run(&spec, &ctx).await.unwrap();

        let dest = dir.path().join("greeting.txt");
        assert_eq!(outcome, EngineOutcome::Completed(dest.clone()));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello world");
        assert!(!part_path(&dest).exists());
        assert!(!meta_path(&dest).exists());
        assert_eq!(ctx.bytes_written.load(Ordering::Relaxed), 11);
    }

    #[tokio::test]
    async fn test_file_url_download() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(&src, &payload).await.unwrap();

        let engine = engine_with_root(dir.path());
        let spec = DownloadSpec::new(
            Url::from_file_path(&src).unwrap(),
            PathBuf::from("copy.bin"),
        );
        engine.run(&spec, &ctx()).await.unwrap();
        assert_eq!(
            tokio::fs::read(dir.path().join("copy.bin")).await.unwrap(),
            payload
        );
    }

    #[tokio::test]
    async fn test_no_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("existing.txt");
        tokio::fs::write(&dest, b"already here").await.unwrap();

        let engine = engine_with_root(dir.path());
        let spec = DownloadSpec::new(
            Url::parse("data:,payload").unwrap(),
            PathBuf::from("existing.txt"),
        );
        let err = engine.run(&spec, &ctx()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"already here");
    }

    #[tokio::test]
    async fn test_failure_leaves_no_transients_and_no_dest() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_root(dir.path());
        let spec = DownloadSpec::new(
            Url::parse("file:///definitely/not/there.bin").unwrap(),
            PathBuf::from("out.bin"),
        );
        let err = engine.run(&spec, &ctx()).await;
        assert!(err.is_err());
        let dest = dir.path().join("out.bin");
        assert!(!dest.exists());
        assert!(!meta_path(&dest).exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_torrent_without_provider() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_root(dir.path());
        let spec = DownloadSpec::new(
            Url::parse("magnet:?xt=urn:btih:deadbeef").unwrap(),
            PathBuf::from("t.bin"),
        );
        let err = engine.run(&spec, &ctx()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_spin_down_before_run_reduces_install() {
        let slots = RangeSlots::new();
        slots.spin_down(3);
        let sem = slots.install(8);
        assert_eq!(sem.available_permits(), 5);
    }

    #[tokio::test]
    async fn test_spin_down_during_run_forgets_permits() {
        let slots = RangeSlots::new();
        let sem = slots.install(4);
        slots.spin_down(2);
        assert_eq!(sem.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_spin_down_never_below_one_at_install() {
        let slots = RangeSlots::new();
        slots.spin_down(100);
        let sem = slots.install(4);
        assert_eq!(sem.available_permits(), 1);
    }
}
