//! Chunked, flush-disciplined, optionally rate-limited disk writing
//!
//! The writer is the single point where cooperative throttling happens: it
//! re-reads its [`RateHandle`] at every chunk boundary and sleeps
//! `len(chunk) / rate` afterwards, so an arbiter decision takes effect
//! within one chunk-time. Chunk sizes adapt to observed throughput, aiming
//! for roughly 300 ms per write inside a 64 KiB .. 8 MiB envelope.

use crate::config::DownloadConfig;
use crate::error::{DiskError, Error, Result};
use crate::types::RateHandle;
use bytes::Bytes;
use futures::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Window over which throughput is measured before re-targeting
const ADAPT_WINDOW: Duration = Duration::from_millis(500);

/// Target wall-clock time for one chunk write
const TARGET_CHUNK_SECS: f64 = 0.3;

/// Prefetch queue depth. Bounds look-ahead memory at `2 × chunk_size`.
const PREFETCH_DEPTH: usize = 2;

/// Delay between `safe_write` attempts
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub use crate::transport::ByteStream;

/// Thread-safe, optionally throttled disk writer.
///
/// A single writer may be driven from multiple tasks; chunk-level writes are
/// serialized by an internal mutex. Throttling follows the shared
/// [`RateHandle`] (0 = unthrottled).
pub struct DiskWriter {
    rate: RateHandle,
    initial_chunk: usize,
    min_chunk: usize,
    max_chunk: usize,
    fsync_interval: Duration,
    adaptive: bool,
    prefetch: bool,
    closed: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
}

impl DiskWriter {
    /// Writer with configuration defaults and the given rate handle.
    pub fn new(config: &DownloadConfig, rate: RateHandle) -> Self {
        Self {
            rate,
            initial_chunk: config.chunk_size,
            min_chunk: config.min_chunk_size,
            max_chunk: config.max_chunk_size,
            fsync_interval: config.fsync_interval,
            adaptive: true,
            prefetch: false,
            closed: AtomicBool::new(false),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Override the initial chunk size (clamped into the adaptive envelope).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.initial_chunk = chunk_size.clamp(self.min_chunk, self.max_chunk);
        self
    }

    /// Enable read-ahead of one chunk on a background task when writing
    /// from a pull source.
    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Disable adaptive chunk re-targeting (fixed chunk size).
    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    /// The rate handle this writer paces itself against.
    pub fn rate(&self) -> &RateHandle {
        &self.rate
    }

    /// Dispose the writer. Subsequent writes fail with `ClosedResource`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Write an in-memory buffer to an open file. Returns bytes written.
    pub async fn write_buffer(&self, file: &mut File, data: &[u8]) -> Result<u64> {
        let mut cursor = Cursor {
            data,
            offset: 0,
            chunk_size: self.initial_chunk,
        };
        let mut run = WriteRun::new(self);
        loop {
            cursor.chunk_size = run.chunk_size;
            let Some(chunk) = cursor.next_chunk() else {
                break;
            };
            run.write_chunk(self, file, chunk).await?;
        }
        run.finish(file).await;
        Ok(run.total_written)
    }

    /// Write a pull-style stream to an open file. Returns bytes written.
    ///
    /// With prefetch enabled, one chunk is read ahead on a background task
    /// through a bounded channel of depth 2; the blocking send provides
    /// back-pressure and the channel closes on end-of-stream.
    pub async fn write_stream(&self, file: &mut File, source: ByteStream) -> Result<u64> {
        if self.prefetch {
            let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<Bytes>>(PREFETCH_DEPTH);
            let reader = tokio::spawn(async move {
                let mut source = source;
                while let Some(item) = source.next().await {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
            });
            let mut run = WriteRun::new(self);
            while let Some(item) = rx.recv().await {
                let chunk = item?;
                if chunk.is_empty() {
                    continue;
                }
                run.write_chunk(self, file, &chunk).await?;
            }
            run.finish(file).await;
            reader.await.ok();
            Ok(run.total_written)
        } else {
            let mut source = source;
            let mut run = WriteRun::new(self);
            while let Some(item) = source.next().await {
                let chunk = item?;
                if chunk.is_empty() {
                    continue;
                }
                run.write_chunk(self, file, &chunk).await?;
            }
            run.finish(file).await;
            Ok(run.total_written)
        }
    }

    /// Write `data` to `path` atomically: the bytes land in `<path>.part`,
    /// are fsync'd, and the part file is renamed into place. On failure the
    /// writer sleeps one second and retries, up to `retries` attempts total.
    pub async fn safe_write(&self, path: &Path, data: &[u8], retries: u32) -> Result<()> {
        let part = part_path(path);
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 1..=retries.max(1) {
            match self.try_safe_write(path, &part, data).await {
                Ok(()) => return Ok(()),
                Err(Error::Disk(DiskError::Closed)) => return Err(DiskError::Closed.into()),
                Err(e) => {
                    tracing::warn!(path = %path.display(), attempt, error = %e, "Write attempt failed");
                    last_err = Some(match e {
                        Error::Io(io) => io,
                        other => std::io::Error::other(other.to_string()),
                    });
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
        Err(DiskError::WriteFailed {
            path: path.to_path_buf(),
            attempts: retries.max(1),
            source: last_err.unwrap_or_else(|| std::io::Error::other("unknown write failure")),
        }
        .into())
    }

    async fn try_safe_write(&self, path: &Path, part: &Path, data: &[u8]) -> Result<()> {
        let mut file = File::create(part).await?;
        self.write_buffer(&mut file, data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(part, path).await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiskError::Closed.into());
        }
        Ok(())
    }
}

/// Compute the next chunk size from observed throughput.
///
/// Targets ~300 ms per chunk; the size only moves when the change would be
/// at least `min_chunk`, keeping the writer stable under noisy throughput.
fn retarget_chunk(current: usize, speed_bps: f64, min_chunk: usize, max_chunk: usize) -> usize {
    if speed_bps <= 0.0 {
        return current;
    }
    let target = (speed_bps * TARGET_CHUNK_SECS) as usize;
    let target = target.clamp(min_chunk, max_chunk);
    if target.abs_diff(current) >= min_chunk {
        target
    } else {
        current
    }
}

/// Suffix a path with `.part`
pub fn part_path(path: &Path) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".part");
    std::path::PathBuf::from(s)
}

/// In-memory chunk cursor for `write_buffer`
struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
    chunk_size: usize,
}

impl<'a> Cursor<'a> {
    fn next_chunk(&mut self) -> Option<&'a [u8]> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = &self.data[self.offset..end];
        self.offset = end;
        Some(chunk)
    }
}

/// Per-call adaptive/throttle/fsync bookkeeping
struct WriteRun {
    total_written: u64,
    chunk_size: usize,
    last_fsync: Instant,
    window_start: Instant,
    window_bytes: u64,
}

impl WriteRun {
    fn new(writer: &DiskWriter) -> Self {
        let now = Instant::now();
        Self {
            total_written: 0,
            chunk_size: writer.initial_chunk,
            last_fsync: now,
            window_start: now,
            window_bytes: 0,
        }
    }

    async fn write_chunk(&mut self, writer: &DiskWriter, file: &mut File, chunk: &[u8]) -> Result<()> {
        writer.ensure_open()?;
        {
            let _guard = writer.write_lock.lock().await;
            file.write_all(chunk).await.map_err(map_sink_error)?;
            file.flush().await.map_err(map_sink_error)?;
        }
        self.total_written += chunk.len() as u64;
        self.window_bytes += chunk.len() as u64;

        if writer.adaptive {
            let elapsed = self.window_start.elapsed();
            if elapsed >= ADAPT_WINDOW {
                let speed = self.window_bytes as f64 / elapsed.as_secs_f64();
                self.chunk_size =
                    retarget_chunk(self.chunk_size, speed, writer.min_chunk, writer.max_chunk);
                self.window_start = Instant::now();
                self.window_bytes = 0;
            }
        }

        // Cooperative throttle: rate is re-read every chunk so allocation
        // changes land at the next chunk boundary.
        let rate = writer.rate.get();
        if rate > 0 {
            let pause = chunk.len() as f64 / rate as f64;
            tokio::time::sleep(Duration::from_secs_f64(pause)).await;
        }

        if self.last_fsync.elapsed() >= writer.fsync_interval {
            if let Err(e) = file.sync_data().await {
                tracing::warn!(error = %e, "Periodic fsync failed");
            }
            self.last_fsync = Instant::now();
        }
        Ok(())
    }

    /// Final fsync. Failure is logged, never fatal.
    async fn finish(&self, file: &mut File) {
        if let Err(e) = file.sync_all().await {
            tracing::warn!(error = %e, "Final fsync failed");
        }
    }
}

fn map_sink_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            Error::Disk(DiskError::InvalidSink("sink is not writable".to_string()))
        }
        _ => Error::Io(e),
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use futures::stream;

    fn writer() -> DiskWriter {
        DiskWriter::new(&DownloadConfig::default(), RateHandle::new())
    }

    #[test]
    fn test_retarget_moves_only_on_significant_change() {
        let min = 64 * 1024;
        let max = 8 * 1024 * 1024;
        // 10 MiB/s * 0.3s = 3 MiB target, far from 1 MiB: move
        let next = retarget_chunk(1024 * 1024, 10.0 * 1024.0 * 1024.0, min, max);
        assert_eq!(next, 3_145_728);
        // Small drift below min_chunk delta: hold
        let held = retarget_chunk(1024 * 1024, (1024.0 * 1024.0) / 0.3 * 1.01, min, max);
        assert_eq!(held, 1024 * 1024);
    }

    #[test]
    fn test_retarget_clamps_to_envelope() {
        let min = 64 * 1024;
        let max = 8 * 1024 * 1024;
        assert_eq!(retarget_chunk(1024 * 1024, 1.0, min, max), min);
        assert_eq!(retarget_chunk(1024 * 1024, 1e12, min, max), max);
        // Zero speed: no change
        assert_eq!(retarget_chunk(777, 0.0, min, max), 777);
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/tmp/file.bin")),
            Path::new("/tmp/file.bin.part")
        );
    }

    #[tokio::test]
    async fn test_write_buffer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();

        let w = writer();
        let mut file = File::create(&path).await.unwrap();
        let written = w.write_buffer(&mut file, &data).await.unwrap();
        assert_eq!(written, data.len() as u64);

        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk, data);
    }

    #[tokio::test]
    async fn test_write_stream_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streamed.bin");
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"alpha")),
            Ok(Bytes::from_static(b"")),
            Ok(Bytes::from_static(b"beta")),
            Ok(Bytes::from_static(b"gamma")),
        ];
        let source: ByteStream = Box::pin(stream::iter(chunks));

        let w = writer();
        let mut file = File::create(&path).await.unwrap();
        let written = w.write_stream(&mut file, source).await.unwrap();
        assert_eq!(written, 14);
        assert_eq!(
            tokio::fs::read(&path).await.unwrap(),
            b"alphabetagamma".to_vec()
        );
    }

    #[tokio::test]
    async fn test_write_stream_with_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefetched.bin");
        let chunks: Vec<Result<Bytes>> = (0u8..20)
            .map(|i| Ok(Bytes::from(vec![i; 1000])))
            .collect();
        let source: ByteStream = Box::pin(stream::iter(chunks));

        let w = writer().with_prefetch(true);
        let mut file = File::create(&path).await.unwrap();
        let written = w.write_stream(&mut file, source).await.unwrap();
        assert_eq!(written, 20_000);

        let on_disk = tokio::fs::read(&path).await.unwrap();
        // Chunk order must survive the prefetch queue
        assert_eq!(&on_disk[0..1000], vec![0u8; 1000].as_slice());
        assert_eq!(&on_disk[19_000..], vec![19u8; 1000].as_slice());
    }

    #[tokio::test]
    async fn test_stream_error_aborts_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aborted.bin");
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"good")),
            Err(Error::Other("mid-stream failure".to_string())),
        ];
        let source: ByteStream = Box::pin(stream::iter(chunks));

        let w = writer();
        let mut file = File::create(&path).await.unwrap();
        let result = w.write_stream(&mut file, source).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_closed_writer_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.bin");
        let w = writer();
        w.close();
        let mut file = File::create(&path).await.unwrap();
        let err = w.write_buffer(&mut file, b"data").await.unwrap_err();
        assert!(matches!(err, Error::Disk(DiskError::Closed)));
    }

    #[tokio::test]
    async fn test_safe_write_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atomic.bin");
        let w = writer();
        w.safe_write(&path, b"payload", 3).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"payload");
        assert!(
            !part_path(&path).exists(),
            ".part must not remain after a successful safe_write"
        );
    }

    #[tokio::test]
    async fn test_throttle_paces_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throttled.bin");
        // 100 KiB at 200 KiB/s ≈ 0.5 s
        let rate = RateHandle::with_rate(200 * 1024);
        let w = DiskWriter::new(&DownloadConfig::default(), rate).with_adaptive(false);
        let data = vec![7u8; 100 * 1024];

        let mut file = File::create(&path).await.unwrap();
        let start = Instant::now();
        w.write_buffer(&mut file, &data).await.unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(250),
            "throttled write finished too fast: {elapsed:?}"
        );
        assert!(
            elapsed <= Duration::from_millis(1500),
            "throttled write took too long: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_rate_change_applies_at_chunk_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retimed.bin");
        // One second per 64 KiB chunk; four chunks would take ~4 s throttled.
        let rate = RateHandle::with_rate(64 * 1024);
        let w = std::sync::Arc::new(
            DiskWriter::new(&DownloadConfig::default(), rate.clone())
                .with_adaptive(false)
                .with_chunk_size(64 * 1024),
        );
        let data = vec![1u8; 256 * 1024];

        let w2 = w.clone();
        let start = Instant::now();
        let handle = tokio::spawn(async move {
            let mut file = File::create(&path).await.unwrap();
            w2.write_buffer(&mut file, &data).await.unwrap();
        });
        // Lift the limit while the first chunk's pause is in flight; the
        // change must be observed at the next chunk boundary.
        tokio::time::sleep(Duration::from_millis(200)).await;
        rate.clear();

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("write should finish promptly after the throttle is lifted")
            .unwrap();
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "only the in-flight chunk should pay the old rate, took {:?}",
            start.elapsed()
        );
    }
}
