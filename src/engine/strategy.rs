//! Strategy selection: parallelism auto-tuning and range partitioning

use crate::config::{GIB, MIB};
use crate::transport::ByteRange;

/// Chosen execution plan for one download
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// One sequential stream through the disk writer
    SingleStream,
    /// Parallel range fetches joined in order
    ParallelRanges {
        /// Number of range workers
        threads: usize,
        /// Chunk size handed to the disk writer
        chunk_size: usize,
    },
}

/// Absolute per-tier limits: ≥ 2 GiB allows up to 32 threads and 8 MiB
/// chunks, ≥ 512 MiB up to 16 threads and 4 MiB chunks, everything else up
/// to 8 threads and 1 MiB chunks.
fn tier_limits(total_size: u64) -> (usize, usize) {
    if total_size >= 2 * GIB {
        (32, 8 * MIB as usize)
    } else if total_size >= 512 * MIB {
        (16, 4 * MIB as usize)
    } else {
        (8, MIB as usize)
    }
}

/// Tune thread count and chunk size from the total size and CPU count.
///
/// The tier limit bounds the CPU-scaled count: very large files may use up
/// to twice the core count.
pub fn auto_tune(total_size: u64, cpu_count: usize) -> (usize, usize) {
    let (cap, chunk) = tier_limits(total_size);
    let scaled = if total_size >= 2 * GIB {
        cpu_count * 2
    } else {
        cpu_count
    };
    (scaled.clamp(1, cap), chunk)
}

/// Pick the strategy for a probed download.
///
/// An explicit thread hint is honored up to the size tier's absolute cap;
/// CPU scaling only drives the max-speed auto-tuning, so a request for
/// four workers yields four sub-ranges on any machine.
pub fn choose(
    total_size: Option<u64>,
    supports_range: bool,
    thread_hint: usize,
    max_speed: bool,
    max_workers: usize,
) -> Strategy {
    let Some(total) = total_size else {
        return Strategy::SingleStream;
    };
    if total == 0 || (!max_speed && thread_hint <= 1) || !supports_range {
        return Strategy::SingleStream;
    }
    let (tier_cap, mut chunk_size) = tier_limits(total);
    let mut threads = if max_speed {
        // Max-speed mode floors the auto-tuning instead of capping it.
        let (scaled, _) = auto_tune(total, num_cpus::get());
        chunk_size = chunk_size.max(8 * MIB as usize);
        scaled.max(16)
    } else {
        thread_hint.min(tier_cap)
    };
    threads = threads.min(max_workers).max(1);
    if threads <= 1 {
        return Strategy::SingleStream;
    }
    // A range per thread only pays off when each range holds a few chunks.
    if total < threads as u64 * chunk_size as u64 {
        threads = (total / chunk_size as u64).max(1) as usize;
        if threads <= 1 {
            return Strategy::SingleStream;
        }
    }
    Strategy::ParallelRanges {
        threads,
        chunk_size,
    }
}

/// Partition `[0, total)` into `threads` contiguous, non-overlapping
/// inclusive ranges. The last range absorbs the remainder.
pub fn partition(total: u64, threads: usize) -> Vec<ByteRange> {
    debug_assert!(threads >= 1 && total > 0);
    let threads = threads.max(1) as u64;
    let span = total / threads;
    (0..threads)
        .map(|i| {
            let lo = i * span;
            let hi = if i == threads - 1 {
                total - 1
            } else {
                (i + 1) * span - 1
            };
            ByteRange { lo, hi }
        })
        .collect()
}
