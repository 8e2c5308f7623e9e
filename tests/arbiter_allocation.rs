//! Arbiter allocation scenarios with injected system state

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use throttle_dl::arbiter::{
    Arbiter, ArbiterCommand, DownloadDirectory, StaticLatency, StaticProbe, TrackedDownload,
    latency,
};
use throttle_dl::config::MIB;
use throttle_dl::types::SystemLoad;
use throttle_dl::{Config, DownloadId, DownloadState, Mode, RateHandle};
use tokio_util::sync::CancellationToken;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.arbiter.period = Duration::from_millis(50);
    config.arbiter.sample_window = Duration::from_millis(5);
    // Keep heartbeat files out of the working directory
    config.supervisor.heartbeat_dir = std::env::temp_dir();
    config
}

fn probe(bandwidth: u64, cpu: f32, net: u64) -> StaticProbe {
    StaticProbe {
        bandwidth_bps: Some(bandwidth),
        load: SystemLoad {
            cpu_percent: cpu,
            ram_percent: 50.0,
            net_bps: net,
        },
        process_table: vec![],
    }
}

fn track(directory: &DownloadDirectory, name: &str) -> TrackedDownload {
    let entry = TrackedDownload {
        id: DownloadId::new(),
        name: name.to_string(),
        rate: RateHandle::new(),
        bytes_written: Arc::new(AtomicU64::new(0)),
        total_size: Some(50 * MIB),
        state: DownloadState::Running,
        mode: Mode::Auto,
    };
    directory.upsert(entry.clone());
    entry
}

/// Two running records with priorities 5 and 3 split 100 MiB/s in their
/// score ratio, both above the 2 MiB/s floor.
#[tokio::test]
async fn fairness_follows_priorities() {
    let config = Arc::new(fast_config());
    let directory = DownloadDirectory::new();
    let (events, _) = tokio::sync::broadcast::channel(64);
    let (mut arbiter, handle) = Arbiter::new(
        config,
        directory.clone(),
        Arc::new(probe(100 * MIB, 60.0, 50 * MIB)),
        Arc::new(StaticLatency(latency::summarize(vec![5.0]))),
        events,
    );

    let high = track(&directory, "high.bin");
    let low = track(&directory, "low.bin");
    let mut overrides = std::collections::HashMap::new();
    overrides.insert("high.bin".to_string(), 5u8);
    overrides.insert("low.bin".to_string(), 3u8);
    handle
        .send(ArbiterCommand::SetPriorities(overrides))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(async move { arbiter.run(cancel.clone()).await });
    tokio::time::sleep(Duration::from_millis(250)).await;
    task.abort();

    let snap = handle.snapshot();
    let high_bps = snap.rate_for(high.id).expect("high record allocated");
    let low_bps = snap.rate_for(low.id).expect("low record allocated");

    assert!(high_bps >= 2 * MIB && low_bps >= 2 * MIB, "minimum guarantee");
    assert!(high_bps > low_bps, "priority 5 must out-rank priority 3");

    // The assignment ratio tracks the score ratio within 5%
    let high_score = snap
        .allocations
        .iter()
        .find(|a| a.id == Some(high.id))
        .unwrap()
        .score;
    let low_score = snap
        .allocations
        .iter()
        .find(|a| a.id == Some(low.id))
        .unwrap()
        .score;
    let bps_ratio = high_bps as f64 / low_bps as f64;
    let score_ratio = high_score / low_score;
    assert!(
        (bps_ratio - score_ratio).abs() / score_ratio < 0.05,
        "bps ratio {bps_ratio:.3} should track score ratio {score_ratio:.3}"
    );

    // The published rates reached the records' handles
    assert_eq!(high.rate.get(), high_bps);
    assert_eq!(low.rate.get(), low_bps);
}

/// A quiet machine lifts a 5 MiB/s-class assignment to the 20 MiB/s burst
/// floor.
#[tokio::test]
async fn idle_burst_raises_single_record() {
    let config = Arc::new(fast_config());
    let directory = DownloadDirectory::new();
    let (events, _) = tokio::sync::broadcast::channel(64);
    // CPU < 10%, net < 5 MB/s: idle
    let (mut arbiter, handle) = Arbiter::new(
        config,
        directory.clone(),
        Arc::new(probe(5 * MIB, 3.0, 1_000_000)),
        Arc::new(StaticLatency(latency::summarize(vec![5.0]))),
        events,
    );
    let record = track(&directory, "only.bin");

    let cancel = CancellationToken::new();
    let task = tokio::spawn(async move { arbiter.run(cancel.clone()).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    task.abort();

    let snap = handle.snapshot();
    assert!(snap.idle_burst, "quiet machine must flag idle burst");
    assert!(
        snap.rate_for(record.id).unwrap() >= 20 * MIB,
        "idle burst lifts the assignment to at least 20 MiB/s"
    );
}

/// Measurement failure substitutes the 100 MiB/s fallback.
#[tokio::test]
async fn measurement_failure_uses_fallback() {
    let config = Arc::new(fast_config());
    let directory = DownloadDirectory::new();
    let (events, _) = tokio::sync::broadcast::channel(64);
    let no_measure = StaticProbe {
        bandwidth_bps: None,
        load: SystemLoad {
            cpu_percent: 60.0,
            ram_percent: 50.0,
            net_bps: 50 * MIB,
        },
        process_table: vec![],
    };
    let (mut arbiter, handle) = Arbiter::new(
        config,
        directory,
        Arc::new(no_measure),
        Arc::new(StaticLatency(latency::summarize(vec![5.0]))),
        events,
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn(async move { arbiter.run(cancel.clone()).await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    task.abort();

    assert_eq!(handle.snapshot().measured_available_bps, 100 * MIB);
}

/// The arbiter writes its heartbeat every tick.
#[tokio::test]
async fn arbiter_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.supervisor.heartbeat_dir = dir.path().to_path_buf();
    let config = Arc::new(config);
    let directory = DownloadDirectory::new();
    let (events, _) = tokio::sync::broadcast::channel(64);
    let (mut arbiter, _handle) = Arbiter::new(
        config,
        directory,
        Arc::new(probe(50 * MIB, 60.0, 10 * MIB)),
        Arc::new(StaticLatency(latency::summarize(vec![5.0]))),
        events,
    );

    let cancel = CancellationToken::new();
    let task = tokio::spawn(async move { arbiter.run(cancel.clone()).await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    task.abort();

    let age = throttle_dl::supervisor::heartbeat::age(dir.path(), "arbiter")
        .await
        .expect("heartbeat file written");
    assert!(age < Duration::from_secs(2));
}
