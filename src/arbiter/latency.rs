//! Interactive-latency measurement and game detection
//!
//! Latency measurement is abstracted behind [`LatencyProbe`] so the
//! interactive override can be tested with deterministic values; the
//! production probe shells out to the system `ping` tool.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Result of one latency measurement
#[derive(Clone, Debug, PartialEq)]
pub struct LatencySample {
    /// Mean round-trip time, milliseconds
    pub mean_ms: f64,
    /// Standard deviation of the samples, milliseconds
    pub stdev_ms: f64,
    /// Individual round-trip times, milliseconds
    pub samples: Vec<f64>,
}

/// Injectable latency measurement.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Measure mean latency to `host` over `count` echo requests.
    async fn measure(&self, host: &str, count: u32, timeout: Duration) -> Result<LatencySample>;
}

/// Probe that runs the system `ping` tool and parses its output
pub struct PingProbe;

#[async_trait]
impl LatencyProbe for PingProbe {
    async fn measure(&self, host: &str, count: u32, timeout: Duration) -> Result<LatencySample> {
        let deadline = timeout * count + Duration::from_secs(2);
        let output = tokio::time::timeout(
            deadline,
            tokio::process::Command::new("ping")
                .arg("-c")
                .arg(count.to_string())
                .arg("-W")
                .arg(timeout.as_secs().max(1).to_string())
                .arg(host)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(deadline, format!("ping {host}")))??;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ping_output(&stdout)
            .ok_or_else(|| Error::Other(format!("could not parse ping output for {host}")))
    }
}

/// Extract per-echo round-trip times from `ping` output.
fn parse_ping_output(output: &str) -> Option<LatencySample> {
    // `time=12.3 ms` lines, one per echo reply
    let re = regex::Regex::new(r"time[=<]([\d.]+)\s*ms").ok()?;
    let samples: Vec<f64> = re
        .captures_iter(output)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();
    if samples.is_empty() {
        return None;
    }
    Some(summarize(samples))
}

/// Mean and standard deviation of a sample set
pub fn summarize(samples: Vec<f64>) -> LatencySample {
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let stdev = if samples.len() > 1 {
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>()
            / (samples.len() - 1) as f64;
        var.sqrt()
    } else {
        0.0
    };
    LatencySample {
        mean_ms: mean,
        stdev_ms: stdev,
        samples,
    }
}

/// Probe returning a fixed sample; for tests and simulations.
pub struct StaticLatency(pub LatencySample);

#[async_trait]
impl LatencyProbe for StaticLatency {
    async fn measure(&self, _host: &str, _count: u32, _timeout: Duration) -> Result<LatencySample> {
        Ok(self.0.clone())
    }
}

/// Normalize a process name for game matching: lowercase, extension
/// stripped.
pub fn normalize_process_name(name: &str) -> String {
    let lower = name.to_lowercase();
    match lower.rsplit_once('.') {
        Some((stem, ext)) if matches!(ext, "exe" | "app" | "bin") => stem.to_string(),
        _ => lower,
    }
}

/// Which of the known game processes are currently running.
pub fn running_games(process_names: &[String], known_games: &[String]) -> Vec<String> {
    let mut found: Vec<String> = process_names
        .iter()
        .map(|n| normalize_process_name(n))
        .filter(|n| known_games.iter().any(|g| g == n))
        .collect();
    found.sort();
    found.dedup();
    found
}
