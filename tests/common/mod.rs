//! Shared helpers for integration tests

use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use throttle_dl::scanner::NoOpScanner;
use throttle_dl::transport::TransportRegistry;
use throttle_dl::{Config, DownloadEngine, DownloadId, EngineContext};

/// Engine writing into `root`, with the built-in transports and no scanner.
pub fn engine_in(root: &Path) -> DownloadEngine {
    let mut config = Config::default();
    config.download.download_root = root.to_path_buf();
    let registry = Arc::new(TransportRegistry::new(&config.download));
    DownloadEngine::new(config.download, registry, Arc::new(NoOpScanner))
}

/// Fresh engine context with a throwaway event channel.
pub fn ctx() -> EngineContext {
    let (events, _) = tokio::sync::broadcast::channel(256);
    EngineContext::new(DownloadId::new(), events)
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Deterministic pseudo-random payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x2545F491_u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect()
}

/// A wiremock responder that honors `Range: bytes=lo-hi` requests against a
/// fixed payload, the way a range-capable origin would.
pub struct RangeResponder {
    pub body: Vec<u8>,
}

impl wiremock::Respond for RangeResponder {
    fn respond(&self, request: &wiremock::Request) -> wiremock::ResponseTemplate {
        match request.headers.get("range").and_then(|v| v.to_str().ok()) {
            Some(range) => {
                let Some((lo, hi)) = parse_range(range, self.body.len()) else {
                    return wiremock::ResponseTemplate::new(416);
                };
                wiremock::ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {lo}-{hi}/{}", self.body.len()),
                    )
                    .set_body_bytes(self.body[lo..=hi].to_vec())
            }
            None => wiremock::ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

fn parse_range(header: &str, len: usize) -> Option<(usize, usize)> {
    let spec = header.strip_prefix("bytes=")?;
    let (lo, hi) = spec.split_once('-')?;
    let lo: usize = lo.parse().ok()?;
    let hi: usize = hi.parse().ok()?;
    if lo > hi || hi >= len {
        return None;
    }
    Some((lo, hi))
}
