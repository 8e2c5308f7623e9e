//! Torrent transport contract
//!
//! Torrents sit outside the [`super::Transport`] shape: there is no size
//! probe and no byte ranges. A provider downloads the torrent's content into
//! a working directory, reporting progress through a callback and honoring
//! the shared rate handle; the engine then selects the largest produced file
//! as the destination artifact.
//!
//! No provider ships with this crate — embedding applications register one
//! on the [`super::TransportRegistry`].

use crate::error::Result;
use crate::types::RateHandle;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Progress observation from a torrent provider
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TorrentProgress {
    /// Bytes downloaded so far
    pub done_bytes: u64,
    /// Total bytes wanted, when the provider knows it
    pub total_bytes: Option<u64>,
}

/// Callback invoked as the provider makes progress
pub type ProgressFn = Box<dyn Fn(TorrentProgress) + Send + Sync>;

/// Pluggable torrent downloader.
#[async_trait]
pub trait TorrentTransport: Send + Sync {
    /// Download the torrent identified by `uri` (magnet link or `.torrent`
    /// resource) into `workdir`, pacing transfers against `rate` and
    /// reporting through `progress`. Returns the paths of all files
    /// produced, relative to or under `workdir`.
    async fn download(
        &self,
        uri: &url::Url,
        workdir: &Path,
        rate: RateHandle,
        progress: ProgressFn,
    ) -> Result<Vec<PathBuf>>;
}

/// Pick the largest of the files a provider produced.
///
/// This is the file the engine promotes to `dest`; the remaining files stay
/// in the working directory.
pub async fn largest_output(outputs: &[PathBuf]) -> Option<PathBuf> {
    let mut best: Option<(u64, PathBuf)> = None;
    for path in outputs {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        match &best {
            Some((size, _)) if *size >= meta.len() => {}
            _ => best = Some((meta.len(), path.clone())),
        }
    }
    best.map(|(_, p)| p)
}
