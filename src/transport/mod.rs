//! Transport adapters
//!
//! Every supported URI scheme is served by an adapter implementing
//! [`Transport`]: a size/capability probe, a streaming open, and — where the
//! protocol supports it — random-access range fetches. The [`TransportRegistry`]
//! maps schemes to adapters and accepts externally registered providers for
//! schemes this crate does not ship an implementation for (`sftp`, `smb`).
//!
//! Torrents follow a separate contract ([`torrent::TorrentTransport`]): no
//! probe, no ranges, a progress callback, and one or more output files under
//! a working directory.

mod data_url;
mod file;
mod ftp;
mod http;
pub mod torrent;

pub use data_url::DataUrlTransport;
pub use file::FileTransport;
pub use ftp::FtpTransport;
pub use http::HttpTransport;

use crate::config::DownloadConfig;
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// A pull-style source of byte chunks
pub type ByteStream = futures::stream::BoxStream<'static, Result<Bytes>>;

/// An inclusive byte range `lo..=hi`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset
    pub lo: u64,
    /// Last byte offset (inclusive)
    pub hi: u64,
}

impl ByteRange {
    /// Length of the range in bytes
    pub fn len(&self) -> u64 {
        self.hi - self.lo + 1
    }

    /// Whether the range is empty (never true for a well-formed range)
    pub fn is_empty(&self) -> bool {
        self.hi < self.lo
    }
}

/// Result of probing a source
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbeInfo {
    /// Total size when the source reports one
    pub total_bytes: Option<u64>,
    /// Whether the source honors byte-range requests
    pub supports_range: bool,
    /// Entity tag, when the protocol carries one
    pub etag: Option<String>,
}

/// Uniform fetcher contract over a URI scheme.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Probe size and capabilities without transferring the body.
    async fn probe(&self, uri: &Url) -> Result<ProbeInfo>;

    /// Open a streaming source, optionally restricted to a byte range.
    async fn open(&self, uri: &Url, range: Option<ByteRange>) -> Result<ByteStream>;

    /// Fetch one byte range into memory.
    ///
    /// Only meaningful when `probe` reported `supports_range`; the default
    /// refuses.
    async fn fetch_range(&self, uri: &Url, lo: u64, hi: u64) -> Result<Bytes> {
        let _ = (lo, hi);
        Err(TransportError::RangeNotSupported {
            scheme: uri.scheme().to_string(),
        }
        .into())
    }
}

/// Scheme → adapter registry.
///
/// Ships with HTTP(S), FTP, `file:` and `data:` adapters; additional schemes
/// (notably `sftp` and `smb`) are registered by the embedding application.
#[derive(Clone)]
pub struct TransportRegistry {
    adapters: HashMap<String, Arc<dyn Transport>>,
    torrent: Option<Arc<dyn torrent::TorrentTransport>>,
}

impl TransportRegistry {
    /// Registry with the built-in adapters.
    pub fn new(config: &DownloadConfig) -> Self {
        let mut adapters: HashMap<String, Arc<dyn Transport>> = HashMap::new();
        let http = Arc::new(HttpTransport::new(config.network_timeout));
        adapters.insert("http".to_string(), http.clone());
        adapters.insert("https".to_string(), http);
        let ftp = Arc::new(FtpTransport::new(config.network_timeout));
        adapters.insert("ftp".to_string(), ftp.clone());
        adapters.insert("ftps".to_string(), ftp);
        adapters.insert("file".to_string(), Arc::new(FileTransport::new()));
        adapters.insert("data".to_string(), Arc::new(DataUrlTransport::new()));
        Self {
            adapters,
            torrent: None,
        }
    }

    /// Register (or replace) an adapter for a scheme.
    pub fn register(&mut self, scheme: &str, adapter: Arc<dyn Transport>) {
        self.adapters.insert(scheme.to_ascii_lowercase(), adapter);
    }

    /// Register a torrent provider.
    pub fn register_torrent(&mut self, provider: Arc<dyn torrent::TorrentTransport>) {
        self.torrent = Some(provider);
    }

    /// Look up the adapter for a URI.
    pub fn adapter_for(&self, uri: &Url) -> Result<Arc<dyn Transport>> {
        self.adapters
            .get(&uri.scheme().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TransportError::UnsupportedScheme(uri.scheme().to_string()).into())
    }

    /// The registered torrent provider, if any.
    pub fn torrent_provider(&self) -> Option<Arc<dyn torrent::TorrentTransport>> {
        self.torrent.clone()
    }

    /// Whether a URI designates a torrent download (magnet link or a
    /// `.torrent` resource).
    pub fn is_torrent(uri: &Url) -> bool {
        uri.scheme().eq_ignore_ascii_case("magnet") || uri.path().ends_with(".torrent")
    }
}
