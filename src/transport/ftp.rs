//! FTP transport
//!
//! The FTP client is synchronous; transfers run under `spawn_blocking` and
//! stream into a bounded channel so the async side sees the same pull
//! contract as every other adapter. No range support.

use super::{ByteRange, ByteStream, ProbeInfo, Transport};
use crate::error::{Error, Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Read;
use std::time::Duration;
use suppaftp::FtpStream;
use url::Url;

/// Transfer chunk size
const READ_CHUNK: usize = 256 * 1024;

/// Channel depth between the blocking reader and the async consumer
const CHANNEL_DEPTH: usize = 4;

/// FTP adapter (plain; `ftps` URIs are served without TLS upgrade)
pub struct FtpTransport {
    timeout: Duration,
}

struct FtpTarget {
    addr: String,
    user: Option<String>,
    pass: Option<String>,
    path: String,
}

impl FtpTransport {
    /// Adapter with the given connect timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn target(uri: &Url) -> Result<FtpTarget> {
        let host = uri
            .host_str()
            .ok_or_else(|| TransportError::InvalidUri(format!("FTP URI without host: {uri}")))?;
        let port = uri.port().unwrap_or(21);
        let user = if uri.username().is_empty() {
            None
        } else {
            Some(uri.username().to_string())
        };
        Ok(FtpTarget {
            addr: format!("{host}:{port}"),
            user,
            pass: uri.password().map(String::from),
            path: uri.path().to_string(),
        })
    }

    fn connect(target: &FtpTarget) -> Result<FtpStream> {
        let mut ftp =
            FtpStream::connect(&target.addr).map_err(|e| TransportError::Ftp(e.to_string()))?;
        match (&target.user, &target.pass) {
            (Some(user), pass) => ftp
                .login(user.as_str(), pass.as_deref().unwrap_or(""))
                .map_err(|e| TransportError::Ftp(e.to_string()))?,
            (None, _) => ftp
                .login("anonymous", "anonymous")
                .map_err(|e| TransportError::Ftp(e.to_string()))?,
        }
        ftp.transfer_type(suppaftp::types::FileType::Binary)
            .map_err(|e| TransportError::Ftp(e.to_string()))?;
        Ok(ftp)
    }
}

#[async_trait]
impl Transport for FtpTransport {
    async fn probe(&self, uri: &Url) -> Result<ProbeInfo> {
        let target = Self::target(uri)?;
        let timeout = self.timeout;
        let size = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || -> Result<Option<u64>> {
                let mut ftp = Self::connect(&target)?;
                let size = ftp.size(&target.path).ok().map(|s| s as u64);
                ftp.quit().ok();
                Ok(size)
            }),
        )
        .await
        .map_err(|_| Error::Timeout(timeout, "FTP SIZE probe".to_string()))?
        .map_err(|e| Error::Other(format!("FTP probe task failed: {e}")))??;

        Ok(ProbeInfo {
            total_bytes: size,
            supports_range: false,
            etag: None,
        })
    }

    async fn open(&self, uri: &Url, range: Option<ByteRange>) -> Result<ByteStream> {
        if range.is_some() {
            return Err(TransportError::RangeNotSupported {
                scheme: uri.scheme().to_string(),
            }
            .into());
        }
        let target = Self::target(uri)?;
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes>>(CHANNEL_DEPTH);

        tokio::task::spawn_blocking(move || {
            let result = (|| -> Result<()> {
                let mut ftp = Self::connect(&target)?;
                let mut reader = ftp
                    .retr_as_stream(&target.path)
                    .map_err(|e| TransportError::Ftp(e.to_string()))?;
                loop {
                    let mut buf = vec![0u8; READ_CHUNK];
                    let n = reader
                        .read(&mut buf)
                        .map_err(|e| TransportError::Ftp(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    buf.truncate(n);
                    if tx.blocking_send(Ok(Bytes::from(buf))).is_err() {
                        // Consumer went away; stop transferring.
                        return Ok(());
                    }
                }
                ftp.finalize_retr_stream(reader).ok();
                ftp.quit().ok();
                Ok(())
            })();
            if let Err(e) = result {
                tx.blocking_send(Err(e)).ok();
            }
        });

        Ok(Box::pin(tokio_stream_from(rx)))
    }
}

fn tokio_stream_from(
    rx: tokio::sync::mpsc::Receiver<Result<Bytes>>,
) -> impl futures::Stream<Item = Result<Bytes>> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parsing() {
        let uri = Url::parse("ftp://user:pw@host.example:2121/pub/file.bin").unwrap();
        let t = FtpTransport::target(&uri).unwrap();
        assert_eq!(t.addr, "host.example:2121");
        assert_eq!(t.user.as_deref(), Some("user"));
        assert_eq!(t.pass.as_deref(), Some("pw"));
        assert_eq!(t.path, "/pub/file.bin");
    }

    #[test]
    fn test_target_defaults() {
        let uri = Url::parse("ftp://mirror.example/file.iso").unwrap();
        let t = FtpTransport::target(&uri).unwrap();
        assert_eq!(t.addr, "mirror.example:21");
        assert!(t.user.is_none(), "anonymous login when no user is given");
    }

    #[tokio::test]
    async fn test_open_with_range_refused() {
        let uri = Url::parse("ftp://mirror.example/file.iso").unwrap();
        let err = FtpTransport::new(Duration::from_secs(5))
            .open(&uri, Some(ByteRange { lo: 0, hi: 10 }))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Transport(TransportError::RangeNotSupported { .. })
        ));
    }
}
