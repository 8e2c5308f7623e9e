//! `file:` transport — local-path copies through the common adapter contract

use super::{ByteRange, ByteStream, ProbeInfo, Transport};
use crate::error::{Error, Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use url::Url;

/// Read chunk size for local sources
const READ_CHUNK: usize = 1024 * 1024;

/// Adapter serving `file://` URIs from the local filesystem
#[derive(Default)]
pub struct FileTransport;

impl FileTransport {
    /// New adapter
    pub fn new() -> Self {
        Self
    }

    fn resolve(uri: &Url) -> Result<PathBuf> {
        uri.to_file_path()
            .map_err(|_| TransportError::InvalidUri(format!("not a file path: {uri}")).into())
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn probe(&self, uri: &Url) -> Result<ProbeInfo> {
        let path = Self::resolve(uri)?;
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(Error::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(ProbeInfo {
            total_bytes: Some(meta.len()),
            supports_range: true,
            etag: None,
        })
    }

    async fn open(&self, uri: &Url, range: Option<ByteRange>) -> Result<ByteStream> {
        let path = Self::resolve(uri)?;
        let mut file = tokio::fs::File::open(&path).await?;
        let remaining = match range {
            Some(r) => {
                file.seek(std::io::SeekFrom::Start(r.lo)).await?;
                r.len()
            }
            None => file.metadata().await?.len(),
        };

        let stream = futures::stream::try_unfold(
            (file, remaining),
            |(mut file, remaining)| async move {
                if remaining == 0 {
                    return Ok(None);
                }
                let want = (READ_CHUNK as u64).min(remaining) as usize;
                let mut buf = vec![0u8; want];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some((Bytes::from(buf), (file, remaining - n as u64))))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn fetch_range(&self, uri: &Url, lo: u64, hi: u64) -> Result<Bytes> {
        let path = Self::resolve(uri)?;
        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(std::io::SeekFrom::Start(lo)).await?;
        let len = (hi - lo + 1) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn file_url(path: &std::path::Path) -> Url {
        Url::from_file_path(path).unwrap()
    }

    #[tokio::test]
    async fn test_probe_reports_len_and_range_support() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        tokio::fs::write(&path, vec![9u8; 4096]).await.unwrap();

        let info = FileTransport::new().probe(&file_url(&path)).await.unwrap();
        assert_eq!(info.total_bytes, Some(4096));
        assert!(info.supports_range);
    }

    #[tokio::test]
    async fn test_open_full_and_ranged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        let data: Vec<u8> = (0..=255u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let t = FileTransport::new();
        let mut full = Vec::new();
        let mut stream = t.open(&file_url(&path), None).await.unwrap();
        while let Some(chunk) = stream.next().await {
            full.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(full, data);

        let mut stream = t
            .open(&file_url(&path), Some(ByteRange { lo: 10, hi: 19 }))
            .await
            .unwrap();
        let mut ranged = Vec::new();
        while let Some(chunk) = stream.next().await {
            ranged.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(ranged, (10..=19u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_fetch_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        tokio::fs::write(&path, (0..100u8).collect::<Vec<_>>())
            .await
            .unwrap();

        let bytes = FileTransport::new()
            .fetch_range(&file_url(&path), 50, 59)
            .await
            .unwrap();
        assert_eq!(&bytes[..], &(50..60u8).collect::<Vec<_>>()[..]);
    }

    #[tokio::test]
    async fn test_probe_missing_file() {
        let err = FileTransport::new()
            .probe(&Url::parse("file:///does/not/exist.bin").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
