//! `data:` transport — in-memory decode before hand-off to the writer

use super::{ByteRange, ByteStream, ProbeInfo, Transport};
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use url::Url;

/// Adapter decoding `data:[<mediatype>][;base64],<data>` URIs
#[derive(Default)]
pub struct DataUrlTransport;

impl DataUrlTransport {
    /// New adapter
    pub fn new() -> Self {
        Self
    }

    /// Decode the payload of a data URI.
    pub fn decode(uri: &Url) -> Result<Bytes> {
        // Url keeps everything after `data:` in the path portion.
        let raw = uri.path();
        let (header, payload) = raw
            .split_once(',')
            .ok_or_else(|| TransportError::InvalidUri(format!("data URI without comma: {uri}")))?;
        if header.ends_with(";base64") {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|e| TransportError::InvalidUri(format!("bad base64 payload: {e}")))?;
            Ok(Bytes::from(decoded))
        } else {
            let decoded = urlencoding::decode_binary(payload.as_bytes()).into_owned();
            Ok(Bytes::from(decoded))
        }
    }
}

#[async_trait]
impl Transport for DataUrlTransport {
    async fn probe(&self, uri: &Url) -> Result<ProbeInfo> {
        let decoded = Self::decode(uri)?;
        Ok(ProbeInfo {
            total_bytes: Some(decoded.len() as u64),
            supports_range: false,
            etag: None,
        })
    }

    async fn open(&self, uri: &Url, range: Option<ByteRange>) -> Result<ByteStream> {
        let decoded = Self::decode(uri)?;
        let chunk = match range {
            Some(r) => decoded.slice(r.lo as usize..=(r.hi as usize).min(decoded.len() - 1)),
            None => decoded,
        };
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_decode_base64() {
        let uri = Url::parse("data:application/octet-stream;base64,aGVsbG8=").unwrap();
        assert_eq!(&DataUrlTransport::decode(&uri).unwrap()[..], b"hello");
    }

    #[test]
    fn test_decode_percent_encoded() {
        let uri = Url::parse("data:text/plain,Hello%20World").unwrap();
        assert_eq!(&DataUrlTransport::decode(&uri).unwrap()[..], b"Hello World");
    }

    #[test]
    fn test_decode_missing_comma() {
        let uri = Url::parse("data:text/plain").unwrap();
        assert!(DataUrlTransport::decode(&uri).is_err());
    }

    #[tokio::test]
    async fn test_probe_reports_decoded_length() {
        let uri = Url::parse("data:;base64,aGVsbG8=").unwrap();
        let info = DataUrlTransport::new().probe(&uri).await.unwrap();
        assert_eq!(info.total_bytes, Some(5));
        assert!(!info.supports_range);
    }

    #[tokio::test]
    async fn test_open_yields_payload() {
        let uri = Url::parse("data:text/plain,payload").unwrap();
        let mut stream = DataUrlTransport::new().open(&uri, None).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"payload");
        assert!(stream.next().await.is_none());
    }
}
