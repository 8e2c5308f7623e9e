//! HTTP/HTTPS transport
//!
//! Probes with a HEAD request (Content-Length, Accept-Ranges, ETag), streams
//! bodies via `bytes_stream()`, and serves range fetches with `Range`
//! headers. A second, plainly configured client backs the engine's one
//! fallback retry per range.

use super::{ByteRange, ByteStream, ProbeInfo, Transport};
use crate::error::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::time::Duration;
use url::Url;

/// HTTP(S) adapter backed by a pooled `reqwest` client
pub struct HttpTransport {
    client: reqwest::Client,
    fallback: reqwest::Client,
}

impl HttpTransport {
    /// Adapter with the given per-request timeout on both clients.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        // Deliberately bare: no pooling tweaks, nothing shared with the
        // primary client, so a fallback attempt is a genuinely fresh path.
        let fallback = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_default();
        Self { client, fallback }
    }

    /// Fetch a byte range with the fallback client. Used by the engine for
    /// its single retry before declaring a range dead.
    pub async fn fetch_range_fallback(&self, uri: &Url, lo: u64, hi: u64) -> Result<Bytes> {
        self.range_request(&self.fallback, uri, lo, hi).await
    }

    async fn range_request(
        &self,
        client: &reqwest::Client,
        uri: &Url,
        lo: u64,
        hi: u64,
    ) -> Result<Bytes> {
        let resp = client
            .get(uri.clone())
            .header(reqwest::header::RANGE, format!("bytes={lo}-{hi}"))
            .send()
            .await
            .map_err(TransportError::Http)?;
        let resp = check_status(resp, uri)?;
        Ok(resp.bytes().await.map_err(TransportError::Http)?)
    }
}

fn check_status(resp: reqwest::Response, uri: &Url) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(TransportError::HttpStatus {
            status: status.as_u16(),
            url: uri.to_string(),
        }
        .into())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, uri: &Url) -> Result<ProbeInfo> {
        let resp = self
            .client
            .head(uri.clone())
            .send()
            .await
            .map_err(TransportError::Http)?;
        let resp = check_status(resp, uri)?;
        let headers = resp.headers();

        let total_bytes = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&len| len > 0);
        let supports_range = headers
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        let etag = headers
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        Ok(ProbeInfo {
            total_bytes,
            supports_range,
            etag,
        })
    }

    async fn open(&self, uri: &Url, range: Option<ByteRange>) -> Result<ByteStream> {
        let mut req = self.client.get(uri.clone());
        if let Some(r) = range {
            req = req.header(reqwest::header::RANGE, format!("bytes={}-{}", r.lo, r.hi));
        }
        let resp = req.send().await.map_err(TransportError::Http)?;
        let resp = check_status(resp, uri)?;
        let stream = resp
            .bytes_stream()
            .map_err(|e| crate::error::Error::Transport(TransportError::Http(e)));
        Ok(Box::pin(stream))
    }

    async fn fetch_range(&self, uri: &Url, lo: u64, hi: u64) -> Result<Bytes> {
        self.range_request(&self.client, uri, lo, hi).await
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_probe_reads_headers() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "1048576")
                    .insert_header("accept-ranges", "bytes")
                    .insert_header("etag", "\"abc123\""),
            )
            .mount(&server)
            .await;

        let uri = Url::parse(&format!("{}/file.bin", server.uri())).unwrap();
        let info = transport().probe(&uri).await.unwrap();
        assert_eq!(info.total_bytes, Some(1_048_576));
        assert!(info.supports_range);
        assert_eq!(info.etag.as_deref(), Some("\"abc123\""));
    }

    #[tokio::test]
    async fn test_probe_without_range_support() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/dynamic"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let uri = Url::parse(&format!("{}/dynamic", server.uri())).unwrap();
        let info = transport().probe(&uri).await.unwrap();
        assert_eq!(info.total_bytes, None);
        assert!(!info.supports_range);
    }

    #[tokio::test]
    async fn test_open_streams_body() {
        let server = MockServer::start().await;
        let body = vec![42u8; 10_000];
        Mock::given(method("GET"))
            .and(path("/payload"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let uri = Url::parse(&format!("{}/payload", server.uri())).unwrap();
        let mut stream = transport().open(&uri, None).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, body);
    }

    #[tokio::test]
    async fn test_fetch_range_sends_range_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ranged"))
            .and(header("range", "bytes=100-199"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![1u8; 100]))
            .mount(&server)
            .await;

        let uri = Url::parse(&format!("{}/ranged", server.uri())).unwrap();
        let bytes = transport().fetch_range(&uri, 100, 199).await.unwrap();
        assert_eq!(bytes.len(), 100);
    }

    #[tokio::test]
    async fn test_error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let uri = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let err = transport().probe(&uri).await.unwrap_err();
        assert!(
            matches!(
                err,
                crate::error::Error::Transport(TransportError::HttpStatus { status: 404, .. })
            ),
            "got {err:?}"
        );
    }
}
