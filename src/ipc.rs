//! Loopback IPC framing and helpers
//!
//! The control fabric speaks one JSON object per TCP connection: the client
//! connects, sends a single request of at most 64 KiB, reads a single reply,
//! and the connection closes. Every request carries the bearer token; every
//! listener binds strictly to 127.0.0.1.

use crate::auth::ControlToken;
use crate::config::IpcConfig;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// A single framed request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Bearer token; checked before anything else
    pub token: String,
    /// Event name (arbiter protocol) — `DOWNLOAD_EVENT`, `GUI`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Command name (pool protocol) — `ADD_DOWNLOAD`, `PAUSE`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command- or event-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Flat payload fields (the takeover protocol puts `url`, `file_path`
    /// and `pid` next to the token rather than under `data`)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Request {
    /// Build an event-style request
    pub fn event(token: &ControlToken, event: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            token: token.expose().to_string(),
            event: Some(event.to_string()),
            command: None,
            data,
            extra: Default::default(),
        }
    }

    /// Build a command-style request
    pub fn command(token: &ControlToken, command: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            token: token.expose().to_string(),
            event: None,
            command: Some(command.to_string()),
            data,
            extra: Default::default(),
        }
    }

    /// Build a flat request (no verb; payload fields sit next to the
    /// token, as the takeover protocol expects).
    pub fn flat(token: &ControlToken) -> Self {
        Self {
            token: token.expose().to_string(),
            event: None,
            command: None,
            data: None,
            extra: Default::default(),
        }
    }

    /// Attach a flat payload field.
    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// The event or command name, whichever is present
    pub fn verb(&self) -> Option<&str> {
        self.event.as_deref().or(self.command.as_deref())
    }
}

/// A single framed reply
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Request accepted, no payload
    Ok,
    /// Token missing or mismatched; no side effects occurred
    AuthError,
    /// Verb not recognized by this endpoint
    UnknownCommand,
    /// Request failed with a message
    Error(String),
    /// Structured payload (STATUS-class calls)
    Json(serde_json::Value),
}

impl Reply {
    /// Serialize the wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Reply::Ok => b"OK".to_vec(),
            Reply::AuthError => b"AUTH_ERROR".to_vec(),
            Reply::UnknownCommand => b"UNKNOWN_COMMAND".to_vec(),
            Reply::Error(msg) => {
                serde_json::to_vec(&serde_json::json!({"error": msg})).unwrap_or_default()
            }
            Reply::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
        }
    }

    /// Parse a wire reply
    pub fn from_bytes(raw: &[u8]) -> Self {
        match raw {
            b"OK" => Reply::Ok,
            b"AUTH_ERROR" => Reply::AuthError,
            b"UNKNOWN_COMMAND" => Reply::UnknownCommand,
            other => match serde_json::from_slice::<serde_json::Value>(other) {
                Ok(v) => {
                    if let Some(msg) = v.get("error").and_then(|e| e.as_str()) {
                        Reply::Error(msg.to_string())
                    } else {
                        Reply::Json(v)
                    }
                }
                Err(_) => Reply::Error(String::from_utf8_lossy(other).into_owned()),
            },
        }
    }
}

impl From<&Error> for Reply {
    fn from(e: &Error) -> Self {
        match e {
            Error::Auth => Reply::AuthError,
            other => Reply::Error(format!("{} ({})", other, other.code())),
        }
    }
}

/// Bind a loopback listener on `port`.
///
/// Failure to bind is fatal for the calling role: the error maps to
/// [`Error::Resource`] and the supervisor handles the respawn.
pub async fn bind_loopback(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Resource(format!("failed to bind 127.0.0.1:{port}: {e}")))
}

/// Read one bounded request frame from an accepted connection.
///
/// Reads until EOF or `max_payload` bytes, then parses the JSON object.
pub async fn read_request(stream: &mut TcpStream, max_payload: usize) -> Result<Request> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buf.len() + n > max_payload {
            return Err(Error::InvalidInput(format!(
                "request exceeds {max_payload} byte limit"
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
        // One JSON object per connection: stop as soon as the buffer parses.
        if serde_json::from_slice::<Request>(&buf).is_ok() {
            break;
        }
    }
    if buf.is_empty() {
        return Err(Error::InvalidInput("empty request".to_string()));
    }
    Ok(serde_json::from_slice(&buf)?)
}

/// Write a reply and shut the write side down.
pub async fn write_reply(stream: &mut TcpStream, reply: &Reply) -> Result<()> {
    stream.write_all(&reply.to_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Per-connection handler signature for [`serve`]
pub type Handler = std::sync::Arc<
    dyn Fn(Request) -> futures::future::BoxFuture<'static, Reply> + Send + Sync + 'static,
>;

/// Accept-loop for a token-gated endpoint.
///
/// Authentication happens here: the handler only ever sees requests whose
/// token matched. Per-connection errors are logged and the loop continues —
/// a listener never dies because of a client.
pub async fn serve(
    listener: TcpListener,
    token: ControlToken,
    max_payload: usize,
    handler: Handler,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = cancel.cancelled() => break,
        };
        let (mut stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "Socket accept error");
                continue;
            }
        };
        let token = token.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let reply = match read_request(&mut stream, max_payload).await {
                Ok(req) => {
                    if token.verify(Some(&req.token)).is_err() {
                        tracing::warn!(peer = %peer, "IPC authentication failed");
                        Reply::AuthError
                    } else {
                        handler(req).await
                    }
                }
                Err(e) => {
                    tracing::error!(peer = %peer, error = %e, "Malformed IPC request");
                    Reply::from(&e)
                }
            };
            if let Err(e) = write_reply(&mut stream, &reply).await {
                tracing::debug!(peer = %peer, error = %e, "Failed to write IPC reply");
            }
        });
    }
}

/// Send one request to a loopback endpoint and return the parsed reply.
pub async fn send_request(config: &IpcConfig, port: u16, request: &Request) -> Result<Reply> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let fut = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&serde_json::to_vec(request)?).await?;
        stream.shutdown().await?;
        let mut buf = Vec::new();
        stream
            .take(config.max_payload as u64)
            .read_to_end(&mut buf)
            .await?;
        Ok::<Reply, Error>(Reply::from_bytes(&buf))
    };
    tokio::time::timeout(config.client_timeout, fut)
        .await
        .map_err(|_| Error::Timeout(config.client_timeout, format!("IPC request to port {port}")))?
}

/// Send a request and decode a JSON reply into `T`.
pub async fn query<T: DeserializeOwned>(
    config: &IpcConfig,
    port: u16,
    request: &Request,
) -> Result<T> {
    match send_request(config, port, request).await? {
        Reply::Json(v) => Ok(serde_json::from_value(v)?),
        Reply::AuthError => Err(Error::Auth),
        Reply::Error(msg) => Err(Error::Other(msg)),
        other => Err(Error::Other(format!("unexpected reply: {other:?}"))),
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn test_token() -> ControlToken {
        ControlToken::new("test-token")
    }

    #[test]
    fn test_reply_wire_forms() {
        assert_eq!(Reply::Ok.to_bytes(), b"OK");
        assert_eq!(Reply::AuthError.to_bytes(), b"AUTH_ERROR");
        assert_eq!(Reply::from_bytes(b"OK"), Reply::Ok);
        assert_eq!(Reply::from_bytes(b"AUTH_ERROR"), Reply::AuthError);
        assert_eq!(Reply::from_bytes(b"UNKNOWN_COMMAND"), Reply::UnknownCommand);
        let json = Reply::from_bytes(br#"{"bandwidth": 100}"#);
        assert!(matches!(json, Reply::Json(_)));
        let err = Reply::from_bytes(br#"{"error": "boom"}"#);
        assert_eq!(err, Reply::Error("boom".to_string()));
    }

    #[test]
    fn test_request_verb() {
        let t = test_token();
        assert_eq!(Request::event(&t, "GUI", None).verb(), Some("GUI"));
        assert_eq!(Request::command(&t, "PAUSE", None).verb(), Some("PAUSE"));
    }

    #[tokio::test]
    async fn test_round_trip_over_ephemeral_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let handler: Handler = std::sync::Arc::new(|req: Request| {
            Box::pin(async move {
                match req.verb() {
                    Some("PING") => Reply::Json(serde_json::json!({"pong": true})),
                    _ => Reply::UnknownCommand,
                }
            })
        });
        let server = tokio::spawn(serve(
            listener,
            test_token(),
            65536,
            handler,
            cancel.clone(),
        ));

        let config = IpcConfig::default();
        let req = Request::command(&test_token(), "PING", None);
        let reply = send_request(&config, port, &req).await.unwrap();
        assert_eq!(
            reply,
            Reply::Json(serde_json::json!({"pong": true})),
            "authenticated request should reach the handler"
        );

        let bad = Request::command(&ControlToken::new("wrong"), "PING", None);
        let reply = send_request(&config, port, &bad).await.unwrap();
        assert_eq!(
            reply,
            Reply::AuthError,
            "wrong token must never reach the handler"
        );

        let unknown = Request::command(&test_token(), "NOPE", None);
        let reply = send_request(&config, port, &unknown).await.unwrap();
        assert_eq!(reply, Reply::UnknownCommand);

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let handler: Handler =
            std::sync::Arc::new(|_req: Request| Box::pin(async move { Reply::Ok }));
        tokio::spawn(serve(listener, test_token(), 128, handler, cancel.clone()));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let huge = serde_json::to_vec(&Request::event(
            &test_token(),
            &"X".repeat(4096),
            None,
        ))
        .unwrap();
        stream.write_all(&huge).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let reply = Reply::from_bytes(&buf);
        assert!(
            matches!(reply, Reply::Error(_)),
            "oversized payload should produce an error reply, got {reply:?}"
        );
        cancel.cancel();
    }
}
