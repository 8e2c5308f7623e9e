//! System manager — credential provisioning, TLS diagnostics, workflow
//! order enforcement.
//!
//! On first run it generates a self-signed certificate (CN=localhost, SAN
//! DNS localhost, ten-year validity) under `certs/` and the IPC bearer
//! token in `.env`. It serves an authenticated TLS `status` endpoint
//! mapping role → running, and watches the arbiter: while the arbiter is
//! down, dependent roles are told to `PAUSE`; when it returns, `RESUME`.

use super::RoleStates;
use crate::auth::ControlToken;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ipc::{self, Reply, Request};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Workflow-order check interval
const WORKFLOW_INTERVAL: Duration = Duration::from_secs(3);

/// Certificate file name under the cert dir
pub const CERT_FILE: &str = "system_manager.pem";
/// Private-key file name under the cert dir
pub const KEY_FILE: &str = "system_manager.key";

/// Paths of the certificate and key
pub fn cert_paths(cert_dir: &Path) -> (PathBuf, PathBuf) {
    (cert_dir.join(CERT_FILE), cert_dir.join(KEY_FILE))
}

/// Generate the self-signed certificate and key on first run.
pub fn ensure_certificates(cert_dir: &Path) -> Result<()> {
    let (cert_path, key_path) = cert_paths(cert_dir);
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(cert_dir)?;
    tracing::info!("Generating self-signed certificate for encrypted communication");

    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| Error::Resource(format!("certificate params: {e}")))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CountryName, "US");
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, "throttle-dl");
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "localhost");
    let year = chrono::Datelike::year(&chrono::Utc::now());
    params.not_before = rcgen::date_time_ymd(year, 1, 1);
    params.not_after = rcgen::date_time_ymd(year + 10, 1, 1);
    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| Error::Resource(format!("key generation: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Resource(format!("certificate signing: {e}")))?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;
    tracing::info!(cert = %cert_path.display(), "Certificate and key generated");
    Ok(())
}

fn tls_acceptor(cert_dir: &Path) -> Result<TlsAcceptor> {
    let (cert_path, key_path) = cert_paths(cert_dir);
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
        &cert_path,
    )?))
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::Resource(format!("bad certificate file: {e}")))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        &key_path,
    )?))
    .map_err(|e| Error::Resource(format!("bad key file: {e}")))?
    .ok_or_else(|| Error::Resource("no private key in key file".to_string()))?;
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Resource(format!("TLS config: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// The system-manager role: TLS diagnostics plus workflow enforcement.
pub struct SystemManager {
    config: Arc<Config>,
    token: ControlToken,
    roles: RoleStates,
}

impl SystemManager {
    /// Build the role. Credentials must already be provisioned (the mesh
    /// entry point calls [`ensure_certificates`] and token setup first).
    pub fn new(config: Arc<Config>, token: ControlToken, roles: RoleStates) -> Self {
        Self {
            config,
            token,
            roles,
        }
    }

    /// Run the TLS listener and the workflow monitor until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        ensure_certificates(&self.config.supervisor.cert_dir)?;
        let acceptor = tls_acceptor(&self.config.supervisor.cert_dir)?;
        let listener = ipc::bind_loopback(self.config.ipc.tls_port).await?;
        tracing::info!(
            port = self.config.ipc.tls_port,
            "System manager TLS server listening"
        );

        let workflow = self.workflow_monitor(cancel.clone());
        let listen = self.serve_tls(listener, acceptor, cancel.clone());
        tokio::join!(workflow, listen);
        Ok(())
    }

    async fn serve_tls(
        &self,
        listener: tokio::net::TcpListener,
        acceptor: TlsAcceptor,
        cancel: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = cancel.cancelled() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "TLS accept error");
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let token = self.token.clone();
            let roles = self.roles.clone();
            let max_payload = self.config.ipc.max_payload;
            tokio::spawn(async move {
                let mut tls = match acceptor.accept(stream).await {
                    Ok(tls) => tls,
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                        return;
                    }
                };
                let mut buf = Vec::with_capacity(1024);
                let mut chunk = [0u8; 1024];
                let reply = loop {
                    match tls.read(&mut chunk).await {
                        Ok(0) => {
                            break respond(&buf, &token, &roles);
                        }
                        Ok(n) => {
                            if buf.len() + n > max_payload {
                                break Reply::Error("request too large".to_string());
                            }
                            buf.extend_from_slice(&chunk[..n]);
                            if serde_json::from_slice::<Request>(&buf).is_ok() {
                                break respond(&buf, &token, &roles);
                            }
                        }
                        Err(e) => {
                            tracing::debug!(peer = %peer, error = %e, "TLS read failed");
                            return;
                        }
                    }
                };
                tls.write_all(&reply.to_bytes()).await.ok();
                tls.shutdown().await.ok();
            });
        }
    }

    /// Enforce workflow order: arbiter down ⇒ dependents pause, arbiter
    /// back ⇒ dependents resume. Only transitions are acted on.
    async fn workflow_monitor(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(WORKFLOW_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut arbiter_was_up = true;
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = cancel.cancelled() => break,
            }
            heartbeat_tick(&self.config).await;
            let arbiter_up = self.roles.is_running("arbiter");
            if arbiter_up == arbiter_was_up {
                continue;
            }
            arbiter_was_up = arbiter_up;
            let command = if arbiter_up { "RESUME" } else { "PAUSE" };
            tracing::warn!(
                arbiter_up,
                command,
                "Arbiter availability changed, instructing dependents"
            );
            let req = Request::command(&self.token, command, None);
            if let Err(e) =
                ipc::send_request(&self.config.ipc, self.config.ipc.pool_port, &req).await
            {
                tracing::error!(error = %e, "Failed to send {command} to pool");
            }
        }
    }
}

async fn heartbeat_tick(config: &Config) {
    super::heartbeat::write(&config.supervisor.heartbeat_dir, "system-manager").await;
}

fn respond(raw: &[u8], token: &ControlToken, roles: &RoleStates) -> Reply {
    let req: Request = match serde_json::from_slice(raw) {
        Ok(req) => req,
        Err(_) => return Reply::Error("malformed request".to_string()),
    };
    if token.verify(Some(&req.token)).is_err() {
        return Reply::AuthError;
    }
    match req.verb() {
        Some("status") => Reply::Json(serde_json::json!(roles.all())),
        _ => Reply::UnknownCommand,
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_certificates_creates_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cert_dir = dir.path().join("certs");
        ensure_certificates(&cert_dir).unwrap();

        let (cert_path, key_path) = cert_paths(&cert_dir);
        let cert_pem = std::fs::read_to_string(&cert_path).unwrap();
        let key_pem = std::fs::read_to_string(&key_path).unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("PRIVATE KEY"));

        // Second run keeps the existing material
        ensure_certificates(&cert_dir).unwrap();
        assert_eq!(std::fs::read_to_string(&cert_path).unwrap(), cert_pem);
    }

    #[test]
    fn test_tls_acceptor_loads_generated_material() {
        let dir = tempfile::tempdir().unwrap();
        let cert_dir = dir.path().join("certs");
        ensure_certificates(&cert_dir).unwrap();
        assert!(tls_acceptor(&cert_dir).is_ok());
    }

    #[test]
    fn test_respond_requires_token() {
        let token = ControlToken::new("good");
        let roles = RoleStates::new();
        roles.set_running("arbiter", true);

        let bad = serde_json::to_vec(&Request::command(
            &ControlToken::new("bad"),
            "status",
            None,
        ))
        .unwrap();
        assert_eq!(respond(&bad, &token, &roles), Reply::AuthError);

        let good = serde_json::to_vec(&Request::command(&token, "status", None)).unwrap();
        let Reply::Json(v) = respond(&good, &token, &roles) else {
            panic!("expected JSON status");
        };
        assert_eq!(v["arbiter"], true);
    }

    #[test]
    fn test_respond_unknown_command() {
        let token = ControlToken::new("t");
        let roles = RoleStates::new();
        let raw = serde_json::to_vec(&Request::command(&token, "reboot", None)).unwrap();
        assert_eq!(respond(&raw, &token, &roles), Reply::UnknownCommand);
    }
}
