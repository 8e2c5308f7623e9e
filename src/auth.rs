//! IPC bearer-token handling
//!
//! A single process-wide token gates every loopback endpoint. Resolution
//! order: the `THROTTLE_IPC_TOKEN` environment variable, then the `.env`
//! file the system manager wrote on a previous run, then a freshly
//! generated token persisted to that file.

use crate::error::{Error, Result};
use rand::RngCore;
use std::path::Path;
use subtle::ConstantTimeEq;

/// Environment variable carrying the shared bearer token
pub const TOKEN_ENV_VAR: &str = "THROTTLE_IPC_TOKEN";

/// Process-wide IPC bearer token
#[derive(Clone)]
pub struct ControlToken(String);

impl ControlToken {
    /// Wrap an explicit token value
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Resolve the token: environment, then `token_file`, then generate and
    /// persist a new one.
    pub fn load_or_generate(token_file: &Path) -> Result<Self> {
        if let Ok(tok) = std::env::var(TOKEN_ENV_VAR) {
            if !tok.is_empty() {
                return Ok(Self(tok));
            }
        }
        if let Some(tok) = Self::read_token_file(token_file)? {
            return Ok(Self(tok));
        }
        let tok = Self::generate();
        std::fs::write(token_file, format!("{TOKEN_ENV_VAR}={}\n", tok.0))?;
        tracing::info!(path = %token_file.display(), "Generated new IPC token");
        Ok(tok)
    }

    /// Generate a fresh random token (32 bytes, hex-encoded)
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    fn read_token_file(path: &Path) -> Result<Option<String>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        for line in content.lines() {
            if let Some(value) = line.trim().strip_prefix(&format!("{TOKEN_ENV_VAR}=")) {
                if !value.is_empty() {
                    return Ok(Some(value.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Constant-time comparison against a presented token.
    pub fn matches(&self, presented: &str) -> bool {
        // Length leaks are unavoidable with unequal-length inputs; compare
        // the digests-of-equal-length path in constant time.
        if self.0.len() != presented.len() {
            return false;
        }
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Verify a presented token, mapping a mismatch to [`Error::Auth`].
    pub fn verify(&self, presented: Option<&str>) -> Result<()> {
        match presented {
            Some(p) if self.matches(p) => Ok(()),
            _ => Err(Error::Auth),
        }
    }

    /// The raw token value, for embedding in outbound requests.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ControlToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the token value
        f.write_str("ControlToken(..)")
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_hex_and_unique() {
        let a = ControlToken::generate();
        let b = ControlToken::generate();
        assert_eq!(a.expose().len(), 64);
        assert!(a.expose().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn test_matches() {
        let t = ControlToken::new("secret");
        assert!(t.matches("secret"));
        assert!(!t.matches("Secret"));
        assert!(!t.matches("secret2"));
        assert!(!t.matches(""));
    }

    #[test]
    fn test_verify_maps_to_auth_error() {
        let t = ControlToken::new("secret");
        assert!(t.verify(Some("secret")).is_ok());
        assert!(matches!(t.verify(Some("wrong")), Err(Error::Auth)));
        assert!(matches!(t.verify(None), Err(Error::Auth)));
    }

    #[test]
    fn test_load_reads_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "THROTTLE_IPC_TOKEN=abc123\n").unwrap();
        let tok = ControlToken::read_token_file(&path).unwrap();
        assert_eq!(tok.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_generate_persists_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        // Not using load_or_generate directly: the env var may be set in the
        // test environment. Exercise the generate-and-persist path by hand.
        let tok = ControlToken::generate();
        std::fs::write(&path, format!("THROTTLE_IPC_TOKEN={}\n", tok.expose())).unwrap();
        let reread = ControlToken::read_token_file(&path).unwrap().unwrap();
        assert_eq!(reread, tok.expose());
    }

    #[test]
    fn test_debug_does_not_leak() {
        let t = ControlToken::new("supersecret");
        assert!(!format!("{t:?}").contains("supersecret"));
    }
}
