//! Post-download integrity hook
//!
//! The scanner contract mirrors how the platform's native tools behave: a
//! signature check first, and a threat scan only for unsigned artifacts. A
//! download fails the hook **iff** the signature check completes negative
//! *and* the scan reports a threat. Hook-infrastructure failures (missing
//! binaries, timeouts) are logged and never fail a download.

use crate::config::ScannerConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;

/// What a scanner implementation can do
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScannerCapabilities {
    /// Can determine whether an artifact carries a valid signature
    pub can_check_signature: bool,
    /// Can scan an artifact for threats
    pub can_scan: bool,
}

/// Outcome of a threat scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanVerdict {
    /// No threats reported
    Clean,
    /// A threat was reported
    Threat(String),
}

/// Pluggable signature-check + threat-scan provider.
#[async_trait]
pub trait ArtifactScanner: Send + Sync {
    /// Implementation name for logging
    fn name(&self) -> &str;

    /// Advertised capabilities
    fn capabilities(&self) -> ScannerCapabilities;

    /// Whether the artifact carries a valid signature
    async fn is_signed(&self, path: &Path) -> Result<bool>;

    /// Scan the artifact for threats
    async fn scan(&self, path: &Path) -> Result<ScanVerdict>;
}

/// Scanner that shells out to configured commands.
///
/// The signature command is considered positive when its stdout contains
/// `Valid`; the scan command is considered clean when its stdout contains
/// `No threats`.
pub struct CommandScanner {
    config: ScannerConfig,
}

impl CommandScanner {
    /// Scanner over the configured commands.
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    async fn run_command(
        argv: &[String],
        path: &Path,
        timeout: std::time::Duration,
    ) -> Result<String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty scanner command".to_string()))?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout(timeout, format!("scanner command {program}")))??;
        if !output.status.success() {
            return Err(Error::Other(format!(
                "scanner command {program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ArtifactScanner for CommandScanner {
    fn name(&self) -> &str {
        "command"
    }

    fn capabilities(&self) -> ScannerCapabilities {
        ScannerCapabilities {
            can_check_signature: self.config.signature_command.is_some(),
            can_scan: self.config.scan_command.is_some(),
        }
    }

    async fn is_signed(&self, path: &Path) -> Result<bool> {
        let argv = self
            .config
            .signature_command
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("no signature command configured".to_string()))?;
        let stdout = Self::run_command(argv, path, self.config.signature_timeout).await?;
        Ok(stdout.contains("Valid"))
    }

    async fn scan(&self, path: &Path) -> Result<ScanVerdict> {
        let argv = self
            .config
            .scan_command
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("no scan command configured".to_string()))?;
        let stdout = Self::run_command(argv, path, self.config.scan_timeout).await?;
        if stdout.contains("No threats") {
            Ok(ScanVerdict::Clean)
        } else if stdout.to_lowercase().contains("threat") || stdout.to_lowercase().contains("detected")
        {
            Ok(ScanVerdict::Threat(stdout.trim().to_string()))
        } else {
            tracing::warn!(path = %path.display(), "Unexpected scanner output, treating as threat");
            Ok(ScanVerdict::Threat(stdout.trim().to_string()))
        }
    }
}

/// Scanner with no capabilities; the hook becomes a no-op.
pub struct NoOpScanner;

#[async_trait]
impl ArtifactScanner for NoOpScanner {
    fn name(&self) -> &str {
        "noop"
    }

    fn capabilities(&self) -> ScannerCapabilities {
        ScannerCapabilities::default()
    }

    async fn is_signed(&self, _path: &Path) -> Result<bool> {
        Err(Error::InvalidInput("no scanner available".to_string()))
    }

    async fn scan(&self, _path: &Path) -> Result<ScanVerdict> {
        Err(Error::InvalidInput("no scanner available".to_string()))
    }
}

/// Build the scanner the configuration asks for.
pub fn scanner_from_config(config: &ScannerConfig) -> std::sync::Arc<dyn ArtifactScanner> {
    if config.signature_command.is_some() || config.scan_command.is_some() {
        std::sync::Arc::new(CommandScanner::new(config.clone()))
    } else {
        std::sync::Arc::new(NoOpScanner)
    }
}

/// Apply the hook policy to a finished artifact.
///
/// Returns `Err(Error::Integrity)` only when the artifact is determinably
/// unsigned and a scan reports a threat. Every infrastructure failure along
/// the way downgrades to a warning.
pub async fn scan_if_unsigned(scanner: &dyn ArtifactScanner, path: &Path) -> Result<()> {
    let caps = scanner.capabilities();
    if !caps.can_check_signature || !caps.can_scan {
        tracing::debug!(scanner = scanner.name(), "Scanner hook unavailable, skipping");
        return Ok(());
    }
    let signed = match scanner.is_signed(path).await {
        Ok(signed) => signed,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Signature check failed, skipping scan");
            return Ok(());
        }
    };
    if signed {
        tracing::debug!(path = %path.display(), "Artifact is signed, skipping scan");
        return Ok(());
    }
    match scanner.scan(path).await {
        Ok(ScanVerdict::Clean) => {
            tracing::info!(path = %path.display(), "Artifact scanned clean");
            Ok(())
        }
        Ok(ScanVerdict::Threat(reason)) => Err(Error::Integrity {
            path: path.to_path_buf(),
            reason,
        }),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Threat scan failed, not failing the download");
            Ok(())
        }
    }
}
