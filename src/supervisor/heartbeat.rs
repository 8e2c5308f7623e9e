//! Role heartbeat files
//!
//! Every role writes `<role>.heartbeat` containing a decimal unix time on
//! its heartbeat interval; the watchdog reads file ages to decide on
//! restarts. Writes are best-effort — a full disk must not kill a role.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Heartbeat file path for a role
pub fn path(dir: &Path, role: &str) -> PathBuf {
    dir.join(format!("{role}.heartbeat"))
}

/// Write the current unix time into the role's heartbeat file.
pub async fn write(dir: &Path, role: &str) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    if let Err(e) = tokio::fs::write(path(dir, role), format!("{now}")).await {
        tracing::warn!(role, error = %e, "Failed to update heartbeat file");
    }
}

/// Age of a role's last heartbeat. `None` when the file is missing or
/// unreadable.
pub async fn age(dir: &Path, role: &str) -> Option<Duration> {
    let content = tokio::fs::read_to_string(path(dir, role)).await.ok()?;
    let beat: f64 = content.trim().parse().ok()?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_secs_f64();
    Some(Duration::from_secs_f64((now - beat).max(0.0)))
}

/// Spawn a task writing the role's heartbeat every `interval` until
/// cancelled.
pub fn spawn(
    dir: PathBuf,
    role: &'static str,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => write(&dir, role).await,
                _ = cancel.cancelled() => break,
            }
        }
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_age_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "arbiter").await;
        let age = age(dir.path(), "arbiter").await.unwrap();
        assert!(age < Duration::from_secs(2), "fresh heartbeat, got {age:?}");
    }

    #[tokio::test]
    async fn test_age_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(age(dir.path(), "ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_age_unreadable_content() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(path(dir.path(), "broken"), "not-a-number")
            .await
            .unwrap();
        assert!(age(dir.path(), "broken").await.is_none());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_age() {
        let dir = tempfile::tempdir().unwrap();
        let old = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
            - 30.0;
        tokio::fs::write(path(dir.path(), "stale"), format!("{old}"))
            .await
            .unwrap();
        let age = age(dir.path(), "stale").await.unwrap();
        assert!(age >= Duration::from_secs(29));
    }

    #[tokio::test]
    async fn test_spawned_heartbeat_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let handle = spawn(
            dir.path().to_path_buf(),
            "spawned",
            Duration::from_millis(20),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(age(dir.path(), "spawned").await.is_some());
    }
}
