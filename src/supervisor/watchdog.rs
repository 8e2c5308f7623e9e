//! Watchdog — heartbeat-staleness restarts
//!
//! The watchdog polls the heartbeat files of the roles it wraps and asks
//! the supervisor to restart any role whose heartbeat is older than the
//! grace period. The restart itself stays with the supervisor so there is
//! exactly one place that owns role lifecycles.

use super::heartbeat;
use crate::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How often heartbeats are checked
const CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Restart request bus into the supervisor
pub type RestartSender = mpsc::Sender<String>;

/// Heartbeat watchdog over a set of roles.
pub struct Watchdog {
    config: Arc<Config>,
    watched_roles: Vec<&'static str>,
    restart_tx: RestartSender,
}

impl Watchdog {
    /// Watchdog over `watched_roles`, sending restart requests on
    /// `restart_tx`.
    pub fn new(
        config: Arc<Config>,
        watched_roles: Vec<&'static str>,
        restart_tx: RestartSender,
    ) -> Self {
        Self {
            config,
            watched_roles,
            restart_tx,
        }
    }

    /// Run until cancelled, heartbeating as `watchdog`.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(roles = ?self.watched_roles, "Watchdog started");
        let mut tick = tokio::time::interval(CHECK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.check_all().await;
                    heartbeat::write(&self.config.supervisor.heartbeat_dir, "watchdog").await;
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("Watchdog stopped");
    }

    async fn check_all(&self) {
        let grace = self.config.supervisor.heartbeat_grace;
        let dir = &self.config.supervisor.heartbeat_dir;
        for role in &self.watched_roles {
            match heartbeat::age(dir, role).await {
                Some(age) if age > grace => {
                    tracing::error!(
                        role,
                        age_secs = age.as_secs(),
                        "Heartbeat stale, requesting restart"
                    );
                    if self.restart_tx.send(role.to_string()).await.is_err() {
                        tracing::warn!("Supervisor restart channel closed");
                        return;
                    }
                }
                Some(_) => {}
                None => {
                    // The role has not produced its first heartbeat yet (or
                    // the file vanished); the supervisor's respawn loop owns
                    // crash recovery, so just note it.
                    tracing::debug!(role, "Heartbeat file not found, waiting");
                }
            }
        }
    }
}
