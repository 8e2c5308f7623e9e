//! Supervisor — role lifecycles and the supervised mesh.
//!
//! Every long-lived role (arbiter, monitor, pool, watchdog, system manager)
//! runs as a supervised tokio task: the supervisor respawns roles that
//! exit, the watchdog forces a restart when a role's heartbeat goes stale,
//! and shutdown is cooperative with a bounded teardown wait. [`run_mesh`]
//! wires the whole thing together for the `--mesh` entry point.

pub mod heartbeat;
pub mod system_manager;
pub mod watchdog;

pub use system_manager::SystemManager;
pub use watchdog::Watchdog;

use crate::auth::ControlToken;
use crate::config::Config;
use crate::error::Result;
use crate::ipc::{self, Reply, Request};
use crate::types::Event;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// All mesh role names, in workflow order
pub const ROLE_NAMES: [&str; 6] = [
    "arbiter",
    "monitor",
    "pool",
    "supervisor",
    "watchdog",
    "system-manager",
];

/// Shared role → running map, maintained by the supervisor and read by the
/// status endpoints and the system manager's workflow monitor.
#[derive(Clone, Default)]
pub struct RoleStates {
    inner: Arc<std::sync::Mutex<HashMap<String, bool>>>,
}

impl RoleStates {
    /// Empty state map
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a role running or stopped.
    pub fn set_running(&self, role: &str, running: bool) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(role.to_string(), running);
    }

    /// Whether a role is currently running.
    pub fn is_running(&self, role: &str) -> bool {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.get(role).copied().unwrap_or(false)
    }

    /// Snapshot of the whole map.
    pub fn all(&self) -> HashMap<String, bool> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// A role's run function: invoked for every (re)spawn with a fresh
/// cancellation scope.
pub type RoleFactory = Arc<
    dyn Fn(CancellationToken) -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync,
>;

/// One supervised role
pub struct Role {
    /// Role name (also the heartbeat file stem)
    pub name: &'static str,
    factory: RoleFactory,
}

impl Role {
    /// Role from an async factory.
    pub fn new<F, Fut>(name: &'static str, factory: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            factory: Arc::new(move |cancel| Box::pin(factory(cancel))),
        }
    }
}

/// Respawns exited roles and services watchdog restart requests.
pub struct Supervisor {
    config: Arc<Config>,
    roles: Vec<Role>,
    states: RoleStates,
    events: tokio::sync::broadcast::Sender<Event>,
    restart_rx: mpsc::Receiver<String>,
    active: Arc<std::sync::Mutex<HashMap<String, CancellationToken>>>,
}

impl Supervisor {
    /// Build the supervisor. `restart_rx` carries watchdog restart
    /// requests.
    pub fn new(
        config: Arc<Config>,
        roles: Vec<Role>,
        states: RoleStates,
        events: tokio::sync::broadcast::Sender<Event>,
        restart_rx: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            config,
            roles,
            states,
            events,
            restart_rx,
            active: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Run all roles until `cancel` fires, then tear down within the
    /// configured grace.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(roles = self.roles.len(), "Supervisor started");
        let hb = heartbeat::spawn(
            self.config.supervisor.heartbeat_dir.clone(),
            "supervisor",
            self.config.supervisor.heartbeat_interval,
            cancel.clone(),
        );

        let mut managers = Vec::new();
        for role in self.roles.drain(..) {
            managers.push(tokio::spawn(Self::manage_role(
                self.config.clone(),
                role,
                self.states.clone(),
                self.events.clone(),
                self.active.clone(),
                cancel.clone(),
            )));
        }

        // Watchdog restart requests: cancel the role's current scope; the
        // manager loop respawns it after the backoff.
        loop {
            tokio::select! {
                req = self.restart_rx.recv() => {
                    let Some(role) = req else { break };
                    let token = {
                        let map = self.active.lock().unwrap_or_else(|p| p.into_inner());
                        map.get(&role).cloned()
                    };
                    match token {
                        Some(token) => {
                            tracing::warn!(role, "Forcing role restart");
                            token.cancel();
                        }
                        None => tracing::warn!(role, "Restart requested for unknown role"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        // Bounded cooperative teardown
        let teardown = async {
            for manager in managers {
                manager.await.ok();
            }
            hb.await.ok();
        };
        if tokio::time::timeout(self.config.supervisor.shutdown_grace, teardown)
            .await
            .is_err()
        {
            tracing::warn!("Teardown exceeded grace period, abandoning remaining tasks");
        }
        tracing::info!("Supervisor stopped");
    }

    async fn manage_role(
        config: Arc<Config>,
        role: Role,
        states: RoleStates,
        events: tokio::sync::broadcast::Sender<Event>,
        active: Arc<std::sync::Mutex<HashMap<String, CancellationToken>>>,
        cancel: CancellationToken,
    ) {
        let name = role.name;
        loop {
            let scope = cancel.child_token();
            {
                let mut map = active.lock().unwrap_or_else(|p| p.into_inner());
                map.insert(name.to_string(), scope.clone());
            }
            states.set_running(name, true);
            events
                .send(Event::RoleStarted {
                    role: name.to_string(),
                })
                .ok();
            tracing::info!(role = name, "Role started");

            let result = (role.factory)(scope.clone()).await;
            states.set_running(name, false);

            if cancel.is_cancelled() {
                tracing::info!(role = name, "Role stopped for shutdown");
                break;
            }
            let reason = match result {
                Ok(()) => "exited".to_string(),
                Err(e) => format!("failed: {e}"),
            };
            tracing::error!(role = name, reason, "Role down, respawning after backoff");
            events
                .send(Event::RoleRestarted {
                    role: name.to_string(),
                    reason,
                })
                .ok();
            tokio::select! {
                _ = tokio::time::sleep(config.supervisor.respawn_delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }
}

/// Serve a role-status endpoint (watchdog and supervisor ports): replies
/// with the role map and heartbeat ages.
pub async fn run_role_status_server(
    config: Arc<Config>,
    token: ControlToken,
    states: RoleStates,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = ipc::bind_loopback(port).await?;
    tracing::info!(port, "Role status server listening");
    let max_payload = config.ipc.max_payload;
    let heartbeat_dir = config.supervisor.heartbeat_dir.clone();
    let handler: ipc::Handler = Arc::new(move |req: Request| {
        let states = states.clone();
        let heartbeat_dir = heartbeat_dir.clone();
        Box::pin(async move {
            match req.verb() {
                Some("STATUS") | Some("status") => {
                    let mut heartbeats = serde_json::Map::new();
                    for role in ROLE_NAMES {
                        let age = heartbeat::age(&heartbeat_dir, role)
                            .await
                            .map(|a| a.as_secs_f64());
                        heartbeats.insert(role.to_string(), serde_json::json!(age));
                    }
                    Reply::Json(serde_json::json!({
                        "roles": states.all(),
                        "heartbeat_ages": heartbeats,
                    }))
                }
                _ => Reply::UnknownCommand,
            }
        })
    });
    ipc::serve(listener, token, max_payload, handler, cancel).await;
    Ok(())
}

/// Assemble and run the full supervised mesh until `cancel` fires.
///
/// This is the `--mesh` entry point: credentials are provisioned, every
/// role is built against shared in-process registries, and the supervisor
/// keeps them alive.
pub async fn run_mesh(config: Config, cancel: CancellationToken) -> Result<()> {
    let config = Arc::new(config);
    let token = ControlToken::load_or_generate(&config.supervisor.token_file)?;
    system_manager::ensure_certificates(&config.supervisor.cert_dir)?;

    let (events, _) = tokio::sync::broadcast::channel::<Event>(1024);
    let states = RoleStates::new();
    let directory = crate::arbiter::DownloadDirectory::new();
    let registry = Arc::new(crate::transport::TransportRegistry::new(&config.download));
    let scanner = crate::scanner::scanner_from_config(&config.scanner);
    let engine = Arc::new(crate::engine::DownloadEngine::new(
        config.download.clone(),
        registry,
        scanner,
    ));

    let (arbiter, arbiter_handle) = crate::arbiter::Arbiter::new(
        config.clone(),
        directory.clone(),
        Arc::new(crate::arbiter::SysinfoProbe::new()),
        Arc::new(crate::arbiter::PingProbe),
        events.clone(),
    );
    let arbiter = Arc::new(tokio::sync::Mutex::new(arbiter));

    let pool = crate::pool::DownloadPool::new(
        config.clone(),
        engine,
        directory.clone(),
        Some(arbiter_handle.clone()),
        events.clone(),
    );

    let monitor = crate::monitor::FsMonitor::new(config.clone(), token.clone())?;
    let monitor_stats = monitor.stats();
    let monitor = Arc::new(tokio::sync::Mutex::new(monitor));

    let (restart_tx, restart_rx) = mpsc::channel::<String>(16);
    let watchdog = Arc::new(Watchdog::new(
        config.clone(),
        vec!["arbiter", "monitor", "pool"],
        restart_tx,
    ));
    let system_manager = Arc::new(SystemManager::new(
        config.clone(),
        token.clone(),
        states.clone(),
    ));

    let mut roles = Vec::new();

    {
        let arbiter = arbiter.clone();
        let handle = arbiter_handle.clone();
        let config = config.clone();
        let token = token.clone();
        roles.push(Role::new("arbiter", move |cancel: CancellationToken| {
            let arbiter = arbiter.clone();
            let server = crate::arbiter::server::run(
                config.clone(),
                token.clone(),
                handle.clone(),
                cancel.clone(),
            );
            async move {
                let mut arbiter = arbiter.lock().await;
                tokio::try_join!(arbiter.run(cancel), server)?;
                Ok(())
            }
        }));
    }

    {
        let pool = pool.clone();
        let config = config.clone();
        let token = token.clone();
        roles.push(Role::new("pool", move |cancel: CancellationToken| {
            let pool = pool.clone();
            let config = config.clone();
            let token = token.clone();
            async move {
                pool.start(cancel.clone());
                let hb = heartbeat::spawn(
                    config.supervisor.heartbeat_dir.clone(),
                    "pool",
                    config.supervisor.heartbeat_interval,
                    cancel.clone(),
                );
                let result = tokio::try_join!(
                    crate::pool::server::run_command_server(
                        config.clone(),
                        token.clone(),
                        pool.clone(),
                        cancel.clone(),
                    ),
                    crate::pool::server::run_takeover_server(config, token, pool, cancel),
                );
                hb.abort();
                result.map(|_| ())
            }
        }));
    }

    {
        let monitor = monitor.clone();
        let config = config.clone();
        let token = token.clone();
        let stats = monitor_stats;
        roles.push(Role::new("monitor", move |cancel: CancellationToken| {
            let monitor = monitor.clone();
            let config = config.clone();
            let token = token.clone();
            let stats = stats.clone();
            async move {
                let mut monitor = monitor.lock().await;
                monitor.start()?;
                tokio::try_join!(
                    async {
                        monitor.run(cancel.clone()).await;
                        Ok::<(), crate::error::Error>(())
                    },
                    crate::monitor::run_status_server(config, token, stats, cancel.clone()),
                )?;
                Ok(())
            }
        }));
    }

    {
        let watchdog = watchdog.clone();
        let config = config.clone();
        let token = token.clone();
        let states = states.clone();
        roles.push(Role::new("watchdog", move |cancel: CancellationToken| {
            let watchdog = watchdog.clone();
            let config = config.clone();
            let token = token.clone();
            let states = states.clone();
            async move {
                tokio::try_join!(
                    async {
                        watchdog.run(cancel.clone()).await;
                        Ok::<(), crate::error::Error>(())
                    },
                    run_role_status_server(
                        config.clone(),
                        token,
                        states,
                        config.ipc.watchdog_port,
                        cancel.clone(),
                    ),
                )?;
                Ok(())
            }
        }));
    }

    {
        let system_manager = system_manager.clone();
        roles.push(Role::new("system-manager", move |cancel: CancellationToken| {
            let system_manager = system_manager.clone();
            async move { system_manager.run(cancel).await }
        }));
    }

    // The supervisor's own status endpoint rides outside the role set so a
    // role storm cannot take it down.
    tokio::spawn(run_role_status_server(
        config.clone(),
        token.clone(),
        states.clone(),
        config.ipc.supervisor_port,
        cancel.clone(),
    ));

    let supervisor = Supervisor::new(config, roles, states, events, restart_rx);
    supervisor.run(cancel).await;
    Ok(())
}
