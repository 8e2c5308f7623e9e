//! Arbiter control endpoint (loopback port 54321)
//!
//! Verbs: `GUI` (full state), `GUI_SET_CONFIG`, `GUI_SET_PRIO`,
//! `DOWNLOAD_EVENT`, `IDLE_WAIT`, `BANDWIDTH_QUERY`. All token-gated by the
//! shared [`serve`](crate::ipc::serve) accept loop.

use super::{ArbiterCommand, ArbiterHandle};
use crate::auth::ControlToken;
use crate::config::Config;
use crate::error::Result;
use crate::ipc::{self, Handler, Reply, Request};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long an `IDLE_WAIT` connection parks before timing out
const IDLE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the arbiter IPC endpoint until cancelled.
pub async fn run(
    config: Arc<Config>,
    token: ControlToken,
    handle: ArbiterHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = ipc::bind_loopback(config.ipc.arbiter_port).await?;
    tracing::info!(port = config.ipc.arbiter_port, "Arbiter IPC listening");
    let max_payload = config.ipc.max_payload;
    let handler: Handler = Arc::new(move |req: Request| {
        let handle = handle.clone();
        Box::pin(async move { dispatch(req, handle).await })
    });
    ipc::serve(listener, token, max_payload, handler, cancel).await;
    Ok(())
}

async fn dispatch(req: Request, handle: ArbiterHandle) -> Reply {
    match req.verb() {
        Some("GUI") => gui_state(&handle),
        Some("BANDWIDTH_QUERY") => {
            let snapshot = handle.snapshot();
            Reply::Json(serde_json::json!({
                "bandwidth": snapshot.installer_bps(),
            }))
        }
        Some("GUI_SET_PRIO") => set_priorities(req.data, &handle).await,
        Some("GUI_SET_CONFIG") => set_config(req.data, &handle).await,
        Some("DOWNLOAD_EVENT") => {
            let info = req.data.unwrap_or(serde_json::Value::Null);
            match handle.send(ArbiterCommand::ExternalDownload(info)).await {
                Ok(()) => Reply::Ok,
                Err(e) => Reply::from(&e),
            }
        }
        Some("IDLE_WAIT") => {
            // Park until the pool admits new work or the window elapses.
            let woken = tokio::time::timeout(IDLE_WAIT_TIMEOUT, handle.idle_wait())
                .await
                .is_ok();
            if woken {
                Reply::Json(serde_json::json!({"event": "WAKE_DOWNLOAD"}))
            } else {
                Reply::Json(serde_json::json!({"event": "IDLE_TIMEOUT"}))
            }
        }
        _ => Reply::UnknownCommand,
    }
}

fn gui_state(handle: &ArbiterHandle) -> Reply {
    let snapshot = handle.snapshot();
    Reply::Json(serde_json::json!({
        "bandwidth": snapshot.installer_bps(),
        "available_bps": snapshot.measured_available_bps,
        "downloads": snapshot.allocations,
        "priority_overrides": snapshot.priority_overrides,
        "system_load": snapshot.system_load,
        "idle_burst": snapshot.idle_burst,
    }))
}

async fn set_priorities(data: Option<serde_json::Value>, handle: &ArbiterHandle) -> Reply {
    let Some(value) = data else {
        return Reply::Error("GUI_SET_PRIO requires a data object".to_string());
    };
    // Only integer priorities in 0..=10 are accepted; anything else
    // rejects the whole update so a typo cannot half-apply.
    let Some(object) = value.as_object() else {
        return Reply::Error("priority overrides must be an object".to_string());
    };
    let mut overrides = HashMap::with_capacity(object.len());
    for (name, prio) in object {
        match prio.as_u64() {
            Some(p) if p <= 10 => {
                overrides.insert(name.clone(), p as u8);
            }
            _ => {
                return Reply::Error(format!("invalid priority value for {name}: {prio}"));
            }
        }
    }
    match handle.send(ArbiterCommand::SetPriorities(overrides)).await {
        Ok(()) => Reply::Ok,
        Err(e) => Reply::from(&e),
    }
}

async fn set_config(data: Option<serde_json::Value>, handle: &ArbiterHandle) -> Reply {
    let Some(value) = data else {
        return Reply::Error("GUI_SET_CONFIG requires a data object".to_string());
    };
    let bandwidth = value.get("bandwidth").and_then(|v| v.as_u64());
    let threads = value
        .get("threads")
        .and_then(|v| v.as_u64())
        .map(|t| t as u32);
    let mode = value
        .get("mode")
        .and_then(|v| v.as_str())
        .unwrap_or("auto")
        .to_string();
    match handle
        .send(ArbiterCommand::SetGuiConfig {
            bandwidth,
            threads,
            mode,
        })
        .await
    {
        Ok(()) => Reply::Ok,
        Err(e) => Reply::from(&e),
    }
}
