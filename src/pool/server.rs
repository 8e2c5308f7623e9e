//! Pool IPC endpoints: command port (54506) and takeover port (54323)

use super::DownloadPool;
use crate::auth::ControlToken;
use crate::config::Config;
use crate::error::Result;
use crate::ipc::{self, Handler, Reply, Request};
use crate::types::{DownloadId, DownloadSpec};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Run the command endpoint until cancelled.
pub async fn run_command_server(
    config: Arc<Config>,
    token: ControlToken,
    pool: DownloadPool,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = ipc::bind_loopback(config.ipc.pool_port).await?;
    tracing::info!(port = config.ipc.pool_port, "Pool command server listening");
    let max_payload = config.ipc.max_payload;
    let handler: Handler = Arc::new(move |req: Request| {
        let pool = pool.clone();
        Box::pin(async move { dispatch_command(req, pool) })
    });
    ipc::serve(listener, token, max_payload, handler, cancel).await;
    Ok(())
}

/// Run the takeover endpoint until cancelled.
pub async fn run_takeover_server(
    config: Arc<Config>,
    token: ControlToken,
    pool: DownloadPool,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = ipc::bind_loopback(config.ipc.takeover_port).await?;
    tracing::info!(port = config.ipc.takeover_port, "Pool takeover server listening");
    let max_payload = config.ipc.max_payload;
    let handler: Handler = Arc::new(move |req: Request| {
        let pool = pool.clone();
        Box::pin(async move { dispatch_takeover(req, pool) })
    });
    ipc::serve(listener, token, max_payload, handler, cancel).await;
    Ok(())
}

fn dispatch_command(req: Request, pool: DownloadPool) -> Reply {
    match req.verb() {
        Some("ADD_DOWNLOAD") => add_download(req.data, pool),
        Some("PAUSE") => match pool.pause(parse_id(&req)) {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::from(&e),
        },
        Some("RESUME") => match pool.resume(parse_id(&req)) {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::from(&e),
        },
        Some("SPIN_DOWN_THREAD") => {
            let Some(id) = parse_id(&req) else {
                return Reply::Error("SPIN_DOWN_THREAD requires an id".to_string());
            };
            let count = req
                .data
                .as_ref()
                .and_then(|d| d.get("count"))
                .and_then(|c| c.as_u64())
                .unwrap_or(1) as usize;
            match pool.spin_down(id, count) {
                Ok(()) => Reply::Ok,
                Err(e) => Reply::from(&e),
            }
        }
        Some("STATUS") => match serde_json::to_value(pool.status()) {
            Ok(v) => Reply::Json(serde_json::json!({"downloads": v})),
            Err(e) => Reply::Error(e.to_string()),
        },
        _ => Reply::UnknownCommand,
    }
}

/// The record id, from `data.id` or the flat `download_id` field.
fn parse_id(req: &Request) -> Option<DownloadId> {
    let from_data = req
        .data
        .as_ref()
        .and_then(|d| d.get("id"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok());
    from_data.or_else(|| {
        req.extra
            .get("download_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    })
}

fn add_download(data: Option<serde_json::Value>, pool: DownloadPool) -> Reply {
    let Some(data) = data else {
        return Reply::Error("ADD_DOWNLOAD requires a data object".to_string());
    };
    let uri = match data.get("uri").or_else(|| data.get("url")) {
        Some(serde_json::Value::String(s)) => match Url::parse(s) {
            Ok(u) => u,
            Err(e) => return Reply::Error(format!("invalid uri: {e}")),
        },
        _ => return Reply::Error("ADD_DOWNLOAD requires a uri".to_string()),
    };
    let Some(dest) = data.get("dest").and_then(|v| v.as_str()) else {
        return Reply::Error("ADD_DOWNLOAD requires a dest".to_string());
    };

    let mut spec = DownloadSpec::new(uri, PathBuf::from(dest));
    spec.size_hint = data.get("size").and_then(|v| v.as_u64());
    if let Some(opts) = data.get("opts") {
        // Opts mirror the DownloadSpec fields; unknown keys are ignored
        if let Some(v) = opts.get("virus_check").and_then(|v| v.as_bool()) {
            spec.virus_check = v;
        }
        if let Some(v) = opts.get("threads").and_then(|v| v.as_u64()) {
            spec.thread_count_hint = v as usize;
        }
        if let Some(v) = opts.get("bandwidth").and_then(|v| v.as_u64()) {
            spec.bandwidth_override = Some(v);
            spec.mode = crate::types::Mode::Manual;
        }
        if let Some(mode) = opts.get("mode").and_then(|v| v.as_str()) {
            spec.mode = match mode {
                "manual" => crate::types::Mode::Manual,
                "max_speed" => crate::types::Mode::MaxSpeed,
                _ => crate::types::Mode::Auto,
            };
        }
        if let Some(v) = opts.get("chunk_size").and_then(|v| v.as_u64()) {
            spec.chunk_size_hint = Some(v as usize);
        }
    }

    match pool.admit(spec, None) {
        Ok(id) => Reply::Json(serde_json::json!({"id": id})),
        Err(e) => Reply::from(&e),
    }
}

fn dispatch_takeover(req: Request, pool: DownloadPool) -> Reply {
    let Some(file_path) = req
        .extra
        .get("file_path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
    else {
        return Reply::Error("takeover requires file_path".to_string());
    };
    let url = req
        .extra
        .get("url")
        .and_then(|v| v.as_str())
        .and_then(|s| Url::parse(s).ok());
    let pid = req.extra.get("pid").and_then(|v| v.as_u64()).map(|p| p as u32);

    match pool.takeover(url, file_path, pid) {
        Ok(Some(id)) => Reply::Json(serde_json::json!({"id": id})),
        Ok(None) => Reply::Ok,
        Err(e) => Reply::from(&e),
    }
}
