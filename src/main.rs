//! throttle-dl command-line entry point

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use throttle_dl::auth::ControlToken;
use throttle_dl::supervisor::heartbeat;
use throttle_dl::{Config, DownloadSpec, Mode};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "throttle-dl",
    about = "Download orchestration with cooperative bandwidth throttling",
    arg_required_else_help = true
)]
struct Cli {
    /// Run the bandwidth arbiter role standalone
    #[arg(long)]
    service: bool,

    /// Run the full supervised mesh (arbiter, monitor, pool, watchdog,
    /// system manager)
    #[arg(long)]
    mesh: bool,

    /// Download a file: --download URL DEST
    #[arg(long, num_args = 2, value_names = ["URL", "DEST"])]
    download: Option<Vec<String>>,

    /// Show role status and heartbeat freshness
    #[arg(long)]
    status: bool,

    /// Parallel range workers for --download
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Fixed bandwidth in bytes/s for --download (implies manual mode)
    #[arg(long)]
    bandwidth: Option<u64>,

    /// Maximum parallelism, no throttling
    #[arg(long)]
    max_speed: bool,

    /// Skip the post-download scanner hook
    #[arg(long)]
    no_virus_check: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    let exit = runtime.block_on(async {
        if cli.mesh {
            run_mesh().await
        } else if cli.service {
            run_service().await
        } else if let Some(args) = &cli.download {
            run_download(&cli, args).await
        } else if cli.status {
            show_status().await
        } else {
            // clap's arg_required_else_help covers the empty case; a lone
            // option combination with nothing to do lands here.
            Cli::parse_from(["throttle-dl", "--help"]);
            Ok(())
        }
    });
    match exit {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!("{e:#}");
            Err(e)
        }
    }
}

async fn run_mesh() -> anyhow::Result<()> {
    throttle_dl::run_with_shutdown(Config::default())
        .await
        .context("mesh failed")
}

/// The arbiter role standalone: allocation loop plus its IPC endpoint.
async fn run_service() -> anyhow::Result<()> {
    let config = std::sync::Arc::new(Config::default());
    let token = ControlToken::load_or_generate(&config.supervisor.token_file)?;
    let (events, _) = tokio::sync::broadcast::channel(256);
    let (mut arbiter, handle) = throttle_dl::Arbiter::new(
        config.clone(),
        throttle_dl::DownloadDirectory::new(),
        std::sync::Arc::new(throttle_dl::arbiter::SysinfoProbe::new()),
        std::sync::Arc::new(throttle_dl::arbiter::PingProbe),
        events,
    );

    let cancel = CancellationToken::new();
    let server = tokio::spawn(throttle_dl::arbiter::server::run(
        config.clone(),
        token,
        handle,
        cancel.clone(),
    ));
    let loop_cancel = cancel.clone();
    let arbiter_task = tokio::spawn(async move { arbiter.run(loop_cancel).await });

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("ThrottleService stopping");
    cancel.cancel();
    arbiter_task.await.context("arbiter task panicked")??;
    server.await.context("server task panicked")??;
    Ok(())
}

/// One-shot engine run against the local arbiter (when one is up).
async fn run_download(cli: &Cli, args: &[String]) -> anyhow::Result<()> {
    let url: url::Url = args[0].parse().context("invalid URL")?;
    let dest = PathBuf::from(&args[1]);
    let config = Config::default();

    let mut spec = DownloadSpec::new(url, dest);
    spec.thread_count_hint = cli.threads;
    spec.virus_check = !cli.no_virus_check;
    if cli.max_speed {
        spec.mode = Mode::MaxSpeed;
    } else if let Some(bps) = cli.bandwidth {
        spec.mode = Mode::Manual;
        spec.bandwidth_override = Some(bps);
    }

    let registry = std::sync::Arc::new(throttle_dl::transport::TransportRegistry::new(
        &config.download,
    ));
    let scanner = throttle_dl::scanner::scanner_from_config(&config.scanner);
    let engine = throttle_dl::DownloadEngine::new(config.download.clone(), registry, scanner);

    let (events, _) = tokio::sync::broadcast::channel(256);
    let ctx = throttle_dl::EngineContext::new(throttle_dl::DownloadId::new(), events.clone());

    // Follow a running arbiter's assignment when neither an override nor
    // max-speed was asked for.
    if spec.mode == Mode::Auto {
        if let Ok(token) = ControlToken::load_or_generate(&config.supervisor.token_file) {
            let req = throttle_dl::ipc::Request::event(&token, "BANDWIDTH_QUERY", None);
            if let Ok(throttle_dl::ipc::Reply::Json(v)) =
                throttle_dl::ipc::send_request(&config.ipc, config.ipc.arbiter_port, &req).await
            {
                if let Some(bps) = v.get("bandwidth").and_then(|b| b.as_u64()) {
                    tracing::info!(bps, "Following arbiter allocation");
                    ctx.rate.set(bps);
                }
            }
        }
    }

    // Progress to the terminal
    let mut progress_rx = events.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = progress_rx.recv().await {
            if let throttle_dl::Event::Progress {
                bytes_written,
                rate_bps,
                ..
            } = event
            {
                eprintln!("  {bytes_written} bytes ({rate_bps} B/s)");
            }
        }
    });

    let outcome = engine.run(&spec, &ctx).await;
    printer.abort();
    match outcome? {
        throttle_dl::EngineOutcome::Completed(path) => {
            println!("Downloaded to {}", path.display());
            Ok(())
        }
        throttle_dl::EngineOutcome::Cancelled => anyhow::bail!("download was cancelled"),
    }
}

/// Role-running and heartbeat-freshness table.
async fn show_status() -> anyhow::Result<()> {
    let config = Config::default();
    let token = ControlToken::load_or_generate(&config.supervisor.token_file)?;

    let running: std::collections::HashMap<String, bool> = {
        let req = throttle_dl::ipc::Request::command(&token, "STATUS", None);
        match throttle_dl::ipc::send_request(&config.ipc, config.ipc.supervisor_port, &req).await
        {
            Ok(throttle_dl::ipc::Reply::Json(v)) => v
                .get("roles")
                .and_then(|r| serde_json::from_value(r.clone()).ok())
                .unwrap_or_default(),
            _ => Default::default(),
        }
    };

    println!("Service Status:");
    for role in throttle_dl::supervisor::ROLE_NAMES {
        let state = if running.get(role).copied().unwrap_or(false) {
            "RUNNING"
        } else {
            "STOPPED"
        };
        let hb = match heartbeat::age(&config.supervisor.heartbeat_dir, role).await {
            Some(age) if age.as_secs() < 10 => format!("OK ({}s ago)", age.as_secs()),
            Some(age) => format!("STALE ({}s ago)", age.as_secs()),
            None => "Missing".to_string(),
        };
        println!("  {role:16} | Service: {state:8} | Heartbeat: {hb}");
    }
    Ok(())
}
