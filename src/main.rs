use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use std::fs;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

mod api;
mod cli;
mod config;
mod error;
mod metrics;
mod models;
mod services;
mod state;

use cli::CommandArgs;
use services::downloader::{assets_for, cleanup_old_files, Downloader};
use services::keepalive::Keepalive;
use services::proxy::ExternalProxy;
use services::tunnel_domain::DomainMonitor;
use state::{new_state, AppState};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CommandArgs::parse();
    let bind_address = format!("{}:{}", args.address, args.port);

    let state = match prepare(args).await {
        Ok(state) => state,
        Err(e) => {
            log::error!("❌ Startup failed: {}", e);
            for cause in e.chain().skip(1) {
                log::error!("     - {}", cause);
            }
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };

    let server_state = state.clone();
    let sub_path = state.config.sub_path.clone();
    let server = HttpServer::new(move || {
        let sub_path = sub_path.clone();
        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .configure(move |cfg| api::routes(cfg, &sub_path))
    })
    .bind(&bind_address)?;

    let proxy_listener = bind_proxy(&state).await?;

    // subscribed before the first launch so the boot tunnel is seen too
    let tunnel_launches = state.supervisor.subscribe_launches();

    log::info!("🚀 Starting supervised processes...");
    state.launcher.launch_all().await;
    spawn_background_tasks(&state, tunnel_launches, proxy_listener);

    print_banner(&state);

    let result = server.run().await;

    // actix 已处理 SIGINT/SIGTERM，这里负责回收子进程
    log::info!("HTTP server stopped, cleaning up...");
    state.supervisor.shutdown().await;
    result
}

/// Working directory, cleanup and binaries; everything before the first launch.
async fn prepare(args: CommandArgs) -> anyhow::Result<AppState> {
    fs::create_dir_all(&args.file_path)
        .with_context(|| format!("create {}", args.file_path.display()))?;
    log::info!("Working directory: {}", args.file_path.display());

    if args.skip_download {
        log::info!("SKIP_DOWNLOAD set, using binaries already in place");
    } else {
        let removed = cleanup_old_files(&args.file_path)?;
        log::info!("🧹 Removed {} stale files", removed);

        log::info!("📥 Downloading required binaries...");
        Downloader::from_args(&args)?
            .download_all(&assets_for(&args))
            .await
            .context("download binaries")?;
    }

    new_state(args)
}

/// Listener for the external proxy; `None` when it would shadow the control port.
async fn bind_proxy(state: &AppState) -> std::io::Result<Option<TcpListener>> {
    let args = &state.config;
    if args.external_port == args.port {
        log::warn!(
            "EXTERNAL_PORT equals PORT ({}), external proxy disabled",
            args.port
        );
        return Ok(None);
    }

    let listener = TcpListener::bind((args.address.as_str(), args.external_port)).await?;
    log::info!("🔀 External proxy listening on {}:{}", args.address, args.external_port);
    Ok(Some(listener))
}

fn spawn_background_tasks(
    state: &AppState,
    tunnel_launches: broadcast::Receiver<String>,
    proxy_listener: Option<TcpListener>,
) {
    let monitor = DomainMonitor::new(state.config.clone(), state.supervisor.clone());
    tokio::spawn(monitor.run(tunnel_launches, state.supervisor.shutdown_token()));

    if let Some(listener) = proxy_listener {
        let proxy = ExternalProxy::from_args(&state.config);
        tokio::spawn(proxy.run(listener, state.supervisor.shutdown_token()));
    }

    match Keepalive::from_args(&state.config) {
        Ok(Some(keepalive)) => {
            tokio::spawn(keepalive.run(state.supervisor.shutdown_token()));
        }
        Ok(None) => {}
        Err(e) => log::warn!("Auto access disabled: {:#}", e),
    }
}

fn print_banner(state: &AppState) {
    let args = &state.config;

    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║      Tunnel Daemon v{:<38}║", env!("CARGO_PKG_VERSION"));
    println!("║      Process supervision for proxy, tunnel and agent      ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("🚀 Server starting on http://{}:{}", args.address, args.port);
    println!(
        "🔀 Tunnel entry on port {} (websocket paths to xray, the rest here)",
        args.external_port
    );
    println!();
    println!("📋 Available endpoints:");
    println!("  GET    /                       - Control page");
    println!("  GET    /daemon-status          - Supervised process status");
    println!("  POST   /restart/{{process}}      - Restart nezha, xray, tunnel or all");
    println!("  GET    /{:<24} - Subscription", args.sub_path);
    println!("  GET    /metrics                - Prometheus metrics");
    println!("  GET    /health                 - Health check");
    println!();
    println!("💡 Supervisor:");
    println!("  • Health check every {} ms", args.daemon_check_interval);
    println!(
        "  • Up to {} restarts, backoff from {} ms",
        args.daemon_max_retries, args.daemon_restart_delay
    );
    println!("═══════════════════════════════════════════════════════════");
}
