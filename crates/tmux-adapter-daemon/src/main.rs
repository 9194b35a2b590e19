//! tmux-adapter daemon.
//!
//! Responsibilities:
//! - Own the control-mode connection, agent registry and pipe-pane manager
//! - Serve the WebSocket endpoint plus health and REST routes on one port
//! - Shut components down in order; exit non-zero when tmux dies

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn};

use tmux_adapter_core::{
    default_spool_root, forward_registry_events, rest, ControlMode, ControlModeConfig,
    DetectorConfig, MuxCommands, NudgeLocks, PipePaneManager, ProcInspector, Registry, WsServer,
};

#[derive(Parser, Debug)]
#[command(name = "tmux-adapter", about = "Bridge tmux-hosted coding agents to WebSocket clients")]
struct Args {
    /// Town root directory; agents must work underneath it. Defaults to ~/gt.
    #[arg(long = "gt-dir")]
    gt_dir: Option<PathBuf>,

    /// HTTP/WebSocket listen port.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Static bearer token; empty disables authentication.
    #[arg(long = "auth-token", default_value = "")]
    auth_token: String,

    /// Comma-separated origin glob patterns for WebSocket upgrades.
    #[arg(long = "allowed-origins", default_value = "localhost:*")]
    allowed_origins: String,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let gt_dir = args.gt_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gt")
    });
    let origin_patterns: Vec<String> = args
        .allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();

    // 1. Connect to tmux in control mode.
    let ctrl = Arc::new(
        ControlMode::connect(ControlModeConfig::default())
            .await
            .context("tmux control mode")?,
    );
    let mux: Arc<dyn MuxCommands> = ctrl.clone();

    // 2. Registry, pipe-pane manager, WebSocket server.
    let registry = Arc::new(Registry::new(
        Arc::clone(&mux),
        DetectorConfig {
            gt_dir: gt_dir.clone(),
        },
        Arc::new(ProcInspector),
    ));
    let pipes = Arc::new(PipePaneManager::new(Arc::clone(&mux), default_spool_root()));
    let ws = WsServer::new(
        Arc::clone(&registry),
        Arc::clone(&pipes),
        Arc::clone(&mux),
        Arc::new(NudgeLocks::new()),
        args.auth_token,
        origin_patterns,
    );

    // 3. Prime the registry and watch session notifications.
    registry
        .start(ctrl.subscribe_notifications())
        .await
        .context("start registry")?;
    info!(
        agents = registry.get_agents().await.len(),
        gt_dir = %gt_dir.display(),
        "agent registry started"
    );

    // 4. Forward lifecycle events to subscribed clients.
    tokio::spawn(forward_registry_events(
        Arc::clone(&ws),
        Arc::clone(&pipes),
        registry.subscribe(),
    ));

    // 5. One port for health, WebSocket and REST.
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(Arc::clone(&mux))
        .merge(ws.router())
        .merge(rest::router(Arc::clone(&ws)));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("bind port {}", args.port))?;
    info!(port = args.port, "listening on ws://localhost:{}/ws", args.port);

    let shutdown = {
        let ctrl = Arc::clone(&ctrl);
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = ctrl.wait_closed() => warn!("tmux control mode connection lost"),
            }
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server")?;

    // Teardown order: clients first, the control connection last.
    info!("shutting down");
    ws.close_all().await;
    registry.stop();
    pipes.stop_all().await;

    let fatal = *ctrl.closed().borrow();
    ctrl.close().await;

    if fatal {
        error!("tmux control mode died; exiting for supervisor restart");
        std::process::exit(1);
    }
    info!("shutdown complete");
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

/// Ready only when the control connection still answers commands.
async fn readyz(State(mux): State<Arc<dyn MuxCommands>>) -> impl IntoResponse {
    match mux.list_sessions().await {
        Ok(_) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ok": false, "error": format!("tmux control mode unavailable: {e}")})),
        ),
    }
}
