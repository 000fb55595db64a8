// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use rmi_catalog::{Plugin, PluginCatalog};
use rmi_daemon::{bootstrap, build_app};
use rmi_pool::WorkerPool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rmi-agent", version, about = "RMI execution core agent process")]
struct Args {
    /// Path to a TOML configuration file. Falls back to built-in defaults
    /// plus `RMI_`-prefixed environment overrides if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { EnvFilter::new("rmi=debug") } else { EnvFilter::new("rmi=info") };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (config, warnings) =
        rmi_config::load_config(args.config.as_deref()).context("load configuration")?;
    for warning in &warnings {
        tracing::warn!(%warning, "configuration warning");
    }

    // The stock binary ships with no registered plugin classes — real
    // deployments embed the plugin classes their process needs by
    // calling `rmi_daemon::bootstrap` directly rather than running this
    // binary. Every configured queue still gets an ingress consumer and
    // falls back to the sink's PluginNotFound reply until a real plugin
    // is registered against it.
    let sink = Arc::new(Plugin::sink(WorkerPool::direct(rmi_runtime::scheduler::dispatch_handler())));
    let mut catalog = PluginCatalog::new(sink);
    let mut plugins = Vec::new();
    for plugin_config in config.plugins.values() {
        let pool = WorkerPool::new(
            plugin_config.pool.capacity,
            plugin_config.pool.backlog,
            rmi_runtime::scheduler::dispatch_handler(),
        );
        let plugin = Arc::new(Plugin::new(plugin_config.queue.clone(), std::collections::HashMap::new(), pool));
        catalog.register(plugin.clone());
        plugins.push(plugin);
    }

    let agent = bootstrap(&config, Arc::new(catalog), plugins).await.context("bootstrap agent process")?;
    let state = agent.state.clone();
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.control.bind_addr)
        .await
        .with_context(|| format!("bind control surface on {}", config.control.bind_addr))?;
    info!(bind = %config.control.bind_addr, plugins = config.plugins.len(), "rmi-agent listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve control surface")?;

    agent.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
