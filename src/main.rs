use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shelly_exporter::config::Config;
use shelly_exporter::drivers::DriverRegistry;
use shelly_exporter::metrics::Metrics;
use shelly_exporter::poller::DevicePoller;
use shelly_exporter::scanner::NetworkScanner;
use shelly_exporter::server;
use shelly_exporter::shelly::ShellyClientPool;
use shelly_exporter::watcher::ConfigWatcher;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: CONFIG_PATH env var or
    /// /config/config.yml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = Config::resolve_path(args.config);

    // Reloadable filter: starts at RUST_LOG or "info", adjusted to the
    // configured level once the file is loaded and on every hot-reload.
    let env_override = EnvFilter::try_from_default_env().ok();
    let from_env = env_override.is_some();
    let (filter, log_handle) = tracing_subscriber::reload::Layer::new(
        env_override.unwrap_or_else(|| EnvFilter::new("info")),
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("failed to load configuration from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };
    if !from_env {
        let _ = log_handle.reload(EnvFilter::new(config.log_level.as_filter()));
    }

    info!(
        "starting shelly-exporter v{} with {} targets",
        env!("CARGO_PKG_VERSION"),
        config.targets.len()
    );

    let metrics = Metrics::new()?;
    let drivers = Arc::new(DriverRegistry::new());
    let pool = ShellyClientPool::new(Duration::from_secs(config.request_timeout_seconds))?;

    let poller = DevicePoller::new(
        Arc::clone(&config),
        pool.clone(),
        metrics.clone(),
        Arc::clone(&drivers),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let server_task = {
        let metrics = metrics.clone();
        let host = config.listen_host.clone();
        let port = config.listen_port;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { server::serve(&host, port, metrics, shutdown).await })
    };

    let poller_task = {
        let poller = poller.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    };

    let watcher_task = {
        let watcher = ConfigWatcher::new(
            config_path.clone(),
            Arc::clone(&config),
            poller.clone(),
            metrics.clone(),
            Some(log_handle),
        );
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { watcher.run(shutdown).await })
    };

    let scanner_task = if config.discovery.enabled {
        info!("network discovery is enabled");
        let scanner = NetworkScanner::new(
            poller.clone(),
            pool.clone(),
            metrics.clone(),
            Arc::clone(&drivers),
        );
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move { scanner.run(shutdown).await }))
    } else {
        None
    };

    // Bind failures surface quickly; treat them as fatal before settling in.
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => {
                    error!("metrics server error: {e}");
                    std::process::exit(1);
                }
                Ok(Ok(())) => {}
                Err(e) => {
                    error!("metrics server panicked: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    // Cooperative shutdown: in-flight polls get a grace window equal to the
    // request timeout, then everything is dropped.
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(poller.current_config().request_timeout_seconds);
    let drain = async {
        let _ = poller_task.await;
        let _ = watcher_task.await;
        if let Some(task) = scanner_task {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        info!("grace window elapsed, abandoning in-flight polls");
    }

    info!("shutdown complete");
    Ok(())
}
