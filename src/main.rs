//! Virtual cluster proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────────┐
//!                    │                    VCLUSTER PROXY                        │
//!                    │                                                          │
//!   Client           │  ┌──────────┐    ┌───────────┐    ┌─────────────────┐    │
//!   ─────────────────┼─▶│ listener │───▶│ SNI peek  │───▶│ endpoint        │    │
//!                    │  │ (shared) │    │ + resolve │    │ registry        │    │
//!                    │  └──────────┘    └───────────┘    └────────┬────────┘    │
//!                    │                                            │ binding     │
//!                    │                                            ▼             │
//!                    │  ┌──────────┐    ┌───────────┐    ┌─────────────────┐    │
//!   ◀────────────────┼──│  codec   │◀──▶│  filter   │◀──▶│ upstream node   │◀───┼──▶ Cluster
//!                    │  │  pumps   │    │  handler  │    │ connection      │    │
//!                    │  └──────────┘    └───────────┘    └─────────────────┘    │
//!                    │                                                          │
//!                    │  ┌────────────────────────────────────────────────────┐  │
//!                    │  │  config + reload │ observability │ lifecycle       │  │
//!                    │  └────────────────────────────────────────────────────┘  │
//!                    └──────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use vcluster_proxy::config::loader::load_config_with;
use vcluster_proxy::config::watcher::ConfigWatcher;
use vcluster_proxy::lifecycle::signals::{wait_for_signal, SignalEvent};
use vcluster_proxy::observability::{logging, metrics};
use vcluster_proxy::{FilterFactoryRegistry, ProxyServer};

#[derive(Parser)]
#[command(name = "vcluster-proxy")]
#[command(about = "Protocol-aware proxy for virtual clusters", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "proxy.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Watch the configuration file and reload on change
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filters = Arc::new(FilterFactoryRegistry::with_builtins());

    let config = match load_config_with(&cli.config, &filters) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    if cli.check {
        println!("{}: ok ({} virtual clusters)", cli.config.display(), config.virtual_clusters.len());
        return ExitCode::SUCCESS;
    }

    if let Err(e) = logging::init_logging(&config.observability) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?cli.config, "vcluster-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = match ProxyServer::start(config, Arc::clone(&filters)).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start proxy");
            return ExitCode::FAILURE;
        }
    };

    let (watcher, mut updates) = ConfigWatcher::new(&cli.config, Arc::clone(&filters));
    let _watcher = if cli.watch {
        match watcher.run() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "Config watcher unavailable, reload with SIGHUP");
                None
            }
        }
    } else {
        None
    };

    loop {
        tokio::select! {
            signal = wait_for_signal() => match signal {
                Ok(SignalEvent::Shutdown) => break,
                Ok(SignalEvent::Reload) => match load_config_with(&cli.config, &filters) {
                    Ok(config) => reload(&server, config).await,
                    Err(e) => tracing::error!(error = %e, "Failed to reload config, keeping current configuration"),
                },
                Err(e) => {
                    tracing::error!(error = %e, "Signal handling failed");
                    break;
                }
            },
            Some(config) = updates.recv() => reload(&server, config).await,
        }
    }

    let grace = server.config().network.shutdown_grace_period();
    server.shutdown(grace).await;
    tracing::info!("Shutdown complete");
    ExitCode::SUCCESS
}

async fn reload(server: &ProxyServer, config: vcluster_proxy::ProxyConfig) {
    match server.apply_config(config).await {
        Ok(()) => tracing::info!(endpoints = server.listening_endpoints().len(), "Configuration reloaded"),
        Err(e) => tracing::error!(error = %e, "Configuration partially applied"),
    }
}
