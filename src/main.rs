#![recursion_limit = "512"]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::info;

use omniwire::config::{CommandLine, ServiceConfig};
use omniwire::forward::ForwardRegistry;
use omniwire::store::Store;
use omniwire::wireguard::WireGuardManager;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = CommandLine::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let service_config = match args.command {
        Some(config) => config,
        None => bail!("No configuration provided. Use the 'serve' subcommand."),
    };

    let ServiceConfig::Serve {
        db,
        wg_interface,
        wg_listen_port,
    } = service_config;

    let store = Arc::new(Store::open(&db)?);
    info!(db = %db, "store opened");

    let forward_registry = ForwardRegistry::new(store.clone());
    let wireguard_manager = Arc::new(WireGuardManager::new(store.clone()));
    wireguard_manager.initialize().await?;

    let mut wg_cfg = store.get_wireguard_config().await?;
    wg_cfg.interface_name = wg_interface;
    wg_cfg.listen_port = wg_listen_port;
    store.update_wireguard_config(&wg_cfg).await?;

    forward_registry.init_forward_rules().await?;
    info!("forward rules initialized");

    if wg_cfg.auto_start {
        match wireguard_manager.start().await {
            Ok(()) => info!(interface = %wg_cfg.interface_name, "wireguard runtime auto-started"),
            Err(e) => tracing::warn!(error = %e, "wireguard auto-start failed"),
        }
    }

    wait_for_shutdown().await;

    info!("shutting down");
    let rules = forward_registry.list().await?;
    for rule in rules.into_iter().filter(|r| r.running) {
        forward_registry.stop(rule.id).await?;
    }
    wireguard_manager.stop().await?;

    Ok(ExitCode::SUCCESS)
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            info!("received Ctrl+C");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
