use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod admin;
mod config;
mod error;
mod lb;
mod proxy;
mod service;

use admin::AdminApi;
use proxy::ProxyServer;
use service::ServiceManager;

/// Grace period for in-flight requests on shutdown
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "relaypool")]
#[command(version, about = "Multi-tenant HTTP reverse proxy and load balancer", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_from_yaml(&cli.config)?;
    let admin_port = config.admin_port;

    let manager = Arc::new(ServiceManager::new(config)?);
    manager.start_health_checks();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(port) = admin_port {
        let api = Arc::new(AdminApi::new(Arc::clone(&manager)));
        let admin_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = api.run(port, admin_shutdown).await {
                error!("admin api failed: {:#}", e);
            }
        });
    }

    let server = Arc::new(ProxyServer::new(Arc::clone(&manager))?);
    let mut server_task = tokio::spawn(Arc::clone(&server).run(shutdown_rx));

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, starting graceful shutdown");
                break;
            }
            _ = terminate.recv() => {
                info!("terminate received, starting graceful shutdown");
                break;
            }
            _ = hangup.recv() => {
                info!("reload signal received");
                match config::load_from_yaml(&cli.config) {
                    Ok(new_config) => {
                        if let Err(e) = manager.apply(new_config) {
                            error!("reload rejected, keeping current config: {:#}", e);
                        }
                    }
                    Err(e) => error!("reload rejected, keeping current config: {:#}", e),
                }
            }
            result = &mut server_task => {
                // Listener failed before any shutdown was requested
                manager.shutdown();
                return result?;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    manager.shutdown();
    server.wait_for_drain(SHUTDOWN_DEADLINE).await;
    info!("shutdown complete");

    Ok(())
}
