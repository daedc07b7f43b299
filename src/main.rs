//! Tether - long-lived WebSocket sessions per user and proxy

use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tether::{
    config::Args,
    connectivity::ConnectivityMonitor,
    controller::SessionController,
    identity::{FileStore, IdentityStore},
    logging,
    transport::WsConnector,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args.log_level, args.log_format);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let identities = args.identities()?;
    let endpoint = args.endpoint_url().map_err(anyhow::Error::msg)?;

    info!("======================================");
    info!("  Tether");
    info!("======================================");
    info!("Endpoint: {}", endpoint);
    info!(
        "TLS: verify={}, server name={}",
        args.tls_verify,
        args.tls_server_name.as_deref().unwrap_or("<endpoint host>")
    );
    info!("Users: {}", args.user_ids.len());
    info!(
        "Proxies: {}",
        args.proxy_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none (direct)".to_string())
    );
    info!("Identities: {}", identities.len());
    info!("Data dir: {}", args.data_dir.display());
    info!("Heartbeat: every {}s", args.ping_interval_secs);
    info!(
        "Admission limit: {}",
        args.max_active
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unlimited".to_string())
    );
    info!("======================================");

    let store = IdentityStore::new(Arc::new(FileStore::new(&args.data_dir)));

    let connector = WsConnector::new(
        endpoint,
        args.tls_policy(),
        vec![("User-Agent".to_string(), args.user_agent.clone())],
        args.connect_timeout(),
    )?;

    let monitor = ConnectivityMonitor::new(args.probe_config())?;

    let controller = SessionController::new(
        store,
        Arc::new(connector),
        Arc::new(monitor),
        args.profile(),
        args.supervisor_config(),
        args.controller_config(),
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, closing sessions");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    controller.run(identities, cancel).await;

    info!("Tether stopped");
    Ok(())
}
