//! condenserd, the control-plane daemon.
//!
//! Serves the control API and the droplet hook endpoint. The hook
//! endpoint binds to the host interface discovered through the IPAM
//! store, so in-container curl callbacks can reach it over the bridge.

use condenser::api::{api_router, hook_router, AppState};
use condenser::constants::HOOK_PORT;
use condenser::fs::StdFilesystem;
use condenser::ilm::IlmStore;
use condenser::registry::RegistryClient;
use condenser::runtime::DropletCli;
use condenser::network::IptablesNetwork;
use condenser::{Config, ContainerService, HookService, ImageService, IpamStore, Result};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "condenser=info,condenserd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run().await {
        error!("condenserd failed: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    info!(api_addr = %config.api_addr, "starting condenserd");

    let fs = Arc::new(StdFilesystem);

    let ipam_store = Arc::new(IpamStore::new(&config.ipam_state_path));
    ipam_store.set_config()?;

    let ilm = Arc::new(IlmStore::new(&config.ilm_state_path));
    let registry = Arc::new(RegistryClient::new(&config.image_root));
    let runtime = Arc::new(DropletCli::new(&config.droplet_binary));
    let network = Arc::new(IptablesNetwork::new(Arc::clone(&ipam_store)));

    let state = AppState {
        containers: Arc::new(ContainerService::new(
            config.clone(),
            fs,
            runtime,
            network,
            Arc::clone(&ipam_store),
            Arc::clone(&ilm),
        )),
        images: Arc::new(ImageService::new(registry, ilm)),
        hooks: Arc::new(HookService::new()),
    };

    // the hook endpoint sits on the host interface so in-container curl
    // callbacks can reach it
    let hook_ip = ipam_store.default_interface_addr()?;
    let hook_ip = hook_ip.split('/').next().unwrap_or(&hook_ip).to_string();
    let hook_addr: SocketAddr =
        format!("{hook_ip}:{HOOK_PORT}")
            .parse()
            .map_err(|_| condenser::Error::Config {
                reason: format!("hook bind address unusable: {hook_ip}:{HOOK_PORT}"),
            })?;

    let api_listener = TcpListener::bind(config.api_addr).await?;
    let hook_listener = TcpListener::bind(hook_addr).await?;
    info!(%hook_addr, "hook endpoint bound");

    let api = axum::serve(api_listener, api_router(state.clone()));
    let hooks = axum::serve(hook_listener, hook_router(state));

    tokio::try_join!(api.into_future(), hooks.into_future())?;
    Ok(())
}
