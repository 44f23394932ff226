use anyhow::Result;
use kube::Client;
use lbsync_core::memory::MemoryEndpoints;
use lbsync_core::{
    BackendStore, EndpointSource, EndpointSync, EndpointVipWriter, GatewaySet, Reconciler,
    ServiceProjector, SyncMetrics,
};
use lbsync_nbctl::{NbctlClient, NbctlStore};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod events;
mod handler;
mod metrics_server;
mod service_controller;

use config::ControllerConfig;
use events::KubeEventRecorder;
use handler::ServiceHandler;
use service_controller::ServiceController;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting lbsync-controller...");

    let config = ControllerConfig::from_env()?;
    info!(?config, "Loaded configuration");

    let client = Client::try_default().await?;
    let metrics = SyncMetrics::new()?;

    let nbctl = NbctlClient::new(&config.nbctl_path, config.nbctl_timeout);
    let nbctl_store = Arc::new(NbctlStore::new(Arc::new(nbctl), config.port_group.clone()));
    let store: Arc<dyn BackendStore> = nbctl_store.clone();
    let gateways: Arc<dyn GatewaySet> = nbctl_store;

    let endpoints = MemoryEndpoints::new();
    let source: Arc<dyn EndpointSource> = Arc::new(endpoints.clone());
    let endpoint_sync: Arc<dyn EndpointSync> = Arc::new(EndpointVipWriter::new(
        store.clone(),
        gateways.clone(),
        source.clone(),
        metrics.clone(),
    ));

    let projector = ServiceProjector::new(
        store.clone(),
        gateways.clone(),
        endpoint_sync.clone(),
        Arc::new(KubeEventRecorder::new(client.clone())),
        config.projector(),
        metrics.clone(),
    );
    let reconciler = Reconciler::new(store, gateways, source.clone(), metrics.clone());
    let handler = ServiceHandler::new(projector, reconciler, source, endpoint_sync);

    let synced = Arc::new(AtomicBool::new(false));

    let metrics_addr = config.metrics_addr;
    let metrics_synced = synced.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics_server::serve(metrics_addr, metrics, metrics_synced).await {
            error!("Metrics server error: {}", e);
        }
    });

    let controller = ServiceController::new(
        client,
        handler,
        endpoints,
        config.resync_interval,
        synced,
    );
    tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!("Service controller error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");

    Ok(())
}
