// Meshvault — peer-to-peer content-sharing network.
//
// Boots one peer: loads config, wires the five core components (ring lives
// inside membership, object store, membership, replication, strategy),
// starts the request surface, and launches the background scheduler (join,
// gossip, failure detection, anti-entropy). A SIGINT/SIGTERM runs graceful
// leave once before exit.

use anyhow::Result;
use meshvault_api::{AppState, MeshvaultServer};
use meshvault_core::MeshvaultConfig;
use meshvault_membership::Membership;
use meshvault_replication::ReplicationEngine;
use meshvault_store::ObjectStore;
use meshvault_strategy::Strategy;
use meshvault_transport::PeerClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("meshvault=info".parse()?))
        .init();

    let config = MeshvaultConfig::load().await?;
    info!(self_id = %config.self_id, mode = ?config.mode, "starting meshvault peer");

    let store = Arc::new(ObjectStore::new(&config.data_dir));
    store.ensure_dir().await?;

    let client = PeerClient::new();
    let membership = Arc::new(Membership::new(
        config.self_id.clone(),
        config.known_peers.clone(),
        config.replicas,
        client.clone(),
    ));
    let replication = Arc::new(ReplicationEngine::new(
        config.self_id.clone(),
        config.replication_factor,
        client.clone(),
    ));
    let strategy = Arc::new(Strategy::for_mode(config.mode));

    let state = AppState {
        self_id: config.self_id.clone(),
        mode: config.mode,
        chunk_size: config.chunk_size,
        store: Arc::clone(&store),
        membership: Arc::clone(&membership),
        replication: Arc::clone(&replication),
        strategy: Arc::clone(&strategy),
        client: client.clone(),
    };

    let bind_addr = config
        .self_id
        .parse()
        .map_err(|e| anyhow::anyhow!("self_id {:?} is not a valid bind address: {e}", config.self_id))?;
    MeshvaultServer::new(bind_addr, state).start().await?;

    spawn_background_scheduler(Arc::clone(&membership), Arc::clone(&store), Arc::clone(&replication), &config);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, starting graceful leave");
    let outcome = membership
        .graceful_leave(&store, meshvault_strategy::placement_key_of)
        .await;
    info!(manifests_moved = outcome.manifests_moved, isolated = outcome.isolated, "graceful leave complete");

    Ok(())
}

/// Launches the four independent periodic tasks of §4.7. None may block
/// another; each owns its own `tokio::spawn`'d loop.
fn spawn_background_scheduler(
    membership: Arc<Membership>,
    store: Arc<ObjectStore>,
    replication: Arc<ReplicationEngine>,
    config: &MeshvaultConfig,
) {
    let rejoin_membership = Arc::clone(&membership);
    tokio::spawn(async move {
        rejoin_membership.attempt_rejoin(6, Duration::from_secs(5)).await;
    });

    let gossip_membership = Arc::clone(&membership);
    let gossip_interval = Duration::from_secs(config.ring_refresh_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gossip_interval);
        loop {
            ticker.tick().await;
            gossip_membership.gossip_tick().await;
        }
    });

    let detector_membership = Arc::clone(&membership);
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs);
    let failure_timeout = Duration::from_secs(config.failure_timeout_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            detector_membership.failure_detector_tick(failure_timeout).await;
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(meshvault_replication::anti_entropy_jitter()).await;
            replication
                .anti_entropy_tick(&membership, &store, meshvault_strategy::placement_key_of)
                .await;
        }
    });
}

/// Waits for either SIGINT (Ctrl+C) or SIGTERM, whichever arrives first.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl_c");
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
