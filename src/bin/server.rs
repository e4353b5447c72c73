// NMOS node server
// Wires the stores, behaviour tasks and HTTP surface together
// Run with: cargo run --bin server [settings.json]

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nmos_node::activation::{
    channelmapping_activation_task, connection_activation_task, ConnectionActivationHandlers,
};
use nmos_node::api::{create_router, ApiState};
use nmos_node::authorization::{
    authorization_behaviour_task, token_issuer_helper_task, AuthorizationBehaviour,
    AuthorizationState, SigningKeys,
};
use nmos_node::dnssd::MemoryDnsSd;
use nmos_node::events::expiry::expiry_task;
use nmos_node::events::ws::{send_events_task, QueryWsConnections};
use nmos_node::registration::{node_behaviour_task, NodeBehaviour};
use nmos_node::{NodeModel, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings_file = std::env::args().nth(1);
    let settings = Settings::load(settings_file.as_deref())?;
    let listen_addr: std::net::SocketAddr =
        format!("0.0.0.0:{}", settings.http_port).parse()?;
    let client_authorization = settings.client_authorization;

    info!(node_id = %settings.node_id, "starting nmos node");

    let model = NodeModel::new(settings);
    let auth_state = AuthorizationState::new();
    let keys = Arc::new(SigningKeys::generate()?);
    let connections = QueryWsConnections::new();

    // a real deployment injects an mDNS responder here; the in-process
    // implementation serves single-host setups
    let dnssd = MemoryDnsSd::new();

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(node_behaviour_task(NodeBehaviour {
        model: model.clone(),
        auth_state: auth_state.clone(),
        discovery: dnssd.clone(),
        advertiser: dnssd.clone(),
    })));

    if client_authorization {
        tasks.push(tokio::spawn(authorization_behaviour_task(
            AuthorizationBehaviour {
                model: model.clone(),
                auth_state: auth_state.clone(),
                keys: keys.clone(),
                discovery: dnssd.clone(),
                open_browser: None,
            },
        )));
    }
    tasks.push(tokio::spawn(token_issuer_helper_task(
        model.clone(),
        auth_state.clone(),
    )));

    tasks.push(tokio::spawn(connection_activation_task(
        model.clone(),
        ConnectionActivationHandlers::default(),
    )));
    tasks.push(tokio::spawn(channelmapping_activation_task(model.clone())));

    tasks.push(tokio::spawn(send_events_task(
        model.clone(),
        connections.clone(),
    )));
    tasks.push(tokio::spawn(expiry_task(model.clone(), connections.clone())));

    let router = create_router(ApiState {
        model: model.clone(),
        auth_state,
        connections,
        keys,
    });

    // ctrl-c requests a controlled shutdown; the cancellation token unblocks
    // every task and drains the server
    tokio::spawn({
        let model = model.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, shutting down");
                model.controlled_shutdown();
            }
        }
    });

    info!(%listen_addr, "serving");
    let server = axum::Server::bind(&listen_addr)
        .serve(router.into_make_service())
        .with_graceful_shutdown({
            let model = model.clone();
            async move { model.shutdown.cancelled().await }
        });
    if let Err(e) = server.await {
        error!("server error: {}", e);
        model.controlled_shutdown();
    }

    for task in tasks {
        if let Err(e) = task.await {
            error!("task failed to join: {}", e);
        }
    }

    info!("clean shutdown");
    Ok(())
}
