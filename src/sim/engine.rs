//! A simulation server process: owns the authoritative store, drives the
//! pump, and speaks the wire protocol over its hub link.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::{AircraftUpdate, AuthoritativeUpdate, ControllerUpdate, NetworkMessage};
use crate::session::{NORMAL_CLOSURE, Session};
use crate::sim::planner::Planner;
use crate::sim::plugin::ServerHandle;
use crate::sim::pump::{Pump, PluginRegistry};
use crate::sim::store::{ControllerChange, Store};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hub base URL, e.g. `ws://127.0.0.1:8000`.
    pub hub_url: String,
    /// Human name published in the hub directory.
    pub name: String,
    /// Directories scanned for bridge plugin modules.
    pub plugin_dirs: Vec<PathBuf>,
    pub tick_interval: Duration,
    pub commit_interval: Duration,
    pub resync_interval: Duration,
    /// Controllers silent for longer than this are swept at resync time.
    pub stale_controller_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            hub_url: "ws://127.0.0.1:8000".to_string(),
            name: "Training Server".to_string(),
            plugin_dirs: Vec::new(),
            tick_interval: Duration::from_millis(100),
            commit_interval: Duration::from_secs(1),
            resync_interval: Duration::from_secs(30),
            stale_controller_after: Duration::from_secs(90),
        }
    }
}

/// Run one server process until the hub link dies or `cancel` fires.
///
/// Reconnection is the operator's problem: state is in-memory only, and
/// the protocol is idempotent across a restart (clients re-announce, the
/// server re-sends authoritative snapshots).
pub async fn run(
    config: EngineConfig,
    registry: PluginRegistry,
    cancel: CancellationToken,
) -> Result<()> {
    let url = format!("{}/connect", config.hub_url.trim_end_matches('/'));
    let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("connect to hub at {url}"))?;
    let session = Session::spawn(socket);

    // The hub leads with our assigned identity; echo it with our name
    let assigned = session
        .intercept_next_text()
        .await
        .context("hub link closed during handshake")?;
    let server_id = Uuid::parse_str(assigned.trim()).context("hub sent a malformed identity")?;
    session.send_text(format!("{server_id}|{}", config.name))?;
    info!(server = %server_id, name = %config.name, "Registered with hub");

    let store = Store::new();
    let planner = Arc::new(tokio::sync::Mutex::new(Planner::new()));
    let (outbound_tx, outbound_rx) = flume::unbounded::<NetworkMessage>();
    let handle = ServerHandle::new(server_id, store.clone(), outbound_tx.clone(), planner.clone());

    let pump_cancel = cancel.child_token();
    let pump = Pump::new(
        store.clone(),
        handle.clone(),
        planner,
        registry,
        config.plugin_dirs.clone(),
        config.tick_interval,
        pump_cancel.clone(),
    )
    .await
    .context("plugin pump startup failed")?;
    tokio::spawn(pump.clone().run());

    let (inbound_tx, inbound_rx) = flume::unbounded::<String>();
    session.set_text_sink(inbound_tx);

    let mut commit = tokio::time::interval(config.commit_interval);
    let mut resync = tokio::time::interval(config.resync_interval);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = session.closed() => break Err(anyhow::anyhow!("hub link lost")),
            frame = inbound_rx.recv_async() => match frame {
                Ok(frame) => handle_frame(&frame, &store, &pump, &outbound_tx).await,
                Err(_) => break Err(anyhow::anyhow!("hub link lost")),
            },
            message = outbound_rx.recv_async() => {
                // Single writer keeps per-session ordering intact
                let Ok(message) = message else { break Ok(()) };
                if session.send_text(message.encode()).is_err() {
                    break Err(anyhow::anyhow!("hub link lost"));
                }
            }
            _ = commit.tick() => {
                let emitted = store.commit_batch().await;
                metrics::counter!("sim.commits").increment(1);
                for update in emitted {
                    let _ = outbound_tx.send(NetworkMessage::AircraftUpdate(update));
                }
            }
            _ = resync.tick() => {
                sweep_stale_controllers(&store, config.stale_controller_after, &outbound_tx).await;
                resync_controllers(&store, &outbound_tx).await;
            }
        }
    };

    pump_cancel.cancel();
    session.dispose(NORMAL_CLOSURE, "server shutting down");
    result
}

/// Inbound policy: controllers may announce themselves, chat, and kill
/// aircraft. Everything else is the server's own business and is dropped.
async fn handle_frame(
    frame: &str,
    store: &Arc<Store>,
    pump: &Arc<Pump>,
    outbound: &flume::Sender<NetworkMessage>,
) {
    match NetworkMessage::decode(frame) {
        NetworkMessage::ControllerUpdate(update) => {
            handle_controller_update(update, store, outbound).await;
        }
        NetworkMessage::Text(message) => {
            pump.dispatch_text(message.from, message.to, &message.message)
                .await;
        }
        NetworkMessage::Channel(message) => {
            pump.dispatch_text(message.from, message.to(), &message.message)
                .await;
        }
        NetworkMessage::Kill(kill) => {
            info!(victim = %kill.victim, "Kill requested");
            store.queue_update(AircraftUpdate::delete(kill.victim)).await;
        }
        NetworkMessage::AircraftUpdate(update) => {
            warn!(aircraft = %update.aircraft, "Client sent an aircraft update; dropped");
            metrics::counter!("sim.inbound.rejected").increment(1);
        }
        NetworkMessage::Authoritative(_) => {
            warn!("Client sent an authoritative update; dropped");
            metrics::counter!("sim.inbound.rejected").increment(1);
        }
        NetworkMessage::Unknown => {
            metrics::counter!("sim.inbound.unknown").increment(1);
        }
    }
}

async fn handle_controller_update(
    update: ControllerUpdate,
    store: &Arc<Store>,
    outbound: &flume::Sender<NetworkMessage>,
) {
    if update.is_delete() {
        if store.remove_controller(update.controller).await.is_some() {
            info!(controller = %update.controller, "Controller signed off");
            let _ = outbound.send(NetworkMessage::ControllerUpdate(update));
        }
        return;
    }

    match store.upsert_controller(&update).await {
        ControllerChange::Created => {
            info!(controller = %update.controller, "Controller joined");
            metrics::gauge!("sim.controllers.connected").increment(1.0);
            let recipient = update.controller;
            // Everyone hears the announcement, the newcomer gets the world
            let _ = outbound.send(NetworkMessage::ControllerUpdate(update));
            let snapshot = authoritative_for(store, recipient).await;
            let _ = outbound.send(NetworkMessage::Authoritative(snapshot));
        }
        ControllerChange::Updated => {
            let _ = outbound.send(NetworkMessage::ControllerUpdate(update));
        }
        ControllerChange::Ignored => {
            warn!(controller = %update.controller, "Dropped partial announcement for unknown controller");
        }
    }
}

async fn authoritative_for(store: &Arc<Store>, recipient: Uuid) -> AuthoritativeUpdate {
    let controllers = store.controllers_snapshot().await;
    let aircraft = store.aircraft_snapshot().await;
    AuthoritativeUpdate {
        recipient,
        controllers: controllers
            .iter()
            .map(|(id, controller)| ControllerUpdate::full(*id, controller))
            .collect(),
        aircraft: aircraft
            .iter()
            .map(|(id, aircraft)| AircraftUpdate::full(*id, aircraft))
            .collect(),
    }
}

/// Push a complete snapshot to every connected controller.
async fn resync_controllers(store: &Arc<Store>, outbound: &flume::Sender<NetworkMessage>) {
    let controllers = store.controllers_snapshot().await;
    for id in controllers.keys() {
        let snapshot = authoritative_for(store, *id).await;
        let _ = outbound.send(NetworkMessage::Authoritative(snapshot));
    }
    metrics::counter!("sim.resyncs").increment(1);
}

/// The hub does not tell us when a client dies; controllers that stopped
/// announcing themselves are dropped here instead.
async fn sweep_stale_controllers(
    store: &Arc<Store>,
    stale_after: Duration,
    outbound: &flume::Sender<NetworkMessage>,
) {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::seconds(90));
    for id in store.stale_controllers(cutoff).await {
        if store.remove_controller(id).await.is_some() {
            info!(controller = %id, "Swept stale controller");
            metrics::gauge!("sim.controllers.connected").decrement(1.0);
            let _ = outbound.send(NetworkMessage::ControllerUpdate(ControllerUpdate::delete(id)));
        }
    }
}
