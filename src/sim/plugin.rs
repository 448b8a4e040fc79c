//! The generic plugin contract and the server API handed to plugins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::aircraft::Aircraft;
use crate::controllers::Controller;
use crate::protocol::{
    AircraftUpdate, ChannelMessage, NetworkMessage, TextMessage, channel_recipient,
};
use crate::sim::instructions::Instruction;
use crate::sim::planner::Planner;
use crate::sim::store::Store;

/// External logic loaded into a server process and driven by the pump.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn maintainer(&self) -> &str;

    /// Called for every chat frame the server relays.
    async fn process_text_message(&self, sender: Uuid, recipient: Uuid, message: &str)
    -> Result<()>;

    /// Called once per pump tick with the elapsed wall time.
    async fn tick(&self, dt: Duration) -> Result<()>;
}

/// The simulation operations a plugin may perform.
///
/// Everything funnels into the batched store or the outbound message
/// queue; plugins never touch live state directly.
pub struct ServerHandle {
    session_id: Uuid,
    store: Arc<Store>,
    outbound: flume::Sender<NetworkMessage>,
    planner: Arc<tokio::sync::Mutex<Planner>>,
}

impl ServerHandle {
    pub fn new(
        session_id: Uuid,
        store: Arc<Store>,
        outbound: flume::Sender<NetworkMessage>,
        planner: Arc<tokio::sync::Mutex<Planner>>,
    ) -> Arc<ServerHandle> {
        Arc::new(ServerHandle {
            session_id,
            store,
            outbound,
            planner,
        })
    }

    /// Network identifier of the server session itself.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Spawn a new aircraft; takes effect at the next commit.
    pub async fn add_aircraft(&self, aircraft: Aircraft) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .queue_update(AircraftUpdate::full(id, &aircraft))
            .await;
        metrics::counter!("sim.aircraft.added").increment(1);
        id
    }

    /// Replace an aircraft's data. Returns false when the id is unknown.
    pub async fn update_aircraft(&self, id: Uuid, aircraft: Aircraft) -> bool {
        let Some(existing) = self.store.effective_aircraft().await.get(&id).cloned() else {
            return false;
        };
        let delta = AircraftUpdate::diff(id, &existing, &aircraft);
        if !delta.update.is_empty() {
            self.store.queue_update(delta).await;
        }
        true
    }

    /// Remove an aircraft by id. Returns false when the id is unknown.
    pub async fn remove_aircraft(&self, id: Uuid) -> bool {
        if !self.store.contains_aircraft(id).await {
            return false;
        }
        self.store.queue_update(AircraftUpdate::delete(id)).await;
        self.planner.lock().await.clear(id);
        metrics::counter!("sim.aircraft.removed").increment(1);
        true
    }

    /// Remove every aircraft flying `callsign`; returns their ids.
    pub async fn remove_aircraft_by_callsign(&self, callsign: &str) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .store
            .aircraft_by_callsign(callsign)
            .await
            .into_keys()
            .collect();
        for id in &ids {
            self.store.queue_update(AircraftUpdate::delete(*id)).await;
            self.planner.lock().await.clear(*id);
        }
        ids
    }

    pub async fn aircraft_by_callsign(&self, callsign: &str) -> HashMap<Uuid, Aircraft> {
        self.store.aircraft_by_callsign(callsign).await
    }

    /// Read-only aircraft view, pending mutations included.
    pub async fn aircraft(&self) -> HashMap<Uuid, Aircraft> {
        self.store.effective_aircraft().await
    }

    /// Read-only controller view.
    pub async fn controllers(&self) -> HashMap<Uuid, Controller> {
        self.store.controllers_snapshot().await
    }

    pub fn send_text_message(&self, from: Uuid, to: Uuid, message: &str) {
        self.send(NetworkMessage::Text(TextMessage {
            from,
            to,
            message: message.to_string(),
        }));
    }

    pub fn send_channel_message(&self, frequency: Decimal, message: &str) {
        debug!(%frequency, to = %channel_recipient(frequency), "Channel message");
        self.send(NetworkMessage::Channel(ChannelMessage {
            from: self.session_id,
            frequency,
            message: message.to_string(),
        }));
    }

    /// Replace an aircraft's instruction route.
    pub async fn assign_route(&self, aircraft: Uuid, route: Vec<Instruction>) {
        self.planner.lock().await.assign(aircraft, route);
    }

    /// Append one instruction to an aircraft's route.
    pub async fn enqueue_instruction(&self, aircraft: Uuid, instruction: Instruction) {
        self.planner.lock().await.enqueue(aircraft, instruction);
    }

    pub(crate) fn send(&self, message: NetworkMessage) {
        // A dead link just drops the frame; clients resync on reconnect
        let _ = self.outbound.send(message);
    }
}
