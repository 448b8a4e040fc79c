//! Full-stack scenario: a hub, one simulation server with an in-process
//! traffic plugin, and one controller client observing the update stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tracon::aircraft::{
    Aircraft, AircraftMetadata, AircraftMotion, AircraftState, FlightRules, Squawk, SquawkMode,
};
use tracon::controllers::{Controller, ControllerMetadata, ControllerState, FacilityType};
use tracon::geo::Coordinate;
use tracon::hub::{Hub, router};
use tracon::protocol::{ControllerUpdate, KillMessage, NetworkMessage, TextMessage};
use tracon::sim::{BuildContext, EngineConfig, Plugin, PluginRegistry, ServerHandle, engine};
use tracon::static_data::StaticData;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(15);

/// Injects one departure on its first tick and records relayed chat.
struct Departures {
    handle: Arc<ServerHandle>,
    spawned: AtomicBool,
    chat: flume::Sender<(Uuid, Uuid, String)>,
}

#[async_trait]
impl Plugin for Departures {
    fn name(&self) -> &str {
        "departures"
    }
    fn description(&self) -> &str {
        "injects a single departure"
    }
    fn maintainer(&self) -> &str {
        "tests"
    }

    async fn process_text_message(
        &self,
        sender: Uuid,
        recipient: Uuid,
        message: &str,
    ) -> Result<()> {
        let _ = self.chat.send((sender, recipient, message.to_string()));
        Ok(())
    }

    async fn tick(&self, _dt: Duration) -> Result<()> {
        if !self.spawned.swap(true, Ordering::SeqCst) {
            self.handle.add_aircraft(departure()).await;
        }
        Ok(())
    }
}

fn departure() -> Aircraft {
    Aircraft {
        time: Utc::now(),
        metadata: AircraftMetadata {
            callsign: "SWA2891".to_string(),
            origin: "KLAX".to_string(),
            destination: "KOAK".to_string(),
            rules: FlightRules::Ifr,
            aircraft_type: "B737".to_string(),
            route: "ORCKA3 SUMMR".to_string(),
            remarks: String::new(),
        },
        state: AircraftState {
            heading: 360.0,
            altitude: 9000.0,
            position: Coordinate::new(33.9425, -118.408056),
            squawk: Squawk {
                code: 0o4211,
                mode: SquawkMode::Altitude,
            },
        },
        motion: AircraftMotion {
            speed: 200,
            climb_rate: -10,
            turn_rate: 3.0,
            clockwise: true,
        },
    }
}

fn tower(antenna: Coordinate) -> Controller {
    Controller {
        time: Utc::now(),
        metadata: ControllerMetadata {
            facility: "LAX".to_string(),
            facility_type: FacilityType::Twr,
            discriminator: None,
        },
        state: ControllerState {
            radar_antennae: vec![antenna],
        },
    }
}

async fn start_stack() -> (
    Arc<Hub>,
    Uuid,
    flume::Receiver<(Uuid, Uuid, String)>,
    Socket,
) {
    let hub = Hub::new(StaticData::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = router(hub.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (chat_tx, chat_rx) = flume::unbounded();
    let mut registry = PluginRegistry::new();
    registry.register(
        "departures",
        Vec::new(),
        move |ctx: &BuildContext| Departures {
            handle: ctx.handle.clone(),
            spawned: AtomicBool::new(false),
            chat: chat_tx.clone(),
        },
    );

    let config = EngineConfig {
        hub_url: format!("ws://127.0.0.1:{port}"),
        name: "E2E Server".to_string(),
        tick_interval: Duration::from_millis(100),
        commit_interval: Duration::from_secs(1),
        ..EngineConfig::default()
    };
    tokio::spawn(engine::run(config, registry, CancellationToken::new()));

    // The server shows up in the directory once its handshake completes
    let server_id = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(info) = hub.directory().first() {
                return info.id;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("server never registered");

    let (socket, _) = connect_async(format!("ws://127.0.0.1:{port}/connect/{server_id}"))
        .await
        .unwrap();
    (hub, server_id, chat_rx, socket)
}

async fn next_message(socket: &mut Socket) -> NetworkMessage {
    loop {
        let frame = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed unexpectedly")
            .expect("socket errored");
        if let Message::Text(text) = frame {
            match NetworkMessage::decode(text.as_str()) {
                NetworkMessage::Unknown => continue,
                message => return message,
            }
        }
    }
}

async fn send(socket: &mut Socket, message: NetworkMessage) {
    socket
        .send(Message::Text(message.encode().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn server_streams_extrapolated_updates_and_honours_the_inbound_policy() {
    let (_hub, server_id, chat_rx, mut client) = start_stack().await;

    // 1. The plugin's departure reaches the client as a committed update
    //    whose state has been flown forward by the pump.
    let (aircraft_id, state) = tokio::time::timeout(WAIT, async {
        loop {
            // The very first commit can land before any extrapolation has
            // happened; wait for a state that has visibly flown forward.
            if let NetworkMessage::AircraftUpdate(update) = next_message(&mut client).await
                && let Some(state) = update.state
                && state.heading > 0.5
                && state.heading < 90.0
            {
                return (update.aircraft, state);
            }
        }
    })
    .await
    .expect("no extrapolated aircraft update arrived");

    assert!(state.position.latitude > 33.9425, "flying north-ish");
    // Heading and altitude both scale with the same elapsed time
    let turn_elapsed = state.heading / 3.0;
    let sink_elapsed = (9000.0 - state.altitude) / 10.0;
    assert!(
        (turn_elapsed - sink_elapsed).abs() < 0.5,
        "turn says {turn_elapsed}s, altitude says {sink_elapsed}s"
    );

    // 2. Announcing a controller earns an echo plus a complete snapshot.
    let controller_id = Uuid::new_v4();
    let announcement = ControllerUpdate::full(
        controller_id,
        &tower(Coordinate::new(33.9425, -118.408056)),
    );
    send(&mut client, NetworkMessage::ControllerUpdate(announcement)).await;

    tokio::time::timeout(WAIT, async {
        let mut echoed = false;
        loop {
            match next_message(&mut client).await {
                NetworkMessage::ControllerUpdate(update)
                    if update.controller == controller_id =>
                {
                    echoed = true;
                }
                NetworkMessage::Authoritative(snapshot)
                    if snapshot.recipient == controller_id =>
                {
                    assert!(echoed, "snapshot must follow the announcement echo");
                    assert!(
                        snapshot.aircraft.iter().any(|ac| ac.aircraft == aircraft_id),
                        "snapshot carries the full aircraft picture"
                    );
                    return;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("no authoritative snapshot arrived");

    // 3. Chat is dispatched to every enabled plugin.
    send(
        &mut client,
        NetworkMessage::Text(TextMessage {
            from: controller_id,
            to: server_id,
            message: "radio check".to_string(),
        }),
    )
    .await;
    let (sender, _, message) = tokio::time::timeout(WAIT, chat_rx.recv_async())
        .await
        .expect("plugin never saw the chat")
        .unwrap();
    assert_eq!(sender, controller_id);
    assert_eq!(message, "radio check");

    // 4. A kill schedules the delete into the next batch.
    send(
        &mut client,
        NetworkMessage::Kill(KillMessage {
            victim: aircraft_id,
        }),
    )
    .await;
    tokio::time::timeout(WAIT, async {
        loop {
            if let NetworkMessage::AircraftUpdate(update) = next_message(&mut client).await
                && update.aircraft == aircraft_id
                && update.is_delete()
            {
                return;
            }
        }
    })
    .await
    .expect("the kill never produced a delete");
}
