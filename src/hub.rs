//! The connection broker.
//!
//! The hub pairs controller clients with simulation servers, keeps the
//! live-server directory, and relays frames between the two sides without
//! ever parsing a payload after the handshake. Simulation state never
//! lives here; a hub can be restarted and every participant simply
//! reconnects.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::{Path, State, WebSocketUpgrade, ws::WebSocket},
    http::{HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::session::{ENDPOINT_UNAVAILABLE, NORMAL_CLOSURE, PROTOCOL_ERROR, Session};
use crate::static_data::StaticData;

/// One handshake-complete server and its attached clients.
struct ServerEntry {
    name: String,
    session: Arc<Session>,
    clients: DashMap<Uuid, Arc<Session>>,
}

/// Directory row returned by `GET /servers`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub id: Uuid,
    pub name: String,
}

pub struct Hub {
    servers: DashMap<Uuid, Arc<ServerEntry>>,
    /// Bumped on every directory mutation; clients poll `/cache/servers`
    /// against it to decide whether to refetch the list.
    directory_stamp: Mutex<DateTime<Utc>>,
    static_data: StaticData,
}

impl Hub {
    pub fn new(static_data: StaticData) -> Arc<Hub> {
        Arc::new(Hub {
            servers: DashMap::new(),
            directory_stamp: Mutex::new(Utc::now()),
            static_data,
        })
    }

    /// Consistent snapshot of the live-server directory.
    pub fn directory(&self) -> Vec<ServerInfo> {
        self.servers
            .iter()
            .map(|entry| ServerInfo {
                id: *entry.key(),
                name: entry.value().name.clone(),
            })
            .collect()
    }

    fn touch_directory(&self) {
        *self.directory_stamp.lock().unwrap() = Utc::now();
    }

    fn directory_stamp(&self) -> DateTime<Utc> {
        *self.directory_stamp.lock().unwrap()
    }
}

/// Run the hub's HTTP + WebSocket surface until `shutdown` resolves.
pub async fn serve(
    hub: Arc<Hub>,
    interface: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("{interface}:{port}"))
        .await
        .with_context(|| format!("bind {interface}:{port}"))?;
    info!("Hub listening on http://{interface}:{port}");

    axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown)
        .await
        .context("hub server failed")
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/servers", get(list_servers))
        .route("/connect", get(connect_server))
        .route("/connect/{server_id}", get(connect_client))
        .route("/cache/servers", get(directory_stamp))
        .route("/cache/{resource}", get(resource_stamp))
        .route("/{resource}", get(resource_bytes))
        .with_state(hub)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(CorsLayer::permissive())
}

// Middleware for request logging with correlation ID
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let start_time = Instant::now();

    let response = next.run(request).await;
    let duration = start_time.elapsed();

    info!(
        "{} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        response.status().as_u16(),
        duration.as_secs_f64() * 1000.0
    );

    response
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn list_servers(State(hub): State<Arc<Hub>>) -> Json<Vec<ServerInfo>> {
    Json(hub.directory())
}

async fn directory_stamp(State(hub): State<Arc<Hub>>) -> Json<String> {
    Json(hub.directory_stamp().to_rfc3339())
}

async fn resource_stamp(
    State(hub): State<Arc<Hub>>,
    Path(resource): Path<String>,
) -> Response {
    let Some(resource) = hub.static_data.get(&resource) else {
        return json_error(StatusCode::NOT_FOUND, "unknown resource");
    };
    match resource.last_write().await {
        Ok(stamp) => Json(stamp.to_rfc3339()).into_response(),
        Err(error) => {
            warn!(%error, "Failed to stat static resource");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "resource unavailable")
        }
    }
}

async fn resource_bytes(
    State(hub): State<Arc<Hub>>,
    Path(resource): Path<String>,
) -> Response {
    let Some(resource) = hub.static_data.get(&resource) else {
        return json_error(StatusCode::NOT_FOUND, "unknown resource");
    };
    let stamp = match resource.last_write().await {
        Ok(stamp) => stamp,
        Err(error) => {
            warn!(%error, "Failed to stat static resource");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "resource unavailable");
        }
    };
    match resource.bytes().await {
        Ok(bytes) => {
            let mut headers = HeaderMap::new();
            headers.insert("content-type", resource.content_type().parse().unwrap());
            headers.insert(
                "last-modified",
                stamp
                    .format("%a, %d %b %Y %H:%M:%S GMT")
                    .to_string()
                    .parse()
                    .unwrap(),
            );
            (StatusCode::OK, headers, bytes).into_response()
        }
        Err(error) => {
            warn!(%error, "Failed to read static resource");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "resource unavailable")
        }
    }
}

async fn connect_server(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| server_session(hub, socket))
}

async fn connect_client(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    Path(server_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| client_session(hub, server_id, socket))
}

/// Handshake and lifetime of one server session.
///
/// After handshake every frame the server sends is fanned out to every
/// client currently attached to it; payloads are never inspected.
async fn server_session(hub: Arc<Hub>, socket: WebSocket) {
    let session = Session::spawn(socket);
    let guid = session.id();

    if session.send_text(guid.to_string()).is_err() {
        return;
    }
    let reply = match session.intercept_next_text().await {
        Ok(reply) => reply,
        Err(_) => return,
    };
    let Some((echoed, name)) = reply.split_once('|') else {
        warn!(session = %guid, "Malformed server handshake");
        session.dispose(PROTOCOL_ERROR, "malformed handshake");
        return;
    };
    if echoed != guid.to_string() {
        warn!(session = %guid, "Server handshake echoed a foreign guid");
        session.dispose(PROTOCOL_ERROR, "guid mismatch");
        return;
    }

    let entry = Arc::new(ServerEntry {
        name: name.to_string(),
        session: session.clone(),
        clients: DashMap::new(),
    });
    hub.servers.insert(guid, entry.clone());
    hub.touch_directory();
    info!(server = %guid, name = %entry.name, "Server registered");
    metrics::gauge!("hub.servers.connected").increment(1.0);

    let (text_tx, text_rx) = flume::unbounded::<String>();
    session.set_text_sink(text_tx);
    let (binary_tx, binary_rx) = flume::unbounded::<Vec<u8>>();
    session.set_binary_sink(binary_tx);

    loop {
        tokio::select! {
            frame = text_rx.recv_async() => match frame {
                Ok(frame) => {
                    for client in entry.clients.iter() {
                        let _ = client.send_text(frame.clone());
                    }
                    metrics::counter!("hub.frames.fanned_out").increment(entry.clients.len() as u64);
                }
                Err(_) => break,
            },
            frame = binary_rx.recv_async() => match frame {
                Ok(frame) => {
                    for client in entry.clients.iter() {
                        let _ = client.send_binary(frame.clone());
                    }
                }
                Err(_) => break,
            },
            _ = session.closed() => break,
        }
    }

    hub.servers.remove(&guid);
    hub.touch_directory();
    for client in entry.clients.iter() {
        client.dispose(NORMAL_CLOSURE, "server disconnected");
    }
    entry.clients.clear();
    session.dispose(NORMAL_CLOSURE, "server session ended");
    metrics::gauge!("hub.servers.connected").decrement(1.0);
    info!(server = %guid, "Server unregistered");
}

/// Lifetime of one client session: every frame it sends is forwarded
/// verbatim to the server named in the connect path.
async fn client_session(hub: Arc<Hub>, server_id: String, socket: WebSocket) {
    let session = Session::spawn(socket);

    let entry = Uuid::parse_str(&server_id)
        .ok()
        .and_then(|id| hub.servers.get(&id).map(|entry| entry.value().clone()));
    let Some(entry) = entry else {
        info!(%server_id, "Client connected to unknown server");
        session.dispose(ENDPOINT_UNAVAILABLE, "unknown server");
        return;
    };

    let client_id = session.id();
    entry.clients.insert(client_id, session.clone());
    metrics::gauge!("hub.clients.connected").increment(1.0);
    info!(client = %client_id, server = %entry.session.id(), "Client attached");

    let (text_tx, text_rx) = flume::unbounded::<String>();
    session.set_text_sink(text_tx);
    let (binary_tx, binary_rx) = flume::unbounded::<Vec<u8>>();
    session.set_binary_sink(binary_tx);

    loop {
        tokio::select! {
            frame = text_rx.recv_async() => match frame {
                Ok(frame) => {
                    if entry.session.send_text(frame).is_err() {
                        break;
                    }
                    metrics::counter!("hub.frames.relayed").increment(1);
                }
                Err(_) => break,
            },
            frame = binary_rx.recv_async() => match frame {
                Ok(frame) => {
                    if entry.session.send_binary(frame).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            _ = session.closed() => break,
        }
    }

    entry.clients.remove(&client_id);
    // No-op when the client hung up itself; closes the socket when the
    // loop ended because its server went away
    session.dispose(NORMAL_CLOSURE, "server disconnected");
    metrics::gauge!("hub.clients.connected").decrement(1.0);
    info!(client = %client_id, "Client detached");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hub_has_empty_directory() {
        let hub = Hub::new(StaticData::default());
        assert!(hub.directory().is_empty());
    }

    #[test]
    fn directory_stamp_moves_forward_on_mutation() {
        let hub = Hub::new(StaticData::default());
        let before = hub.directory_stamp();
        std::thread::sleep(std::time::Duration::from_millis(2));
        hub.touch_directory();
        assert!(hub.directory_stamp() > before);
    }
}
