//! Line-JSON bridge to an external plugin process.
//!
//! Each discovered module is spawned as a child process speaking one JSON
//! object per line over stdin/stdout, discriminated by a `$` field. The
//! host drives the child with `init`/`sync`/`tick`/`pm`; the child calls
//! back with `txt`/`addac`/`delac`; malformed child lines are answered
//! with an `err` frame instead of killing the process.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aircraft::Aircraft;
use crate::controllers::Controller;
use crate::sim::plugin::{Plugin, ServerHandle};

/// How often the child gets a fresh authoritative snapshot.
const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Host → child frames.
#[derive(Debug, Serialize)]
#[serde(tag = "$")]
enum HostFrame<'a> {
    #[serde(rename = "init")]
    Init { server: Uuid },
    #[serde(rename = "sync")]
    Sync {
        aircraft: &'a HashMap<Uuid, Aircraft>,
        controllers: &'a HashMap<Uuid, Controller>,
    },
    #[serde(rename = "tick")]
    Tick { dt: f64 },
    #[serde(rename = "pm")]
    Pm {
        from: Uuid,
        to: Uuid,
        message: &'a str,
    },
    #[serde(rename = "acadded")]
    AircraftAdded { aircraft: Uuid },
    #[serde(rename = "err")]
    Error { msg: String },
}

/// Child → host frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "$")]
enum ChildFrame {
    #[serde(rename = "txt")]
    Text {
        #[serde(default)]
        from: Option<Uuid>,
        to: Uuid,
        message: String,
    },
    #[serde(rename = "addac")]
    AddAircraft { aircraft: Aircraft },
    #[serde(rename = "delac")]
    RemoveAircraft { aircraft: Uuid },
}

pub struct BridgePlugin {
    name: String,
    stdin: Mutex<ChildStdin>,
    /// Last time the child was synced, checked from the tick path.
    last_sync: Mutex<Option<tokio::time::Instant>>,
    handle: Arc<ServerHandle>,
}

impl BridgePlugin {
    /// Spawn the module at `path` and wire its pipes. The returned token
    /// tears the child down when the pump unloads the module.
    pub async fn spawn(
        path: &Path,
        handle: Arc<ServerHandle>,
    ) -> Result<(Arc<BridgePlugin>, CancellationToken)> {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bridge".to_string());

        let mut child = Command::new(path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", path.display()))?;

        let stdin = child
            .stdin
            .take()
            .context("bridge child has no stdin pipe")?;
        let stdout = child
            .stdout
            .take()
            .context("bridge child has no stdout pipe")?;

        let plugin = Arc::new(BridgePlugin {
            name,
            stdin: Mutex::new(stdin),
            last_sync: Mutex::new(None),
            handle: handle.clone(),
        });

        plugin
            .write_frame(&HostFrame::Init {
                server: handle.session_id(),
            })
            .await?;

        let cancel = CancellationToken::new();
        tokio::spawn(read_child(
            plugin.clone(),
            child,
            BufReader::new(stdout),
            cancel.clone(),
        ));

        Ok((plugin, cancel))
    }

    async fn write_frame(&self, frame: &HostFrame<'_>) -> Result<()> {
        // Host frames serialise infallibly; the pipe write is the risk
        let mut line = serde_json::to_string(frame).unwrap();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("write to bridge child")?;
        stdin.flush().await.context("flush bridge child")
    }

    async fn sync_child(&self) -> Result<()> {
        let aircraft = self.handle.aircraft().await;
        let controllers = self.handle.controllers().await;
        self.write_frame(&HostFrame::Sync {
            aircraft: &aircraft,
            controllers: &controllers,
        })
        .await
    }
}

/// Reader task: one child line per protocol frame until the child exits
/// or the module is unloaded.
async fn read_child(
    plugin: Arc<BridgePlugin>,
    mut child: Child,
    stdout: BufReader<tokio::process::ChildStdout>,
    cancel: CancellationToken,
) {
    let mut lines = stdout.lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_child_line(&plugin, &line).await,
                Ok(None) => {
                    info!(plugin = %plugin.name, "Bridge child closed stdout");
                    break;
                }
                Err(error) => {
                    warn!(plugin = %plugin.name, %error, "Bridge child read failed");
                    break;
                }
            }
        }
    }
    match child.wait().await {
        Ok(status) => info!(plugin = %plugin.name, %status, "Bridge child exited"),
        Err(error) => warn!(plugin = %plugin.name, %error, "Bridge child wait failed"),
    }
}

async fn handle_child_line(plugin: &Arc<BridgePlugin>, line: &str) {
    let frame = match serde_json::from_str::<ChildFrame>(line) {
        Ok(frame) => frame,
        Err(error) => {
            debug!(plugin = %plugin.name, %error, "Malformed bridge frame");
            let _ = plugin
                .write_frame(&HostFrame::Error {
                    msg: error.to_string(),
                })
                .await;
            return;
        }
    };

    match frame {
        ChildFrame::Text { from, to, message } => {
            let from = from.unwrap_or_else(|| plugin.handle.session_id());
            plugin.handle.send_text_message(from, to, &message);
        }
        ChildFrame::AddAircraft { aircraft } => {
            let id = plugin.handle.add_aircraft(aircraft).await;
            let _ = plugin
                .write_frame(&HostFrame::AircraftAdded { aircraft: id })
                .await;
        }
        ChildFrame::RemoveAircraft { aircraft } => {
            if !plugin.handle.remove_aircraft(aircraft).await {
                let _ = plugin
                    .write_frame(&HostFrame::Error {
                        msg: format!("unknown aircraft {aircraft}"),
                    })
                    .await;
            }
        }
    }
}

#[async_trait]
impl Plugin for BridgePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "external process plugin bridge"
    }

    fn maintainer(&self) -> &str {
        ""
    }

    async fn process_text_message(
        &self,
        sender: Uuid,
        recipient: Uuid,
        message: &str,
    ) -> Result<()> {
        self.write_frame(&HostFrame::Pm {
            from: sender,
            to: recipient,
            message,
        })
        .await
    }

    async fn tick(&self, dt: Duration) -> Result<()> {
        let now = tokio::time::Instant::now();
        let due = {
            let mut last_sync = self.last_sync.lock().await;
            let due = last_sync.is_none_or(|last| now.duration_since(last) >= SYNC_INTERVAL);
            if due {
                *last_sync = Some(now);
            }
            due
        };
        if due {
            self.sync_child().await?;
        }
        self.write_frame(&HostFrame::Tick {
            dt: dt.as_secs_f64(),
        })
        .await
    }
}
