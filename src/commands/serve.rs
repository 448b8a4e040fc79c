use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::sim::{EngineConfig, PluginRegistry, engine};

/// Run one simulation server process until ctrl-c or hub loss.
///
/// The process exits non-zero when the hub link drops so a supervisor can
/// restart it; clients re-announce and are resynced on reconnect.
pub async fn handle_serve(config: EngineConfig) -> Result<()> {
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    // Bridge modules are discovered from the plugin directories at
    // runtime; in-process plugins register here before startup.
    let registry = PluginRegistry::new();

    engine::run(config, registry, cancel).await
}
