use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use crate::hub::{self, Hub};
use crate::static_data::StaticData;

/// Run the connection broker until ctrl-c.
pub async fn handle_hub(
    interface: String,
    port: u16,
    boundaries: Option<PathBuf>,
    topologies: Option<PathBuf>,
    geos: Option<PathBuf>,
) -> Result<()> {
    let static_data = StaticData::new(boundaries, topologies, geos);
    let hub = Hub::new(static_data);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    };

    hub::serve(hub, &interface, port, shutdown).await
}
