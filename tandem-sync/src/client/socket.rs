//! WebSocket transport for client connections.

use crate::error::SyncError;
use crate::transport::{bridge_websocket, Transport};

/// Opens a WebSocket to `url` and returns the connection's end of it.
pub async fn connect_ws(url: &str) -> Result<Transport, SyncError> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    log::debug!("WebSocket open to {url}");

    let (client, bridge) = Transport::pair();
    let url = url.to_string();
    tokio::spawn(async move {
        if let Err(e) = bridge_websocket(ws, bridge, None).await {
            log::warn!("WebSocket to {url} failed: {e}");
        }
    });
    Ok(client)
}
