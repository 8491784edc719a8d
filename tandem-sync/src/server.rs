//! WebSocket front end of the authority.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── Agent A ──┐
//!            ├── TcpListener ──────┤             ├── Backend ── Store
//! Client B ──┘   (one bridge per   └── Agent B ──┘     │
//!                 connection)                          └── PubSub ──► Agents
//! ```
//!
//! Each accepted socket is bridged onto an in-process [`Transport`] and
//! served by its own agent; everything past the bridge is the same as for
//! in-process sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::backend::{Backend, BackendConfig};
use crate::error::SyncError;
use crate::transport::{bridge_websocket, Transport};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Largest accepted WebSocket message, in bytes
    pub max_message_size: usize,
    /// WebSocket ping interval in seconds; 0 disables pings
    pub ping_interval_secs: u64,
    /// Authority settings
    pub backend: BackendConfig,
    /// Document to create at startup if missing: (collection, id)
    pub seed: Option<(String, String)>,
    /// Type of the seeded document
    pub seed_type: String,
    /// RocksDB directory (persistence feature)
    pub data_dir: Option<std::path::PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_message_size: 1024 * 1024,
            ping_interval_secs: 30,
            backend: BackendConfig::default(),
            seed: None,
            seed_type: "json0".to_string(),
            data_dir: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TANDEM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("TANDEM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(retries) = lookup("TANDEM_MAX_SUBMIT_RETRIES") {
            config.backend.max_submit_retries = match retries.as_str() {
                "" | "none" | "unbounded" => None,
                n => match n.parse() {
                    Ok(n) => Some(n),
                    Err(_) => {
                        log::warn!("Ignoring TANDEM_MAX_SUBMIT_RETRIES={n}");
                        config.backend.max_submit_retries
                    }
                },
            };
        }
        if let Some(collection) = lookup("TANDEM_SEED_COLLECTION") {
            let id = lookup("TANDEM_SEED_ID").unwrap_or_else(|| "default".to_string());
            config.seed = Some((collection, id));
        }
        if let Some(seed_type) = lookup("TANDEM_SEED_TYPE") {
            config.seed_type = seed_type;
        }
        config.data_dir = lookup("TANDEM_DATA_DIR").map(Into::into);
        config
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub failed_connections: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    backend: Backend,
    stats: Arc<ServerStats>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, backend: Backend) -> Self {
        Self {
            config,
            backend,
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// In-memory authority with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Backend::in_memory())
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Binds the configured address and serves until the listener fails.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        match listener.local_addr() {
            Ok(addr) => log::info!("Sync server listening on {addr}"),
            Err(_) => log::info!("Sync server listening"),
        }

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            log::debug!("New TCP connection from {addr}");

            let backend = self.backend.clone();
            let config = self.config.clone();
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = Self::handle_connection(stream, backend, &config).await {
                    stats.failed_connections.fetch_add(1, Ordering::Relaxed);
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        backend: Backend,
        config: &ServerConfig,
    ) -> Result<(), SyncError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);
        ws_config.max_frame_size = Some(config.max_message_size);
        let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let (bridge, agent_end) = Transport::pair();
        let agent = backend.listen(agent_end);
        let ping = (config.ping_interval_secs > 0).then(|| Duration::from_secs(config.ping_interval_secs));
        let result = bridge_websocket(ws, bridge, ping).await;
        // The bridge dropped its end; the agent notices and cleans up.
        let _ = agent.await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_from_env_lookup() {
        let vars: HashMap<&str, &str> = [
            ("TANDEM_BIND_ADDR", "0.0.0.0:7000"),
            ("TANDEM_MAX_SUBMIT_RETRIES", "none"),
            ("TANDEM_SEED_COLLECTION", "notes"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.backend.max_submit_retries, None);
        assert_eq!(config.seed, Some(("notes".to_string(), "default".to_string())));
        assert_eq!(config.data_dir, None);
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert_eq!(config.backend.max_submit_retries, Some(50));

        let config = ServerConfig::from_lookup(|key| {
            (key == "TANDEM_MAX_SUBMIT_RETRIES").then(|| "7".to_string())
        });
        assert_eq!(config.backend.max_submit_retries, Some(7));
    }
}
