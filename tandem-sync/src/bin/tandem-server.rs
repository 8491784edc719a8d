//! Tandem sync server.
//!
//! Configuration comes from `TANDEM_*` environment variables (see
//! [`ServerConfig::from_env`]); log output from `RUST_LOG`.

use std::sync::Arc;

use log::info;
use serde_json::{json, Value};
use tandem_sync::storage::{MemoryStore, Store};
use tandem_sync::tandem_ot::TypeRegistry;
use tandem_sync::{Backend, ServerConfig, SyncError, SyncServer};

fn open_store(config: &ServerConfig) -> Result<Arc<dyn Store>, SyncError> {
    #[cfg(feature = "persistence")]
    if let Some(path) = &config.data_dir {
        use tandem_sync::storage::{RocksStore, StoreConfig};
        let store = RocksStore::open(StoreConfig {
            path: path.clone(),
            ..StoreConfig::default()
        })?;
        info!("Using RocksDB store at {}", path.display());
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "persistence"))]
    if config.data_dir.is_some() {
        log::warn!("TANDEM_DATA_DIR is set but persistence is not compiled in; using memory");
    }
    Ok(Arc::new(MemoryStore::new()))
}

/// Creates the configured document unless it already exists.
async fn seed(backend: &Backend, config: &ServerConfig) -> Result<(), SyncError> {
    let Some((collection, id)) = &config.seed else {
        return Ok(());
    };
    let initial = match backend.types().require(&config.seed_type)?.create(None)? {
        Value::Null => json!({}),
        data => data,
    };

    let connection = backend.connect();
    connection.wait_connected().await?;
    let doc = connection.get(collection, id);
    doc.fetch().await?;
    if doc.exists() {
        info!("Document {collection}/{id} already exists at v{:?}", doc.version());
    } else {
        doc.create(initial, &config.seed_type).await?;
        info!("Seeded {collection}/{id} as {}", config.seed_type);
    }
    connection.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting tandem-server with {config:?}");

    let backend = Backend::new(
        open_store(&config)?,
        TypeRegistry::with_defaults(),
        config.backend.clone(),
    );
    seed(&backend, &config).await?;

    SyncServer::new(config, backend).run().await
}
