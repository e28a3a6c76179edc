use std::sync::Arc;
use tracing;

use crate::config::{Config, StoreBackend};
use crate::db::{create_pool, run_migrations};
use crate::store::{DocumentStore, MemoryStore, PgStore};

#[derive(Clone)]
pub struct BridgeContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
}

impl BridgeContext {
    /// Connects the configured store. Any error here is fatal to the process.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn DocumentStore> = match config.store {
            StoreBackend::Postgres => {
                let pool = create_pool(&config.database).await?;
                run_migrations(&config.database).await?;
                Arc::new(PgStore::new(pool, &config.feed))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using the in-memory store; sessions and messages are lost on exit");
                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Arc<dyn DocumentStore>) -> Self {
        BridgeContext {
            config: Arc::new(config),
            store,
        }
    }
}
