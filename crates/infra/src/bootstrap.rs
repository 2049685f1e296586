//! Wiring from `Settings` to a ready-to-use store and dispatcher.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::{Settings, StoreBackend, StoreSettings};
use crate::dispatcher::CommandDispatcher;
use crate::queries::InventoryQueries;
use crate::store::{InMemoryInventoryStore, InventoryStore, PostgresInventoryStore, StoreError};

pub type SharedStore = Arc<dyn InventoryStore>;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("store.database_url is not set")]
    MissingDatabaseUrl,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Open the configured store. The Postgres backend runs its migration first.
pub async fn open_store(settings: &StoreSettings) -> Result<SharedStore, BootstrapError> {
    match settings.backend {
        StoreBackend::Memory => {
            info!(backend = "memory", "opening inventory store");
            Ok(Arc::new(InMemoryInventoryStore::new()))
        }
        StoreBackend::Postgres => {
            let url = settings
                .database_url
                .as_deref()
                .ok_or(BootstrapError::MissingDatabaseUrl)?;
            info!(
                backend = "postgres",
                max_connections = settings.max_connections,
                "opening inventory store"
            );
            let store = PostgresInventoryStore::connect(url, settings.max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Everything a caller needs to run operations and queries.
#[derive(Clone)]
pub struct Services {
    pub dispatcher: CommandDispatcher<dyn InventoryStore>,
    pub queries: InventoryQueries<dyn InventoryStore>,
}

pub async fn services(settings: &Settings) -> Result<Services, BootstrapError> {
    let store = open_store(&settings.store).await?;
    Ok(Services {
        dispatcher: CommandDispatcher::with_policy(
            Arc::clone(&store),
            settings.dispatch.retry_policy(),
        ),
        queries: InventoryQueries::new(store),
    })
}
