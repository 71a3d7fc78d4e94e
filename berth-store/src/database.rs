use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

use crate::app_config::DatabaseConfig;
use crate::pg::PgStore;

/// Connection pool plus schema management for the ledgers.
#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.max_connections.min(2))
            .acquire_timeout(Duration::from_secs(3))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.url)
            .await?;

        info!("Connected to Postgres (pool of {})", config.max_connections);
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Applying ledger migrations");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Ledgers backed by this pool
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}
