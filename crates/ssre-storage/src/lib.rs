//! Run store abstraction for Scraper SRE, with in-memory and Postgres backends.
//!
//! Both backends share one contract: every listing is newest first (descending
//! timestamp), the baseline lookup only considers `SUCCESS` runs, and all writes
//! are appends.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ssre_core::{Alert, AppConfig, RepairSuggestion, Scraper, ScraperRun, StoreBackend};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryRunStore;
pub use postgres::{PgRunStore, PoolConfig};

pub const CRATE_NAME: &str = "ssre-storage";

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: Uuid },
    #[error("invalid value in column {column}: {reason}")]
    InvalidColumn { column: &'static str, reason: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Durable keyed storage for scraper configs, run history, alerts and repair suggestions.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_scraper(&self, scraper: &Scraper) -> StoreResult<()>;

    async fn get_scraper(&self, scraper_id: Uuid) -> StoreResult<Option<Scraper>>;

    /// All registered scrapers, oldest registration first.
    async fn list_scrapers(&self) -> StoreResult<Vec<Scraper>>;

    async fn save_run(&self, run: &ScraperRun) -> StoreResult<()>;

    /// Most recent `SUCCESS` run for the scraper, skipping `exclude_run_id`.
    async fn get_last_successful_run(
        &self,
        scraper_id: Uuid,
        exclude_run_id: Option<Uuid>,
    ) -> StoreResult<Option<ScraperRun>>;

    async fn list_runs(&self, scraper_id: Uuid, limit: usize) -> StoreResult<Vec<ScraperRun>>;

    async fn save_alert(&self, alert: &Alert) -> StoreResult<()>;

    async fn list_alerts(&self, scraper_id: Uuid, limit: usize) -> StoreResult<Vec<Alert>>;

    async fn save_repair_suggestion(&self, suggestion: &RepairSuggestion) -> StoreResult<()>;

    /// Suggestions produced for one alert, in the order they were generated.
    async fn list_repair_suggestions(&self, alert_id: Uuid) -> StoreResult<Vec<RepairSuggestion>>;
}

/// Build the store selected by configuration. Postgres stores are migrated before use.
pub async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn RunStore>> {
    match &config.store {
        StoreBackend::Memory => {
            tracing::info!("using in-memory run store");
            Ok(Arc::new(MemoryRunStore::new()))
        }
        StoreBackend::Postgres { database_url } => {
            let pool_config = PoolConfig {
                max_connections: config.db_max_connections,
                acquire_timeout: Duration::from_secs(config.db_acquire_timeout_secs),
            };
            let store = PgRunStore::connect(database_url, pool_config)
                .await
                .context("connecting to postgres run store")?;
            let applied = store.migrate().await.context("running store migrations")?;
            tracing::info!(applied, "using postgres run store");
            Ok(Arc::new(store))
        }
    }
}
