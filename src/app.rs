//! Component wiring shared by the HTTP server and the CLI.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

use etl_harness_core::store::BlobStore;

use crate::blob_fs::FsBlobStore;
use crate::blob_s3::{AwsCredentials, S3BlobStore};
use crate::config::Config;
use crate::db;
use crate::embedding::Embedder;
use crate::extraction::Extractor;
use crate::jobs::JobTracker;
use crate::locks::KeyedLocks;
use crate::migrate::migrate_pool;
use crate::query::QueryEngine;
use crate::registry::ServerRegistry;
use crate::source::{SourceConnector, SqlxConnector};
use crate::staging::StagingStore;
use crate::transform::Transformer;
use crate::warehouse::Warehouse;

/// Every pipeline component, built over one catalog pool and one lock table.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub registry: ServerRegistry,
    pub staging: StagingStore,
    pub jobs: JobTracker,
    pub extractor: Extractor,
    pub transformer: Transformer,
    pub warehouse: Warehouse,
    pub query: QueryEngine,
}

fn blob_store(config: &Config) -> Result<Arc<dyn BlobStore>> {
    match config.staging.backend.as_str() {
        "s3" => {
            let s3 = config
                .staging
                .s3
                .clone()
                .ok_or_else(|| anyhow::anyhow!("staging.s3 is not configured"))?;
            let creds = AwsCredentials::from_env()?;
            Ok(Arc::new(S3BlobStore::new(s3, creds)))
        }
        _ => Ok(Arc::new(FsBlobStore::new(config.staging.root.clone()))),
    }
}

impl AppContext {
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::with_connector(config, Arc::new(SqlxConnector)).await
    }

    /// Build the context with a custom source connector.
    pub async fn with_connector(config: &Config, connector: Arc<dyn SourceConnector>) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate_pool(&pool).await?;

        let jobs = JobTracker::new(pool.clone());
        let interrupted = jobs.mark_interrupted().await?;
        if interrupted > 0 {
            warn!(jobs = interrupted, "marked jobs from a previous run as abandoned");
        }

        let blobs = blob_store(config)?;
        let locks = KeyedLocks::new();
        let registry = ServerRegistry::new(pool.clone());
        let staging = StagingStore::new(pool.clone(), blobs, locks.clone());
        let embedder = Arc::new(Embedder::from_config(&config.embedding)?);
        let extractor = Extractor::new(
            registry.clone(),
            staging.clone(),
            jobs.clone(),
            connector,
            embedder,
            config.extraction.clone(),
            config.embedding.max_tokens,
        );
        let transformer = Transformer::new(staging.clone(), jobs.clone(), config.extraction.bucket.clone());
        let warehouse = Warehouse::new(
            pool.clone(),
            staging.clone(),
            locks,
            jobs.clone(),
            config.warehouse.clone(),
            config.load.clone(),
        );
        let query = QueryEngine::new(warehouse.clone(), config.warehouse.clone());
        info!(backend = staging.backend(), "pipeline ready");

        Ok(Self {
            config: Arc::new(config.clone()),
            pool,
            registry,
            staging,
            jobs,
            extractor,
            transformer,
            warehouse,
            query,
        })
    }
}
