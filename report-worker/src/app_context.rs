use std::sync::Arc;

use health::HealthRegistry;

use crate::config::Config;
use crate::decoder::Decoder;
use crate::dedup::DuplicateFilter;
use crate::error::StoreError;
use crate::pipeline::Pipeline;
use crate::players::PlayerResolver;
use crate::storage::{PgReportStore, ReportStore, StorageWriter};

pub struct AppContext {
    pub store: Arc<dyn ReportStore>,
    pub liveness: HealthRegistry,
    pub resolver: Arc<PlayerResolver>,
    pub filter: Arc<DuplicateFilter>,
    pub pipeline: Arc<Pipeline>,
    pub writer: Arc<StorageWriter>,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, StoreError> {
        let store = PgReportStore::connect(
            &config.database_url,
            config.max_pg_connections,
            config.pg_acquire_timeout.0,
        )
        .await?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Wires the pipeline around an already connected store.
    pub fn with_store(config: &Config, store: Arc<dyn ReportStore>) -> Self {
        let resolver = Arc::new(PlayerResolver::new(
            store.clone(),
            config.player_cache_capacity,
        ));
        let filter = Arc::new(DuplicateFilter::new(
            store.clone(),
            config.report_cache_capacity,
        ));
        let decoder = Decoder::new(resolver.clone(), config.max_future_skew.0);
        let pipeline = Arc::new(Pipeline::new(decoder, filter.clone()));
        let writer = Arc::new(StorageWriter::new(store.clone(), config.store_max_attempts));

        Self {
            store,
            liveness: HealthRegistry::new("liveness"),
            resolver,
            filter,
            pipeline,
            writer,
        }
    }
}
