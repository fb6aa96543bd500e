mod config;
mod db;
mod errors;

pub mod cache;
pub mod checkpoint;
pub mod executor;
pub mod geo;
pub mod geocoder;
pub mod normalize;
pub mod processor;
pub mod resolver;
pub mod table;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{CacheLookup, CacheStats, GeocodingCache};
pub use crate::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::errors::{AppError, AppResult};
pub use crate::executor::run_parallel;
pub use crate::geo::GeoPoint;
pub use crate::geocoder::{Geocoder, GeocodingService, ServiceId};
pub use crate::processor::{
    session_id_for, BatchOutcome, BatchProcessor, BatchProgress, BatchStats, PendingSession,
    ProgressObserver,
};
pub use crate::resolver::{
    AddressPair, DistanceResolver, DistanceResult, DistanceSource, PairResolver, ResolutionStatus,
};

/// Cache, geocoding services, resolver and checkpointed processor wired
/// together from one configuration.
pub struct DistanceEngine {
    config: AppConfig,
    cache: Arc<GeocodingCache>,
    resolver: Arc<DistanceResolver>,
    processor: BatchProcessor,
}

impl DistanceEngine {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        std::fs::create_dir_all(&config.data_dir)?;
        let cache = Arc::new(GeocodingCache::open(config.cache_database_path())?);
        let services = geocoder::services_from_config(&config)?;
        let store: Arc<dyn CheckpointStore> =
            Arc::new(FileCheckpointStore::new(config.checkpoint_dir())?);

        let engine = Self::with_components(config, cache, services, store);
        info!(
            target: "engine",
            services = ?engine.resolver.service_ids(),
            data_dir = %engine.config.data_dir.display(),
            "distance engine ready"
        );
        Ok(engine)
    }

    pub fn with_components(
        config: AppConfig,
        cache: Arc<GeocodingCache>,
        services: Vec<GeocodingService>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let resolver = Arc::new(DistanceResolver::new(Arc::clone(&cache), services));
        let processor = BatchProcessor::new(store, config.chunk_size, config.max_workers);
        Self {
            config,
            cache,
            resolver,
            processor,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn resolver(&self) -> Arc<DistanceResolver> {
        Arc::clone(&self.resolver)
    }

    pub async fn resolve(&self, pair: &AddressPair) -> DistanceResult {
        self.resolver.resolve(pair).await
    }

    /// Unchunked path: resolves everything in one parallel pass, no
    /// checkpoints.
    pub async fn resolve_all(&self, pairs: Vec<AddressPair>) -> Vec<DistanceResult> {
        run_parallel(pairs, Arc::clone(&self.resolver), self.config.max_workers).await
    }

    pub async fn process_rows(
        &self,
        rows: &[AddressPair],
        session_id: &str,
        progress: Option<ProgressObserver>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> AppResult<BatchOutcome> {
        self.processor
            .process(rows, session_id, Arc::clone(&self.resolver), progress, cancel)
            .await
    }

    pub fn has_pending_session(&self, session_id: &str) -> AppResult<PendingSession> {
        self.processor.has_pending_session(session_id)
    }

    pub fn partial_results(
        &self,
        session_id: &str,
        rows: &[AddressPair],
    ) -> AppResult<Option<BatchOutcome>> {
        self.processor.partial_results(session_id, rows)
    }

    pub fn discard_session(&self, session_id: &str) -> AppResult<usize> {
        self.processor.discard_session(session_id)
    }

    pub fn cache_stats(&self) -> AppResult<CacheStats> {
        self.cache.stats()
    }

    pub fn clear_cache(&self) -> AppResult<()> {
        self.cache.clear()
    }
}

/// Installs the global subscriber once; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
