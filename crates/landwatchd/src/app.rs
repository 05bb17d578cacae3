use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use landwatch_analysis::{
    AlertingEngine, AnalysisCache, AnalysisRunner, AnalysisService, DetailBuilder,
    SchedulingEngine,
};
use landwatch_config::{LandwatchConfig, validate_config};
use landwatch_core::{Clock, SystemClock};
use landwatch_store::{
    AnalysisStore, MemorySpatialStore, PostgisSpatialStore, SpatialStore, SqliteStore,
};

/// Every engine the daemon drives, wired against one store and clock.
pub struct App {
    pub store: Arc<dyn AnalysisStore>,
    pub cache: Arc<AnalysisCache>,
    pub runner: AnalysisRunner,
    pub service: Arc<AnalysisService>,
    pub scheduler: SchedulingEngine,
}

impl App {
    /// Opens the SQLite store under `root` and the spatial store named by the
    /// config. Must run inside a tokio runtime because the Postgres pool
    /// spawns its maintenance task on creation.
    pub fn build(root: &Path, config: &LandwatchConfig) -> Result<Self> {
        for warning in validate_config(config) {
            tracing::warn!(code = warning.code, "{}", warning.message);
        }

        let sqlite_path = root.join(&config.storage.sqlite_path);
        let store: Arc<dyn AnalysisStore> = Arc::new(
            SqliteStore::open(&sqlite_path)
                .with_context(|| format!("failed to open store at {}", sqlite_path.display()))?,
        );
        let spatial: Arc<dyn SpatialStore> = match config.spatial.database_url {
            Some(_) => Arc::new(
                PostgisSpatialStore::connect_lazy(&config.spatial)
                    .context("failed to configure spatial store")?,
            ),
            None => {
                tracing::warn!("no spatial database configured, using an empty in-memory store");
                Arc::new(MemorySpatialStore::new())
            }
        };

        Ok(Self::with_stores(store, spatial, Arc::new(SystemClock), config))
    }

    pub fn with_stores(
        store: Arc<dyn AnalysisStore>,
        spatial: Arc<dyn SpatialStore>,
        clock: Arc<dyn Clock>,
        config: &LandwatchConfig,
    ) -> Self {
        let detail = Arc::new(DetailBuilder::new(
            store.clone(),
            spatial.clone(),
            clock.clone(),
            config.map.default_tolerance,
        ));
        let cache = Arc::new(AnalysisCache::new(store.clone(), clock.clone(), &config.cache));
        let alerting = Arc::new(AlertingEngine::new(store.clone(), clock.clone()));
        let runner = AnalysisRunner::new(
            store.clone(),
            spatial.clone(),
            clock.clone(),
            detail.clone(),
            cache.clone(),
            alerting,
            config.runner.clone(),
        );
        let service = Arc::new(AnalysisService::new(
            store.clone(),
            spatial,
            clock.clone(),
            runner.clone(),
            detail,
            cache.clone(),
        ));
        let scheduler = SchedulingEngine::new(
            store.clone(),
            clock,
            service.clone(),
            config.scheduler.batch_size,
        );

        Self {
            store,
            cache,
            runner,
            service,
            scheduler,
        }
    }
}
