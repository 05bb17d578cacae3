use std::sync::Arc;

use landwatch_config::ConfigError;
use landwatch_core::DateError;
use landwatch_store::{SpatialError, StoreError};
use thiserror::Error;

mod alerting;
mod cache;
mod classify;
mod detail;
mod pack;
mod retry;
mod runner;
mod scheduler;
mod service;
mod single_flight;

pub use alerting::{AlertRequest, AlertingEngine, NewIntersectionPayload, intersection_keys};
pub use cache::{ANALYSIS_CACHE_VERSION, AnalysisCache, CachePayload, CachedMap};
pub use classify::{
    DatasetBucket, DatasetGroup, DatasetItem, DocFlags, GroupEnrichment, ProdesBiome, build_dataset_groups,
    build_deter_dataset_groups, build_indigena_items, build_ucs_items, classify_dataset,
    doc_flags_for, is_indigena_dataset, is_ucs_dataset,
};
pub use detail::{AnalysisDetail, DetailBuilder, DetailResult, DocInfo, MapRow};
pub use pack::{RegistryMeta, normalize_pack_key, registry_meta_from_pack};
pub use retry::with_reconnect;
pub use runner::{AnalysisRunner, ProcessOutcome};
pub use scheduler::{
    NewSchedule, RunDueSummary, RunNowOutcome, ScheduledAnalysis, ScheduledAnalysisLauncher,
    SchedulingEngine, initial_run_at, next_run_at,
};
pub use service::{AnalysisService, CreateAnalysisRequest};
pub use single_flight::SingleFlight;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("spatial store error: {0}")]
    Spatial(#[from] SpatialError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid date: {0}")]
    InvalidDate(#[from] DateError),
    #[error("analysis not found: {0}")]
    AnalysisNotFound(String),
    #[error("farm not found: {0}")]
    FarmNotFound(String),
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),
    #[error("CAR not found in the registry: {0}")]
    CarNotFound(String),
    #[error("registry data unavailable for CAR {0}")]
    SpatialDataMissing(String),
    #[error("spatial views are being refreshed, try again shortly")]
    RefreshInProgress,
    #[error("schedule {0} already has an analysis in flight")]
    ScheduleAlreadyRunning(String),
    #[error("schedule {0} was updated concurrently")]
    ScheduleConcurrentUpdate(String),
    #[error("{0}")]
    Shared(Arc<AnalysisError>),
    #[error("{0}")]
    Message(String),
}

impl AnalysisError {
    /// Stable machine-readable code for callers that map errors onto responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "INVALID_CONFIG",
            Self::Store(_) | Self::Json(_) | Self::Message(_) => "INTERNAL",
            Self::Spatial(_) => "SPATIAL_STORE",
            Self::InvalidDate(_) => "INVALID_DATE",
            Self::AnalysisNotFound(_) => "ANALYSIS_NOT_FOUND",
            Self::FarmNotFound(_) => "FARM_NOT_FOUND",
            Self::ScheduleNotFound(_) => "SCHEDULE_NOT_FOUND",
            Self::CarNotFound(_) => "CAR_NOT_FOUND",
            Self::SpatialDataMissing(_) => "SICAR_DATA_MISSING",
            Self::RefreshInProgress => "MV_REFRESHING",
            Self::ScheduleAlreadyRunning(_) => "SCHEDULE_ALREADY_RUNNING",
            Self::ScheduleConcurrentUpdate(_) => "SCHEDULE_CONCURRENT_UPDATE",
            Self::Shared(inner) => inner.code(),
        }
    }
}
