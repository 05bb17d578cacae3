use chrono::{DateTime, NaiveDate, Utc};
use landwatch_core::{AlertStatus, AnalysisKind, AnalysisStatus, FeatureId, ScheduleFrequency};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod memory;
mod postgis;
mod spatial;
mod sqlite;

pub use memory::{AttrPackRow, DocIndexRow, MemorySpatialStore};
pub use postgis::PostgisSpatialStore;
pub use spatial::{
    ActiveView, Coordinates, DatasetRow, DocMatchRow, FeatureGeometry, FeatureTarget,
    GeometryRow, INDIGENA_PHASE_KEYS, IntersectionRow, RegistryProbe, SpatialError, SpatialStore,
    UCS_SIGLA_KEYS, is_transient_sqlstate,
};
pub use sqlite::SqliteStore;

pub const ANALYSIS_CACHE_TABLE: &str = "analysis_cache";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub car_key: String,
    pub analysis_date: Option<NaiveDate>,
    pub kind: AnalysisKind,
    pub status: AnalysisStatus,
    pub farm_id: Option<String>,
    pub schedule_id: Option<String>,
    pub documents: Vec<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub has_intersections: bool,
    pub intersection_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAnalysis {
    pub id: String,
    pub car_key: String,
    pub analysis_date: Option<NaiveDate>,
    pub kind: AnalysisKind,
    pub farm_id: Option<String>,
    pub schedule_id: Option<String>,
    pub documents: Vec<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One persisted intersection; decimals stay as the store's decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResultRecord {
    pub analysis_id: String,
    pub category_code: String,
    pub dataset_code: String,
    pub snapshot_date: Option<NaiveDate>,
    pub feature_id: Option<FeatureId>,
    pub geom_id: Option<FeatureId>,
    pub is_sicar: bool,
    pub sicar_area_m2: Option<String>,
    pub feature_area_m2: Option<String>,
    pub overlap_area_m2: Option<String>,
    pub overlap_pct_of_sicar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionSummary {
    pub completed_at: DateTime<Utc>,
    pub has_intersections: bool,
    pub intersection_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub analysis_id: String,
    pub payload: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub farm_id: String,
    pub schedule_id: Option<String>,
    pub analysis_id: String,
    pub analysis_kind: AnalysisKind,
    pub alert_type: String,
    pub new_intersection_count: i64,
    pub status: AlertStatus,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmRecord {
    pub id: String,
    pub name: String,
    pub car_key: String,
    pub owner: Option<String>,
    pub documents: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: String,
    pub farm_id: String,
    pub kind: AnalysisKind,
    pub frequency: ScheduleFrequency,
    pub timezone: String,
    pub active: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True when the backing table named `table` does not exist.
    pub fn is_missing_table(&self, table: &str) -> bool {
        match self {
            Self::Sqlite(err) => {
                let message = err.to_string();
                message.contains("no such table") && message.contains(table)
            }
            _ => false,
        }
    }
}

/// Application persistence: analyses, results, cache rows, alerts, farms and schedules.
pub trait AnalysisStore: Send + Sync {
    /// Persists a `pending` analysis, optionally creating its farm and attaching
    /// `farm_documents` to the linked farm, all in one transaction.
    fn create_analysis(
        &self,
        analysis: NewAnalysis,
        new_farm: Option<FarmRecord>,
        farm_documents: &[String],
    ) -> Result<AnalysisRecord, StoreError>;
    fn get_analysis(&self, analysis_id: &str) -> Result<Option<AnalysisRecord>, StoreError>;
    /// Single conditional `pending -> running` update; false when another worker won.
    fn claim_pending(
        &self,
        analysis_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    fn release_to_pending(&self, analysis_id: &str) -> Result<bool, StoreError>;
    /// Conditional `running -> failed`; false when the analysis is no longer running.
    fn mark_failed(
        &self,
        analysis_id: &str,
        completed_at: DateTime<Utc>,
        reset_counts: bool,
    ) -> Result<bool, StoreError>;
    /// Replaces every result row and moves a `running` analysis to `completed`,
    /// all-or-nothing. False, with nothing written, when it is no longer running.
    fn complete_analysis(
        &self,
        analysis_id: &str,
        results: &[AnalysisResultRecord],
        summary: CompletionSummary,
    ) -> Result<bool, StoreError>;
    fn list_pending_ids(&self, limit: u32) -> Result<Vec<String>, StoreError>;
    fn fail_stale_running(
        &self,
        started_before: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;
    fn list_results(&self, analysis_id: &str) -> Result<Vec<AnalysisResultRecord>, StoreError>;
    fn find_previous_completed(
        &self,
        farm_id: &str,
        kind: AnalysisKind,
        excluding_analysis_id: &str,
    ) -> Result<Option<String>, StoreError>;
    fn find_in_flight_for_schedule(&self, schedule_id: &str)
    -> Result<Option<String>, StoreError>;

    fn get_cache_entry(&self, analysis_id: &str) -> Result<Option<CacheRecord>, StoreError>;
    fn upsert_cache_entry(&self, record: &CacheRecord) -> Result<(), StoreError>;
    fn delete_cache_entry(&self, analysis_id: &str) -> Result<(), StoreError>;
    fn delete_expired_cache(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    fn insert_alert(&self, record: &AlertRecord) -> Result<(), StoreError>;
    fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        limit: u32,
    ) -> Result<Vec<AlertRecord>, StoreError>;

    fn insert_farm(&self, record: &FarmRecord) -> Result<(), StoreError>;
    fn get_farm(&self, farm_id: &str) -> Result<Option<FarmRecord>, StoreError>;
    fn find_farm_by_car_key(&self, car_key: &str) -> Result<Option<FarmRecord>, StoreError>;

    fn insert_schedule(&self, record: &ScheduleRecord) -> Result<(), StoreError>;
    fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleRecord>, StoreError>;
    fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduleRecord>, StoreError>;
    /// Conditional claim: only an active schedule still due at `now` advances.
    fn claim_due_schedule(
        &self,
        schedule_id: &str,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Optimistic claim keyed on the `updated_at` the caller last read.
    fn claim_schedule_if_unchanged(
        &self,
        schedule_id: &str,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    fn set_schedule_active(
        &self,
        schedule_id: &str,
        active: bool,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleRecord>, StoreError>;
}
