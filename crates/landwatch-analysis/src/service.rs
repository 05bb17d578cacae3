use std::sync::Arc;

use async_trait::async_trait;
use landwatch_core::{
    AnalysisKind, AnalysisStatus, Clock, is_current_date, normalize_documents,
    resolve_analysis_date, today,
};
use landwatch_store::{AnalysisRecord, AnalysisStore, FarmRecord, NewAnalysis, SpatialStore};

use crate::cache::{AnalysisCache, CachePayload};
use crate::detail::{AnalysisDetail, DetailBuilder, MapRow};
use crate::runner::AnalysisRunner;
use crate::scheduler::{ScheduledAnalysis, ScheduledAnalysisLauncher};
use crate::single_flight::SingleFlight;
use crate::AnalysisError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateAnalysisRequest {
    pub car_key: String,
    /// `YYYY-MM-DD` or RFC 3339; today when absent.
    pub analysis_date: Option<String>,
    pub kind: Option<AnalysisKind>,
    pub documents: Vec<String>,
    pub farm_id: Option<String>,
    /// Creates the farm when none is linked to the CAR key yet.
    pub farm_name: Option<String>,
    pub created_by: Option<String>,
}

/// Entry point for everything outside the engine: creating analyses and
/// reading their cached reports.
pub struct AnalysisService {
    store: Arc<dyn AnalysisStore>,
    spatial: Arc<dyn SpatialStore>,
    clock: Arc<dyn Clock>,
    runner: AnalysisRunner,
    detail: Arc<DetailBuilder>,
    cache: Arc<AnalysisCache>,
    detail_flights: SingleFlight<String, AnalysisDetail>,
}

impl AnalysisService {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        spatial: Arc<dyn SpatialStore>,
        clock: Arc<dyn Clock>,
        runner: AnalysisRunner,
        detail: Arc<DetailBuilder>,
        cache: Arc<AnalysisCache>,
    ) -> Self {
        Self {
            store,
            spatial,
            clock,
            runner,
            detail,
            cache,
            detail_flights: SingleFlight::new(),
        }
    }

    pub fn runner(&self) -> &AnalysisRunner {
        &self.runner
    }

    pub async fn create(
        &self,
        request: CreateAnalysisRequest,
    ) -> Result<AnalysisRecord, AnalysisError> {
        let car_key = request.car_key.trim().to_owned();
        let now = self.clock.now();
        let analysis_date = resolve_analysis_date(request.analysis_date.as_deref(), now)?;
        let kind = request.kind.unwrap_or_default();
        let documents = match kind {
            AnalysisKind::Deter => Vec::new(),
            AnalysisKind::Standard => normalize_documents(&request.documents),
        };

        if is_current_date(analysis_date, now) && self.spatial.refresh_in_progress().await? {
            return Err(AnalysisError::RefreshInProgress);
        }
        self.ensure_car_exists(&car_key, analysis_date).await?;

        let farm = match request.farm_id.as_deref() {
            Some(farm_id) => Some(
                self.store
                    .get_farm(farm_id)?
                    .ok_or_else(|| AnalysisError::FarmNotFound(farm_id.to_owned()))?,
            ),
            None => self.store.find_farm_by_car_key(&car_key)?,
        };
        let new_farm = match (&farm, request.farm_name.as_deref().map(str::trim)) {
            (None, Some(name)) if !name.is_empty() => Some(FarmRecord {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.to_owned(),
                car_key: car_key.clone(),
                owner: request.created_by.clone(),
                documents: Vec::new(),
                created_at: now,
            }),
            _ => None,
        };
        let farm_id = farm
            .as_ref()
            .or(new_farm.as_ref())
            .map(|farm| farm.id.clone());
        let farm_documents = if farm_id.is_some() {
            documents.clone()
        } else {
            Vec::new()
        };

        let record = self.store.create_analysis(
            NewAnalysis {
                id: uuid::Uuid::new_v4().to_string(),
                car_key,
                analysis_date: Some(analysis_date),
                kind,
                farm_id,
                schedule_id: None,
                documents,
                created_by: request.created_by,
                created_at: now,
            },
            new_farm,
            &farm_documents,
        )?;
        tracing::info!(
            event = "analysis.created",
            analysis_id = %record.id,
            car_key = %record.car_key,
            kind = record.kind.as_str(),
            "analysis queued"
        );
        self.runner.enqueue(&record.id);
        Ok(record)
    }

    /// Analysis for a claimed schedule: the farm's CAR key at today's date,
    /// carrying the farm documents for standard runs.
    pub fn create_scheduled(
        &self,
        request: &ScheduledAnalysis,
    ) -> Result<AnalysisRecord, AnalysisError> {
        let farm = self
            .store
            .get_farm(&request.farm_id)?
            .ok_or_else(|| AnalysisError::FarmNotFound(request.farm_id.clone()))?;
        let now = self.clock.now();
        let documents = match request.kind {
            AnalysisKind::Standard => farm.documents,
            AnalysisKind::Deter => Vec::new(),
        };

        let record = self.store.create_analysis(
            NewAnalysis {
                id: uuid::Uuid::new_v4().to_string(),
                car_key: farm.car_key,
                analysis_date: Some(today(now)),
                kind: request.kind,
                farm_id: Some(farm.id),
                schedule_id: Some(request.schedule_id.clone()),
                documents,
                created_by: request.created_by.clone(),
                created_at: now,
            },
            None,
            &[],
        )?;
        tracing::info!(
            event = "analysis.created",
            analysis_id = %record.id,
            schedule_id = %request.schedule_id,
            kind = record.kind.as_str(),
            "scheduled analysis queued"
        );
        self.runner.enqueue(&record.id);
        Ok(record)
    }

    /// Cached report when one exists; otherwise one computation per id no
    /// matter how many callers are waiting. Only completed reports are cached.
    pub async fn get_detail(&self, analysis_id: &str) -> Result<AnalysisDetail, AnalysisError> {
        let cached = self.cached_payload(analysis_id);
        if let Some(detail) = cached.as_ref().and_then(|payload| payload.detail.clone()) {
            return Ok(detail);
        }
        let cached_map = cached.and_then(|payload| payload.map);

        self.detail_flights
            .run(analysis_id.to_owned(), || async move {
                let detail = self.detail.get_by_id(analysis_id).await?;
                if detail.status == AnalysisStatus::Completed {
                    let payload = CachePayload::new(Some(detail.clone()), cached_map);
                    if let Err(err) = serde_json::to_value(&payload)
                        .map_err(AnalysisError::from)
                        .and_then(|value| self.cache.set(analysis_id, &value))
                    {
                        tracing::warn!(analysis_id, error = %err, "failed to cache analysis detail");
                    }
                }
                Ok(detail)
            })
            .await
    }

    pub async fn get_map(
        &self,
        analysis_id: &str,
        tolerance: Option<f64>,
    ) -> Result<Vec<MapRow>, AnalysisError> {
        let tolerance = self.detail.resolve_tolerance(tolerance);
        if let Some(map) = self
            .cached_payload(analysis_id)
            .and_then(|payload| payload.map)
            .filter(|map| map.matches_tolerance(tolerance))
        {
            return Ok(map.rows);
        }
        self.detail.get_map_by_id(analysis_id, Some(tolerance)).await
    }

    pub async fn list_indigena_phases(
        &self,
        as_of: Option<&str>,
    ) -> Result<Vec<String>, AnalysisError> {
        self.detail.list_indigena_phases(as_of).await
    }

    /// Trusted payload, or `None`. Payloads of another version are dropped;
    /// cache read failures count as a miss.
    fn cached_payload(&self, analysis_id: &str) -> Option<CachePayload> {
        let value = match self.cache.get(analysis_id) {
            Ok(value) => value?,
            Err(err) => {
                tracing::warn!(analysis_id, error = %err, "analysis cache read failed");
                return None;
            }
        };
        let payload = CachePayload::from_trusted(&value);
        if payload.is_none() {
            if let Err(err) = self.cache.invalidate(analysis_id) {
                tracing::warn!(analysis_id, error = %err, "failed to drop stale cache entry");
            }
        }
        payload
    }

    async fn ensure_car_exists(
        &self,
        car_key: &str,
        analysis_date: chrono::NaiveDate,
    ) -> Result<(), AnalysisError> {
        match self.spatial.registry_probe(car_key, Some(analysis_date)).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(AnalysisError::CarNotFound(car_key.to_owned())),
            Err(err) => {
                tracing::warn!(car_key, error = %err, "registry probe failed");
                Err(AnalysisError::SpatialDataMissing(car_key.to_owned()))
            }
        }
    }
}

#[async_trait]
impl ScheduledAnalysisLauncher for AnalysisService {
    async fn launch(&self, request: &ScheduledAnalysis) -> Result<String, AnalysisError> {
        self.create_scheduled(request).map(|record| record.id)
    }
}
