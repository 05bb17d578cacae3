use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use landwatch_core::{AnalysisKind, FeatureId, is_base_registry_row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const INDIGENA_PHASE_KEYS: &[&str] = &[
    "fase_ti", "FASE_TI", "faseTi", "FASETI", "fase_it", "FASE_IT", "faseIt", "FASEIT",
];
pub const UCS_SIGLA_KEYS: &[&str] = &["SiglaCateg", "SIGLACATEG", "siglacateg", "sigla_categ"];

#[derive(Debug, Error)]
pub enum SpatialError {
    #[error("transient spatial store failure: {0}")]
    Transient(String),
    #[error("spatial query failed: {0}")]
    Query(String),
    #[error("failed to decode spatial row: {0}")]
    Decode(String),
    #[error("invalid spatial configuration: {0}")]
    Config(String),
}

impl SpatialError {
    /// Serialization failures and dropped connections; worth one retry after reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Postgres SQLSTATEs treated as transient: serialization failure, deadlock,
/// admin shutdown and the whole connection-exception class.
pub fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "57P01") || code.starts_with("08")
}

/// One row of the intersection function. Decimals stay as decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntersectionRow {
    pub category_code: String,
    pub dataset_code: String,
    pub snapshot_date: Option<NaiveDate>,
    pub feature_id: Option<FeatureId>,
    pub geom_id: Option<FeatureId>,
    pub sicar_area_m2: Option<String>,
    pub feature_area_m2: Option<String>,
    pub overlap_area_m2: Option<String>,
    pub overlap_pct_of_sicar: Option<String>,
}

impl IntersectionRow {
    pub fn is_base_registry(&self) -> bool {
        is_base_registry_row(
            &self.category_code,
            self.feature_area_m2.as_deref(),
            self.overlap_area_m2.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Result of probing the registry for a CAR key; `coordinates` is a point on
/// the polygon's surface when the geometry could be projected.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegistryProbe {
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub dataset_code: String,
    pub category_code: String,
    pub description: Option<String>,
    pub is_spatial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMatchRow {
    pub dataset_code: String,
    pub category_code: String,
    pub doc_normalized: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureTarget {
    pub category_code: String,
    pub dataset_code: String,
    pub feature_id: Option<FeatureId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeometryRow {
    pub geom_id: FeatureId,
    pub geometry: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureGeometry {
    pub dataset_code: String,
    pub feature_id: FeatureId,
    pub geometry: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveView {
    IndigenaPhase,
    UcsSigla,
}

impl ActiveView {
    pub fn relation(self) -> &'static str {
        match self {
            Self::IndigenaPhase => "mv_indigena_phase_active",
            Self::UcsSigla => "mv_ucs_sigla_active",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Self::IndigenaPhase => "fase_ti",
            Self::UcsSigla => "sigla_categ",
        }
    }
}

/// Read-only view of the regulatory geodata.
///
/// Every date argument is an as-of date; `None` selects the "current"
/// variant where one exists. Attribute value lookups return trimmed,
/// non-empty values.
#[async_trait]
pub trait SpatialStore: Send + Sync {
    /// Rows overlapping the registry polygon of `car_key`. `DETER` analyses
    /// get the registry row plus DETER alerts only.
    async fn intersections(
        &self,
        car_key: &str,
        as_of: Option<NaiveDate>,
        kind: AnalysisKind,
    ) -> Result<Vec<IntersectionRow>, SpatialError>;

    /// `None` when the registry has no polygon for `car_key`.
    async fn registry_probe(
        &self,
        car_key: &str,
        as_of: Option<NaiveDate>,
    ) -> Result<Option<RegistryProbe>, SpatialError>;

    async fn registry_biomes(
        &self,
        car_key: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<String>, SpatialError>;

    /// Attribute pack of the registry feature, from the active view when
    /// `use_active` is set and it has the feature, else the pack valid at `as_of`.
    async fn registry_attributes(
        &self,
        dataset_code: &str,
        feature_id: &FeatureId,
        as_of: NaiveDate,
        use_active: bool,
    ) -> Result<Option<serde_json::Value>, SpatialError>;

    async fn dataset_catalog(&self) -> Result<Vec<DatasetRow>, SpatialError>;

    /// Distinct values from an active materialized view. Empty `dataset_codes`
    /// means no dataset filter; `feature_ids` restricts to those features.
    async fn active_attribute_values(
        &self,
        view: ActiveView,
        dataset_codes: &[String],
        feature_ids: Option<&[FeatureId]>,
    ) -> Result<Vec<String>, SpatialError>;

    /// Distinct pack values for `category_code` (or any of `dataset_codes`),
    /// first non-empty key wins, sorted.
    async fn distinct_attribute_values(
        &self,
        category_code: &str,
        dataset_codes: &[String],
        keys: &[&str],
        as_of: NaiveDate,
    ) -> Result<Vec<String>, SpatialError>;

    async fn attribute_values_for_features(
        &self,
        targets: &[FeatureTarget],
        keys: &[&str],
        as_of: NaiveDate,
    ) -> Result<BTreeSet<String>, SpatialError>;

    async fn document_matches(
        &self,
        docs: &[String],
        as_of: NaiveDate,
    ) -> Result<Vec<DocMatchRow>, SpatialError>;

    async fn geometries_by_id(
        &self,
        geom_ids: &[FeatureId],
        tolerance: f64,
    ) -> Result<Vec<GeometryRow>, SpatialError>;

    /// Geometries through historical validity; `None` keeps open intervals only.
    async fn geometries_by_feature(
        &self,
        targets: &[FeatureTarget],
        as_of: Option<NaiveDate>,
        tolerance: f64,
    ) -> Result<Vec<FeatureGeometry>, SpatialError>;

    /// True while any materialized view in the schema is being refreshed.
    async fn refresh_in_progress(&self) -> Result<bool, SpatialError>;

    async fn reconnect(&self) -> Result<(), SpatialError>;
}
