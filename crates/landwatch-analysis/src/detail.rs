use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use landwatch_config::clamp_tolerance;
use landwatch_core::{
    AnalysisKind, AnalysisStatus, Clock, DocType, FeatureId, doc_type_for, is_base_registry_row,
    is_current_date, normalize_documents, resolve_analysis_date, should_include_detail_result,
    should_keep_map_row, today,
};
use landwatch_store::{
    ActiveView, AnalysisRecord, AnalysisResultRecord, AnalysisStore, Coordinates, FeatureTarget,
    INDIGENA_PHASE_KEYS, SpatialStore, UCS_SIGLA_KEYS,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::{
    DatasetGroup, DocFlags, GroupEnrichment, build_dataset_groups, build_deter_dataset_groups,
    doc_flags_for, is_indigena_dataset, is_ucs_dataset,
};
use crate::pack::{RegistryMeta, registry_meta_from_pack};
use crate::retry::with_reconnect;
use crate::AnalysisError;

const INDIGENA_CATEGORY: &str = "INDIGENAS";
const UCS_SNIRH_CATEGORY: &str = "UCS_SNIRH";
const UCS_CATEGORY: &str = "UCS";

/// One stored result as reported: ids and decimals as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailResult {
    pub category_code: String,
    pub dataset_code: String,
    pub snapshot_date: Option<NaiveDate>,
    pub feature_id: Option<String>,
    pub geom_id: Option<String>,
    pub is_sicar: bool,
    pub sicar_area_m2: Option<String>,
    pub feature_area_m2: Option<String>,
    pub overlap_area_m2: Option<String>,
    pub overlap_pct_of_sicar: Option<String>,
}

impl From<&AnalysisResultRecord> for DetailResult {
    fn from(row: &AnalysisResultRecord) -> Self {
        Self {
            category_code: row.category_code.clone(),
            dataset_code: row.dataset_code.clone(),
            snapshot_date: row.snapshot_date,
            feature_id: row.feature_id.as_ref().map(ToString::to_string),
            geom_id: row.geom_id.as_ref().map(ToString::to_string),
            is_sicar: is_base_result(row),
            sicar_area_m2: row.sicar_area_m2.clone(),
            feature_area_m2: row.feature_area_m2.clone(),
            overlap_area_m2: row.overlap_area_m2.clone(),
            overlap_pct_of_sicar: row.overlap_pct_of_sicar.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocInfo {
    pub doc: String,
    pub doc_type: DocType,
    pub doc_flags: DocFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisDetail {
    pub id: String,
    pub car_key: String,
    pub analysis_date: Option<NaiveDate>,
    pub analysis_kind: AnalysisKind,
    pub status: AnalysisStatus,
    pub farm_id: Option<String>,
    pub schedule_id: Option<String>,
    pub analysis_docs: Vec<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub has_intersections: bool,
    pub intersection_count: i64,
    pub farm_name: Option<String>,
    pub municipio: Option<String>,
    pub uf: Option<String>,
    pub sicar_status: Option<String>,
    pub sicar_coordinates: Option<Coordinates>,
    pub biomas: Vec<String>,
    pub dataset_groups: Vec<DatasetGroup>,
    pub doc_infos: Vec<DocInfo>,
    pub results: Vec<DetailResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapRow {
    pub category_code: String,
    pub dataset_code: String,
    pub snapshot_date: Option<NaiveDate>,
    pub feature_id: Option<String>,
    pub geom: Value,
    pub is_sicar: bool,
}

/// Builds the analysis report and its map layer from stored results plus
/// spatial lookups at the analysis date.
pub struct DetailBuilder {
    store: Arc<dyn AnalysisStore>,
    spatial: Arc<dyn SpatialStore>,
    clock: Arc<dyn Clock>,
    default_tolerance: f64,
}

impl DetailBuilder {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        spatial: Arc<dyn SpatialStore>,
        clock: Arc<dyn Clock>,
        default_tolerance: f64,
    ) -> Self {
        Self {
            store,
            spatial,
            clock,
            default_tolerance: clamp_tolerance(Some(default_tolerance)),
        }
    }

    pub fn default_tolerance(&self) -> f64 {
        self.default_tolerance
    }

    /// Finite requests are clamped to `[0, 0.01]`; anything else gets the default.
    pub fn resolve_tolerance(&self, requested: Option<f64>) -> f64 {
        match requested {
            Some(value) if value.is_finite() => clamp_tolerance(Some(value)),
            _ => self.default_tolerance,
        }
    }

    pub async fn get_by_id(&self, analysis_id: &str) -> Result<AnalysisDetail, AnalysisError> {
        let analysis = self.load(analysis_id)?;
        let results = self.store.list_results(analysis_id)?;
        let kind = analysis.kind;
        let filtered: Vec<&AnalysisResultRecord> = results
            .iter()
            .filter(|row| {
                should_include_detail_result(
                    &row.category_code,
                    &row.dataset_code,
                    is_base_result(row),
                    kind,
                )
            })
            .collect();

        let now = self.clock.now();
        let as_of = analysis.analysis_date.unwrap_or_else(|| today(now));
        let current = is_current_date(as_of, now);

        let sicar_coordinates = self
            .spatial
            .registry_probe(&analysis.car_key, Some(as_of))
            .await?
            .and_then(|probe| probe.coordinates);
        let biomas = self.spatial.registry_biomes(&analysis.car_key, as_of).await?;
        let meta = self.registry_meta(&filtered, as_of, current).await?;
        let farm_name = match analysis.farm_id.as_deref() {
            Some(farm_id) => self.store.get_farm(farm_id)?.map(|farm| farm.name),
            None => None,
        };

        let (dataset_groups, doc_infos) = match kind {
            AnalysisKind::Deter => (
                build_deter_dataset_groups(
                    filtered
                        .iter()
                        .map(|row| (row.category_code.as_str(), row.dataset_code.as_str())),
                ),
                Vec::new(),
            ),
            AnalysisKind::Standard => {
                self.standard_groups(&analysis, &filtered, as_of, current)
                    .await?
            }
        };

        let results = filtered.iter().map(|row| DetailResult::from(*row)).collect();
        Ok(AnalysisDetail {
            id: analysis.id,
            car_key: analysis.car_key,
            analysis_date: analysis.analysis_date,
            analysis_kind: kind,
            status: analysis.status,
            farm_id: analysis.farm_id,
            schedule_id: analysis.schedule_id,
            analysis_docs: analysis.documents,
            created_by: analysis.created_by,
            created_at: analysis.created_at,
            started_at: analysis.started_at,
            completed_at: analysis.completed_at,
            has_intersections: analysis.has_intersections,
            intersection_count: analysis.intersection_count,
            farm_name,
            municipio: meta.municipio,
            uf: meta.uf,
            sicar_status: meta.status,
            sicar_coordinates,
            biomas,
            dataset_groups,
            doc_infos,
            results,
        })
    }

    pub async fn get_map_by_id(
        &self,
        analysis_id: &str,
        tolerance: Option<f64>,
    ) -> Result<Vec<MapRow>, AnalysisError> {
        let analysis = self.load(analysis_id)?;
        let tolerance = self.resolve_tolerance(tolerance);
        let results = self.store.list_results(analysis_id)?;
        let candidates: Vec<&AnalysisResultRecord> = results
            .iter()
            .filter(|row| is_map_candidate(row, analysis.kind))
            .collect();

        let rows = self.map_by_geometry_id(&candidates, tolerance).await;
        if !rows.is_empty() {
            return Ok(rows);
        }
        Ok(self
            .map_by_feature_history(&candidates, analysis.analysis_date, tolerance)
            .await)
    }

    /// Indigenous-land phases valid at `as_of` (today when absent).
    pub async fn list_indigena_phases(
        &self,
        as_of: Option<&str>,
    ) -> Result<Vec<String>, AnalysisError> {
        let now = self.clock.now();
        let date = resolve_analysis_date(as_of, now)?;
        self.indigena_phases(date, is_current_date(date, now), &[])
            .await
    }

    fn load(&self, analysis_id: &str) -> Result<AnalysisRecord, AnalysisError> {
        self.store
            .get_analysis(analysis_id)?
            .ok_or_else(|| AnalysisError::AnalysisNotFound(analysis_id.to_owned()))
    }

    async fn registry_meta(
        &self,
        filtered: &[&AnalysisResultRecord],
        as_of: NaiveDate,
        current: bool,
    ) -> Result<RegistryMeta, AnalysisError> {
        let registry_row = filtered.iter().find(|row| is_base_result(row));
        let Some((dataset_code, feature_id)) = registry_row
            .and_then(|row| row.feature_id.as_ref().map(|id| (&row.dataset_code, id)))
        else {
            return Ok(RegistryMeta::default());
        };
        let pack = self
            .spatial
            .registry_attributes(dataset_code, feature_id, as_of, current)
            .await?;
        Ok(pack
            .as_ref()
            .map(registry_meta_from_pack)
            .unwrap_or_default())
    }

    async fn standard_groups(
        &self,
        analysis: &AnalysisRecord,
        filtered: &[&AnalysisResultRecord],
        as_of: NaiveDate,
        current: bool,
    ) -> Result<(Vec<DatasetGroup>, Vec<DocInfo>), AnalysisError> {
        let docs = normalize_documents(&analysis.documents);
        let doc_matches = if docs.is_empty() {
            Vec::new()
        } else {
            self.spatial.document_matches(&docs, as_of).await?
        };
        let catalog = self.spatial.dataset_catalog().await?;

        let indigena_codes: Vec<String> = catalog
            .iter()
            .filter(|row| is_indigena_dataset(&row.category_code, &row.dataset_code))
            .map(|row| row.dataset_code.clone())
            .collect();
        let ucs_codes: Vec<String> = catalog
            .iter()
            .filter(|row| is_ucs_dataset(&row.category_code, &row.dataset_code))
            .map(|row| row.dataset_code.clone())
            .collect();

        let spatial_hits: BTreeSet<String> = filtered
            .iter()
            .filter(|row| is_spatial_hit(row))
            .map(|row| row.dataset_code.clone())
            .collect();
        let doc_hits: BTreeSet<String> = doc_matches
            .iter()
            .map(|row| row.dataset_code.clone())
            .collect();
        let doc_flags = doc_flags_for(&doc_matches);

        let indigena_targets = hit_targets(filtered, &indigena_codes, is_indigena_dataset);
        let ucs_targets = hit_targets(filtered, &ucs_codes, is_ucs_dataset);
        let enrichment = GroupEnrichment {
            indigena_phases: self.indigena_phases(as_of, current, &indigena_codes).await?,
            indigena_hits: self
                .attribute_hits(ActiveView::IndigenaPhase, INDIGENA_PHASE_KEYS, &indigena_targets, as_of, current)
                .await?,
            ucs_categories: self.ucs_categories(as_of, current, &ucs_codes).await?,
            ucs_hits: self
                .attribute_hits(ActiveView::UcsSigla, UCS_SIGLA_KEYS, &ucs_targets, as_of, current)
                .await?,
        };

        let groups = build_dataset_groups(&catalog, &spatial_hits, &doc_hits, &enrichment);
        let doc_infos = docs
            .into_iter()
            .map(|doc| DocInfo {
                doc_type: doc_type_for(&doc),
                doc_flags: doc_flags.get(&doc).copied().unwrap_or_default(),
                doc,
            })
            .collect();
        Ok((groups, doc_infos))
    }

    async fn indigena_phases(
        &self,
        as_of: NaiveDate,
        current: bool,
        dataset_codes: &[String],
    ) -> Result<Vec<String>, AnalysisError> {
        if current {
            match self
                .spatial
                .active_attribute_values(ActiveView::IndigenaPhase, dataset_codes, None)
                .await
            {
                Ok(values) => return Ok(values),
                Err(err) => {
                    tracing::debug!(error = %err, "active phase view unavailable, using attribute history");
                }
            }
        }
        Ok(self
            .spatial
            .distinct_attribute_values(INDIGENA_CATEGORY, dataset_codes, INDIGENA_PHASE_KEYS, as_of)
            .await?)
    }

    async fn ucs_categories(
        &self,
        as_of: NaiveDate,
        current: bool,
        dataset_codes: &[String],
    ) -> Result<Vec<String>, AnalysisError> {
        if current {
            match self
                .spatial
                .active_attribute_values(ActiveView::UcsSigla, dataset_codes, None)
                .await
            {
                Ok(values) => return Ok(values),
                Err(err) => {
                    tracing::debug!(error = %err, "active conservation view unavailable, using attribute history");
                }
            }
        }
        if !dataset_codes.is_empty() {
            return Ok(self
                .spatial
                .distinct_attribute_values(UCS_SNIRH_CATEGORY, dataset_codes, UCS_SIGLA_KEYS, as_of)
                .await?);
        }
        let (snirh, ucs) = tokio::try_join!(
            self.spatial
                .distinct_attribute_values(UCS_SNIRH_CATEGORY, &[], UCS_SIGLA_KEYS, as_of),
            self.spatial
                .distinct_attribute_values(UCS_CATEGORY, &[], UCS_SIGLA_KEYS, as_of),
        )?;
        let merged: BTreeSet<String> = snirh.into_iter().chain(ucs).collect();
        Ok(merged.into_iter().collect())
    }

    /// Attribute values of the intersected features, from the active view when
    /// current, else from the attribute packs valid at `as_of`.
    async fn attribute_hits(
        &self,
        view: ActiveView,
        keys: &[&str],
        targets: &[FeatureTarget],
        as_of: NaiveDate,
        current: bool,
    ) -> Result<BTreeSet<String>, AnalysisError> {
        if current {
            let feature_ids: Vec<FeatureId> = targets
                .iter()
                .filter_map(|target| target.feature_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if feature_ids.is_empty() {
                return Ok(BTreeSet::new());
            }
            let dataset_codes: Vec<String> = targets
                .iter()
                .map(|target| target.dataset_code.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            match self
                .spatial
                .active_attribute_values(view, &dataset_codes, Some(&feature_ids))
                .await
            {
                Ok(values) => return Ok(values.into_iter().collect()),
                Err(err) => {
                    tracing::debug!(view = view.relation(), error = %err, "active view unavailable for hits");
                }
            }
        }
        Ok(self
            .spatial
            .attribute_values_for_features(targets, keys, as_of)
            .await?)
    }

    async fn map_by_geometry_id(
        &self,
        candidates: &[&AnalysisResultRecord],
        tolerance: f64,
    ) -> Vec<MapRow> {
        let geom_ids: Vec<FeatureId> = candidates
            .iter()
            .filter_map(|row| row.geom_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if geom_ids.is_empty() {
            return Vec::new();
        }

        let spatial = self.spatial.as_ref();
        let geometries = match with_reconnect(spatial, "geometries_by_id", || {
            spatial.geometries_by_id(&geom_ids, tolerance)
        })
        .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "map geometry lookup failed");
                return Vec::new();
            }
        };
        let by_id: HashMap<FeatureId, Value> = geometries
            .into_iter()
            .map(|row| (row.geom_id, row.geometry))
            .collect();

        candidates
            .iter()
            .filter_map(|row| {
                let geom = by_id.get(row.geom_id.as_ref()?)?;
                Some(map_row(row, geom.clone()))
            })
            .collect()
    }

    async fn map_by_feature_history(
        &self,
        candidates: &[&AnalysisResultRecord],
        as_of: Option<NaiveDate>,
        tolerance: f64,
    ) -> Vec<MapRow> {
        let targets: Vec<FeatureTarget> = candidates
            .iter()
            .filter(|row| row.feature_id.is_some())
            .map(|row| FeatureTarget {
                category_code: row.category_code.clone(),
                dataset_code: row.dataset_code.clone(),
                feature_id: row.feature_id.clone(),
            })
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let spatial = self.spatial.as_ref();
        let geometries = match with_reconnect(spatial, "geometries_by_feature", || {
            spatial.geometries_by_feature(&targets, as_of, tolerance)
        })
        .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "map history geometry lookup failed");
                return Vec::new();
            }
        };
        let mut by_feature: HashMap<(String, FeatureId), Vec<Value>> = HashMap::new();
        for row in geometries {
            by_feature
                .entry((row.dataset_code, row.feature_id))
                .or_default()
                .push(row.geometry);
        }

        let mut rows = Vec::new();
        for row in candidates {
            let Some(feature_id) = row.feature_id.clone() else {
                continue;
            };
            if let Some(geoms) = by_feature.get(&(row.dataset_code.clone(), feature_id)) {
                rows.extend(geoms.iter().map(|geom| map_row(row, geom.clone())));
            }
        }
        rows
    }
}

fn is_base_result(row: &AnalysisResultRecord) -> bool {
    is_base_registry_row(
        &row.category_code,
        row.feature_area_m2.as_deref(),
        row.overlap_area_m2.as_deref(),
    )
}

/// Kind filter for the map layer; registry-encoded datasets only render as
/// the base polygon.
fn is_map_candidate(row: &AnalysisResultRecord, kind: AnalysisKind) -> bool {
    let car_encoded = row.dataset_code.to_ascii_uppercase().starts_with("CAR_");
    if car_encoded && row.feature_area_m2.is_some() {
        return false;
    }
    should_keep_map_row(&row.category_code, &row.dataset_code, kind)
}

fn map_row(row: &AnalysisResultRecord, geom: Value) -> MapRow {
    MapRow {
        category_code: row.category_code.clone(),
        dataset_code: row.dataset_code.clone(),
        snapshot_date: row.snapshot_date,
        feature_id: row.feature_id.as_ref().map(ToString::to_string),
        geom,
        is_sicar: row.category_code.eq_ignore_ascii_case("SICAR"),
    }
}

fn is_spatial_hit(row: &AnalysisResultRecord) -> bool {
    if row.is_sicar {
        return false;
    }
    let category = row.category_code.to_uppercase();
    if matches!(category.as_str(), "BIOMAS" | "DETER" | "SICAR") {
        return false;
    }
    let dataset = row.dataset_code.to_uppercase();
    !(dataset.starts_with("CAR_") || dataset.starts_with("DETER"))
}

/// Results in the enrichment datasets; with no such datasets in the catalog
/// the dataset predicate decides instead.
fn hit_targets(
    filtered: &[&AnalysisResultRecord],
    dataset_codes: &[String],
    fallback: fn(&str, &str) -> bool,
) -> Vec<FeatureTarget> {
    let codes: BTreeSet<String> = dataset_codes.iter().map(|code| code.to_uppercase()).collect();
    filtered
        .iter()
        .filter(|row| {
            if codes.is_empty() {
                fallback(&row.category_code, &row.dataset_code)
            } else {
                codes.contains(&row.dataset_code.to_uppercase())
            }
        })
        .map(|row| FeatureTarget {
            category_code: row.category_code.clone(),
            dataset_code: row.dataset_code.clone(),
            feature_id: row.feature_id.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use landwatch_core::ManualClock;
    use landwatch_store::{
        AttrPackRow, CompletionSummary, DatasetRow, DocIndexRow, MemorySpatialStore, NewAnalysis,
        RegistryProbe, SpatialError, SqliteStore,
    };
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::classify::{CONSERVATION_GROUP, DETER_GROUP, ENVIRONMENTAL_GROUP, SOCIAL_GROUP};

    struct Fixture {
        _temp: TempDir,
        store: Arc<SqliteStore>,
        spatial: Arc<MemorySpatialStore>,
        builder: DetailBuilder,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::open(temp.path().join("app.sqlite")).expect("store"));
        let spatial = Arc::new(MemorySpatialStore::new());
        let clock = Arc::new(ManualClock::new(now()));
        let builder = DetailBuilder::new(store.clone(), spatial.clone(), clock, 0.0001);
        Fixture {
            _temp: temp,
            store,
            spatial,
            builder,
        }
    }

    fn result(category: &str, dataset: &str, feature: i64, base: bool) -> AnalysisResultRecord {
        AnalysisResultRecord {
            analysis_id: String::new(),
            category_code: category.to_owned(),
            dataset_code: dataset.to_owned(),
            snapshot_date: None,
            feature_id: Some(FeatureId::from(feature)),
            geom_id: Some(FeatureId::from(feature * 10)),
            is_sicar: base,
            sicar_area_m2: Some("1000".to_owned()),
            feature_area_m2: (!base).then(|| "200".to_owned()),
            overlap_area_m2: (!base).then(|| "20.5".to_owned()),
            overlap_pct_of_sicar: (!base).then(|| "2.05".to_owned()),
        }
    }

    fn seed(
        fixture: &Fixture,
        kind: AnalysisKind,
        analysis_date: Option<NaiveDate>,
        documents: Vec<String>,
        results: Vec<AnalysisResultRecord>,
    ) -> String {
        let id = format!("a-{}", kind.as_str());
        fixture
            .store
            .create_analysis(
                NewAnalysis {
                    id: id.clone(),
                    car_key: "PA-1".to_owned(),
                    analysis_date,
                    kind,
                    farm_id: None,
                    schedule_id: None,
                    documents,
                    created_by: None,
                    created_at: now(),
                },
                None,
                &[],
            )
            .expect("create analysis");
        let results: Vec<AnalysisResultRecord> = results
            .into_iter()
            .map(|mut row| {
                row.analysis_id = id.clone();
                row
            })
            .collect();
        fixture
            .store
            .claim_pending(&id, now())
            .expect("claim analysis");
        fixture
            .store
            .complete_analysis(
                &id,
                &results,
                CompletionSummary {
                    completed_at: now(),
                    has_intersections: true,
                    intersection_count: results.len() as i64,
                },
            )
            .expect("complete analysis");
        id
    }

    fn catalog() -> Vec<DatasetRow> {
        let row = |code: &str, category: &str, is_spatial: bool| DatasetRow {
            dataset_code: code.to_owned(),
            category_code: category.to_owned(),
            description: None,
            is_spatial,
        };
        vec![
            row("CAR_PA", "SICAR", true),
            row("BIOMAS_IBGE", "BIOMAS", true),
            row("TERRAS_INDIGENAS", "INDIGENAS", true),
            row("UNIDADES_CONSERVACAO", "UCS", true),
            row("PRODES_CERRADO_2023", "PRODES", true),
            row("CADASTRO_EMPREGADORES", "CADASTRO_EMPREGADORES", false),
            row("EMBARGOS_IBAMA", "EMBARGOS_IBAMA", true),
        ]
    }

    #[tokio::test]
    async fn unknown_analysis_is_reported() {
        let fixture = fixture();
        let err = fixture.builder.get_by_id("missing").await.expect_err("not found");
        assert_eq!(err.code(), "ANALYSIS_NOT_FOUND");
        let err = fixture
            .builder
            .get_map_by_id("missing", None)
            .await
            .expect_err("not found");
        assert!(matches!(err, AnalysisError::AnalysisNotFound(_)));
    }

    #[tokio::test]
    async fn standard_detail_groups_hits_and_documents() {
        let fixture = fixture();
        let as_of = date(2024, 1, 15);
        let id = seed(
            &fixture,
            AnalysisKind::Standard,
            Some(as_of),
            vec!["123.456.789-09".to_owned()],
            vec![
                result("SICAR", "CAR_PA", 1, true),
                result("BIOMAS", "BIOMAS_IBGE", 2, false),
                result("INDIGENAS", "TERRAS_INDIGENAS", 3, false),
                result("UCS", "UNIDADES_CONSERVACAO", 4, false),
                result("PRODES", "PRODES_CERRADO_2023", 5, false),
                result("DETER", "DETER_AMZ", 6, false),
            ],
        );

        fixture.spatial.set_catalog(catalog());
        fixture.spatial.add_registry(
            "PA-1",
            RegistryProbe {
                coordinates: Some(Coordinates {
                    lat: -3.2,
                    lng: -52.2,
                }),
            },
        );
        fixture
            .spatial
            .set_biomes("PA-1", vec!["Amazônia".to_owned()]);
        fixture.spatial.set_registry_pack(
            "CAR_PA",
            FeatureId::from(1_i64),
            json!({ "municipio": "Altamira", "cod_estado": "PA", "des_condic": "Ativo" }),
        );
        let pack = |dataset: &str, category: &str, feature: i64, value: Value| AttrPackRow {
            category_code: category.to_owned(),
            dataset_code: dataset.to_owned(),
            feature_id: FeatureId::from(feature),
            pack: value,
            valid_from: date(2020, 1, 1),
            valid_to: None,
        };
        fixture.spatial.add_attr_pack(pack(
            "TERRAS_INDIGENAS",
            "INDIGENAS",
            3,
            json!({ "fase_ti": "Declarada" }),
        ));
        fixture.spatial.add_attr_pack(pack(
            "TERRAS_INDIGENAS",
            "INDIGENAS",
            30,
            json!({ "FASE_TI": "Homologada" }),
        ));
        fixture.spatial.add_attr_pack(pack(
            "UNIDADES_CONSERVACAO",
            "UCS",
            4,
            json!({ "SiglaCateg": "PARNA" }),
        ));
        fixture.spatial.add_doc_index(DocIndexRow {
            dataset_code: "CADASTRO_EMPREGADORES".to_owned(),
            category_code: "CADASTRO_EMPREGADORES".to_owned(),
            doc_normalized: "12345678909".to_owned(),
            valid_from: date(2023, 1, 1),
            valid_to: None,
            date_closed: None,
        });

        let detail = fixture.builder.get_by_id(&id).await.expect("detail");

        assert_eq!(detail.municipio.as_deref(), Some("Altamira"));
        assert_eq!(detail.uf.as_deref(), Some("PA"));
        assert_eq!(detail.sicar_status.as_deref(), Some("Ativo"));
        assert_eq!(detail.biomas, vec!["Amazônia".to_owned()]);
        assert!(detail.sicar_coordinates.is_some());
        assert!(detail.results.iter().all(|row| row.dataset_code != "DETER_AMZ"));
        assert_eq!(detail.results[0].feature_id.as_deref(), Some("1"));
        assert!(detail.results[0].is_sicar);

        let titles: Vec<&str> = detail
            .dataset_groups
            .iter()
            .map(|group| group.title.as_str())
            .collect();
        assert_eq!(
            titles,
            vec![
                SOCIAL_GROUP,
                ENVIRONMENTAL_GROUP,
                CONSERVATION_GROUP,
                "Desmatamento Prodes Cerrado"
            ]
        );
        let social = &detail.dataset_groups[0];
        assert!(social.items[0].hit);
        let environmental = &detail.dataset_groups[1];
        let declarada = environmental
            .items
            .iter()
            .find(|item| item.dataset_code == "INDIGENAS_Declarada")
            .expect("declarada item");
        assert!(declarada.hit);
        let homologada = environmental
            .items
            .iter()
            .find(|item| item.dataset_code == "INDIGENAS_Homologada")
            .expect("homologada item");
        assert!(!homologada.hit);
        let embargo = environmental
            .items
            .iter()
            .find(|item| item.dataset_code == "EMBARGOS_IBAMA")
            .expect("embargo item");
        assert!(!embargo.hit);
        assert!(detail.dataset_groups[2].items[0].hit);
        assert!(detail.dataset_groups[3].items[0].hit);

        assert_eq!(detail.doc_infos.len(), 1);
        assert_eq!(detail.doc_infos[0].doc_type, DocType::Cpf);
        assert!(detail.doc_infos[0].doc_flags.mte);
        assert_eq!(fixture.spatial.calls("active_attribute_values"), 0);
    }

    #[tokio::test]
    async fn current_date_uses_active_views_and_falls_back_when_missing() {
        let fixture = fixture();
        let id = seed(
            &fixture,
            AnalysisKind::Standard,
            Some(today(now())),
            Vec::new(),
            vec![
                result("SICAR", "CAR_PA", 1, true),
                result("INDIGENAS", "TERRAS_INDIGENAS", 3, false),
            ],
        );
        fixture.spatial.set_catalog(catalog());
        fixture.spatial.set_active_view(
            ActiveView::IndigenaPhase,
            vec![
                ("TERRAS_INDIGENAS".to_owned(), FeatureId::from(3_i64), "Regularizada".to_owned()),
                ("TERRAS_INDIGENAS".to_owned(), FeatureId::from(9_i64), "Em Estudo".to_owned()),
            ],
        );

        let detail = fixture.builder.get_by_id(&id).await.expect("detail");

        let environmental = detail
            .dataset_groups
            .iter()
            .find(|group| group.title == ENVIRONMENTAL_GROUP)
            .expect("environmental group");
        let labels: Vec<(&str, bool)> = environmental
            .items
            .iter()
            .filter(|item| item.dataset_code.starts_with("INDIGENAS_"))
            .map(|item| (item.label.as_deref().unwrap_or_default(), item.hit))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("Terra Indigena Em Estudo", false),
                ("Terra Indigena Regularizada", true)
            ]
        );
        assert!(fixture.spatial.calls("distinct_attribute_values") >= 1);
    }

    #[tokio::test]
    async fn deter_detail_lists_alert_datasets_only() {
        let fixture = fixture();
        let id = seed(
            &fixture,
            AnalysisKind::Deter,
            Some(date(2024, 2, 1)),
            vec!["12345678909".to_owned()],
            vec![
                result("SICAR", "CAR_PA", 1, true),
                result("DETER", "DETER_AMZ", 2, false),
                result("BIOMAS", "BIOMAS_IBGE", 3, false),
                result("PRODES", "PRODES_CERRADO_2023", 4, false),
            ],
        );

        let detail = fixture.builder.get_by_id(&id).await.expect("detail");

        assert_eq!(detail.dataset_groups.len(), 1);
        assert_eq!(detail.dataset_groups[0].title, DETER_GROUP);
        assert_eq!(detail.dataset_groups[0].items[0].dataset_code, "DETER_AMZ");
        assert!(detail.doc_infos.is_empty());
        assert_eq!(detail.results.len(), 2);
        assert_eq!(fixture.spatial.calls("dataset_catalog"), 0);
    }

    #[tokio::test]
    async fn map_rows_follow_kind_filter() {
        let fixture = fixture();
        let rows = vec![
            result("SICAR", "CAR_PA", 1, true),
            result("BIOMAS", "BIOMAS_IBGE", 2, false),
            result("DETER", "DETER_AMZ", 3, false),
            result("PRODES", "PRODES_CERRADO_2023", 4, false),
        ];
        for geom_id in [10_i64, 20, 30, 40] {
            fixture.spatial.add_geometry(
                FeatureId::from(geom_id),
                json!({ "type": "Point", "coordinates": [geom_id, 0] }),
            );
        }
        let standard = seed(
            &fixture,
            AnalysisKind::Standard,
            Some(date(2024, 1, 1)),
            Vec::new(),
            rows.clone(),
        );
        let deter = seed(&fixture, AnalysisKind::Deter, Some(date(2024, 1, 1)), Vec::new(), rows);

        let standard_rows = fixture
            .builder
            .get_map_by_id(&standard, Some(f64::NAN))
            .await
            .expect("standard map");
        let categories: Vec<&str> = standard_rows
            .iter()
            .map(|row| row.category_code.as_str())
            .collect();
        assert_eq!(categories, vec!["SICAR", "PRODES"]);
        assert!(standard_rows[0].is_sicar);
        assert_eq!(standard_rows[1].feature_id.as_deref(), Some("4"));

        let deter_rows = fixture
            .builder
            .get_map_by_id(&deter, Some(1.0))
            .await
            .expect("deter map");
        let categories: Vec<&str> = deter_rows
            .iter()
            .map(|row| row.category_code.as_str())
            .collect();
        assert_eq!(categories, vec!["SICAR", "DETER"]);
    }

    #[tokio::test]
    async fn map_falls_back_to_geometry_history() {
        let fixture = fixture();
        let id = seed(
            &fixture,
            AnalysisKind::Standard,
            Some(date(2024, 1, 1)),
            Vec::new(),
            vec![result("PRODES", "PRODES_CERRADO_2023", 4, false)],
        );
        fixture.spatial.add_hist_geometry(
            "PRODES_CERRADO_2023",
            FeatureId::from(4_i64),
            json!({ "type": "Point", "coordinates": [1, 1] }),
            date(2023, 1, 1),
            None,
        );
        fixture.spatial.add_hist_geometry(
            "PRODES_CERRADO_2023",
            FeatureId::from(4_i64),
            json!({ "type": "Point", "coordinates": [9, 9] }),
            date(2010, 1, 1),
            Some(date(2023, 1, 1)),
        );

        let rows = fixture.builder.get_map_by_id(&id, None).await.expect("map");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].geom["coordinates"], json!([1, 1]));
        assert_eq!(fixture.spatial.calls("geometries_by_feature"), 1);
    }

    #[tokio::test]
    async fn primary_map_query_retries_once_on_transient_failure() {
        let fixture = fixture();
        let id = seed(
            &fixture,
            AnalysisKind::Standard,
            None,
            Vec::new(),
            vec![result("PRODES", "PRODES_CERRADO_2023", 4, false)],
        );
        fixture
            .spatial
            .add_geometry(FeatureId::from(40_i64), json!({ "type": "Point" }));
        fixture.spatial.fail_next(
            "geometries_by_id",
            SpatialError::Transient("connection reset".to_owned()),
        );

        let rows = fixture.builder.get_map_by_id(&id, None).await.expect("map");
        assert_eq!(rows.len(), 1);
        assert_eq!(fixture.spatial.calls("geometries_by_id"), 2);
        assert_eq!(fixture.spatial.calls("reconnect"), 1);
    }

    #[tokio::test]
    async fn persistent_map_failures_degrade_to_empty() {
        let fixture = fixture();
        let id = seed(
            &fixture,
            AnalysisKind::Standard,
            None,
            Vec::new(),
            vec![result("PRODES", "PRODES_CERRADO_2023", 4, false)],
        );
        for _ in 0..2 {
            fixture
                .spatial
                .fail_next("geometries_by_id", SpatialError::Transient("57P01".to_owned()));
        }
        fixture
            .spatial
            .fail_next("geometries_by_feature", SpatialError::Query("boom".to_owned()));

        let rows = fixture.builder.get_map_by_id(&id, None).await.expect("map");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn indigena_phases_reject_invalid_dates() {
        let fixture = fixture();
        fixture.spatial.add_attr_pack(AttrPackRow {
            category_code: "INDIGENAS".to_owned(),
            dataset_code: "TERRAS_INDIGENAS".to_owned(),
            feature_id: FeatureId::from(1_i64),
            pack: json!({ "faseTi": "Delimitada" }),
            valid_from: date(2020, 1, 1),
            valid_to: None,
        });

        let phases = fixture
            .builder
            .list_indigena_phases(Some("2023-05-01"))
            .await
            .expect("phases");
        assert_eq!(phases, vec!["Delimitada".to_owned()]);

        let err = fixture
            .builder
            .list_indigena_phases(Some("not-a-date"))
            .await
            .expect_err("invalid date");
        assert_eq!(err.code(), "INVALID_DATE");
    }

    #[test]
    fn tolerance_is_clamped_and_defaults_when_not_finite() {
        let fixture = fixture();
        assert_eq!(fixture.builder.resolve_tolerance(None), 0.0001);
        assert_eq!(fixture.builder.resolve_tolerance(Some(f64::INFINITY)), 0.0001);
        assert_eq!(fixture.builder.resolve_tolerance(Some(-1.0)), 0.0);
        assert_eq!(fixture.builder.resolve_tolerance(Some(5.0)), 0.01);
    }
}
