use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use landwatch_core::{AnalysisKind, FeatureId};
use serde_json::Value;

use crate::spatial::{
    ActiveView, DatasetRow, DocMatchRow, FeatureGeometry, FeatureTarget, GeometryRow,
    IntersectionRow, RegistryProbe, SpatialError, SpatialStore,
};

/// Time-versioned attribute pack of one feature.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrPackRow {
    pub category_code: String,
    pub dataset_code: String,
    pub feature_id: FeatureId,
    pub pack: Value,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocIndexRow {
    pub dataset_code: String,
    pub category_code: String,
    pub doc_normalized: String,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
    pub date_closed: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
struct HistGeometry {
    dataset_code: String,
    feature_id: FeatureId,
    geometry: Value,
    valid_from: NaiveDate,
    valid_to: Option<NaiveDate>,
}

#[derive(Debug, Default)]
struct MemoryState {
    intersections: HashMap<String, Vec<IntersectionRow>>,
    intersection_calls: Vec<(String, Option<NaiveDate>, AnalysisKind)>,
    registries: HashMap<String, RegistryProbe>,
    biomes: HashMap<String, Vec<String>>,
    registry_packs: HashMap<(String, FeatureId), Value>,
    catalog: Vec<DatasetRow>,
    attr_packs: Vec<AttrPackRow>,
    active_views: HashMap<ActiveView, Vec<(String, FeatureId, String)>>,
    doc_index: Vec<DocIndexRow>,
    geometries: HashMap<FeatureId, Value>,
    hist_geometries: Vec<HistGeometry>,
    refreshing: bool,
    latency: Option<Duration>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<SpatialError>>,
}

/// In-process spatial store used by tests and local runs.
///
/// Every operation is counted under its method name, and failures can be
/// scripted per method with [`MemorySpatialStore::fail_next`]. An active view
/// that was never populated behaves like a missing relation.
#[derive(Debug, Default)]
pub struct MemorySpatialStore {
    state: Mutex<MemoryState>,
}

impl MemorySpatialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_intersections(&self, car_key: &str, rows: Vec<IntersectionRow>) {
        self.state().intersections.insert(car_key.to_owned(), rows);
    }

    pub fn add_registry(&self, car_key: &str, probe: RegistryProbe) {
        self.state().registries.insert(car_key.to_owned(), probe);
    }

    pub fn set_biomes(&self, car_key: &str, biomes: Vec<String>) {
        self.state().biomes.insert(car_key.to_owned(), biomes);
    }

    pub fn set_registry_pack(&self, dataset_code: &str, feature_id: FeatureId, pack: Value) {
        self.state()
            .registry_packs
            .insert((dataset_code.to_owned(), feature_id), pack);
    }

    pub fn set_catalog(&self, catalog: Vec<DatasetRow>) {
        self.state().catalog = catalog;
    }

    pub fn add_attr_pack(&self, row: AttrPackRow) {
        self.state().attr_packs.push(row);
    }

    pub fn set_active_view(&self, view: ActiveView, rows: Vec<(String, FeatureId, String)>) {
        self.state().active_views.insert(view, rows);
    }

    pub fn add_doc_index(&self, row: DocIndexRow) {
        self.state().doc_index.push(row);
    }

    pub fn add_geometry(&self, geom_id: FeatureId, geometry: Value) {
        self.state().geometries.insert(geom_id, geometry);
    }

    pub fn add_hist_geometry(
        &self,
        dataset_code: &str,
        feature_id: FeatureId,
        geometry: Value,
        valid_from: NaiveDate,
        valid_to: Option<NaiveDate>,
    ) {
        self.state().hist_geometries.push(HistGeometry {
            dataset_code: dataset_code.to_owned(),
            feature_id,
            geometry,
            valid_from,
            valid_to,
        });
    }

    pub fn set_refreshing(&self, refreshing: bool) {
        self.state().refreshing = refreshing;
    }

    /// Delay applied to every call, so concurrent callers overlap.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    pub fn fail_next(&self, operation: &'static str, error: SpatialError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn intersection_calls(&self) -> Vec<(String, Option<NaiveDate>, AnalysisKind)> {
        self.state().intersection_calls.clone()
    }

    async fn enter(&self, operation: &'static str) -> Result<(), SpatialError> {
        let (failure, latency) = {
            let mut state = self.state();
            *state.calls.entry(operation).or_default() += 1;
            let failure = state
                .failures
                .get_mut(operation)
                .and_then(VecDeque::pop_front);
            (failure, state.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn valid_at(valid_from: NaiveDate, valid_to: Option<NaiveDate>, as_of: NaiveDate) -> bool {
    valid_from <= as_of && valid_to.is_none_or(|end| end > as_of)
}

fn pack_value(pack: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        let value = match pack.get(*key)? {
            Value::String(text) => text.trim().to_owned(),
            Value::Number(number) => number.to_string(),
            _ => return None,
        };
        (!value.is_empty()).then_some(value)
    })
}

#[async_trait]
impl SpatialStore for MemorySpatialStore {
    async fn intersections(
        &self,
        car_key: &str,
        as_of: Option<NaiveDate>,
        kind: AnalysisKind,
    ) -> Result<Vec<IntersectionRow>, SpatialError> {
        self.enter("intersections").await?;
        let mut state = self.state();
        state
            .intersection_calls
            .push((car_key.to_owned(), as_of, kind));
        Ok(state.intersections.get(car_key).cloned().unwrap_or_default())
    }

    async fn registry_probe(
        &self,
        car_key: &str,
        _as_of: Option<NaiveDate>,
    ) -> Result<Option<RegistryProbe>, SpatialError> {
        self.enter("registry_probe").await?;
        Ok(self.state().registries.get(car_key).copied())
    }

    async fn registry_biomes(
        &self,
        car_key: &str,
        _as_of: NaiveDate,
    ) -> Result<Vec<String>, SpatialError> {
        self.enter("registry_biomes").await?;
        Ok(self.state().biomes.get(car_key).cloned().unwrap_or_default())
    }

    async fn registry_attributes(
        &self,
        dataset_code: &str,
        feature_id: &FeatureId,
        _as_of: NaiveDate,
        _use_active: bool,
    ) -> Result<Option<Value>, SpatialError> {
        self.enter("registry_attributes").await?;
        Ok(self
            .state()
            .registry_packs
            .get(&(dataset_code.to_owned(), feature_id.clone()))
            .cloned())
    }

    async fn dataset_catalog(&self) -> Result<Vec<DatasetRow>, SpatialError> {
        self.enter("dataset_catalog").await?;
        let mut catalog = self.state().catalog.clone();
        catalog.sort_by(|left, right| {
            (&left.category_code, &left.dataset_code)
                .cmp(&(&right.category_code, &right.dataset_code))
        });
        Ok(catalog)
    }

    async fn active_attribute_values(
        &self,
        view: ActiveView,
        dataset_codes: &[String],
        feature_ids: Option<&[FeatureId]>,
    ) -> Result<Vec<String>, SpatialError> {
        self.enter("active_attribute_values").await?;
        let state = self.state();
        let rows = state.active_views.get(&view).ok_or_else(|| {
            SpatialError::Query(format!("relation \"{}\" does not exist", view.relation()))
        })?;
        let values: BTreeSet<String> = rows
            .iter()
            .filter(|(dataset, _, _)| dataset_codes.is_empty() || dataset_codes.contains(dataset))
            .filter(|(_, feature, _)| feature_ids.is_none_or(|ids| ids.contains(feature)))
            .map(|(_, _, value)| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .collect();
        Ok(values.into_iter().collect())
    }

    async fn distinct_attribute_values(
        &self,
        category_code: &str,
        dataset_codes: &[String],
        keys: &[&str],
        as_of: NaiveDate,
    ) -> Result<Vec<String>, SpatialError> {
        self.enter("distinct_attribute_values").await?;
        let values: BTreeSet<String> = self
            .state()
            .attr_packs
            .iter()
            .filter(|row| {
                row.category_code == category_code || dataset_codes.contains(&row.dataset_code)
            })
            .filter(|row| valid_at(row.valid_from, row.valid_to, as_of))
            .filter_map(|row| pack_value(&row.pack, keys))
            .collect();
        Ok(values.into_iter().collect())
    }

    async fn attribute_values_for_features(
        &self,
        targets: &[FeatureTarget],
        keys: &[&str],
        as_of: NaiveDate,
    ) -> Result<BTreeSet<String>, SpatialError> {
        self.enter("attribute_values_for_features").await?;
        let datasets: HashSet<&str> = targets
            .iter()
            .map(|target| target.dataset_code.as_str())
            .collect();
        let features: HashSet<&FeatureId> = targets
            .iter()
            .filter_map(|target| target.feature_id.as_ref())
            .collect();
        if datasets.is_empty() || features.is_empty() {
            return Ok(BTreeSet::new());
        }
        Ok(self
            .state()
            .attr_packs
            .iter()
            .filter(|row| datasets.contains(row.dataset_code.as_str()))
            .filter(|row| features.contains(&row.feature_id))
            .filter(|row| valid_at(row.valid_from, row.valid_to, as_of))
            .filter_map(|row| pack_value(&row.pack, keys))
            .collect())
    }

    async fn document_matches(
        &self,
        docs: &[String],
        as_of: NaiveDate,
    ) -> Result<Vec<DocMatchRow>, SpatialError> {
        self.enter("document_matches").await?;
        Ok(self
            .state()
            .doc_index
            .iter()
            .filter(|row| docs.contains(&row.doc_normalized))
            .filter(|row| valid_at(row.valid_from, row.valid_to, as_of))
            .filter(|row| row.date_closed.is_none_or(|closed| closed > as_of))
            .map(|row| DocMatchRow {
                dataset_code: row.dataset_code.clone(),
                category_code: row.category_code.clone(),
                doc_normalized: row.doc_normalized.clone(),
            })
            .collect())
    }

    async fn geometries_by_id(
        &self,
        geom_ids: &[FeatureId],
        _tolerance: f64,
    ) -> Result<Vec<GeometryRow>, SpatialError> {
        self.enter("geometries_by_id").await?;
        let state = self.state();
        Ok(geom_ids
            .iter()
            .filter_map(|geom_id| {
                state.geometries.get(geom_id).map(|geometry| GeometryRow {
                    geom_id: geom_id.clone(),
                    geometry: geometry.clone(),
                })
            })
            .collect())
    }

    async fn geometries_by_feature(
        &self,
        targets: &[FeatureTarget],
        as_of: Option<NaiveDate>,
        _tolerance: f64,
    ) -> Result<Vec<FeatureGeometry>, SpatialError> {
        self.enter("geometries_by_feature").await?;
        let state = self.state();
        let mut rows = Vec::new();
        for target in targets {
            let Some(feature_id) = target.feature_id.as_ref() else {
                continue;
            };
            for hist in &state.hist_geometries {
                let valid = match as_of {
                    Some(date) => valid_at(hist.valid_from, hist.valid_to, date),
                    None => hist.valid_to.is_none(),
                };
                if valid && hist.dataset_code == target.dataset_code && &hist.feature_id == feature_id
                {
                    rows.push(FeatureGeometry {
                        dataset_code: hist.dataset_code.clone(),
                        feature_id: hist.feature_id.clone(),
                        geometry: hist.geometry.clone(),
                    });
                }
            }
        }
        Ok(rows)
    }

    async fn refresh_in_progress(&self) -> Result<bool, SpatialError> {
        self.enter("refresh_in_progress").await?;
        Ok(self.state().refreshing)
    }

    async fn reconnect(&self) -> Result<(), SpatialError> {
        self.enter("reconnect").await
    }
}
