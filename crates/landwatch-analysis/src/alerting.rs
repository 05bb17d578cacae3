use std::collections::BTreeSet;
use std::sync::Arc;

use landwatch_core::{
    AlertStatus, AnalysisKind, Clock, NEW_INTERSECTION_ALERT, intersection_key,
    is_intersection_row,
};
use landwatch_store::{AlertRecord, AnalysisResultRecord, AnalysisStore};
use serde::{Deserialize, Serialize};

use crate::AnalysisError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRequest {
    pub analysis_id: String,
    pub farm_id: String,
    pub schedule_id: Option<String>,
    pub analysis_kind: AnalysisKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIntersectionPayload {
    pub new_keys: Vec<String>,
    pub analysis_kind: AnalysisKind,
    pub previous_analysis_id: String,
    pub current_analysis_id: String,
}

/// `"{dataset}:{feature}"` for every row that counts as an intersection of `kind`.
pub fn intersection_keys(rows: &[AnalysisResultRecord], kind: AnalysisKind) -> BTreeSet<String> {
    rows.iter()
        .filter(|row| is_intersection_row(&row.category_code, &row.dataset_code, row.is_sicar, kind))
        .map(|row| intersection_key(&row.dataset_code, row.feature_id.as_ref()))
        .collect()
}

pub struct AlertingEngine {
    store: Arc<dyn AnalysisStore>,
    clock: Arc<dyn Clock>,
}

impl AlertingEngine {
    pub fn new(store: Arc<dyn AnalysisStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Records one alert when the analysis exposes keys missing from the
    /// farm's previous completed run of the same kind. The first run of a
    /// farm/kind pair never alerts.
    pub fn create_alert_for_novel_intersections(
        &self,
        request: &AlertRequest,
    ) -> Result<Option<AlertRecord>, AnalysisError> {
        let Some(previous_id) = self.store.find_previous_completed(
            &request.farm_id,
            request.analysis_kind,
            &request.analysis_id,
        )?
        else {
            return Ok(None);
        };

        let current_rows = self.store.list_results(&request.analysis_id)?;
        let previous_rows = self.store.list_results(&previous_id)?;
        let current = intersection_keys(&current_rows, request.analysis_kind);
        let previous = intersection_keys(&previous_rows, request.analysis_kind);

        let new_keys: Vec<String> = current.difference(&previous).cloned().collect();
        if new_keys.is_empty() {
            return Ok(None);
        }

        let payload = NewIntersectionPayload {
            new_keys,
            analysis_kind: request.analysis_kind,
            previous_analysis_id: previous_id,
            current_analysis_id: request.analysis_id.clone(),
        };
        let record = AlertRecord {
            id: uuid::Uuid::new_v4().to_string(),
            farm_id: request.farm_id.clone(),
            schedule_id: request.schedule_id.clone(),
            analysis_id: request.analysis_id.clone(),
            analysis_kind: request.analysis_kind,
            alert_type: NEW_INTERSECTION_ALERT.to_owned(),
            new_intersection_count: payload.new_keys.len() as i64,
            status: AlertStatus::New,
            payload: serde_json::to_value(&payload)?,
            created_at: self.clock.now(),
        };
        self.store.insert_alert(&record)?;
        tracing::info!(
            event = "analysis.alert.created",
            analysis_id = %record.analysis_id,
            farm_id = %record.farm_id,
            new_intersection_count = record.new_intersection_count,
            "new intersections detected"
        );
        Ok(Some(record))
    }

    /// Most recent first.
    pub fn list(
        &self,
        status: Option<AlertStatus>,
        limit: u32,
    ) -> Result<Vec<AlertRecord>, AnalysisError> {
        Ok(self.store.list_alerts(status, limit)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use landwatch_core::{FeatureId, ManualClock};
    use landwatch_store::{CompletionSummary, NewAnalysis, SqliteStore};
    use tempfile::TempDir;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn row(category: &str, dataset: &str, feature: Option<i64>, is_sicar: bool) -> AnalysisResultRecord {
        AnalysisResultRecord {
            analysis_id: String::new(),
            category_code: category.to_owned(),
            dataset_code: dataset.to_owned(),
            snapshot_date: None,
            feature_id: feature.map(FeatureId::from),
            geom_id: None,
            is_sicar,
            sicar_area_m2: None,
            feature_area_m2: None,
            overlap_area_m2: None,
            overlap_pct_of_sicar: None,
        }
    }

    struct Fixture {
        _temp: TempDir,
        store: Arc<SqliteStore>,
        clock: Arc<ManualClock>,
        engine: AlertingEngine,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::open(temp.path().join("app.sqlite")).expect("store"));
        let clock = Arc::new(ManualClock::new(now()));
        let engine = AlertingEngine::new(store.clone(), clock.clone());
        Fixture {
            _temp: temp,
            store,
            clock,
            engine,
        }
    }

    fn completed(
        fixture: &Fixture,
        id: &str,
        kind: AnalysisKind,
        rows: Vec<AnalysisResultRecord>,
    ) {
        fixture
            .store
            .create_analysis(
                NewAnalysis {
                    id: id.to_owned(),
                    car_key: "MT-1".to_owned(),
                    analysis_date: None,
                    kind,
                    farm_id: Some("farm-1".to_owned()),
                    schedule_id: Some("schedule-1".to_owned()),
                    documents: Vec::new(),
                    created_by: None,
                    created_at: fixture.clock.now(),
                },
                None,
                &[],
            )
            .expect("create analysis");
        fixture
            .store
            .claim_pending(id, fixture.clock.now())
            .expect("claim analysis");
        fixture
            .store
            .complete_analysis(
                id,
                &rows,
                CompletionSummary {
                    completed_at: fixture.clock.now(),
                    has_intersections: !rows.is_empty(),
                    intersection_count: rows.len() as i64,
                },
            )
            .expect("complete analysis");
        fixture.clock.advance(chrono::Duration::minutes(5));
    }

    fn request(id: &str, kind: AnalysisKind) -> AlertRequest {
        AlertRequest {
            analysis_id: id.to_owned(),
            farm_id: "farm-1".to_owned(),
            schedule_id: Some("schedule-1".to_owned()),
            analysis_kind: kind,
        }
    }

    #[test]
    fn keys_skip_registry_and_kind_excluded_rows() {
        let rows = vec![
            row("SICAR", "CAR_MT", Some(1), true),
            row("BIOMAS", "BIOMAS_IBGE", Some(2), false),
            row("DETER", "DETER_AMZ", Some(3), false),
            row("PRODES", "PRODES_AMZ_2023", None, false),
            row("PRODES", "PRODES_AMZ_2023", None, false),
            row("UCS", "UCS_SNIRH", Some(4), false),
        ];

        let standard: Vec<String> = intersection_keys(&rows, AnalysisKind::Standard)
            .into_iter()
            .collect();
        assert_eq!(standard, vec!["PRODES_AMZ_2023:null", "UCS_SNIRH:4"]);

        let deter: Vec<String> = intersection_keys(&rows, AnalysisKind::Deter)
            .into_iter()
            .collect();
        assert_eq!(deter, vec!["DETER_AMZ:3"]);
    }

    #[test]
    fn first_analysis_never_alerts() {
        let fixture = fixture();
        completed(
            &fixture,
            "a1",
            AnalysisKind::Standard,
            vec![row("PRODES", "PRODES_AMZ_2023", Some(1), false)],
        );

        let alert = fixture
            .engine
            .create_alert_for_novel_intersections(&request("a1", AnalysisKind::Standard))
            .expect("alerting");
        assert!(alert.is_none());
        assert!(fixture.engine.list(None, 10).expect("list").is_empty());
    }

    #[test]
    fn new_keys_produce_exactly_one_alert() {
        let fixture = fixture();
        completed(
            &fixture,
            "a1",
            AnalysisKind::Standard,
            vec![row("PRODES", "PRODES_AMZ_2023", Some(1), false)],
        );
        completed(
            &fixture,
            "a2",
            AnalysisKind::Standard,
            vec![
                row("PRODES", "PRODES_AMZ_2023", Some(1), false),
                row("PRODES", "PRODES_AMZ_2023", Some(7), false),
                row("EMBARGOS_IBAMA", "EMBARGOS_IBAMA", None, false),
                row("BIOMAS", "BIOMAS_IBGE", Some(9), false),
            ],
        );

        let alert = fixture
            .engine
            .create_alert_for_novel_intersections(&request("a2", AnalysisKind::Standard))
            .expect("alerting")
            .expect("alert created");

        assert_eq!(alert.new_intersection_count, 2);
        assert_eq!(alert.alert_type, NEW_INTERSECTION_ALERT);
        assert_eq!(alert.status, AlertStatus::New);
        let payload: NewIntersectionPayload =
            serde_json::from_value(alert.payload.clone()).expect("payload");
        assert_eq!(
            payload.new_keys,
            vec!["EMBARGOS_IBAMA:null", "PRODES_AMZ_2023:7"]
        );
        assert_eq!(payload.previous_analysis_id, "a1");
        assert_eq!(payload.current_analysis_id, "a2");
        assert_eq!(alert.payload["analysisKind"], "STANDARD");

        let stored = fixture.engine.list(Some(AlertStatus::New), 10).expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, alert.id);
    }

    #[test]
    fn unchanged_or_shrinking_results_do_not_alert() {
        let fixture = fixture();
        completed(
            &fixture,
            "a1",
            AnalysisKind::Standard,
            vec![
                row("PRODES", "PRODES_AMZ_2023", Some(1), false),
                row("PRODES", "PRODES_AMZ_2023", Some(2), false),
            ],
        );
        completed(
            &fixture,
            "a2",
            AnalysisKind::Standard,
            vec![row("PRODES", "PRODES_AMZ_2023", Some(2), false)],
        );

        let alert = fixture
            .engine
            .create_alert_for_novel_intersections(&request("a2", AnalysisKind::Standard))
            .expect("alerting");
        assert!(alert.is_none());
    }

    #[test]
    fn previous_run_must_share_the_kind() {
        let fixture = fixture();
        completed(
            &fixture,
            "deter-1",
            AnalysisKind::Deter,
            vec![row("DETER", "DETER_AMZ", Some(1), false)],
        );
        completed(
            &fixture,
            "std-1",
            AnalysisKind::Standard,
            vec![row("PRODES", "PRODES_AMZ_2023", Some(1), false)],
        );

        let alert = fixture
            .engine
            .create_alert_for_novel_intersections(&request("std-1", AnalysisKind::Standard))
            .expect("alerting");
        assert!(alert.is_none());

        completed(
            &fixture,
            "deter-2",
            AnalysisKind::Deter,
            vec![
                row("SICAR", "CAR_MT", Some(5), true),
                row("DETER", "DETER_AMZ", Some(1), false),
                row("DETER", "DETER_AMZ", Some(2), false),
            ],
        );
        let alert = fixture
            .engine
            .create_alert_for_novel_intersections(&request("deter-2", AnalysisKind::Deter))
            .expect("alerting")
            .expect("deter alert");
        assert_eq!(alert.new_intersection_count, 1);
        assert_eq!(alert.analysis_kind, AnalysisKind::Deter);
    }
}
