use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use landwatch_core::{AlertStatus, AnalysisKind, AnalysisStatus, FeatureId};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{
    AlertRecord, AnalysisRecord, AnalysisResultRecord, AnalysisStore, CacheRecord,
    CompletionSummary, FarmRecord, NewAnalysis, ScheduleRecord, StoreError,
};

const ANALYSIS_COLUMNS: &str = "id, car_key, analysis_date, kind, status, farm_id, schedule_id, \
     documents, created_by, created_at, started_at, completed_at, has_intersections, \
     intersection_count";

const SCHEDULE_COLUMNS: &str = "id, farm_id, kind, frequency, timezone, active, next_run_at, \
     last_run_at, created_by, created_at, updated_at";

const ALERT_COLUMNS: &str = "id, farm_id, schedule_id, analysis_id, analysis_kind, alert_type, \
     new_intersection_count, status, payload, created_at";

/// SQLite-backed application store. Each call opens its own connection so the
/// store can be shared freely across tasks.
pub struct SqliteStore {
    sqlite_path: PathBuf,
}

impl SqliteStore {
    pub fn open(sqlite_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let sqlite_path = sqlite_path.as_ref().to_path_buf();
        if let Some(parent) = sqlite_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&sqlite_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;
        drop(conn);

        Ok(Self { sqlite_path })
    }

    pub fn path(&self) -> &Path {
        &self.sqlite_path
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.sqlite_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

impl AnalysisStore for SqliteStore {
    fn create_analysis(
        &self,
        analysis: NewAnalysis,
        new_farm: Option<FarmRecord>,
        farm_documents: &[String],
    ) -> Result<AnalysisRecord, StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        if let Some(farm) = new_farm.as_ref() {
            insert_farm_row(&tx, farm)?;
        }
        if let Some(farm_id) = analysis.farm_id.as_deref() {
            for doc in farm_documents {
                tx.execute(
                    "INSERT OR IGNORE INTO farm_documents (farm_id, doc) VALUES (?1, ?2)",
                    params![farm_id, doc],
                )?;
            }
        }

        tx.execute(
            r#"
            INSERT INTO analyses (
                id, car_key, analysis_date, kind, status, farm_id, schedule_id,
                documents, created_by, created_at, has_intersections, intersection_count
            )
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?9, 0, 0)
            "#,
            params![
                analysis.id,
                analysis.car_key,
                date_text(analysis.analysis_date),
                analysis.kind.as_str(),
                analysis.farm_id,
                analysis.schedule_id,
                serde_json::to_string(&analysis.documents)?,
                analysis.created_by,
                millis(analysis.created_at),
            ],
        )?;
        tx.commit()?;

        Ok(AnalysisRecord {
            id: analysis.id,
            car_key: analysis.car_key,
            analysis_date: analysis.analysis_date,
            kind: analysis.kind,
            status: AnalysisStatus::Pending,
            farm_id: analysis.farm_id,
            schedule_id: analysis.schedule_id,
            documents: analysis.documents,
            created_by: analysis.created_by,
            created_at: analysis.created_at,
            started_at: None,
            completed_at: None,
            has_intersections: false,
            intersection_count: 0,
        })
    }

    fn get_analysis(&self, analysis_id: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                &format!("SELECT {ANALYSIS_COLUMNS} FROM analyses WHERE id = ?1"),
                params![analysis_id],
                analysis_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn claim_pending(
        &self,
        analysis_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.connection()?;
        let changed = conn.execute(
            r#"
            UPDATE analyses
            SET status = 'running', started_at = ?2
            WHERE id = ?1 AND status = 'pending'
            "#,
            params![analysis_id, millis(started_at)],
        )?;
        Ok(changed == 1)
    }

    fn release_to_pending(&self, analysis_id: &str) -> Result<bool, StoreError> {
        let conn = self.connection()?;
        let changed = conn.execute(
            r#"
            UPDATE analyses
            SET status = 'pending', started_at = NULL
            WHERE id = ?1 AND status = 'running'
            "#,
            params![analysis_id],
        )?;
        Ok(changed == 1)
    }

    fn mark_failed(
        &self,
        analysis_id: &str,
        completed_at: DateTime<Utc>,
        reset_counts: bool,
    ) -> Result<bool, StoreError> {
        let conn = self.connection()?;
        let sql = if reset_counts {
            r#"
            UPDATE analyses
            SET status = 'failed', completed_at = ?2, has_intersections = 0,
                intersection_count = 0
            WHERE id = ?1 AND status = 'running'
            "#
        } else {
            r#"
            UPDATE analyses
            SET status = 'failed', completed_at = ?2
            WHERE id = ?1 AND status = 'running'
            "#
        };
        let changed = conn.execute(sql, params![analysis_id, millis(completed_at)])?;
        Ok(changed == 1)
    }

    fn complete_analysis(
        &self,
        analysis_id: &str,
        results: &[AnalysisResultRecord],
        summary: CompletionSummary,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            r#"
            UPDATE analyses
            SET status = 'completed', completed_at = ?2, has_intersections = ?3,
                intersection_count = ?4
            WHERE id = ?1 AND status = 'running'
            "#,
            params![
                analysis_id,
                millis(summary.completed_at),
                summary.has_intersections,
                summary.intersection_count,
            ],
        )?;
        if changed == 0 {
            tx.rollback()?;
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM analysis_results WHERE analysis_id = ?1",
            params![analysis_id],
        )?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO analysis_results (
                    analysis_id, category_code, dataset_code, snapshot_date, feature_id,
                    geom_id, is_sicar, sicar_area_m2, feature_area_m2, overlap_area_m2,
                    overlap_pct_of_sicar
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )?;
            for result in results {
                stmt.execute(params![
                    analysis_id,
                    result.category_code,
                    result.dataset_code,
                    date_text(result.snapshot_date),
                    result.feature_id.as_ref().map(FeatureId::as_str),
                    result.geom_id.as_ref().map(FeatureId::as_str),
                    result.is_sicar,
                    result.sicar_area_m2,
                    result.feature_area_m2,
                    result.overlap_area_m2,
                    result.overlap_pct_of_sicar,
                ])?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    fn list_pending_ids(&self, limit: u32) -> Result<Vec<String>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id
            FROM analyses
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn fail_stale_running(
        &self,
        started_before: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id
                FROM analyses
                WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?1
                ORDER BY started_at ASC
                "#,
            )?;
            let rows = stmt.query_map(params![millis(started_before)], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for id in &ids {
            tx.execute(
                r#"
                UPDATE analyses
                SET status = 'failed', completed_at = ?2
                WHERE id = ?1 AND status = 'running'
                "#,
                params![id, millis(completed_at)],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    fn list_results(&self, analysis_id: &str) -> Result<Vec<AnalysisResultRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT analysis_id, category_code, dataset_code, snapshot_date, feature_id, geom_id,
                   is_sicar, sicar_area_m2, feature_area_m2, overlap_area_m2, overlap_pct_of_sicar
            FROM analysis_results
            WHERE analysis_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![analysis_id], |row| {
            Ok(AnalysisResultRecord {
                analysis_id: row.get(0)?,
                category_code: row.get(1)?,
                dataset_code: row.get(2)?,
                snapshot_date: date_column(3, row.get(3)?)?,
                feature_id: feature_column(4, row.get(4)?)?,
                geom_id: feature_column(5, row.get(5)?)?,
                is_sicar: row.get(6)?,
                sicar_area_m2: row.get(7)?,
                feature_area_m2: row.get(8)?,
                overlap_area_m2: row.get(9)?,
                overlap_pct_of_sicar: row.get(10)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn find_previous_completed(
        &self,
        farm_id: &str,
        kind: AnalysisKind,
        excluding_analysis_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.connection()?;
        let id = conn
            .query_row(
                r#"
                SELECT id
                FROM analyses
                WHERE farm_id = ?1 AND kind = ?2 AND status = 'completed' AND id <> ?3
                ORDER BY completed_at DESC, created_at DESC
                LIMIT 1
                "#,
                params![farm_id, kind.as_str(), excluding_analysis_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id)
    }

    fn find_in_flight_for_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.connection()?;
        let id = conn
            .query_row(
                r#"
                SELECT id
                FROM analyses
                WHERE schedule_id = ?1 AND status IN ('pending', 'running')
                LIMIT 1
                "#,
                params![schedule_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id)
    }

    fn get_cache_entry(&self, analysis_id: &str) -> Result<Option<CacheRecord>, StoreError> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                r#"
                SELECT analysis_id, payload, cached_at, expires_at
                FROM analysis_cache
                WHERE analysis_id = ?1
                "#,
                params![analysis_id],
                |row| {
                    Ok(CacheRecord {
                        analysis_id: row.get(0)?,
                        payload: row.get(1)?,
                        cached_at: timestamp(2, row.get(2)?)?,
                        expires_at: timestamp(3, row.get(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_cache_entry(&self, record: &CacheRecord) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO analysis_cache (analysis_id, payload, cached_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(analysis_id) DO UPDATE SET
                payload = excluded.payload,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at
            "#,
            params![
                record.analysis_id,
                record.payload,
                millis(record.cached_at),
                millis(record.expires_at),
            ],
        )?;
        Ok(())
    }

    fn delete_cache_entry(&self, analysis_id: &str) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM analysis_cache WHERE analysis_id = ?1",
            params![analysis_id],
        )?;
        Ok(())
    }

    fn delete_expired_cache(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.connection()?;
        let deleted = conn.execute(
            "DELETE FROM analysis_cache WHERE expires_at < ?1",
            params![millis(now)],
        )?;
        Ok(deleted)
    }

    fn insert_alert(&self, record: &AlertRecord) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO analysis_alerts (
                id, farm_id, schedule_id, analysis_id, analysis_kind, alert_type,
                new_intersection_count, status, payload, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.id,
                record.farm_id,
                record.schedule_id,
                record.analysis_id,
                record.analysis_kind.as_str(),
                record.alert_type,
                record.new_intersection_count,
                record.status.as_str(),
                serde_json::to_string(&record.payload)?,
                millis(record.created_at),
            ],
        )?;
        Ok(())
    }

    fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        limit: u32,
    ) -> Result<Vec<AlertRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {ALERT_COLUMNS}
            FROM analysis_alerts
            WHERE ?1 IS NULL OR status = ?1
            ORDER BY created_at DESC, id ASC
            LIMIT ?2
            "#
        ))?;
        let rows = stmt.query_map(params![status.map(AlertStatus::as_str), limit], |row| {
            let kind: String = row.get(4)?;
            let status: String = row.get(7)?;
            let payload: String = row.get(8)?;
            Ok(AlertRecord {
                id: row.get(0)?,
                farm_id: row.get(1)?,
                schedule_id: row.get(2)?,
                analysis_id: row.get(3)?,
                analysis_kind: parsed(4, &kind)?,
                alert_type: row.get(5)?,
                new_intersection_count: row.get(6)?,
                status: parsed(7, &status)?,
                payload: serde_json::from_str(&payload)
                    .map_err(|err| conversion_error(8, err.to_string()))?,
                created_at: timestamp(9, row.get(9)?)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn insert_farm(&self, record: &FarmRecord) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        insert_farm_row(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn get_farm(&self, farm_id: &str) -> Result<Option<FarmRecord>, StoreError> {
        let conn = self.connection()?;
        load_farm(
            &conn,
            "SELECT id, name, car_key, owner, created_at FROM farms WHERE id = ?1",
            farm_id,
        )
    }

    fn find_farm_by_car_key(&self, car_key: &str) -> Result<Option<FarmRecord>, StoreError> {
        let conn = self.connection()?;
        load_farm(
            &conn,
            r#"
            SELECT id, name, car_key, owner, created_at
            FROM farms
            WHERE car_key = ?1
            ORDER BY created_at ASC
            LIMIT 1
            "#,
            car_key,
        )
    }

    fn insert_schedule(&self, record: &ScheduleRecord) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            &format!(
                "INSERT INTO schedules ({SCHEDULE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                record.id,
                record.farm_id,
                record.kind.as_str(),
                record.frequency.as_str(),
                record.timezone,
                record.active,
                millis(record.next_run_at),
                record.last_run_at.map(millis),
                record.created_by,
                millis(record.created_at),
                millis(record.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleRecord>, StoreError> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![schedule_id],
                schedule_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS}
            FROM schedules
            WHERE active = 1 AND next_run_at <= ?1
            ORDER BY next_run_at ASC, id ASC
            LIMIT ?2
            "#
        ))?;
        let rows = stmt.query_map(params![millis(now), limit], schedule_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn claim_due_schedule(
        &self,
        schedule_id: &str,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.connection()?;
        let changed = conn.execute(
            r#"
            UPDATE schedules
            SET last_run_at = ?2, next_run_at = ?3, updated_at = ?2
            WHERE id = ?1 AND active = 1 AND next_run_at <= ?2
            "#,
            params![schedule_id, millis(now), millis(next_run_at)],
        )?;
        Ok(changed == 1)
    }

    fn claim_schedule_if_unchanged(
        &self,
        schedule_id: &str,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.connection()?;
        let changed = conn.execute(
            r#"
            UPDATE schedules
            SET last_run_at = ?3, next_run_at = ?4, updated_at = ?3
            WHERE id = ?1 AND updated_at = ?2
            "#,
            params![
                schedule_id,
                millis(expected_updated_at),
                millis(now),
                millis(next_run_at),
            ],
        )?;
        Ok(changed == 1)
    }

    fn set_schedule_active(
        &self,
        schedule_id: &str,
        active: bool,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleRecord>, StoreError> {
        let conn = self.connection()?;
        let changed = conn.execute(
            r#"
            UPDATE schedules
            SET active = ?2, next_run_at = ?3, updated_at = ?4
            WHERE id = ?1
            "#,
            params![schedule_id, active, millis(next_run_at), millis(now)],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        drop(conn);
        self.get_schedule(schedule_id)
    }
}

fn insert_farm_row(conn: &Connection, record: &FarmRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO farms (id, name, car_key, owner, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.id,
            record.name,
            record.car_key,
            record.owner,
            millis(record.created_at),
        ],
    )?;
    for doc in &record.documents {
        conn.execute(
            "INSERT OR IGNORE INTO farm_documents (farm_id, doc) VALUES (?1, ?2)",
            params![record.id, doc],
        )?;
    }
    Ok(())
}

fn load_farm(conn: &Connection, sql: &str, key: &str) -> Result<Option<FarmRecord>, StoreError> {
    let farm = conn
        .query_row(sql, params![key], |row| {
            Ok(FarmRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                car_key: row.get(2)?,
                owner: row.get(3)?,
                documents: Vec::new(),
                created_at: timestamp(4, row.get(4)?)?,
            })
        })
        .optional()?;
    let Some(mut farm) = farm else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT doc FROM farm_documents WHERE farm_id = ?1 ORDER BY rowid ASC")?;
    let docs = stmt.query_map(params![farm.id], |row| row.get::<_, String>(0))?;
    farm.documents = docs.collect::<Result<Vec<_>, _>>()?;
    Ok(Some(farm))
}

fn analysis_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisRecord> {
    let kind: String = row.get(3)?;
    let status: String = row.get(4)?;
    let documents: String = row.get(7)?;
    Ok(AnalysisRecord {
        id: row.get(0)?,
        car_key: row.get(1)?,
        analysis_date: date_column(2, row.get(2)?)?,
        kind: parsed(3, &kind)?,
        status: parsed(4, &status)?,
        farm_id: row.get(5)?,
        schedule_id: row.get(6)?,
        documents: serde_json::from_str(&documents)
            .map_err(|err| conversion_error(7, err.to_string()))?,
        created_by: row.get(8)?,
        created_at: timestamp(9, row.get(9)?)?,
        started_at: optional_timestamp(10, row.get(10)?)?,
        completed_at: optional_timestamp(11, row.get(11)?)?,
        has_intersections: row.get(12)?,
        intersection_count: row.get(13)?,
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    let kind: String = row.get(2)?;
    let frequency: String = row.get(3)?;
    Ok(ScheduleRecord {
        id: row.get(0)?,
        farm_id: row.get(1)?,
        kind: parsed(2, &kind)?,
        frequency: parsed(3, &frequency)?,
        timezone: row.get(4)?,
        active: row.get(5)?,
        next_run_at: timestamp(6, row.get(6)?)?,
        last_run_at: optional_timestamp(7, row.get(7)?)?,
        created_by: row.get(8)?,
        created_at: timestamp(9, row.get(9)?)?,
        updated_at: timestamp(10, row.get(10)?)?,
    })
}

fn millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

fn timestamp(idx: usize, value: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| conversion_error(idx, format!("timestamp {value} is out of range")))
}

fn optional_timestamp(idx: usize, value: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|millis| timestamp(idx, millis)).transpose()
}

fn date_text(value: Option<NaiveDate>) -> Option<String> {
    value.map(|date| date.format("%Y-%m-%d").to_string())
}

fn date_column(idx: usize, value: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    value
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|err| conversion_error(idx, err.to_string()))
        })
        .transpose()
}

fn feature_column(idx: usize, value: Option<String>) -> rusqlite::Result<Option<FeatureId>> {
    value
        .map(|raw| {
            raw.parse::<FeatureId>()
                .map_err(|err| conversion_error(idx, err.to_string()))
        })
        .transpose()
}

fn parsed<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    raw.parse().map_err(|err: String| conversion_error(idx, err))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS farms (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            car_key TEXT NOT NULL,
            owner TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_farms_car_key ON farms(car_key);

        CREATE TABLE IF NOT EXISTS farm_documents (
            farm_id TEXT NOT NULL,
            doc TEXT NOT NULL,
            PRIMARY KEY (farm_id, doc)
        );

        CREATE TABLE IF NOT EXISTS analyses (
            id TEXT PRIMARY KEY,
            car_key TEXT NOT NULL,
            analysis_date TEXT,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            farm_id TEXT,
            schedule_id TEXT,
            documents TEXT NOT NULL DEFAULT '[]',
            created_by TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            has_intersections INTEGER NOT NULL DEFAULT 0,
            intersection_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_analyses_status ON analyses(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_analyses_farm_kind
            ON analyses(farm_id, kind, status, completed_at);
        CREATE INDEX IF NOT EXISTS idx_analyses_schedule ON analyses(schedule_id, status);

        CREATE TABLE IF NOT EXISTS analysis_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            analysis_id TEXT NOT NULL,
            category_code TEXT NOT NULL,
            dataset_code TEXT NOT NULL,
            snapshot_date TEXT,
            feature_id TEXT,
            geom_id TEXT,
            is_sicar INTEGER NOT NULL DEFAULT 0,
            sicar_area_m2 TEXT,
            feature_area_m2 TEXT,
            overlap_area_m2 TEXT,
            overlap_pct_of_sicar TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_analysis_results_analysis
            ON analysis_results(analysis_id);

        CREATE TABLE IF NOT EXISTS analysis_cache (
            analysis_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            cached_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_analysis_cache_expires ON analysis_cache(expires_at);

        CREATE TABLE IF NOT EXISTS analysis_alerts (
            id TEXT PRIMARY KEY,
            farm_id TEXT NOT NULL,
            schedule_id TEXT,
            analysis_id TEXT NOT NULL,
            analysis_kind TEXT NOT NULL,
            alert_type TEXT NOT NULL,
            new_intersection_count INTEGER NOT NULL,
            status TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_analysis_alerts_status
            ON analysis_alerts(status, created_at);

        CREATE TABLE IF NOT EXISTS schedules (
            id TEXT PRIMARY KEY,
            farm_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            frequency TEXT NOT NULL,
            timezone TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            next_run_at INTEGER NOT NULL,
            last_run_at INTEGER,
            created_by TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(active, next_run_at);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use landwatch_core::ScheduleFrequency;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
    }

    fn new_analysis(id: &str, farm_id: Option<&str>) -> NewAnalysis {
        NewAnalysis {
            id: id.to_owned(),
            car_key: "PA-1500000-ABCDEF".to_owned(),
            analysis_date: NaiveDate::from_ymd_opt(2024, 6, 1),
            kind: AnalysisKind::Standard,
            farm_id: farm_id.map(str::to_owned),
            schedule_id: None,
            documents: vec!["12345678909".to_owned()],
            created_by: Some("user-1".to_owned()),
            created_at: at(8),
        }
    }

    fn result_row(dataset: &str, feature: i64) -> AnalysisResultRecord {
        AnalysisResultRecord {
            analysis_id: String::new(),
            category_code: "PRODES".to_owned(),
            dataset_code: dataset.to_owned(),
            snapshot_date: NaiveDate::from_ymd_opt(2023, 8, 1),
            feature_id: Some(FeatureId::from(feature)),
            geom_id: Some("900719925474099312345".parse().expect("geom id")),
            is_sicar: false,
            sicar_area_m2: Some("1000.25".to_owned()),
            feature_area_m2: Some("40.5".to_owned()),
            overlap_area_m2: Some("10.125".to_owned()),
            overlap_pct_of_sicar: Some("1.0122".to_owned()),
        }
    }

    fn summary(count: i64) -> CompletionSummary {
        CompletionSummary {
            completed_at: at(9),
            has_intersections: count > 0,
            intersection_count: count,
        }
    }

    #[test]
    fn claim_pending_succeeds_only_once() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path().join("app.sqlite")).expect("open store");
        store
            .create_analysis(new_analysis("a-1", None), None, &[])
            .expect("create analysis");

        assert!(store.claim_pending("a-1", at(8)).expect("first claim"));
        assert!(!store.claim_pending("a-1", at(8)).expect("second claim"));

        let record = store.get_analysis("a-1").expect("get").expect("exists");
        assert_eq!(record.status, AnalysisStatus::Running);
        assert_eq!(record.started_at, Some(at(8)));
        assert!(!store.claim_pending("missing", at(8)).expect("missing claim"));
    }

    #[test]
    fn complete_analysis_writes_results_once() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path().join("app.sqlite")).expect("open store");
        store
            .create_analysis(new_analysis("a-1", None), None, &[])
            .expect("create analysis");
        assert!(
            !store
                .complete_analysis("a-1", &[result_row("PRODES_AMZ_2023", 1)], summary(1))
                .expect("pending completion")
        );
        store.claim_pending("a-1", at(8)).expect("claim");

        assert!(
            store
                .complete_analysis("a-1", &[result_row("PRODES_CERRADO", 3)], summary(1))
                .expect("first completion")
        );
        assert!(
            !store
                .complete_analysis(
                    "a-1",
                    &[result_row("PRODES_AMZ_2023", 1), result_row("PRODES_AMZ_2023", 2)],
                    summary(2),
                )
                .expect("second completion")
        );

        let results = store.list_results("a-1").expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].dataset_code, "PRODES_CERRADO");
        assert_eq!(results[0].analysis_id, "a-1");
        assert_eq!(
            results[0].geom_id.as_ref().map(FeatureId::as_str),
            Some("900719925474099312345")
        );

        let record = store.get_analysis("a-1").expect("get").expect("exists");
        assert_eq!(record.status, AnalysisStatus::Completed);
        assert_eq!(record.intersection_count, 1);
        assert!(record.has_intersections);
        assert_eq!(record.completed_at, Some(at(9)));
    }

    #[test]
    fn mark_failed_can_reset_counts_and_release_returns_to_pending() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path().join("app.sqlite")).expect("open store");
        store
            .create_analysis(new_analysis("a-1", None), None, &[])
            .expect("create analysis");
        store.claim_pending("a-1", at(8)).expect("claim");
        assert!(store.release_to_pending("a-1").expect("release"));
        assert!(!store.release_to_pending("a-1").expect("release again"));
        assert!(!store.mark_failed("a-1", at(9), true).expect("fail pending"));

        store.claim_pending("a-1", at(9)).expect("claim again");
        assert!(store.mark_failed("a-1", at(10), true).expect("fail"));
        let record = store.get_analysis("a-1").expect("get").expect("exists");
        assert_eq!(record.status, AnalysisStatus::Failed);
        assert_eq!(record.intersection_count, 0);
        assert_eq!(record.completed_at, Some(at(10)));
    }

    #[test]
    fn terminal_statuses_are_never_overwritten() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path().join("app.sqlite")).expect("open store");
        for id in ["done", "swept"] {
            store
                .create_analysis(new_analysis(id, None), None, &[])
                .expect("create analysis");
            store.claim_pending(id, at(1)).expect("claim");
        }
        assert!(
            store
                .complete_analysis("done", &[result_row("PRODES_AMZ_2023", 1)], summary(1))
                .expect("complete")
        );
        assert!(!store.mark_failed("done", at(10), false).expect("late failure"));

        assert_eq!(
            store.fail_stale_running(at(2), at(3)).expect("sweep"),
            vec!["swept".to_owned()]
        );
        assert!(
            !store
                .complete_analysis("swept", &[result_row("PRODES_AMZ_2023", 2)], summary(1))
                .expect("late completion")
        );

        let done = store.get_analysis("done").expect("get").expect("exists");
        assert_eq!(done.status, AnalysisStatus::Completed);
        assert_eq!(done.completed_at, Some(at(9)));
        let swept = store.get_analysis("swept").expect("get").expect("exists");
        assert_eq!(swept.status, AnalysisStatus::Failed);
        assert_eq!(swept.intersection_count, 0);
        assert!(store.list_results("swept").expect("results").is_empty());
    }

    #[test]
    fn fail_stale_running_only_touches_old_runs() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path().join("app.sqlite")).expect("open store");
        for id in ["old", "fresh", "idle"] {
            store
                .create_analysis(new_analysis(id, None), None, &[])
                .expect("create analysis");
        }
        store.claim_pending("old", at(1)).expect("claim old");
        store.claim_pending("fresh", at(10)).expect("claim fresh");

        let failed = store
            .fail_stale_running(at(9), at(11))
            .expect("stale sweep");
        assert_eq!(failed, vec!["old".to_owned()]);

        let statuses: Vec<_> = ["old", "fresh", "idle"]
            .iter()
            .map(|id| store.get_analysis(id).expect("get").expect("exists").status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                AnalysisStatus::Failed,
                AnalysisStatus::Running,
                AnalysisStatus::Pending
            ]
        );
    }

    #[test]
    fn previous_completed_picks_latest_of_same_farm_and_kind() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path().join("app.sqlite")).expect("open store");
        for id in ["first", "second", "current"] {
            store
                .create_analysis(new_analysis(id, Some("farm-1")), None, &[])
                .expect("create analysis");
        }
        let mut first = summary(1);
        first.completed_at = at(2);
        let mut second = summary(1);
        second.completed_at = at(4);
        for id in ["first", "second"] {
            store.claim_pending(id, at(1)).expect("claim");
        }
        store.complete_analysis("first", &[], first).expect("complete first");
        store.complete_analysis("second", &[], second).expect("complete second");

        let previous = store
            .find_previous_completed("farm-1", AnalysisKind::Standard, "current")
            .expect("lookup");
        assert_eq!(previous.as_deref(), Some("second"));
        assert_eq!(
            store
                .find_previous_completed("farm-1", AnalysisKind::Deter, "current")
                .expect("lookup deter"),
            None
        );
    }

    #[test]
    fn create_analysis_creates_farm_and_attaches_documents() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path().join("app.sqlite")).expect("open store");
        let farm = FarmRecord {
            id: "farm-1".to_owned(),
            name: "Fazenda Boa Vista".to_owned(),
            car_key: "PA-1500000-ABCDEF".to_owned(),
            owner: None,
            documents: Vec::new(),
            created_at: at(7),
        };
        let docs = vec!["12345678909".to_owned(), "12345678000195".to_owned()];
        store
            .create_analysis(new_analysis("a-1", Some("farm-1")), Some(farm), &docs)
            .expect("create analysis");
        store
            .create_analysis(new_analysis("a-2", Some("farm-1")), None, &docs[..1])
            .expect("create second analysis");

        let loaded = store
            .find_farm_by_car_key("PA-1500000-ABCDEF")
            .expect("find farm")
            .expect("farm exists");
        assert_eq!(loaded.id, "farm-1");
        assert_eq!(loaded.documents, docs);
        assert_eq!(
            store.get_analysis("a-2").expect("get").expect("exists").documents,
            vec!["12345678909".to_owned()]
        );
    }

    #[test]
    fn cache_rows_round_trip_and_expire() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path().join("app.sqlite")).expect("open store");
        let record = CacheRecord {
            analysis_id: "a-1".to_owned(),
            payload: json!({"cacheVersion": 2}).to_string(),
            cached_at: at(1),
            expires_at: at(5),
        };
        store.upsert_cache_entry(&record).expect("upsert");
        assert_eq!(store.get_cache_entry("a-1").expect("get"), Some(record.clone()));

        assert_eq!(store.delete_expired_cache(at(5)).expect("sweep at boundary"), 0);
        assert_eq!(store.delete_expired_cache(at(6)).expect("sweep later"), 1);
        assert_eq!(store.get_cache_entry("a-1").expect("get"), None);
    }

    #[test]
    fn missing_cache_table_is_reported() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("app.sqlite");
        let store = SqliteStore::open(&path).expect("open store");
        Connection::open(&path)
            .expect("raw connection")
            .execute_batch("DROP TABLE analysis_cache;")
            .expect("drop cache table");

        let err = store.get_cache_entry("a-1").expect_err("table is gone");
        assert!(err.is_missing_table(crate::ANALYSIS_CACHE_TABLE));
        assert!(!err.is_missing_table("analyses"));
    }

    #[test]
    fn schedule_claims_are_conditional() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path().join("app.sqlite")).expect("open store");
        let schedule = ScheduleRecord {
            id: "s-1".to_owned(),
            farm_id: "farm-1".to_owned(),
            kind: AnalysisKind::Standard,
            frequency: ScheduleFrequency::Weekly,
            timezone: "UTC".to_owned(),
            active: true,
            next_run_at: at(6),
            last_run_at: None,
            created_by: None,
            created_at: at(1),
            updated_at: at(1),
        };
        store.insert_schedule(&schedule).expect("insert schedule");

        assert!(store.list_due_schedules(at(5), 10).expect("due early").is_empty());
        assert_eq!(store.list_due_schedules(at(6), 10).expect("due").len(), 1);

        let next = at(6) + Duration::days(7);
        assert!(store.claim_due_schedule("s-1", at(6), next).expect("claim"));
        assert!(!store.claim_due_schedule("s-1", at(6), next).expect("second claim"));

        let claimed = store.get_schedule("s-1").expect("get").expect("exists");
        assert_eq!(claimed.last_run_at, Some(at(6)));
        assert_eq!(claimed.next_run_at, next);

        assert!(
            !store
                .claim_schedule_if_unchanged("s-1", at(1), at(7), next)
                .expect("stale optimistic claim")
        );
        assert!(
            store
                .claim_schedule_if_unchanged("s-1", claimed.updated_at, at(7), next)
                .expect("optimistic claim")
        );

        let paused = store
            .set_schedule_active("s-1", false, next, at(8))
            .expect("pause")
            .expect("schedule exists");
        assert!(!paused.active);
        assert!(store.list_due_schedules(next, 10).expect("due after pause").is_empty());
        assert!(
            store
                .set_schedule_active("missing", true, next, at(8))
                .expect("missing")
                .is_none()
        );
    }

    #[test]
    fn alerts_filter_by_status() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path().join("app.sqlite")).expect("open store");
        let alert = AlertRecord {
            id: "alert-1".to_owned(),
            farm_id: "farm-1".to_owned(),
            schedule_id: Some("s-1".to_owned()),
            analysis_id: "a-2".to_owned(),
            analysis_kind: AnalysisKind::Standard,
            alert_type: "NEW_INTERSECTION".to_owned(),
            new_intersection_count: 1,
            status: AlertStatus::New,
            payload: json!({"newKeys": ["A:2"]}),
            created_at: at(3),
        };
        store.insert_alert(&alert).expect("insert alert");

        assert_eq!(store.list_alerts(None, 10).expect("all"), vec![alert.clone()]);
        assert_eq!(
            store.list_alerts(Some(AlertStatus::New), 10).expect("new"),
            vec![alert]
        );
        assert!(
            store
                .list_alerts(Some(AlertStatus::Acknowledged), 10)
                .expect("acknowledged")
                .is_empty()
        );
    }
}
