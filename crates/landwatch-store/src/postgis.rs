use std::collections::BTreeSet;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use landwatch_config::{SpatialConfig, validate_identifier};
use landwatch_core::{AnalysisKind, FeatureId};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::spatial::{
    ActiveView, Coordinates, DatasetRow, DocMatchRow, FeatureGeometry, FeatureTarget,
    GeometryRow, IntersectionRow, RegistryProbe, SpatialError, SpatialStore,
    is_transient_sqlstate,
};

const REFRESH_STATUS_TTL: Duration = Duration::from_secs(5);
const REFRESH_LOCK_MODES: &[&str] = &["AccessExclusiveLock", "ShareUpdateExclusiveLock"];

/// PostGIS-backed spatial store. The schema name is validated once at
/// construction and then interpolated as a quoted identifier.
pub struct PostgisSpatialStore {
    schema: String,
    database_url: String,
    max_connections: u32,
    pool: RwLock<PgPool>,
    refresh_status: Mutex<Option<(Instant, bool)>>,
}

#[derive(Debug, sqlx::FromRow)]
struct IntersectionSqlRow {
    category_code: String,
    dataset_code: String,
    snapshot_date: Option<NaiveDate>,
    feature_id: Option<String>,
    geom_id: Option<String>,
    sicar_area_m2: Option<String>,
    feature_area_m2: Option<String>,
    overlap_area_m2: Option<String>,
    overlap_pct_of_sicar: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct CoordinatesSqlRow {
    lat: Option<f64>,
    lng: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
struct BiomeSqlRow {
    code: Option<String>,
    label: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PackSqlRow {
    pack_json: Option<serde_json::Value>,
}

#[derive(Debug, sqlx::FromRow)]
struct DatasetSqlRow {
    dataset_code: String,
    category_code: String,
    description: Option<String>,
    is_spatial: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ValueSqlRow {
    value: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct DocSqlRow {
    dataset_code: String,
    category_code: String,
    doc_normalized: String,
}

#[derive(Debug, sqlx::FromRow)]
struct GeomSqlRow {
    geom_id: String,
    geom: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct FeatureGeomSqlRow {
    dataset_code: String,
    feature_id: String,
    geom: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct MatviewStatusSqlRow {
    lock_modes: Option<Vec<String>>,
    refreshing: Option<bool>,
}

impl PostgisSpatialStore {
    /// Builds a lazily-connecting pool; no query runs until first use.
    pub fn connect_lazy(config: &SpatialConfig) -> Result<Self, SpatialError> {
        let schema = validate_identifier(&config.schema, "spatial.schema")
            .map_err(|err| SpatialError::Config(err.to_string()))?;
        let database_url = config
            .database_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| SpatialError::Config("spatial.database_url is not set".to_owned()))?
            .to_owned();
        let max_connections = config.max_connections.max(1);
        let pool = build_pool(&database_url, max_connections)?;

        Ok(Self {
            schema,
            database_url,
            max_connections,
            pool: RwLock::new(pool),
            refresh_status: Mutex::new(None),
        })
    }

    fn pool(&self) -> PgPool {
        self.pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn table(&self, name: &str) -> String {
        format!("\"{}\".\"{}\"", self.schema, name)
    }

    fn intersections_sql(&self, as_of: Option<NaiveDate>, kind: AnalysisKind) -> String {
        let inner = match (kind, as_of) {
            (AnalysisKind::Deter, Some(_)) => self.deter_as_of_sql(),
            (AnalysisKind::Deter, None) => self.deter_current_sql(),
            (AnalysisKind::Standard, Some(_)) => format!(
                "SELECT * FROM {}($1, $2::date)",
                self.table("fn_intersections_asof_area")
            ),
            (AnalysisKind::Standard, None) => format!(
                "SELECT * FROM {}($1)",
                self.table("fn_intersections_current_area")
            ),
        };
        format!(
            r#"
            SELECT
                r.category_code::text AS category_code,
                r.dataset_code::text AS dataset_code,
                r.snapshot_date::date AS snapshot_date,
                r.feature_id::text AS feature_id,
                r.geom_id::text AS geom_id,
                r.sicar_area_m2::text AS sicar_area_m2,
                r.feature_area_m2::text AS feature_area_m2,
                r.overlap_area_m2::text AS overlap_area_m2,
                r.overlap_pct_of_sicar::text AS overlap_pct_of_sicar
            FROM ({inner}) AS r
            "#
        )
    }

    fn deter_current_sql(&self) -> String {
        let feature = self.table("lw_feature");
        let dataset = self.table("lw_dataset");
        let category = self.table("lw_category");
        let active = self.table("mv_feature_geom_active");
        let version = self.table("lw_dataset_version");
        format!(
            r#"
            WITH sicar_feature AS (
                SELECT f.dataset_id, f.feature_id, a.geom_id AS sicar_geom_id, a.geom AS sicar_geom
                FROM {feature} f
                JOIN {dataset} d ON d.dataset_id = f.dataset_id
                JOIN {category} c ON c.category_id = d.category_id
                JOIN {active} a ON a.dataset_id = f.dataset_id AND a.feature_id = f.feature_id
                WHERE c.code = 'SICAR' AND f.feature_key = $1
            )
            SELECT
                'SICAR' AS category_code,
                d.code AS dataset_code,
                NULL::date AS snapshot_date,
                s.feature_id,
                s.sicar_geom_id AS geom_id,
                ST_Area(s.sicar_geom::geography) AS sicar_area_m2,
                NULL::numeric AS feature_area_m2,
                NULL::numeric AS overlap_area_m2,
                NULL::numeric AS overlap_pct_of_sicar
            FROM sicar_feature s
            JOIN {dataset} d ON d.dataset_id = s.dataset_id

            UNION ALL

            SELECT
                c.code AS category_code,
                d.code AS dataset_code,
                v.snapshot_date,
                a.feature_id,
                a.geom_id,
                ST_Area(s.sicar_geom::geography),
                ST_Area(a.geom::geography),
                ST_Area(ST_Intersection(s.sicar_geom, a.geom)::geography),
                CASE
                    WHEN ST_Area(s.sicar_geom::geography) = 0 THEN 0
                    ELSE ST_Area(ST_Intersection(s.sicar_geom, a.geom)::geography)
                         / ST_Area(s.sicar_geom::geography) * 100
                END
            FROM sicar_feature s
            JOIN {active} a ON TRUE
            JOIN {dataset} d ON d.dataset_id = a.dataset_id
            JOIN {category} c ON c.category_id = d.category_id
            JOIN {version} v ON v.version_id = a.version_id
            WHERE c.code = 'DETER'
              AND a.geom && s.sicar_geom
              AND ST_Intersects(s.sicar_geom, a.geom)
            "#
        )
    }

    fn deter_as_of_sql(&self) -> String {
        let feature = self.table("lw_feature");
        let dataset = self.table("lw_dataset");
        let category = self.table("lw_category");
        let hist = self.table("lw_feature_geom_hist");
        let geoms = self.table("lw_geom_store");
        let version = self.table("lw_dataset_version");
        format!(
            r#"
            WITH sicar_feature AS (
                SELECT f.dataset_id, f.feature_id, h.geom_id AS sicar_geom_id, g.geom AS sicar_geom
                FROM {feature} f
                JOIN {dataset} d ON d.dataset_id = f.dataset_id
                JOIN {category} c ON c.category_id = d.category_id
                JOIN {hist} h
                  ON h.dataset_id = f.dataset_id
                 AND h.feature_id = f.feature_id
                 AND h.valid_from <= $2::date
                 AND (h.valid_to IS NULL OR h.valid_to > $2::date)
                JOIN {geoms} g ON g.geom_id = h.geom_id
                WHERE c.code = 'SICAR' AND f.feature_key = $1
            )
            SELECT
                'SICAR' AS category_code,
                d.code AS dataset_code,
                NULL::date AS snapshot_date,
                s.feature_id,
                s.sicar_geom_id AS geom_id,
                ST_Area(s.sicar_geom::geography) AS sicar_area_m2,
                NULL::numeric AS feature_area_m2,
                NULL::numeric AS overlap_area_m2,
                NULL::numeric AS overlap_pct_of_sicar
            FROM sicar_feature s
            JOIN {dataset} d ON d.dataset_id = s.dataset_id

            UNION ALL

            SELECT
                c.code AS category_code,
                d.code AS dataset_code,
                v.snapshot_date,
                h.feature_id,
                h.geom_id,
                ST_Area(s.sicar_geom::geography),
                ST_Area(g.geom::geography),
                ST_Area(ST_Intersection(s.sicar_geom, g.geom)::geography),
                CASE
                    WHEN ST_Area(s.sicar_geom::geography) = 0 THEN 0
                    ELSE ST_Area(ST_Intersection(s.sicar_geom, g.geom)::geography)
                         / ST_Area(s.sicar_geom::geography) * 100
                END
            FROM sicar_feature s
            JOIN {hist} h
              ON h.valid_from <= $2::date
             AND (h.valid_to IS NULL OR h.valid_to > $2::date)
            JOIN {geoms} g ON g.geom_id = h.geom_id
            JOIN {dataset} d ON d.dataset_id = h.dataset_id
            JOIN {category} c ON c.category_id = d.category_id
            JOIN {version} v ON v.version_id = h.version_id
            WHERE c.code = 'DETER'
              AND g.geom && s.sicar_geom
              AND ST_Intersects(s.sicar_geom, g.geom)
            "#
        )
    }

    /// `COALESCE(NULLIF(p.pack_json->>$n, ''), ...)` over keys bound from `first_param`.
    fn pack_key_sql(keys: &[&str], first_param: usize) -> String {
        let parts: Vec<String> = (0..keys.len())
            .map(|offset| format!("NULLIF(p.pack_json->>${}, '')", first_param + offset))
            .collect();
        format!("COALESCE({})", parts.join(", "))
    }

    async fn active_registry_pack(
        &self,
        dataset_id: i64,
        feature_id: &FeatureId,
    ) -> Result<Option<serde_json::Value>, SpatialError> {
        let sql = format!(
            r#"
            SELECT pack_json
            FROM {}
            WHERE dataset_id = $1 AND feature_id = $2::text::bigint
            LIMIT 1
            "#,
            self.table("mv_sicar_meta_active")
        );
        let row = sqlx::query_as::<_, PackSqlRow>(&sql)
            .bind(dataset_id)
            .bind(feature_id.as_str())
            .fetch_optional(&self.pool())
            .await
            .map_err(classify)?;
        Ok(row.and_then(|row| row.pack_json))
    }

    async fn fetch_refresh_status(&self) -> Result<bool, SpatialError> {
        let sql = r#"
            WITH matviews AS (
                SELECT c.oid, c.relname
                FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relkind = 'm' AND n.nspname = $1
            ),
            locks AS (
                SELECT l.relation, l.mode, a.query
                FROM pg_locks l
                LEFT JOIN pg_stat_activity a ON a.pid = l.pid
            )
            SELECT
                array_remove(array_agg(DISTINCT l.mode::text), NULL) AS lock_modes,
                bool_or(l.query ILIKE 'refresh materialized view%') AS refreshing
            FROM matviews mv
            LEFT JOIN locks l ON l.relation = mv.oid
            GROUP BY mv.relname
        "#;
        let rows = sqlx::query_as::<_, MatviewStatusSqlRow>(sql)
            .bind(&self.schema)
            .fetch_all(&self.pool())
            .await
            .map_err(classify)?;
        Ok(rows.iter().any(|row| {
            view_is_busy(
                row.lock_modes.as_deref().unwrap_or_default(),
                row.refreshing.unwrap_or(false),
            )
        }))
    }
}

fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool, SpatialError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy(database_url)
        .map_err(|err| SpatialError::Config(err.to_string()))
}

/// A view counts as busy while a refresh statement runs against it or it holds
/// a lock mode that refreshes take.
pub(crate) fn view_is_busy(lock_modes: &[String], refreshing: bool) -> bool {
    refreshing
        || lock_modes
            .iter()
            .any(|mode| REFRESH_LOCK_MODES.contains(&mode.as_str()))
}

fn classify(err: sqlx::Error) -> SpatialError {
    match &err {
        sqlx::Error::Database(db) => {
            let transient = db.code().is_some_and(|code| is_transient_sqlstate(&code));
            if transient {
                SpatialError::Transient(err.to_string())
            } else {
                SpatialError::Query(err.to_string())
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => SpatialError::Transient(err.to_string()),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => SpatialError::Decode(err.to_string()),
        _ => SpatialError::Query(err.to_string()),
    }
}

fn parse_feature_id(raw: &str) -> Result<FeatureId, SpatialError> {
    raw.parse()
        .map_err(|err: landwatch_core::FeatureIdError| SpatialError::Decode(err.to_string()))
}

fn parse_geometry(raw: &str) -> Result<serde_json::Value, SpatialError> {
    serde_json::from_str(raw).map_err(|err| SpatialError::Decode(err.to_string()))
}

fn distinct_values(rows: Vec<ValueSqlRow>) -> BTreeSet<String> {
    rows.into_iter()
        .filter_map(|row| row.value)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .collect()
}

fn feature_id_texts<'a>(ids: impl IntoIterator<Item = &'a FeatureId>) -> Vec<String> {
    let unique: BTreeSet<&str> = ids.into_iter().map(FeatureId::as_str).collect();
    unique.into_iter().map(str::to_owned).collect()
}

#[async_trait]
impl SpatialStore for PostgisSpatialStore {
    async fn intersections(
        &self,
        car_key: &str,
        as_of: Option<NaiveDate>,
        kind: AnalysisKind,
    ) -> Result<Vec<IntersectionRow>, SpatialError> {
        let sql = self.intersections_sql(as_of, kind);
        let mut query = sqlx::query_as::<_, IntersectionSqlRow>(&sql).bind(car_key);
        if let Some(date) = as_of {
            query = query.bind(date);
        }
        let rows = query.fetch_all(&self.pool()).await.map_err(classify)?;

        Ok(rows
            .into_iter()
            .map(|row| IntersectionRow {
                category_code: row.category_code,
                dataset_code: row.dataset_code,
                snapshot_date: row.snapshot_date,
                feature_id: FeatureId::normalize(row.feature_id.as_deref()),
                geom_id: FeatureId::normalize(row.geom_id.as_deref()),
                sicar_area_m2: row.sicar_area_m2,
                feature_area_m2: row.feature_area_m2,
                overlap_area_m2: row.overlap_area_m2,
                overlap_pct_of_sicar: row.overlap_pct_of_sicar,
            })
            .collect())
    }

    async fn registry_probe(
        &self,
        car_key: &str,
        as_of: Option<NaiveDate>,
    ) -> Result<Option<RegistryProbe>, SpatialError> {
        let source = match as_of {
            Some(_) => format!("{}($1, $2::date)", self.table("fn_sicar_feature_asof")),
            None => format!("{}($1)", self.table("fn_sicar_feature_current")),
        };
        let sql = format!(
            r#"
            SELECT
                ST_Y(ST_Transform(ST_PointOnSurface(geom), 4326)) AS lat,
                ST_X(ST_Transform(ST_PointOnSurface(geom), 4326)) AS lng
            FROM {source}
            LIMIT 1
            "#
        );
        let mut query = sqlx::query_as::<_, CoordinatesSqlRow>(&sql).bind(car_key);
        if let Some(date) = as_of {
            query = query.bind(date);
        }
        let row = query.fetch_optional(&self.pool()).await.map_err(classify)?;

        Ok(row.map(|row| RegistryProbe {
            coordinates: match (row.lat, row.lng) {
                (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
                _ => None,
            },
        }))
    }

    async fn registry_biomes(
        &self,
        car_key: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<String>, SpatialError> {
        let sql = format!(
            r#"
            WITH sicar AS (
                SELECT geom FROM {registry}($1, $2::date) LIMIT 1
            )
            SELECT DISTINCT
                COALESCE(p.pack_json->>'Sigla', p.pack_json->>'sigla', p.pack_json->>'SIGLA') AS code,
                COALESCE(p.pack_json->>'Bioma', p.pack_json->>'bioma', p.pack_json->>'BIOMA') AS label
            FROM sicar
            JOIN {hist} g
              ON g.valid_from <= $2::date
             AND (g.valid_to IS NULL OR g.valid_to > $2::date)
            JOIN {geoms} s ON s.geom_id = g.geom_id
            JOIN {dataset} d ON d.dataset_id = g.dataset_id
            JOIN {category} c ON c.category_id = d.category_id AND c.code = 'BIOMAS'
            JOIN {packs_hist} h
              ON h.dataset_id = g.dataset_id
             AND h.feature_id = g.feature_id
             AND h.valid_from <= $2::date
             AND (h.valid_to IS NULL OR h.valid_to > $2::date)
            JOIN {packs} p ON p.pack_id = h.pack_id
            WHERE ST_Intersects(sicar.geom, s.geom)
            "#,
            registry = self.table("fn_sicar_feature_asof"),
            hist = self.table("lw_feature_geom_hist"),
            geoms = self.table("lw_geom_store"),
            dataset = self.table("lw_dataset"),
            category = self.table("lw_category"),
            packs_hist = self.table("lw_feature_attr_pack_hist"),
            packs = self.table("lw_attr_pack"),
        );
        let rows = sqlx::query_as::<_, BiomeSqlRow>(&sql)
            .bind(car_key)
            .bind(as_of)
            .fetch_all(&self.pool())
            .await
            .map_err(classify)?;

        let mut biomes: Vec<String> = Vec::new();
        for row in rows {
            let value = row.label.or(row.code).unwrap_or_default().trim().to_owned();
            if !value.is_empty() && !biomes.contains(&value) {
                biomes.push(value);
            }
        }
        Ok(biomes)
    }

    async fn registry_attributes(
        &self,
        dataset_code: &str,
        feature_id: &FeatureId,
        as_of: NaiveDate,
        use_active: bool,
    ) -> Result<Option<serde_json::Value>, SpatialError> {
        let dataset_sql = format!(
            "SELECT dataset_id::bigint FROM {} WHERE code = $1 LIMIT 1",
            self.table("lw_dataset")
        );
        let dataset_id: Option<i64> = sqlx::query_scalar(&dataset_sql)
            .bind(dataset_code)
            .fetch_optional(&self.pool())
            .await
            .map_err(classify)?;
        let Some(dataset_id) = dataset_id else {
            return Ok(None);
        };

        if use_active {
            match self.active_registry_pack(dataset_id, feature_id).await {
                Ok(Some(pack)) => return Ok(Some(pack)),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(error = %err, "active registry metadata unavailable");
                }
            }
        }

        let sql = format!(
            r#"
            SELECT p.pack_json
            FROM {packs_hist} h
            JOIN {packs} p ON p.pack_id = h.pack_id
            WHERE h.dataset_id = $1
              AND h.feature_id = $2::text::bigint
              AND h.valid_from <= $3::date
              AND (h.valid_to IS NULL OR h.valid_to > $3::date)
            ORDER BY h.valid_from DESC
            LIMIT 1
            "#,
            packs_hist = self.table("lw_feature_attr_pack_hist"),
            packs = self.table("lw_attr_pack"),
        );
        let row = sqlx::query_as::<_, PackSqlRow>(&sql)
            .bind(dataset_id)
            .bind(feature_id.as_str())
            .bind(as_of)
            .fetch_optional(&self.pool())
            .await
            .map_err(classify)?;
        Ok(row.and_then(|row| row.pack_json))
    }

    async fn dataset_catalog(&self) -> Result<Vec<DatasetRow>, SpatialError> {
        let sql = format!(
            r#"
            SELECT
                d.code::text AS dataset_code,
                c.code::text AS category_code,
                d.description::text AS description,
                d.is_spatial
            FROM {} d
            JOIN {} c ON c.category_id = d.category_id
            ORDER BY c.code, d.code
            "#,
            self.table("lw_dataset"),
            self.table("lw_category"),
        );
        let rows = sqlx::query_as::<_, DatasetSqlRow>(&sql)
            .fetch_all(&self.pool())
            .await
            .map_err(classify)?;
        Ok(rows
            .into_iter()
            .map(|row| DatasetRow {
                dataset_code: row.dataset_code,
                category_code: row.category_code,
                description: row.description,
                is_spatial: row.is_spatial,
            })
            .collect())
    }

    async fn active_attribute_values(
        &self,
        view: ActiveView,
        dataset_codes: &[String],
        feature_ids: Option<&[FeatureId]>,
    ) -> Result<Vec<String>, SpatialError> {
        let column = view.column();
        let sql = format!(
            r#"
            SELECT DISTINCT {column}::text AS value
            FROM {relation}
            WHERE {column} IS NOT NULL
              AND (cardinality($1::text[]) = 0 OR dataset_code = ANY($1::text[]))
              AND ($2::text[] IS NULL OR feature_id = ANY($2::text[]::bigint[]))
            "#,
            relation = self.table(view.relation()),
        );
        let feature_ids = feature_ids.map(|ids| feature_id_texts(ids));
        let rows = sqlx::query_as::<_, ValueSqlRow>(&sql)
            .bind(dataset_codes)
            .bind(feature_ids)
            .fetch_all(&self.pool())
            .await
            .map_err(classify)?;
        Ok(distinct_values(rows).into_iter().collect())
    }

    async fn distinct_attribute_values(
        &self,
        category_code: &str,
        dataset_codes: &[String],
        keys: &[&str],
        as_of: NaiveDate,
    ) -> Result<Vec<String>, SpatialError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let value = Self::pack_key_sql(keys, 4);
        let sql = format!(
            r#"
            SELECT DISTINCT {value} AS value
            FROM {packs_hist} h
            JOIN {packs} p ON p.pack_id = h.pack_id
            JOIN {dataset} d ON d.dataset_id = h.dataset_id
            JOIN {category} c ON c.category_id = d.category_id
            WHERE (c.code = $1 OR d.code = ANY($2::text[]))
              AND h.valid_from <= $3::date
              AND (h.valid_to IS NULL OR h.valid_to > $3::date)
              AND {value} IS NOT NULL
            "#,
            packs_hist = self.table("lw_feature_attr_pack_hist"),
            packs = self.table("lw_attr_pack"),
            dataset = self.table("lw_dataset"),
            category = self.table("lw_category"),
        );
        let mut query = sqlx::query_as::<_, ValueSqlRow>(&sql)
            .bind(category_code)
            .bind(dataset_codes)
            .bind(as_of);
        for key in keys {
            query = query.bind(*key);
        }
        let rows = query.fetch_all(&self.pool()).await.map_err(classify)?;
        Ok(distinct_values(rows).into_iter().collect())
    }

    async fn attribute_values_for_features(
        &self,
        targets: &[FeatureTarget],
        keys: &[&str],
        as_of: NaiveDate,
    ) -> Result<BTreeSet<String>, SpatialError> {
        let dataset_codes: Vec<String> = targets
            .iter()
            .map(|target| target.dataset_code.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let feature_ids =
            feature_id_texts(targets.iter().filter_map(|target| target.feature_id.as_ref()));
        if keys.is_empty() || dataset_codes.is_empty() || feature_ids.is_empty() {
            return Ok(BTreeSet::new());
        }

        let value = Self::pack_key_sql(keys, 4);
        let sql = format!(
            r#"
            SELECT DISTINCT {value} AS value
            FROM {packs_hist} h
            JOIN {packs} p ON p.pack_id = h.pack_id
            JOIN {dataset} d ON d.dataset_id = h.dataset_id
            WHERE d.code = ANY($1::text[])
              AND h.feature_id = ANY($2::text[]::bigint[])
              AND h.valid_from <= $3::date
              AND (h.valid_to IS NULL OR h.valid_to > $3::date)
              AND {value} IS NOT NULL
            "#,
            packs_hist = self.table("lw_feature_attr_pack_hist"),
            packs = self.table("lw_attr_pack"),
            dataset = self.table("lw_dataset"),
        );
        let mut query = sqlx::query_as::<_, ValueSqlRow>(&sql)
            .bind(dataset_codes)
            .bind(feature_ids)
            .bind(as_of);
        for key in keys {
            query = query.bind(*key);
        }
        let rows = query.fetch_all(&self.pool()).await.map_err(classify)?;
        Ok(distinct_values(rows))
    }

    async fn document_matches(
        &self,
        docs: &[String],
        as_of: NaiveDate,
    ) -> Result<Vec<DocMatchRow>, SpatialError> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT
                d.code::text AS dataset_code,
                c.code::text AS category_code,
                di.doc_normalized::text AS doc_normalized
            FROM {docs} di
            JOIN {dataset} d ON d.dataset_id = di.dataset_id
            JOIN {category} c ON c.category_id = d.category_id
            WHERE di.doc_normalized = ANY($1::text[])
              AND di.valid_from <= $2::date
              AND (di.valid_to IS NULL OR di.valid_to > $2::date)
              AND (di.date_closed IS NULL OR di.date_closed > $2::date)
            "#,
            docs = self.table("lw_doc_index"),
            dataset = self.table("lw_dataset"),
            category = self.table("lw_category"),
        );
        let rows = sqlx::query_as::<_, DocSqlRow>(&sql)
            .bind(docs)
            .bind(as_of)
            .fetch_all(&self.pool())
            .await
            .map_err(classify)?;
        Ok(rows
            .into_iter()
            .map(|row| DocMatchRow {
                dataset_code: row.dataset_code,
                category_code: row.category_code,
                doc_normalized: row.doc_normalized,
            })
            .collect())
    }

    async fn geometries_by_id(
        &self,
        geom_ids: &[FeatureId],
        tolerance: f64,
    ) -> Result<Vec<GeometryRow>, SpatialError> {
        if geom_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT
                g.geom_id::text AS geom_id,
                ST_AsGeoJSON(ST_SimplifyPreserveTopology(g.geom, $2)) AS geom
            FROM {} g
            WHERE g.geom_id = ANY($1::text[]::bigint[])
            "#,
            self.table("lw_geom_store"),
        );
        let rows = sqlx::query_as::<_, GeomSqlRow>(&sql)
            .bind(feature_id_texts(geom_ids))
            .bind(tolerance)
            .fetch_all(&self.pool())
            .await
            .map_err(classify)?;

        let mut geometries = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(geom) = row.geom.as_deref() else {
                continue;
            };
            geometries.push(GeometryRow {
                geom_id: parse_feature_id(&row.geom_id)?,
                geometry: parse_geometry(geom)?,
            });
        }
        Ok(geometries)
    }

    async fn geometries_by_feature(
        &self,
        targets: &[FeatureTarget],
        as_of: Option<NaiveDate>,
        tolerance: f64,
    ) -> Result<Vec<FeatureGeometry>, SpatialError> {
        let pairs: BTreeSet<(&str, &str)> = targets
            .iter()
            .filter_map(|target| {
                target
                    .feature_id
                    .as_ref()
                    .map(|id| (target.dataset_code.as_str(), id.as_str()))
            })
            .collect();
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let (dataset_codes, feature_ids): (Vec<String>, Vec<String>) = pairs
            .into_iter()
            .map(|(dataset, feature)| (dataset.to_owned(), feature.to_owned()))
            .unzip();

        let validity = match as_of {
            Some(_) => "AND h.valid_from <= $4::date AND (h.valid_to IS NULL OR h.valid_to > $4::date)",
            None => "AND h.valid_to IS NULL",
        };
        let sql = format!(
            r#"
            SELECT
                t.dataset_code,
                t.feature_id,
                ST_AsGeoJSON(ST_SimplifyPreserveTopology(g.geom, $3)) AS geom
            FROM unnest($1::text[], $2::text[]) AS t(dataset_code, feature_id)
            JOIN {dataset} d ON d.code = t.dataset_code
            JOIN {hist} h
              ON h.dataset_id = d.dataset_id
             AND h.feature_id = t.feature_id::bigint
            JOIN {geoms} g ON g.geom_id = h.geom_id
            WHERE TRUE {validity}
            "#,
            dataset = self.table("lw_dataset"),
            hist = self.table("lw_feature_geom_hist"),
            geoms = self.table("lw_geom_store"),
        );
        let mut query = sqlx::query_as::<_, FeatureGeomSqlRow>(&sql)
            .bind(dataset_codes)
            .bind(feature_ids)
            .bind(tolerance);
        if let Some(date) = as_of {
            query = query.bind(date);
        }
        let rows = query.fetch_all(&self.pool()).await.map_err(classify)?;

        let mut geometries = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(geom) = row.geom.as_deref() else {
                continue;
            };
            geometries.push(FeatureGeometry {
                dataset_code: row.dataset_code,
                feature_id: parse_feature_id(&row.feature_id)?,
                geometry: parse_geometry(geom)?,
            });
        }
        Ok(geometries)
    }

    async fn refresh_in_progress(&self) -> Result<bool, SpatialError> {
        {
            let cached = self
                .refresh_status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some((checked_at, busy)) = *cached {
                if checked_at.elapsed() < REFRESH_STATUS_TTL {
                    return Ok(busy);
                }
            }
        }

        let busy = self.fetch_refresh_status().await?;
        *self
            .refresh_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((Instant::now(), busy));
        Ok(busy)
    }

    async fn reconnect(&self) -> Result<(), SpatialError> {
        let fresh = build_pool(&self.database_url, self.max_connections)?;
        let stale = {
            let mut guard = self
                .pool
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *guard, fresh)
        };
        stale.close().await;
        tracing::info!(schema = %self.schema, "spatial store pool reconnected");
        Ok(())
    }
}
