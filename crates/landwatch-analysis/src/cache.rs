//! Two-tier analysis cache: a bounded in-process tier in front of the
//! persisted `analysis_cache` rows.
//!
//! Expiry is checked on every read, so the periodic sweep only bounds storage.
//! A missing backing table turns the cache off for the rest of the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Months, Utc};
use landwatch_config::CacheConfig;
use landwatch_core::Clock;
use landwatch_store::{ANALYSIS_CACHE_TABLE, AnalysisStore, CacheRecord, StoreError};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AnalysisError;
use crate::detail::{AnalysisDetail, MapRow};

/// Bump whenever the cached detail or map shape changes incompatibly.
pub const ANALYSIS_CACHE_VERSION: u32 = 2;

const TOLERANCE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMap {
    pub tolerance: f64,
    pub rows: Vec<MapRow>,
}

impl CachedMap {
    pub fn matches_tolerance(&self, tolerance: f64) -> bool {
        (self.tolerance - tolerance).abs() < TOLERANCE_EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePayload {
    pub cache_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<AnalysisDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<CachedMap>,
}

impl CachePayload {
    pub fn new(detail: Option<AnalysisDetail>, map: Option<CachedMap>) -> Self {
        Self {
            cache_version: ANALYSIS_CACHE_VERSION,
            detail,
            map,
        }
    }

    /// `None` when the stored value carries another version or no longer
    /// matches the current shape; either way it must be invalidated.
    pub fn from_trusted(value: &Value) -> Option<Self> {
        let version = value.get("cacheVersion").and_then(Value::as_u64)?;
        if version != u64::from(ANALYSIS_CACHE_VERSION) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: Value,
    expires_at: DateTime<Utc>,
}

pub struct AnalysisCache {
    store: Arc<dyn AnalysisStore>,
    clock: Arc<dyn Clock>,
    memory: Cache<String, Arc<MemoryEntry>>,
    ttl_months: u32,
    disabled: AtomicBool,
}

impl AnalysisCache {
    pub fn new(store: Arc<dyn AnalysisStore>, clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
        let memory = Cache::builder()
            .max_capacity(config.memory_capacity)
            .time_to_live(Duration::from_secs(config.memory_ttl_secs.max(1)))
            .build();
        Self {
            store,
            clock,
            memory,
            ttl_months: config.ttl_months.max(1),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn get(&self, analysis_id: &str) -> Result<Option<Value>, AnalysisError> {
        if analysis_id.is_empty() || self.is_disabled() {
            return Ok(None);
        }
        let now = self.clock.now();

        if let Some(entry) = self.memory.get(analysis_id) {
            if entry.expires_at > now {
                return Ok(Some(entry.payload.clone()));
            }
            self.memory.invalidate(analysis_id);
        }

        let record = match self.store.get_cache_entry(analysis_id) {
            Ok(record) => record,
            Err(err) => return self.absorb_missing_table(err).map(|()| None),
        };
        let Some(record) = record else {
            return Ok(None);
        };

        if record.expires_at <= now {
            if let Err(err) = self.store.delete_cache_entry(analysis_id) {
                self.absorb_missing_table(err)?;
            }
            return Ok(None);
        }

        let payload: Value = match serde_json::from_str(&record.payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(analysis_id, error = %err, "dropping unreadable cache row");
                self.invalidate(analysis_id)?;
                return Ok(None);
            }
        };
        self.memory.insert(
            analysis_id.to_owned(),
            Arc::new(MemoryEntry {
                payload: payload.clone(),
                expires_at: record.expires_at,
            }),
        );
        Ok(Some(payload))
    }

    pub fn set(&self, analysis_id: &str, payload: &Value) -> Result<(), AnalysisError> {
        if analysis_id.is_empty() || self.is_disabled() {
            return Ok(());
        }
        let cached_at = self.clock.now();
        let expires_at = cached_at
            .checked_add_months(Months::new(self.ttl_months))
            .ok_or_else(|| AnalysisError::Message("cache expiry out of range".to_owned()))?;
        let record = CacheRecord {
            analysis_id: analysis_id.to_owned(),
            payload: serde_json::to_string(payload)?,
            cached_at,
            expires_at,
        };

        if let Err(err) = self.store.upsert_cache_entry(&record) {
            return self.absorb_missing_table(err);
        }
        self.memory.insert(
            analysis_id.to_owned(),
            Arc::new(MemoryEntry {
                payload: payload.clone(),
                expires_at,
            }),
        );
        Ok(())
    }

    pub fn invalidate(&self, analysis_id: &str) -> Result<(), AnalysisError> {
        if analysis_id.is_empty() {
            return Ok(());
        }
        self.memory.invalidate(analysis_id);
        if self.is_disabled() {
            return Ok(());
        }
        match self.store.delete_cache_entry(analysis_id) {
            Ok(()) => Ok(()),
            Err(err) => self.absorb_missing_table(err),
        }
    }

    /// Deletes persisted rows whose expiry has passed; returns how many went.
    pub fn cleanup_expired(&self) -> Result<usize, AnalysisError> {
        if self.is_disabled() {
            return Ok(0);
        }
        match self.store.delete_expired_cache(self.clock.now()) {
            Ok(deleted) => Ok(deleted),
            Err(err) => self.absorb_missing_table(err).map(|()| 0),
        }
    }

    fn absorb_missing_table(&self, err: StoreError) -> Result<(), AnalysisError> {
        if err.is_missing_table(ANALYSIS_CACHE_TABLE) {
            if !self.disabled.swap(true, Ordering::Relaxed) {
                tracing::warn!(error = %err, "analysis cache table missing, cache disabled");
                self.memory.invalidate_all();
            }
            return Ok(());
        }
        Err(err.into())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};
    use landwatch_core::ManualClock;
    use landwatch_store::SqliteStore;
    use rusqlite::Connection;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn fixture(
        clock: Arc<ManualClock>,
    ) -> (tempfile::TempDir, Arc<SqliteStore>, AnalysisCache) {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::open(temp.path().join("app.sqlite")).expect("store"));
        let cache = AnalysisCache::new(store.clone(), clock, &CacheConfig::default());
        (temp, store, cache)
    }

    fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 31, 12, 0, 0).unwrap()
    }

    #[test]
    fn set_then_get_round_trips_payload() {
        let clock = Arc::new(ManualClock::new(start()));
        let (_temp, store, cache) = fixture(clock);
        let payload = json!({ "cacheVersion": ANALYSIS_CACHE_VERSION, "detail": { "id": "a-1" } });

        cache.set("a-1", &payload).expect("set");
        assert_eq!(cache.get("a-1").expect("get"), Some(payload));

        let row = store.get_cache_entry("a-1").expect("row").expect("present");
        assert_eq!(
            row.expires_at,
            Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn expired_rows_are_deleted_on_read() {
        let clock = Arc::new(ManualClock::new(start()));
        let (_temp, store, cache) = fixture(clock.clone());
        cache.set("a-1", &json!({ "cacheVersion": 2 })).expect("set");

        clock.advance(ChronoDuration::days(70));
        assert_eq!(cache.get("a-1").expect("get"), None);
        assert!(store.get_cache_entry("a-1").expect("read").is_none());
    }

    #[test]
    fn entries_expire_at_the_exact_instant() {
        let clock = Arc::new(ManualClock::new(start()));
        let (_temp, store, cache) = fixture(clock.clone());
        let payload = json!({ "cacheVersion": ANALYSIS_CACHE_VERSION });
        cache.set("a-1", &payload).expect("set");
        let expires_at = store
            .get_cache_entry("a-1")
            .expect("row")
            .expect("present")
            .expires_at;

        clock.set(expires_at - ChronoDuration::seconds(1));
        assert_eq!(cache.get("a-1").expect("get before expiry"), Some(payload));

        clock.set(expires_at);
        assert_eq!(cache.get("a-1").expect("get at expiry"), None);
        assert!(store.get_cache_entry("a-1").expect("read").is_none());
    }

    #[test]
    fn invalidate_clears_both_tiers() {
        let clock = Arc::new(ManualClock::new(start()));
        let (_temp, store, cache) = fixture(clock);
        cache.set("a-1", &json!({ "cacheVersion": 1 })).expect("set");

        cache.invalidate("a-1").expect("invalidate");
        assert_eq!(cache.get("a-1").expect("get"), None);
        assert!(store.get_cache_entry("a-1").expect("read").is_none());
    }

    #[test]
    fn cleanup_expired_removes_only_past_rows() {
        let clock = Arc::new(ManualClock::new(start()));
        let (_temp, _store, cache) = fixture(clock.clone());
        cache.set("old", &json!({})).expect("set old");
        clock.advance(ChronoDuration::days(40));
        cache.set("new", &json!({})).expect("set new");
        clock.advance(ChronoDuration::days(30));

        assert_eq!(cache.cleanup_expired().expect("sweep"), 1);
        assert!(cache.get("new").expect("get").is_some());
    }

    #[test]
    fn missing_table_disables_cache() {
        let clock = Arc::new(ManualClock::new(start()));
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("app.sqlite");
        let store = Arc::new(SqliteStore::open(&path).expect("store"));
        Connection::open(&path)
            .expect("raw connection")
            .execute_batch("DROP TABLE analysis_cache;")
            .expect("drop cache table");
        let cache = AnalysisCache::new(store, clock, &CacheConfig::default());

        cache.set("a-1", &json!({ "cacheVersion": 2 })).expect("set is swallowed");
        assert!(cache.is_disabled());
        assert_eq!(cache.get("a-1").expect("miss"), None);
        assert_eq!(cache.cleanup_expired().expect("noop"), 0);
    }

    #[test]
    fn payload_with_other_version_is_untrusted() {
        assert!(CachePayload::from_trusted(&json!({ "cacheVersion": 1, "detail": null })).is_none());
        assert!(CachePayload::from_trusted(&json!({ "detail": {} })).is_none());
        let current = CachePayload::from_trusted(&json!({ "cacheVersion": ANALYSIS_CACHE_VERSION }))
            .expect("current version");
        assert!(current.detail.is_none() && current.map.is_none());
    }

    #[test]
    fn empty_ids_are_misses() {
        let clock = Arc::new(ManualClock::new(start()));
        let (_temp, _store, cache) = fixture(clock);
        cache.set("", &json!({})).expect("noop");
        assert_eq!(cache.get("").expect("miss"), None);
    }
}
