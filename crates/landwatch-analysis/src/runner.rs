//! In-process analysis queue.
//!
//! Cross-process exclusion comes only from the conditional `pending -> running`
//! claim in the store; inside one process a single drain task processes one
//! analysis at a time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Duration;
use landwatch_config::RunnerConfig;
use landwatch_core::{
    AnalysisKind, Clock, is_current_date, is_intersection_row, should_keep_intersection,
};
use landwatch_store::{
    AnalysisRecord, AnalysisResultRecord, AnalysisStore, CompletionSummary, IntersectionRow,
    SpatialStore,
};

use crate::alerting::{AlertRequest, AlertingEngine};
use crate::cache::{AnalysisCache, CachePayload, CachedMap};
use crate::detail::DetailBuilder;
use crate::retry::with_reconnect;
use crate::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another worker owns the analysis, or it left `pending` (or `running`)
    /// before this worker could move it on.
    Skipped,
    Missing,
    /// Returned to `pending` while the spatial views refresh.
    Deferred,
    Failed,
    Completed { intersection_count: i64 },
}

#[derive(Clone)]
pub struct AnalysisRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    store: Arc<dyn AnalysisStore>,
    spatial: Arc<dyn SpatialStore>,
    clock: Arc<dyn Clock>,
    detail: Arc<DetailBuilder>,
    cache: Arc<AnalysisCache>,
    alerting: Arc<AlertingEngine>,
    config: RunnerConfig,
    queue: Mutex<HashSet<String>>,
    processing: AtomicBool,
    polling: AtomicBool,
}

/// Clears the flag when the holder finishes, even on early return.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then_some(Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AnalysisRunner {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        spatial: Arc<dyn SpatialStore>,
        clock: Arc<dyn Clock>,
        detail: Arc<DetailBuilder>,
        cache: Arc<AnalysisCache>,
        alerting: Arc<AlertingEngine>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                spatial,
                clock,
                detail,
                cache,
                alerting,
                config,
                queue: Mutex::new(HashSet::new()),
                processing: AtomicBool::new(false),
                polling: AtomicBool::new(false),
            }),
        }
    }

    fn queue(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner.queue.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("runner queue lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Queues the id and kicks a drain on the current runtime. Outside a
    /// runtime the id stays queued until [`AnalysisRunner::drain`] runs.
    pub fn enqueue(&self, analysis_id: &str) {
        let analysis_id = analysis_id.trim();
        if analysis_id.is_empty() {
            return;
        }
        self.queue().insert(analysis_id.to_owned());

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let runner = self.clone();
            handle.spawn(async move {
                runner.drain().await;
            });
        }
    }

    /// Processes queued analyses one at a time until the queue is empty.
    /// Returns immediately when another drain is active.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        loop {
            let Some(guard) = FlagGuard::acquire(&self.inner.processing) else {
                return processed;
            };
            while let Some(analysis_id) = self.next_queued() {
                if let Err(err) = self.process_analysis(&analysis_id).await {
                    tracing::error!(
                        event = "analysis.process.failed",
                        analysis_id = %analysis_id,
                        error = %err,
                        "analysis processing failed"
                    );
                }
                processed += 1;
            }
            drop(guard);
            if self.queue().is_empty() {
                return processed;
            }
        }
    }

    fn next_queued(&self) -> Option<String> {
        let mut queue = self.queue();
        let next = queue.iter().next().cloned()?;
        queue.remove(&next);
        Some(next)
    }

    /// One poll tick: force-fail stale runs, then enqueue the oldest pending
    /// analyses. Overlapping ticks are skipped.
    pub fn poll_once(&self) -> Result<usize, AnalysisError> {
        let Some(_guard) = FlagGuard::acquire(&self.inner.polling) else {
            tracing::debug!("previous poll still running, skipping");
            return Ok(0);
        };

        self.sweep_stale()?;
        let pending = self
            .inner
            .store
            .list_pending_ids(self.inner.config.poll_batch_size)?;
        for analysis_id in &pending {
            self.enqueue(analysis_id);
        }
        Ok(pending.len())
    }

    fn sweep_stale(&self) -> Result<(), AnalysisError> {
        let minutes = self.inner.config.stale_running_minutes;
        if minutes == 0 {
            return Ok(());
        }
        let now = self.inner.clock.now();
        let cutoff = now - Duration::minutes(i64::from(minutes));
        for analysis_id in self.inner.store.fail_stale_running(cutoff, now)? {
            tracing::warn!(
                event = "analysis.failed",
                analysis_id = %analysis_id,
                reason = "stale_running",
                stale_after_minutes = minutes,
                "analysis stuck in running, marked failed"
            );
        }
        Ok(())
    }

    /// Claims and runs one analysis. `Err` only when the claim itself fails;
    /// every later failure is recorded on the analysis and reported as
    /// [`ProcessOutcome::Failed`].
    pub async fn process_analysis(&self, analysis_id: &str) -> Result<ProcessOutcome, AnalysisError> {
        let started = Instant::now();
        let inner = &self.inner;
        if !inner.store.claim_pending(analysis_id, inner.clock.now())? {
            tracing::debug!(analysis_id, "analysis already claimed or not pending");
            return Ok(ProcessOutcome::Skipped);
        }

        match self.run_claimed(analysis_id, started).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::error!(
                    event = "analysis.failed",
                    analysis_id,
                    reason = "exception",
                    error = %err,
                    "analysis failed"
                );
                match inner.store.mark_failed(analysis_id, inner.clock.now(), false) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(analysis_id, "analysis already left running");
                    }
                    Err(mark_err) => {
                        tracing::warn!(analysis_id, error = %mark_err, "failed to mark analysis as failed");
                    }
                }
                Ok(ProcessOutcome::Failed)
            }
        }
    }

    async fn run_claimed(
        &self,
        analysis_id: &str,
        started: Instant,
    ) -> Result<ProcessOutcome, AnalysisError> {
        let inner = &self.inner;
        let Some(analysis) = inner.store.get_analysis(analysis_id)? else {
            tracing::warn!(analysis_id, "claimed analysis disappeared");
            return Ok(ProcessOutcome::Missing);
        };

        let now = inner.clock.now();
        let current = analysis
            .analysis_date
            .is_none_or(|date| is_current_date(date, now));
        if current && self.views_refreshing().await {
            inner.store.release_to_pending(analysis_id)?;
            tracing::info!(
                event = "analysis.deferred",
                analysis_id,
                reason = "mv_refresh",
                "spatial views refreshing, analysis returned to pending"
            );
            return Ok(ProcessOutcome::Deferred);
        }

        let as_of = match analysis.kind {
            AnalysisKind::Deter if current => None,
            _ => analysis.analysis_date,
        };
        let spatial = inner.spatial.as_ref();
        let rows = with_reconnect(spatial, "intersections", || {
            spatial.intersections(&analysis.car_key, as_of, analysis.kind)
        })
        .await?;

        let kept: Vec<IntersectionRow> = rows
            .into_iter()
            .filter(|row| {
                should_keep_intersection(
                    &row.category_code,
                    &row.dataset_code,
                    row.is_base_registry(),
                    analysis.kind,
                )
            })
            .collect();
        if kept.is_empty() {
            if !inner.store.mark_failed(analysis_id, inner.clock.now(), true)? {
                return Ok(self.lost_claim(analysis_id));
            }
            tracing::warn!(
                event = "analysis.failed",
                analysis_id,
                reason = "no_intersections",
                "intersection function returned no rows"
            );
            return Ok(ProcessOutcome::Failed);
        }

        let records: Vec<AnalysisResultRecord> = kept
            .into_iter()
            .map(|row| result_record(analysis_id, row))
            .collect();
        let intersection_count = records
            .iter()
            .filter(|row| {
                is_intersection_row(&row.category_code, &row.dataset_code, row.is_sicar, analysis.kind)
            })
            .count() as i64;
        let completed = inner.store.complete_analysis(
            analysis_id,
            &records,
            CompletionSummary {
                completed_at: inner.clock.now(),
                has_intersections: intersection_count > 0,
                intersection_count,
            },
        )?;
        if !completed {
            return Ok(self.lost_claim(analysis_id));
        }

        self.alert(&analysis);
        if let Err(err) = self.warm_cache(analysis_id).await {
            tracing::warn!(
                event = "analysis.cache.failed",
                analysis_id,
                error = %err,
                "failed to warm analysis cache"
            );
        }

        tracing::info!(
            event = "analysis.completed",
            analysis_id,
            intersection_count,
            has_intersections = intersection_count > 0,
            duration_ms = started.elapsed().as_millis() as u64,
            "analysis completed"
        );
        Ok(ProcessOutcome::Completed { intersection_count })
    }

    /// The analysis was moved out of `running` (by the stale sweep) while this
    /// worker held it; its results are discarded.
    fn lost_claim(&self, analysis_id: &str) -> ProcessOutcome {
        tracing::warn!(
            event = "analysis.discarded",
            analysis_id,
            "analysis no longer running, results discarded"
        );
        ProcessOutcome::Skipped
    }

    /// A failing probe counts as refreshing.
    async fn views_refreshing(&self) -> bool {
        match self.inner.spatial.refresh_in_progress().await {
            Ok(refreshing) => refreshing,
            Err(err) => {
                tracing::warn!(error = %err, "materialized view refresh probe failed");
                true
            }
        }
    }

    fn alert(&self, analysis: &AnalysisRecord) {
        let (Some(farm_id), Some(schedule_id)) = (&analysis.farm_id, &analysis.schedule_id) else {
            return;
        };
        let request = AlertRequest {
            analysis_id: analysis.id.clone(),
            farm_id: farm_id.clone(),
            schedule_id: Some(schedule_id.clone()),
            analysis_kind: analysis.kind,
        };
        if let Err(err) = self.inner.alerting.create_alert_for_novel_intersections(&request) {
            tracing::warn!(
                event = "analysis.alert.failed",
                analysis_id = %analysis.id,
                error = %err,
                "failed to evaluate new-intersection alert"
            );
        }
    }

    async fn warm_cache(&self, analysis_id: &str) -> Result<(), AnalysisError> {
        let detail = self.inner.detail.get_by_id(analysis_id).await?;
        let rows = self.inner.detail.get_map_by_id(analysis_id, None).await?;
        let payload = CachePayload::new(
            Some(detail),
            Some(CachedMap {
                tolerance: self.inner.detail.default_tolerance(),
                rows,
            }),
        );
        self.inner
            .cache
            .set(analysis_id, &serde_json::to_value(&payload)?)
    }
}

fn result_record(analysis_id: &str, row: IntersectionRow) -> AnalysisResultRecord {
    let is_sicar = row.is_base_registry();
    AnalysisResultRecord {
        analysis_id: analysis_id.to_owned(),
        category_code: row.category_code,
        dataset_code: row.dataset_code,
        snapshot_date: row.snapshot_date,
        feature_id: row.feature_id,
        geom_id: row.geom_id,
        is_sicar,
        sicar_area_m2: row.sicar_area_m2,
        feature_area_m2: row.feature_area_m2,
        overlap_area_m2: row.overlap_area_m2,
        overlap_pct_of_sicar: row.overlap_pct_of_sicar,
    }
}
