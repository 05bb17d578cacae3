use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use landwatch_core::{AnalysisKind, Clock, ScheduleFrequency};
use landwatch_store::{AnalysisStore, ScheduleRecord};
use serde::Serialize;

use crate::AnalysisError;

const DEFAULT_TIMEZONE: &str = "UTC";

/// Next run after `from`: +1, +7 or +14 days, or one calendar month (UTC).
pub fn next_run_at(from: DateTime<Utc>, frequency: ScheduleFrequency) -> DateTime<Utc> {
    match frequency {
        ScheduleFrequency::Daily => from + Duration::days(1),
        ScheduleFrequency::Weekly => from + Duration::days(7),
        ScheduleFrequency::Biweekly => from + Duration::days(14),
        ScheduleFrequency::Monthly => from
            .checked_add_months(Months::new(1))
            .unwrap_or_else(|| from + Duration::days(30)),
    }
}

/// Daily schedules run immediately; the rest wait one period.
pub fn initial_run_at(from: DateTime<Utc>, frequency: ScheduleFrequency) -> DateTime<Utc> {
    match frequency {
        ScheduleFrequency::Daily => from,
        other => next_run_at(from, other),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSchedule {
    pub farm_id: String,
    pub kind: AnalysisKind,
    pub frequency: ScheduleFrequency,
    pub timezone: Option<String>,
    pub active: Option<bool>,
    pub created_by: Option<String>,
}

/// What a claimed schedule asks the analysis service to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAnalysis {
    pub farm_id: String,
    pub schedule_id: String,
    pub kind: AnalysisKind,
    pub created_by: Option<String>,
}

impl From<&ScheduleRecord> for ScheduledAnalysis {
    fn from(schedule: &ScheduleRecord) -> Self {
        Self {
            farm_id: schedule.farm_id.clone(),
            schedule_id: schedule.id.clone(),
            kind: schedule.kind,
            created_by: schedule.created_by.clone(),
        }
    }
}

/// Creates the analysis for a claimed schedule and returns its id.
#[async_trait]
pub trait ScheduledAnalysisLauncher: Send + Sync {
    async fn launch(&self, request: &ScheduledAnalysis) -> Result<String, AnalysisError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunDueSummary {
    pub processed: usize,
    pub created: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunNowOutcome {
    pub schedule_id: String,
    pub analysis_id: String,
    pub next_run_at: DateTime<Utc>,
}

pub struct SchedulingEngine {
    store: Arc<dyn AnalysisStore>,
    clock: Arc<dyn Clock>,
    launcher: Arc<dyn ScheduledAnalysisLauncher>,
    batch_size: u32,
}

impl SchedulingEngine {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        clock: Arc<dyn Clock>,
        launcher: Arc<dyn ScheduledAnalysisLauncher>,
        batch_size: u32,
    ) -> Self {
        Self {
            store,
            clock,
            launcher,
            batch_size: batch_size.max(1),
        }
    }

    pub fn create(&self, request: NewSchedule) -> Result<ScheduleRecord, AnalysisError> {
        if self.store.get_farm(&request.farm_id)?.is_none() {
            return Err(AnalysisError::FarmNotFound(request.farm_id));
        }
        let now = self.clock.now();
        let timezone = request
            .timezone
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_TIMEZONE)
            .to_owned();
        let record = ScheduleRecord {
            id: uuid::Uuid::new_v4().to_string(),
            farm_id: request.farm_id,
            kind: request.kind,
            frequency: request.frequency,
            timezone,
            active: request.active.unwrap_or(true),
            next_run_at: initial_run_at(now, request.frequency),
            last_run_at: None,
            created_by: request.created_by,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_schedule(&record)?;
        tracing::info!(
            schedule_id = %record.id,
            farm_id = %record.farm_id,
            frequency = record.frequency.as_str(),
            next_run_at = %record.next_run_at,
            "schedule created"
        );
        Ok(record)
    }

    /// Claims every due schedule once and launches its analysis. A schedule
    /// claimed by another instance between listing and claiming is skipped.
    pub async fn run_due(&self) -> Result<RunDueSummary, AnalysisError> {
        let now = self.clock.now();
        let due = self.store.list_due_schedules(now, self.batch_size)?;
        let mut summary = RunDueSummary::default();

        for schedule in &due {
            let next = next_run_at(now, schedule.frequency);
            if !self.store.claim_due_schedule(&schedule.id, now, next)? {
                continue;
            }
            summary.processed += 1;
            match self.launcher.launch(&ScheduledAnalysis::from(schedule)).await {
                Ok(analysis_id) => {
                    summary.created += 1;
                    tracing::debug!(schedule_id = %schedule.id, analysis_id = %analysis_id, "scheduled analysis created");
                }
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(
                        event = "schedule.run.failed",
                        schedule_id = %schedule.id,
                        error = %err,
                        "failed to create scheduled analysis"
                    );
                }
            }
        }

        if summary.processed > 0 {
            tracing::info!(
                event = "schedule.run_due",
                processed = summary.processed,
                created = summary.created,
                failed = summary.failed,
                "due schedules processed"
            );
        }
        Ok(summary)
    }

    pub async fn run_now(&self, schedule_id: &str) -> Result<RunNowOutcome, AnalysisError> {
        let schedule = self.load(schedule_id)?;
        if let Some(analysis_id) = self.store.find_in_flight_for_schedule(schedule_id)? {
            tracing::debug!(schedule_id, analysis_id = %analysis_id, "schedule already in flight");
            return Err(AnalysisError::ScheduleAlreadyRunning(schedule_id.to_owned()));
        }

        let now = self.clock.now();
        let next = next_run_at(now, schedule.frequency);
        if !self
            .store
            .claim_schedule_if_unchanged(schedule_id, schedule.updated_at, now, next)?
        {
            return Err(AnalysisError::ScheduleConcurrentUpdate(schedule_id.to_owned()));
        }

        let analysis_id = self.launcher.launch(&ScheduledAnalysis::from(&schedule)).await?;
        Ok(RunNowOutcome {
            schedule_id: schedule.id,
            analysis_id,
            next_run_at: next,
        })
    }

    pub fn pause(&self, schedule_id: &str) -> Result<ScheduleRecord, AnalysisError> {
        let schedule = self.load(schedule_id)?;
        self.set_active(schedule_id, false, schedule.next_run_at)
    }

    /// A `next_run_at` already in the past moves one period past now.
    pub fn resume(&self, schedule_id: &str) -> Result<ScheduleRecord, AnalysisError> {
        let schedule = self.load(schedule_id)?;
        let now = self.clock.now();
        let next = if schedule.next_run_at <= now {
            next_run_at(now, schedule.frequency)
        } else {
            schedule.next_run_at
        };
        self.set_active(schedule_id, true, next)
    }

    fn set_active(
        &self,
        schedule_id: &str,
        active: bool,
        next: DateTime<Utc>,
    ) -> Result<ScheduleRecord, AnalysisError> {
        self.store
            .set_schedule_active(schedule_id, active, next, self.clock.now())?
            .ok_or_else(|| AnalysisError::ScheduleNotFound(schedule_id.to_owned()))
    }

    fn load(&self, schedule_id: &str) -> Result<ScheduleRecord, AnalysisError> {
        self.store
            .get_schedule(schedule_id)?
            .ok_or_else(|| AnalysisError::ScheduleNotFound(schedule_id.to_owned()))
    }
}
