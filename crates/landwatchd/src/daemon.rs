use std::future::pending;
use std::time::Duration;

use anyhow::{Context, Result};
use landwatch_config::LandwatchConfig;
use tokio::time::{Interval, MissedTickBehavior, interval};

use crate::app::App;

/// Runs the pending-analysis poller, the cache sweep and the scheduler until
/// `shutdown` resolves. A zero interval disables that loop.
pub async fn run_loops<F>(app: &App, config: &LandwatchConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut poll = ticker(config.runner.poll_interval_secs);
    let mut sweep = ticker(config.cache.sweep_interval_hours.saturating_mul(60 * 60));
    let mut schedule = if config.scheduler.enabled {
        ticker(config.scheduler.interval_secs)
    } else {
        None
    };
    tokio::pin!(shutdown);

    tracing::info!(
        poll_secs = config.runner.poll_interval_secs,
        sweep_hours = config.cache.sweep_interval_hours,
        scheduler = schedule.is_some(),
        "landwatchd started"
    );

    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
            () = tick(&mut poll) => poll_pending(app),
            () = tick(&mut sweep) => sweep_cache(app),
            () = tick(&mut schedule) => run_schedules(app).await,
        }
    }
    Ok(())
}

pub async fn run_until_ctrl_c(app: &App, config: &LandwatchConfig) -> Result<()> {
    run_loops(app, config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            pending::<()>().await;
        }
    })
    .await
    .context("daemon loop failed")
}

fn ticker(period_secs: u64) -> Option<Interval> {
    if period_secs == 0 {
        return None;
    }
    let mut ticker = interval(Duration::from_secs(period_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

fn poll_pending(app: &App) {
    match app.runner.poll_once() {
        Ok(0) => {}
        Ok(queued) => tracing::debug!(queued, "pending analyses queued"),
        Err(err) => tracing::error!(error = %err, "pending analysis poll failed"),
    }
}

fn sweep_cache(app: &App) {
    match app.cache.cleanup_expired() {
        Ok(deleted) => tracing::info!(deleted, "analysis cache sweep finished"),
        Err(err) => tracing::warn!(error = %err, "analysis cache sweep failed"),
    }
}

async fn run_schedules(app: &App) {
    if let Err(err) = app.scheduler.run_due().await {
        tracing::error!(error = %err, "scheduler tick failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use landwatch_analysis::NewSchedule;
    use landwatch_core::{AnalysisKind, ManualClock, ScheduleFrequency};
    use landwatch_store::{AnalysisStore, FarmRecord, MemorySpatialStore, SqliteStore};

    use super::*;

    fn app(temp: &tempfile::TempDir, config: &LandwatchConfig) -> (App, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open(temp.path().join("app.sqlite")).expect("store"));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap(),
        ));
        let app = App::with_stores(
            store.clone(),
            Arc::new(MemorySpatialStore::new()),
            clock,
            config,
        );
        (app, store)
    }

    #[tokio::test]
    async fn loops_stop_when_shutdown_resolves() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = LandwatchConfig::default();
        let (app, _store) = app(&temp, &config);

        run_loops(&app, &config, async {})
            .await
            .expect("loop exits cleanly");
    }

    #[tokio::test]
    async fn first_scheduler_tick_launches_due_schedules() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = LandwatchConfig::default();
        config.runner.poll_interval_secs = 0;
        config.cache.sweep_interval_hours = 0;
        let (app, store) = app(&temp, &config);
        store
            .insert_farm(&FarmRecord {
                id: "farm-1".to_owned(),
                name: "Fazenda".to_owned(),
                car_key: "MT-1".to_owned(),
                owner: None,
                documents: Vec::new(),
                created_at: Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap(),
            })
            .expect("farm");
        let schedule = app
            .scheduler
            .create(NewSchedule {
                farm_id: "farm-1".to_owned(),
                kind: AnalysisKind::Deter,
                frequency: ScheduleFrequency::Daily,
                timezone: None,
                active: Some(true),
                created_by: None,
            })
            .expect("schedule");

        run_loops(&app, &config, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .expect("loop");

        let updated = store
            .get_schedule(&schedule.id)
            .expect("get")
            .expect("schedule exists");
        assert!(updated.next_run_at > schedule.next_run_at);
        assert_eq!(updated.last_run_at, Some(schedule.next_run_at));
    }
}
