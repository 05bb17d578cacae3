use std::io::Write;

use anyhow::{Context, Result};
use landwatch_analysis::CreateAnalysisRequest;
use serde::Serialize;

use crate::app::App;
use crate::cli::Command;

/// Runs a one-shot command, writing its JSON result to `out`.
pub async fn run_command(app: &App, command: Command, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Daemon => anyhow::bail!("the daemon loop is not a one-shot command"),
        Command::Process(analysis_id) => {
            let outcome = app
                .runner
                .process_analysis(&analysis_id)
                .await
                .with_context(|| format!("failed to process analysis {analysis_id}"))?;
            tracing::info!(analysis_id = %analysis_id, outcome = ?outcome, "process finished");
            print_analysis(app, &analysis_id, out)
        }
        Command::DrainOnce => {
            let queued = app.runner.poll_once().context("pending analysis poll failed")?;
            let processed = app.runner.drain().await;
            write_json(
                out,
                &serde_json::json!({ "queued": queued, "processed": processed }),
            )
        }
        Command::RunDue => {
            let summary = app
                .scheduler
                .run_due()
                .await
                .context("failed to run due schedules")?;
            app.runner.drain().await;
            write_json(out, &summary)
        }
        Command::SweepCache => {
            let deleted = app
                .cache
                .cleanup_expired()
                .context("analysis cache sweep failed")?;
            write_json(out, &serde_json::json!({ "deleted": deleted }))
        }
        Command::CreateCar {
            car_key,
            kind,
            date,
            docs,
        } => {
            let created = app
                .service
                .create(CreateAnalysisRequest {
                    car_key,
                    analysis_date: date,
                    kind,
                    documents: docs,
                    ..CreateAnalysisRequest::default()
                })
                .await
                .context("failed to create analysis")?;
            app.runner.drain().await;
            print_analysis(app, &created.id, out)
        }
        Command::Detail(analysis_id) => {
            let detail = app
                .service
                .get_detail(&analysis_id)
                .await
                .with_context(|| format!("failed to load analysis {analysis_id}"))?;
            write_json(out, &detail)
        }
        Command::Map {
            analysis_id,
            tolerance,
        } => {
            let rows = app
                .service
                .get_map(&analysis_id, tolerance)
                .await
                .with_context(|| format!("failed to load map for analysis {analysis_id}"))?;
            write_json(out, &rows)
        }
        Command::Phases { as_of } => {
            let phases = app
                .service
                .list_indigena_phases(as_of.as_deref())
                .await
                .context("failed to list indigenous-land phases")?;
            write_json(out, &phases)
        }
    }
}

fn print_analysis(app: &App, analysis_id: &str, out: &mut impl Write) -> Result<()> {
    let record = app
        .store
        .get_analysis(analysis_id)
        .context("failed to read analysis")?
        .with_context(|| format!("analysis {analysis_id} not found"))?;
    write_json(out, &record)
}

fn write_json<T: Serialize + ?Sized>(out: &mut impl Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value).context("failed to encode output")?;
    writeln!(out).context("failed to write output")?;
    Ok(())
}
