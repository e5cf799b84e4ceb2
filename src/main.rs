mod cli;
mod ui;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use cli::{Cli, Command, recovery_mode};
use jobstate::{Config, Engine, FailureInfo, FailureKind, Lookup, logging};
use ui::{AwaitProgress, Reporter};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    logging::init(config.log_format, cli.verbose);

    let engine = Arc::new(Engine::from_config(&config).context("failed to set up the engine")?);
    let reporter = Reporter::new();

    match cli.command {
        Command::Resolve { job_id, queue_state } => {
            let resolution = match queue_state {
                Some(label) => engine.resolve(&job_id, label.as_str()),
                None => {
                    if !engine.has_queue() {
                        warn!("no queue URL configured, reconciling against PENDING");
                    }
                    engine.resolve_current(&job_id).await
                }
            };
            reporter.resolution(&job_id, &resolution);
        }
        Command::Await { job_id, timeout_secs } => {
            let probe = engine.probe();
            let progress = AwaitProgress::start(&job_id, probe.worst_case_wait());
            let available = match timeout_secs {
                Some(secs) => {
                    probe
                        .await_result_files_within(&job_id, Duration::from_secs(secs))
                        .await
                }
                None => probe.await_result_files(&job_id).await,
            };
            progress.finish(available);
            if !available {
                return Ok(ExitCode::from(2));
            }
        }
        Command::Stage { job_id, stage, info } => {
            let mut metadata = Map::new();
            if let Some(info) = info {
                metadata.insert("stage_info".into(), json!(info));
            }
            let stage = stage.into();
            engine.write_stage(&job_id, stage, metadata)?;
            reporter.written(&job_id, &format!("entered {stage}"));
        }
        Command::Succeed { job_id, summary } => {
            let summary = summary
                .map(|s| serde_json::from_str::<Value>(&s))
                .transpose()
                .context("--summary is not valid JSON")?
                .unwrap_or(Value::Null);
            engine.mark_success(&job_id, summary)?;
            reporter.written(&job_id, "marked successful");
        }
        Command::Fail {
            job_id,
            message,
            code,
            system,
        } => {
            let kind = if system { FailureKind::System } else { FailureKind::Business };
            let mut failure = FailureInfo::new(message).with_kind(kind);
            if let Some(code) = code {
                failure = failure.with_code(code);
            }
            engine.mark_failure(&job_id, &failure)?;
            reporter.written(&job_id, "marked failed");
        }
        Command::Recover { dry_run, force, job } => {
            let mode = recovery_mode(dry_run, force);
            match job {
                Some(job_id) => {
                    let state = engine.recovery(mode).recover_one(&job_id);
                    reporter.recovered_one(&job_id, state);
                }
                None => {
                    let cancel = CancellationToken::new();
                    let on_interrupt = cancel.clone();
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            on_interrupt.cancel();
                        }
                    });
                    let scanner = Arc::clone(&engine);
                    let stats = tokio::task::spawn_blocking(move || scanner.recover_all(mode, cancel))
                        .await
                        .context("recovery scan panicked")?;
                    reporter.recovery(&stats);
                }
            }
        }
        Command::Stats => match engine.statistics() {
            Lookup::Found(stats) => reporter.statistics(&stats),
            Lookup::Missing | Lookup::Unavailable => {
                reporter.unavailable("stats");
                return Ok(ExitCode::FAILURE);
            }
        },
        Command::Cleanup { older_than_days } => {
            let age = Duration::from_secs(older_than_days.saturating_mul(86_400));
            match engine.cleanup(age) {
                Lookup::Found(removed) => reporter.written("cache", &format!("removed {removed} records")),
                Lookup::Missing | Lookup::Unavailable => {
                    reporter.unavailable("cleanup");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
