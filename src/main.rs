mod cli;
mod config;
mod controller;
mod error;
mod governor;
mod parameters;
mod sink;
mod state_machine;
mod ui;
mod watchdog;
mod worker;

use std::collections::HashMap;
use std::process::ExitCode;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, SubmissionArgs};
use config::EnvelopeConfig;
use controller::JobController;
use error::EnvelopeError;
use parameters::{JOB_ID, OUTPUT, SCHEMA, Submission, TIMEOUT_SECONDS};
use sink::OutputSink;
use ui::{JobProgress, ReportStream};
use watchdog::ConfiguredProbe;
use worker::{ConfiguredWorker, ProcessWorker, SeededSampler, Worker};

/// Exit code for a submission refused before the worker started.
const EXIT_REJECTED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "adviser-envelope failed");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so a stdout sink carries only the artifact.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Schema => {
            ui::print_schema(SCHEMA);
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { submission } => {
            let raw = submission_map(&submission, None);
            match Submission::resolve(&raw) {
                Ok(resolved) => {
                    println!("{}", serde_json::to_string_pretty(&resolved)?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    error!(error = %e, "Submission rejected");
                    Ok(ExitCode::from(EXIT_REJECTED))
                }
            }
        }
        Command::Run {
            submission,
            builtin,
            grace_window,
            timeout_seconds,
            worker,
        } => {
            let mut config = EnvelopeConfig::load(cli.config.as_deref())?;
            if let Some(secs) = grace_window {
                config.grace_window_secs = secs;
            }
            if !worker.is_empty() {
                config.worker_command = worker;
            }
            config.validate()?;
            debug!(?config, "Envelope configuration loaded");

            let raw = submission_map(&submission, timeout_seconds);
            let worker = select_worker(builtin, &config)?;
            let probe = ConfiguredProbe::from_command(&config.probe_command, config.probe_timeout());
            run_job(worker, probe, &config, &raw).await
        }
    }
}

fn select_worker(builtin: bool, config: &EnvelopeConfig) -> Result<ConfiguredWorker> {
    if builtin {
        return Ok(ConfiguredWorker::Builtin(
            SeededSampler::new().with_step_delay(config.builtin_step_delay()),
        ));
    }
    match ProcessWorker::from_command(&config.worker_command, config.sample_interval()) {
        Some(worker) => Ok(ConfiguredWorker::Process(worker)),
        None => bail!(
            "no worker command: pass one after `--`, set worker_command in envelope.toml, or use --builtin"
        ),
    }
}

/// Parameters from the process environment, overlaid with `--param` values.
fn submission_map(args: &SubmissionArgs, timeout_seconds: Option<u64>) -> HashMap<String, String> {
    let mut raw: HashMap<String, String> = if args.no_env {
        HashMap::new()
    } else {
        SCHEMA
            .iter()
            .filter_map(|spec| {
                std::env::var(spec.key)
                    .ok()
                    .map(|value| (spec.key.to_string(), value))
            })
            .collect()
    };
    raw.extend(args.params.iter().cloned());
    if let Some(secs) = timeout_seconds {
        raw.insert(TIMEOUT_SECONDS.to_string(), secs.to_string());
    }
    raw
}

async fn run_job(
    worker: ConfiguredWorker,
    probe: ConfiguredProbe,
    config: &EnvelopeConfig,
    raw: &HashMap<String, String>,
) -> Result<ExitCode> {
    let job_id = raw.get(JOB_ID).cloned().unwrap_or_else(|| "-".to_string());
    let output = raw.get(OUTPUT).map(|v| v.trim()).filter(|v| !v.is_empty());
    let out = ReportStream::for_sink(&OutputSink::classify(output));
    let progress = JobProgress::start(&job_id, worker.name(), out);

    let controller = JobController::from_config(worker, probe, config)?
        .with_observer(progress.state_observer(&job_id));
    progress.allocation(&controller.allocation());

    match controller.submit(raw).await {
        Ok(run) => {
            progress.complete(&run.report);
            progress.print_report(&run.report);
            Ok(ExitCode::from(run.report.outcome.exit_code()))
        }
        Err(EnvelopeError::Config(e)) => {
            progress.rejected(&e.to_string());
            Ok(ExitCode::from(EXIT_REJECTED))
        }
    }
}
