//! Job controller: owns one adviser job from start to terminal state.
//!
//! The controller starts the worker and the watchdog together, listens to the
//! resource governor, and converts whatever happens first into a lifecycle
//! event:
//!
//! ```text
//!   worker exit ──────────────┐
//!   usage above ceiling ──────┤
//!   watchdog: soft deadline ──┼──▶ StateMachine::apply ──▶ JobReport
//!   watchdog: stop signalled ─┤
//!   grace window elapsed ─────┘
//! ```
//!
//! The forced kill is scheduled at exactly `stop signal + grace window`, so
//! the graceful signal always comes first. Terminal jobs are never restarted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{EnvelopeConfig, ServiceEndpoints};
use crate::error::{ConfigError, EnvelopeError};
use crate::governor::{ResourceAllocation, ResourceCeilings, ResourceGovernor, UsageMeter};
use crate::parameters::Submission;
use crate::sink::{ArtifactPublisher, OutputSink, ResultArtifact};
use crate::state_machine::{
    FailureKind, JobEvent, JobOutcome, JobRecord, JobReport, JobState, StateMachine, Transition,
};
use crate::watchdog::{Probe, Watchdog, WatchdogEvent};
use crate::worker::{Worker, WorkerContext, WorkerExit};

/// Supervision settings that do not depend on the submission.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub grace_window: Duration,
    pub probe_interval: Duration,
    pub ceilings: ResourceCeilings,
}

/// A finished job: the report plus the artifact, if one was published.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub report: JobReport,
    pub artifact: Option<ResultArtifact>,
}

type StateObserver = Arc<dyn Fn(JobState) + Send + Sync>;

pub struct JobController<W, P> {
    worker: Arc<W>,
    probe: Arc<P>,
    grace_window: Duration,
    probe_interval: Duration,
    governor: ResourceGovernor,
    endpoints: Arc<ServiceEndpoints>,
    http: reqwest::Client,
    observer: Option<StateObserver>,
}

impl<W: Worker, P: Probe> JobController<W, P> {
    /// Cluster-provided endpoints are injected here rather than read by the
    /// worker from ambient state.
    pub fn new(
        worker: W,
        probe: P,
        settings: ControllerSettings,
        endpoints: ServiceEndpoints,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            worker: Arc::new(worker),
            probe: Arc::new(probe),
            grace_window: settings.grace_window,
            probe_interval: settings.probe_interval,
            governor: ResourceGovernor::new(settings.ceilings),
            endpoints: Arc::new(endpoints),
            http,
            observer: None,
        }
    }

    pub fn from_config(worker: W, probe: P, config: &EnvelopeConfig) -> Result<Self, ConfigError> {
        let settings = ControllerSettings {
            grace_window: config.grace_window(),
            probe_interval: config.probe_interval(),
            ceilings: config.ceilings()?,
        };
        Ok(Self::new(worker, probe, settings, config.endpoints.clone()))
    }

    /// Call `observer` with every state the job enters.
    pub fn with_observer(mut self, observer: impl Fn(JobState) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn allocation(&self) -> ResourceAllocation {
        self.governor.allocation()
    }

    /// Resolve a raw submission and run it. A configuration error is returned
    /// before any worker starts.
    pub async fn submit(&self, raw: &HashMap<String, String>) -> Result<JobRun, EnvelopeError> {
        let submission = Submission::resolve(raw).inspect_err(|e| {
            warn!(error = %e, "Submission rejected before worker start");
        })?;
        Ok(self.run(submission).await)
    }

    /// Supervise one job until it is terminal.
    pub async fn run(&self, submission: Submission) -> JobRun {
        let span = info_span!(
            "job",
            job_id = %submission.descriptor.job_id,
            document_id = %submission.descriptor.document_id,
        );
        self.supervise(submission).instrument(span).await
    }

    async fn supervise(&self, submission: Submission) -> JobRun {
        let Submission {
            descriptor,
            parameters,
        } = submission;
        let parameters = Arc::new(parameters);
        let mut job = JobRecord::new(descriptor.clone());

        let stop = CancellationToken::new();
        let meter = UsageMeter::new();
        let mut usage = meter.subscribe();
        let publisher = ArtifactPublisher::new(
            OutputSink::classify(parameters.output()),
            self.http.clone(),
            &descriptor,
            &parameters,
        );
        let ctx = WorkerContext::new(
            descriptor,
            Arc::clone(&parameters),
            Arc::clone(&self.endpoints),
            stop.clone(),
            meter.clone(),
            publisher.clone(),
        );

        info!(
            run_id = %job.run_id,
            worker = self.worker.name(),
            sink = %publisher.sink().describe(),
            budget_secs = parameters.timeout().as_secs(),
            grace_secs = self.grace_window.as_secs(),
            "Starting adviser job"
        );

        let started = Instant::now();
        let worker = Arc::clone(&self.worker);
        let mut worker_task = tokio::spawn(async move { worker.run(ctx).await });
        self.advance(&mut job, JobEvent::WorkerStarted);

        let (tx, mut watchdog_rx) = mpsc::channel(4);
        let watchdog = Watchdog::new(
            Arc::clone(&self.probe),
            parameters.timeout(),
            self.probe_interval,
        );
        let watchdog_task = tokio::spawn(watchdog.run(started, stop.clone(), tx));

        let mut kill_at: Option<Instant> = None;
        let mut worker_finished = false;

        let final_event = loop {
            tokio::select! {
                biased;

                joined = &mut worker_task => {
                    worker_finished = true;
                    let exit = joined.unwrap_or_else(|e| {
                        error!(error = %e, "Worker task panicked");
                        WorkerExit { code: None }
                    });
                    let artifact_published = publisher.receipt().await.is_some();
                    info!(
                        code = ?exit.code,
                        artifact_published,
                        elapsed_ms = millis(started.elapsed()),
                        "Worker exited"
                    );
                    break JobEvent::WorkerExited { code: exit.code, artifact_published };
                }
                Ok(()) = usage.changed() => {
                    let sample = *usage.borrow_and_update();
                    if let Some(breach) = self.governor.check(sample) {
                        worker_task.abort();
                        break JobEvent::ResourceBreach(breach);
                    }
                }
                Some(event) = watchdog_rx.recv() => match event {
                    WatchdogEvent::SoftDeadline { at } => {
                        job.soft_deadline_after_ms = Some(millis(at - started));
                        self.advance(&mut job, JobEvent::DeadlineElapsed);
                    }
                    WatchdogEvent::StopSignalled { at, reason } => {
                        job.stop_signal_after_ms = Some(millis(at - started));
                        kill_at = Some(at + self.grace_window);
                        info!(
                            reason = %reason,
                            grace_secs = self.grace_window.as_secs(),
                            "Worker asked to flush"
                        );
                        self.advance(&mut job, JobEvent::ProbeFailed);
                    }
                },
                _ = sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() => {
                    worker_task.abort();
                    job.force_kill_after_ms = Some(millis(started.elapsed()));
                    warn!("Grace window expired, force-killing worker");
                    break JobEvent::GraceExpired;
                }
            }
        };

        watchdog_task.abort();
        if !worker_finished {
            // Wait for the aborted task so the worker's resources are released.
            let _ = worker_task.await;
        }

        // The loop only exits while the job is active, where every final event
        // is terminal.
        let outcome = match self.advance(&mut job, final_event) {
            Some(outcome) => outcome,
            None => {
                error!(state = %job.state, "Final event did not terminate the job");
                JobOutcome::Failed(FailureKind::WorkerCrash { code: None })
            }
        };

        job.artifact = publisher.receipt().await;
        let report = JobReport::from_record(&job, outcome);
        info!(
            state = %report.state,
            category = %report.category,
            artifact = report.artifact.is_some(),
            restart_policy = ?report.restart_policy,
            last_memory_bytes = meter.current().memory_bytes,
            "Adviser job finished"
        );

        JobRun {
            report,
            artifact: publisher.artifact().await,
        }
    }

    /// Apply `event`, notify the observer, and return the outcome if the job
    /// became terminal.
    fn advance(&self, job: &mut JobRecord, event: JobEvent) -> Option<JobOutcome> {
        match StateMachine::apply(job, event) {
            Ok(transition) => {
                info!(state = %job.state, "Job state changed");
                if let Some(observer) = &self.observer {
                    observer(job.state);
                }
                match transition {
                    Transition::Next(_) => None,
                    Transition::Complete(outcome) => Some(outcome),
                }
            }
            Err(e) => {
                warn!(error = %e, "Ignoring out-of-order lifecycle event");
                None
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
