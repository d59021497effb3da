use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobState;

/// Identity of a submitted job. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    pub document_id: String,
    pub created_at: DateTime<Utc>,
}

impl JobDescriptor {
    pub fn new(job_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            document_id: document_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// A ceiling enforced by the resource governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Memory,
    Cpu,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Memory => write!(f, "memory"),
            Resource::Cpu => write!(f, "cpu"),
        }
    }
}

/// A ceiling that was exceeded. Memory in bytes, CPU in millicores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breach {
    pub resource: Resource,
    pub observed: u64,
    pub ceiling: u64,
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// A CPU or memory ceiling was exceeded.
    ResourceExhaustion(Breach),
    /// The worker exited non-zero, or was killed by a signal, before it was
    /// asked to flush. `code` is `None` for a signal.
    WorkerCrash { code: Option<i32> },
    /// The worker exited non-zero, or died from a signal, while flushing
    /// after the stop signal.
    FlushAborted { code: Option<i32> },
    /// The worker exited cleanly but never published a result artifact.
    MissingArtifact,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::ResourceExhaustion(b) => write!(
                f,
                "{} ceiling exceeded ({} > {})",
                b.resource, b.observed, b.ceiling
            ),
            FailureKind::WorkerCrash { code: Some(code) } => {
                write!(f, "worker crashed with exit code {code}")
            }
            FailureKind::WorkerCrash { code: None } => write!(f, "worker crashed without exit code"),
            FailureKind::FlushAborted { code: Some(code) } => {
                write!(f, "worker exited with code {code} while flushing")
            }
            FailureKind::FlushAborted { code: None } => {
                write!(f, "worker terminated by a signal while flushing")
            }
            FailureKind::MissingArtifact => write!(f, "worker exited without a result artifact"),
        }
    }
}

/// Terminal result of a job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The worker exited cleanly with an artifact. `partial` is set when the
    /// artifact was flushed after the stop signal.
    Completed { partial: bool },
    /// The worker ignored the stop signal for the whole grace window.
    Killed,
    Failed(FailureKind),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed { .. } => JobState::Completed,
            JobOutcome::Killed => JobState::Killed,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }

    /// Category a submitter uses to tell terminal results apart.
    pub fn category(&self) -> &'static str {
        match self {
            JobOutcome::Completed { partial: false } => "completed",
            JobOutcome::Completed { partial: true } => "soft_timeout",
            JobOutcome::Killed => "hard_timeout",
            JobOutcome::Failed(FailureKind::ResourceExhaustion(_)) => "resource_exhaustion",
            JobOutcome::Failed(FailureKind::WorkerCrash { .. }) => "worker_crash",
            JobOutcome::Failed(FailureKind::FlushAborted { .. }) => "flush_aborted",
            JobOutcome::Failed(FailureKind::MissingArtifact) => "missing_artifact",
        }
    }

    /// Process exit code reported by the envelope binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            JobOutcome::Completed { .. } => 0,
            JobOutcome::Killed => 3,
            JobOutcome::Failed(_) => 4,
        }
    }
}

/// Restart behaviour of the job controller. Identical inputs reproduce
/// identical outputs, so there is only one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    #[default]
    Never,
}

/// Where and how a result artifact was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReceipt {
    pub location: String,
    pub partial: bool,
    pub candidates: usize,
}

/// Mutable controller-side record of one job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub run_id: String,
    pub descriptor: JobDescriptor,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    pub outcome: Option<JobOutcome>,
    pub restart_policy: RestartPolicy,
    pub restarts: u32,
    pub artifact: Option<ArtifactReceipt>,
    pub soft_deadline_after_ms: Option<u64>,
    pub stop_signal_after_ms: Option<u64>,
    pub force_kill_after_ms: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            descriptor,
            state: JobState::Pending,
            state_history: Vec::new(),
            outcome: None,
            restart_policy: RestartPolicy::Never,
            restarts: 0,
            artifact: None,
            soft_deadline_after_ms: None,
            stop_signal_after_ms: None,
            force_kill_after_ms: None,
            updated_at: Utc::now(),
        }
    }
}

/// Report handed back to the submitter once a job is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub run_id: String,
    pub job_id: String,
    pub document_id: String,
    pub state: JobState,
    pub category: String,
    pub outcome: JobOutcome,
    pub state_transitions: Vec<JobState>,
    pub restarts: u32,
    pub restart_policy: RestartPolicy,
    pub artifact: Option<ArtifactReceipt>,
    pub soft_deadline_after_ms: Option<u64>,
    pub stop_signal_after_ms: Option<u64>,
    pub force_kill_after_ms: Option<u64>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobReport {
    /// Build the report for a job that reached a terminal state.
    pub fn from_record(job: &JobRecord, outcome: JobOutcome) -> Self {
        let now = Utc::now();
        let duration = now - job.descriptor.created_at;
        let mut transitions = job.state_history.clone();
        transitions.push(job.state);

        Self {
            run_id: job.run_id.clone(),
            job_id: job.descriptor.job_id.clone(),
            document_id: job.descriptor.document_id.clone(),
            state: outcome.state(),
            category: outcome.category().to_string(),
            outcome,
            state_transitions: transitions,
            restarts: job.restarts,
            restart_policy: job.restart_policy,
            artifact: job.artifact.clone(),
            soft_deadline_after_ms: job.soft_deadline_after_ms,
            stop_signal_after_ms: job.stop_signal_after_ms,
            force_kill_after_ms: job.force_kill_after_ms,
            submitted_at: job.descriptor.created_at,
            finished_at: now,
            duration_ms: duration.num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_record_defaults() {
        let job = JobRecord::new(JobDescriptor::new("adviser-1", "doc-1"));
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.restarts, 0);
        assert_eq!(job.restart_policy, RestartPolicy::Never);
        assert!(job.state_history.is_empty());
        assert!(job.outcome.is_none());
    }

    #[test]
    fn restart_policy_defaults_to_never() {
        let policy = RestartPolicy::default();
        assert_eq!(policy, RestartPolicy::Never);
        assert_eq!(serde_json::to_value(policy).unwrap(), "never");
    }

    #[test]
    fn outcome_categories_are_distinct() {
        let outcomes = [
            JobOutcome::Completed { partial: false },
            JobOutcome::Completed { partial: true },
            JobOutcome::Killed,
            JobOutcome::Failed(FailureKind::ResourceExhaustion(Breach {
                resource: Resource::Memory,
                observed: 2,
                ceiling: 1,
            })),
            JobOutcome::Failed(FailureKind::WorkerCrash { code: Some(1) }),
            JobOutcome::Failed(FailureKind::FlushAborted { code: None }),
            JobOutcome::Failed(FailureKind::MissingArtifact),
        ];
        let mut categories: Vec<_> = outcomes.iter().map(|o| o.category()).collect();
        categories.sort();
        categories.dedup();
        assert_eq!(categories.len(), outcomes.len());
    }

    #[test]
    fn killed_and_failed_differ_in_exit_code() {
        assert_eq!(JobOutcome::Completed { partial: true }.exit_code(), 0);
        assert_eq!(JobOutcome::Killed.exit_code(), 3);
        assert_eq!(JobOutcome::Failed(FailureKind::MissingArtifact).exit_code(), 4);
    }

    #[test]
    fn failure_kind_display() {
        let breach = FailureKind::ResourceExhaustion(Breach {
            resource: Resource::Memory,
            observed: 9,
            ceiling: 8,
        });
        assert_eq!(breach.to_string(), "memory ceiling exceeded (9 > 8)");

        let crash = FailureKind::WorkerCrash { code: Some(137) };
        assert_eq!(crash.to_string(), "worker crashed with exit code 137");

        let aborted = FailureKind::FlushAborted { code: None };
        assert_eq!(aborted.to_string(), "worker terminated by a signal while flushing");
    }

    #[test]
    fn report_from_record() {
        let mut job = JobRecord::new(JobDescriptor::new("adviser-1", "doc-1"));
        job.state_history.push(JobState::Pending);
        job.state = JobState::Running;
        let report = JobReport::from_record(&job, JobOutcome::Killed);

        assert_eq!(report.job_id, "adviser-1");
        assert_eq!(report.document_id, "doc-1");
        assert_eq!(report.state, JobState::Killed);
        assert_eq!(report.category, "hard_timeout");
        assert_eq!(
            report.state_transitions,
            vec![JobState::Pending, JobState::Running]
        );
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(JobOutcome::Failed(FailureKind::WorkerCrash {
            code: Some(2),
        }))
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "worker_crash");
        assert_eq!(json["code"], 2);
    }
}
