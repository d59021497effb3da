use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::job::{Breach, FailureKind, JobOutcome, JobRecord};
use crate::error::TransitionError;

/// Lifecycle states of an adviser job.
///
/// PENDING → RUNNING → SOFT_DEADLINE → FLUSHING → {COMPLETED | KILLED | FAILED}
///
/// The declaration order is the lifecycle order; transitions only ever move
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    SoftDeadline,
    Flushing,
    Completed,
    Killed,
    Failed,
}

impl JobState {
    /// States in which a worker process may be alive.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Running | JobState::SoftDeadline | JobState::Flushing
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::SoftDeadline => write!(f, "SOFT_DEADLINE"),
            JobState::Flushing => write!(f, "FLUSHING"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Killed => write!(f, "KILLED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Inputs that drive the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    WorkerStarted,
    /// The compute budget elapsed. Pure timer expiry.
    DeadlineElapsed,
    /// The watchdog's first failed probe; the worker has been told to stop.
    ProbeFailed,
    WorkerExited {
        code: Option<i32>,
        artifact_published: bool,
    },
    /// The grace window after the stop signal ran out.
    GraceExpired,
    ResourceBreach(Breach),
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobEvent::WorkerStarted => write!(f, "WorkerStarted"),
            JobEvent::DeadlineElapsed => write!(f, "DeadlineElapsed"),
            JobEvent::ProbeFailed => write!(f, "ProbeFailed"),
            JobEvent::WorkerExited { code, .. } => write!(f, "WorkerExited({code:?})"),
            JobEvent::GraceExpired => write!(f, "GraceExpired"),
            JobEvent::ResourceBreach(b) => write!(f, "ResourceBreach({})", b.resource),
        }
    }
}

/// The result of applying an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to a non-terminal state.
    Next(JobState),
    /// The job is terminal. Terminal jobs are never restarted.
    Complete(JobOutcome),
}

/// Drives a [`JobRecord`] through the lifecycle.
pub struct StateMachine;

impl StateMachine {
    /// Apply `event` to `job`, recording the previous state in its history.
    ///
    /// Resource breaches and crashes are accepted in every active state and
    /// skip FLUSHING. Events that would move the job backwards, or that arrive
    /// after a terminal state, are rejected and leave the job untouched.
    pub fn apply(job: &mut JobRecord, event: JobEvent) -> Result<Transition, TransitionError> {
        let state = job.state;
        let transition = match (state, &event) {
            (JobState::Pending, JobEvent::WorkerStarted) => Transition::Next(JobState::Running),
            (JobState::Running, JobEvent::DeadlineElapsed) => {
                Transition::Next(JobState::SoftDeadline)
            }
            (JobState::SoftDeadline, JobEvent::ProbeFailed) => Transition::Next(JobState::Flushing),
            (JobState::Flushing, JobEvent::GraceExpired) => Transition::Complete(JobOutcome::Killed),
            (
                s,
                JobEvent::WorkerExited {
                    code,
                    artifact_published,
                },
            ) if s.is_active() => Transition::Complete(Self::classify_exit(
                s,
                *code,
                *artifact_published,
            )),
            (s, JobEvent::ResourceBreach(breach)) if s.is_active() => Transition::Complete(
                JobOutcome::Failed(FailureKind::ResourceExhaustion(*breach)),
            ),
            _ => {
                return Err(TransitionError {
                    state,
                    event: event.to_string(),
                });
            }
        };

        job.state_history.push(state);
        match &transition {
            Transition::Next(next) => job.state = *next,
            Transition::Complete(outcome) => {
                job.state = outcome.state();
                job.outcome = Some(outcome.clone());
            }
        }
        job.updated_at = Utc::now();

        Ok(transition)
    }

    fn classify_exit(state: JobState, code: Option<i32>, artifact_published: bool) -> JobOutcome {
        match (code, artifact_published) {
            (Some(0), true) => JobOutcome::Completed {
                partial: state == JobState::Flushing,
            },
            (Some(0), false) => JobOutcome::Failed(FailureKind::MissingArtifact),
            (code, _) if state == JobState::Flushing => {
                JobOutcome::Failed(FailureKind::FlushAborted { code })
            }
            (code, _) => JobOutcome::Failed(FailureKind::WorkerCrash { code }),
        }
    }
}
