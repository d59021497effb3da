//! Adviser job lifecycle: the job record and the transition table.

mod job;
mod state;

pub use job::{
    ArtifactReceipt, Breach, FailureKind, JobDescriptor, JobOutcome, JobRecord, JobReport,
    Resource,
};
pub use state::{JobEvent, JobState, StateMachine, Transition};
