//! The opaque search process and the context the envelope hands to it.

mod process;
mod sampler;

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ServiceEndpoints;
use crate::error::SinkError;
use crate::governor::UsageMeter;
use crate::parameters::AdviserParameters;
use crate::sink::ArtifactPublisher;
use crate::state_machine::{ArtifactReceipt, JobDescriptor};

pub use process::ProcessWorker;
pub use sampler::SeededSampler;

/// How a worker run ended. `code` is `None` when no exit code is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success() -> Self {
        Self { code: Some(0) }
    }

    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }
}

/// Everything a worker may see. Parameters are frozen; the only way back to
/// the envelope is the usage meter and the artifact publisher.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub descriptor: JobDescriptor,
    pub parameters: Arc<AdviserParameters>,
    pub endpoints: Arc<ServiceEndpoints>,
    stop: CancellationToken,
    meter: UsageMeter,
    publisher: ArtifactPublisher,
}

impl WorkerContext {
    pub fn new(
        descriptor: JobDescriptor,
        parameters: Arc<AdviserParameters>,
        endpoints: Arc<ServiceEndpoints>,
        stop: CancellationToken,
        meter: UsageMeter,
        publisher: ArtifactPublisher,
    ) -> Self {
        Self {
            descriptor,
            parameters,
            endpoints,
            stop,
            meter,
            publisher,
        }
    }

    /// Whether the watchdog asked the search to wrap up.
    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the stop signal has been sent.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub fn meter(&self) -> &UsageMeter {
        &self.meter
    }

    /// Publish the best candidates found so far. The artifact is marked
    /// partial when the stop signal preceded it.
    pub async fn publish(
        &self,
        candidates: Vec<serde_json::Value>,
    ) -> Result<ArtifactReceipt, SinkError> {
        self.publisher
            .publish(candidates, self.stop_requested())
            .await
    }
}

/// An interruptible search. Implementations must watch
/// [`WorkerContext::stopped`] and publish their best result before returning
/// once it fires; the controller drops the future after the grace window.
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: WorkerContext) -> impl Future<Output = WorkerExit> + Send;
}

/// Worker selected at startup from configuration.
#[derive(Debug)]
pub enum ConfiguredWorker {
    Builtin(SeededSampler),
    Process(ProcessWorker),
}

impl Worker for ConfiguredWorker {
    fn name(&self) -> &'static str {
        match self {
            ConfiguredWorker::Builtin(w) => w.name(),
            ConfiguredWorker::Process(w) => w.name(),
        }
    }

    fn run(&self, ctx: WorkerContext) -> impl Future<Output = WorkerExit> + Send {
        async move {
            match self {
                ConfiguredWorker::Builtin(w) => w.run(ctx).await,
                ConfiguredWorker::Process(w) => w.run(ctx).await,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;
    use crate::parameters::{DOCUMENT_ID, JOB_ID, Submission};
    use crate::sink::OutputSink;

    /// A context over an in-memory sink, for driving workers directly.
    pub fn context(pairs: &[(&str, &str)]) -> (WorkerContext, CancellationToken, ArtifactPublisher) {
        let mut raw: HashMap<String, String> = HashMap::new();
        raw.insert(JOB_ID.into(), "adviser-w".into());
        raw.insert(DOCUMENT_ID.into(), "doc-w".into());
        for (k, v) in pairs {
            raw.insert(k.to_string(), v.to_string());
        }
        let submission = Submission::resolve(&raw).unwrap();
        let stop = CancellationToken::new();
        let publisher = ArtifactPublisher::new(
            OutputSink::Memory,
            reqwest::Client::new(),
            &submission.descriptor,
            &submission.parameters,
        );
        let ctx = WorkerContext::new(
            submission.descriptor,
            Arc::new(submission.parameters),
            Arc::new(ServiceEndpoints::default()),
            stop.clone(),
            UsageMeter::new(),
            publisher.clone(),
        );
        (ctx, stop, publisher)
    }
}
