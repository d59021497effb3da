//! Output sinks for result artifacts.
//!
//! The `OUTPUT` parameter selects where an artifact goes: nowhere but the job
//! report when unset, stdout for `-`, an HTTP endpoint for `http(s)://` URLs,
//! and otherwise a directory that receives `<document_id>.json`. Each job
//! publishes at most once.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::SinkError;
use crate::parameters::AdviserParameters;
use crate::state_machine::{ArtifactReceipt, JobDescriptor};

/// Destination for a job's result artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    Memory,
    Stdout,
    Http(String),
    Directory(PathBuf),
}

impl OutputSink {
    pub fn classify(output: Option<&str>) -> Self {
        match output {
            None => OutputSink::Memory,
            Some("-") => OutputSink::Stdout,
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                OutputSink::Http(url.to_string())
            }
            Some(dir) => OutputSink::Directory(PathBuf::from(dir)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            OutputSink::Memory => "memory".to_string(),
            OutputSink::Stdout => "stdout".to_string(),
            OutputSink::Http(url) => url.clone(),
            OutputSink::Directory(dir) => dir.display().to_string(),
        }
    }
}

/// The published output of a job run. Contains no timestamps, so two runs
/// with the same seed over the same knowledge base produce equal artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub job_id: String,
    pub document_id: String,
    pub partial: bool,
    pub seed: i64,
    pub candidates: Vec<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

/// Write-once publishing handle shared between the worker and the controller.
#[derive(Debug, Clone)]
pub struct ArtifactPublisher {
    sink: Arc<OutputSink>,
    client: reqwest::Client,
    job_id: String,
    document_id: String,
    seed: i64,
    metadata: Option<serde_json::Value>,
    published: Arc<Mutex<Option<(ArtifactReceipt, ResultArtifact)>>>,
}

impl ArtifactPublisher {
    pub fn new(
        sink: OutputSink,
        client: reqwest::Client,
        descriptor: &JobDescriptor,
        parameters: &AdviserParameters,
    ) -> Self {
        Self {
            sink: Arc::new(sink),
            client,
            job_id: descriptor.job_id.clone(),
            document_id: descriptor.document_id.clone(),
            seed: parameters.seed(),
            metadata: parameters.metadata().cloned(),
            published: Arc::new(Mutex::new(None)),
        }
    }

    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    /// Build the artifact and send it to the sink. Fails if this job already
    /// published, or if the sink refuses it; nothing is recorded then.
    pub async fn publish(
        &self,
        candidates: Vec<serde_json::Value>,
        partial: bool,
    ) -> Result<ArtifactReceipt, SinkError> {
        let mut published = self.published.lock().await;
        if published.is_some() {
            return Err(SinkError::AlreadyPublished(self.job_id.clone()));
        }

        let artifact = ResultArtifact {
            job_id: self.job_id.clone(),
            document_id: self.document_id.clone(),
            partial,
            seed: self.seed,
            candidates,
            metadata: self.metadata.clone(),
        };

        let location = match self.sink.as_ref() {
            OutputSink::Memory => "memory".to_string(),
            OutputSink::Stdout => {
                let mut body = serde_json::to_vec_pretty(&artifact)?;
                body.push(b'\n');
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&body).await?;
                stdout.flush().await?;
                "stdout".to_string()
            }
            OutputSink::Http(url) => {
                self.post(url, &artifact).await?;
                url.clone()
            }
            OutputSink::Directory(dir) => {
                write_file(dir, &self.document_id, &artifact).await?.display().to_string()
            }
        };

        let receipt = ArtifactReceipt {
            location,
            partial,
            candidates: artifact.candidates.len(),
        };
        info!(
            job_id = %self.job_id,
            location = %receipt.location,
            partial,
            candidates = receipt.candidates,
            "Result artifact published"
        );
        *published = Some((receipt.clone(), artifact));
        Ok(receipt)
    }

    pub async fn receipt(&self) -> Option<ArtifactReceipt> {
        self.published.lock().await.as_ref().map(|(r, _)| r.clone())
    }

    pub async fn artifact(&self) -> Option<ResultArtifact> {
        self.published.lock().await.as_ref().map(|(_, a)| a.clone())
    }

    async fn post(&self, url: &str, artifact: &ResultArtifact) -> Result<(), SinkError> {
        let response = self.client.post(url).json(artifact).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(SinkError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

async fn write_file(
    dir: &Path,
    document_id: &str,
    artifact: &ResultArtifact,
) -> Result<PathBuf, SinkError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{document_id}.json"));
    let body = serde_json::to_vec_pretty(artifact)?;

    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || persist_new(&dir, path, &body))
        .await
        .map_err(|e| SinkError::Io(std::io::Error::other(e)))?
}

// The body is staged next to its destination and only linked into place once
// it is fully written, so a failed write never leaves a truncated artifact.
fn persist_new(dir: &Path, path: PathBuf, body: &[u8]) -> Result<PathBuf, SinkError> {
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(body)?;
    staged.as_file().sync_all()?;
    match staged.persist_noclobber(&path) {
        Ok(_) => Ok(path),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Err(SinkError::Exists(path)),
        Err(e) => Err(e.error.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{DOCUMENT_ID, JOB_ID, METADATA, SEED, Submission};
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn publisher(sink: OutputSink) -> ArtifactPublisher {
        let raw: HashMap<String, String> = [
            (JOB_ID, "adviser-7"),
            (DOCUMENT_ID, "doc-7"),
            (SEED, "11"),
            (METADATA, r#"{"team":"qa"}"#),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let submission = Submission::resolve(&raw).unwrap();
        ArtifactPublisher::new(
            sink,
            reqwest::Client::new(),
            &submission.descriptor,
            &submission.parameters,
        )
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn candidates() -> Vec<serde_json::Value> {
        vec![serde_json::json!({"rank": 1, "score": 0.5})]
    }

    #[test]
    fn classify_outputs() {
        assert_eq!(OutputSink::classify(None), OutputSink::Memory);
        assert_eq!(OutputSink::classify(Some("-")), OutputSink::Stdout);
        assert_eq!(
            OutputSink::classify(Some("https://results.example/api")),
            OutputSink::Http("https://results.example/api".into())
        );
        assert_eq!(
            OutputSink::classify(Some("/var/lib/adviser")),
            OutputSink::Directory(PathBuf::from("/var/lib/adviser"))
        );
    }

    #[tokio::test]
    async fn memory_sink_keeps_artifact() {
        let publisher = publisher(OutputSink::Memory);
        let receipt = publisher.publish(candidates(), false).await.unwrap();
        assert_eq!(receipt.location, "memory");
        assert_eq!(receipt.candidates, 1);

        let artifact = publisher.artifact().await.unwrap();
        assert_eq!(artifact.job_id, "adviser-7");
        assert_eq!(artifact.document_id, "doc-7");
        assert_eq!(artifact.seed, 11);
        assert_eq!(artifact.metadata.unwrap()["team"], "qa");
    }

    #[tokio::test]
    async fn second_publish_is_refused() {
        let publisher = publisher(OutputSink::Memory);
        publisher.publish(candidates(), false).await.unwrap();

        let err = publisher.publish(vec![], true).await.unwrap_err();
        assert!(matches!(err, SinkError::AlreadyPublished(id) if id == "adviser-7"));
        let artifact = publisher.artifact().await.unwrap();
        assert!(!artifact.partial);
        assert_eq!(artifact.candidates.len(), 1);
    }

    #[tokio::test]
    async fn directory_sink_writes_document_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("results");
        let publisher = publisher(OutputSink::Directory(out.clone()));

        let receipt = publisher.publish(candidates(), true).await.unwrap();
        let file = out.join("doc-7.json");
        assert_eq!(receipt.location, file.display().to_string());

        let written: ResultArtifact =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert!(written.partial);
        assert_eq!(written, publisher.artifact().await.unwrap());
        assert_eq!(entries(&out), vec!["doc-7.json".to_string()]);
    }

    #[tokio::test]
    async fn directory_sink_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doc-7.json"), "{}").unwrap();
        let publisher = publisher(OutputSink::Directory(dir.path().to_path_buf()));

        let err = publisher.publish(candidates(), false).await.unwrap_err();
        assert!(matches!(err, SinkError::Exists(_)));
        assert!(publisher.receipt().await.is_none());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("doc-7.json")).unwrap(),
            "{}"
        );
        assert_eq!(entries(dir.path()), vec!["doc-7.json".to_string()]);
    }

    #[tokio::test]
    async fn unwritable_directory_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("results");
        std::fs::write(&blocker, "not a directory").unwrap();
        let publisher = publisher(OutputSink::Directory(blocker));

        assert!(publisher.publish(candidates(), false).await.is_err());
        assert!(publisher.receipt().await.is_none());
        assert_eq!(entries(dir.path()), vec!["results".to_string()]);
    }

    #[tokio::test]
    async fn http_sink_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/results"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/results", server.uri());
        let publisher = publisher(OutputSink::Http(url.clone()));
        let receipt = publisher.publish(candidates(), false).await.unwrap();
        assert_eq!(receipt.location, url);

        let requests = server.received_requests().await.unwrap();
        let body: ResultArtifact = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body.document_id, "doc-7");
    }

    #[tokio::test]
    async fn http_sink_error_is_not_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let publisher = publisher(OutputSink::Http(server.uri()));
        let err = publisher.publish(candidates(), false).await.unwrap_err();
        match err {
            SinkError::Http { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "busy");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
        assert!(publisher.receipt().await.is_none());
    }
}
