use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{Worker, WorkerContext, WorkerExit};
use crate::governor::ProcUsage;
use crate::parameters::{DOCUMENT_ID, JOB_ID};

/// Runs the adviser as an external command.
///
/// The command leads its own process group, so wrapper scripts are covered:
/// the stop signal is `SIGTERM` to the whole group, and dropping the run
/// future sends `SIGKILL` to it. The frozen parameters are exported as
/// environment variables together with the injected service endpoints. The
/// process answers the stop signal by printing its candidates as JSON on
/// stdout (either a bare array or an object with a `candidates` array) and
/// exiting.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: String,
    args: Vec<String>,
    sample_interval: Duration,
}

impl ProcessWorker {
    /// `None` when `command` is empty.
    pub fn from_command(command: &[String], sample_interval: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            sample_interval,
        })
    }
}

/// The worker's process group. Killed with `SIGKILL` when dropped.
struct ProcessGroup {
    pgid: Pid,
}

impl ProcessGroup {
    fn signal(&self, signal: Signal) {
        match killpg(self.pgid, signal) {
            Ok(()) => info!(pgid = self.pgid.as_raw(), %signal, "Signalled worker process group"),
            Err(Errno::ESRCH) => debug!(pgid = self.pgid.as_raw(), %signal, "Worker process group already gone"),
            Err(e) => warn!(pgid = self.pgid.as_raw(), %signal, error = %e, "Failed to signal worker process group"),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.signal(Signal::SIGKILL);
    }
}

impl Worker for ProcessWorker {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, ctx: WorkerContext) -> WorkerExit {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(ctx.parameters.to_env())
            .env(JOB_ID, &ctx.descriptor.job_id)
            .env(DOCUMENT_ID, &ctx.descriptor.document_id)
            .envs(ctx.endpoints.to_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(program = %self.program, error = %e, "Failed to spawn worker process");
                return WorkerExit { code: None };
            }
        };
        let Some(pid) = child.id() else {
            error!(program = %self.program, "Worker process exited before it could be tracked");
            return WorkerExit { code: None };
        };
        let group = ProcessGroup {
            pgid: Pid::from_raw(pid as i32),
        };
        info!(program = %self.program, pid, "Worker process started");

        // Drain stdout concurrently so a chatty worker cannot block on a full
        // pipe. EOF means every process holding the pipe has exited.
        let stdout = child.stdout.take();
        let mut reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });

        let mut usage = ProcUsage::new(pid);
        let mut ticker = tokio::time::interval(self.sample_interval);
        let mut stop_sent = false;
        let mut status = None;
        let mut output = None;

        while status.is_none() || output.is_none() {
            tokio::select! {
                exited = child.wait(), if status.is_none() => status = Some(exited),
                read = &mut reader, if output.is_none() => output = Some(read.unwrap_or_default()),
                _ = ctx.stopped(), if !stop_sent => {
                    stop_sent = true;
                    group.signal(Signal::SIGTERM);
                }
                _ = ticker.tick() => {
                    if let Some(sample) = usage.sample() {
                        ctx.meter().record(sample);
                    }
                }
            }
        }

        let code = match status {
            Some(Ok(status)) => status.code(),
            Some(Err(e)) => {
                error!(error = %e, "Failed to wait for worker process");
                None
            }
            None => None,
        };
        let output = output.unwrap_or_default();
        debug!(code = ?code, bytes = output.len(), "Worker process exited");
        drop(group);

        if code != Some(0) {
            return WorkerExit { code };
        }

        let candidates = match parse_candidates(&output) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Worker output is not a candidate list");
                return WorkerExit::success();
            }
        };
        if let Err(e) = ctx.publish(candidates).await {
            warn!(error = %e, "Failed to publish result artifact");
        }
        WorkerExit::success()
    }
}

fn parse_candidates(output: &[u8]) -> Result<Vec<serde_json::Value>, serde_json::Error> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum Output {
        List(Vec<serde_json::Value>),
        Wrapped { candidates: Vec<serde_json::Value> },
    }

    Ok(match serde_json::from_slice::<Output>(output)? {
        Output::List(candidates) => candidates,
        Output::Wrapped { candidates } => candidates,
    })
}
