//! Deadline watchdog.
//!
//! The watchdog sleeps through the compute budget, then probes on a fixed
//! cadence. The first failed probe cancels the worker's stop token and is
//! reported to the controller, which starts the grace window from that
//! instant. There is no failure threshold above one and no probe retry.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a single liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Pass,
    /// Budget exhausted: the worker must wrap up.
    Fail(String),
}

/// A check run by the watchdog once the soft deadline is reached.
pub trait Probe: Send + Sync + 'static {
    fn check(&self) -> impl Future<Output = ProbeResult> + Send;
}

/// Fails unconditionally. Since the watchdog only probes after the budget
/// elapsed, this turns the soft deadline directly into a stop signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetProbe;

impl Probe for BudgetProbe {
    async fn check(&self) -> ProbeResult {
        ProbeResult::Fail("compute budget exhausted".to_string())
    }
}

/// Runs an external status command; exit code 0 passes, anything else
/// (including a spawn error or running past `timeout`) fails.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

impl Probe for CommandProbe {
    async fn check(&self) -> ProbeResult {
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(self.timeout, status).await {
            Ok(Ok(status)) if status.success() => ProbeResult::Pass,
            Ok(Ok(status)) => ProbeResult::Fail(format!("status command exited with {status}")),
            Ok(Err(e)) => ProbeResult::Fail(format!("status command could not run: {e}")),
            Err(_) => ProbeResult::Fail(format!(
                "status command timed out after {}ms",
                self.timeout.as_millis()
            )),
        }
    }
}

/// Probe chosen at startup from configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredProbe {
    Budget(BudgetProbe),
    Command(CommandProbe),
}

impl ConfiguredProbe {
    /// A command probe when `command` is non-empty, the budget probe otherwise.
    pub fn from_command(command: &[String], timeout: Duration) -> Self {
        match CommandProbe::new(command, timeout) {
            Some(probe) => ConfiguredProbe::Command(probe),
            None => ConfiguredProbe::Budget(BudgetProbe),
        }
    }
}

impl Probe for ConfiguredProbe {
    async fn check(&self) -> ProbeResult {
        match self {
            ConfiguredProbe::Budget(p) => p.check().await,
            ConfiguredProbe::Command(p) => p.check().await,
        }
    }
}

/// Messages from the watchdog to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// The compute budget elapsed.
    SoftDeadline { at: Instant },
    /// A probe failed and the worker's stop token was cancelled at `at`.
    StopSignalled { at: Instant, reason: String },
}

pub struct Watchdog<P> {
    probe: Arc<P>,
    quiet_period: Duration,
    cadence: Duration,
}

impl<P: Probe> Watchdog<P> {
    pub fn new(probe: Arc<P>, quiet_period: Duration, cadence: Duration) -> Self {
        Self {
            probe,
            quiet_period,
            cadence,
        }
    }

    /// Watch a worker started at `started`. Returns after signalling stop, or
    /// early if the controller stops listening.
    pub async fn run(
        self,
        started: Instant,
        stop: CancellationToken,
        events: mpsc::Sender<WatchdogEvent>,
    ) {
        sleep_until(started + self.quiet_period).await;

        let deadline = Instant::now();
        info!(
            budget_secs = self.quiet_period.as_secs(),
            "Soft deadline reached, starting probes"
        );
        if events
            .send(WatchdogEvent::SoftDeadline { at: deadline })
            .await
            .is_err()
        {
            return;
        }

        let mut next = deadline;
        let mut probes = 0u32;
        loop {
            sleep_until(next).await;
            probes += 1;
            match self.probe.check().await {
                ProbeResult::Pass => {
                    debug!(probes, "Probe passed");
                    next += self.cadence;
                }
                ProbeResult::Fail(reason) => {
                    let at = Instant::now();
                    stop.cancel();
                    warn!(probes, reason = %reason, "Probe failed, signalling worker to flush");
                    let _ = events.send(WatchdogEvent::StopSignalled { at, reason }).await;
                    return;
                }
            }
        }
    }
}
