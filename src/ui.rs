//! Terminal feedback: a spinner that follows the job state and coloured
//! summaries, using `indicatif` and `console`.

use std::fmt::Display;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::governor::ResourceAllocation;
use crate::parameters::ParameterSpec;
use crate::sink::OutputSink;
use crate::state_machine::{JobOutcome, JobReport, JobState};

/// Stream for the outcome line and the job report. A job publishing to
/// stdout owns it, so everything else moves to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStream {
    Stdout,
    Stderr,
}

impl ReportStream {
    pub fn for_sink(sink: &OutputSink) -> Self {
        match sink {
            OutputSink::Stdout => ReportStream::Stderr,
            _ => ReportStream::Stdout,
        }
    }

    fn line(self, text: impl Display) {
        match self {
            ReportStream::Stdout => println!("{text}"),
            ReportStream::Stderr => eprintln!("{text}"),
        }
    }
}

/// Spinner shown while a job is supervised.
///
/// Success is printed in green, partial results and kills in yellow, and
/// failures or rejections in red.
pub struct JobProgress {
    pb: ProgressBar,
    out: ReportStream,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn start(job_id: &str, worker: &str, out: ReportStream) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("{}: {job_id} ({worker})", JobState::Pending));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            out,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow().bold(),
        }
    }

    /// A callback for [`JobController::with_observer`](crate::controller::JobController::with_observer)
    /// that keeps the spinner message on the current state.
    pub fn state_observer(&self, job_id: &str) -> impl Fn(JobState) + Send + Sync + 'static {
        let pb = self.pb.clone();
        let job_id = job_id.to_string();
        move |state| pb.set_message(format!("{state}: {job_id}"))
    }

    pub fn allocation(&self, allocation: &ResourceAllocation) {
        self.pb.println(format!(
            "  memory {} bytes, cpu {}m ({:?})",
            allocation.limits.memory_bytes,
            allocation.limits.cpu_millis,
            allocation.qos_class()
        ));
    }

    /// Stop the spinner and print the outcome.
    pub fn complete(&self, report: &JobReport) {
        self.pb.finish_and_clear();
        match &report.outcome {
            JobOutcome::Completed { partial: false } => {
                self.out.line(format!(
                    "  {} Job {} completed",
                    self.green.apply_to("✓"),
                    report.job_id
                ));
            }
            JobOutcome::Completed { partial: true } => {
                self.out.line(format!(
                    "  {} Job {} completed with partial results after the stop signal",
                    self.yellow.apply_to("✓"),
                    report.job_id
                ));
            }
            JobOutcome::Killed => {
                self.out.line(format!(
                    "  {} Job {} killed after the grace window",
                    self.yellow.apply_to("✗"),
                    report.job_id
                ));
            }
            JobOutcome::Failed(kind) => {
                self.out.line(format!(
                    "  {} Job {} failed: {kind}",
                    self.red.apply_to("✗"),
                    report.job_id
                ));
            }
        }
    }

    pub fn rejected(&self, reason: &str) {
        self.pb.finish_and_clear();
        self.out
            .line(format!("  {} Submission rejected: {reason}", self.red.apply_to("✗")));
    }

    /// Print the job report as pretty JSON under a coloured header.
    pub fn print_report(&self, report: &JobReport) {
        let style = match report.state {
            JobState::Completed => &self.green,
            JobState::Failed => &self.red,
            _ => &self.yellow,
        };
        self.out.line("");
        self.out.line(style.apply_to("─── Job Report ───"));
        self.out
            .line(serde_json::to_string_pretty(report).unwrap_or_default());
    }
}

/// Print the parameter table.
pub fn print_schema(schema: &[ParameterSpec]) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    println!(
        "{}",
        bold.apply_to(format!(
            "{:<24} {:<14} {:<9} {:<10} EFFECT",
            "KEY", "TYPE", "REQUIRED", "DEFAULT"
        ))
    );
    for spec in schema {
        println!(
            "{:<24} {:<14} {:<9} {:<10} {}",
            spec.key,
            spec.kind.to_string(),
            if spec.required { "yes" } else { "no" },
            spec.default.unwrap_or("-"),
            dim.apply_to(spec.effect)
        );
    }
}
