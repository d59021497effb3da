//! Command-line interface built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (run, validate, schema)
//! and the global `--config` and `--verbose` flags.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Deadline-bounded execution envelope for one-shot adviser jobs.
#[derive(Debug, Parser)]
#[command(name = "adviser-envelope", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the envelope configuration file (default: ./envelope.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Submission parameters. The process environment is read first; `--param`
/// values take precedence.
#[derive(Debug, Clone, Args)]
pub struct SubmissionArgs {
    /// Set a job parameter, e.g. `--param COUNT=5`. Repeatable.
    #[arg(long = "param", short = 'p', value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    /// Ignore the process environment and use only `--param` values.
    #[arg(long, default_value_t = false)]
    pub no_env: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a submission, supervise the worker and print the job report.
    Run {
        #[command(flatten)]
        submission: SubmissionArgs,

        /// Use the built-in seeded sampler instead of an external command.
        #[arg(long, default_value_t = false, conflicts_with = "worker")]
        builtin: bool,

        /// Seconds between the stop signal and the forced kill.
        #[arg(long, value_name = "SECONDS")]
        grace_window: Option<u64>,

        /// Compute budget in seconds; overrides TIMEOUT_SECONDS.
        #[arg(long, value_name = "SECONDS")]
        timeout_seconds: Option<u64>,

        /// Worker command, given after `--`. Overrides `worker_command`.
        #[arg(last = true, value_name = "COMMAND")]
        worker: Vec<String>,
    },

    /// Resolve the parameters and print the frozen configuration as JSON.
    Validate {
        #[command(flatten)]
        submission: SubmissionArgs,
    },

    /// Print the parameter table.
    Schema,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_with_worker_command() {
        let cli = Cli::parse_from([
            "adviser-envelope",
            "run",
            "--param",
            "COUNT=5",
            "-p",
            "METADATA={\"a\":1}",
            "--grace-window",
            "30",
            "--",
            "adviser",
            "--json",
        ]);
        match cli.command {
            Command::Run {
                submission,
                builtin,
                grace_window,
                timeout_seconds,
                worker,
            } => {
                assert_eq!(
                    submission.params,
                    vec![
                        ("COUNT".to_string(), "5".to_string()),
                        ("METADATA".to_string(), "{\"a\":1}".to_string()),
                    ]
                );
                assert!(!submission.no_env);
                assert!(!builtin);
                assert_eq!(grace_window, Some(30));
                assert!(timeout_seconds.is_none());
                assert_eq!(worker, vec!["adviser", "--json"]);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "adviser-envelope",
            "--config",
            "/etc/envelope.toml",
            "--verbose",
            "schema",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/envelope.toml")));
        assert!(matches!(cli.command, Command::Schema));
    }

    #[test]
    fn cli_parses_validate_subcommand() {
        let cli = Cli::parse_from(["adviser-envelope", "validate", "--no-env", "-p", "JOB_ID=a"]);
        match cli.command {
            Command::Validate { submission } => {
                assert!(submission.no_env);
                assert_eq!(submission.params.len(), 1);
            }
            _ => panic!("expected Validate command"),
        }
    }

    #[test]
    fn builtin_conflicts_with_worker_command() {
        let result = Cli::try_parse_from(["adviser-envelope", "run", "--builtin", "--", "adviser"]);
        assert!(result.is_err());
    }

    #[test]
    fn param_requires_key_and_equals() {
        assert!(parse_key_value("COUNT").is_err());
        assert!(parse_key_value("=5").is_err());
        assert_eq!(
            parse_key_value("OUTPUT=a=b").unwrap(),
            ("OUTPUT".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_key_value("DEV=").unwrap(),
            ("DEV".to_string(), String::new())
        );
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
