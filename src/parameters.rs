//! Adviser job parameters: the closed schema a submission is resolved against.
//!
//! Submissions arrive as a flat `name → string` mapping (the process
//! environment when launched from the CLI). [`Submission::resolve`] validates
//! that mapping once, applies defaults, and produces an immutable
//! [`AdviserParameters`] that the controller shares with the worker by `Arc`.
//! Empty values are treated as absent, matching how job templates expand
//! unset parameters.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;
use crate::state_machine::JobDescriptor;

pub const JOB_ID: &str = "JOB_ID";
pub const DOCUMENT_ID: &str = "DOCUMENT_ID";
pub const OUTPUT: &str = "OUTPUT";
pub const REQUIREMENTS: &str = "REQUIREMENTS";
pub const REQUIREMENTS_LOCKED: &str = "REQUIREMENTS_LOCKED";
pub const LIBRARY_USAGE: &str = "LIBRARY_USAGE";
pub const REQUIREMENTS_FORMAT: &str = "REQUIREMENTS_FORMAT";
pub const RECOMMENDATION_TYPE: &str = "RECOMMENDATION_TYPE";
pub const RUNTIME_ENVIRONMENT: &str = "RUNTIME_ENVIRONMENT";
pub const SEED: &str = "SEED";
pub const DEV: &str = "DEV";
pub const BEAM_WIDTH: &str = "BEAM_WIDTH";
pub const LIMIT: &str = "LIMIT";
pub const COUNT: &str = "COUNT";
pub const LIMIT_LATEST_VERSIONS: &str = "LIMIT_LATEST_VERSIONS";
pub const TIMEOUT_SECONDS: &str = "TIMEOUT_SECONDS";
pub const METADATA: &str = "METADATA";

const DEFAULT_SEED: i64 = 42;
const DEFAULT_BEAM_WIDTH: u64 = 100_000;
const DEFAULT_LIMIT: u64 = 100_000;
const DEFAULT_COUNT: u64 = 1;
const DEFAULT_LIMIT_LATEST_VERSIONS: u64 = 9_999_999;
const DEFAULT_TIMEOUT_SECONDS: u64 = 1500;

/// Value type of a schema entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    String,
    Uri,
    Enum,
    Integer,
    Boolean,
    Json,
}

impl std::fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParameterKind::String => "string",
            ParameterKind::Uri => "string/URI",
            ParameterKind::Enum => "enum",
            ParameterKind::Integer => "integer",
            ParameterKind::Boolean => "boolean(0/1)",
            ParameterKind::Json => "JSON",
        };
        write!(f, "{name}")
    }
}

/// One row of the parameter schema.
#[derive(Debug, Clone, Copy)]
pub struct ParameterSpec {
    pub key: &'static str,
    pub kind: ParameterKind,
    pub required: bool,
    pub default: Option<&'static str>,
    pub effect: &'static str,
}

const fn spec(
    key: &'static str,
    kind: ParameterKind,
    required: bool,
    default: Option<&'static str>,
    effect: &'static str,
) -> ParameterSpec {
    ParameterSpec {
        key,
        kind,
        required,
        default,
        effect,
    }
}

/// The full parameter schema, in submission order.
pub const SCHEMA: &[ParameterSpec] = &[
    spec(JOB_ID, ParameterKind::String, true, None, "correlates the job with its controller record"),
    spec(DOCUMENT_ID, ParameterKind::String, true, None, "correlates the output artifact with the request"),
    spec(OUTPUT, ParameterKind::Uri, false, None, "where the result artifact is published"),
    spec(REQUIREMENTS, ParameterKind::String, false, None, "unresolved input stack description"),
    spec(REQUIREMENTS_LOCKED, ParameterKind::String, false, None, "fully pinned input stack description"),
    spec(LIBRARY_USAGE, ParameterKind::String, false, None, "hints for search heuristics"),
    spec(REQUIREMENTS_FORMAT, ParameterKind::Enum, false, None, "input format selector"),
    spec(RECOMMENDATION_TYPE, ParameterKind::Enum, false, None, "selects the scoring strategy"),
    spec(RUNTIME_ENVIRONMENT, ParameterKind::String, false, None, "target execution environment descriptor"),
    spec(SEED, ParameterKind::Integer, true, Some("42"), "determinism knob"),
    spec(DEV, ParameterKind::Boolean, true, Some("0"), "include dev-only dependencies"),
    spec(BEAM_WIDTH, ParameterKind::Integer, true, Some("100000"), "bounds in-flight search states"),
    spec(LIMIT, ParameterKind::Integer, false, Some("100000"), "bounds total states scored"),
    spec(COUNT, ParameterKind::Integer, false, Some("1"), "bounds states returned (<= LIMIT)"),
    spec(LIMIT_LATEST_VERSIONS, ParameterKind::Integer, false, Some("9999999"), "bounds the per-package version window (0 = unbounded)"),
    spec(TIMEOUT_SECONDS, ParameterKind::Integer, true, Some("1500"), "soft-deadline offset"),
    spec(METADATA, ParameterKind::Json, false, Some("null"), "opaque pass-through metadata"),
];

/// An enum value whose variants belong to the worker. Only its shape is
/// checked here: a non-empty identifier of at most 64 characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OpaqueEnum(String);

impl OpaqueEnum {
    fn parse(name: &'static str, value: &str) -> Result<Self, ConfigError> {
        let valid = value.len() <= 64
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(ConfigError::Malformed {
                name,
                expected: "enum identifier",
                value: value.to_string(),
            });
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Per-package version window. Zero on input means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionWindow {
    Unbounded,
    Latest(u64),
}

/// Validated, frozen adviser configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdviserParameters {
    output: Option<String>,
    requirements: Option<String>,
    requirements_locked: Option<String>,
    library_usage: Option<String>,
    requirements_format: Option<OpaqueEnum>,
    recommendation_type: Option<OpaqueEnum>,
    runtime_environment: Option<String>,
    seed: i64,
    dev: bool,
    beam_width: u64,
    limit: u64,
    count: u64,
    limit_latest_versions: VersionWindow,
    timeout_seconds: u64,
    metadata: Option<serde_json::Value>,
}

impl AdviserParameters {
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn requirements(&self) -> Option<&str> {
        self.requirements.as_deref()
    }

    pub fn requirements_locked(&self) -> Option<&str> {
        self.requirements_locked.as_deref()
    }

    pub fn library_usage(&self) -> Option<&str> {
        self.library_usage.as_deref()
    }

    pub fn requirements_format(&self) -> Option<&OpaqueEnum> {
        self.requirements_format.as_ref()
    }

    pub fn recommendation_type(&self) -> Option<&OpaqueEnum> {
        self.recommendation_type.as_ref()
    }

    pub fn runtime_environment(&self) -> Option<&str> {
        self.runtime_environment.as_deref()
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn dev(&self) -> bool {
        self.dev
    }

    pub fn beam_width(&self) -> u64 {
        self.beam_width
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn limit_latest_versions(&self) -> VersionWindow {
        self.limit_latest_versions
    }

    /// The soft deadline, measured from worker start.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    /// Resolved values as environment variables for an external worker.
    /// Absent optional fields are omitted.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        let optional = [
            (OUTPUT, self.output.clone()),
            (REQUIREMENTS, self.requirements.clone()),
            (REQUIREMENTS_LOCKED, self.requirements_locked.clone()),
            (LIBRARY_USAGE, self.library_usage.clone()),
            (
                REQUIREMENTS_FORMAT,
                self.requirements_format.as_ref().map(|e| e.0.clone()),
            ),
            (
                RECOMMENDATION_TYPE,
                self.recommendation_type.as_ref().map(|e| e.0.clone()),
            ),
            (RUNTIME_ENVIRONMENT, self.runtime_environment.clone()),
            (
                METADATA,
                self.metadata.as_ref().map(|m| m.to_string()),
            ),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                env.push((key, value));
            }
        }

        env.push((SEED, self.seed.to_string()));
        env.push((DEV, if self.dev { "1" } else { "0" }.to_string()));
        env.push((BEAM_WIDTH, self.beam_width.to_string()));
        env.push((LIMIT, self.limit.to_string()));
        env.push((COUNT, self.count.to_string()));
        let window = match self.limit_latest_versions {
            VersionWindow::Unbounded => 0,
            VersionWindow::Latest(n) => n,
        };
        env.push((LIMIT_LATEST_VERSIONS, window.to_string()));
        env.push((TIMEOUT_SECONDS, self.timeout_seconds.to_string()));
        env
    }
}

/// A resolved submission: job identity plus frozen parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub descriptor: JobDescriptor,
    pub parameters: AdviserParameters,
}

impl Submission {
    /// Resolve a raw submission. Nothing is started if this fails.
    pub fn resolve(raw: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let job_id = identifier(raw, JOB_ID)?;
        let document_id = identifier(raw, DOCUMENT_ID)?;

        let seed = integer(raw, SEED)?.unwrap_or(DEFAULT_SEED);
        let dev = boolean(raw, DEV)?.unwrap_or(false);
        let beam_width = positive(raw, BEAM_WIDTH, DEFAULT_BEAM_WIDTH)?;
        let limit = positive(raw, LIMIT, DEFAULT_LIMIT)?;
        let count = positive(raw, COUNT, DEFAULT_COUNT)?;
        if count > limit {
            return Err(ConfigError::CountExceedsLimit { count, limit });
        }
        let timeout_seconds = positive(raw, TIMEOUT_SECONDS, DEFAULT_TIMEOUT_SECONDS)?;

        let limit_latest_versions = match integer(raw, LIMIT_LATEST_VERSIONS)? {
            None => VersionWindow::Latest(DEFAULT_LIMIT_LATEST_VERSIONS),
            Some(0) => VersionWindow::Unbounded,
            Some(n) if n < 0 => {
                return Err(ConfigError::OutOfRange {
                    name: LIMIT_LATEST_VERSIONS,
                    reason: format!("{n} is negative"),
                });
            }
            Some(n) => VersionWindow::Latest(n as u64),
        };

        let metadata = match lookup(raw, METADATA) {
            None => None,
            Some(text) => match serde_json::from_str::<serde_json::Value>(text) {
                Ok(serde_json::Value::Null) => None,
                Ok(value) => Some(value),
                Err(_) => {
                    return Err(ConfigError::Malformed {
                        name: METADATA,
                        expected: "JSON document",
                        value: text.to_string(),
                    });
                }
            },
        };

        let parameters = AdviserParameters {
            output: text(raw, OUTPUT),
            requirements: text(raw, REQUIREMENTS),
            requirements_locked: text(raw, REQUIREMENTS_LOCKED),
            library_usage: text(raw, LIBRARY_USAGE),
            requirements_format: lookup(raw, REQUIREMENTS_FORMAT)
                .map(|v| OpaqueEnum::parse(REQUIREMENTS_FORMAT, v))
                .transpose()?,
            recommendation_type: lookup(raw, RECOMMENDATION_TYPE)
                .map(|v| OpaqueEnum::parse(RECOMMENDATION_TYPE, v))
                .transpose()?,
            runtime_environment: text(raw, RUNTIME_ENVIRONMENT),
            seed,
            dev,
            beam_width,
            limit,
            count,
            limit_latest_versions,
            timeout_seconds,
            metadata,
        };

        Ok(Self {
            descriptor: JobDescriptor::new(job_id, document_id),
            parameters,
        })
    }
}

fn lookup<'a>(raw: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    raw.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn text(raw: &HashMap<String, String>, key: &str) -> Option<String> {
    lookup(raw, key).map(str::to_string)
}

// Identifiers end up in file names and log fields.
fn identifier(raw: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    let value = lookup(raw, key).ok_or(ConfigError::Missing(key))?;
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !value.starts_with('.');
    if !valid {
        return Err(ConfigError::Malformed {
            name: key,
            expected: "identifier",
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn integer(raw: &HashMap<String, String>, key: &'static str) -> Result<Option<i64>, ConfigError> {
    lookup(raw, key)
        .map(|v| {
            v.parse::<i64>().map_err(|_| ConfigError::Malformed {
                name: key,
                expected: "integer",
                value: v.to_string(),
            })
        })
        .transpose()
}

fn positive(
    raw: &HashMap<String, String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match integer(raw, key)? {
        None => Ok(default),
        Some(n) if n > 0 => Ok(n as u64),
        Some(n) => Err(ConfigError::OutOfRange {
            name: key,
            reason: format!("{n} must be greater than zero"),
        }),
    }
}

fn boolean(raw: &HashMap<String, String>, key: &'static str) -> Result<Option<bool>, ConfigError> {
    lookup(raw, key)
        .map(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            _ => Err(ConfigError::Malformed {
                name: key,
                expected: "boolean (0/1)",
                value: v.to_string(),
            }),
        })
        .transpose()
}
