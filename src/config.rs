//! Envelope configuration loaded from `envelope.toml`.
//!
//! [`EnvelopeConfig`] holds everything about *how* a job is supervised: the
//! grace window, probe cadence, resource ceilings and the worker command.
//! What the job computes comes from the submission parameters instead.
//! Values missing from the file use sensible defaults, and a few environment
//! variables take precedence over the file.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::governor::ResourceCeilings;

const DEFAULT_PATH: &str = "envelope.toml";

pub const MEMORY_LIMIT_ENV: &str = "ENVELOPE_MEMORY_LIMIT";
pub const CPU_LIMIT_ENV: &str = "ENVELOPE_CPU_LIMIT";
pub const KNOWLEDGE_BASE_URL_ENV: &str = "KNOWLEDGE_BASE_URL";

/// Cluster-provided service locations, injected into the controller and
/// exported to external workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoints {
    /// Knowledge base the adviser reads from.
    #[serde(default)]
    pub knowledge_base_url: Option<String>,

    /// Additional variables passed through to the worker verbatim.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ServiceEndpoints {
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(url) = &self.knowledge_base_url {
            env.push((KNOWLEDGE_BASE_URL_ENV.to_string(), url.clone()));
        }
        env
    }
}

/// Top-level configuration loaded from `envelope.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeConfig {
    /// Seconds between the stop signal and the forced kill.
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: u64,

    /// Seconds between probes once the soft deadline is reached.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Status command run as the probe. Empty selects the budget probe.
    #[serde(default)]
    pub probe_command: Vec<String>,

    /// Milliseconds a status command may run before it counts as failed.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Memory ceiling, e.g. `8Gi`.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    /// CPU ceiling, e.g. `1` or `500m`.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,

    /// How often an external worker's usage is sampled, in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Command that runs the adviser.
    #[serde(default)]
    pub worker_command: Vec<String>,

    /// Milliseconds the built-in sampler pauses per scored state.
    #[serde(default)]
    pub builtin_step_delay_ms: u64,

    #[serde(default)]
    pub endpoints: ServiceEndpoints,
}

// Reference grace window: 600 seconds.
fn default_grace_window_secs() -> u64 {
    600
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_memory_limit() -> String {
    "8Gi".to_string()
}

fn default_cpu_limit() -> String {
    "1".to_string()
}

fn default_sample_interval_ms() -> u64 {
    1000
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            grace_window_secs: default_grace_window_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_command: Vec::new(),
            probe_timeout_ms: default_probe_timeout_ms(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            sample_interval_ms: default_sample_interval_ms(),
            worker_command: Vec::new(),
            builtin_step_delay_ms: 0,
            endpoints: ServiceEndpoints::default(),
        }
    }
}

impl EnvelopeConfig {
    /// Load configuration from `path`, or from `envelope.toml` in the current
    /// directory. Defaults are used when the default file does not exist; an
    /// explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_PATH).exists() => Self::from_file(Path::new(DEFAULT_PATH))?,
            None => Self::default(),
        };

        // Environment takes precedence over the file.
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str::<EnvelopeConfig>(&contents)?)
    }

    /// Apply overrides from a variable lookup. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(memory) = get(MEMORY_LIMIT_ENV) {
            self.memory_limit = memory;
        }
        if let Some(cpu) = get(CPU_LIMIT_ENV) {
            self.cpu_limit = cpu;
        }
        if let Some(url) = get(KNOWLEDGE_BASE_URL_ENV) {
            self.endpoints.knowledge_base_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.grace_window_secs == 0 {
            bail!("grace_window_secs must be greater than zero");
        }
        if self.probe_interval_secs == 0 {
            bail!("probe_interval_secs must be greater than zero");
        }
        if self.sample_interval_ms == 0 {
            bail!("sample_interval_ms must be greater than zero");
        }
        self.ceilings()?;
        Ok(())
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn builtin_step_delay(&self) -> Duration {
        Duration::from_millis(self.builtin_step_delay_ms)
    }

    pub fn ceilings(&self) -> Result<ResourceCeilings, ConfigError> {
        ResourceCeilings::from_quantities(&self.memory_limit, &self.cpu_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = EnvelopeConfig::default();
        assert_eq!(config.grace_window(), Duration::from_secs(600));
        assert_eq!(config.probe_interval(), Duration::from_secs(10));
        assert_eq!(config.memory_limit, "8Gi");
        assert_eq!(config.cpu_limit, "1");
        assert!(config.probe_command.is_empty());
        assert!(config.worker_command.is_empty());
        assert!(config.builtin_step_delay().is_zero());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            grace_window_secs = 120
            memory_limit = "4Gi"
            worker_command = ["adviser-search", "--json"]

            [endpoints]
            knowledge_base_url = "postgresql://kb:5432/knowledge"
        "#;
        let config: EnvelopeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.grace_window_secs, 120);
        assert_eq!(config.memory_limit, "4Gi");
        assert_eq!(config.cpu_limit, "1");
        assert_eq!(config.probe_interval_secs, 10);
        assert_eq!(config.worker_command, vec!["adviser-search", "--json"]);
        assert_eq!(
            config.endpoints.knowledge_base_url.as_deref(),
            Some("postgresql://kb:5432/knowledge")
        );
        assert_eq!(config.ceilings().unwrap().memory_bytes, 4 << 30);
    }

    #[test]
    fn builtin_step_delay_from_toml() {
        let config: EnvelopeConfig = toml::from_str("builtin_step_delay_ms = 250\n").unwrap();
        assert_eq!(config.builtin_step_delay(), Duration::from_millis(250));
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = EnvelopeConfig::default();
        config.apply_overrides(|key| match key {
            MEMORY_LIMIT_ENV => Some("2Gi".to_string()),
            CPU_LIMIT_ENV => Some(String::new()),
            KNOWLEDGE_BASE_URL_ENV => Some("http://kb".to_string()),
            _ => None,
        });
        assert_eq!(config.memory_limit, "2Gi");
        assert_eq!(config.cpu_limit, "1");
        assert_eq!(
            config.endpoints.knowledge_base_url.as_deref(),
            Some("http://kb")
        );
    }

    #[test]
    fn zero_intervals_are_invalid() {
        let config = EnvelopeConfig {
            probe_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EnvelopeConfig {
            grace_window_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_quantity_is_invalid() {
        let config = EnvelopeConfig {
            memory_limit: "lots".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envelope.toml");
        std::fs::write(&path, "probe_interval_secs = 3\n").unwrap();

        let config = EnvelopeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.probe_interval(), Duration::from_secs(3));
    }

    #[test]
    fn load_rejects_missing_explicit_file() {
        assert!(EnvelopeConfig::load(Some(Path::new("/nonexistent/envelope.toml"))).is_err());
    }

    #[test]
    fn endpoints_export_env() {
        let mut endpoints = ServiceEndpoints {
            knowledge_base_url: Some("http://kb".into()),
            ..Default::default()
        };
        endpoints.extra.insert("DEPLOYMENT_NAME".into(), "stage".into());
        let env = endpoints.to_env();
        assert!(env.contains(&(KNOWLEDGE_BASE_URL_ENV.to_string(), "http://kb".to_string())));
        assert!(env.contains(&("DEPLOYMENT_NAME".to_string(), "stage".to_string())));
    }
}
