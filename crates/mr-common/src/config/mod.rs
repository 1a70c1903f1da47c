//! Agent configuration loading and validation.
//!
//! This module provides:
//! - Typed TOML configuration (`[agent]` defaults and `[[outputs]]` entries)
//! - Deterministic config resolution (CLI > env > XDG > defaults)
//! - Semantic validation
//! - Per-output resolved settings consumed by the agent

pub mod resolve;

pub use resolve::{ConfigPaths, ConfigResolver};

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of metrics per sink write.
pub const DEFAULT_METRIC_BATCH_SIZE: usize = 1000;
/// Default memory buffer capacity per output.
pub const DEFAULT_METRIC_BUFFER_LIMIT: usize = 10_000;
/// Default flush interval in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10_000;

/// Backend used to hold metrics between collection and delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStrategy {
    /// Fixed-capacity ring buffer in process memory.
    #[default]
    Memory,
    /// Write-ahead log on disk.
    Disk,
}

impl fmt::Display for BufferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferStrategy::Memory => write!(f, "memory"),
            BufferStrategy::Disk => write!(f, "disk"),
        }
    }
}

impl FromStr for BufferStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(BufferStrategy::Memory),
            "disk" => Ok(BufferStrategy::Disk),
            other => Err(Error::Validation(format!(
                "unknown buffer strategy {:?}, expected \"memory\" or \"disk\"",
                other
            ))),
        }
    }
}

/// What to do when an output cannot connect at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupErrorBehavior {
    /// Fail agent startup.
    #[default]
    Error,
    /// Start anyway and reconnect before each write.
    Retry,
    /// Remove the output and keep running without it.
    Ignore,
}

impl fmt::Display for StartupErrorBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupErrorBehavior::Error => write!(f, "error"),
            StartupErrorBehavior::Retry => write!(f, "retry"),
            StartupErrorBehavior::Ignore => write!(f, "ignore"),
        }
    }
}

/// Agent-wide defaults (`[agent]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    pub flush_interval_ms: u64,
    pub metric_batch_size: usize,
    pub metric_buffer_limit: usize,
    pub buffer_strategy: BufferStrategy,
    pub buffer_directory: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        AgentSection {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            metric_batch_size: DEFAULT_METRIC_BATCH_SIZE,
            metric_buffer_limit: DEFAULT_METRIC_BUFFER_LIMIT,
            buffer_strategy: BufferStrategy::Memory,
            buffer_directory: None,
        }
    }
}

/// One `[[outputs]]` entry. Unset options inherit from `[agent]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSection {
    /// Sink kind (`stdout`, `file`, `discard`).
    pub name: String,
    pub alias: Option<String>,
    /// Unique output id; names the on-disk buffer file.
    pub id: Option<String>,
    pub metric_batch_size: Option<usize>,
    pub metric_buffer_limit: Option<usize>,
    pub flush_interval_ms: Option<u64>,
    pub buffer_strategy: Option<BufferStrategy>,
    pub buffer_directory: Option<PathBuf>,
    pub namepass: Vec<String>,
    pub namedrop: Vec<String>,
    pub name_override: Option<String>,
    pub name_prefix: Option<String>,
    pub name_suffix: Option<String>,
    pub startup_error_behavior: Option<StartupErrorBehavior>,
    /// Target path for the `file` sink.
    pub path: Option<PathBuf>,
}

/// Complete agent configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub outputs: Vec<OutputSection>,
}

/// Settings for one output after merging agent defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub name: String,
    pub alias: Option<String>,
    pub id: String,
    pub metric_batch_size: usize,
    pub metric_buffer_limit: usize,
    pub flush_interval: Duration,
    pub buffer_strategy: BufferStrategy,
    pub buffer_directory: Option<PathBuf>,
    pub namepass: Vec<String>,
    pub namedrop: Vec<String>,
    pub name_override: Option<String>,
    pub name_prefix: Option<String>,
    pub name_suffix: Option<String>,
    pub startup_error_behavior: StartupErrorBehavior,
    pub path: Option<PathBuf>,
}

impl OutputConfig {
    /// Memory-buffered output with default sizing.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        OutputConfig {
            id: name.clone(),
            name,
            alias: None,
            metric_batch_size: DEFAULT_METRIC_BATCH_SIZE,
            metric_buffer_limit: DEFAULT_METRIC_BUFFER_LIMIT,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            buffer_strategy: BufferStrategy::Memory,
            buffer_directory: None,
            namepass: Vec::new(),
            namedrop: Vec::new(),
            name_override: None,
            name_prefix: None,
            name_suffix: None,
            startup_error_behavior: StartupErrorBehavior::Error,
            path: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.metric_batch_size = size;
        self
    }

    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.metric_buffer_limit = limit;
        self
    }

    pub fn with_disk_buffer(mut self, dir: impl Into<PathBuf>) -> Self {
        self.buffer_strategy = BufferStrategy::Disk;
        self.buffer_directory = Some(dir.into());
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_startup_error_behavior(mut self, behavior: StartupErrorBehavior) -> Self {
        self.startup_error_behavior = behavior;
        self
    }

    /// Display name used in logs and stats labels.
    pub fn log_name(&self) -> String {
        match &self.alias {
            Some(alias) => format!("outputs.{}::{}", self.name, alias),
            None => format!("outputs.{}", self.name),
        }
    }
}

impl AgentConfig {
    /// Parse a TOML document. `origin` is used in error messages.
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            path: origin.to_string(),
            reason: e.to_string(),
        })
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config from {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Merge agent defaults into every output entry.
    pub fn output_configs(&self) -> Vec<OutputConfig> {
        self.outputs
            .iter()
            .map(|o| OutputConfig {
                name: o.name.clone(),
                alias: o.alias.clone(),
                id: o
                    .id
                    .clone()
                    .or_else(|| o.alias.clone())
                    .unwrap_or_else(|| o.name.clone()),
                metric_batch_size: o
                    .metric_batch_size
                    .unwrap_or(self.agent.metric_batch_size),
                metric_buffer_limit: o
                    .metric_buffer_limit
                    .unwrap_or(self.agent.metric_buffer_limit),
                flush_interval: Duration::from_millis(
                    o.flush_interval_ms.unwrap_or(self.agent.flush_interval_ms),
                ),
                buffer_strategy: o.buffer_strategy.unwrap_or(self.agent.buffer_strategy),
                buffer_directory: o
                    .buffer_directory
                    .clone()
                    .or_else(|| self.agent.buffer_directory.clone()),
                namepass: o.namepass.clone(),
                namedrop: o.namedrop.clone(),
                name_override: o.name_override.clone(),
                name_prefix: o.name_prefix.clone(),
                name_suffix: o.name_suffix.clone(),
                startup_error_behavior: o.startup_error_behavior.unwrap_or_default(),
                path: o.path.clone(),
            })
            .collect()
    }

    /// Validate configuration semantically.
    pub fn validate(&self) -> Result<()> {
        if self.agent.flush_interval_ms == 0 {
            return Err(Error::Validation(
                "agent.flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.agent.metric_batch_size == 0 {
            return Err(Error::Validation(
                "agent.metric_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.agent.metric_buffer_limit == 0 {
            return Err(Error::Validation(
                "agent.metric_buffer_limit must be greater than zero".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for output in self.output_configs() {
            let label = output.log_name();
            if output.name.is_empty() {
                return Err(Error::Validation("output entry without a name".to_string()));
            }
            if output.metric_batch_size == 0 {
                return Err(Error::Validation(format!(
                    "{}: metric_batch_size must be greater than zero",
                    label
                )));
            }
            if output.metric_buffer_limit == 0 {
                return Err(Error::Validation(format!(
                    "{}: metric_buffer_limit must be greater than zero",
                    label
                )));
            }
            if output.metric_buffer_limit < output.metric_batch_size {
                return Err(Error::Validation(format!(
                    "{}: metric_buffer_limit ({}) is smaller than metric_batch_size ({})",
                    label, output.metric_buffer_limit, output.metric_batch_size
                )));
            }
            if output.flush_interval.is_zero() {
                return Err(Error::Validation(format!(
                    "{}: flush_interval_ms must be greater than zero",
                    label
                )));
            }
            if output.buffer_strategy == BufferStrategy::Disk && output.buffer_directory.is_none()
            {
                return Err(Error::Validation(format!(
                    "{}: disk buffer strategy requires buffer_directory",
                    label
                )));
            }
            if output.id.is_empty() || output.id.contains(['/', '\\']) || output.id == ".." {
                return Err(Error::Validation(format!(
                    "{}: output id {:?} is not a valid file name",
                    label, output.id
                )));
            }
            if !ids.insert(output.id.clone()) {
                return Err(Error::Validation(format!(
                    "duplicate output id {:?}; set a distinct alias or id",
                    output.id
                )));
            }
        }
        Ok(())
    }
}

/// Where a loaded configuration came from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Path to the config file, or None if using defaults
    pub path: Option<String>,
    /// SHA-256 hash of file contents, or None if defaults
    pub hash: Option<String>,
    /// How this source was resolved
    pub resolution: ConfigResolution,
}

/// How a config file was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigResolution {
    CliFlag,
    EnvVar,
    XdgConfig,
    Default,
}

impl fmt::Display for ConfigResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigResolution::CliFlag => write!(f, "cli"),
            ConfigResolution::EnvVar => write!(f, "env"),
            ConfigResolution::XdgConfig => write!(f, "xdg"),
            ConfigResolution::Default => write!(f, "default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[agent]
flush_interval_ms = 5000
metric_batch_size = 100
metric_buffer_limit = 1000
buffer_directory = "/var/lib/mr"

[[outputs]]
name = "stdout"

[[outputs]]
name = "file"
alias = "archive"
buffer_strategy = "disk"
metric_batch_size = 50
namedrop = ["internal_*"]
path = "/tmp/archive.out"
"#;

    #[test]
    fn outputs_inherit_agent_defaults() {
        let config = AgentConfig::from_toml_str(SAMPLE, "sample").unwrap();
        config.validate().unwrap();
        let outputs = config.output_configs();
        assert_eq!(outputs.len(), 2);

        assert_eq!(outputs[0].id, "stdout");
        assert_eq!(outputs[0].metric_batch_size, 100);
        assert_eq!(outputs[0].buffer_strategy, BufferStrategy::Memory);
        assert_eq!(outputs[0].flush_interval, Duration::from_millis(5000));

        assert_eq!(outputs[1].id, "archive");
        assert_eq!(outputs[1].log_name(), "outputs.file::archive");
        assert_eq!(outputs[1].metric_batch_size, 50);
        assert_eq!(outputs[1].buffer_strategy, BufferStrategy::Disk);
        assert_eq!(
            outputs[1].buffer_directory.as_deref(),
            Some(Path::new("/var/lib/mr"))
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = AgentConfig::from_toml_str("[agent]\nbogus = 1\n", "inline").unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn disk_strategy_needs_directory() {
        let config = AgentConfig {
            agent: AgentSection::default(),
            outputs: vec![OutputSection {
                name: "stdout".into(),
                buffer_strategy: Some(BufferStrategy::Disk),
                ..Default::default()
            }],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("buffer_directory"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let config = AgentConfig {
            agent: AgentSection::default(),
            outputs: vec![
                OutputSection {
                    name: "stdout".into(),
                    ..Default::default()
                },
                OutputSection {
                    name: "stdout".into(),
                    ..Default::default()
                },
            ],
        };
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = AgentConfig::default();
        config.outputs.push(OutputSection {
            name: "discard".into(),
            metric_batch_size: Some(0),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn startup_error_behavior_defaults_to_error() {
        let config = AgentConfig::from_toml_str(
            "[[outputs]]\nname = \"stdout\"\n\n[[outputs]]\nname = \"file\"\nstartup_error_behavior = \"retry\"\n",
            "inline",
        )
        .unwrap();
        let outputs = config.output_configs();
        assert_eq!(outputs[0].startup_error_behavior, StartupErrorBehavior::Error);
        assert_eq!(outputs[1].startup_error_behavior, StartupErrorBehavior::Retry);

        let err = AgentConfig::from_toml_str(
            "[[outputs]]\nname = \"file\"\nstartup_error_behavior = \"foo\"\n",
            "inline",
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("DISK".parse::<BufferStrategy>().unwrap(), BufferStrategy::Disk);
        assert!("tape".parse::<BufferStrategy>().is_err());
    }

    #[test]
    fn toml_serialization_reparses() {
        let config = AgentConfig::from_toml_str(SAMPLE, "sample").unwrap();
        let text = config.to_toml_string().unwrap();
        assert_eq!(AgentConfig::from_toml_str(&text, "rendered").unwrap(), config);
    }
}
