//! Configuration resolution for the metrics relay agent.
//!
//! Implements deterministic config resolution order:
//! 1. Explicit CLI flag (--config)
//! 2. Environment variable (MR_CONFIG)
//! 3. XDG config (~/.config/metrics_relay/agent.toml) if it exists
//! 4. Built-in defaults

use std::env;
use std::fs;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use super::{AgentConfig, ConfigResolution, ConfigSource};
use crate::error::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "MR_CONFIG";

const CONFIG_DIR_NAME: &str = "metrics_relay";
const CONFIG_FILE_NAME: &str = "agent.toml";

/// Configuration file paths supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// Explicit path to agent.toml
    pub config_path: Option<PathBuf>,
}

/// Configuration resolver with deterministic resolution order.
#[derive(Debug)]
pub struct ConfigResolver {
    cli_paths: ConfigPaths,
}

impl ConfigResolver {
    pub fn new(paths: ConfigPaths) -> Self {
        ConfigResolver { cli_paths: paths }
    }

    /// Create a resolver with no CLI overrides.
    pub fn with_defaults() -> Self {
        ConfigResolver {
            cli_paths: ConfigPaths::default(),
        }
    }

    /// Resolve the config directory used for the XDG lookup.
    pub fn resolve_config_dir(&self) -> Option<PathBuf> {
        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join(CONFIG_DIR_NAME));
        }
        dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME))
    }

    /// Resolve the agent.toml path.
    pub fn resolve_config_path(&self) -> (Option<PathBuf>, ConfigResolution) {
        // 1. CLI flag
        if let Some(ref path) = self.cli_paths.config_path {
            return (Some(path.clone()), ConfigResolution::CliFlag);
        }

        // 2. MR_CONFIG env var
        if let Ok(path) = env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return (Some(PathBuf::from(path)), ConfigResolution::EnvVar);
            }
        }

        // 3. XDG config dir
        if let Some(config_dir) = self.resolve_config_dir() {
            let path = config_dir.join(CONFIG_FILE_NAME);
            if path.exists() {
                return (Some(path), ConfigResolution::XdgConfig);
            }
        }

        // 4. Default
        (None, ConfigResolution::Default)
    }

    /// Load and validate the agent configuration.
    pub fn load(&self) -> Result<(AgentConfig, ConfigSource)> {
        let (path, resolution) = self.resolve_config_path();

        match path {
            Some(p) => {
                let content = fs::read_to_string(&p).map_err(|e| {
                    Error::Config(format!("failed to read config from {}: {}", p.display(), e))
                })?;
                let hash = compute_sha256(&content);
                let config = AgentConfig::from_toml_str(&content, &p.display().to_string())?;
                config.validate()?;

                Ok((
                    config,
                    ConfigSource {
                        path: Some(p.to_string_lossy().to_string()),
                        hash: Some(hash),
                        resolution,
                    },
                ))
            }
            None => Ok((
                AgentConfig::default(),
                ConfigSource {
                    path: None,
                    hash: None,
                    resolution: ConfigResolution::Default,
                },
            )),
        }
    }
}

/// Compute SHA-256 hash of a string.
fn compute_sha256(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
