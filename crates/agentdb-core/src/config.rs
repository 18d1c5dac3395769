//! agentdb.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_FILE_NAME: &str = "agent.redb";
pub const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDbConfig {
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Registered engine name. Absent means no store is configured.
    pub backend: Option<String>,
    /// Directory holding the store file. Created on open.
    pub path: PathBuf,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

fn default_file_name() -> String {
    DEFAULT_FILE_NAME.to_string()
}

fn default_open_timeout_secs() -> u64 {
    DEFAULT_OPEN_TIMEOUT_SECS
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no database backend configured")]
    NoBackend,

    #[error("database path is empty")]
    EmptyPath,

    #[error("database file name is empty")]
    EmptyFileName,
}

impl DatabaseConfig {
    pub fn new(backend: &str, path: impl Into<PathBuf>) -> Self {
        DatabaseConfig {
            backend: Some(backend.to_string()),
            path: path.into(),
            file_name: default_file_name(),
            open_timeout_secs: default_open_timeout_secs(),
        }
    }

    /// The configured backend name, if the store is configured at all.
    pub fn backend_name(&self) -> Result<&str, ConfigError> {
        match self.backend.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(ConfigError::NoBackend),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend_name()?;
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath);
        }
        if self.file_name.is_empty() {
            return Err(ConfigError::EmptyFileName);
        }
        Ok(())
    }

    pub fn db_file(&self) -> PathBuf {
        self.path.join(&self.file_name)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

impl AgentDbConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: AgentDbConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a config pointing the default engine at `dir`.
    pub fn scaffold(dir: &Path) -> Self {
        AgentDbConfig {
            database: DatabaseConfig::new("redb", dir),
        }
    }
}
