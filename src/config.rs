//! TOML configuration for the manager process.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PgmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive string for the tracing `EnvFilter`.
    pub fn to_filter_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_filter_str())
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Postgres connection URL.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpcConfig {
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
        }
    }
}

fn default_socket() -> PathBuf {
    PathBuf::from("/run/pgroupd/pgroupd.sock")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl ManagerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| PgmError::Config(format!("cannot read {}: {err}", path.display())))?;
        let config: ManagerConfig = toml::from_str(&raw)
            .map_err(|err| PgmError::Config(format!("cannot parse {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(PgmError::Config("database.url must not be empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(PgmError::Config(
                "database.max_connections must be at least 1".into(),
            ));
        }
        if self.ipc.socket.as_os_str().is_empty() {
            return Err(PgmError::Config("ipc.socket must not be empty".into()));
        }
        Ok(())
    }
}
