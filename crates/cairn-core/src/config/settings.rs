//! Engine settings: where state lives and which background work runs

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding the settings directory
pub const CONFIG_DIR_ENV: &str = "CAIRN_CONFIG_DIR";

/// One-time initialization settings for the routing manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Path of the JSON routing configuration
    pub config_path: PathBuf,
    /// Path of the SQLite metrics database
    pub database_path: PathBuf,
    /// Path of the local socket served by `cairn serve`
    pub socket_path: PathBuf,
    pub background: BackgroundSettings,
    pub server: ServerSettings,
}

/// Switches and intervals of the optional background tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSettings {
    /// Probe backends periodically (needs a probe collaborator)
    pub collect_metrics: bool,
    pub collection_interval_secs: u64,
    /// Prune rows older than the retention window periodically
    pub prune_metrics: bool,
    pub prune_interval_secs: u64,
    /// Capacity of the metrics write queue
    pub metrics_queue_capacity: usize,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            collect_metrics: false,
            collection_interval_secs: 60,
            prune_metrics: true,
            prune_interval_secs: 3600,
            metrics_queue_capacity: 4096,
        }
    }
}

impl BackgroundSettings {
    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs.max(1))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

/// Connection handling of the cross-process server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Close connections that send nothing for this long
    pub idle_timeout_secs: u64,
    /// Deadline for finishing a partially received frame or a write
    pub io_timeout_secs: u64,
    /// Maximum concurrently served connections
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            io_timeout_secs: 5,
            max_connections: 256,
        }
    }
}

impl ServerSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        let dir = Self::settings_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::in_dir(&dir)
    }
}

impl EngineSettings {
    /// Settings with every state file placed inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            config_path: dir.join("routing.json"),
            database_path: dir.join("metrics.db"),
            socket_path: dir.join("cairn.sock"),
            background: BackgroundSettings::default(),
            server: ServerSettings::default(),
        }
    }

    /// Directory holding settings and state
    pub fn settings_dir() -> Result<PathBuf> {
        if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(custom_dir));
        }
        dirs::config_dir()
            .map(|dir| dir.join("cairn"))
            .ok_or_else(|| Error::Settings("Could not determine config directory".to_string()))
    }

    /// Default location of the settings file
    pub fn settings_path() -> Result<PathBuf> {
        Ok(Self::settings_dir()?.join("cairn.toml"))
    }

    /// Load settings from a TOML file; missing keys take defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Settings(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let settings: EngineSettings = toml::from_str(&contents).map_err(|e| {
            Error::Settings(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(settings)
    }

    /// Load from `path` if given, else from the default location if present
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Self::settings_path()?;
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Settings(e.to_string()))
    }
}
