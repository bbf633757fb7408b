// ABOUTME: Flat key/value configuration loaded from a JSON or YAML file, with JOBSERVER_* environment overrides.
// ABOUTME: ServerConfig is the typed view handed to the store and job manager at construction time.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

/// Prefix for environment variables that override file values.
pub const ENV_PREFIX: &str = "JOBSERVER_";

/// Well-known configuration keys.
pub mod keys {
    pub const CONFIG_PATH: &str = "config_path";
    pub const DATABASE_PATH: &str = "database_path";
    pub const CREATE_DATABASE: &str = "create_database";
    pub const MAX_WORKERS: &str = "max_workers";
    pub const ARCHIVE_INTERVAL_SECS: &str = "archive_interval_secs";
}

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_ARCHIVE_INTERVAL_SECS: usize = 60;

/// Errors that can occur while loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error("invalid value for config key {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Format::Yaml,
            _ => Format::Json,
        }
    }
}

/// A flat key/value configuration backed by a file.
#[derive(Debug, Clone)]
pub struct ConfigClient {
    path: Option<PathBuf>,
    values: Map<String, Value>,
}

impl ConfigClient {
    /// Load configuration from `path`. When the file is missing and
    /// `create_if_missing` is set, an empty file is written first.
    pub fn load(path: &Path, create_if_missing: bool) -> Result<Self, ConfigError> {
        if !path.exists() {
            if !create_if_missing {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            let mut client = Self {
                path: Some(path.to_path_buf()),
                values: Map::new(),
            };
            client
                .values
                .insert(keys::CONFIG_PATH.to_string(), Value::from(path.to_string_lossy()));
            client.save()?;
            tracing::info!("created config file {}", path.display());
            return Ok(client);
        }

        let text = fs::read_to_string(path)?;
        let values: Map<String, Value> = if text.trim().is_empty() {
            Map::new()
        } else {
            match Format::for_path(path) {
                Format::Json => serde_json::from_str(&text)?,
                Format::Yaml => serde_yaml::from_str(&text)?,
            }
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            values,
        })
    }

    /// An in-memory configuration that is never written to disk.
    pub fn from_values(values: Map<String, Value>) -> Self {
        Self { path: None, values }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Like [`get`](Self::get), but a missing key is an error.
    pub fn require(&self, key: &str) -> Result<&Value, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    /// Set a value and persist the file, if there is one.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<(), ConfigError> {
        self.values.insert(key.to_string(), value.into());
        self.save()
    }

    /// Overlay `JOBSERVER_<KEY>` environment variables onto the loaded values.
    /// Values that parse as JSON scalars keep their type; anything else is a
    /// string. Overrides are not written back to the file.
    pub fn apply_env_overrides(&mut self) -> usize {
        let mut applied = 0;
        for (name, raw) in std::env::vars() {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            let value = match serde_json::from_str::<Value>(&raw) {
                Ok(v) if !v.is_object() && !v.is_array() => v,
                _ => Value::String(raw),
            };
            tracing::debug!("config override from {}", name);
            self.values.insert(key.to_ascii_lowercase(), value);
            applied += 1;
        }
        applied
    }

    /// Write the values to the backing file atomically (temp file, fsync, rename).
    fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let text = match Format::for_path(path) {
            Format::Json => serde_json::to_string_pretty(&self.values)?,
            Format::Yaml => serde_yaml::to_string(&self.values)?,
        };

        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Typed configuration for the store and the job manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub database_path: PathBuf,
    pub create_database: bool,
    pub max_workers: usize,
    /// Seconds between sweeps of finished jobs into the archive; 0 disables.
    pub archive_interval_secs: u64,
}

impl ServerConfig {
    /// Extract the server settings. `database_path` is required; the rest
    /// fall back to defaults.
    pub fn from_client(client: &ConfigClient) -> Result<Self, ConfigError> {
        let database_path = match client.require(keys::DATABASE_PATH)? {
            Value::String(s) if !s.is_empty() => PathBuf::from(s),
            other => {
                return Err(ConfigError::InvalidValue {
                    key: keys::DATABASE_PATH.to_string(),
                    reason: format!("expected a non-empty path, got {other}"),
                });
            }
        };

        let create_database = match client.get(keys::CREATE_DATABASE) {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1" | "yes"),
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: keys::CREATE_DATABASE.to_string(),
                    reason: format!("expected a boolean, got {other}"),
                });
            }
        };

        let max_workers = match client.get(keys::MAX_WORKERS) {
            None => DEFAULT_MAX_WORKERS,
            Some(value) => parse_count(keys::MAX_WORKERS, value)?,
        };

        let archive_interval_secs = match client.get(keys::ARCHIVE_INTERVAL_SECS) {
            None => DEFAULT_ARCHIVE_INTERVAL_SECS,
            Some(value) => parse_count(keys::ARCHIVE_INTERVAL_SECS, value)?,
        } as u64;

        Ok(Self {
            database_path,
            create_database,
            max_workers,
            archive_interval_secs,
        })
    }
}

fn parse_count(key: &str, value: &Value) -> Result<usize, ConfigError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .map(|n| n as usize)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a non-negative integer, got {value}"),
        })
}
