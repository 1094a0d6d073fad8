//! Connection profiles
//!
//! A JSON file maps profile names to `FileHandlerInfo` records, plus the
//! optional Google OAuth client secrets needed to build Drive settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::handlers::{FileHandlerInfo, GoogleClientSecrets, HandlerFactory};

/// Environment variable overriding the profile file location
pub const CONFIG_ENV_VAR: &str = "FILEHANDLERS_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid profile file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown profile '{0}'")]
    UnknownProfile(String),
}

/// Profile file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerProfiles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google: Option<GoogleClientSecrets>,
    #[serde(default)]
    pub profiles: BTreeMap<String, FileHandlerInfo>,
}

impl HandlerProfiles {
    /// Load profiles; a missing file yields an empty set
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No profile file at {:?}", path);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save profiles, creating the parent directory if needed
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content).map_err(write_err)?;

        tracing::info!("Profiles saved to {:?}", path);
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Result<&FileHandlerInfo, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    /// Factory carrying the Google secrets from this file
    pub fn factory(&self) -> HandlerFactory {
        match self.google.clone() {
            Some(secrets) => HandlerFactory::new().with_google_secrets(secrets),
            None => HandlerFactory::new(),
        }
    }
}

/// Default profile file location
pub fn default_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("filehandlers").join("profiles.json")
}

/// Explicit path, else `FILEHANDLERS_CONFIG`, else the default location
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}
