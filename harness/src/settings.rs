//! Settings file loading for the harness CLI.
//!
//! Settings are read from a TOML file with a single `[collection]` table whose
//! keys mirror [`CollectionConfig`]. Missing keys fall back to the defaults,
//! and command-line flags override whatever the file provides.

use collection::{CollectionConfig, CollectionError, SourceError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub collection: CollectionConfig,
}

impl SettingsFile {
    pub fn from_toml(contents: &str) -> HarnessResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| HarnessError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }
}

/// Command-line values that take precedence over the settings file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub page_size: Option<usize>,
}

pub fn resolve_config(
    settings: Option<&Path>,
    overrides: Overrides,
) -> HarnessResult<CollectionConfig> {
    let mut config = match settings {
        Some(path) => SettingsFile::load(path)?.collection,
        None => CollectionConfig::default(),
    };

    if let Some(base_url) = overrides.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(secs) = overrides.timeout_secs {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    if let Some(page_size) = overrides.page_size {
        config = config.with_page_size(page_size);
    }

    config
        .validate()
        .map_err(|message| HarnessError::InvalidConfig { message })?;
    Ok(config)
}
