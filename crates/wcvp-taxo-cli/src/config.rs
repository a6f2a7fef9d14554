//! Optional YAML run configuration. Command-line flags override every key.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wcvp_taxo_core::{
    DuplicatePolicy, OutputDetail, OutputMode, SimilarityStrategy, DEFAULT_STRIP_CHARS,
};

pub const DEFAULT_KEWMATCH_URL: &str = "http://namematch.science.kew.org/api/v2/powo/csv";
pub const DEFAULT_KEWMATCH_TIMEOUT_SECS: u64 = 30;
const MAX_KEWMATCH_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Settings for the remote name-matching service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KewMatchConfig {
    #[serde(default = "default_kewmatch_url")]
    pub url: String,
    #[serde(default = "default_kewmatch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for KewMatchConfig {
    fn default() -> Self {
        Self { url: default_kewmatch_url(), timeout_secs: default_kewmatch_timeout_secs() }
    }
}

fn default_kewmatch_url() -> String {
    DEFAULT_KEWMATCH_URL.to_string()
}

fn default_kewmatch_timeout_secs() -> u64 {
    DEFAULT_KEWMATCH_TIMEOUT_SECS
}

/// Contents of a `--config` file. Absent keys fall back to flags, then defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub resolve_genus_only: Option<bool>,
    pub similarity_strategy: Option<SimilarityStrategy>,
    pub duplicate_policy: Option<DuplicatePolicy>,
    pub output_mode: Option<OutputMode>,
    pub output_detail: Option<OutputDetail>,
    pub strip_chars: Option<String>,
    pub cache_path: Option<PathBuf>,
    #[serde(default)]
    pub kewmatch: KewMatchConfig,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&content)
    }

    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document is a valid config with every key unset.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: FileConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(strip_chars) = &self.strip_chars {
            if strip_chars.chars().any(char::is_alphanumeric) {
                return Err(ConfigError::Validation(format!(
                    "strip_chars must not contain letters or digits: {strip_chars:?}"
                )));
            }
        }

        if let Some(cache_path) = &self.cache_path {
            if cache_path.as_os_str().is_empty() {
                return Err(ConfigError::Validation("cache_path cannot be empty".into()));
            }
        }

        let url = self.kewmatch.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "kewmatch.url must be an http(s) URL: {url}"
            )));
        }

        if self.kewmatch.timeout_secs == 0
            || self.kewmatch.timeout_secs > MAX_KEWMATCH_TIMEOUT_SECS
        {
            return Err(ConfigError::Validation(format!(
                "kewmatch.timeout_secs must be between 1 and {MAX_KEWMATCH_TIMEOUT_SECS}"
            )));
        }

        Ok(())
    }

    pub fn strip_chars(&self) -> &str {
        self.strip_chars.as_deref().unwrap_or(DEFAULT_STRIP_CHARS)
    }
}
