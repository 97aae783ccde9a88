//! Engine settings layered from defaults, an optional YAML file and `ASR_*` variables.

use std::path::{Path, PathBuf};

use asr_core::SuggestionStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::DEFAULT_CHECK_CONCURRENCY;

/// Opportunity types whose remediation only touches the authoring
/// environment; for them `DEPLOYED` is terminal.
pub const DEFAULT_AUTHOR_ONLY_TYPES: [&str; 2] = ["security-permissions-redundant", "security-permissions"];

/// Batch-create errors logged one by one before the rest are summarized.
pub const MAX_LOGGED_ERRORS: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value `{value}` for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub author_only_types: Vec<String>,
    pub check_concurrency: usize,
    pub outdated_status: SuggestionStatus,
    pub max_logged_errors: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            author_only_types: DEFAULT_AUTHOR_ONLY_TYPES.iter().map(|t| t.to_string()).collect(),
            check_concurrency: DEFAULT_CHECK_CONCURRENCY,
            outdated_status: SuggestionStatus::Outdated,
            max_logged_errors: MAX_LOGGED_ERRORS,
        }
    }
}

impl ReconcileConfig {
    /// Defaults, overlaid by the YAML file at `ASR_CONFIG_PATH` (if set),
    /// overlaid by individual `ASR_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("ASR_CONFIG_PATH") {
            Some(path) if !path.trim().is_empty() => Self::from_yaml_file(path.trim())?,
            _ => Self::default(),
        };

        if let Some(raw) = lookup("ASR_AUTHOR_ONLY_TYPES") {
            config.author_only_types = raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = lookup("ASR_CHECK_CONCURRENCY") {
            config.check_concurrency = match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                Ok(_) => {
                    return Err(ConfigError::InvalidValue {
                        var: "ASR_CHECK_CONCURRENCY",
                        value: raw,
                        reason: "must be at least 1".into(),
                    })
                }
                Err(err) => {
                    return Err(ConfigError::InvalidValue {
                        var: "ASR_CHECK_CONCURRENCY",
                        value: raw,
                        reason: err.to_string(),
                    })
                }
            };
        }
        if let Some(raw) = lookup("ASR_OUTDATED_STATUS") {
            config.outdated_status =
                raw.parse::<SuggestionStatus>()
                    .map_err(|err| ConfigError::InvalidValue {
                        var: "ASR_OUTDATED_STATUS",
                        value: raw.clone(),
                        reason: err.to_string(),
                    })?;
        }
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_yaml(&text, &path.display().to_string())
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse_yaml(text, "inline config")
    }

    fn parse_yaml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })?;
        if config.check_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                var: "check_concurrency",
                value: config.check_concurrency.to_string(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(config)
    }

    pub fn is_author_only(&self, opportunity_type: &str) -> bool {
        self.author_only_types.iter().any(|t| t == opportunity_type)
    }
}
