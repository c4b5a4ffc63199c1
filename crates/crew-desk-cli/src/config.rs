use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use crew_desk_domain::{ensure_non_empty, RuntimeBinding};
use crew_desk_store::DEFAULT_MAX_PER_CATEGORY;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "crew-desk.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub history_path: PathBuf,
    pub prompts_path: PathBuf,
    pub read_articles_path: PathBuf,
    pub history_max_per_category: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_path: PathBuf::from("history.json"),
            prompts_path: PathBuf::from("custom_prompts.json"),
            read_articles_path: PathBuf::from("tech_news_history.json"),
            history_max_per_category: DEFAULT_MAX_PER_CATEGORY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub runtime: RuntimeBinding,
    pub storage: StorageConfig,
    pub output_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeBinding::default(),
            storage: StorageConfig::default(),
            output_dir: PathBuf::from("."),
        }
    }
}

impl AppConfig {
    /// Load config from `path`, or from `crew-desk.yaml` when present.
    ///
    /// An explicit path must exist. A missing default file yields defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        if !explicit && !path.exists() {
            tracing::debug!("no config file found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        tracing::debug!(
            path = %path.display(),
            provider = %config.runtime.provider_name,
            "loaded config"
        );
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)
                .map_err(|err| anyhow!("invalid config YAML structure: {err}"))?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure_non_empty("runtime.provider_name", &self.runtime.provider_name)?;
        ensure_non_empty("runtime.model_id", &self.runtime.model_id)?;
        if !(self.runtime.params.is_null() || self.runtime.params.is_object()) {
            return Err(anyhow!("runtime.params MUST be a mapping"));
        }
        if self.storage.history_max_per_category == 0 {
            return Err(anyhow!(
                "storage.history_max_per_category MUST be at least 1"
            ));
        }
        Ok(())
    }
}
