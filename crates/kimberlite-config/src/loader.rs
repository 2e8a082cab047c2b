//! Configuration loader with multi-source merging

use crate::{AuditConfig, Paths};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    env_source: Option<config::Map<String, String>>,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "KMB".to_string(),
            env_source: None,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Read environment variables from `vars` instead of the process
    /// environment.
    pub fn with_env_source(mut self, vars: config::Map<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<AuditConfig> {
        let defaults = AuditConfig::default();
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults)?);

        // User defaults, then project, then local overrides.
        let files = Paths::new()
            .user_config_file()
            .ok()
            .into_iter()
            .chain([
                Paths::project_config_file(&self.project_dir),
                Paths::local_config_file(&self.project_dir),
            ]);
        for file in files.filter(|f| f.exists()) {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        let config = builder
            .add_source(self.environment())
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Load built-in defaults overridden by environment variables only
    pub fn load_env_only(self) -> Result<AuditConfig> {
        let defaults = AuditConfig::default();
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(self.environment())
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    // KMB_PERSONAL_DATA__SUBJECT_SEARCH -> personal_data.subject_search
    fn environment(&self) -> config::Environment {
        config::Environment::with_prefix(&self.env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(self.env_source.clone())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
