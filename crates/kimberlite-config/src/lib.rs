//! Configuration management for Kimberlite audit logging
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (KMB_* prefix, `__` between section and key)
//! 2. kimberlite-audit.local.toml (gitignored, local overrides)
//! 3. kimberlite-audit.toml (git-tracked, project config)
//! 4. ~/.config/kimberlite/audit.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! The configuration is read once at startup. It selects the data-subject
//! search strategy and the lookup query synthesis mode; neither can change
//! while requests are in flight.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main audit logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub personal_data: PersonalDataConfig,
}

/// Toggles for the personal-data audit engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalDataConfig {
    /// How the data subject of an entity type is searched for.
    pub subject_search: SubjectSearchMode,
    /// How row key values are embedded into lookup queries.
    pub query_synthesis: QuerySynthesisMode,
}

/// Data-subject search strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubjectSearchMode {
    /// Search up and down completely, keep the shallowest join path.
    #[default]
    Exhaustive,
    /// Stop at the first data subject found, upward search first.
    Greedy,
}

/// Lookup query synthesis mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuerySynthesisMode {
    /// Key values are embedded as literals.
    #[default]
    Literal,
    /// Key values are `$N` placeholders bound at execution time.
    Placeholder,
}

impl Display for SubjectSearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhaustive => write!(f, "exhaustive"),
            Self::Greedy => write!(f, "greedy"),
        }
    }
}

impl FromStr for SubjectSearchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exhaustive" => Ok(Self::Exhaustive),
            "greedy" | "legacy" => Ok(Self::Greedy),
            other => Err(ConfigError::ValidationError(format!(
                "unknown subject search mode: {other}"
            ))),
        }
    }
}

impl Display for QuerySynthesisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal => write!(f, "literal"),
            Self::Placeholder => write!(f, "placeholder"),
        }
    }
}

impl FromStr for QuerySynthesisMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "literal" => Ok(Self::Literal),
            "placeholder" | "placeholders" => Ok(Self::Placeholder),
            other => Err(ConfigError::ValidationError(format!(
                "unknown query synthesis mode: {other}"
            ))),
        }
    }
}

impl AuditConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }
}

impl PersonalDataConfig {
    /// Reads the toggles from `KMB_*` environment variables only, ignoring
    /// config files.
    pub fn from_env() -> Result<Self> {
        Ok(ConfigLoader::new().load_env_only()?.personal_data)
    }
}
