//! DripWriter configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::pacing::PacingConfig;
use crate::scheduler::SweepConfig;
use crate::worker::WorkerConfig;

/// Main DripWriter configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pacing planner knobs
    pub pacing: PacingConfig,

    /// Tick worker timing
    pub worker: WorkerConfig,

    /// Daemon sweep settings
    pub sweep: SweepConfig,

    /// Session database
    pub storage: StorageConfig,

    /// Local document directory
    pub documents: DocumentsConfig,

    /// Local token provider
    pub auth: AuthConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        self.pacing.validate()?;
        self.worker.validate()?;
        self.sweep.validate()?;
        if self.storage.db_path.trim().is_empty() {
            return Err(eyre::eyre!("storage.db-path must not be empty"));
        }
        if self.documents.dir.trim().is_empty() {
            return Err(eyre::eyre!("documents.dir must not be empty"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .dripwriter.yml
        let local_config = PathBuf::from(".dripwriter.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/dripwriter/dripwriter.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("dripwriter").join("dripwriter.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

fn data_dir() -> PathBuf {
    // XDG data directory (~/.local/share/dripwriter on Linux)
    dirs::data_dir()
        .map(|d| d.join("dripwriter"))
        .unwrap_or_else(|| PathBuf::from(".dripwriter"))
}

/// Session database location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(rename = "db-path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: data_dir().join("sessions.db").to_string_lossy().into_owned(),
        }
    }
}

/// Where the file appender writes documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentsConfig {
    pub dir: String,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            dir: data_dir().join("documents").to_string_lossy().into_owned(),
        }
    }
}

/// Local token provider settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Owners whose credentials are treated as revoked
    #[serde(rename = "revoked-owners")]
    pub revoked_owners: Vec<String>,
}
