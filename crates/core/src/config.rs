use crate::command::PASSWORD_ENV;
use crate::output::DEFAULT_MAX_LINES;
use crate::{DeckError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeckConfig {
    #[serde(default)]
    pub restic: ResticConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub mounts: MountConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    /// Overrides the default catalog location.
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResticConfig {
    pub binary: Option<PathBuf>,
    /// Non-secret environment for every restic run, e.g. `RESTIC_CACHE_DIR`.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    pub max_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MountConfig {
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    pub max_depth: usize,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            restic: ResticConfig::default(),
            output: OutputConfig::default(),
            mounts: MountConfig::default(),
            scan: ScanConfig::default(),
            catalog_path: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_MAX_LINES,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 5,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { max_depth: 3 }
    }
}

impl DeckConfig {
    /// Load config from the default location, writing defaults if there is none yet
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            debug!("Loading config from {}", config_path.display());
            let content = fs::read_to_string(config_path).map_err(|e| {
                DeckError::InvalidConfiguration(format!("Failed to read config file: {}", e))
            })?;

            let config: Self = serde_yaml::from_str(&content).map_err(|e| {
                DeckError::InvalidConfiguration(format!("Failed to parse config file: {}", e))
            })?;
            config.validate()?;
            Ok(config)
        } else {
            debug!("Config file not found, creating default");
            let config = Self::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DeckError::InvalidConfiguration(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = serde_yaml::to_string(self)?;
        fs::write(config_path, content).map_err(|e| {
            DeckError::InvalidConfiguration(format!("Failed to write config file: {}", e))
        })?;

        debug!("Config saved to {}", config_path.display());
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.yaml"))
    }

    /// Application directory holding the config and the catalog
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            DeckError::InvalidConfiguration("Could not determine config directory".to_string())
        })?;
        Ok(config_dir.join("resticdeck"))
    }

    pub fn catalog_path(&self) -> Result<PathBuf> {
        match self.catalog_path {
            Some(ref path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("repositories.yaml")),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.mounts.refresh_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.output.max_lines == 0 {
            return Err(DeckError::InvalidConfiguration(
                "output.max_lines must be greater than 0".to_string(),
            ));
        }

        if self.mounts.refresh_interval_secs == 0 {
            return Err(DeckError::InvalidConfiguration(
                "mounts.refresh_interval_secs must be greater than 0".to_string(),
            ));
        }

        // passwords belong in the secret store, never in a plain file
        let secret_keys = [PASSWORD_ENV, "RESTIC_PASSWORD_COMMAND"];
        if self.restic.extra_env.keys().any(|k| secret_keys.contains(&k.as_str())) {
            return Err(DeckError::InvalidConfiguration(format!(
                "{} must not be set in restic.extra_env",
                PASSWORD_ENV
            )));
        }

        if self.scan.max_depth > 10 {
            warn!("Deep repository scans configured: max_depth {}", self.scan.max_depth);
        }

        Ok(())
    }
}
