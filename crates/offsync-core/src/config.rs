//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/offsync/config.toml)
//! 3. Environment variables (OFFSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::LayerId;

/// Environment variable prefix
const ENV_PREFIX: &str = "OFFSYNC";

/// Extension of the local replica file
pub const STORE_EXTENSION: &str = "geodatabase";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the local replica, session state and logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Remote feature service endpoint
    #[serde(default)]
    pub service_url: Option<String>,

    /// Base name of the local replica file (without extension)
    #[serde(default = "default_store_name")]
    pub store_name: String,

    /// Layers to take offline (empty means every layer in the service)
    #[serde(default)]
    pub layers: Vec<LayerId>,

    /// Reuse a valid replica already on disk instead of downloading again
    #[serde(default = "default_true")]
    pub use_existing: bool,

    /// Timeout for individual requests to the feature service
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Log file path (defaults to {data_dir}/offsync.log)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            service_url: None,
            store_name: default_store_name(),
            layers: Vec::new(),
            use_existing: true,
            request_timeout_secs: default_request_timeout_secs(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load from the default file, then apply `OFFSYNC_*` overrides
    ///
    /// Precedence, highest first: environment (OFFSYNC_DATA_DIR,
    /// OFFSYNC_SERVICE_URL, OFFSYNC_USE_EXISTING), the config file
    /// (OFFSYNC_CONFIG or ~/.config/offsync/config.toml), defaults.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring a path given on the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load from `path`; a missing file yields the defaults
    ///
    /// Creates the data directory so the store and session can be written.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config: Config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .with_context(|| format!("Invalid config file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read config file {}", path.display()))
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Cannot create data directory {}", config.data_dir.display())
        })?;
        Ok(config)
    }

    /// Parse configuration from TOML text, with environment overrides
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(toml_content).context("Invalid config TOML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let var = |name: &str| std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok();

        if let Some(dir) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = var("SERVICE_URL") {
            self.service_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(flag) = var("USE_EXISTING") {
            self.use_existing = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Reject values the sync components cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.store_name.trim().is_empty() {
            bail!("store_name must not be empty");
        }
        if self.store_name.contains(std::path::MAIN_SEPARATOR) || self.store_name.contains('/') {
            bail!("store_name must be a file name, not a path: {}", self.store_name);
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        if let Some(url) = &self.service_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("service_url must be an http(s) URL: {}", url);
            }
        }
        Ok(())
    }

    /// Write to the default config file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path())
    }

    /// Write to `config_path`, creating its directory
    pub fn save_to(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create config directory {}", dir.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Cannot serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Cannot write config file {}", config_path.display()))
    }

    /// Location of the config file (OFFSYNC_CONFIG wins)
    pub fn config_file_path() -> PathBuf {
        match std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            Ok(path) => PathBuf::from(path),
            Err(_) => dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("offsync")
                .join("config.toml"),
        }
    }

    /// Get the path to the local replica
    pub fn store_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", self.store_name, STORE_EXTENSION))
    }

    /// Get the path to the persisted session state
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    /// Get the log file path
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("offsync.log"))
    }

    /// Request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("offsync")
}

fn default_store_name() -> String {
    "replica".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    60
}
