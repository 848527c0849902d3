use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::models::validate_scenario_name;
use crate::error::AppError;

/// Environment override for [`AppConfig::data_dir`].
pub const ENV_DATA_DIR: &str = "SCENARIODB_DATA_DIR";
/// Environment override for [`AppConfig::production_name`].
pub const ENV_PRODUCTION: &str = "SCENARIODB_PRODUCTION";

/// Bootstrap configuration passed into every component at construction.
///
/// Only connection parameters live here. The set of scenarios is data and is
/// owned by the registry in the control database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the control database and every scenario database file.
    pub data_dir: PathBuf,
    /// Control database file name, relative to `data_dir` unless absolute.
    pub control_db: PathBuf,
    /// Reserved production scenario. Always exists, never deletable.
    pub production_name: String,
    pub pool_max_size: u32,
    /// Upper bound for acquiring a connection; expiry is reported as `Unreachable`.
    pub connect_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    /// `busy` scenarios older than this are reported as orphaned.
    pub orphan_timeout_secs: u64,
    pub dialect: String,
    pub release_revokes_access: bool,
    /// Scenario names inserted as `free` on bootstrap when absent.
    pub initial_scenarios: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            control_db: PathBuf::from("control.sqlite3"),
            production_name: "default".into(),
            pool_max_size: 4,
            connect_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            orphan_timeout_secs: 3_600,
            dialect: "sqlite".into(),
            release_revokes_access: true,
            initial_scenarios: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file, falling back to defaults when the file is absent,
    /// then apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let parsed: AppConfig = toml::from_str(&raw)?;
            tracing::debug!(path = %path.display(), "Loaded configuration file");
            parsed
        } else {
            tracing::debug!(path = %path.display(), "No configuration file, using defaults");
            AppConfig::default()
        };

        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var(ENV_PRODUCTION) {
            config.production_name = name;
        }

        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `data_dir` with all other values defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.production_name.trim().is_empty() {
            return Err(AppError::Config("production_name cannot be empty".into()));
        }
        if self.pool_max_size == 0 {
            return Err(AppError::Config("pool_max_size must be >= 1".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(AppError::Config("connect_timeout_ms must be >= 1".into()));
        }
        // Names become file stems under data_dir
        for name in std::iter::once(&self.production_name).chain(&self.initial_scenarios) {
            validate_scenario_name(name)
                .map_err(|e| AppError::Config(format!("Invalid scenario name '{name}': {e}")))?;
        }
        crate::db::dialect::select(&self.dialect)?;
        Ok(())
    }

    pub fn control_db_path(&self) -> PathBuf {
        if self.control_db.is_absolute() {
            self.control_db.clone()
        } else {
            self.data_dir.join(&self.control_db)
        }
    }

    /// Physical path of a scenario database file for a storage stem.
    pub fn storage_path(&self, storage: &str) -> PathBuf {
        self.data_dir.join(format!("{storage}.sqlite3"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_timeout_secs)
    }
}
