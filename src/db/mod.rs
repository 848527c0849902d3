pub mod dialect;
pub mod migrations;
pub mod models;
pub mod repos;

use std::path::Path;
use std::time::Duration;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::config::AppConfig;
use crate::db::models::ScenarioStatus;
use crate::error::AppError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_millis(self.busy_timeout_ms))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -8000;",
        )?;
        Ok(())
    }
}

/// Build a pool for one SQLite file. Fails if no connection can be
/// established within the configured connect timeout.
pub fn open_pool(path: &Path, config: &AppConfig) -> Result<DbPool, AppError> {
    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder()
        .max_size(config.pool_max_size)
        .min_idle(Some(1))
        .connection_timeout(config.connect_timeout())
        .connection_customizer(Box::new(SqlitePragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(manager)?;

    // Database-wide, only needs to run once per file
    let conn = pool.get()?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    Ok(pool)
}

/// Remove a SQLite database file together with its WAL side files.
pub fn remove_database_files(path: &Path) -> Result<(), AppError> {
    let mut targets = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        targets.push(side.into());
    }
    for target in targets {
        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AppError::Io(e)),
        }
    }
    Ok(())
}

/// Initialize the control database: create the data directory, run the
/// control schema migration and bootstrap the registry.
pub fn init_control_db(config: &AppConfig) -> Result<DbPool, AppError> {
    std::fs::create_dir_all(&config.data_dir)?;
    let path = config.control_db_path();

    tracing::info!(path = %path.display(), "Initializing control database");

    let pool = open_pool(&path, config)?;
    {
        let conn = pool.get()?;
        migrations::run(&conn)?;
    }
    bootstrap(&pool, config)?;

    tracing::info!("Control database initialized successfully");
    Ok(pool)
}

/// Ensure the reserved production scenario and any configured initial
/// scenarios exist. Never removes rows.
fn bootstrap(pool: &DbPool, config: &AppConfig) -> Result<(), AppError> {
    models::validate_scenario_name(&config.production_name)?;
    for name in &config.initial_scenarios {
        models::validate_scenario_name(name)?;
    }

    let conn = pool.get()?;
    let now = chrono::Utc::now().to_rfc3339();

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO scenarios
         (name, status, description, storage, last_modified, is_production)
         VALUES (?1, ?2, 'Production', ?3, ?4, 1)",
        params![
            config.production_name,
            ScenarioStatus::InUse.as_str(),
            models::new_storage_name(&config.production_name),
            now,
        ],
    )?;
    if inserted > 0 {
        tracing::info!(scenario = %config.production_name, "Registered production scenario");
    }

    for name in &config.initial_scenarios {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO scenarios (name, status, description, storage, last_modified)
             VALUES (?1, ?2, NULL, ?3, ?4)",
            params![
                name,
                ScenarioStatus::Free.as_str(),
                models::new_storage_name(name),
                now,
            ],
        )?;
        if inserted > 0 {
            tracing::info!(scenario = %name, "Registered initial scenario");
        }
    }
    Ok(())
}

/// Fresh control database in a private temp directory.
///
/// The returned `TempDir` must outlive the pool.
#[cfg(test)]
pub fn init_test_db() -> Result<(tempfile::TempDir, AppConfig, DbPool), AppError> {
    let dir = tempfile::tempdir()?;
    let mut config = AppConfig::with_data_dir(dir.path());
    config.pool_max_size = 2;
    let pool = init_control_db(&config)?;
    Ok((dir, config, pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repos::scenarios;

    #[test]
    fn test_bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::with_data_dir(dir.path());
        config.initial_scenarios = vec!["scenario1".into(), "scenario2".into()];

        let pool = init_control_db(&config).unwrap();
        let first = scenarios::get(&pool, "default").unwrap();
        drop(pool);

        let pool = init_control_db(&config).unwrap();
        let again = scenarios::get(&pool, "default").unwrap();
        assert_eq!(first.storage, again.storage);
        assert_eq!(again.status, ScenarioStatus::InUse);
        assert_eq!(scenarios::list(&pool, None).unwrap().len(), 3);
        assert_eq!(
            scenarios::get(&pool, "scenario1").unwrap().status,
            ScenarioStatus::Free
        );
    }

    #[test]
    fn test_bootstrap_refuses_unsafe_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::with_data_dir(dir.path());
        config.initial_scenarios = vec!["../escape".into()];
        assert!(matches!(init_control_db(&config), Err(AppError::Validation(_))));

        config.initial_scenarios.clear();
        let pool = init_control_db(&config).unwrap();
        assert!(scenarios::find(&pool, "../escape").unwrap().is_none());
    }

    #[test]
    fn test_remove_database_files_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.sqlite3");
        assert!(remove_database_files(&path).is_ok());

        std::fs::write(&path, b"x").unwrap();
        remove_database_files(&path).unwrap();
        assert!(!path.exists());
    }
}
