//! Connection pool manager.
//!
//! Keeps one r2d2 pool per scenario alias, opened lazily on first use. The
//! alias table is guarded by a swap gate: every `resolve` holds it shared,
//! and a promote holds it exclusively while it repoints aliases, so no
//! request can observe a half-swapped alias.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::AppConfig;
use crate::db::migrations::LEDGER_SCHEMA;
use crate::db::models::Scenario;
use crate::db::repos::scenarios as scenario_repo;
use crate::db::{open_pool, DbPool};
use crate::error::AppError;

pub type ScenarioConnection = PooledConnection<SqliteConnectionManager>;

/// A resolved scenario database. Stays bound to the physical storage it was
/// resolved against for its whole lifetime, even if the alias is repointed.
#[derive(Clone)]
pub struct ConnectionHandle {
    scenario: String,
    storage: String,
    pool: Arc<DbPool>,
}

impl ConnectionHandle {
    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn storage(&self) -> &str {
        &self.storage
    }

    /// Check out a connection. Timeout is reported as `Unreachable`.
    pub fn get(&self) -> Result<ScenarioConnection, AppError> {
        self.pool.get().map_err(|e| AppError::Unreachable {
            scenario: self.scenario.clone(),
            cause: e.to_string(),
        })
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("scenario", &self.scenario)
            .field("storage", &self.storage)
            .finish()
    }
}

struct CachedPool {
    storage: String,
    pool: Arc<DbPool>,
}

pub struct PoolManager {
    config: Arc<AppConfig>,
    control: DbPool,
    gate: RwLock<()>,
    pools: Mutex<HashMap<String, CachedPool>>,
    exchanges: Arc<Mutex<HashMap<String, usize>>>,
}

fn lock_err<T>(_: T) -> AppError {
    AppError::Internal("Pool manager lock poisoned".into())
}

impl PoolManager {
    pub fn new(config: Arc<AppConfig>, control: DbPool) -> Self {
        Self {
            config,
            control,
            gate: RwLock::new(()),
            pools: Mutex::new(HashMap::new()),
            exchanges: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn control(&self) -> &DbPool {
        &self.control
    }

    fn pools(&self) -> Result<MutexGuard<'_, HashMap<String, CachedPool>>, AppError> {
        self.pools.lock().map_err(lock_err)
    }

    /// Resolve a scenario alias to its database, opening a pool on first use.
    ///
    /// A failed open is retried once with parameters re-read from the
    /// registry before `Unreachable` is returned.
    pub fn resolve(&self, name: &str) -> Result<ConnectionHandle, AppError> {
        let _gate = self.gate.read().map_err(lock_err)?;

        if let Some(cached) = self.pools()?.get(name) {
            return Ok(ConnectionHandle {
                scenario: name.to_string(),
                storage: cached.storage.clone(),
                pool: cached.pool.clone(),
            });
        }

        let scenario = scenario_repo::get(&self.control, name)?;
        let (storage, pool) = match self.open(&scenario) {
            Ok(pool) => (scenario.storage, pool),
            Err(first) => {
                tracing::warn!(
                    scenario = %name,
                    error = %first,
                    "Connection failed, retrying with fresh parameters"
                );
                let fresh = scenario_repo::get(&self.control, name)?;
                match self.open(&fresh) {
                    Ok(pool) => (fresh.storage, pool),
                    Err(e) => {
                        tracing::error!(
                            scenario = %name,
                            error = %e,
                            "Scenario database unreachable"
                        );
                        return Err(AppError::Unreachable {
                            scenario: name.to_string(),
                            cause: e.to_string(),
                        });
                    }
                }
            }
        };

        let mut pools = self.pools()?;
        // Another resolver may have won the race; keep the first pool
        let cached = pools.entry(name.to_string()).or_insert(CachedPool {
            storage,
            pool: Arc::new(pool),
        });
        tracing::debug!(scenario = %name, storage = %cached.storage, "Scenario pool ready");
        Ok(ConnectionHandle {
            scenario: name.to_string(),
            storage: cached.storage.clone(),
            pool: cached.pool.clone(),
        })
    }

    fn open(&self, scenario: &Scenario) -> Result<DbPool, AppError> {
        let path = self.config.storage_path(&scenario.storage);
        let pool = open_pool(&path, &self.config)?;
        let conn = pool.get()?;
        conn.execute_batch(LEDGER_SCHEMA)?;
        Ok(pool)
    }

    /// Drop the cached pool so the next `resolve` re-establishes it.
    /// Handles already given out keep working against their storage.
    pub fn invalidate(&self, name: &str) -> Result<(), AppError> {
        if self.pools()?.remove(name).is_some() {
            tracing::debug!(scenario = %name, "Scenario pool invalidated");
        }
        Ok(())
    }

    pub fn healthcheck(&self, name: &str) -> bool {
        let check = || -> Result<(), AppError> {
            let handle = self.resolve(name)?;
            let conn = handle.get()?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        };
        match check() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(scenario = %name, error = %e, "Healthcheck failed");
                false
            }
        }
    }

    /// Run `swap` with the swap gate held exclusively, then invalidate the
    /// given aliases before any resolver gets back in.
    ///
    /// Fails with `Conflict` before running `swap` if a data exchange is
    /// active on any of the aliases.
    pub(crate) fn with_swap_gate<T>(
        &self,
        aliases: &[&str],
        swap: impl FnOnce() -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let _gate = self.gate.write().map_err(lock_err)?;
        {
            let exchanges = self.exchanges.lock().map_err(lock_err)?;
            if let Some(busy) = aliases
                .iter()
                .find(|a| exchanges.get(**a).copied().unwrap_or(0) > 0)
            {
                return Err(AppError::Conflict(format!(
                    "Scenario {busy} has a data exchange in progress"
                )));
            }
        }
        let result = swap();
        for alias in aliases {
            self.invalidate(alias)?;
        }
        result
    }

    /// Mark an export/import cycle as active on a scenario. While the guard
    /// lives, the scenario's alias cannot be repointed by a promote.
    pub fn begin_exchange(&self, name: &str) -> Result<ExchangeGuard, AppError> {
        let _gate = self.gate.read().map_err(lock_err)?;
        scenario_repo::get(&self.control, name)?;
        *self
            .exchanges
            .lock()
            .map_err(lock_err)?
            .entry(name.to_string())
            .or_insert(0) += 1;
        tracing::debug!(scenario = %name, "Data exchange started");
        Ok(ExchangeGuard {
            scenario: name.to_string(),
            exchanges: self.exchanges.clone(),
        })
    }

    pub fn active_exchanges(&self, name: &str) -> usize {
        self.exchanges
            .lock()
            .map(|m| m.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

/// Active data exchange on one scenario. Released on drop.
pub struct ExchangeGuard {
    scenario: String,
    exchanges: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if let Ok(mut exchanges) = self.exchanges.lock() {
            if let Some(count) = exchanges.get_mut(&self.scenario) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    exchanges.remove(&self.scenario);
                }
            }
        }
        tracing::debug!(scenario = %self.scenario, "Data exchange finished");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::repos::scenarios;

    pub(crate) fn manager() -> (tempfile::TempDir, Arc<PoolManager>) {
        let (dir, mut config, control) = init_test_db().unwrap();
        config.connect_timeout_ms = 200;
        (dir, Arc::new(PoolManager::new(Arc::new(config), control)))
    }

    /// Point a scenario at storage inside a directory that does not exist.
    pub(crate) fn break_storage(manager: &PoolManager, name: &str) {
        let conn = manager.control().get().unwrap();
        conn.execute(
            "UPDATE scenarios SET storage = 'missing/dir/' || name WHERE name = ?1",
            [name],
        )
        .unwrap();
        drop(conn);
        manager.invalidate(name).unwrap();
    }

    #[test]
    fn test_resolve_is_lazy_and_cached() {
        let (dir, manager) = manager();
        let prod = scenarios::get(manager.control(), "default").unwrap();
        let path = dir.path().join(format!("{}.sqlite3", prod.storage));
        assert!(!path.exists());

        let first = manager.resolve("default").unwrap();
        assert!(path.exists());
        let second = manager.resolve("default").unwrap();
        assert!(Arc::ptr_eq(&first.pool, &second.pool));
        assert_eq!(first.storage(), prod.storage);

        // Ledger created on first contact
        let conn = first.get().unwrap();
        let ledger: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'schema_migrations'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(ledger, 1);
    }

    #[test]
    fn test_resolve_unknown_is_not_found() {
        let (_dir, manager) = manager();
        assert!(matches!(manager.resolve("ghost"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_unreachable_after_retry() {
        let (_dir, manager) = manager();
        scenarios::create(manager.control(), "qa", None).unwrap();
        break_storage(&manager, "qa");

        let err = manager.resolve("qa").unwrap_err();
        assert!(matches!(err, AppError::Unreachable { .. }));
        assert!(!manager.healthcheck("qa"));
        assert!(manager.healthcheck("default"));
    }

    #[test]
    fn test_invalidate_keeps_outstanding_handles() {
        let (_dir, manager) = manager();
        let handle = manager.resolve("default").unwrap();
        manager.invalidate("default").unwrap();

        let fresh = manager.resolve("default").unwrap();
        assert!(!Arc::ptr_eq(&handle.pool, &fresh.pool));
        assert!(handle.get().is_ok());
    }

    #[test]
    fn test_exchange_guard_blocks_swap() {
        let (_dir, manager) = manager();
        let guard = manager.begin_exchange("default").unwrap();
        assert_eq!(manager.active_exchanges("default"), 1);

        let result = manager.with_swap_gate(&["default"], || Ok(()));
        assert!(matches!(result, Err(AppError::Conflict(_))));

        drop(guard);
        assert_eq!(manager.active_exchanges("default"), 0);
        assert!(manager.with_swap_gate(&["default"], || Ok(())).is_ok());

        assert!(manager.begin_exchange("ghost").is_err());
    }
}
