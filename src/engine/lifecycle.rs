//! Whole-database lifecycle operations.
//!
//! Each operation claims its scenario(s) by moving them to `busy`, does the
//! physical work, and then either completes the transition or compensates so
//! nothing is left claimed.

use std::path::Path;
use std::sync::Arc;

use rusqlite::params;

use crate::db::migrations::LEDGER_TABLE;
use crate::db::models::{new_storage_name, validate_scenario_name, Scenario, ScenarioStatus};
use crate::db::remove_database_files;
use crate::db::repos::{access, scenarios as scenario_repo};
use crate::engine::pool::PoolManager;
use crate::error::AppError;

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub description: Option<String>,
    /// Granted access to the destination once the copy completes.
    pub user: Option<String>,
    /// Allow overwriting a destination that is `in_use`.
    pub force: bool,
}

pub struct ScenarioManager {
    pools: Arc<PoolManager>,
}

impl ScenarioManager {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }

    pub fn create(&self, name: &str, description: Option<&str>) -> Result<Scenario, AppError> {
        scenario_repo::create(self.pools.control(), name, description)
    }

    pub fn update_description(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Scenario, AppError> {
        scenario_repo::update_description(self.pools.control(), name, description)
    }

    /// Duplicate `source` (schema and data) into `dest`.
    ///
    /// The data is written to fresh storage and only swapped into `dest` once
    /// complete. On failure the new file is removed and `dest` returns to its
    /// prior status, or disappears if this copy registered it.
    pub fn copy(&self, source: &str, dest: &str, opts: &CopyOptions) -> Result<Scenario, AppError> {
        validate_scenario_name(dest)?;
        if source == dest {
            return Err(AppError::Validation(format!(
                "Cannot copy scenario {source} onto itself"
            )));
        }

        let control = self.pools.control();
        let src = scenario_repo::get(control, source)?;
        if !src.is_production && src.status != ScenarioStatus::InUse {
            return Err(AppError::Validation(format!(
                "Source scenario {source} is {} and cannot be copied",
                src.status
            )));
        }

        let description = opts.description.as_deref();
        let prior = match scenario_repo::find(control, dest)? {
            Some(existing) if existing.is_production => {
                return Err(AppError::Protected(format!(
                    "Cannot copy over the production scenario {dest}"
                )));
            }
            Some(_) => {
                let allowed: &[ScenarioStatus] = if opts.force {
                    &[ScenarioStatus::Free, ScenarioStatus::InUse]
                } else {
                    &[ScenarioStatus::Free]
                };
                Some(scenario_repo::claim(control, dest, allowed)?.status)
            }
            None => {
                scenario_repo::create_busy(control, dest, description)?;
                None
            }
        };

        tracing::info!(source = %source, scenario = %dest, force = opts.force, "Copying scenario");

        let storage = new_storage_name(dest);
        let target = self.pools.config().storage_path(&storage);
        // Repointing dest is an alias swap: no resolve may cache the old storage
        let committed = self.copy_data(source, &target).and_then(|()| {
            self.pools.with_swap_gate(&[dest], || {
                scenario_repo::complete_copy(control, dest, &storage, description)
            })
        });

        let old_storage = match committed {
            Ok(old) => old,
            Err(e) => {
                tracing::error!(
                    source = %source,
                    scenario = %dest,
                    error = %e,
                    "Copy failed, rolling back"
                );
                self.rollback_copy(dest, &target, prior);
                return Err(e);
            }
        };

        let old_path = self.pools.config().storage_path(&old_storage);
        if let Err(e) = remove_database_files(&old_path) {
            tracing::warn!(
                scenario = %dest,
                path = %old_path.display(),
                error = %e,
                "Could not remove replaced storage"
            );
        }

        // The copy is committed; a failed grant does not undo it
        if let Some(user) = opts.user.as_deref() {
            if let Err(e) = access::grant(control, user, dest) {
                tracing::warn!(
                    user = %user,
                    scenario = %dest,
                    error = %e,
                    "Copy done but access grant failed"
                );
            }
        }

        tracing::info!(source = %source, scenario = %dest, storage = %storage, "Scenario copied");
        scenario_repo::get(control, dest)
    }

    fn copy_data(&self, source: &str, target: &Path) -> Result<(), AppError> {
        let target_str = target.to_str().ok_or_else(|| {
            AppError::Validation(format!("Storage path {} is not valid UTF-8", target.display()))
        })?;
        let handle = self.pools.resolve(source)?;
        let conn = handle.get()?;
        conn.execute("VACUUM INTO ?1", params![target_str])?;
        Ok(())
    }

    fn rollback_copy(&self, dest: &str, target: &Path, prior: Option<ScenarioStatus>) {
        if let Err(e) = remove_database_files(target) {
            tracing::error!(
                scenario = %dest,
                path = %target.display(),
                error = %e,
                "Could not remove partial copy"
            );
        }
        let restored = match prior {
            Some(status) => {
                scenario_repo::set_status(self.pools.control(), dest, status).map(|_| ())
            }
            None => scenario_repo::remove_claimed(self.pools.control(), dest).map(|_| ()),
        };
        if let Err(e) = restored {
            tracing::error!(
                scenario = %dest,
                error = %e,
                "Copy rollback incomplete, scenario left busy"
            );
        }
    }

    /// Recycle an `in_use` scenario: delete every row of every table while
    /// keeping the schema and its migration history, then return it to `free`.
    pub fn release(&self, name: &str) -> Result<Scenario, AppError> {
        let control = self.pools.control();
        let scenario = scenario_repo::get(control, name)?;
        if scenario.is_production {
            return Err(AppError::Protected(format!(
                "Scenario {name} is the production scenario and cannot be released"
            )));
        }
        scenario_repo::claim(control, name, &[ScenarioStatus::InUse])?;

        if let Err(e) = self.reset_data(name) {
            tracing::error!(scenario = %name, error = %e, "Release failed");
            if let Err(restore) = scenario_repo::set_status(control, name, ScenarioStatus::InUse) {
                tracing::error!(
                    scenario = %name,
                    error = %restore,
                    "Could not restore scenario after failed release"
                );
            }
            return Err(e);
        }

        let revoke_access = self.pools.config().release_revokes_access;
        let (released, revoked) = scenario_repo::complete_release(control, name, revoke_access)
            .map_err(|e| {
                // Data is already reset; leave it busy for operator recovery
                tracing::error!(
                    scenario = %name,
                    error = %e,
                    "Release incomplete, scenario left busy"
                );
                e
            })?;
        tracing::info!(scenario = %name, revoked, "Scenario released");
        Ok(released)
    }

    fn reset_data(&self, name: &str) -> Result<(), AppError> {
        let handle = self.pools.resolve(name)?;
        let mut conn = handle.get()?;
        let tx = conn.transaction()?;
        // Child and parent tables are emptied in arbitrary order
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;

        let tables: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name != ?1 AND name NOT LIKE 'sqlite_%'",
            )?;
            let rows = stmt.query_map(params![LEDGER_TABLE], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for table in &tables {
            tx.execute(&format!("DELETE FROM \"{}\"", table.replace('"', "\"\"")), [])?;
        }
        tx.commit()?;
        tracing::debug!(scenario = %name, tables = tables.len(), "Scenario data reset");
        Ok(())
    }

    /// Make `name` the production database. The former production storage
    /// stays reachable under `name`.
    ///
    /// The alias swap runs with the pool manager's swap gate held, so every
    /// concurrent `resolve` sees either the old or the new mapping.
    pub fn promote(&self, name: &str) -> Result<(), AppError> {
        let control = self.pools.control();
        let production = self.pools.config().production_name.as_str();
        if name == production {
            return Err(AppError::Validation(format!(
                "Scenario {name} is already the production scenario"
            )));
        }

        scenario_repo::claim(control, name, &[ScenarioStatus::InUse])?;
        if let Err(e) = scenario_repo::claim(control, production, &[ScenarioStatus::InUse]) {
            self.restore_in_use(&[name]);
            return Err(e);
        }

        tracing::info!(scenario = %name, production = %production, "Promoting scenario");
        let swapped = self.pools.with_swap_gate(&[name, production], || {
            scenario_repo::swap_storage(control, name, production)
        });
        if let Err(e) = swapped {
            tracing::error!(scenario = %name, error = %e, "Promote failed");
            self.restore_in_use(&[name, production]);
            return Err(e);
        }

        tracing::info!(scenario = %name, production = %production, "Scenario promoted");
        Ok(())
    }

    fn restore_in_use(&self, names: &[&str]) {
        for name in names {
            if let Err(e) =
                scenario_repo::set_status(self.pools.control(), name, ScenarioStatus::InUse)
            {
                tracing::error!(
                    scenario = %name,
                    error = %e,
                    "Could not restore scenario to in_use"
                );
            }
        }
    }

    /// Drop a `free` scenario: its database files, its registry row and every
    /// access grant to it.
    pub fn delete(&self, name: &str) -> Result<(), AppError> {
        let control = self.pools.control();
        let scenario = scenario_repo::get(control, name)?;
        if scenario.is_production {
            return Err(AppError::Protected(format!(
                "Scenario {name} is the production scenario and cannot be deleted"
            )));
        }
        if scenario.status != ScenarioStatus::Free {
            return Err(AppError::InUse(format!(
                "Scenario {name} is {} and must be released first",
                scenario.status
            )));
        }
        scenario_repo::claim(control, name, &[ScenarioStatus::Free])?;

        self.pools.invalidate(name)?;
        let path = self.pools.config().storage_path(&scenario.storage);
        if let Err(e) = remove_database_files(&path) {
            tracing::error!(scenario = %name, error = %e, "Could not remove scenario database");
            if let Err(restore) = scenario_repo::set_status(control, name, ScenarioStatus::Free) {
                tracing::error!(
                    scenario = %name,
                    error = %restore,
                    "Could not restore scenario after failed delete"
                );
            }
            return Err(e);
        }

        scenario_repo::remove_claimed(control, name)?;
        tracing::info!(scenario = %name, "Scenario deleted");
        Ok(())
    }

    /// Report `busy` scenarios left behind by a crashed operation. Each one
    /// is logged at error level so it reaches the alerting pipeline.
    pub fn check_orphans(&self) -> Result<Vec<Scenario>, AppError> {
        let timeout = self.pools.config().orphan_timeout();
        let orphans = scenario_repo::find_orphaned(self.pools.control(), timeout)?;
        for orphan in &orphans {
            tracing::error!(
                scenario = %orphan.name,
                last_modified = %orphan.last_modified,
                "Scenario stuck in busy, operator recovery required"
            );
        }
        Ok(orphans)
    }

    pub fn recover(&self, name: &str, status: ScenarioStatus) -> Result<Scenario, AppError> {
        let recovered = scenario_repo::operator_override(self.pools.control(), name, status)?;
        self.pools.invalidate(name)?;
        Ok(recovered)
    }
}
