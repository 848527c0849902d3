pub mod lifecycle;
pub mod migrate;
pub mod pool;
pub mod router;
pub mod schema;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::dialect::{self, SqlDialect};
use crate::db::{init_control_db, DbPool};
use crate::error::AppError;

use lifecycle::ScenarioManager;
use migrate::MigrationOrchestrator;
use pool::PoolManager;
use router::RequestRouter;

/// Everything a process needs, wired from one configuration.
pub struct Engine {
    pub pools: Arc<PoolManager>,
    pub router: RequestRouter,
    pub lifecycle: ScenarioManager,
    pub migrations: MigrationOrchestrator,
    pub dialect: Arc<dyn SqlDialect>,
}

impl Engine {
    /// Validate the configuration, open and bootstrap the control database.
    pub fn open(config: AppConfig) -> Result<Self, AppError> {
        config.validate()?;
        let control = init_control_db(&config)?;
        Self::with_control(config, control)
    }

    pub fn with_control(config: AppConfig, control: DbPool) -> Result<Self, AppError> {
        let dialect = dialect::select(&config.dialect)?;
        let pools = Arc::new(PoolManager::new(Arc::new(config), control));
        Ok(Self {
            router: RequestRouter::new(pools.clone()),
            lifecycle: ScenarioManager::new(pools.clone()),
            migrations: MigrationOrchestrator::new(pools.clone()),
            dialect,
            pools,
        })
    }

    pub fn config(&self) -> &AppConfig {
        self.pools.config()
    }

    pub fn control(&self) -> &DbPool {
        self.pools.control()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ScenarioStatus;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_open_migrates_planning_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::with_data_dir(dir.path());
        config.initial_scenarios = vec!["scenario1".into()];
        let engine = Engine::open(config).unwrap();

        let steps = schema::planning_steps(engine.dialect.as_ref()).unwrap();
        let outcomes = engine
            .migrations
            .run_all(&steps, ScenarioStatus::InUse, &CancellationToken::new())
            .unwrap();
        // scenario1 is free and not a target
        assert_eq!(outcomes.len(), 1);
        assert!(migrate::all_succeeded(&outcomes));
        assert_eq!(outcomes[0].applied_count, steps.len());

        let again = engine
            .migrations
            .run_all(&steps, ScenarioStatus::InUse, &CancellationToken::new())
            .unwrap();
        assert_eq!(again[0].applied_count, 0);
    }

    #[test]
    fn test_open_rejects_unknown_dialect() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::with_data_dir(dir.path());
        config.dialect = "oracle".into();
        assert!(Engine::open(config).is_err());
    }
}
