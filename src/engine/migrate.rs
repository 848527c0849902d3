//! Migration orchestrator.
//!
//! Applies an ordered [`StepSet`] to every targeted scenario database, one
//! scenario at a time. A failure on one scenario (unreachable database or a
//! broken step) is recorded in that scenario's outcome and the run moves on;
//! only the caller decides whether the run as a whole failed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use rusqlite::{params, Connection};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::db::migrations::LEDGER_TABLE;
use crate::db::models::ScenarioStatus;
use crate::db::repos::scenarios as scenario_repo;
use crate::engine::pool::PoolManager;
use crate::error::AppError;

// =============================================================================
// Steps
// =============================================================================

/// Identifies a step: `(component, sequence_number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StepId {
    pub component: String,
    pub sequence: u32,
}

impl StepId {
    pub fn new(component: impl Into<String>, sequence: u32) -> Self {
        Self {
            component: component.into(),
            sequence,
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:04}", self.component, self.sequence)
    }
}

pub type StepFn = Arc<dyn Fn(&Connection) -> Result<(), AppError> + Send + Sync>;

#[derive(Clone)]
pub enum StepAction {
    Sql(String),
    Code(StepFn),
}

#[derive(Clone)]
pub struct MigrationStep {
    pub id: StepId,
    pub name: String,
    /// Run inside a transaction together with the ledger insert.
    pub atomic: bool,
    pub action: StepAction,
}

impl MigrationStep {
    pub fn sql(component: &str, sequence: u32, name: &str, sql: impl Into<String>) -> Self {
        Self {
            id: StepId::new(component, sequence),
            name: name.to_string(),
            atomic: true,
            action: StepAction::Sql(sql.into()),
        }
    }

    pub fn code(
        component: &str,
        sequence: u32,
        name: &str,
        f: impl Fn(&Connection) -> Result<(), AppError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: StepId::new(component, sequence),
            name: name.to_string(),
            atomic: true,
            action: StepAction::Code(Arc::new(f)),
        }
    }

    /// For statements SQLite refuses inside a transaction (e.g. `VACUUM`).
    pub fn non_atomic(mut self) -> Self {
        self.atomic = false;
        self
    }

    fn run(&self, conn: &Connection) -> Result<(), AppError> {
        match &self.action {
            StepAction::Sql(sql) => conn.execute_batch(sql).map_err(AppError::from),
            StepAction::Code(f) => f(conn),
        }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("atomic", &self.atomic)
            .finish()
    }
}

/// Ordered set of steps. Within a component, sequence numbers strictly
/// increase in set order.
#[derive(Debug, Clone, Default)]
pub struct StepSet {
    steps: Vec<MigrationStep>,
}

impl StepSet {
    pub fn new(steps: Vec<MigrationStep>) -> Result<Self, AppError> {
        let mut last: HashMap<&str, u32> = HashMap::new();
        for step in &steps {
            if step.id.component.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "Step '{}' has an empty component",
                    step.name
                )));
            }
            if let Some(prev) = last.get(step.id.component.as_str()) {
                if step.id.sequence <= *prev {
                    return Err(AppError::Validation(format!(
                        "Step {} is out of order: component '{}' already reached {}",
                        step.id, step.id.component, prev
                    )));
                }
            }
            last.insert(step.id.component.as_str(), step.id.sequence);
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// =============================================================================
// Ledger
// =============================================================================

pub fn applied_steps(conn: &Connection) -> Result<HashSet<StepId>, AppError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT component, sequence_number FROM {LEDGER_TABLE}"
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok(StepId::new(row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
    })?;
    let applied = rows.collect::<Result<HashSet<_>, _>>()?;
    Ok(applied)
}

fn record_step(conn: &Connection, step: &MigrationStep) -> Result<(), AppError> {
    conn.execute(
        &format!(
            "INSERT INTO {LEDGER_TABLE} (component, sequence_number, name, applied_at)
             VALUES (?1, ?2, ?3, ?4)"
        ),
        params![
            step.id.component,
            step.id.sequence,
            step.name,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Apply one step. Atomic steps commit together with their ledger row or
/// not at all.
fn apply_step(conn: &mut Connection, step: &MigrationStep) -> Result<(), AppError> {
    if step.atomic {
        let tx = conn.transaction()?;
        step.run(&tx)?;
        record_step(&tx, step)?;
        tx.commit()?;
    } else {
        step.run(conn)?;
        record_step(conn, step)?;
    }
    Ok(())
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ScenarioOutcome {
    pub scenario: String,
    pub applied_count: usize,
    pub error: Option<AppError>,
}

impl ScenarioOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Step that failed, if the failure was a step failure.
    pub fn failed_step(&self) -> Option<&StepId> {
        match &self.error {
            Some(AppError::MigrationStepFailed { step, .. }) => Some(step),
            _ => None,
        }
    }
}

impl fmt::Display for ScenarioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "{}: ok ({} applied)", self.scenario, self.applied_count),
            Some(e) => write!(
                f,
                "{}: FAILED ({} applied) [{}] {}",
                self.scenario,
                self.applied_count,
                e.kind(),
                e
            ),
        }
    }
}

/// True when every outcome migrated cleanly.
pub fn all_succeeded(outcomes: &[ScenarioOutcome]) -> bool {
    outcomes.iter().all(ScenarioOutcome::is_success)
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct MigrationOrchestrator {
    pools: Arc<PoolManager>,
}

impl MigrationOrchestrator {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }

    /// Migrate every scenario in `target` status plus the production scenario.
    ///
    /// Targets are snapshotted once at start. Cancellation is honored between
    /// scenarios only; unvisited scenarios are reported as cancelled.
    pub fn run_all(
        &self,
        steps: &StepSet,
        target: ScenarioStatus,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScenarioOutcome>, AppError> {
        let targets = self.snapshot_targets(target)?;
        tracing::info!(
            targets = targets.len(),
            steps = steps.len(),
            status = %target,
            "Starting migration run"
        );
        Ok(self.run_targets(&targets, steps, cancel))
    }

    /// Migrate a single named scenario.
    pub fn run_one(&self, name: &str, steps: &StepSet) -> ScenarioOutcome {
        self.migrate_scenario(name, steps)
    }

    fn snapshot_targets(&self, target: ScenarioStatus) -> Result<Vec<String>, AppError> {
        let production = &self.pools.config().production_name;
        let mut names = vec![production.clone()];
        names.extend(
            scenario_repo::list(self.pools.control(), Some(target))?
                .into_iter()
                .map(|s| s.name)
                .filter(|n| n != production),
        );
        Ok(names)
    }

    fn run_targets(
        &self,
        targets: &[String],
        steps: &StepSet,
        cancel: &CancellationToken,
    ) -> Vec<ScenarioOutcome> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for name in targets {
            if cancel.is_cancelled() {
                tracing::warn!(scenario = %name, "Migration run cancelled before scenario");
                outcomes.push(ScenarioOutcome {
                    scenario: name.clone(),
                    applied_count: 0,
                    error: Some(AppError::Cancelled(format!("Scenario {name} not migrated"))),
                });
                continue;
            }
            outcomes.push(self.migrate_scenario(name, steps));
        }
        outcomes
    }

    fn migrate_scenario(&self, name: &str, steps: &StepSet) -> ScenarioOutcome {
        let mut outcome = ScenarioOutcome {
            scenario: name.to_string(),
            applied_count: 0,
            error: None,
        };

        let handle = match self.pools.resolve(name) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(scenario = %name, error = %e, "Skipping scenario");
                outcome.error = Some(e);
                return outcome;
            }
        };
        let mut conn = match handle.get() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(scenario = %name, error = %e, "Skipping scenario");
                outcome.error = Some(e);
                return outcome;
            }
        };
        let applied = match applied_steps(&conn) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(scenario = %name, error = %e, "Cannot read migration ledger");
                outcome.error = Some(e);
                return outcome;
            }
        };

        for step in steps.steps().iter().filter(|s| !applied.contains(&s.id)) {
            if let Err(cause) = apply_step(&mut conn, step) {
                tracing::error!(
                    scenario = %name,
                    step = %step.id,
                    error = %cause,
                    "Migration step failed, skipping remaining steps"
                );
                outcome.error = Some(AppError::MigrationStepFailed {
                    scenario: name.to_string(),
                    step: step.id.clone(),
                    cause: cause.to_string(),
                });
                return outcome;
            }
            tracing::debug!(
                scenario = %name,
                step = %step.id,
                name = %step.name,
                "Applied migration step"
            );
            outcome.applied_count += 1;
        }

        tracing::info!(scenario = %name, applied = outcome.applied_count, "Scenario migrated");
        outcome
    }
}
