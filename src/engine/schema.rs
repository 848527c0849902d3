//! Built-in planning schema, expressed as migration steps.
//!
//! Components: `common` (parameters), `input` (master data and proposed
//! orders), `output` (plan problems and derived views).

use crate::db::dialect::SqlDialect;
use crate::engine::migrate::{MigrationStep, StepSet};
use crate::error::AppError;

pub fn planning_steps(dialect: &dyn SqlDialect) -> Result<StepSet, AppError> {
    StepSet::new(vec![
        MigrationStep::sql(
            "common",
            1,
            "parameter table",
            "CREATE TABLE common_parameter (
                name          TEXT PRIMARY KEY,
                value         TEXT,
                description   TEXT,
                lastmodified  TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        ),
        MigrationStep::sql(
            "input",
            1,
            "master data",
            "CREATE TABLE location (
                name          TEXT PRIMARY KEY,
                description   TEXT,
                lastmodified  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE item (
                name          TEXT PRIMARY KEY,
                description   TEXT,
                cost          REAL,
                lastmodified  TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        ),
        MigrationStep::sql(
            "input",
            2,
            "operation plans",
            "CREATE TABLE operationplan (
                reference     TEXT PRIMARY KEY,
                type          TEXT NOT NULL CHECK(type IN ('PO', 'MO', 'DO')),
                status        TEXT NOT NULL DEFAULT 'proposed'
                              CHECK(status IN ('proposed', 'approved', 'confirmed', 'completed', 'closed')),
                item_id       TEXT NOT NULL REFERENCES item(name) ON DELETE CASCADE,
                location_id   TEXT NOT NULL REFERENCES location(name) ON DELETE CASCADE,
                quantity      REAL NOT NULL DEFAULT 0,
                startdate     TEXT,
                enddate       TEXT,
                -- provenance marker of the system that proposed the order
                source        TEXT,
                lastmodified  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX idx_operationplan_item   ON operationplan(item_id);
            CREATE INDEX idx_operationplan_status ON operationplan(status);",
        ),
        MigrationStep::sql(
            "output",
            1,
            "plan problems",
            "CREATE TABLE out_problem (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                entity        TEXT NOT NULL,
                name          TEXT NOT NULL,
                owner         TEXT NOT NULL,
                description   TEXT NOT NULL,
                startdate     TEXT NOT NULL,
                enddate       TEXT NOT NULL,
                weight        REAL NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_out_problem_entity ON out_problem(entity);",
        ),
        MigrationStep::sql(
            "input",
            3,
            "operation plan batch",
            "ALTER TABLE operationplan ADD COLUMN batch TEXT;",
        ),
        MigrationStep::sql(
            "output",
            2,
            "plan views",
            format!(
                "CREATE VIEW out_operationplan_duration AS
                 SELECT reference, item_id, location_id,
                        {duration} AS duration_seconds
                 FROM operationplan
                 WHERE startdate IS NOT NULL AND enddate IS NOT NULL;
                 CREATE VIEW out_operationplan_overlap AS
                 SELECT a.reference AS reference, b.reference AS overlaps_with
                 FROM operationplan a
                 JOIN operationplan b
                   ON a.item_id = b.item_id
                  AND a.location_id = b.location_id
                  AND a.reference < b.reference
                 WHERE {overlap};",
                duration = dialect.date_diff("enddate", "startdate"),
                overlap = dialect.overlap("a.startdate", "a.enddate", "b.startdate", "b.enddate"),
            ),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::Sqlite;
    use crate::db::migrations::LEDGER_SCHEMA;
    use crate::engine::migrate::applied_steps;
    use rusqlite::Connection;

    #[test]
    fn test_planning_steps_apply_in_order() {
        let steps = planning_steps(&Sqlite).unwrap();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEDGER_SCHEMA).unwrap();
        for step in steps.steps() {
            match &step.action {
                crate::engine::migrate::StepAction::Sql(sql) => conn.execute_batch(sql).unwrap(),
                crate::engine::migrate::StepAction::Code(f) => f(&conn).unwrap(),
            }
        }
        assert!(applied_steps(&conn).unwrap().is_empty());

        conn.execute_batch(
            "INSERT INTO item (name) VALUES ('widget');
             INSERT INTO location (name) VALUES ('plant');
             INSERT INTO operationplan (reference, type, item_id, location_id, quantity, startdate, enddate, source)
             VALUES ('1', 'MO', 'widget', 'plant', 5, '2024-01-01T00:00:00', '2024-01-03T00:00:00', 'scenariodb'),
                    ('2', 'MO', 'widget', 'plant', 5, '2024-01-02T00:00:00', '2024-01-04T00:00:00', 'scenariodb');",
        )
        .unwrap();

        let duration: f64 = conn
            .query_row(
                "SELECT duration_seconds FROM out_operationplan_duration WHERE reference = '1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!((duration - 172800.0).abs() < 0.01);

        let overlaps: i64 = conn
            .query_row("SELECT COUNT(*) FROM out_operationplan_overlap", [], |row| row.get(0))
            .unwrap();
        assert_eq!(overlaps, 1);
    }
}
