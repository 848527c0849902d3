use rusqlite::Connection;

use crate::error::AppError;

/// Run the control database schema migration.
///
/// The control database holds the scenario registry and the access list.
/// Each scenario database carries its own ledger, see [`LEDGER_SCHEMA`].
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running control database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Control database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Scenario Registry
-- ============================================================================

CREATE TABLE IF NOT EXISTS scenarios (
    name            TEXT PRIMARY KEY,
    status          TEXT NOT NULL
                    CHECK(status IN ('free', 'in_use', 'busy')),
    description     TEXT,
    storage         TEXT NOT NULL UNIQUE,
    last_modified   TEXT NOT NULL,
    last_refresh    TEXT,
    is_production   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_scenarios_status ON scenarios(status);

-- ============================================================================
-- User ↔ Scenario Access
-- ============================================================================

CREATE TABLE IF NOT EXISTS user_scenarios (
    username    TEXT NOT NULL,
    scenario    TEXT NOT NULL REFERENCES scenarios(name) ON DELETE CASCADE,
    position    INTEGER NOT NULL,
    granted_at  TEXT NOT NULL,
    PRIMARY KEY (username, scenario)
);
CREATE INDEX IF NOT EXISTS idx_us_scenario ON user_scenarios(scenario);

"#;

/// Per-scenario migration ledger. Created on first contact with a scenario
/// database and never reset by release.
pub const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    component        TEXT NOT NULL,
    sequence_number  INTEGER NOT NULL,
    name             TEXT NOT NULL,
    applied_at       TEXT NOT NULL,
    PRIMARY KEY (component, sequence_number)
);
"#;

/// Ledger table name, excluded when a release resets scenario data.
pub const LEDGER_TABLE: &str = "schema_migrations";
