use rusqlite::{params, Row};

use crate::db::models::{AccessGrant, Scenario};
use crate::db::repos::scenarios;
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_grant(row: &Row) -> rusqlite::Result<AccessGrant> {
    Ok(AccessGrant {
        username: row.get("username")?,
        scenario: row.get("scenario")?,
        position: row.get("position")?,
        granted_at: row.get("granted_at")?,
    })
}

fn validate_username(username: &str) -> Result<(), AppError> {
    if username.trim().is_empty() {
        return Err(AppError::Validation("Username cannot be empty".into()));
    }
    Ok(())
}

/// Whether `username` may route to `scenario`. Grants on deleted scenarios
/// cannot exist, see the cascade on `user_scenarios`.
pub fn authorize(pool: &DbPool, username: &str, scenario: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let found: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM user_scenarios us
            JOIN scenarios s ON s.name = us.scenario
            WHERE us.username = ?1 AND us.scenario = ?2
         )",
        params![username, scenario],
        |row| row.get(0),
    )?;
    Ok(found)
}

/// Grant access. Repeated grants are idempotent and keep their position.
pub fn grant(pool: &DbPool, username: &str, scenario: &str) -> Result<AccessGrant, AppError> {
    validate_username(username)?;
    // Verify exists
    scenarios::get(pool, scenario)?;

    let conn = pool.get()?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO user_scenarios (username, scenario, position, granted_at)
         VALUES (?1, ?2,
                 (SELECT COALESCE(MAX(position) + 1, 0) FROM user_scenarios WHERE username = ?1),
                 ?3)",
        params![username, scenario, chrono::Utc::now().to_rfc3339()],
    )?;
    if inserted > 0 {
        tracing::info!(user = %username, scenario = %scenario, "Access granted");
    }
    conn.query_row(
        "SELECT * FROM user_scenarios WHERE username = ?1 AND scenario = ?2",
        params![username, scenario],
        row_to_grant,
    )
    .map_err(AppError::Database)
}

/// Revoke access. Returns true if a grant was removed.
pub fn revoke(pool: &DbPool, username: &str, scenario: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "DELETE FROM user_scenarios WHERE username = ?1 AND scenario = ?2",
        params![username, scenario],
    )?;
    if rows > 0 {
        tracing::info!(user = %username, scenario = %scenario, "Access revoked");
    }
    Ok(rows > 0)
}

/// Scenarios visible to a user, in grant order (primary first), joined with
/// current registry state.
pub fn list_for(pool: &DbPool, username: &str) -> Result<Vec<Scenario>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT s.name FROM user_scenarios us
         JOIN scenarios s ON s.name = us.scenario
         WHERE us.username = ?1
         ORDER BY us.position, s.name",
    )?;
    let names = stmt
        .query_map(params![username], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut visible = Vec::with_capacity(names.len());
    for name in names {
        visible.push(scenarios::get_on(&conn, &name)?);
    }
    Ok(visible)
}

/// The user's primary scenario: the first grant in order.
pub fn primary_for(pool: &DbPool, username: &str) -> Result<Option<String>, AppError> {
    Ok(list_for(pool, username)?.into_iter().next().map(|s| s.name))
}

/// Move an existing grant to the front of the user's list.
pub fn set_primary(pool: &DbPool, username: &str, scenario: &str) -> Result<(), AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE user_scenarios
         SET position = (SELECT MIN(position) - 1 FROM user_scenarios WHERE username = ?1)
         WHERE username = ?1 AND scenario = ?2",
        params![username, scenario],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!(
            "Grant of scenario {scenario} to {username}"
        )));
    }
    Ok(())
}

/// Usernames holding a grant on a scenario.
pub fn users_of(pool: &DbPool, scenario: &str) -> Result<Vec<String>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT username FROM user_scenarios WHERE scenario = ?1 ORDER BY username",
    )?;
    let rows = stmt.query_map(params![scenario], |row| row.get(0))?;
    let users = rows.collect::<Result<Vec<String>, _>>()?;
    Ok(users)
}
