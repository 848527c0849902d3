use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::db::models::{new_storage_name, validate_scenario_name, Scenario, ScenarioStatus};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_scenario(row: &Row) -> rusqlite::Result<Scenario> {
    let status: String = row.get("status")?;
    let status = status.parse::<ScenarioStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Scenario {
        name: row.get("name")?,
        status,
        description: row.get("description")?,
        storage: row.get("storage")?,
        last_modified: row.get("last_modified")?,
        last_refresh: row.get("last_refresh")?,
        is_production: row.get("is_production")?,
    })
}

pub(crate) fn get_on(conn: &Connection, name: &str) -> Result<Scenario, AppError> {
    conn.query_row(
        "SELECT * FROM scenarios WHERE name = ?1",
        params![name],
        row_to_scenario,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Scenario {name}")),
        other => AppError::Database(other),
    })
}

pub fn get(pool: &DbPool, name: &str) -> Result<Scenario, AppError> {
    let conn = pool.get()?;
    get_on(&conn, name)
}

pub fn find(pool: &DbPool, name: &str) -> Result<Option<Scenario>, AppError> {
    let conn = pool.get()?;
    let found = conn
        .query_row(
            "SELECT * FROM scenarios WHERE name = ?1",
            params![name],
            row_to_scenario,
        )
        .optional()?;
    Ok(found)
}

/// List scenarios. The production scenario sorts first, the rest by tag.
pub fn list(pool: &DbPool, status: Option<ScenarioStatus>) -> Result<Vec<Scenario>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM scenarios
         WHERE ?1 IS NULL OR status = ?1
         ORDER BY is_production DESC,
                  COALESCE(NULLIF(TRIM(description), ''), name),
                  name",
    )?;
    let rows = stmt.query_map(params![status.map(|s| s.as_str())], row_to_scenario)?;
    let scenarios = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(scenarios)
}

/// Register a new `free` scenario.
pub fn create(pool: &DbPool, name: &str, description: Option<&str>) -> Result<Scenario, AppError> {
    insert(pool, name, description, ScenarioStatus::Free)
}

/// Register a scenario that starts already claimed by the calling operation.
pub(crate) fn create_busy(
    pool: &DbPool,
    name: &str,
    description: Option<&str>,
) -> Result<Scenario, AppError> {
    insert(pool, name, description, ScenarioStatus::Busy)
}

fn insert(
    pool: &DbPool,
    name: &str,
    description: Option<&str>,
    status: ScenarioStatus,
) -> Result<Scenario, AppError> {
    validate_scenario_name(name)?;
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO scenarios (name, status, description, storage, last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![name, status.as_str(), description, new_storage_name(name), now],
    )?;
    if inserted == 0 {
        return Err(AppError::AlreadyExists(format!("Scenario {name}")));
    }
    tracing::info!(scenario = %name, status = %status, "Scenario registered");
    get_on(&conn, name)
}

/// Move a scenario along one edge of the state machine.
///
/// The check and the write happen in one immediate transaction, so two
/// operations racing to claim the same scenario cannot both see it unclaimed.
/// Claiming a scenario that is already `busy` fails with `Conflict`; any
/// other illegal edge fails with `InvalidTransition`. Status is unchanged on
/// failure.
pub fn set_status(pool: &DbPool, name: &str, to: ScenarioStatus) -> Result<Scenario, AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = get_on(&tx, name)?;
    check_edge(&current, to)?;
    tx.execute(
        "UPDATE scenarios SET status = ?1, last_modified = ?2 WHERE name = ?3",
        params![to.as_str(), chrono::Utc::now().to_rfc3339(), name],
    )?;
    let updated = get_on(&tx, name)?;
    tx.commit()?;
    tracing::debug!(scenario = %name, from = %current.status, to = %to, "Scenario status changed");
    Ok(updated)
}

fn check_edge(current: &Scenario, to: ScenarioStatus) -> Result<(), AppError> {
    if current.status == ScenarioStatus::Busy && to == ScenarioStatus::Busy {
        return Err(AppError::Conflict(format!(
            "Scenario {} is busy with another operation",
            current.name
        )));
    }
    if !current.status.can_transition_to(to) {
        return Err(AppError::InvalidTransition {
            name: current.name.clone(),
            from: current.status.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

/// Claim a scenario for an operation: check-and-set to `busy`, requiring the
/// current status to be one of `allowed`.
pub fn claim(pool: &DbPool, name: &str, allowed: &[ScenarioStatus]) -> Result<Scenario, AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = get_on(&tx, name)?;
    check_edge(&current, ScenarioStatus::Busy)?;
    if !allowed.contains(&current.status) {
        return Err(AppError::InvalidTransition {
            name: name.to_string(),
            from: current.status.to_string(),
            to: ScenarioStatus::Busy.to_string(),
        });
    }
    tx.execute(
        "UPDATE scenarios SET status = 'busy', last_modified = ?1 WHERE name = ?2",
        params![chrono::Utc::now().to_rfc3339(), name],
    )?;
    tx.commit()?;
    tracing::debug!(scenario = %name, from = %current.status, "Scenario claimed");
    Ok(current)
}

pub fn update_description(
    pool: &DbPool,
    name: &str,
    description: Option<&str>,
) -> Result<Scenario, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE scenarios SET description = ?1 WHERE name = ?2",
        params![description, name],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("Scenario {name}")));
    }
    get_on(&conn, name)
}

/// Finish a copy into a claimed scenario: point it at the freshly written
/// storage and mark it `in_use`. Returns the storage it pointed at before.
pub(crate) fn complete_copy(
    pool: &DbPool,
    name: &str,
    storage: &str,
    description: Option<&str>,
) -> Result<String, AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = get_on(&tx, name)?;
    check_edge(&current, ScenarioStatus::InUse)?;
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE scenarios
         SET status = 'in_use', storage = ?1, description = COALESCE(?2, description),
             last_modified = ?3, last_refresh = ?3
         WHERE name = ?4",
        params![storage, description, now, name],
    )?;
    tx.commit()?;
    Ok(current.storage)
}

/// Finish a release: back to `free` with a new refresh timestamp, dropping
/// every access grant first when `revoke_access` is set. One transaction, so
/// grants are never revoked on a scenario left `busy`.
///
/// Returns the released scenario and the number of grants revoked.
pub(crate) fn complete_release(
    pool: &DbPool,
    name: &str,
    revoke_access: bool,
) -> Result<(Scenario, usize), AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = get_on(&tx, name)?;
    check_edge(&current, ScenarioStatus::Free)?;

    let revoked = if revoke_access {
        tx.execute("DELETE FROM user_scenarios WHERE scenario = ?1", params![name])?
    } else {
        0
    };
    let now = chrono::Utc::now().to_rfc3339();
    let rows = tx.execute(
        "UPDATE scenarios SET status = 'free', last_modified = ?1, last_refresh = ?1
         WHERE name = ?2 AND status = 'busy'",
        params![now, name],
    )?;
    if rows == 0 {
        return Err(AppError::Conflict(format!(
            "Scenario {name} changed status during release"
        )));
    }
    let released = get_on(&tx, name)?;
    tx.commit()?;
    Ok((released, revoked))
}

/// Swap the storage of two claimed scenarios and release both to `in_use`,
/// in a single transaction.
pub(crate) fn swap_storage(pool: &DbPool, a: &str, b: &str) -> Result<(), AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let left = get_on(&tx, a)?;
    let right = get_on(&tx, b)?;
    check_edge(&left, ScenarioStatus::InUse)?;
    check_edge(&right, ScenarioStatus::InUse)?;

    let now = chrono::Utc::now().to_rfc3339();
    // storage is UNIQUE: park one side on a placeholder during the swap
    let parked = format!("{}-swap", left.storage);
    tx.execute(
        "UPDATE scenarios SET storage = ?1 WHERE name = ?2",
        params![parked, a],
    )?;
    tx.execute(
        "UPDATE scenarios SET storage = ?1, status = 'in_use', last_modified = ?2 WHERE name = ?3",
        params![left.storage, now, b],
    )?;
    tx.execute(
        "UPDATE scenarios SET storage = ?1, status = 'in_use', last_modified = ?2 WHERE name = ?3",
        params![right.storage, now, a],
    )?;
    tx.commit()?;
    Ok(())
}

/// Remove a scenario row and every access grant referencing it, in one
/// transaction. The row must currently be in `required` status.
fn delete_row(pool: &DbPool, name: &str, required: ScenarioStatus) -> Result<Scenario, AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = get_on(&tx, name)?;
    if current.is_production {
        return Err(AppError::Protected(format!(
            "Scenario {name} is the production scenario and cannot be deleted"
        )));
    }
    if current.status != required {
        return Err(AppError::InUse(format!(
            "Scenario {name} is {}, expected {required}",
            current.status
        )));
    }
    let revoked = tx.execute("DELETE FROM user_scenarios WHERE scenario = ?1", params![name])?;
    tx.execute("DELETE FROM scenarios WHERE name = ?1", params![name])?;
    tx.commit()?;
    tracing::info!(scenario = %name, revoked, "Scenario removed from registry");
    Ok(current)
}

/// Delete a `free` scenario's registry row, cascading access revocation.
///
/// Does not touch the physical database; see the lifecycle delete for that.
pub fn delete(pool: &DbPool, name: &str) -> Result<Scenario, AppError> {
    delete_row(pool, name, ScenarioStatus::Free)
}

/// Terminal edge for a scenario claimed by a delete or a rolled-back copy.
pub(crate) fn remove_claimed(pool: &DbPool, name: &str) -> Result<Scenario, AppError> {
    delete_row(pool, name, ScenarioStatus::Busy)
}

/// `busy` scenarios whose last transition is older than `older_than`.
///
/// These are left behind by a crashed operation and need an operator: the
/// underlying database may be half copied, so no status is guessed here.
pub fn find_orphaned(pool: &DbPool, older_than: Duration) -> Result<Vec<Scenario>, AppError> {
    let cutoff = chrono::Utc::now()
        - chrono::Duration::from_std(older_than)
            .map_err(|e| AppError::Validation(format!("Invalid orphan timeout: {e}")))?;
    let busy = list(pool, Some(ScenarioStatus::Busy))?;
    Ok(busy
        .into_iter()
        .filter(|s| match chrono::DateTime::parse_from_rfc3339(&s.last_modified) {
            Ok(ts) => ts.with_timezone(&chrono::Utc) < cutoff,
            // Unparseable timestamps are surfaced rather than hidden
            Err(_) => true,
        })
        .collect())
}

/// Operator recovery of a `busy` scenario after a crash.
pub fn operator_override(
    pool: &DbPool,
    name: &str,
    to: ScenarioStatus,
) -> Result<Scenario, AppError> {
    if to == ScenarioStatus::Busy {
        return Err(AppError::Validation("Recovery target must be free or in_use".into()));
    }
    let conn = pool.get()?;
    let current = get_on(&conn, name)?;
    if current.status != ScenarioStatus::Busy {
        return Err(AppError::InvalidTransition {
            name: name.to_string(),
            from: current.status.to_string(),
            to: to.to_string(),
        });
    }
    conn.execute(
        "UPDATE scenarios SET status = ?1, last_modified = ?2 WHERE name = ?3 AND status = 'busy'",
        params![to.as_str(), chrono::Utc::now().to_rfc3339(), name],
    )?;
    tracing::warn!(scenario = %name, to = %to, "Busy scenario recovered by operator");
    get_on(&conn, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_crud_scenario() {
        let (_dir, _config, pool) = init_test_db().unwrap();

        let created = create(&pool, "qa", Some("QA snapshot")).unwrap();
        assert_eq!(created.status, ScenarioStatus::Free);
        assert!(created.storage.starts_with("qa-"));

        assert!(matches!(
            create(&pool, "qa", None),
            Err(AppError::AlreadyExists(_))
        ));

        let fetched = get(&pool, "qa").unwrap();
        assert_eq!(fetched.tag(), "QA snapshot");

        let updated = update_description(&pool, "qa", Some("renamed")).unwrap();
        assert_eq!(updated.description.as_deref(), Some("renamed"));

        assert!(matches!(get(&pool, "nope"), Err(AppError::NotFound(_))));
        assert!(find(&pool, "nope").unwrap().is_none());

        delete(&pool, "qa").unwrap();
        assert!(find(&pool, "qa").unwrap().is_none());
    }

    #[test]
    fn test_list_orders_production_first_and_filters() {
        let (_dir, _config, pool) = init_test_db().unwrap();
        create(&pool, "b", Some("Alpha")).unwrap();
        create(&pool, "a", Some("Zulu")).unwrap();

        let names: Vec<String> = list(&pool, None).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["default", "b", "a"]);

        let in_use = list(&pool, Some(ScenarioStatus::InUse)).unwrap();
        assert_eq!(in_use.len(), 1);
        assert_eq!(in_use[0].name, "default");
    }

    #[test]
    fn test_list_fails_on_undecodable_row() {
        let (_dir, _config, pool) = init_test_db().unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch(
            "PRAGMA ignore_check_constraints = ON;
             INSERT INTO scenarios (name, status, storage, last_modified)
             VALUES ('odd', 'archived', 'odd-1', '2024-01-01T00:00:00+00:00');
             PRAGMA ignore_check_constraints = OFF;",
        )
        .unwrap();
        drop(conn);

        assert!(matches!(list(&pool, None), Err(AppError::Database(_))));
    }

    #[test]
    fn test_illegal_transition_leaves_status_unchanged() {
        let (_dir, _config, pool) = init_test_db().unwrap();
        create(&pool, "qa", None).unwrap();

        let err = set_status(&pool, "qa", ScenarioStatus::InUse).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(get(&pool, "qa").unwrap().status, ScenarioStatus::Free);

        set_status(&pool, "qa", ScenarioStatus::Busy).unwrap();
        let err = set_status(&pool, "qa", ScenarioStatus::Busy).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(get(&pool, "qa").unwrap().status, ScenarioStatus::Busy);

        set_status(&pool, "qa", ScenarioStatus::InUse).unwrap();
        assert!(matches!(
            set_status(&pool, "qa", ScenarioStatus::Free),
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (_dir, _config, pool) = init_test_db().unwrap();
        create(&pool, "qa", None).unwrap();

        claim(&pool, "qa", &[ScenarioStatus::Free]).unwrap();
        assert!(matches!(
            claim(&pool, "qa", &[ScenarioStatus::Free]),
            Err(AppError::Conflict(_))
        ));

        // in_use is not an allowed starting point for this claim
        assert!(matches!(
            claim(&pool, "default", &[ScenarioStatus::Free]),
            Err(AppError::InvalidTransition { .. })
        ));
        assert_eq!(get(&pool, "default").unwrap().status, ScenarioStatus::InUse);
    }

    #[test]
    fn test_delete_guards() {
        let (_dir, _config, pool) = init_test_db().unwrap();
        assert!(matches!(
            delete(&pool, "default"),
            Err(AppError::Protected(_))
        ));

        create(&pool, "qa", None).unwrap();
        set_status(&pool, "qa", ScenarioStatus::Busy).unwrap();
        set_status(&pool, "qa", ScenarioStatus::InUse).unwrap();
        assert!(matches!(delete(&pool, "qa"), Err(AppError::InUse(_))));
        assert!(get(&pool, "qa").is_ok());
    }

    #[test]
    fn test_complete_release_revokes_atomically() {
        let (_dir, _config, pool) = init_test_db().unwrap();
        create(&pool, "qa", None).unwrap();
        crate::db::repos::access::grant(&pool, "alice", "qa").unwrap();

        // Not claimed: refused, grants untouched
        assert!(matches!(
            complete_release(&pool, "qa", true),
            Err(AppError::InvalidTransition { .. })
        ));
        assert!(crate::db::repos::access::authorize(&pool, "alice", "qa").unwrap());

        set_status(&pool, "qa", ScenarioStatus::Busy).unwrap();
        let (released, revoked) = complete_release(&pool, "qa", true).unwrap();
        assert_eq!(released.status, ScenarioStatus::Free);
        assert!(released.last_refresh.is_some());
        assert_eq!(revoked, 1);
        assert!(!crate::db::repos::access::authorize(&pool, "alice", "qa").unwrap());
    }

    #[test]
    fn test_swap_storage() {
        let (_dir, _config, pool) = init_test_db().unwrap();
        create(&pool, "qa", None).unwrap();
        set_status(&pool, "qa", ScenarioStatus::Busy).unwrap();
        set_status(&pool, "qa", ScenarioStatus::InUse).unwrap();

        let before_prod = get(&pool, "default").unwrap().storage;
        let before_qa = get(&pool, "qa").unwrap().storage;

        claim(&pool, "qa", &[ScenarioStatus::InUse]).unwrap();
        claim(&pool, "default", &[ScenarioStatus::InUse]).unwrap();
        swap_storage(&pool, "qa", "default").unwrap();

        let prod = get(&pool, "default").unwrap();
        let qa = get(&pool, "qa").unwrap();
        assert_eq!(prod.storage, before_qa);
        assert_eq!(qa.storage, before_prod);
        assert_eq!(prod.status, ScenarioStatus::InUse);
        assert_eq!(qa.status, ScenarioStatus::InUse);
    }

    #[test]
    fn test_find_orphaned_and_override() {
        let (_dir, _config, pool) = init_test_db().unwrap();
        create(&pool, "stuck", None).unwrap();
        set_status(&pool, "stuck", ScenarioStatus::Busy).unwrap();

        assert!(find_orphaned(&pool, Duration::from_secs(3600)).unwrap().is_empty());

        let conn = pool.get().unwrap();
        conn.execute(
            "UPDATE scenarios SET last_modified = '2000-01-01T00:00:00+00:00' WHERE name = 'stuck'",
            [],
        )
        .unwrap();
        drop(conn);

        let orphans = find_orphaned(&pool, Duration::from_secs(3600)).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].name, "stuck");

        assert!(operator_override(&pool, "default", ScenarioStatus::Free).is_err());
        let recovered = operator_override(&pool, "stuck", ScenarioStatus::Free).unwrap();
        assert_eq!(recovered.status, ScenarioStatus::Free);
        assert!(find_orphaned(&pool, Duration::from_secs(3600)).unwrap().is_empty());
    }
}
