//! SQL dialect capabilities.
//!
//! The few SQL fragments that differ between backends are rendered through
//! [`SqlDialect`]. The implementation is chosen once at startup from
//! configuration, never per call.

use std::sync::Arc;

use crate::error::AppError;

pub trait SqlDialect: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Difference `a - b` in seconds, as a numeric SQL expression.
    fn date_diff(&self, a: &str, b: &str) -> String;

    /// Boolean expression: interval `[s1, e1)` overlaps `[s2, e2)`.
    fn overlap(&self, s1: &str, e1: &str, s2: &str, e2: &str) -> String;

    fn true_literal(&self) -> &'static str;
}

#[derive(Debug, Default)]
pub struct Sqlite;

impl SqlDialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn date_diff(&self, a: &str, b: &str) -> String {
        format!("((julianday({a}) - julianday({b})) * 86400.0)")
    }

    fn overlap(&self, s1: &str, e1: &str, s2: &str, e2: &str) -> String {
        format!("(julianday({s1}) < julianday({e2}) AND julianday({s2}) < julianday({e1}))")
    }

    fn true_literal(&self) -> &'static str {
        "1"
    }
}

/// Resolve the configured dialect name.
pub fn select(name: &str) -> Result<Arc<dyn SqlDialect>, AppError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "sqlite" | "sqlite3" => Ok(Arc::new(Sqlite)),
        other => Err(AppError::Config(format!("Unsupported SQL dialect '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_select() {
        assert_eq!(select("SQLite").unwrap().name(), "sqlite");
        assert!(select("postgresql").is_err());
    }

    #[test]
    fn test_sqlite_fragments_evaluate() {
        let d = Sqlite;
        let conn = Connection::open_in_memory().unwrap();

        let diff: f64 = conn
            .query_row(
                &format!(
                    "SELECT {}",
                    d.date_diff("'2024-01-02T00:00:00'", "'2024-01-01T00:00:00'")
                ),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!((diff - 86400.0).abs() < 0.01);

        let overlaps: bool = conn
            .query_row(
                &format!(
                    "SELECT {}",
                    d.overlap("'2024-01-01'", "'2024-01-05'", "'2024-01-04'", "'2024-01-09'")
                ),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(overlaps);

        let disjoint: bool = conn
            .query_row(
                &format!(
                    "SELECT {}",
                    d.overlap("'2024-01-01'", "'2024-01-02'", "'2024-01-02'", "'2024-01-03'")
                ),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!disjoint);

        let t: i64 = conn
            .query_row(&format!("SELECT {}", d.true_literal()), [], |row| row.get(0))
            .unwrap();
        assert_eq!(t, 1);
    }
}
