//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

/// Create the `schema_version` table if it doesn't exist.
fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("Failed to create schema_version table: {}", e))
}

/// Return the highest applied migration version, or 0 if none.
fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("Failed to read schema version: {}", e))
}

/// Run all pending migrations.
///
/// Returns the number of migrations applied (0 if already up-to-date).
/// A database newer than the highest known migration is refused.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if current > max_known {
        return Err(format!(
            "Database schema version ({}) is newer than this build supports ({}).",
            current, max_known
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    for migration in &pending {
        conn.execute_batch(migration.sql)
            .map_err(|e| format!("Migration v{} failed: {}", migration.version, e))?;

        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )
        .map_err(|e| format!("Failed to record migration v{}: {}", migration.version, e))?;

        log::info!("Applied migration v{}", migration.version);
    }

    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn test_fresh_db_applies_baseline() {
        let conn = mem_db();
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, 1);
        assert_eq!(current_version(&conn).expect("version"), 1);

        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM message_links", [], |row| row.get(0))
            .expect("message_links table should exist");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = mem_db();
        run_migrations(&conn).expect("first run");
        let applied = run_migrations(&conn).expect("second run");
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_refuses_newer_schema() {
        let conn = mem_db();
        run_migrations(&conn).expect("first run");
        conn.execute("INSERT INTO schema_version (version) VALUES (99)", [])
            .expect("bump version");
        let err = run_migrations(&conn).unwrap_err();
        assert!(err.contains("newer"), "unexpected error: {err}");
    }

    #[test]
    fn test_link_state_check_constraint() {
        let conn = mem_db();
        run_migrations(&conn).expect("migrate");
        let bad = conn.execute(
            "INSERT INTO message_links (message_id, slot, state, entity_id, detail_json, updated_at)
             VALUES (1, 'project', 'unresolved', 5, '{}', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(bad.is_err(), "unresolved link with an entity must be rejected");
    }
}
