use rusqlite::{params, Connection, OptionalExtension, Row};

use super::*;
use crate::entity::{default_specificity, Account, Alias, EntityRef, EntityType, Project};
use crate::threads::subject::normalize_phrase;

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<(Account, Option<String>, Option<String>)> {
    Ok((
        Account {
            id: row.get(0)?,
            domain: row.get(1)?,
            name: row.get(2)?,
            first_seen_at: None,
            last_seen_at: None,
            message_count: row.get(5)?,
        },
        row.get(3)?,
        row.get(4)?,
    ))
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<(Project, Option<String>, Option<String>)> {
    Ok((
        Project {
            id: row.get(0)?,
            name: row.get(1)?,
            normalized_name: row.get(2)?,
            account_id: row.get(3)?,
            first_seen_at: None,
            last_seen_at: None,
            message_count: row.get(6)?,
        },
        row.get(4)?,
        row.get(5)?,
    ))
}

fn finish_account(raw: (Account, Option<String>, Option<String>)) -> Result<Account, DbError> {
    let (mut account, first, last) = raw;
    account.first_seen_at = parse_ts_opt(first)?;
    account.last_seen_at = parse_ts_opt(last)?;
    Ok(account)
}

fn finish_project(raw: (Project, Option<String>, Option<String>)) -> Result<Project, DbError> {
    let (mut project, first, last) = raw;
    project.first_seen_at = parse_ts_opt(first)?;
    project.last_seen_at = parse_ts_opt(last)?;
    Ok(project)
}

/// Recompute first/last-seen and message counts for `entities` from the
/// committed links. Rollups are derived data; running this twice is harmless.
pub(crate) fn refresh_rollup(conn: &Connection, entities: &[EntityRef]) -> Result<usize, DbError> {
    let mut touched = 0;
    for entity in entities {
        let table = match entity.entity_type {
            EntityType::Account => "accounts",
            EntityType::Project => "projects",
        };
        let sql = format!(
            "UPDATE {table} SET
                first_seen_at = (SELECT MIN(m.received_at) FROM message_links l
                                 JOIN messages m ON m.id = l.message_id
                                 WHERE l.slot = ?1 AND l.entity_id = ?2 AND l.state != 'unresolved'),
                last_seen_at = (SELECT MAX(m.received_at) FROM message_links l
                                JOIN messages m ON m.id = l.message_id
                                WHERE l.slot = ?1 AND l.entity_id = ?2 AND l.state != 'unresolved'),
                message_count = (SELECT COUNT(*) FROM message_links l
                                 WHERE l.slot = ?1 AND l.entity_id = ?2 AND l.state != 'unresolved')
             WHERE id = ?2"
        );
        touched += conn.execute(&sql, params![entity.entity_type.as_str(), entity.entity_id])?;
    }
    Ok(touched)
}

impl CorpusDb {
    // =========================================================================
    // Accounts
    // =========================================================================

    /// Find-or-create an account by domain. Returns the account id.
    pub fn insert_account(&self, domain: &str, name: &str) -> Result<i64, DbError> {
        let domain = domain.trim().to_lowercase();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO accounts (domain, name) VALUES (?1, ?2)
             ON CONFLICT(domain) DO NOTHING",
            params![domain, name.trim()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM accounts WHERE domain = ?1",
            params![domain],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_account(&self, id: i64) -> Result<Option<Account>, DbError> {
        let raw = self
            .conn()
            .query_row(
                "SELECT id, domain, name, first_seen_at, last_seen_at, message_count
                 FROM accounts WHERE id = ?1",
                params![id],
                account_from_row,
            )
            .optional()?;
        raw.map(finish_account).transpose()
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, domain, name, first_seen_at, last_seen_at, message_count
             FROM accounts ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], account_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_account).collect()
    }

    // =========================================================================
    // Projects
    // =========================================================================

    pub fn insert_project(&self, name: &str, account_id: Option<i64>) -> Result<i64, DbError> {
        let name = name.trim();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO projects (name, normalized_name, account_id) VALUES (?1, ?2, ?3)",
            params![name, normalize_phrase(name), account_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>, DbError> {
        let raw = self
            .conn()
            .query_row(
                "SELECT id, name, normalized_name, account_id, first_seen_at, last_seen_at, message_count
                 FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()?;
        raw.map(finish_project).transpose()
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, normalized_name, account_id, first_seen_at, last_seen_at, message_count
             FROM projects ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_project).collect()
    }

    // =========================================================================
    // Aliases
    // =========================================================================

    /// Register an alias. Without an explicit specificity one is derived
    /// from the alias text. Re-registering updates the specificity.
    pub fn insert_alias(&self, alias: &str, target: EntityRef, specificity: Option<f64>) -> Result<i64, DbError> {
        let alias = alias.trim();
        let normalized = normalize_phrase(alias);
        let specificity = specificity
            .unwrap_or_else(|| default_specificity(alias))
            .clamp(0.0, 1.0);
        let conn = self.conn();
        conn.execute(
            "INSERT INTO aliases (alias, normalized_alias, entity_type, entity_id, specificity)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(normalized_alias, entity_type, entity_id)
             DO UPDATE SET specificity = excluded.specificity",
            params![alias, normalized, target.entity_type.as_str(), target.entity_id, specificity],
        )?;
        let id = conn.query_row(
            "SELECT id FROM aliases WHERE normalized_alias = ?1 AND entity_type = ?2 AND entity_id = ?3",
            params![normalized, target.entity_type.as_str(), target.entity_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn list_aliases(&self) -> Result<Vec<Alias>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, alias, entity_type, entity_id, specificity FROM aliases ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, alias, entity_type, entity_id, specificity) = row?;
            let entity_type = EntityType::parse(&entity_type)
                .ok_or_else(|| DbError::CorruptRow(format!("alias {id}: entity type '{entity_type}'")))?;
            out.push(Alias {
                id,
                alias,
                target: EntityRef { entity_type, entity_id },
                specificity,
            });
        }
        Ok(out)
    }

    /// Refresh rollups for the given entities in one transaction.
    pub fn refresh_rollup(&self, entities: &[EntityRef]) -> Result<usize, DbError> {
        self.with_transaction(|conn| refresh_rollup(conn, entities))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_insert_account_is_find_or_create() {
        let db = test_db();
        let a = db.insert_account("Acme.com", "Acme").unwrap();
        let b = db.insert_account("acme.com ", "Acme Corp").unwrap();
        assert_eq!(a, b);
        let accounts = db.list_accounts().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].domain, "acme.com");
        assert_eq!(accounts[0].name, "Acme");
        assert_eq!(accounts[0].message_count, 0);
        assert!(db.get_account(a).unwrap().is_some());
    }

    #[test]
    fn test_insert_project_normalizes_name() {
        let db = test_db();
        let acct = db.insert_account("acme.com", "Acme").unwrap();
        let id = db.insert_project("  Desert Ridge  Phase-2 ", Some(acct)).unwrap();
        let p = db.get_project(id).unwrap().unwrap();
        assert_eq!(p.name, "Desert Ridge  Phase-2");
        assert_eq!(p.normalized_name, "desert ridge phase 2");
        assert_eq!(p.account_id, Some(acct));
        assert!(p.first_seen_at.is_none());
    }

    #[test]
    fn test_alias_upsert_and_default_specificity() {
        let db = test_db();
        let target = EntityRef::project(3);
        let first = db.insert_alias("Kiwanis Park", target, None).unwrap();
        let again = db.insert_alias("kiwanis  park", target, Some(0.9)).unwrap();
        assert_eq!(first, again);

        let aliases = db.list_aliases().unwrap();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].target, target);
        assert!((aliases[0].specificity - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_refresh_rollup_counts_committed_links() {
        let db = test_db();
        let pid = db.insert_project("Kiwanis Park", None).unwrap();
        {
            let conn = db.conn();
            conn.execute_batch(&format!(
                "INSERT INTO messages (id, sender_json, received_at) VALUES
                    (1, '{{}}', '2025-02-01T00:00:00.000Z'),
                    (2, '{{}}', '2025-05-01T00:00:00.000Z'),
                    (3, '{{}}', '2025-09-01T00:00:00.000Z');
                 INSERT INTO message_links (message_id, slot, state, entity_id, detail_json, updated_at) VALUES
                    (1, 'project', 'automatic', {pid}, '{{}}', 'x'),
                    (2, 'project', 'overridden', {pid}, '{{}}', 'x'),
                    (3, 'project', 'unresolved', NULL, '{{}}', 'x');"
            ))
            .unwrap();
        }
        assert_eq!(db.refresh_rollup(&[EntityRef::project(pid)]).unwrap(), 1);
        let p = db.get_project(pid).unwrap().unwrap();
        assert_eq!(p.message_count, 2);
        assert_eq!(p.first_seen_at.unwrap().to_rfc3339(), "2025-02-01T00:00:00+00:00");
        assert_eq!(p.last_seen_at.unwrap().to_rfc3339(), "2025-05-01T00:00:00+00:00");
    }
}
