use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::*;
use crate::threads::ThreadArena;
use crate::types::MessageId;

impl CorpusDb {
    // =========================================================================
    // Thread arena
    // =========================================================================

    /// Load the persisted union-find arena, or an empty one on first run.
    pub fn load_thread_arena(&self) -> Result<ThreadArena, DbError> {
        let json: Option<String> = self
            .conn()
            .query_row("SELECT arena_json FROM thread_arena WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match json {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(ThreadArena::default()),
        }
    }

    pub fn save_thread_arena(&self, arena: &ThreadArena) -> Result<(), DbError> {
        let json = serde_json::to_string(arena)?;
        self.conn().execute(
            "INSERT INTO thread_arena (id, arena_json, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET arena_json = excluded.arena_json, updated_at = excluded.updated_at",
            params![json, fmt_ts(&Utc::now())],
        )?;
        Ok(())
    }

    // =========================================================================
    // Merge conflicts
    // =========================================================================

    /// Persist a suspect provider thread id for manual review. Returns false
    /// if the same (provider id, message) pair was already flagged.
    pub fn flag_thread_conflict(
        &self,
        provider_thread_id: &str,
        message_id: MessageId,
        conflicting_ids: &[MessageId],
        reason: &str,
    ) -> Result<bool, DbError> {
        let ids_json = serde_json::to_string(conflicting_ids)?;
        let inserted = self.conn().execute(
            "INSERT INTO thread_conflicts (id, provider_thread_id, message_id, conflicting_ids, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(provider_thread_id, message_id) DO NOTHING",
            params![
                format!("tc-{}", Uuid::new_v4()),
                provider_thread_id,
                message_id,
                ids_json,
                reason,
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn list_thread_conflicts(&self) -> Result<Vec<ThreadConflictRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, provider_thread_id, message_id, conflicting_ids, reason, created_at
             FROM thread_conflicts ORDER BY created_at, message_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, MessageId>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, provider_thread_id, message_id, ids_json, reason, created_at) = row?;
            out.push(ThreadConflictRecord {
                id,
                provider_thread_id,
                message_id,
                conflicting_ids: serde_json::from_str(&ids_json)?,
                reason,
                created_at,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;

    use crate::threads::ThreadArena;

    #[test]
    fn test_arena_persists_between_loads() {
        let db = test_db();
        assert!(db.load_thread_arena().unwrap().is_empty());

        let mut arena = ThreadArena::default();
        arena.union(1, 2);
        arena.union(2, 5);
        db.save_thread_arena(&arena).unwrap();

        let loaded = db.load_thread_arena().unwrap();
        assert_eq!(loaded.thread_id(5), Some("thr-1".to_string()));
        assert_eq!(loaded.len(), 3);
    }

    #[test]
    fn test_conflict_flagged_once() {
        let db = test_db();
        assert!(db.flag_thread_conflict("T-9", 40, &[3, 7], "subject diverges").unwrap());
        assert!(!db.flag_thread_conflict("T-9", 40, &[3, 7, 8], "again").unwrap());

        let conflicts = db.list_thread_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflicting_ids, vec![3, 7]);
        assert_eq!(conflicts[0].message_id, 40);
    }
}
