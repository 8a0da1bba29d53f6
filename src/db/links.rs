use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::*;
use crate::entity::{EntityRef, EntityType};
use crate::signals::feedback::assess_correction;
use crate::types::{
    LinkState, MessageId, MessageLinks, OverrideLink, OverrideOutcome, RecordOutcome, VersionedLink,
};

/// Mirror columns kept next to `detail_json` so SQL can filter on them.
fn state_columns(state: &LinkState) -> (&'static str, Option<i64>, Option<f64>) {
    (state.as_str(), state.entity().map(|e| e.entity_id), state.score())
}

fn decode_link(message_id: MessageId, state: &str, detail: &str, version: i64) -> Result<VersionedLink, DbError> {
    let decoded = match state {
        "unresolved" => LinkState::Unresolved,
        "automatic" | "overridden" => serde_json::from_str::<LinkState>(detail)?,
        other => {
            return Err(DbError::CorruptRow(format!(
                "message {message_id}: unknown link state '{other}'"
            )))
        }
    };
    if decoded.as_str() != state {
        return Err(DbError::CorruptRow(format!(
            "message {message_id}: state column '{state}' disagrees with detail"
        )));
    }
    Ok(VersionedLink { state: decoded, version })
}

/// Current link of one slot. A slot never written reads as `Unresolved`
/// at version 0.
pub(crate) fn load_link(conn: &Connection, message_id: MessageId, slot: EntityType) -> Result<VersionedLink, DbError> {
    let row = conn
        .query_row(
            "SELECT state, detail_json, version FROM message_links WHERE message_id = ?1 AND slot = ?2",
            params![message_id, slot.as_str()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?)),
        )
        .optional()?;
    match row {
        Some((state, detail, version)) => decode_link(message_id, &state, &detail, version),
        None => Ok(VersionedLink::default()),
    }
}

pub(crate) fn load_links(conn: &Connection, message_id: MessageId) -> Result<MessageLinks, DbError> {
    let mut links = MessageLinks::default();
    for slot in EntityType::ALL {
        *links.slot_mut(slot) = load_link(conn, message_id, slot)?.state;
    }
    Ok(links)
}

/// Write `state` to a slot only if it is still at `expected_version` and not
/// overridden.
pub(crate) fn compare_and_set_link(
    conn: &Connection,
    message_id: MessageId,
    slot: EntityType,
    expected_version: i64,
    state: &LinkState,
    now: DateTime<Utc>,
) -> Result<RecordOutcome, DbError> {
    if state.is_overridden() {
        return Err(DbError::InvalidWrite(format!(
            "message {message_id}: overrides are recorded through record_override"
        )));
    }
    if let Some(entity) = state.entity() {
        if entity.entity_type != slot {
            return Err(DbError::InvalidWrite(format!(
                "message {message_id}: {entity} cannot fill the {} slot",
                slot.as_str()
            )));
        }
    }

    let (label, entity_id, score) = state_columns(state);
    let detail = serde_json::to_string(state)?;
    let next = expected_version + 1;
    let now = fmt_ts(&now);

    let changed = if expected_version == 0 {
        conn.execute(
            "INSERT INTO message_links
                (message_id, slot, state, entity_id, score, detail_json, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(message_id, slot) DO NOTHING",
            params![message_id, slot.as_str(), label, entity_id, score, detail, next, now],
        )?
    } else {
        conn.execute(
            "UPDATE message_links
             SET state = ?3, entity_id = ?4, score = ?5, detail_json = ?6, version = ?7, updated_at = ?8
             WHERE message_id = ?1 AND slot = ?2 AND version = ?9 AND state != 'overridden'",
            params![message_id, slot.as_str(), label, entity_id, score, detail, next, now, expected_version],
        )?
    };

    if changed == 1 {
        return Ok(RecordOutcome::Committed { version: next });
    }

    let current = load_link(conn, message_id, slot)?;
    if current.state.is_overridden() {
        Ok(RecordOutcome::Overridden)
    } else {
        Ok(RecordOutcome::VersionConflict { current: current.version })
    }
}

/// Record a human correction. Everything below happens inside the caller's
/// transaction: a failure at any step leaves no trace of the override.
pub(crate) fn apply_override(
    conn: &Connection,
    message_id: MessageId,
    entity: EntityRef,
    actor: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<OverrideOutcome, DbError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
        params![message_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(DbError::MessageNotFound(message_id));
    }

    let slot = entity.entity_type;
    let current = load_link(conn, message_id, slot)?;
    let ts = fmt_ts(&now);

    // 1. Override history: insert, then supersede the previous active row
    let override_id = format!("ovr-{}", Uuid::new_v4());
    let prior: Option<String> = conn
        .query_row(
            "SELECT id FROM link_overrides
             WHERE message_id = ?1 AND slot = ?2 AND superseded_by IS NULL",
            params![message_id, slot.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    conn.execute(
        "INSERT INTO link_overrides (id, message_id, slot, entity_id, actor, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![override_id, message_id, slot.as_str(), entity.entity_id, actor, reason, ts],
    )?;
    if let Some(ref prior_id) = prior {
        conn.execute(
            "UPDATE link_overrides SET superseded_by = ?1 WHERE id = ?2",
            params![override_id, prior_id],
        )?;
    }

    // 2. Replace the slot (retracting any automatic decision)
    let state = LinkState::Overridden(OverrideLink {
        entity,
        actor: actor.to_string(),
        reason: reason.to_string(),
        overridden_at: now,
    });
    let (label, entity_id, score) = state_columns(&state);
    let detail = serde_json::to_string(&state)?;
    let version = current.version + 1;
    conn.execute(
        "INSERT INTO message_links
            (message_id, slot, state, entity_id, score, detail_json, version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(message_id, slot) DO UPDATE SET
            state = excluded.state,
            entity_id = excluded.entity_id,
            score = excluded.score,
            detail_json = excluded.detail_json,
            version = excluded.version,
            updated_at = excluded.updated_at",
        params![message_id, slot.as_str(), label, entity_id, score, detail, version, ts],
    )?;

    // 3. Feedback row and reliability counters
    let correction = assess_correction(&current.state, entity);
    conn.execute(
        "INSERT INTO link_feedback
            (id, message_id, slot, old_entity_id, new_entity_id, signal_source, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            format!("fb-{}", Uuid::new_v4()),
            message_id,
            slot.as_str(),
            correction.old_entity.map(|e| e.entity_id),
            entity.entity_id,
            correction.wrong_signal.map(|s| s.as_str()),
            ts,
        ],
    )?;
    for update in &correction.updates {
        conn.execute(
            "INSERT INTO signal_reliability (signal, slot, alpha, beta, update_count)
             VALUES (?1, ?2, 1.0 + ?3, 1.0 + ?4, 1)
             ON CONFLICT (signal, slot) DO UPDATE SET
                alpha = alpha + ?3,
                beta = beta + ?4,
                update_count = update_count + 1",
            params![update.signal.as_str(), slot.as_str(), update.alpha_delta, update.beta_delta],
        )?;
    }

    // 4. Rollups for both sides of the membership change
    let mut touched = vec![entity];
    if let Some(old) = correction.old_entity {
        if old != entity {
            touched.push(old);
        }
    }
    entities::refresh_rollup(conn, &touched)?;

    Ok(OverrideOutcome {
        override_id,
        superseded: prior,
        previous: current.state,
        version,
    })
}

impl CorpusDb {
    pub fn load_link(&self, message_id: MessageId, slot: EntityType) -> Result<VersionedLink, DbError> {
        load_link(&self.conn(), message_id, slot)
    }

    /// Compare-and-set an automatic (or unresolved) link state.
    pub fn record_link(
        &self,
        message_id: MessageId,
        slot: EntityType,
        expected_version: i64,
        state: &LinkState,
    ) -> Result<RecordOutcome, DbError> {
        self.with_transaction(|conn| {
            compare_and_set_link(conn, message_id, slot, expected_version, state, Utc::now())
        })
    }

    /// Atomically record an override. Validation of actor and reason happens
    /// in the feedback recorder.
    pub fn record_override(
        &self,
        message_id: MessageId,
        entity: EntityRef,
        actor: &str,
        reason: &str,
    ) -> Result<OverrideOutcome, DbError> {
        self.with_transaction(|conn| apply_override(conn, message_id, entity, actor, reason, Utc::now()))
    }

    /// Override history for a message, oldest first.
    pub fn list_overrides(&self, message_id: MessageId) -> Result<Vec<OverrideRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, slot, entity_id, actor, reason, created_at, superseded_by
             FROM link_overrides WHERE message_id = ?1
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(OverrideRecord {
                id: row.get(0)?,
                message_id: row.get(1)?,
                slot: row.get(2)?,
                entity_id: row.get(3)?,
                actor: row.get(4)?,
                reason: row.get(5)?,
                created_at: row.get(6)?,
                superseded_by: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_signal_reliability(&self) -> Result<Vec<SignalReliability>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT signal, slot, alpha, beta, update_count FROM signal_reliability
             ORDER BY signal, slot",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SignalReliability {
                signal: row.get(0)?,
                slot: row.get(1)?,
                alpha: row.get(2)?,
                beta: row.get(3)?,
                update_count: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{sample_message, test_db};
    use super::*;
    use crate::signals::weights::SignalKind;
    use crate::types::{AutomaticLink, SignalContribution};

    fn automatic(entity: EntityRef, signal: SignalKind) -> LinkState {
        LinkState::Automatic(AutomaticLink {
            entity,
            score: 0.7,
            breakdown: vec![SignalContribution {
                signal,
                score: 1.0,
                weight: signal.weight(),
                rationale: "test".into(),
            }],
            decided_at: Utc::now(),
        })
    }

    fn seeded() -> CorpusDb {
        let db = test_db();
        db.insert_message(&sample_message(1, "Bid", "pm@acme.com", "est@desert.net", "2025-04-01T10:00:00Z"))
            .unwrap();
        db
    }

    #[test]
    fn test_unwritten_slot_reads_unresolved() {
        let db = seeded();
        let link = db.load_link(1, EntityType::Project).unwrap();
        assert_eq!(link.state, LinkState::Unresolved);
        assert_eq!(link.version, 0);
    }

    #[test]
    fn test_compare_and_set_detects_stale_version() {
        let db = seeded();
        let state = automatic(EntityRef::account(5), SignalKind::DomainMatch);

        let first = db.record_link(1, EntityType::Account, 0, &state).unwrap();
        assert_eq!(first, RecordOutcome::Committed { version: 1 });

        // A second writer still holding version 0 loses
        let stale = db.record_link(1, EntityType::Account, 0, &LinkState::Unresolved).unwrap();
        assert_eq!(stale, RecordOutcome::VersionConflict { current: 1 });

        let next = db.record_link(1, EntityType::Account, 1, &LinkState::Unresolved).unwrap();
        assert_eq!(next, RecordOutcome::Committed { version: 2 });
        assert_eq!(db.load_link(1, EntityType::Account).unwrap().state, LinkState::Unresolved);
    }

    #[test]
    fn test_record_link_rejects_wrong_slot_and_override_states() {
        let db = seeded();
        let wrong_slot = automatic(EntityRef::account(5), SignalKind::DomainMatch);
        assert!(matches!(
            db.record_link(1, EntityType::Project, 0, &wrong_slot),
            Err(DbError::InvalidWrite(_))
        ));

        let forged = LinkState::Overridden(OverrideLink {
            entity: EntityRef::project(2),
            actor: "x".into(),
            reason: "y".into(),
            overridden_at: Utc::now(),
        });
        assert!(matches!(
            db.record_link(1, EntityType::Project, 0, &forged),
            Err(DbError::InvalidWrite(_))
        ));
    }

    #[test]
    fn test_override_retracts_automatic_and_blocks_writes() {
        let db = seeded();
        let wrong = EntityRef::project(2);
        let right = EntityRef::project(3);
        db.record_link(1, EntityType::Project, 0, &automatic(wrong, SignalKind::SubjectMatch))
            .unwrap();

        let outcome = db.record_override(1, right, "ops@acme.com", "wrong phase").unwrap();
        assert_eq!(outcome.version, 2);
        assert_eq!(outcome.previous.entity(), Some(wrong));
        assert!(outcome.superseded.is_none());

        let link = db.load_link(1, EntityType::Project).unwrap();
        assert!(link.state.is_overridden());
        assert_eq!(link.state.entity(), Some(right));

        // Automatic writes bounce off the override, even with the right version
        let blocked = db
            .record_link(1, EntityType::Project, 2, &automatic(wrong, SignalKind::SubjectMatch))
            .unwrap();
        assert_eq!(blocked, RecordOutcome::Overridden);

        let reliability = db.list_signal_reliability().unwrap();
        assert_eq!(reliability.len(), 1);
        assert_eq!(reliability[0].signal, "subject_match");
        assert!((reliability[0].beta - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_second_override_supersedes_first() {
        let db = seeded();
        let first = db.record_override(1, EntityRef::project(2), "a", "first").unwrap();
        let second = db.record_override(1, EntityRef::project(3), "b", "second").unwrap();
        assert_eq!(second.superseded.as_deref(), Some(first.override_id.as_str()));

        let history = db.list_overrides(1).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].superseded_by.as_deref(), Some(second.override_id.as_str()));
        assert!(history[1].superseded_by.is_none());
        assert_eq!(
            db.load_link(1, EntityType::Project).unwrap().state.entity(),
            Some(EntityRef::project(3))
        );
    }

    #[test]
    fn test_override_unknown_message() {
        let db = test_db();
        let err = db.record_override(99, EntityRef::account(1), "a", "b").unwrap_err();
        assert!(matches!(err, DbError::MessageNotFound(99)));
        assert!(db.list_overrides(99).unwrap().is_empty());
    }
}
