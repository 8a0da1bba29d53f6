use rusqlite::{params, Connection, OptionalExtension, Row};

use super::*;
use crate::entity::EntityRef;
use crate::signals::fingerprint::text_fingerprint;
use crate::threads::subject::normalize_subject;
use crate::types::{Attachment, AttachmentId, Message, MessageId, Participant};

const MESSAGE_COLUMNS: &str = "id, provider_thread_id, subject, normalized_subject, sender_json,
    recipients_json, original_sender_json, is_forward, received_at, body, thread_id";

const ATTACHMENT_COLUMNS: &str =
    "id, message_id, name, content_type, size, content_hash, extracted_text, text_fingerprint";

/// Raw `messages` row before participants and links are decoded.
struct MessageRow {
    id: MessageId,
    provider_thread_id: Option<String>,
    subject: String,
    normalized_subject: String,
    sender_json: String,
    recipients_json: String,
    original_sender_json: Option<String>,
    is_forward: bool,
    received_at: String,
    body: String,
    thread_id: Option<String>,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            provider_thread_id: row.get(1)?,
            subject: row.get(2)?,
            normalized_subject: row.get(3)?,
            sender_json: row.get(4)?,
            recipients_json: row.get(5)?,
            original_sender_json: row.get(6)?,
            is_forward: row.get::<_, i32>(7)? != 0,
            received_at: row.get(8)?,
            body: row.get(9)?,
            thread_id: row.get(10)?,
        })
    }

    fn hydrate(self, conn: &Connection) -> Result<Message, DbError> {
        let sender: Participant = serde_json::from_str(&self.sender_json)?;
        let recipients: Vec<Participant> = serde_json::from_str(&self.recipients_json)?;
        let original_sender = self
            .original_sender_json
            .as_deref()
            .map(serde_json::from_str::<Participant>)
            .transpose()?;
        let attachment_ids = attachment_ids_for(conn, self.id)?;
        let links = links::load_links(conn, self.id)?;
        Ok(Message {
            id: self.id,
            provider_thread_id: self.provider_thread_id,
            subject: self.subject,
            normalized_subject: self.normalized_subject,
            sender,
            recipients,
            original_sender,
            is_forward: self.is_forward,
            received_at: parse_ts(&self.received_at)?,
            body: self.body,
            attachment_ids,
            thread_id: self.thread_id,
            links,
        })
    }
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get(0)?,
        message_id: row.get(1)?,
        name: row.get(2)?,
        content_type: row.get(3)?,
        size: row.get(4)?,
        content_hash: row.get(5)?,
        extracted_text: row.get(6)?,
        text_fingerprint: row.get(7)?,
    })
}

fn attachment_ids_for(conn: &Connection, message_id: MessageId) -> Result<Vec<AttachmentId>, DbError> {
    let mut stmt = conn.prepare("SELECT id FROM attachments WHERE message_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![message_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Run a `SELECT <message columns> ...` query and decode every row.
fn query_messages(
    conn: &Connection,
    where_sql: &str,
    args: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<Message>, DbError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE {where_sql} ORDER BY m.received_at, m.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args, MessageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(|r| r.hydrate(conn)).collect()
}

pub(crate) fn read_message(conn: &Connection, id: MessageId) -> Result<Option<Message>, DbError> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id], MessageRow::from_row)
        .optional()?;
    row.map(|r| r.hydrate(conn)).transpose()
}

impl CorpusDb {
    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Insert an ingested message with its participants. The normalized
    /// subject is derived here so every reader sees the same form.
    pub fn insert_message(&self, msg: &NewMessage) -> Result<(), DbError> {
        let sender_json = serde_json::to_string(&msg.sender)?;
        let recipients_json = serde_json::to_string(&msg.recipients)?;
        let original_json = msg
            .original_sender
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let normalized = normalize_subject(&msg.subject);

        self.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO messages (
                    id, provider_thread_id, subject, normalized_subject, sender_json,
                    recipients_json, original_sender_json, is_forward, received_at, body
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    msg.id,
                    msg.provider_thread_id,
                    msg.subject,
                    normalized,
                    sender_json,
                    recipients_json,
                    original_json,
                    msg.is_forward as i32,
                    fmt_ts(&msg.received_at),
                    msg.body,
                ],
            )?;

            let mut stmt = conn.prepare(
                "INSERT INTO message_participants (message_id, address, domain, display_name, role)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut participants: Vec<&Participant> = vec![&msg.sender];
            if let Some(ref original) = msg.original_sender {
                participants.push(original);
            }
            participants.extend(msg.recipients.iter());
            for p in participants {
                stmt.execute(params![msg.id, p.address, p.domain, p.name, p.role.as_str()])?;
            }
            Ok(())
        })
    }

    /// Insert an attachment record, deriving its text fingerprint.
    pub fn insert_attachment(&self, att: &NewAttachment) -> Result<(), DbError> {
        let fingerprint = att.extracted_text.as_deref().and_then(text_fingerprint);
        self.conn().execute(
            "INSERT INTO attachments (
                id, message_id, name, content_type, size, content_hash, extracted_text, text_fingerprint
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                att.id,
                att.message_id,
                att.name,
                att.content_type,
                att.size,
                att.content_hash.to_lowercase(),
                att.extracted_text,
                fingerprint,
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>, DbError> {
        read_message(&self.conn(), id)
    }

    pub fn get_attachment(&self, id: AttachmentId) -> Result<Option<Attachment>, DbError> {
        let sql = format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![id], attachment_from_row)
            .optional()?)
    }

    pub fn list_attachments_for_message(&self, message_id: MessageId) -> Result<Vec<Attachment>, DbError> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message_id = ?1 ORDER BY id"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![message_id], attachment_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Attachments whose raw hash or text fingerprint equals `fingerprint`.
    pub fn list_attachments_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<Attachment>, DbError> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments
             WHERE content_hash = ?1 OR text_fingerprint = ?1
             ORDER BY message_id, id"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![fingerprint.to_lowercase()], attachment_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_messages_by_provider_thread_id(&self, provider_thread_id: &str) -> Result<Vec<Message>, DbError> {
        query_messages(&self.conn(), "m.provider_thread_id = ?1", &[&provider_thread_id])
    }

    pub fn list_messages_by_thread_id(&self, thread_id: &str) -> Result<Vec<Message>, DbError> {
        query_messages(&self.conn(), "m.thread_id = ?1", &[&thread_id])
    }

    /// Messages with any participant on `domain`.
    pub fn list_messages_by_domain(&self, domain: &str) -> Result<Vec<Message>, DbError> {
        let domain = domain.trim().to_lowercase();
        query_messages(
            &self.conn(),
            "m.id IN (SELECT message_id FROM message_participants WHERE domain = ?1)",
            &[&domain],
        )
    }

    /// Messages whose subject, body or participant names mention `alias`.
    pub fn list_messages_by_alias(&self, alias: &str) -> Result<Vec<Message>, DbError> {
        let alias = alias.trim();
        if alias.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = like_pattern(alias);
        query_messages(
            &self.conn(),
            "m.subject LIKE ?1 ESCAPE '\\' OR m.body LIKE ?1 ESCAPE '\\'
             OR m.id IN (SELECT message_id FROM message_participants
                         WHERE display_name LIKE ?1 ESCAPE '\\')",
            &[&pattern],
        )
    }

    /// Messages whose normalized subject contains the normalized fragment.
    pub fn list_messages_by_subject_fragment(&self, fragment: &str) -> Result<Vec<Message>, DbError> {
        let fragment = normalize_subject(fragment);
        if fragment.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = like_pattern(&fragment);
        query_messages(&self.conn(), "m.normalized_subject LIKE ?1 ESCAPE '\\'", &[&pattern])
    }

    /// Messages with a committed (automatic or overridden) link to `entity`.
    pub fn list_messages_linked_to(&self, entity: EntityRef) -> Result<Vec<Message>, DbError> {
        query_messages(
            &self.conn(),
            "m.id IN (SELECT message_id FROM message_links
                      WHERE slot = ?1 AND entity_id = ?2 AND state != 'unresolved')",
            &[&entity.entity_type.as_str(), &entity.entity_id],
        )
    }

    /// Messages not yet assigned to a thread, oldest first.
    pub fn list_unthreaded_message_ids(&self) -> Result<Vec<MessageId>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM messages WHERE thread_id IS NULL ORDER BY received_at, id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Engine writes
    // =========================================================================

    /// Set the resolved thread id of each message. Runs as one transaction.
    pub fn assign_threads(&self, assignments: &[(MessageId, String)]) -> Result<usize, DbError> {
        if assignments.is_empty() {
            return Ok(0);
        }
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare(
                "UPDATE messages SET thread_id = ?2 WHERE id = ?1 AND (thread_id IS NULL OR thread_id != ?2)",
            )?;
            let mut changed = 0;
            for (id, thread_id) in assignments {
                changed += stmt.execute(params![id, thread_id])?;
            }
            Ok(changed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{sample_message, test_db};
    use super::*;

    fn attachment(id: i64, message_id: i64, name: &str, hash: &str, text: Option<&str>) -> NewAttachment {
        NewAttachment {
            id,
            message_id,
            name: name.to_string(),
            content_type: Some("application/pdf".into()),
            size: 2048,
            content_hash: hash.to_string(),
            extracted_text: text.map(str::to_string),
        }
    }

    #[test]
    fn test_insert_and_get_message() {
        let db = test_db();
        let mut msg = sample_message(1, "RE: Desert Ridge bid", "pm@acme.com", "est@desert.net", "2025-04-01T10:00:00Z");
        msg.provider_thread_id = Some("T-1".into());
        msg.body = "See attached takeoff.".into();
        db.insert_message(&msg).unwrap();
        db.insert_attachment(&attachment(10, 1, "takeoff.pdf", "ABC123", None)).unwrap();

        let got = db.get_message(1).unwrap().expect("message exists");
        assert_eq!(got.normalized_subject, "desert ridge bid");
        assert_eq!(got.sender.domain, "acme.com");
        assert_eq!(got.attachment_ids, vec![10]);
        assert_eq!(got.provider_thread_id.as_deref(), Some("T-1"));
        assert!(got.thread_id.is_none());
        assert!(got.links.entities().is_empty());

        assert!(db.get_message(2).unwrap().is_none());
    }

    #[test]
    fn test_list_by_domain_includes_recipients() {
        let db = test_db();
        db.insert_message(&sample_message(1, "Bid", "pm@acme.com", "est@desert.net", "2025-04-01T10:00:00Z")).unwrap();
        db.insert_message(&sample_message(2, "Bid", "x@other.org", "y@other.org", "2025-04-02T10:00:00Z")).unwrap();

        let hits = db.list_messages_by_domain("Desert.NET").unwrap();
        assert_eq!(hits.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_list_by_alias_and_subject_fragment() {
        let db = test_db();
        let mut m1 = sample_message(1, "FW: Kiwanis Park restroom", "a@acme.com", "b@acme.com", "2025-01-01T00:00:00Z");
        m1.body = "pricing for 100% of the work".into();
        db.insert_message(&m1).unwrap();
        db.insert_message(&sample_message(2, "Lunch", "a@acme.com", "b@acme.com", "2025-01-02T00:00:00Z")).unwrap();

        let by_alias = db.list_messages_by_alias("kiwanis").unwrap();
        assert_eq!(by_alias.len(), 1);
        // `%` must be literal, not a wildcard
        assert_eq!(db.list_messages_by_alias("100%").unwrap().len(), 1);
        assert!(db.list_messages_by_alias("100%x").unwrap().is_empty());

        let by_subject = db.list_messages_by_subject_fragment("Re: KIWANIS park").unwrap();
        assert_eq!(by_subject.len(), 1);
        assert!(db.list_messages_by_subject_fragment("   ").unwrap().is_empty());
    }

    #[test]
    fn test_fingerprint_lookup_matches_hash_and_text() {
        let db = test_db();
        db.insert_message(&sample_message(1, "Plans", "a@acme.com", "b@x.com", "2025-01-01T00:00:00Z")).unwrap();
        db.insert_message(&sample_message(2, "Plans v2", "c@y.com", "b@x.com", "2025-01-05T00:00:00Z")).unwrap();
        let text = "Section 09 91 23 interior painting, all gypsum board surfaces to receive two coats";
        db.insert_attachment(&attachment(10, 1, "drawings.pdf", "aaa", Some(text))).unwrap();
        db.insert_attachment(&attachment(11, 2, "drawings-export.pdf", "bbb", Some(text.to_uppercase().as_str()))).unwrap();

        let raw = db.list_attachments_by_fingerprint("AAA").unwrap();
        assert_eq!(raw.len(), 1);

        let fp = db.get_attachment(10).unwrap().unwrap().text_fingerprint.expect("long text fingerprinted");
        let by_text = db.list_attachments_by_fingerprint(&fp).unwrap();
        assert_eq!(by_text.iter().map(|a| a.id).collect::<Vec<_>>(), vec![10, 11]);
    }

    #[test]
    fn test_assign_threads_reports_changes() {
        let db = test_db();
        db.insert_message(&sample_message(1, "A", "a@acme.com", "b@x.com", "2025-01-01T00:00:00Z")).unwrap();
        db.insert_message(&sample_message(2, "A", "a@acme.com", "b@x.com", "2025-01-02T00:00:00Z")).unwrap();
        assert_eq!(db.list_unthreaded_message_ids().unwrap(), vec![1, 2]);

        let assignments = vec![(1, "thr-1".to_string()), (2, "thr-1".to_string())];
        assert_eq!(db.assign_threads(&assignments).unwrap(), 2);
        assert_eq!(db.assign_threads(&assignments).unwrap(), 0);
        assert_eq!(db.list_messages_by_thread_id("thr-1").unwrap().len(), 2);
        assert!(db.list_unthreaded_message_ids().unwrap().is_empty());
    }
}
