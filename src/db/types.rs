//! Shared type definitions for the database layer.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AttachmentId, MessageId, Participant};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Message {0} not found")]
    MessageNotFound(MessageId),

    #[error("Rejected link write: {0}")]
    InvalidWrite(String),
}

/// Canonical timestamp format for storage: fixed-width RFC 3339 in UTC, so
/// lexical order in SQL matches chronological order.
pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp. Accepts RFC 3339 and SQLite `datetime('now')`.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, DbError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| DbError::Timestamp(raw.to_string()))
}

pub fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, DbError> {
    raw.as_deref().map(parse_ts).transpose()
}

/// A message as handed over by ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub id: MessageId,
    pub provider_thread_id: Option<String>,
    pub subject: String,
    pub sender: Participant,
    #[serde(default)]
    pub recipients: Vec<Participant>,
    #[serde(default)]
    pub original_sender: Option<Participant>,
    #[serde(default)]
    pub is_forward: bool,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub body: String,
}

/// An attachment as handed over by ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAttachment {
    pub id: AttachmentId,
    pub message_id: MessageId,
    pub name: String,
    pub content_type: Option<String>,
    pub size: i64,
    pub content_hash: String,
    pub extracted_text: Option<String>,
}

/// A row from `link_overrides`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRecord {
    pub id: String,
    pub message_id: MessageId,
    pub slot: String,
    pub entity_id: i64,
    pub actor: String,
    pub reason: String,
    pub created_at: String,
    pub superseded_by: Option<String>,
}

/// A row from `thread_conflicts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadConflictRecord {
    pub id: String,
    pub provider_thread_id: String,
    pub message_id: MessageId,
    pub conflicting_ids: Vec<MessageId>,
    pub reason: String,
    pub created_at: String,
}

/// A row from `signal_reliability`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalReliability {
    pub signal: String,
    pub slot: String,
    pub alpha: f64,
    pub beta: f64,
    pub update_count: i64,
}

impl SignalReliability {
    /// Beta distribution mean.
    pub fn mean(&self) -> f64 {
        let a = self.alpha.max(0.01);
        let b = self.beta.max(0.01);
        a / (a + b)
    }
}
