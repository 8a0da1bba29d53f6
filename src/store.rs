//! The message store seam.
//!
//! The engine only talks to storage through [`MessageStore`]. Calls are
//! synchronous; async callers run them on the blocking pool. `CorpusDb` is
//! the SQLite implementation shipped with the crate.

use crate::db::CorpusDb;
use crate::entity::{Account, Alias, EntityRef, EntityType, Project};
use crate::error::StoreError;
use crate::threads::ThreadArena;
use crate::types::{
    Attachment, AttachmentId, LinkState, Message, MessageId, OverrideOutcome, RecordOutcome,
    VersionedLink,
};

pub trait MessageStore: Send + Sync {
    /// Cheap liveness check run before a batch starts.
    fn ping(&self) -> Result<(), StoreError>;

    fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;
    fn get_attachment(&self, id: AttachmentId) -> Result<Option<Attachment>, StoreError>;

    fn list_messages_by_thread_id(&self, thread_id: &str) -> Result<Vec<Message>, StoreError>;
    fn list_messages_by_provider_thread_id(&self, provider_thread_id: &str) -> Result<Vec<Message>, StoreError>;
    fn list_messages_by_domain(&self, domain: &str) -> Result<Vec<Message>, StoreError>;
    fn list_messages_by_alias(&self, alias: &str) -> Result<Vec<Message>, StoreError>;
    fn list_messages_by_subject_fragment(&self, fragment: &str) -> Result<Vec<Message>, StoreError>;
    /// Messages with an automatic or overridden link to `entity`.
    fn list_messages_linked_to(&self, entity: EntityRef) -> Result<Vec<Message>, StoreError>;
    /// Attachments whose raw hash or text fingerprint equals `fingerprint`.
    fn list_attachments_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<Attachment>, StoreError>;

    fn list_accounts(&self) -> Result<Vec<Account>, StoreError>;
    fn list_projects(&self) -> Result<Vec<Project>, StoreError>;
    fn list_aliases(&self) -> Result<Vec<Alias>, StoreError>;

    fn load_link(&self, message_id: MessageId, slot: EntityType) -> Result<VersionedLink, StoreError>;

    /// Compare-and-set a non-override link state.
    fn record_link(
        &self,
        message_id: MessageId,
        slot: EntityType,
        expected_version: i64,
        state: &LinkState,
    ) -> Result<RecordOutcome, StoreError>;

    /// Write an override and retract the automatic link atomically.
    fn record_override(
        &self,
        message_id: MessageId,
        entity: EntityRef,
        actor: &str,
        reason: &str,
    ) -> Result<OverrideOutcome, StoreError>;

    /// Recompute first/last-seen and counts for the given entities.
    fn refresh_rollup(&self, entities: &[EntityRef]) -> Result<usize, StoreError>;

    fn load_thread_arena(&self) -> Result<ThreadArena, StoreError>;
    fn save_thread_arena(&self, arena: &ThreadArena) -> Result<(), StoreError>;
    fn assign_threads(&self, assignments: &[(MessageId, String)]) -> Result<usize, StoreError>;
    fn flag_thread_conflict(
        &self,
        provider_thread_id: &str,
        message_id: MessageId,
        conflicting_ids: &[MessageId],
        reason: &str,
    ) -> Result<bool, StoreError>;
}

impl MessageStore for CorpusDb {
    fn ping(&self) -> Result<(), StoreError> {
        Ok(CorpusDb::ping(self)?)
    }

    fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(CorpusDb::get_message(self, id)?)
    }

    fn get_attachment(&self, id: AttachmentId) -> Result<Option<Attachment>, StoreError> {
        Ok(CorpusDb::get_attachment(self, id)?)
    }

    fn list_messages_by_thread_id(&self, thread_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(CorpusDb::list_messages_by_thread_id(self, thread_id)?)
    }

    fn list_messages_by_provider_thread_id(&self, provider_thread_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(CorpusDb::list_messages_by_provider_thread_id(self, provider_thread_id)?)
    }

    fn list_messages_by_domain(&self, domain: &str) -> Result<Vec<Message>, StoreError> {
        Ok(CorpusDb::list_messages_by_domain(self, domain)?)
    }

    fn list_messages_by_alias(&self, alias: &str) -> Result<Vec<Message>, StoreError> {
        Ok(CorpusDb::list_messages_by_alias(self, alias)?)
    }

    fn list_messages_by_subject_fragment(&self, fragment: &str) -> Result<Vec<Message>, StoreError> {
        Ok(CorpusDb::list_messages_by_subject_fragment(self, fragment)?)
    }

    fn list_messages_linked_to(&self, entity: EntityRef) -> Result<Vec<Message>, StoreError> {
        Ok(CorpusDb::list_messages_linked_to(self, entity)?)
    }

    fn list_attachments_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<Attachment>, StoreError> {
        Ok(CorpusDb::list_attachments_by_fingerprint(self, fingerprint)?)
    }

    fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(CorpusDb::list_accounts(self)?)
    }

    fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        Ok(CorpusDb::list_projects(self)?)
    }

    fn list_aliases(&self) -> Result<Vec<Alias>, StoreError> {
        Ok(CorpusDb::list_aliases(self)?)
    }

    fn load_link(&self, message_id: MessageId, slot: EntityType) -> Result<VersionedLink, StoreError> {
        Ok(CorpusDb::load_link(self, message_id, slot)?)
    }

    fn record_link(
        &self,
        message_id: MessageId,
        slot: EntityType,
        expected_version: i64,
        state: &LinkState,
    ) -> Result<RecordOutcome, StoreError> {
        Ok(CorpusDb::record_link(self, message_id, slot, expected_version, state)?)
    }

    fn record_override(
        &self,
        message_id: MessageId,
        entity: EntityRef,
        actor: &str,
        reason: &str,
    ) -> Result<OverrideOutcome, StoreError> {
        Ok(CorpusDb::record_override(self, message_id, entity, actor, reason)?)
    }

    fn refresh_rollup(&self, entities: &[EntityRef]) -> Result<usize, StoreError> {
        Ok(CorpusDb::refresh_rollup(self, entities)?)
    }

    fn load_thread_arena(&self) -> Result<ThreadArena, StoreError> {
        Ok(CorpusDb::load_thread_arena(self)?)
    }

    fn save_thread_arena(&self, arena: &ThreadArena) -> Result<(), StoreError> {
        Ok(CorpusDb::save_thread_arena(self, arena)?)
    }

    fn assign_threads(&self, assignments: &[(MessageId, String)]) -> Result<usize, StoreError> {
        Ok(CorpusDb::assign_threads(self, assignments)?)
    }

    fn flag_thread_conflict(
        &self,
        provider_thread_id: &str,
        message_id: MessageId,
        conflicting_ids: &[MessageId],
        reason: &str,
    ) -> Result<bool, StoreError> {
        Ok(CorpusDb::flag_thread_conflict(self, provider_thread_id, message_id, conflicting_ids, reason)?)
    }
}
