//! Thread resolution for one sync batch.
//!
//! The resolver owns the arena for the duration of a batch (single writer).
//! Provider thread ids are trusted unless they look reused; subject-derived
//! keys cover messages without a usable provider id and forwards.

use std::collections::{BTreeMap, HashSet};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::domains::{DomainClass, DomainPolicy};
use crate::error::StoreError;
use crate::store::MessageStore;
use crate::types::{Message, MessageId};

use super::subject::{is_generic_subject, subject_similarity};
use super::union_find::ThreadArena;

/// A provider thread id that was not trusted for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadConflict {
    pub provider_thread_id: String,
    pub message_id: MessageId,
    /// Messages already on the provider thread that the new message diverges from.
    pub conflicting_ids: Vec<MessageId>,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadResolution {
    /// Thread id of every member of every thread the batch touched.
    pub assignments: BTreeMap<MessageId, String>,
    pub conflicts: Vec<ThreadConflict>,
    /// Number of unions performed.
    pub merges: usize,
    /// Provider-id checks that could not consult the store.
    pub degraded: usize,
}

pub struct ThreadResolver {
    arena: ThreadArena,
    policy: DomainPolicy,
    similarity_threshold: f64,
    suspect_gap: Duration,
}

impl ThreadResolver {
    pub fn new(arena: ThreadArena, config: &EngineConfig) -> Self {
        Self {
            arena,
            policy: DomainPolicy::from_config(config),
            similarity_threshold: config.thread_similarity_threshold,
            suspect_gap: Duration::days(config.suspect_thread_gap_days),
        }
    }

    pub fn arena(&self) -> &ThreadArena {
        &self.arena
    }

    pub fn into_arena(self) -> ThreadArena {
        self.arena
    }

    /// Assign every message of `batch` to a thread. Messages are processed
    /// oldest first so the earliest message of a reused provider id is the
    /// one that keeps it.
    pub fn resolve(&mut self, batch: &[Message], store: &dyn MessageStore) -> ThreadResolution {
        let mut ordered: Vec<&Message> = batch.iter().collect();
        ordered.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.id.cmp(&b.id)));

        let mut resolution = ThreadResolution::default();
        for message in &ordered {
            self.resolve_one(message, store, &mut resolution);
        }

        for message in &ordered {
            if resolution.assignments.contains_key(&message.id) {
                continue;
            }
            for member in self.arena.members_of(message.id) {
                if let Some(thread_id) = self.arena.thread_id(member) {
                    resolution.assignments.insert(member, thread_id);
                }
            }
        }

        log::info!(
            "Thread resolution: {} messages, {} merges, {} conflicts, {} degraded checks",
            ordered.len(),
            resolution.merges,
            resolution.conflicts.len(),
            resolution.degraded
        );
        resolution
    }

    fn resolve_one(&mut self, message: &Message, store: &dyn MessageStore, out: &mut ThreadResolution) {
        self.arena.ensure(message.id);

        let provider_id = message
            .provider_thread_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let is_embedded_forward = message.is_forward && message.original_sender.is_some();
        let mut trust_derived = provider_id.is_none() || is_embedded_forward;

        if let Some(provider_id) = provider_id {
            let key = format!("p:{provider_id}");
            match self.arena.key_owner(&key) {
                None => self.arena.bind_key(&key, message.id),
                Some(owner) if self.arena.same_thread(owner, message.id) => {}
                Some(owner) => match self.check_suspect(message, provider_id, owner, store) {
                    Ok(Some(conflict)) => {
                        log::warn!(
                            "Provider thread {} looks reused by message {}: {}",
                            provider_id,
                            message.id,
                            conflict.reason
                        );
                        out.conflicts.push(conflict);
                        trust_derived = true;
                    }
                    Ok(None) => {
                        if self.arena.union(owner, message.id) {
                            out.merges += 1;
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "Could not check provider thread {} for message {}: {}; trusting it",
                            provider_id,
                            message.id,
                            e
                        );
                        out.degraded += 1;
                        if self.arena.union(owner, message.id) {
                            out.merges += 1;
                        }
                    }
                },
            }
        }

        if let Some(key) = self.derived_key(message) {
            match self.arena.key_owner(&key) {
                None => self.arena.bind_key(&key, message.id),
                Some(owner) if trust_derived => {
                    if self.arena.union(owner, message.id) {
                        out.merges += 1;
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// A provider id is suspect for `message` when every message already
    /// threaded under it diverges in subject and participants, and the
    /// nearest of them is further away than the suspect gap.
    fn check_suspect(
        &self,
        message: &Message,
        provider_id: &str,
        owner: MessageId,
        store: &dyn MessageStore,
    ) -> Result<Option<ThreadConflict>, StoreError> {
        let peers: Vec<Message> = store
            .list_messages_by_provider_thread_id(provider_id)?
            .into_iter()
            .filter(|p| p.id != message.id && self.arena.same_thread(p.id, owner))
            .collect();
        if peers.is_empty() {
            return Ok(None);
        }

        let own_domains = self.business_domains(message);
        let diverges = |peer: &Message| {
            let similarity = subject_similarity(&message.normalized_subject, &peer.normalized_subject);
            let shared = self.business_domains(peer).iter().any(|d| own_domains.contains(d));
            similarity < self.similarity_threshold && !shared
        };
        if !peers.iter().all(diverges) {
            return Ok(None);
        }

        let nearest = peers
            .iter()
            .map(|p| (message.received_at - p.received_at).abs())
            .min()
            .unwrap_or_else(Duration::zero);
        if nearest <= self.suspect_gap {
            return Ok(None);
        }

        Ok(Some(ThreadConflict {
            provider_thread_id: provider_id.to_string(),
            message_id: message.id,
            conflicting_ids: peers.iter().map(|p| p.id).collect(),
            reason: format!(
                "subject and participants diverge from {} earlier message(s); nearest is {} days away",
                peers.len(),
                nearest.num_days()
            ),
        }))
    }

    fn business_domains(&self, message: &Message) -> HashSet<String> {
        message
            .participants()
            .filter(|p| self.policy.is_business(&p.domain))
            .map(|p| p.domain.clone())
            .collect()
    }

    /// `s:<normalized subject>|<domain>`, where the domain is the earliest
    /// one seen with this subject among the message's participants.
    fn derived_key(&mut self, message: &Message) -> Option<String> {
        let subject = message.normalized_subject.as_str();
        if is_generic_subject(subject) {
            return None;
        }

        let mut preferred = Vec::new();
        let mut fallback = Vec::new();
        for p in message.participants() {
            let anchor = match self.policy.classify(&p.domain) {
                DomainClass::Business => &p.domain,
                // Webmail is only specific per address
                DomainClass::Public => &p.address,
                DomainClass::Relay | DomainClass::Internal => {
                    if !fallback.contains(&p.domain) {
                        fallback.push(p.domain.clone());
                    }
                    continue;
                }
                DomainClass::Unknown => continue,
            };
            if !preferred.contains(anchor) {
                preferred.push(anchor.clone());
            }
        }
        let candidates = if preferred.is_empty() { fallback } else { preferred };
        let first = candidates.first()?.clone();

        let chosen = self
            .arena
            .subject_domains(subject)
            .iter()
            .find(|d| candidates.contains(d))
            .cloned()
            .unwrap_or(first);
        self.arena.record_subject_domain(subject, &chosen);
        Some(format!("s:{subject}|{chosen}"))
    }
}
