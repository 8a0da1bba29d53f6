//! Discovery: the closure of messages related to a seed, for review packets.
//!
//! Each round expands the frontier along thread membership, committed entity
//! links, shared attachment fingerprints and (optionally) the literal names of
//! entities found along the way. Recall is preferred over precision; the
//! message budget is the hard stop.
//!
//! Queries of a round run concurrently on the blocking pool. Results are
//! admitted by a single accumulator in query order, so the same corpus and
//! request always produce the same packet.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::config::DiscoveryConfig;
use crate::entity::EntityRef;
use crate::error::{EngineError, StoreError};
use crate::signals::catalog::{EntityCatalog, MIN_ALIAS_CHARS};
use crate::signals::fingerprint::is_generic_attachment;
use crate::store::MessageStore;
use crate::types::{Attachment, Message, MessageId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub seeds: Vec<MessageId>,
    /// Free text resolved through subject-fragment and alias lookups.
    #[serde(default)]
    pub query: Option<String>,
    /// What the packet is for. Echoed in the result.
    #[serde(default)]
    pub goal: String,
    /// Messages ruled out by the reviewer; never admitted nor expanded.
    #[serde(default)]
    pub exclude: BTreeSet<MessageId>,
}

impl DiscoveryRequest {
    pub fn from_messages(seeds: impl IntoIterator<Item = MessageId>, goal: &str) -> Self {
        Self {
            seeds: seeds.into_iter().collect(),
            goal: goal.to_string(),
            ..Default::default()
        }
    }

    pub fn from_query(query: &str, goal: &str) -> Self {
        Self {
            query: Some(query.to_string()),
            goal: goal.to_string(),
            ..Default::default()
        }
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = MessageId>) -> Self {
        self.exclude.extend(ids);
        self
    }

    fn query_text(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.seeds.is_empty() && self.query_text().is_none() {
            return Err(EngineError::Validation(
                "discovery needs at least one seed message or a query".to_string(),
            ));
        }
        Ok(())
    }
}

/// One store lookup. Variant order is the admission priority within a round.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DiscoveryQuery {
    Message(MessageId),
    Thread(String),
    Entity(EntityRef),
    Fingerprint(String),
    SubjectFragment(String),
    Alias(String),
}

impl DiscoveryQuery {
    pub fn describe(&self) -> String {
        match self {
            DiscoveryQuery::Message(id) => format!("seed message {id}"),
            DiscoveryQuery::Thread(thread_id) => format!("same thread {thread_id}"),
            DiscoveryQuery::Entity(entity) => format!("linked to {entity}"),
            DiscoveryQuery::Fingerprint(fp) => {
                format!("shares attachment {}", fp.chars().take(16).collect::<String>())
            }
            DiscoveryQuery::SubjectFragment(fragment) => format!("subject contains \"{fragment}\""),
            DiscoveryQuery::Alias(name) => format!("mentions \"{name}\""),
        }
    }
}

/// Why a message is in the packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub round: usize,
    pub query: DiscoveryQuery,
    /// Frontier message whose evidence issued the query; `None` for seeds.
    pub via: Option<MessageId>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredMessage {
    pub message: Message,
    pub trace: Trace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredAttachment {
    pub attachment: Attachment,
    pub round: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A round added nothing new.
    Converged,
    MaxRounds,
    BudgetReached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadGroup {
    pub thread_id: String,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityGroup {
    pub entity: EntityRef,
    pub name: Option<String>,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub goal: String,
    /// In admission order.
    pub messages: Vec<DiscoveredMessage>,
    pub attachments: Vec<DiscoveredAttachment>,
    pub by_thread: Vec<ThreadGroup>,
    pub by_entity: Vec<EntityGroup>,
    pub stop_reason: StopReason,
    /// Expansion rounds run after the seed round.
    pub rounds: usize,
    pub queries_issued: usize,
    /// Queries that failed and contributed nothing.
    pub degraded: usize,
}

impl DiscoveryResult {
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|m| m.message.id).collect()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.iter().any(|m| m.message.id == id)
    }
}

/// A message returned by a query, with its attachments.
type Hit = (Message, Vec<Attachment>);

fn load_attachments(store: &dyn MessageStore, message: &Message) -> Result<Vec<Attachment>, StoreError> {
    let mut out = Vec::with_capacity(message.attachment_ids.len());
    for id in &message.attachment_ids {
        if let Some(attachment) = store.get_attachment(*id)? {
            out.push(attachment);
        }
    }
    Ok(out)
}

fn run_query(store: &dyn MessageStore, query: &DiscoveryQuery) -> Result<Vec<Hit>, StoreError> {
    let messages = match query {
        DiscoveryQuery::Message(id) => store.get_message(*id)?.into_iter().collect(),
        DiscoveryQuery::Thread(thread_id) => store.list_messages_by_thread_id(thread_id)?,
        DiscoveryQuery::Entity(entity) => store.list_messages_linked_to(*entity)?,
        DiscoveryQuery::Fingerprint(fp) => {
            let owners: BTreeSet<MessageId> = store
                .list_attachments_by_fingerprint(fp)?
                .into_iter()
                .map(|a| a.message_id)
                .collect();
            let mut messages = Vec::with_capacity(owners.len());
            for id in owners {
                if let Some(message) = store.get_message(id)? {
                    messages.push(message);
                }
            }
            messages
        }
        DiscoveryQuery::SubjectFragment(fragment) => store.list_messages_by_subject_fragment(fragment)?,
        DiscoveryQuery::Alias(name) => store.list_messages_by_alias(name)?,
    };

    messages
        .into_iter()
        .map(|m| {
            let attachments = load_attachments(store, &m)?;
            Ok((m, attachments))
        })
        .collect()
}

/// Single-threaded state of one discovery run.
struct Accumulator {
    budget: usize,
    exclude: BTreeSet<MessageId>,
    issued: HashSet<DiscoveryQuery>,
    admitted: HashSet<MessageId>,
    messages: Vec<DiscoveredMessage>,
    attachments: Vec<DiscoveredAttachment>,
    attachments_by_message: BTreeMap<MessageId, Vec<usize>>,
    seen_entities: BTreeSet<EntityRef>,
    degraded: usize,
}

impl Accumulator {
    fn new(request: &DiscoveryRequest, budget: usize) -> Self {
        Self {
            budget,
            exclude: request.exclude.clone(),
            issued: HashSet::new(),
            admitted: HashSet::new(),
            messages: Vec::new(),
            attachments: Vec::new(),
            attachments_by_message: BTreeMap::new(),
            seen_entities: BTreeSet::new(),
            degraded: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.messages.len() >= self.budget
    }

    /// Admit query results in query order. Returns the indexes of newly
    /// admitted messages.
    fn admit(
        &mut self,
        round: usize,
        results: BTreeMap<DiscoveryQuery, (Option<MessageId>, Vec<Hit>)>,
    ) -> Vec<usize> {
        let mut fresh = Vec::new();
        for (query, (via, hits)) in results {
            for (message, attachments) in hits {
                if self.is_full() {
                    return fresh;
                }
                if self.exclude.contains(&message.id) || !self.admitted.insert(message.id) {
                    continue;
                }
                let indexes = self.attachments_by_message.entry(message.id).or_default();
                for attachment in attachments {
                    indexes.push(self.attachments.len());
                    self.attachments.push(DiscoveredAttachment { attachment, round });
                }
                fresh.push(self.messages.len());
                self.messages.push(DiscoveredMessage {
                    message,
                    trace: Trace {
                        round,
                        query: query.clone(),
                        via,
                        reason: query.describe(),
                    },
                });
            }
        }
        fresh
    }

    /// Queries the newly admitted messages give rise to, each with the first
    /// message that produced it.
    fn expand(
        &mut self,
        fresh: &[usize],
        catalog: &EntityCatalog,
        derive_names: bool,
    ) -> BTreeMap<DiscoveryQuery, Option<MessageId>> {
        let mut next: BTreeMap<DiscoveryQuery, Option<MessageId>> = BTreeMap::new();
        let mut push = |query: DiscoveryQuery, via: MessageId, issued: &HashSet<DiscoveryQuery>| {
            if !issued.contains(&query) {
                next.entry(query).or_insert(Some(via));
            }
        };

        for &i in fresh {
            let message = &self.messages[i].message;
            let id = message.id;

            if let Some(ref thread_id) = message.thread_id {
                push(DiscoveryQuery::Thread(thread_id.clone()), id, &self.issued);
            }

            for entity in message.links.entities() {
                push(DiscoveryQuery::Entity(entity), id, &self.issued);
                if !self.seen_entities.insert(entity) || !derive_names {
                    continue;
                }
                let Some(profile) = catalog.get(entity) else {
                    continue;
                };
                let names = std::iter::once(profile.name.as_str())
                    .chain(profile.aliases.iter().map(|a| a.alias.as_str()));
                for name in names {
                    let name = name.trim();
                    if name.chars().filter(|c| c.is_alphanumeric()).count() >= MIN_ALIAS_CHARS {
                        push(DiscoveryQuery::Alias(name.to_string()), id, &self.issued);
                    }
                }
            }

            for &a in self.attachments_by_message.get(&id).into_iter().flatten() {
                let attachment = &self.attachments[a].attachment;
                if is_generic_attachment(&attachment.name) {
                    continue;
                }
                for fp in attachment.fingerprints() {
                    push(DiscoveryQuery::Fingerprint(fp.to_string()), id, &self.issued);
                }
            }
        }
        next
    }

    fn finish(self, goal: String, stop_reason: StopReason, rounds: usize, catalog: &EntityCatalog) -> DiscoveryResult {
        let mut threads: BTreeMap<String, Vec<MessageId>> = BTreeMap::new();
        let mut entities: BTreeMap<EntityRef, Vec<MessageId>> = BTreeMap::new();
        for discovered in &self.messages {
            let message = &discovered.message;
            if let Some(ref thread_id) = message.thread_id {
                threads.entry(thread_id.clone()).or_default().push(message.id);
            }
            for entity in message.links.entities() {
                entities.entry(entity).or_default().push(message.id);
            }
        }

        DiscoveryResult {
            goal,
            messages: self.messages,
            attachments: self.attachments,
            by_thread: threads
                .into_iter()
                .map(|(thread_id, mut message_ids)| {
                    message_ids.sort_unstable();
                    ThreadGroup { thread_id, message_ids }
                })
                .collect(),
            by_entity: entities
                .into_iter()
                .map(|(entity, mut message_ids)| {
                    message_ids.sort_unstable();
                    EntityGroup {
                        entity,
                        name: catalog.get(entity).map(|p| p.name.clone()),
                        message_ids,
                    }
                })
                .collect(),
            stop_reason,
            rounds,
            queries_issued: self.issued.len(),
            degraded: self.degraded,
        }
    }
}

/// Runs discovery requests against a shared store.
pub struct Discovery {
    store: Arc<dyn MessageStore>,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(store: Arc<dyn MessageStore>, config: DiscoveryConfig) -> Self {
        Self { store, config }
    }

    pub async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResult, EngineError> {
        request.validate()?;
        let mut acc = Accumulator::new(&request, self.config.message_budget);

        let store = Arc::clone(&self.store);
        let catalog = match tokio::task::spawn_blocking(move || EntityCatalog::load(store.as_ref())).await {
            Ok(Ok(catalog)) => catalog,
            Ok(Err(e)) => {
                log::warn!("Discovery: entity catalog unavailable, name queries disabled: {}", e);
                acc.degraded += 1;
                EntityCatalog::default()
            }
            Err(e) => return Err(EngineError::Worker(e.to_string())),
        };

        let mut queries: BTreeMap<DiscoveryQuery, Option<MessageId>> = BTreeMap::new();
        for id in &request.seeds {
            if !request.exclude.contains(id) {
                queries.insert(DiscoveryQuery::Message(*id), None);
            }
        }
        if let Some(text) = request.query_text() {
            queries.insert(DiscoveryQuery::SubjectFragment(text.to_string()), None);
            queries.insert(DiscoveryQuery::Alias(text.to_string()), None);
        }

        let mut round = 0;
        let stop_reason = loop {
            let results = self.run_round(queries, &mut acc).await;
            let fresh = acc.admit(round, results);
            log::debug!("Discovery round {}: {} new messages", round, fresh.len());

            if acc.is_full() {
                break StopReason::BudgetReached;
            }
            if fresh.is_empty() {
                break StopReason::Converged;
            }
            if round >= self.config.max_rounds {
                break StopReason::MaxRounds;
            }
            queries = acc.expand(&fresh, &catalog, self.config.derive_name_queries);
            if queries.is_empty() {
                break StopReason::Converged;
            }
            round += 1;
        };

        let result = acc.finish(request.goal, stop_reason, round, &catalog);
        log::info!(
            "Discovery finished: {} messages, {} attachments, {} rounds, {:?}, {} degraded queries",
            result.messages.len(),
            result.attachments.len(),
            result.rounds,
            result.stop_reason,
            result.degraded
        );
        Ok(result)
    }

    /// Issue every not-yet-issued query concurrently and collect the
    /// successful ones keyed by query.
    async fn run_round(
        &self,
        queries: BTreeMap<DiscoveryQuery, Option<MessageId>>,
        acc: &mut Accumulator,
    ) -> BTreeMap<DiscoveryQuery, (Option<MessageId>, Vec<Hit>)> {
        let mut set = JoinSet::new();
        for (query, via) in queries {
            if !acc.issued.insert(query.clone()) {
                continue;
            }
            let store = Arc::clone(&self.store);
            set.spawn_blocking(move || {
                let result = run_query(store.as_ref(), &query);
                (query, via, result)
            });
        }

        let mut done = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((query, via, Ok(hits))) => {
                    done.insert(query, (via, hits));
                }
                Ok((query, _, Err(e))) => {
                    log::warn!("Discovery query {:?} failed: {}", query, e);
                    acc.degraded += 1;
                }
                Err(e) => {
                    log::warn!("Discovery query task failed: {}", e);
                    acc.degraded += 1;
                }
            }
        }
        done
    }
}
