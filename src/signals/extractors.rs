//! Signal extractors.
//!
//! Each extractor scores one kind of evidence for one (message, candidate)
//! pair and returns `(score in [0, 1], rationale)` or `None`. Extractors are
//! plain functions registered in [`EXTRACTORS`]; the table order is the
//! reliability order.
//!
//! Evidence that needs the store (sibling links, fingerprint matches) is
//! gathered up front by [`gather_evidence`]. A store failure empties only
//! the affected signal and is reported back as missing data.

use std::collections::{HashMap, HashSet};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::domains::DomainPolicy;
use crate::entity::{EntityRef, EntityType};
use crate::store::MessageStore;
use crate::threads::subject::normalize_phrase;
use crate::types::{AttachmentId, Message, MessageId, Participant};

use super::catalog::{CandidateProfile, EntityCatalog};
use super::fingerprint::is_generic_attachment;
use super::weights::SignalKind;

/// Jaro-Winkler similarity at which a subject token counts as a name token.
const FUZZY_TOKEN_THRESHOLD: f64 = 0.92;
/// Tokens shorter than this must match exactly.
const FUZZY_MIN_LEN: usize = 5;
const PARTIAL_SUBJECT_CEILING: f64 = 0.6;
const RECIPIENT_DOMAIN_SCORE: f64 = 0.8;
const PROJECT_DOMAIN_FACTOR: f64 = 0.5;
const TEXT_FINGERPRINT_SCORE: f64 = 0.85;

/// One scored piece of evidence for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalTuple {
    pub entity: EntityRef,
    pub signal: SignalKind,
    pub score: f64,
    pub rationale: String,
}

/// An attachment on another, already linked message sharing a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintHit {
    pub attachment_id: AttachmentId,
    pub other_message_id: MessageId,
    pub entity: EntityRef,
    /// True for a raw byte hash match, false for a text-only match.
    pub exact: bool,
}

/// Store-backed evidence for one message, gathered before extraction.
#[derive(Debug, Clone, Default)]
pub struct MessageEvidence {
    /// Anchored links of thread siblings, any slot.
    pub thread_links: Vec<(MessageId, EntityRef)>,
    pub fingerprint_hits: Vec<FingerprintHit>,
    /// Signals whose evidence could not be loaded.
    pub missing: Vec<SignalKind>,
}

/// Per-message text, normalized once.
pub struct MessageView<'a> {
    pub message: &'a Message,
    padded_subject: String,
    subject_tokens: Vec<String>,
    padded_body: String,
    padded_sender_names: String,
}

impl<'a> MessageView<'a> {
    pub fn new(message: &'a Message) -> Self {
        let subject = normalize_phrase(&message.normalized_subject);
        let subject_tokens = subject.split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect();
        let names = [Some(&message.sender), message.original_sender.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|p| p.name.as_deref())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            message,
            padded_subject: format!(" {subject} "),
            subject_tokens,
            padded_body: format!(" {} ", normalize_phrase(&message.body)),
            padded_sender_names: format!(" {} ", normalize_phrase(&names)),
        }
    }
}

pub struct ExtractionContext<'a> {
    pub evidence: &'a MessageEvidence,
    pub policy: &'a DomainPolicy,
    pub date_grace: Duration,
}

pub type ExtractorFn = fn(&MessageView<'_>, &CandidateProfile, &ExtractionContext<'_>) -> Option<(f64, String)>;

pub struct Extractor {
    pub signal: SignalKind,
    pub score: ExtractorFn,
    /// Only run when another extractor already produced evidence for the candidate.
    pub corroborating_only: bool,
}

/// The fixed extractor table, strongest signal first.
pub const EXTRACTORS: &[Extractor] = &[
    Extractor { signal: SignalKind::ThreadPropagation, score: thread_propagation, corroborating_only: false },
    Extractor { signal: SignalKind::AttachmentFingerprint, score: attachment_fingerprint, corroborating_only: false },
    Extractor { signal: SignalKind::DomainMatch, score: domain_match, corroborating_only: false },
    Extractor { signal: SignalKind::AliasMatch, score: alias_match, corroborating_only: false },
    Extractor { signal: SignalKind::SubjectMatch, score: subject_match, corroborating_only: false },
    Extractor { signal: SignalKind::DateProximity, score: date_proximity, corroborating_only: true },
];

/// Run every extractor against every candidate of `slot`.
pub fn extract(
    message: &Message,
    slot: EntityType,
    catalog: &EntityCatalog,
    ctx: &ExtractionContext<'_>,
) -> Vec<SignalTuple> {
    let view = MessageView::new(message);
    let mut out = Vec::new();
    for candidate in catalog.candidates(slot) {
        let mut found = false;
        for extractor in EXTRACTORS {
            if extractor.corroborating_only && !found {
                continue;
            }
            if let Some((score, rationale)) = (extractor.score)(&view, candidate, ctx) {
                let score = score.clamp(0.0, 1.0);
                if score <= 0.0 {
                    continue;
                }
                found = true;
                out.push(SignalTuple {
                    entity: candidate.entity,
                    signal: extractor.signal,
                    score,
                    rationale,
                });
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

fn thread_propagation(
    _view: &MessageView<'_>,
    candidate: &CandidateProfile,
    ctx: &ExtractionContext<'_>,
) -> Option<(f64, String)> {
    let sibling = ctx
        .evidence
        .thread_links
        .iter()
        .find(|(_, entity)| *entity == candidate.entity)?;
    Some((1.0, format!("thread sibling {} is linked to {}", sibling.0, candidate.name)))
}

fn attachment_fingerprint(
    _view: &MessageView<'_>,
    candidate: &CandidateProfile,
    ctx: &ExtractionContext<'_>,
) -> Option<(f64, String)> {
    let hits: Vec<&FingerprintHit> = ctx
        .evidence
        .fingerprint_hits
        .iter()
        .filter(|h| h.entity == candidate.entity)
        .collect();
    let best = hits.iter().find(|h| h.exact).or_else(|| hits.first())?;
    let (score, kind) = if best.exact {
        (1.0, "identical")
    } else {
        (TEXT_FINGERPRINT_SCORE, "same text as")
    };
    Some((
        score,
        format!(
            "attachment {} is {} one on message {}",
            best.attachment_id, kind, best.other_message_id
        ),
    ))
}

fn domain_matches(participant: &Participant, domain: &str) -> bool {
    participant.domain == domain || participant.domain.ends_with(&format!(".{domain}"))
}

fn domain_match(
    view: &MessageView<'_>,
    candidate: &CandidateProfile,
    ctx: &ExtractionContext<'_>,
) -> Option<(f64, String)> {
    let domain = candidate.domain.as_deref()?;
    if !ctx.policy.is_business(domain) {
        return None;
    }
    let message = view.message;
    let senders = [Some(&message.sender), message.original_sender.as_ref()];
    let (score, who) = if senders.into_iter().flatten().any(|p| domain_matches(p, domain)) {
        (1.0, "sender")
    } else if message.recipients.iter().any(|p| domain_matches(p, domain)) {
        (RECIPIENT_DOMAIN_SCORE, "recipient")
    } else {
        return None;
    };

    match candidate.entity.entity_type {
        EntityType::Account => Some((score, format!("{who} domain is {domain}"))),
        EntityType::Project => Some((
            score * PROJECT_DOMAIN_FACTOR,
            format!("{who} domain {domain} belongs to the owning account"),
        )),
    }
}

fn alias_match(
    view: &MessageView<'_>,
    candidate: &CandidateProfile,
    _ctx: &ExtractionContext<'_>,
) -> Option<(f64, String)> {
    let mut best: Option<(f64, String)> = None;
    for alias in &candidate.aliases {
        let place = if view.padded_sender_names.contains(&alias.padded) {
            "sender name"
        } else if view.padded_body.contains(&alias.padded) {
            "body"
        } else {
            continue;
        };
        if best.as_ref().map_or(true, |(s, _)| alias.specificity > *s) {
            best = Some((alias.specificity, format!("alias \"{}\" in {}", alias.alias, place)));
        }
    }
    best
}

fn subject_match(
    view: &MessageView<'_>,
    candidate: &CandidateProfile,
    _ctx: &ExtractionContext<'_>,
) -> Option<(f64, String)> {
    if candidate.tokens.is_empty() || candidate.padded_name.trim().is_empty() {
        return None;
    }
    if view.padded_subject.contains(&candidate.padded_name) {
        return Some((1.0, format!("subject contains \"{}\"", candidate.name)));
    }

    let found = candidate
        .tokens
        .iter()
        .filter(|token| {
            view.subject_tokens.iter().any(|s| {
                s == *token
                    || (token.chars().count() >= FUZZY_MIN_LEN
                        && s.chars().count() >= FUZZY_MIN_LEN
                        && strsim::jaro_winkler(token, s) >= FUZZY_TOKEN_THRESHOLD)
            })
        })
        .count();
    if found == 0 {
        return None;
    }
    let fraction = found as f64 / candidate.tokens.len() as f64;
    Some((
        PARTIAL_SUBJECT_CEILING * fraction,
        format!("subject has {}/{} tokens of \"{}\"", found, candidate.tokens.len(), candidate.name),
    ))
}

fn date_proximity(
    view: &MessageView<'_>,
    candidate: &CandidateProfile,
    ctx: &ExtractionContext<'_>,
) -> Option<(f64, String)> {
    let first = candidate.first_seen_at?;
    let last = candidate.last_seen_at.unwrap_or(first);
    let at = view.message.received_at;
    if at >= first - ctx.date_grace && at <= last + ctx.date_grace {
        Some((1.0, format!("within the active window of {}", candidate.name)))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Evidence gathering
// ---------------------------------------------------------------------------

/// Load the store-backed evidence for `message`. Never fails: a failed
/// lookup is logged and recorded in `missing`.
pub fn gather_evidence(message: &Message, store: &dyn MessageStore) -> MessageEvidence {
    let mut evidence = MessageEvidence::default();

    if let Some(ref thread_id) = message.thread_id {
        match store.list_messages_by_thread_id(thread_id) {
            Ok(siblings) => {
                for sibling in siblings.iter().filter(|s| s.id != message.id) {
                    for slot in EntityType::ALL {
                        if let Some(entity) = sibling.links.slot(slot).anchored_entity() {
                            evidence.thread_links.push((sibling.id, entity));
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("Thread evidence unavailable for message {}: {}", message.id, e);
                evidence.missing.push(SignalKind::ThreadPropagation);
            }
        }
    }

    if !message.attachment_ids.is_empty() {
        match fingerprint_hits(message, store) {
            Ok(hits) => evidence.fingerprint_hits = hits,
            Err(e) => {
                log::warn!("Fingerprint evidence unavailable for message {}: {}", message.id, e);
                evidence.missing.push(SignalKind::AttachmentFingerprint);
            }
        }
    }

    evidence
}

fn fingerprint_hits(
    message: &Message,
    store: &dyn MessageStore,
) -> Result<Vec<FingerprintHit>, crate::error::StoreError> {
    let mut hits = Vec::new();
    let mut seen: HashSet<(AttachmentId, MessageId, EntityRef)> = HashSet::new();
    let mut linked: HashMap<MessageId, Vec<EntityRef>> = HashMap::new();

    for attachment_id in &message.attachment_ids {
        let Some(attachment) = store.get_attachment(*attachment_id)? else {
            continue;
        };
        if is_generic_attachment(&attachment.name) {
            continue;
        }
        for fingerprint in attachment.fingerprints() {
            for other in store.list_attachments_by_fingerprint(fingerprint)? {
                if other.message_id == message.id {
                    continue;
                }
                if !linked.contains_key(&other.message_id) {
                    let entities = store
                        .get_message(other.message_id)?
                        .map(|m| m.links.entities())
                        .unwrap_or_default();
                    linked.insert(other.message_id, entities);
                }
                let exact = !attachment.content_hash.is_empty() && other.content_hash == attachment.content_hash;
                for entity in linked.get(&other.message_id).into_iter().flatten() {
                    if seen.insert((attachment.id, other.message_id, *entity)) {
                        hits.push(FingerprintHit {
                            attachment_id: attachment.id,
                            other_message_id: other.message_id,
                            entity: *entity,
                            exact,
                        });
                    } else if exact {
                        // An earlier text-only hit on the same pair is upgraded
                        if let Some(hit) = hits.iter_mut().find(|h| {
                            h.attachment_id == attachment.id
                                && h.other_message_id == other.message_id
                                && h.entity == *entity
                        }) {
                            hit.exact = true;
                        }
                    }
                }
            }
        }
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::test_utils::{sample_message, ts};
    use crate::db::NewAttachment;
    use crate::entity::{Account, Alias, Project};
    use crate::threads::subject::normalize_subject;
    use crate::types::{AutomaticLink, LinkState, MessageLinks, ParticipantRole, SignalContribution};

    fn message(subject: &str, from: &str, to: &str, body: &str) -> Message {
        Message {
            id: 1,
            provider_thread_id: None,
            subject: subject.to_string(),
            normalized_subject: normalize_subject(subject),
            sender: Participant::new(from, None, ParticipantRole::Sender),
            recipients: vec![Participant::new(to, None, ParticipantRole::To)],
            original_sender: None,
            is_forward: false,
            received_at: ts("2025-04-10T09:00:00Z"),
            body: body.to_string(),
            attachment_ids: Vec::new(),
            thread_id: None,
            links: MessageLinks::default(),
        }
    }

    fn project(id: i64, name: &str, account_id: Option<i64>) -> Project {
        Project {
            id,
            name: name.to_string(),
            normalized_name: normalize_phrase(name),
            account_id,
            first_seen_at: Some(ts("2025-03-01T00:00:00Z")),
            last_seen_at: Some(ts("2025-04-01T00:00:00Z")),
            message_count: 3,
        }
    }

    fn catalog() -> EntityCatalog {
        let accounts = vec![Account {
            id: 1,
            domain: "acme.com".into(),
            name: "Acme Builders".into(),
            first_seen_at: None,
            last_seen_at: None,
            message_count: 0,
        }];
        let projects = vec![
            project(10, "Kiwanis Park", Some(1)),
            project(11, "Kiwanis Elementary", None),
        ];
        let aliases = vec![Alias {
            id: 1,
            alias: "KP Rebuild".into(),
            target: EntityRef::project(10),
            specificity: 0.8,
        }];
        EntityCatalog::build(&accounts, &projects, &aliases)
    }

    fn run(message: &Message, slot: EntityType, evidence: &MessageEvidence) -> Vec<SignalTuple> {
        let policy = DomainPolicy::from_config(&EngineConfig::default());
        let ctx = ExtractionContext { evidence, policy: &policy, date_grace: Duration::days(14) };
        extract(message, slot, &catalog(), &ctx)
    }

    fn find(tuples: &[SignalTuple], entity: EntityRef, signal: SignalKind) -> Option<f64> {
        tuples.iter().find(|t| t.entity == entity && t.signal == signal).map(|t| t.score)
    }

    #[test]
    fn test_extractor_table_in_weight_order() {
        let kinds: Vec<SignalKind> = EXTRACTORS.iter().map(|e| e.signal).collect();
        assert_eq!(kinds, SignalKind::ALL.to_vec());
    }

    #[test]
    fn test_full_name_in_subject() {
        let m = message("RE: Kiwanis Park - revised bid", "est@desert.net", "pm@other.org", "");
        let tuples = run(&m, EntityType::Project, &MessageEvidence::default());
        assert_eq!(find(&tuples, EntityRef::project(10), SignalKind::SubjectMatch), Some(1.0));
        // Corroborated by the active window
        assert_eq!(find(&tuples, EntityRef::project(10), SignalKind::DateProximity), Some(1.0));
    }

    #[test]
    fn test_shared_token_scores_both_projects_low() {
        let m = message("Kiwanis question", "someone@gmail.com", "est@desert.net", "");
        let tuples = run(&m, EntityType::Project, &MessageEvidence::default());
        let park = find(&tuples, EntityRef::project(10), SignalKind::SubjectMatch).unwrap();
        let school = find(&tuples, EntityRef::project(11), SignalKind::SubjectMatch).unwrap();
        assert!((park - 0.3).abs() < 1e-9);
        assert!((school - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_fuzzy_token_tolerates_typo() {
        let m = message("Kiwannis Park walkthrough", "a@b.org", "c@d.org", "");
        let tuples = run(&m, EntityType::Project, &MessageEvidence::default());
        let score = find(&tuples, EntityRef::project(10), SignalKind::SubjectMatch).unwrap();
        assert!((score - PARTIAL_SUBJECT_CEILING).abs() < 1e-9, "both tokens matched: {score}");
    }

    #[test]
    fn test_domain_match_account_and_project() {
        let m = message("Schedule", "pm@acme.com", "est@desert.net", "");
        let accounts = run(&m, EntityType::Account, &MessageEvidence::default());
        assert_eq!(find(&accounts, EntityRef::account(1), SignalKind::DomainMatch), Some(1.0));

        let projects = run(&m, EntityType::Project, &MessageEvidence::default());
        assert_eq!(
            find(&projects, EntityRef::project(10), SignalKind::DomainMatch),
            Some(PROJECT_DOMAIN_FACTOR)
        );
        assert_eq!(find(&projects, EntityRef::project(11), SignalKind::DomainMatch), None);

        let recipient = message("Schedule", "est@desert.net", "pm@site.acme.com", "");
        let accounts = run(&recipient, EntityType::Account, &MessageEvidence::default());
        assert_eq!(
            find(&accounts, EntityRef::account(1), SignalKind::DomainMatch),
            Some(RECIPIENT_DOMAIN_SCORE)
        );
    }

    #[test]
    fn test_alias_requires_word_boundary() {
        let m = message("Docs", "a@b.org", "c@d.org", "Attached the KP rebuild schedule.");
        let tuples = run(&m, EntityType::Project, &MessageEvidence::default());
        assert_eq!(find(&tuples, EntityRef::project(10), SignalKind::AliasMatch), Some(0.8));

        let glued = message("Docs", "a@b.org", "c@d.org", "see KP rebuilding notes");
        let tuples = run(&glued, EntityType::Project, &MessageEvidence::default());
        assert_eq!(find(&tuples, EntityRef::project(10), SignalKind::AliasMatch), None);
    }

    #[test]
    fn test_date_proximity_never_stands_alone() {
        let m = message("Lunch", "a@b.org", "c@d.org", "");
        let tuples = run(&m, EntityType::Project, &MessageEvidence::default());
        assert!(tuples.is_empty(), "date proximity alone is not evidence: {tuples:?}");
    }

    #[test]
    fn test_thread_and_fingerprint_evidence() {
        let m = message("Lunch", "a@b.org", "c@d.org", "");
        let evidence = MessageEvidence {
            thread_links: vec![(7, EntityRef::project(11)), (7, EntityRef::account(1))],
            fingerprint_hits: vec![
                FingerprintHit { attachment_id: 3, other_message_id: 8, entity: EntityRef::project(10), exact: false },
                FingerprintHit { attachment_id: 3, other_message_id: 9, entity: EntityRef::project(10), exact: true },
            ],
            missing: Vec::new(),
        };
        let tuples = run(&m, EntityType::Project, &evidence);
        assert_eq!(find(&tuples, EntityRef::project(11), SignalKind::ThreadPropagation), Some(1.0));
        assert_eq!(find(&tuples, EntityRef::project(10), SignalKind::AttachmentFingerprint), Some(1.0));
        assert!(tuples.iter().all(|t| t.entity.entity_type == EntityType::Project));
    }

    #[test]
    fn test_gather_evidence_from_store() {
        let db = crate::db::test_utils::test_db();
        let p = EntityRef::project(10);

        db.insert_message(&sample_message(1, "Bid", "pm@acme.com", "est@desert.net", "2025-04-01T10:00:00Z"))
            .unwrap();
        db.insert_message(&sample_message(2, "Fwd: Bid", "est@desert.net", "x@y.org", "2025-04-02T10:00:00Z"))
            .unwrap();
        db.insert_message(&sample_message(3, "logo", "est@desert.net", "x@y.org", "2025-04-03T10:00:00Z"))
            .unwrap();
        for (id, message_id, name) in [(1, 1, "takeoff.pdf"), (2, 2, "takeoff.pdf"), (3, 2, "image001.png"), (4, 3, "image001.png")] {
            db.insert_attachment(&NewAttachment {
                id,
                message_id,
                name: name.into(),
                content_type: None,
                size: 10,
                content_hash: if name == "takeoff.pdf" { "abc".into() } else { "logo".into() },
                extracted_text: None,
            })
            .unwrap();
        }
        let link_to = |entity: EntityRef| {
            LinkState::Automatic(AutomaticLink {
                entity,
                score: 0.6,
                breakdown: vec![SignalContribution {
                    signal: SignalKind::AliasMatch,
                    score: 1.0,
                    weight: 0.6,
                    rationale: "alias".into(),
                }],
                decided_at: ts("2025-04-01T11:00:00Z"),
            })
        };
        db.record_link(1, EntityType::Project, 0, &link_to(p)).unwrap();
        db.record_link(3, EntityType::Project, 0, &link_to(EntityRef::project(11))).unwrap();

        let message = db.get_message(2).unwrap().unwrap();
        let evidence = gather_evidence(&message, &db);
        assert!(evidence.missing.is_empty());
        assert!(evidence.thread_links.is_empty(), "message has no thread yet");
        assert_eq!(evidence.fingerprint_hits.len(), 1, "generic logo is ignored");
        let hit = &evidence.fingerprint_hits[0];
        assert_eq!((hit.other_message_id, hit.entity, hit.exact), (1, p, true));
    }
}
