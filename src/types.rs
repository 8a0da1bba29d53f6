//! Core records the engine reads and the link states it writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityRef, EntityType};
use crate::signals::weights::SignalKind;

pub type MessageId = i64;
pub type AttachmentId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Sender,
    To,
    Cc,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Sender => "sender",
            ParticipantRole::To => "to",
            ParticipantRole::Cc => "cc",
        }
    }
}

/// One address on a message, normalized at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub address: String,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub role: ParticipantRole,
}

impl Participant {
    /// Build a participant from a raw address, deriving the domain.
    pub fn new(address: &str, name: Option<&str>, role: ParticipantRole) -> Self {
        let address = address.trim().to_lowercase();
        let domain = address
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_default();
        Self {
            address,
            domain,
            name: name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            role,
        }
    }
}

/// An ingested message. Only `thread_id` and the link states are ever
/// written by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub provider_thread_id: Option<String>,
    pub subject: String,
    pub normalized_subject: String,
    pub sender: Participant,
    pub recipients: Vec<Participant>,
    /// Sender of the embedded original when this message is a forward.
    pub original_sender: Option<Participant>,
    pub is_forward: bool,
    pub received_at: DateTime<Utc>,
    pub body: String,
    pub attachment_ids: Vec<AttachmentId>,
    /// Resolved thread id, `None` until the thread resolver has run.
    pub thread_id: Option<String>,
    pub links: MessageLinks,
}

impl Message {
    /// Sender that should count for attribution: the original sender of a
    /// forward when ingestion found one, otherwise the envelope sender.
    pub fn effective_sender(&self) -> &Participant {
        self.original_sender.as_ref().unwrap_or(&self.sender)
    }

    /// All participants, effective sender first.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        std::iter::once(self.effective_sender())
            .chain(self.original_sender.as_ref().map(|_| &self.sender))
            .chain(self.recipients.iter())
    }
}

/// An attachment row. Bytes live elsewhere; only fingerprints are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: AttachmentId,
    pub message_id: MessageId,
    pub name: String,
    pub content_type: Option<String>,
    pub size: i64,
    /// Raw byte hash supplied by ingestion.
    pub content_hash: String,
    pub extracted_text: Option<String>,
    /// Hash of the normalized extracted text; catches re-exported copies.
    pub text_fingerprint: Option<String>,
}

impl Attachment {
    /// Every fingerprint this attachment can be matched on.
    pub fn fingerprints(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(2);
        if !self.content_hash.is_empty() {
            out.push(self.content_hash.as_str());
        }
        if let Some(ref fp) = self.text_fingerprint {
            out.push(fp.as_str());
        }
        out
    }
}

/// Per-signal share of an automatic decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalContribution {
    pub signal: SignalKind,
    pub score: f64,
    pub weight: f64,
    pub rationale: String,
}

impl SignalContribution {
    pub fn weighted(&self) -> f64 {
        self.score * self.weight
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomaticLink {
    pub entity: EntityRef,
    pub score: f64,
    pub breakdown: Vec<SignalContribution>,
    pub decided_at: DateTime<Utc>,
}

impl AutomaticLink {
    /// True if the strongest contribution came from the message's own
    /// evidence rather than from a thread sibling.
    pub fn is_anchored(&self) -> bool {
        self.breakdown
            .iter()
            .max_by(|a, b| {
                a.weighted()
                    .partial_cmp(&b.weighted())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|c| c.signal != SignalKind::ThreadPropagation)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideLink {
    pub entity: EntityRef,
    pub actor: String,
    pub reason: String,
    pub overridden_at: DateTime<Utc>,
}

/// Link state of one message slot. An override and an automatic link can
/// never coexist because they are variants of the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Unresolved,
    Automatic(AutomaticLink),
    Overridden(OverrideLink),
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Unresolved => "unresolved",
            LinkState::Automatic(_) => "automatic",
            LinkState::Overridden(_) => "overridden",
        }
    }

    /// The linked entity, if any.
    pub fn entity(&self) -> Option<EntityRef> {
        match self {
            LinkState::Unresolved => None,
            LinkState::Automatic(a) => Some(a.entity),
            LinkState::Overridden(o) => Some(o.entity),
        }
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            LinkState::Automatic(a) => Some(a.score),
            _ => None,
        }
    }

    pub fn is_overridden(&self) -> bool {
        matches!(self, LinkState::Overridden(_))
    }

    /// Committed links that thread propagation may copy to siblings.
    pub fn anchored_entity(&self) -> Option<EntityRef> {
        match self {
            LinkState::Overridden(o) => Some(o.entity),
            LinkState::Automatic(a) if a.is_anchored() => Some(a.entity),
            _ => None,
        }
    }
}

/// Link state of one slot plus its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VersionedLink {
    pub state: LinkState,
    pub version: i64,
}

/// Both link slots of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageLinks {
    pub account: LinkState,
    pub project: LinkState,
}

impl MessageLinks {
    pub fn slot(&self, slot: EntityType) -> &LinkState {
        match slot {
            EntityType::Account => &self.account,
            EntityType::Project => &self.project,
        }
    }

    pub fn slot_mut(&mut self, slot: EntityType) -> &mut LinkState {
        match slot {
            EntityType::Account => &mut self.account,
            EntityType::Project => &mut self.project,
        }
    }

    /// Every entity this message is committed to, across slots.
    pub fn entities(&self) -> Vec<EntityRef> {
        EntityType::ALL
            .iter()
            .filter_map(|slot| self.slot(*slot).entity())
            .collect()
    }
}

/// Result of a compare-and-set link write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Committed { version: i64 },
    /// Someone else wrote the slot since it was read.
    VersionConflict { current: i64 },
    /// The slot holds an override; automatic writes never touch it.
    Overridden,
}

/// Result of a recorded override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideOutcome {
    pub override_id: String,
    /// Earlier override on the same slot that this one superseded.
    pub superseded: Option<String>,
    /// Link state before the override, usually the retracted automatic link.
    pub previous: LinkState,
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(signal: SignalKind, score: f64, weight: f64) -> SignalContribution {
        SignalContribution { signal, score, weight, rationale: String::new() }
    }

    #[test]
    fn test_participant_new_derives_domain() {
        let p = Participant::new(" Jane@Acme.COM ", Some("Jane "), ParticipantRole::Sender);
        assert_eq!(p.address, "jane@acme.com");
        assert_eq!(p.domain, "acme.com");
        assert_eq!(p.name.as_deref(), Some("Jane"));

        let bad = Participant::new("not-an-address", None, ParticipantRole::To);
        assert_eq!(bad.domain, "");
    }

    #[test]
    fn test_link_state_serializes_tagged() {
        let state = LinkState::Overridden(OverrideLink {
            entity: EntityRef::project(4),
            actor: "ops@desert.net".into(),
            reason: "wrong phase".into(),
            overridden_at: Utc::now(),
        });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "overridden");
        let back: LinkState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_propagated_link_is_not_anchored() {
        let propagated = AutomaticLink {
            entity: EntityRef::project(1),
            score: 1.0,
            breakdown: vec![contribution(SignalKind::ThreadPropagation, 1.0, 1.0)],
            decided_at: Utc::now(),
        };
        assert!(!propagated.is_anchored());

        let own = AutomaticLink {
            breakdown: vec![
                contribution(SignalKind::SubjectMatch, 1.0, 0.5),
                contribution(SignalKind::DateProximity, 1.0, 0.1),
            ],
            ..propagated
        };
        assert!(own.is_anchored());
        assert_eq!(LinkState::Automatic(own).anchored_entity(), Some(EntityRef::project(1)));
    }

    #[test]
    fn test_message_links_entities() {
        let mut links = MessageLinks::default();
        assert!(links.entities().is_empty());
        *links.slot_mut(EntityType::Account) = LinkState::Overridden(OverrideLink {
            entity: EntityRef::account(9),
            actor: "a".into(),
            reason: "r".into(),
            overridden_at: Utc::now(),
        });
        assert_eq!(links.entities(), vec![EntityRef::account(9)]);
    }
}
