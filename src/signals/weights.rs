//! Signal kinds and their static reliability weights.

use serde::{Deserialize, Serialize};

/// One kind of evidence linking a message to an entity.
///
/// Variant order is the fixed summation order of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ThreadPropagation,
    AttachmentFingerprint,
    DomainMatch,
    AliasMatch,
    SubjectMatch,
    DateProximity,
}

impl SignalKind {
    /// All signals, strongest first.
    pub const ALL: [SignalKind; 6] = [
        SignalKind::ThreadPropagation,
        SignalKind::AttachmentFingerprint,
        SignalKind::DomainMatch,
        SignalKind::AliasMatch,
        SignalKind::SubjectMatch,
        SignalKind::DateProximity,
    ];

    /// Static reliability weight. Learned reliability counters never change it.
    pub fn weight(&self) -> f64 {
        match self {
            SignalKind::ThreadPropagation => 1.0,
            SignalKind::AttachmentFingerprint => 0.9,
            SignalKind::DomainMatch => 0.7,
            SignalKind::AliasMatch => 0.6,
            SignalKind::SubjectMatch => 0.5,
            SignalKind::DateProximity => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::ThreadPropagation => "thread_propagation",
            SignalKind::AttachmentFingerprint => "attachment_fingerprint",
            SignalKind::DomainMatch => "domain_match",
            SignalKind::AliasMatch => "alias_match",
            SignalKind::SubjectMatch => "subject_match",
            SignalKind::DateProximity => "date_proximity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        SignalKind::ALL.into_iter().find(|k| k.as_str() == s)
    }
}
