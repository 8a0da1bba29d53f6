//! Linkable entities: domain-keyed accounts and the projects run for them.
//!
//! A message carries one link state per entity type ("slot"), so the entity
//! type doubles as the slot key in storage and in the aggregator.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of entity a message can be linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Account,
    Project,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::Account, EntityType::Project];

    /// String label for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Account => "account",
            EntityType::Project => "project",
        }
    }

    /// Parse from SQL string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "account" => Some(EntityType::Account),
            "project" => Some(EntityType::Project),
            _ => None,
        }
    }
}

/// A typed reference to an account or project row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: i64,
}

impl EntityRef {
    pub fn account(id: i64) -> Self {
        Self { entity_type: EntityType::Account, entity_id: id }
    }

    pub fn project(id: i64) -> Self {
        Self { entity_type: EntityType::Project, entity_id: id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type.as_str(), self.entity_id)
    }
}

/// A row from the `accounts` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: i64,
    /// Registered domain, lowercased. Unique.
    pub domain: String,
    pub name: String,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub message_count: i64,
}

/// A row from the `projects` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub normalized_name: String,
    pub account_id: Option<i64>,
    /// Rollup of linked messages, recomputed after each committed decision.
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub message_count: i64,
}

/// Free-text alias pointing at an account or project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alias {
    pub id: i64,
    pub alias: String,
    pub target: EntityRef,
    /// How decisive a hit on this alias is, in [0, 1].
    pub specificity: f64,
}

/// Default specificity for an alias that arrived without one.
///
/// Long, multi-word strings are decisive; short single tokens ("AZ", "Ridge")
/// barely count.
pub fn default_specificity(alias: &str) -> f64 {
    let trimmed = alias.trim();
    let chars = trimmed.chars().filter(|c| c.is_alphanumeric()).count();
    if chars < 3 {
        return 0.0;
    }
    let words = trimmed.split_whitespace().count();
    let length_part = (chars as f64 / 16.0).min(1.0) * 0.7;
    let word_part = match words {
        0 | 1 => 0.1,
        2 => 0.2,
        _ => 0.3,
    };
    (length_part + word_part).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_roundtrip_labels() {
        for t in EntityType::ALL {
            assert_eq!(EntityType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EntityType::parse("person"), None);
    }

    #[test]
    fn test_entity_ref_display() {
        assert_eq!(EntityRef::project(7).to_string(), "project:7");
        assert_eq!(EntityRef::account(3).to_string(), "account:3");
    }

    #[test]
    fn test_default_specificity_scales_with_length() {
        assert_eq!(default_specificity("AZ"), 0.0);
        let short = default_specificity("Ridge");
        let long = default_specificity("Desert Ridge Marketplace");
        assert!(short < 0.5, "short alias should be weak: {short}");
        assert!(long > 0.9, "long multi-word alias should be decisive: {long}");
        assert!(long <= 1.0);
    }
}
