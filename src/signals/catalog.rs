//! Precomputed candidate profiles for one batch.
//!
//! Extractors run once per (message, candidate), so everything derivable
//! from the entity alone (normalized names, tokens, domains, aliases) is
//! computed here up front.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::entity::{Account, Alias, EntityRef, EntityType, Project};
use crate::error::StoreError;
use crate::store::MessageStore;
use crate::threads::subject::{normalize_phrase, significant_tokens};

/// Aliases shorter than this (alphanumeric characters) never match.
pub const MIN_ALIAS_CHARS: usize = 3;

#[derive(Debug, Clone)]
pub struct AliasProfile {
    pub alias: String,
    /// Normalized phrase padded with single spaces for word-boundary search.
    pub padded: String,
    pub specificity: f64,
}

#[derive(Debug, Clone)]
pub struct CandidateProfile {
    pub entity: EntityRef,
    pub name: String,
    /// Normalized name padded with single spaces.
    pub padded_name: String,
    pub tokens: Vec<String>,
    /// Registered domain of the account, or of a project's owning account.
    pub domain: Option<String>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub aliases: Vec<AliasProfile>,
}

#[derive(Debug, Clone, Default)]
pub struct EntityCatalog {
    accounts: Vec<CandidateProfile>,
    projects: Vec<CandidateProfile>,
    index: HashMap<EntityRef, (EntityType, usize)>,
}

fn padded(phrase: &str) -> String {
    format!(" {phrase} ")
}

impl EntityCatalog {
    pub fn load(store: &dyn MessageStore) -> Result<Self, StoreError> {
        let accounts = store.list_accounts()?;
        let projects = store.list_projects()?;
        let aliases = store.list_aliases()?;
        Ok(Self::build(&accounts, &projects, &aliases))
    }

    pub fn build(accounts: &[Account], projects: &[Project], aliases: &[Alias]) -> Self {
        let mut alias_map: HashMap<EntityRef, Vec<AliasProfile>> = HashMap::new();
        for alias in aliases {
            let phrase = normalize_phrase(&alias.alias);
            let chars = phrase.chars().filter(|c| c.is_alphanumeric()).count();
            if chars < MIN_ALIAS_CHARS {
                continue;
            }
            alias_map.entry(alias.target).or_default().push(AliasProfile {
                alias: alias.alias.clone(),
                padded: padded(&phrase),
                specificity: alias.specificity.clamp(0.0, 1.0),
            });
        }

        let domains: HashMap<i64, String> =
            accounts.iter().map(|a| (a.id, a.domain.clone())).collect();

        let mut catalog = EntityCatalog::default();
        for account in accounts {
            let entity = EntityRef::account(account.id);
            catalog.accounts.push(CandidateProfile {
                entity,
                name: account.name.clone(),
                padded_name: padded(&normalize_phrase(&account.name)),
                tokens: significant_tokens(&account.name),
                domain: Some(account.domain.clone()),
                first_seen_at: account.first_seen_at,
                last_seen_at: account.last_seen_at,
                aliases: alias_map.remove(&entity).unwrap_or_default(),
            });
        }
        for project in projects {
            let entity = EntityRef::project(project.id);
            catalog.projects.push(CandidateProfile {
                entity,
                name: project.name.clone(),
                padded_name: padded(&project.normalized_name),
                tokens: significant_tokens(&project.name),
                domain: project.account_id.and_then(|id| domains.get(&id).cloned()),
                first_seen_at: project.first_seen_at,
                last_seen_at: project.last_seen_at,
                aliases: alias_map.remove(&entity).unwrap_or_default(),
            });
        }

        for (i, c) in catalog.accounts.iter().enumerate() {
            catalog.index.insert(c.entity, (EntityType::Account, i));
        }
        for (i, c) in catalog.projects.iter().enumerate() {
            catalog.index.insert(c.entity, (EntityType::Project, i));
        }
        catalog
    }

    /// Every candidate competing for `slot`.
    pub fn candidates(&self, slot: EntityType) -> &[CandidateProfile] {
        match slot {
            EntityType::Account => &self.accounts,
            EntityType::Project => &self.projects,
        }
    }

    pub fn get(&self, entity: EntityRef) -> Option<&CandidateProfile> {
        let (slot, i) = self.index.get(&entity)?;
        self.candidates(*slot).get(*i)
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.projects.is_empty()
    }
}
