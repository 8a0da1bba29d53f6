//! Thread discovery and account/project linking for ingested correspondence.
//!
//! A sync batch flows through [`engine::LinkEngine::run_batch`]: the thread
//! resolver assigns conversation threads, signal extractors score each
//! message against the known accounts and projects, and the aggregator
//! commits or withholds a link per slot. Reviewer overrides go through
//! [`signals::feedback`], and [`discovery`] assembles review packets from
//! what has been committed.

pub mod config;
pub mod db;
pub mod discovery;
pub mod domains;
pub mod engine;
pub mod entity;
pub mod error;
mod migrations;
pub mod signals;
pub mod store;
pub mod threads;
pub mod types;

pub use config::{DiscoveryConfig, EngineConfig};
pub use db::CorpusDb;
pub use discovery::{Discovery, DiscoveryRequest, DiscoveryResult, StopReason};
pub use engine::{BatchReport, LinkEngine, LinkIssue};
pub use entity::{EntityRef, EntityType};
pub use error::{EngineError, StoreError};
pub use store::MessageStore;
