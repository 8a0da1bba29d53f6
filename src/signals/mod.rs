//! Entity resolution signals.
//!
//! Extractors turn a message and the entity catalog into weighted signal
//! tuples; fusion totals them per candidate and applies the margin rule;
//! feedback records reviewer overrides and per-signal reliability.

pub mod catalog;
pub mod extractors;
pub mod feedback;
pub mod fingerprint;
pub mod fusion;
pub mod weights;

pub use catalog::EntityCatalog;
pub use extractors::{extract, gather_evidence, SignalTuple};
pub use fusion::{decide, next_state, Decision, LinkChange, Thresholds, Transition};
pub use weights::SignalKind;
