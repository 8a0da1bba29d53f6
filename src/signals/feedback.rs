//! Correction recording and reliability updates.
//!
//! When a reviewer overrides a message slot, this module:
//! 1. Validates the request (actor and reason are required)
//! 2. Identifies which signal carried the wrong automatic decision
//! 3. Penalizes that signal (increment beta)
//! 4. Rewards signals that already pointed at the corrected entity (increment alpha)
//!
//! The counters are reporting data. The static weight table never reads them.

use serde::Serialize;

use crate::entity::EntityRef;
use crate::error::EngineError;
use crate::store::MessageStore;
use crate::types::{LinkState, MessageId, OverrideOutcome};

use super::weights::SignalKind;

/// One alpha/beta increment for a signal's reliability counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityUpdate {
    pub signal: SignalKind,
    pub alpha_delta: f64,
    pub beta_delta: f64,
}

/// What an override says about the decision it replaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Correction {
    /// Entity the slot pointed at before the override.
    pub old_entity: Option<EntityRef>,
    /// Strongest signal behind a wrong automatic decision.
    pub wrong_signal: Option<SignalKind>,
    pub updates: Vec<ReliabilityUpdate>,
}

/// Compare the previous slot state with the reviewer's entity.
///
/// Only automatic decisions teach anything: an unresolved slot had no
/// evidence and a replaced override was a human call.
pub fn assess_correction(previous: &LinkState, corrected: EntityRef) -> Correction {
    let auto = match previous {
        LinkState::Automatic(auto) => auto,
        other => {
            return Correction { old_entity: other.entity(), ..Default::default() };
        }
    };

    if auto.entity == corrected {
        // Confirmation: every contributing signal was right
        let updates = auto
            .breakdown
            .iter()
            .map(|c| ReliabilityUpdate { signal: c.signal, alpha_delta: 1.0, beta_delta: 0.0 })
            .collect();
        return Correction { old_entity: Some(auto.entity), wrong_signal: None, updates };
    }

    let wrong_signal = auto
        .breakdown
        .iter()
        .max_by(|a, b| a.weighted().total_cmp(&b.weighted()))
        .map(|c| c.signal);

    Correction {
        old_entity: Some(auto.entity),
        wrong_signal,
        updates: wrong_signal
            .map(|signal| ReliabilityUpdate { signal, alpha_delta: 0.0, beta_delta: 1.0 })
            .into_iter()
            .collect(),
    }
}

/// Record a reviewer override through the store.
///
/// The store applies the override, the retraction of any automatic link, the
/// feedback row and the counters in one transaction.
pub fn record_override(
    store: &dyn MessageStore,
    message_id: MessageId,
    entity: EntityRef,
    actor: &str,
    reason: &str,
) -> Result<OverrideOutcome, EngineError> {
    let actor = actor.trim();
    let reason = reason.trim();
    if actor.is_empty() {
        return Err(EngineError::Validation("override actor must not be empty".to_string()));
    }
    if reason.is_empty() {
        return Err(EngineError::Validation("override reason must not be empty".to_string()));
    }

    let outcome = store.record_override(message_id, entity, actor, reason)?;
    log::info!(
        "override {}: message {} -> {} by {} (was {})",
        outcome.override_id,
        message_id,
        entity,
        actor,
        outcome.previous.as_str()
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
