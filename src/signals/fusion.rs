//! Signal aggregation and the accept / ambiguous / reject decision.
//!
//! Scores are weighted sums summed in the fixed [`SignalKind::ALL`] order,
//! so the same tuples always produce bit-identical totals. Thread
//! propagation, when present, is the only evidence considered.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::entity::EntityRef;
use crate::types::{AutomaticLink, LinkState, SignalContribution};

use super::extractors::SignalTuple;
use super::weights::SignalKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub decision_threshold: f64,
    pub ambiguity_margin: f64,
}

impl Thresholds {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            decision_threshold: config.decision_threshold,
            ambiguity_margin: config.ambiguity_margin,
        }
    }

    /// The margin rule: strictly above the threshold and strictly more than
    /// the margin ahead of the runner-up.
    pub fn accepts(&self, top: f64, runner_up: f64) -> bool {
        top > self.decision_threshold && top - runner_up > self.ambiguity_margin
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateScore {
    pub entity: EntityRef,
    pub score: f64,
    pub breakdown: Vec<SignalContribution>,
}

impl CandidateScore {
    /// True if the score rests on a thread sibling's link alone.
    pub fn is_propagated(&self) -> bool {
        !self.breakdown.is_empty()
            && self.breakdown.iter().all(|c| c.signal == SignalKind::ThreadPropagation)
    }
}

/// Stored scores come back through JSON, so equality allows a few ulps.
const SCORE_EPSILON: f64 = 1e-9;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < SCORE_EPSILON
}

/// True if `existing` already records exactly the winning decision.
fn same_decision(existing: &AutomaticLink, winner: &CandidateScore) -> bool {
    existing.entity == winner.entity
        && close(existing.score, winner.score)
        && existing.breakdown.len() == winner.breakdown.len()
        && existing.breakdown.iter().zip(&winner.breakdown).all(|(a, b)| {
            a.signal == b.signal
                && a.rationale == b.rationale
                && close(a.score, b.score)
                && close(a.weight, b.weight)
        })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The slot is overridden; nothing was scored.
    Skipped,
    Accepted(CandidateScore),
    /// The top two candidates are within the margin of each other.
    Ambiguous { top: CandidateScore, runner_up: CandidateScore },
    /// No candidate, or the best one is below the threshold.
    Insufficient(Option<CandidateScore>),
}

/// Group tuples per candidate and total them, best first. Ties are broken
/// by entity so ordering is deterministic.
pub fn score_candidates(tuples: &[SignalTuple]) -> Vec<CandidateScore> {
    let propagated = tuples.iter().any(|t| t.signal == SignalKind::ThreadPropagation);

    let mut grouped: BTreeMap<EntityRef, Vec<&SignalTuple>> = BTreeMap::new();
    for tuple in tuples {
        if propagated && tuple.signal != SignalKind::ThreadPropagation {
            continue;
        }
        grouped.entry(tuple.entity).or_default().push(tuple);
    }

    let mut scores: Vec<CandidateScore> = grouped
        .into_iter()
        .map(|(entity, tuples)| {
            let mut breakdown = Vec::new();
            let mut score = 0.0;
            for kind in SignalKind::ALL {
                // One tuple per kind and candidate; keep the strongest if not
                let Some(best) = tuples
                    .iter()
                    .filter(|t| t.signal == kind)
                    .max_by(|a, b| a.score.total_cmp(&b.score))
                else {
                    continue;
                };
                let contribution = SignalContribution {
                    signal: kind,
                    score: best.score,
                    weight: kind.weight(),
                    rationale: best.rationale.clone(),
                };
                score += contribution.weighted();
                breakdown.push(contribution);
            }
            CandidateScore { entity, score, breakdown }
        })
        .collect();

    scores.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.entity.cmp(&b.entity)));
    scores
}

/// Decide a slot. An overridden slot is never scored.
pub fn decide(current: &LinkState, tuples: &[SignalTuple], thresholds: &Thresholds) -> Decision {
    if current.is_overridden() {
        return Decision::Skipped;
    }
    let mut scores = score_candidates(tuples).into_iter();
    let Some(top) = scores.next() else {
        return Decision::Insufficient(None);
    };
    let runner_up = scores.next();
    let second = runner_up.as_ref().map_or(0.0, |c| c.score);

    if thresholds.accepts(top.score, second) {
        return Decision::Accepted(top);
    }
    match runner_up {
        Some(runner_up) if top.score - runner_up.score <= thresholds.ambiguity_margin => {
            Decision::Ambiguous { top, runner_up }
        }
        _ => Decision::Insufficient(Some(top)),
    }
}

/// How a committed write changes the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum LinkChange {
    /// Unresolved to automatic.
    Linked,
    /// Same entity, new score or breakdown.
    Refreshed,
    /// A different entity won by more than the margin.
    Revised { previous: EntityRef },
}

/// What applying a decision to the current state requires.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Skipped,
    /// The stored state already equals the decision.
    Unchanged,
    /// An existing automatic link survives an ambiguous or weak re-run.
    Retained,
    Write { state: LinkState, change: LinkChange },
}

pub fn next_state(current: &LinkState, decision: &Decision, now: DateTime<Utc>) -> Transition {
    match (current, decision) {
        (LinkState::Overridden(_), _) | (_, Decision::Skipped) => Transition::Skipped,
        (_, Decision::Accepted(winner)) => {
            let state = LinkState::Automatic(AutomaticLink {
                entity: winner.entity,
                score: winner.score,
                breakdown: winner.breakdown.clone(),
                decided_at: now,
            });
            match current {
                // A sibling's link never displaces the message's own evidence
                LinkState::Automatic(existing) if existing.is_anchored() && winner.is_propagated() => {
                    Transition::Retained
                }
                LinkState::Automatic(existing) if same_decision(existing, winner) => Transition::Unchanged,
                LinkState::Automatic(existing) if existing.entity == winner.entity => {
                    Transition::Write { state, change: LinkChange::Refreshed }
                }
                LinkState::Automatic(existing) => Transition::Write {
                    state,
                    change: LinkChange::Revised { previous: existing.entity },
                },
                _ => Transition::Write { state, change: LinkChange::Linked },
            }
        }
        (LinkState::Automatic(_), _) => Transition::Retained,
        _ => Transition::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OverrideLink;
    use proptest::prelude::*;

    fn tuple(entity: EntityRef, signal: SignalKind, score: f64) -> SignalTuple {
        SignalTuple { entity, signal, score, rationale: format!("{signal:?}") }
    }

    #[test]
    fn test_weighted_sum_in_fixed_order() {
        let p = EntityRef::project(1);
        let scores = score_candidates(&[
            tuple(p, SignalKind::SubjectMatch, 1.0),
            tuple(p, SignalKind::AttachmentFingerprint, 1.0),
        ]);
        assert_eq!(scores.len(), 1);
        assert!((scores[0].score - 1.4).abs() < 1e-9);
        assert_eq!(scores[0].breakdown[0].signal, SignalKind::AttachmentFingerprint);
        assert_eq!(scores[0].breakdown[1].signal, SignalKind::SubjectMatch);
    }

    #[test]
    fn test_thread_propagation_dominates() {
        let a = EntityRef::project(1);
        let b = EntityRef::project(2);
        let scores = score_candidates(&[
            tuple(a, SignalKind::ThreadPropagation, 1.0),
            tuple(b, SignalKind::AttachmentFingerprint, 1.0),
            tuple(b, SignalKind::DomainMatch, 1.0),
        ]);
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].entity, a);
    }

    #[test]
    fn test_decide_accepts_clear_winner() {
        let p = EntityRef::project(1);
        let d = decide(&LinkState::Unresolved, &[tuple(p, SignalKind::SubjectMatch, 1.0)], &Thresholds::default());
        match d {
            Decision::Accepted(c) => {
                assert_eq!(c.entity, p);
                assert!((c.score - 0.5).abs() < 1e-9);
            }
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[test]
    fn test_decide_tie_is_ambiguous() {
        let tuples = [
            tuple(EntityRef::project(1), SignalKind::DomainMatch, 1.0),
            tuple(EntityRef::project(2), SignalKind::DomainMatch, 1.0),
        ];
        assert!(matches!(
            decide(&LinkState::Unresolved, &tuples, &Thresholds::default()),
            Decision::Ambiguous { .. }
        ));
    }

    #[test]
    fn test_decide_weak_is_insufficient() {
        let tuples = [
            tuple(EntityRef::project(1), SignalKind::SubjectMatch, 0.6),
            tuple(EntityRef::project(2), SignalKind::DateProximity, 1.0),
        ];
        assert!(matches!(
            decide(&LinkState::Unresolved, &tuples, &Thresholds::default()),
            Decision::Insufficient(Some(_))
        ));
        assert_eq!(
            decide(&LinkState::Unresolved, &[], &Thresholds::default()),
            Decision::Insufficient(None)
        );
    }

    #[test]
    fn test_weak_near_tie_is_still_ambiguous() {
        let tuples = [
            tuple(EntityRef::project(1), SignalKind::SubjectMatch, 0.3),
            tuple(EntityRef::project(2), SignalKind::SubjectMatch, 0.3),
        ];
        let d = decide(&LinkState::Unresolved, &tuples, &Thresholds::default());
        let Decision::Ambiguous { top, runner_up } = &d else {
            panic!("expected ambiguous, got {d:?}");
        };
        assert_eq!(top.entity, EntityRef::project(1));
        assert_eq!(runner_up.entity, EntityRef::project(2));
        assert_eq!(next_state(&LinkState::Unresolved, &d, Utc::now()), Transition::Unchanged);
    }

    #[test]
    fn test_stored_score_off_by_an_ulp_is_unchanged() {
        let p = EntityRef::project(1);
        let decision = decide(
            &LinkState::Unresolved,
            &[
                tuple(p, SignalKind::AttachmentFingerprint, 1.0),
                tuple(p, SignalKind::SubjectMatch, 0.5),
            ],
            &Thresholds::default(),
        );
        let Transition::Write { state, .. } = next_state(&LinkState::Unresolved, &decision, Utc::now()) else {
            panic!("expected a write");
        };
        let LinkState::Automatic(mut stored) = state else {
            panic!("expected automatic");
        };
        stored.score = f64::from_bits(stored.score.to_bits() + 1);
        let stored = LinkState::Automatic(stored);

        let json = serde_json::to_string(&stored).unwrap();
        let reloaded: LinkState = serde_json::from_str(&json).unwrap();
        assert_eq!(next_state(&reloaded, &decision, Utc::now()), Transition::Unchanged);
        assert_eq!(next_state(&stored, &decision, Utc::now()), Transition::Unchanged);
    }

    #[test]
    fn test_propagation_never_revises_own_evidence() {
        let own = EntityRef::project(1);
        let sibling = EntityRef::project(2);
        let now = Utc::now();
        let linked = decide(&LinkState::Unresolved, &[tuple(own, SignalKind::SubjectMatch, 1.0)], &Thresholds::default());
        let Transition::Write { state, .. } = next_state(&LinkState::Unresolved, &linked, now) else {
            panic!("expected a write");
        };

        let propagated = decide(
            &state,
            &[tuple(sibling, SignalKind::ThreadPropagation, 1.0), tuple(own, SignalKind::SubjectMatch, 1.0)],
            &Thresholds::default(),
        );
        assert!(matches!(&propagated, Decision::Accepted(w) if w.entity == sibling));
        assert_eq!(next_state(&state, &propagated, now), Transition::Retained);

        // An unresolved slot and a propagated link still follow the thread
        assert!(matches!(
            next_state(&LinkState::Unresolved, &propagated, now),
            Transition::Write { change: LinkChange::Linked, .. }
        ));
        let Transition::Write { state: inherited, .. } = next_state(&LinkState::Unresolved, &propagated, now) else {
            unreachable!();
        };
        let elsewhere = decide(&inherited, &[tuple(own, SignalKind::ThreadPropagation, 1.0)], &Thresholds::default());
        assert!(matches!(
            next_state(&inherited, &elsewhere, now),
            Transition::Write { change: LinkChange::Revised { previous }, .. } if previous == sibling
        ));
    }

    #[test]
    fn test_overridden_slot_is_skipped() {
        let current = LinkState::Overridden(OverrideLink {
            entity: EntityRef::project(9),
            actor: "ops".into(),
            reason: "known".into(),
            overridden_at: Utc::now(),
        });
        let tuples = [tuple(EntityRef::project(1), SignalKind::ThreadPropagation, 1.0)];
        let d = decide(&current, &tuples, &Thresholds::default());
        assert_eq!(d, Decision::Skipped);
        assert_eq!(next_state(&current, &d, Utc::now()), Transition::Skipped);
    }

    #[test]
    fn test_next_state_is_sticky_and_idempotent() {
        let p = EntityRef::project(1);
        let now = Utc::now();
        let decision = decide(&LinkState::Unresolved, &[tuple(p, SignalKind::SubjectMatch, 1.0)], &Thresholds::default());

        let Transition::Write { state, change } = next_state(&LinkState::Unresolved, &decision, now) else {
            panic!("expected a write");
        };
        assert_eq!(change, LinkChange::Linked);

        // Same inputs again: nothing to write
        assert_eq!(next_state(&state, &decision, now), Transition::Unchanged);

        // Evidence gone: the automatic link is retained
        let weak = decide(&state, &[], &Thresholds::default());
        assert_eq!(next_state(&state, &weak, now), Transition::Retained);

        // A clear new winner revises it
        let other = EntityRef::project(2);
        let revised = decide(&state, &[tuple(other, SignalKind::AttachmentFingerprint, 1.0)], &Thresholds::default());
        assert!(matches!(
            next_state(&state, &revised, now),
            Transition::Write { change: LinkChange::Revised { previous }, .. } if previous == p
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_margin_rule(
            scores in prop::collection::vec((0usize..6, 0u32..=100), 1..12),
            threshold in 0.05f64..1.5,
            margin in 0.0f64..0.6,
        ) {
            let thresholds = Thresholds { decision_threshold: threshold, ambiguity_margin: margin };
            let tuples: Vec<SignalTuple> = scores
                .iter()
                .enumerate()
                .map(|(i, (kind, s))| tuple(
                    EntityRef::project((i % 4) as i64),
                    SignalKind::ALL[*kind],
                    *s as f64 / 100.0,
                ))
                .collect();

            let ranked = score_candidates(&tuples);
            let decision = decide(&LinkState::Unresolved, &tuples, &thresholds);
            let top = ranked.first().map_or(0.0, |c| c.score);
            let second = ranked.get(1).map_or(0.0, |c| c.score);

            match decision {
                Decision::Accepted(winner) => {
                    prop_assert!(winner.score > threshold);
                    prop_assert!(winner.score - second > margin);
                    prop_assert_eq!(winner.entity, ranked[0].entity);
                }
                _ => {
                    prop_assert!(!(top > threshold && top - second > margin));
                }
            }

            // Same input, same decision
            let again = decide(&LinkState::Unresolved, &tuples, &thresholds);
            prop_assert_eq!(decide(&LinkState::Unresolved, &tuples, &thresholds), again);
        }
    }
}
