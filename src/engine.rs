//! The linking engine: one sync batch end to end.
//!
//! 1. Ping the store; an unreachable store aborts before anything is written.
//! 2. Resolve threads for the batch (single writer over the arena).
//! 3. Partition every touched thread and link its messages on the blocking
//!    pool, one partition lock per thread, repeating chronological passes
//!    until nothing changes.
//!
//! Non-fatal outcomes are collected as [`LinkIssue`] values in the
//! [`BatchReport`]; only run-level failures are errors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::discovery::{Discovery, DiscoveryRequest, DiscoveryResult};
use crate::domains::DomainPolicy;
use crate::entity::{EntityRef, EntityType};
use crate::error::{EngineError, StoreError};
use crate::signals::catalog::EntityCatalog;
use crate::signals::extractors::{extract, gather_evidence, ExtractionContext, SignalTuple};
use crate::signals::feedback;
use crate::signals::fusion::{decide, next_state, Decision, LinkChange, Thresholds, Transition};
use crate::signals::weights::SignalKind;
use crate::store::MessageStore;
use crate::threads::ThreadResolver;
use crate::types::{LinkState, MessageId, OverrideOutcome, RecordOutcome};

/// A non-fatal outcome worth a reviewer's attention.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkIssue {
    /// Two candidates too close to call; the slot stays unresolved.
    AmbiguousLink {
        message_id: MessageId,
        slot: EntityType,
        top: EntityRef,
        top_score: f64,
        runner_up: EntityRef,
        runner_up_score: f64,
    },
    /// A signal's evidence could not be loaded; it contributed nothing.
    MissingSignalData { message_id: MessageId, signal: SignalKind },
    /// An override appeared between decision and commit.
    OverrideConflict { message_id: MessageId, slot: EntityType },
    /// A provider thread id looked reused and was not merged.
    ThreadMergeConflict {
        provider_thread_id: String,
        message_id: MessageId,
        conflicting_ids: Vec<MessageId>,
        reason: String,
    },
    /// The slot changed under us twice in a row.
    CommitConflict { message_id: MessageId, slot: EntityType },
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Batch messages found in the store.
    pub messages: usize,
    /// Batch ids the store does not know.
    pub not_found: Vec<MessageId>,
    /// Thread partitions processed.
    pub threads: usize,
    pub thread_merges: usize,
    /// Messages whose thread id was set or changed.
    pub thread_assignments: usize,
    pub linked: usize,
    pub refreshed: usize,
    pub revised: usize,
    /// Automatic links kept through an ambiguous or weak re-run.
    pub retained: usize,
    pub unchanged: usize,
    pub skipped_overrides: usize,
    pub unresolved: usize,
    /// Full sweeps over the partitions; a sweep repeats while the previous one committed.
    pub sweeps: usize,
    pub passes: usize,
    /// Store calls that failed without aborting the run.
    pub degraded: usize,
    pub issues: Vec<LinkIssue>,
}

impl BatchReport {
    pub fn ambiguous(&self) -> impl Iterator<Item = &LinkIssue> {
        self.issues.iter().filter(|i| matches!(i, LinkIssue::AmbiguousLink { .. }))
    }

    /// Number of slot writes this run committed.
    pub fn commits(&self) -> usize {
        self.linked + self.refreshed + self.revised
    }
}

/// Tallies of one pass over a partition.
#[derive(Debug, Default)]
struct PassTally {
    changed: bool,
    linked: usize,
    refreshed: usize,
    revised: usize,
    retained: usize,
    unchanged: usize,
    skipped: usize,
    unresolved: usize,
    degraded: usize,
    /// Ambiguity and missing data, meaningful for the last pass only.
    issues: Vec<LinkIssue>,
    /// Commit-time conflicts, kept from every pass.
    conflicts: Vec<LinkIssue>,
}

#[derive(Debug, Default)]
struct PartitionReport {
    passes: usize,
    linked: usize,
    refreshed: usize,
    revised: usize,
    degraded: usize,
    conflicts: Vec<LinkIssue>,
    last: PassTally,
}

/// Everything a partition worker needs, shared across workers.
struct PartitionContext {
    store: Arc<dyn MessageStore>,
    catalog: Arc<EntityCatalog>,
    policy: DomainPolicy,
    thresholds: Thresholds,
    date_grace: Duration,
}

struct ThreadPhase {
    found: usize,
    not_found: Vec<MessageId>,
    partitions: BTreeMap<String, Vec<MessageId>>,
    merges: usize,
    assignments_changed: usize,
    degraded: usize,
    conflicts: Vec<LinkIssue>,
}

/// Upper bound on sweeps over all partitions of one batch.
const MAX_SWEEPS: usize = 4;

fn worker_error(e: tokio::task::JoinError) -> EngineError {
    EngineError::Worker(e.to_string())
}

/// A store failure after the batch started: abort only if the store is
/// gone, otherwise log it and let the caller degrade.
fn degrade_or_abort(e: StoreError, what: &str) -> Result<(), EngineError> {
    if e.is_unreachable() {
        let err = EngineError::StoreUnreachable(e.to_string());
        log::error!("Store lost while reading {}: {}. {}", what, err, err.recovery_suggestion());
        return Err(err);
    }
    log::warn!("Could not read {}: {}", what, e);
    Ok(())
}

pub struct LinkEngine {
    store: Arc<dyn MessageStore>,
    config: EngineConfig,
    /// One lock per thread id, held while a partition is linked.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LinkEngine {
    pub fn new(store: Arc<dyn MessageStore>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self { store, config, locks: DashMap::new() })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Thread and link one sync batch.
    pub async fn run_batch(&self, batch: &[MessageId]) -> Result<BatchReport, EngineError> {
        let store = Arc::clone(&self.store);
        if let Err(e) = tokio::task::spawn_blocking(move || store.ping())
            .await
            .map_err(worker_error)?
        {
            let err = EngineError::StoreUnreachable(e.to_string());
            log::error!("Batch of {} aborted: {}. {}", batch.len(), err, err.recovery_suggestion());
            return Err(err);
        }

        // Phase 1: threads
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let ids: Vec<MessageId> = batch.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let threads = tokio::task::spawn_blocking(move || resolve_threads(store.as_ref(), &config, &ids))
            .await
            .map_err(worker_error)??;

        let mut report = BatchReport {
            messages: threads.found,
            not_found: threads.not_found,
            threads: threads.partitions.len(),
            thread_merges: threads.merges,
            thread_assignments: threads.assignments_changed,
            degraded: threads.degraded,
            issues: threads.conflicts,
            ..Default::default()
        };
        if threads.partitions.is_empty() {
            log::info!("Batch of {} ids had nothing to link", batch.len());
            return Ok(report);
        }

        // Phases 2 and 3: link every partition, sweeping again while a
        // sweep commits anything so cross-thread evidence settles in one run
        let mut catalog: Option<Arc<EntityCatalog>> = None;
        loop {
            let store = Arc::clone(&self.store);
            match tokio::task::spawn_blocking(move || EntityCatalog::load(store.as_ref()))
                .await
                .map_err(worker_error)?
            {
                Ok(fresh) => {
                    if fresh.is_empty() && report.sweeps == 0 {
                        log::info!("No accounts or projects registered; links will stay unresolved");
                    }
                    catalog = Some(Arc::new(fresh));
                }
                Err(e) => {
                    degrade_or_abort(e, "entity catalog")?;
                    report.degraded += 1;
                }
            }
            let Some(current) = catalog.clone() else {
                log::warn!("No entity catalog loaded; linking skipped for this batch");
                break;
            };
            let ctx = Arc::new(PartitionContext {
                store: Arc::clone(&self.store),
                catalog: current,
                policy: DomainPolicy::from_config(&self.config),
                thresholds: Thresholds::from_config(&self.config),
                date_grace: Duration::days(self.config.date_grace_days),
            });

            let done = self.link_partitions(&ctx, &threads.partitions).await;
            self.release_locks();
            let done = done?;
            report.sweeps += 1;

            let mut commits = 0;
            for partition in done.values() {
                commits += partition.linked + partition.refreshed + partition.revised;
                report.passes += partition.passes;
                report.linked += partition.linked;
                report.refreshed += partition.refreshed;
                report.revised += partition.revised;
                report.degraded += partition.degraded;
                report.issues.extend(partition.conflicts.iter().cloned());
            }
            if commits > 0 && report.sweeps < MAX_SWEEPS {
                continue;
            }
            if commits > 0 {
                log::warn!("Batch still committing after {} sweeps; stopping", MAX_SWEEPS);
            }

            for partition in done.into_values() {
                report.retained += partition.last.retained;
                report.unchanged += partition.last.unchanged;
                report.skipped_overrides += partition.last.skipped;
                report.unresolved += partition.last.unresolved;
                report.issues.extend(partition.last.issues);
            }
            break;
        }

        log::info!(
            "Batch linked: {} messages in {} threads, {} linked, {} refreshed, {} revised, {} unresolved, {} issues, {} degraded",
            report.messages,
            report.threads,
            report.linked,
            report.refreshed,
            report.revised,
            report.unresolved,
            report.issues.len(),
            report.degraded
        );
        Ok(report)
    }

    /// Link every partition on the blocking pool, one partition lock per
    /// thread id. Results are keyed by thread id so merging is ordered.
    async fn link_partitions(
        &self,
        ctx: &Arc<PartitionContext>,
        partitions: &BTreeMap<String, Vec<MessageId>>,
    ) -> Result<BTreeMap<String, PartitionReport>, EngineError> {
        let mut set = JoinSet::new();
        for (thread_id, ids) in partitions {
            let lock = Arc::clone(&self.locks.entry(thread_id.clone()).or_default());
            let ctx = Arc::clone(ctx);
            let thread_id = thread_id.clone();
            let ids = ids.clone();
            set.spawn_blocking(move || {
                let _guard = lock.lock();
                let partition = process_partition(&ctx, &thread_id, &ids);
                (thread_id, partition)
            });
        }

        let mut done = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let (thread_id, partition) = joined.map_err(worker_error)?;
            done.insert(thread_id, partition);
        }
        Ok(done)
    }

    /// Drop partition locks no worker holds any more.
    fn release_locks(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Record a reviewer override.
    pub async fn record_override(
        &self,
        message_id: MessageId,
        entity: EntityRef,
        actor: &str,
        reason: &str,
    ) -> Result<OverrideOutcome, EngineError> {
        let store = Arc::clone(&self.store);
        let actor = actor.to_string();
        let reason = reason.to_string();
        tokio::task::spawn_blocking(move || {
            feedback::record_override(store.as_ref(), message_id, entity, &actor, &reason)
        })
        .await
        .map_err(worker_error)?
    }

    /// Assemble a review packet from committed links and threads.
    pub async fn discover(&self, request: DiscoveryRequest) -> Result<DiscoveryResult, EngineError> {
        Discovery::new(Arc::clone(&self.store), self.config.discovery.clone())
            .discover(request)
            .await
    }
}

/// Resolve threads for the batch and persist arena, assignments and
/// conflicts. Partitions cover every member of every touched thread.
///
/// Only an unreachable store is fatal here. A message that cannot be read
/// is skipped; an arena that cannot be loaded leaves threading to the next
/// run and partitions by the thread ids already stored.
fn resolve_threads(
    store: &dyn MessageStore,
    config: &EngineConfig,
    ids: &[MessageId],
) -> Result<ThreadPhase, EngineError> {
    let mut degraded = 0;
    let mut messages = Vec::with_capacity(ids.len());
    let mut not_found = Vec::new();
    for id in ids {
        match store.get_message(*id) {
            Ok(Some(message)) => messages.push(message),
            Ok(None) => {
                log::warn!("Batch message {} not found in store; skipped", id);
                not_found.push(*id);
            }
            Err(e) => {
                degrade_or_abort(e, &format!("message {id}"))?;
                degraded += 1;
            }
        }
    }

    let arena = match store.load_thread_arena() {
        Ok(arena) => arena,
        Err(e) => {
            degrade_or_abort(e, "thread arena")?;
            let mut partitions: BTreeMap<String, Vec<MessageId>> = BTreeMap::new();
            for message in &messages {
                let key = message.thread_id.clone().unwrap_or_else(|| format!("msg-{}", message.id));
                partitions.entry(key).or_default().push(message.id);
            }
            return Ok(ThreadPhase {
                found: messages.len(),
                not_found,
                partitions,
                merges: 0,
                assignments_changed: 0,
                degraded: degraded + 1,
                conflicts: Vec::new(),
            });
        }
    };
    let mut resolver = ThreadResolver::new(arena, config);
    let resolution = resolver.resolve(&messages, store);
    degraded += resolution.degraded;

    // Arena first: a failed assignment is redone by the next run
    let mut assignments_changed = 0;
    match store.save_thread_arena(resolver.arena()) {
        Ok(()) => {
            let assignments: Vec<(MessageId, String)> = resolution
                .assignments
                .iter()
                .map(|(id, thread_id)| (*id, thread_id.clone()))
                .collect();
            match store.assign_threads(&assignments) {
                Ok(changed) => assignments_changed = changed,
                Err(e) => {
                    degrade_or_abort(e, "thread assignments")?;
                    degraded += 1;
                }
            }
        }
        Err(e) => {
            degrade_or_abort(e, "thread arena")?;
            degraded += 1;
        }
    }

    let mut conflicts = Vec::with_capacity(resolution.conflicts.len());
    for conflict in resolution.conflicts {
        match store.flag_thread_conflict(
            &conflict.provider_thread_id,
            conflict.message_id,
            &conflict.conflicting_ids,
            &conflict.reason,
        ) {
            Ok(true) => log::info!(
                "Flagged thread conflict on {} for message {}",
                conflict.provider_thread_id,
                conflict.message_id
            ),
            Ok(false) => {}
            Err(e) => {
                log::warn!("Could not persist thread conflict for message {}: {}", conflict.message_id, e);
                degraded += 1;
            }
        }
        conflicts.push(LinkIssue::ThreadMergeConflict {
            provider_thread_id: conflict.provider_thread_id,
            message_id: conflict.message_id,
            conflicting_ids: conflict.conflicting_ids,
            reason: conflict.reason,
        });
    }

    let mut partitions: BTreeMap<String, Vec<MessageId>> = BTreeMap::new();
    for (id, thread_id) in &resolution.assignments {
        partitions.entry(thread_id.clone()).or_default().push(*id);
    }
    for message in &messages {
        if !resolution.assignments.contains_key(&message.id) {
            partitions.entry(format!("msg-{}", message.id)).or_default().push(message.id);
        }
    }

    Ok(ThreadPhase {
        found: messages.len(),
        not_found,
        partitions,
        merges: resolution.merges,
        assignments_changed,
        degraded,
        conflicts,
    })
}

/// Link one thread's messages, repeating passes until a pass commits
/// nothing. Bounded by the partition size plus one.
fn process_partition(ctx: &PartitionContext, thread_id: &str, ids: &[MessageId]) -> PartitionReport {
    let mut report = PartitionReport::default();
    let mut catalog = Arc::clone(&ctx.catalog);
    let max_passes = ids.len() + 1;

    for pass in 0..max_passes {
        if pass > 0 {
            // Rollups from the previous pass move the active windows
            match EntityCatalog::load(ctx.store.as_ref()) {
                Ok(fresh) => catalog = Arc::new(fresh),
                Err(e) => {
                    log::warn!("Could not reload candidates for {}: {}", thread_id, e);
                    report.degraded += 1;
                }
            }
        }

        let mut tally = run_pass(ctx, &catalog, ids);
        report.passes += 1;
        report.linked += tally.linked;
        report.refreshed += tally.refreshed;
        report.revised += tally.revised;
        report.degraded += tally.degraded;
        report.conflicts.append(&mut tally.conflicts);

        let changed = tally.changed;
        report.last = tally;
        if !changed {
            break;
        }
        if pass + 1 == max_passes {
            log::warn!("Thread {} still changing after {} passes; stopping", thread_id, max_passes);
        }
    }
    report
}

fn run_pass(ctx: &PartitionContext, catalog: &EntityCatalog, ids: &[MessageId]) -> PassTally {
    let mut tally = PassTally::default();

    let mut messages = Vec::with_capacity(ids.len());
    for id in ids {
        match ctx.store.get_message(*id) {
            Ok(Some(message)) => messages.push(message),
            Ok(None) => {}
            Err(e) => {
                log::warn!("Could not read message {}: {}", id, e);
                tally.degraded += 1;
            }
        }
    }
    messages.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.id.cmp(&b.id)));

    for message in &messages {
        let evidence = gather_evidence(message, ctx.store.as_ref());
        for signal in &evidence.missing {
            tally.issues.push(LinkIssue::MissingSignalData { message_id: message.id, signal: *signal });
        }
        let extraction = ExtractionContext {
            evidence: &evidence,
            policy: &ctx.policy,
            date_grace: ctx.date_grace,
        };
        for slot in EntityType::ALL {
            let tuples = extract(message, slot, catalog, &extraction);
            link_slot(ctx, message.id, slot, &tuples, &mut tally);
        }
    }
    tally
}

/// Decide and commit one slot. The current state is re-read right before
/// deciding; a version conflict is retried once.
fn link_slot(
    ctx: &PartitionContext,
    message_id: MessageId,
    slot: EntityType,
    tuples: &[SignalTuple],
    tally: &mut PassTally,
) {
    for attempt in 0..2 {
        let current = match ctx.store.load_link(message_id, slot) {
            Ok(current) => current,
            Err(e) => {
                log::warn!("Could not load {} link of message {}: {}", slot.as_str(), message_id, e);
                tally.degraded += 1;
                return;
            }
        };

        let decision = decide(&current.state, tuples, &ctx.thresholds);
        let (state, change) = match next_state(&current.state, &decision, Utc::now()) {
            Transition::Skipped => {
                log::debug!("Message {} {} slot is overridden; skipped", message_id, slot.as_str());
                tally.skipped += 1;
                return;
            }
            Transition::Retained => {
                tally.retained += 1;
                return;
            }
            Transition::Unchanged => {
                if matches!(decision, Decision::Accepted(_)) {
                    tally.unchanged += 1;
                } else {
                    tally.unresolved += 1;
                    note_unresolved(message_id, slot, &decision, tally);
                }
                return;
            }
            Transition::Write { state, change } => (state, change),
        };

        match ctx.store.record_link(message_id, slot, current.version, &state) {
            Ok(RecordOutcome::Committed { version }) => {
                log::debug!(
                    "Message {} {} -> {:?} (v{}, {:?})",
                    message_id,
                    slot.as_str(),
                    state.entity(),
                    version,
                    change
                );
                tally.changed = true;
                match change {
                    LinkChange::Linked => tally.linked += 1,
                    LinkChange::Refreshed => tally.refreshed += 1,
                    LinkChange::Revised { .. } => tally.revised += 1,
                }
                refresh_membership(ctx, &state, change, tally);
                return;
            }
            Ok(RecordOutcome::Overridden) => {
                log::info!("Message {} {} slot was overridden before commit; skipped", message_id, slot.as_str());
                tally.skipped += 1;
                tally.conflicts.push(LinkIssue::OverrideConflict { message_id, slot });
                return;
            }
            Ok(RecordOutcome::VersionConflict { current: seen }) => {
                log::warn!(
                    "Version conflict on message {} {} (expected v{}, found v{}), attempt {}",
                    message_id,
                    slot.as_str(),
                    current.version,
                    seen,
                    attempt + 1
                );
            }
            Err(e) => {
                log::warn!("Commit failed for message {} {}: {}", message_id, slot.as_str(), e);
                tally.degraded += 1;
                return;
            }
        }
    }

    tally.conflicts.push(LinkIssue::CommitConflict { message_id, slot });
}

fn note_unresolved(message_id: MessageId, slot: EntityType, decision: &Decision, tally: &mut PassTally) {
    if let Decision::Ambiguous { top, runner_up } = decision {
        log::info!(
            "Message {} {} ambiguous: {} {:.3} vs {} {:.3}",
            message_id,
            slot.as_str(),
            top.entity,
            top.score,
            runner_up.entity,
            runner_up.score
        );
        tally.issues.push(LinkIssue::AmbiguousLink {
            message_id,
            slot,
            top: top.entity,
            top_score: top.score,
            runner_up: runner_up.entity,
            runner_up_score: runner_up.score,
        });
    }
}

/// Membership changed: recompute rollups of the entities on both sides.
fn refresh_membership(ctx: &PartitionContext, state: &LinkState, change: LinkChange, tally: &mut PassTally) {
    let mut touched: Vec<EntityRef> = state.entity().into_iter().collect();
    match change {
        LinkChange::Refreshed => return,
        LinkChange::Revised { previous } => touched.push(previous),
        LinkChange::Linked => {}
    }
    if let Err(e) = ctx.store.refresh_rollup(&touched) {
        log::warn!("Rollup refresh failed for {:?}: {}", touched, e);
        tally.degraded += 1;
    }
}
