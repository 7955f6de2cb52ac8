//! Judgment orchestration.
//!
//! `submit_for_judgment` captures one registry snapshot, runs every panel
//! agent on its own task, aggregates, and either finalizes a judgment or
//! escalates. Outcomes reported later flow through a single background
//! worker that updates calibration, counts dimension confirmations and feeds
//! the residual detector.
//!
//! Agents that keep failing are skipped behind a per-agent circuit breaker.
//! Deferred escalations and residual history are persisted so a restarted
//! engine picks up where the last one stopped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{
    configured_panel, reserve_panel, AgentError, EvaluatorAgent, Position, Verdict, Vote,
};
use crate::breaker::{BreakerBoard, CircuitState, CircuitTransition};
use crate::calibration::{AgentProfile, CalibrationTracker};
use crate::config::EngineConfig;
use crate::consensus::aggregate;
use crate::dimensions::{
    Axiom, Dimension, DimensionRegistry, DimensionSnapshot, DimensionTransaction, RegistryError,
};
use crate::dissensus::{
    aggregate_triggers, disagreement_axis, find_veto, most_contested_axiom, DissensusTrigger,
    EscalationAction, EscalationBudget, EscalationRequest, VetoMode,
};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventRecord, EventSink, NoopEventSink};
use crate::governance::{dimension_def, DimensionProposal, ProposalBook, ProposalStatus};
use crate::judgment::{judgment_id, Judgment, JudgmentParts, Resolution};
use crate::outcome::{spawn_outcome_worker, ObservedOutcome, Outcome, OutcomeHandler, OutcomeQueue, OutcomeWorker};
use crate::phi::PHI_INV_2;
use crate::residual::{
    ResidualDetector, ResidualObservation, ResidualPoint, ResidualStats, SignificanceTest,
};
use crate::scoring::{Context, Item, Scorer};
use crate::store::{EngineStore, StoredEscalation, StoredJudgment};

const CANCEL_POLL: Duration = Duration::from_millis(5);

// =============================================================================
// Clock
// =============================================================================

pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        crate::store::now_epoch_ms()
    }
}

/// Manually driven clock for reproducible runs.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, AtomicOrdering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now.load(AtomicOrdering::Relaxed)
    }
}

// =============================================================================
// Public types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Submission {
    Judgment(Judgment),
    /// Deferred to an external decision-maker; see [`JudgmentEngine::resolve_escalation`].
    Escalation(EscalationRequest),
}

impl Submission {
    pub fn judgment(&self) -> Option<&Judgment> {
        match self {
            Self::Judgment(j) => Some(j),
            Self::Escalation(_) => None,
        }
    }

    pub fn escalation(&self) -> Option<&EscalationRequest> {
        match self {
            Self::Judgment(_) => None,
            Self::Escalation(e) => Some(e),
        }
    }
}

/// How a deferred escalation ends.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationDecision {
    Decide { verdict: Verdict, decided_by: String },
    /// Nobody decided in time; fail closed.
    Expire,
}

// =============================================================================
// Builder
// =============================================================================

pub struct EngineBuilder {
    config: EngineConfig,
    scorer: Arc<Scorer>,
    panel: Option<Vec<Arc<dyn EvaluatorAgent>>>,
    reserve: Option<Vec<Arc<dyn EvaluatorAgent>>>,
    registry: Option<DimensionRegistry>,
    events: Arc<dyn EventSink>,
    store: Option<Arc<dyn EngineStore>>,
    clock: Arc<dyn Clock>,
    significance: Option<Box<dyn SignificanceTest>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            scorer: Arc::new(Scorer::new()),
            panel: None,
            reserve: None,
            registry: None,
            events: Arc::new(NoopEventSink),
            store: None,
            clock: Arc::new(SystemClock),
            significance: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Scorer used by the stock panels.
    pub fn scorer(mut self, scorer: Arc<Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn panel(mut self, panel: Vec<Arc<dyn EvaluatorAgent>>) -> Self {
        self.panel = Some(panel);
        self
    }

    pub fn reserve(mut self, reserve: Vec<Arc<dyn EvaluatorAgent>>) -> Self {
        self.reserve = Some(reserve);
        self
    }

    pub fn registry(mut self, registry: DimensionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn store(mut self, store: Arc<dyn EngineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn significance_test(mut self, test: Box<dyn SignificanceTest>) -> Self {
        self.significance = Some(test);
        self
    }

    /// Start the engine with fresh state. Must run inside a tokio runtime.
    pub fn build(mut self) -> Result<JudgmentEngine, EngineError> {
        let registry = self.registry.take().unwrap_or_else(DimensionRegistry::bootstrap);
        let calibration = CalibrationTracker::new(self.config.calibration.clone());
        let proposals = ProposalBook::new(self.config.governance.clone());
        self.assemble(registry, calibration, proposals, Ledger::default(), BTreeMap::new())
    }

    /// Start the engine from persisted state, then re-queue outcomes that
    /// were stored but never applied and expire overdue escalations.
    pub async fn restore(mut self, store: Arc<dyn EngineStore>) -> Result<JudgmentEngine, EngineError> {
        let registry = match store.dimensions().await? {
            Some((version, dimensions)) if !dimensions.is_empty() => {
                DimensionRegistry::restore(dimensions, version)?
            }
            _ => self.registry.take().unwrap_or_else(DimensionRegistry::bootstrap),
        };
        let calibration =
            CalibrationTracker::with_profiles(self.config.calibration.clone(), store.profiles().await?);
        let proposals = ProposalBook::with_proposals(self.config.governance.clone(), store.proposals().await?);

        let mut ledger = Ledger::default();
        for entry in store.judgments().await? {
            ledger.insert(entry);
        }
        let mut unfinished = Vec::new();
        let mut interrupted = Vec::new();
        for stored in store.outcomes().await? {
            let judgment_id = stored.outcome.judgment_id.clone();
            if stored.applied {
                ledger.consumed.insert(judgment_id.clone());
                if !stored.archived {
                    interrupted.push(judgment_id);
                }
            } else {
                unfinished.push(stored.outcome);
            }
        }

        let mut pending = BTreeMap::new();
        let mut settled = Vec::new();
        for escalation in store.escalations().await? {
            if ledger.judgments.contains_key(&escalation.request.judgment_id) {
                settled.push(escalation.request.id.clone());
            } else {
                pending.insert(escalation.request.id.clone(), escalation);
            }
        }
        let history = store.residual_history(self.config.residual.window).await?;

        // Calibration already holds these; the discovery steps are not replayed.
        for judgment_id in &interrupted {
            warn!(judgment_id = %judgment_id, "Outcome applied but not archived; archiving");
            store.archive_outcome(judgment_id).await?;
        }
        for escalation_id in &settled {
            store.remove_escalation(escalation_id).await?;
        }

        self.store = Some(store);
        let engine = self.assemble(registry, calibration, proposals, ledger, pending)?;
        let warmed = lock(&engine.inner.residual).warm_start(&history);
        engine.inner.persist_registry().await?;
        let expired = engine.inner.expire_overdue_escalations().await?;
        info!(
            judgments = engine.judgments().len(),
            requeued = unfinished.len(),
            pending_escalations = engine.pending_escalations().len(),
            expired = expired.len(),
            residuals = warmed,
            "Restored judgment engine state"
        );
        for outcome in unfinished {
            engine.enqueue(outcome)?;
        }
        Ok(engine)
    }

    fn assemble(
        self,
        registry: DimensionRegistry,
        calibration: CalibrationTracker,
        proposals: ProposalBook,
        ledger: Ledger,
        pending: BTreeMap<String, StoredEscalation>,
    ) -> Result<JudgmentEngine, EngineError> {
        self.config
            .validate()
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        let panel = self
            .panel
            .unwrap_or_else(|| configured_panel(self.scorer.clone(), &self.config.selection));
        let reserve = self
            .reserve
            .unwrap_or_else(|| reserve_panel(self.scorer.clone()));
        let mut seen = HashSet::new();
        for agent in panel.iter().chain(&reserve) {
            if !seen.insert(agent.id().to_string()) {
                return Err(EngineError::InvalidRequest(format!(
                    "duplicate agent id {}",
                    agent.id()
                )));
            }
        }
        if panel.is_empty() {
            return Err(EngineError::InvalidRequest("panel must not be empty".into()));
        }

        let residual = match self.significance {
            Some(test) => ResidualDetector::with_test(self.config.residual.clone(), test),
            None => ResidualDetector::new(self.config.residual.clone()),
        };

        let breakers = BreakerBoard::new(self.config.breaker.clone());
        let inner = Arc::new(EngineInner {
            config: self.config,
            registry,
            panel,
            reserve,
            calibration: Mutex::new(calibration),
            residual: Mutex::new(residual),
            proposals: Mutex::new(proposals),
            breakers: Mutex::new(breakers),
            ledger: Mutex::new(ledger),
            settled: Notify::new(),
            pending: Mutex::new(pending),
            events: self.events,
            store: self.store,
            clock: self.clock,
        });
        let (queue, worker) = spawn_outcome_worker(inner.clone());
        Ok(JudgmentEngine {
            inner,
            queue,
            worker,
        })
    }
}

// =============================================================================
// Engine state
// =============================================================================

#[derive(Debug, Default)]
struct Ledger {
    judgments: HashMap<String, StoredJudgment>,
    order: Vec<String>,
    consumed: HashSet<String>,
    /// Judgment ids some submission is currently voting on.
    in_flight: HashSet<String>,
}

impl Ledger {
    fn insert(&mut self, entry: StoredJudgment) {
        let id = entry.judgment.id().to_string();
        if self.judgments.insert(id.clone(), entry).is_none() {
            self.order.push(id);
        }
    }
}

enum Claim<'a> {
    Done(Submission),
    Busy,
    Owned(InFlight<'a>),
}

/// Exclusive right to vote on one judgment id. Released on drop.
struct InFlight<'a> {
    inner: &'a EngineInner,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(&self.inner.ledger).in_flight.remove(&self.id);
        self.inner.settled.notify_waiters();
    }
}

type VoteTask = JoinHandle<Result<Result<Vote, AgentError>, tokio::time::error::Elapsed>>;

struct EngineInner {
    config: EngineConfig,
    registry: DimensionRegistry,
    panel: Vec<Arc<dyn EvaluatorAgent>>,
    reserve: Vec<Arc<dyn EvaluatorAgent>>,
    calibration: Mutex<CalibrationTracker>,
    residual: Mutex<ResidualDetector>,
    proposals: Mutex<ProposalBook>,
    breakers: Mutex<BreakerBoard>,
    ledger: Mutex<Ledger>,
    /// Woken whenever an in-flight judgment id is released.
    settled: Notify,
    pending: Mutex<BTreeMap<String, StoredEscalation>>,
    events: Arc<dyn EventSink>,
    store: Option<Arc<dyn EngineStore>>,
    clock: Arc<dyn Clock>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Result of collecting votes from a group of agents.
struct Ballot {
    votes: Vec<Vote>,
    abstentions: Vec<String>,
}

/// Everything a finalized judgment is built from.
struct Verdicts<'a> {
    id: &'a str,
    item: &'a Item,
    verdict: Verdict,
    confidence: f64,
    activation: f64,
    votes: Vec<Vote>,
    abstentions: Vec<String>,
    registry_version: u64,
    resolution: Resolution,
    contested_axiom: Option<Axiom>,
}

impl EngineInner {
    fn is_veto_capable(&self, agent_id: &str) -> bool {
        self.panel
            .iter()
            .chain(&self.reserve)
            .any(|a| a.id() == agent_id && a.is_veto_capable())
    }

    fn panel_ids(&self) -> Vec<&str> {
        self.panel.iter().map(|a| a.id()).collect()
    }

    /// Every agent that may vote, with its current weight.
    fn weighted_agents(&self) -> Vec<(&str, f64)> {
        let calibration = lock(&self.calibration);
        self.panel
            .iter()
            .chain(&self.reserve)
            .map(|a| (a.id(), calibration.weight_of(a.id())))
            .collect()
    }

    /// Take ownership of `id`, or report why not.
    fn claim(&self, id: &str) -> Claim<'_> {
        let mut ledger = lock(&self.ledger);
        if let Some(entry) = ledger.judgments.get(id) {
            return Claim::Done(Submission::Judgment(entry.judgment.clone()));
        }
        let deferred = lock(&self.pending)
            .values()
            .find(|p| p.request.judgment_id == id)
            .map(|p| p.request.clone());
        if let Some(request) = deferred {
            return Claim::Done(Submission::Escalation(request));
        }
        if !ledger.in_flight.insert(id.to_string()) {
            return Claim::Busy;
        }
        Claim::Owned(InFlight {
            inner: self,
            id: id.to_string(),
        })
    }

    /// Events describe state that is already committed, so a failed
    /// delivery is logged and never fails the operation.
    fn emit(&self, event: EngineEvent) {
        let kind = event.kind();
        let record = EventRecord {
            at_ms: self.clock.now_ms(),
            event,
        };
        if let Err(e) = self.events.record(record) {
            warn!(event = kind, error = %e, "Failed to deliver engine event");
        }
    }

    async fn snapshot(&self) -> Result<DimensionSnapshot, EngineError> {
        let retry = &self.config.retry;
        for attempt in 0..retry.max_attempts {
            match self.registry.snapshot() {
                Ok(snapshot) => return Ok(snapshot),
                Err(RegistryError::Locked) => {
                    debug!(attempt, "Dimension registry locked; backing off");
                    tokio::time::sleep(retry.backoff_delay(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(attempts = retry.max_attempts, "Dimension registry stayed locked");
        Err(EngineError::DimensionRegistryLocked)
    }

    /// Run `edit` inside a registry write transaction, retrying while locked.
    async fn write_registry<R, F>(&self, mut edit: F) -> Result<R, EngineError>
    where
        F: FnMut(&mut DimensionTransaction<'_>) -> Result<R, RegistryError>,
    {
        let retry = &self.config.retry;
        for attempt in 0..retry.max_attempts {
            match self.try_write_registry(&mut edit) {
                Err(RegistryError::Locked) => {
                    debug!(attempt, "Dimension registry busy; backing off");
                    tokio::time::sleep(retry.backoff_delay(attempt)).await;
                }
                other => return other.map_err(EngineError::from),
            }
        }
        Err(EngineError::DimensionRegistryLocked)
    }

    fn try_write_registry<R, F>(&self, edit: &mut F) -> Result<R, RegistryError>
    where
        F: FnMut(&mut DimensionTransaction<'_>) -> Result<R, RegistryError>,
    {
        let mut tx = self.registry.transaction()?;
        let result = edit(&mut tx)?;
        tx.commit();
        Ok(result)
    }

    async fn persist_registry(&self) -> Result<(), EngineError> {
        if let Some(store) = &self.store {
            let snapshot = self.snapshot().await?;
            let dimensions: Vec<Dimension> = snapshot.iter().cloned().collect();
            store.put_dimensions(snapshot.version(), &dimensions).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Voting
    // -------------------------------------------------------------------------

    /// Vote on `agents` concurrently. Agents whose circuit is open abstain
    /// without being called.
    async fn collect_votes(
        &self,
        agents: &[Arc<dyn EvaluatorAgent>],
        item: &Item,
        context: &Context,
        snapshot: &DimensionSnapshot,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<Ballot, EngineError> {
        let timeout = Duration::from_millis(self.config.voting.vote_timeout_ms);
        let now = self.clock.now_ms();
        let mut handles: Vec<Option<VoteTask>> = Vec::with_capacity(agents.len());
        {
            let mut breakers = lock(&self.breakers);
            for agent in agents {
                if !breakers.allow(agent.id(), now) {
                    handles.push(None);
                    continue;
                }
                let agent = Arc::clone(agent);
                let item = item.clone();
                let context = context.clone();
                let snapshot = Arc::clone(snapshot);
                handles.push(Some(tokio::spawn(async move {
                    tokio::time::timeout(timeout, agent.vote(&item, &context, &snapshot)).await
                })));
            }
        }

        let mut ballot = Ballot {
            votes: Vec::with_capacity(agents.len()),
            abstentions: Vec::new(),
        };
        for idx in 0..handles.len() {
            let agent_id = agents[idx].id();
            let Some(handle) = handles[idx].as_mut() else {
                debug!(agent_id = %agent_id, "Agent circuit open; abstaining");
                ballot.abstentions.push(agent_id.to_string());
                continue;
            };
            let joined = loop {
                if is_cancelled(cancel_flag) {
                    let mut breakers = lock(&self.breakers);
                    for (agent, handle) in agents[idx..].iter().zip(&handles[idx..]) {
                        if let Some(handle) = handle {
                            handle.abort();
                            breakers.release_trial(agent.id());
                        }
                    }
                    info!(agent_id = %agent_id, "Judgment cancelled while collecting votes");
                    return Err(EngineError::Cancelled);
                }
                tokio::select! {
                    joined = &mut *handle => break joined,
                    _ = tokio::time::sleep(CANCEL_POLL), if cancel_flag.is_some() => {}
                }
            };
            let voted = match joined {
                Ok(Ok(Ok(vote))) if vote.agent_id() == agent_id => {
                    ballot.votes.push(vote);
                    true
                }
                Ok(Ok(Ok(vote))) => {
                    warn!(
                        agent_id = %agent_id,
                        claimed = %vote.agent_id(),
                        "Agent signed its vote with another id; abstaining"
                    );
                    false
                }
                Ok(Ok(Err(e))) => {
                    warn!(agent_id = %agent_id, error = %e, "Agent failed to vote; abstaining");
                    false
                }
                Ok(Err(_)) => {
                    warn!(
                        agent_id = %agent_id,
                        timeout_ms = self.config.voting.vote_timeout_ms,
                        "Agent vote timed out; abstaining"
                    );
                    false
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Agent task failed; abstaining");
                    false
                }
            };
            if !voted {
                ballot.abstentions.push(agent_id.to_string());
            }
            self.record_call(agent_id, voted);
        }
        Ok(ballot)
    }

    fn record_call(&self, agent_id: &str, ok: bool) {
        let transition = lock(&self.breakers).record(agent_id, ok, self.clock.now_ms());
        match transition {
            Some(CircuitTransition::Opened {
                consecutive_failures,
                retry_at_ms,
            }) => {
                warn!(
                    agent_id = %agent_id,
                    consecutive_failures,
                    retry_at_ms,
                    "Agent circuit opened"
                );
                self.emit(EngineEvent::AgentCircuitOpened {
                    agent_id: agent_id.to_string(),
                    consecutive_failures,
                    retry_at_ms,
                });
            }
            Some(CircuitTransition::Closed) => {
                info!(agent_id = %agent_id, "Agent circuit closed");
                self.emit(EngineEvent::AgentCircuitClosed {
                    agent_id: agent_id.to_string(),
                });
            }
            None => {}
        }
    }

    fn weights_for(&self, votes: &[Vote]) -> Vec<f64> {
        let calibration = lock(&self.calibration);
        votes
            .iter()
            .map(|v| calibration.weight_of(v.agent_id()))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    async fn submit(
        &self,
        item: &Item,
        context: &Context,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<Submission, EngineError> {
        validate_item(item)?;
        let snapshot = self.snapshot().await?;
        let id = judgment_id(item, context, snapshot.version(), &self.weighted_agents());

        let _claim = loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            match self.claim(&id) {
                Claim::Done(existing) => {
                    debug!(judgment_id = %id, "Returning existing submission");
                    return Ok(existing);
                }
                Claim::Owned(claim) => break claim,
                Claim::Busy => debug!(judgment_id = %id, "Same judgment in flight; waiting"),
            }
            if is_cancelled(cancel_flag) {
                return Err(EngineError::Cancelled);
            }
            tokio::select! {
                _ = &mut settled => {}
                _ = tokio::time::sleep(CANCEL_POLL), if cancel_flag.is_some() => {}
            }
        };

        let Ballot {
            mut votes,
            mut abstentions,
        } = self
            .collect_votes(&self.panel, item, context, &snapshot, cancel_flag)
            .await?;

        let mut budget = EscalationBudget::new(&self.config.escalation, self.reserve.len());
        let mut reserve_cursor = 0;
        loop {
            let weights = self.weights_for(&votes);
            let aggregation = aggregate(&votes, &weights);
            let contested = most_contested_axiom(&votes, &snapshot);

            if let Some(veto) = find_veto(&votes, |a| self.is_veto_capable(a)) {
                let agent_id = veto.agent_id().to_string();
                let aggregation = aggregation.ok();
                match self.config.dissensus.veto_mode {
                    VetoMode::Absolute => {
                        info!(judgment_id = %id, agent_id = %agent_id, "Veto forces rejection");
                        return self
                            .finalize(Verdicts {
                                id: &id,
                                item,
                                verdict: Position::StrongNo,
                                confidence: aggregation
                                    .as_ref()
                                    .map_or(PHI_INV_2, |a| a.collective_confidence),
                                activation: aggregation
                                    .as_ref()
                                    .map_or(Position::StrongNo.value(), |a| a.activation),
                                votes,
                                abstentions,
                                registry_version: snapshot.version(),
                                resolution: Resolution::Veto { agent_id },
                                contested_axiom: contested,
                            })
                            .await;
                    }
                    VetoMode::Escalate => {
                        return self.defer(StoredEscalation {
                            request: self.escalation_request(
                                &id,
                                item,
                                vec![DissensusTrigger::Veto { agent_id }],
                                &votes,
                                EscalationAction::DeferExternal,
                                budget.rounds_used() + 1,
                            ),
                            item: item.clone(),
                            votes,
                            abstentions,
                            aggregation,
                            registry_version: snapshot.version(),
                            contested_axiom: contested,
                        })
                        .await;
                    }
                }
            }

            let aggregation = match aggregation {
                Ok(a) => a,
                Err(_) => {
                    warn!(
                        judgment_id = %id,
                        votes = votes.len(),
                        abstentions = abstentions.len(),
                        "No quorum"
                    );
                    return Err(EngineError::NoQuorum);
                }
            };

            let triggers = aggregate_triggers(&self.config.dissensus, &aggregation);
            if triggers.is_empty() {
                let resolution = match budget.rounds_used() {
                    0 => Resolution::Consensus,
                    rounds => Resolution::Escalated { rounds },
                };
                return self
                    .finalize(Verdicts {
                        id: &id,
                        item,
                        verdict: aggregation.verdict,
                        confidence: aggregation.collective_confidence,
                        activation: aggregation.activation,
                        votes,
                        abstentions,
                        registry_version: snapshot.version(),
                        resolution,
                        contested_axiom: contested,
                    })
                    .await;
            }

            match budget.next_round() {
                Some(requested) => {
                    let request = self.escalation_request(
                        &id,
                        item,
                        triggers,
                        &votes,
                        EscalationAction::RequestAdditionalVotes { requested },
                        budget.rounds_used(),
                    );
                    info!(
                        judgment_id = %id,
                        round = request.round,
                        requested,
                        "Dissensus; requesting additional votes"
                    );
                    self.emit(EngineEvent::EscalationRequested { request });
                    let end = (reserve_cursor + requested).min(self.reserve.len());
                    let extra = self
                        .collect_votes(
                            &self.reserve[reserve_cursor..end],
                            item,
                            context,
                            &snapshot,
                            cancel_flag,
                        )
                        .await?;
                    reserve_cursor = end;
                    votes.extend(extra.votes);
                    abstentions.extend(extra.abstentions);
                }
                None if self.config.escalation.defer_external => {
                    return self.defer(StoredEscalation {
                        request: self.escalation_request(
                            &id,
                            item,
                            triggers,
                            &votes,
                            EscalationAction::DeferExternal,
                            budget.rounds_used() + 1,
                        ),
                        item: item.clone(),
                        votes,
                        abstentions,
                        aggregation: Some(aggregation),
                        registry_version: snapshot.version(),
                        contested_axiom: contested,
                    })
                    .await;
                }
                None => {
                    warn!(
                        judgment_id = %id,
                        rounds = budget.rounds_used(),
                        activation = aggregation.activation,
                        "Escalation budget exhausted; failing closed"
                    );
                    return self
                        .finalize(Verdicts {
                            id: &id,
                            item,
                            verdict: Position::StrongNo,
                            confidence: aggregation.collective_confidence,
                            activation: aggregation.activation,
                            votes,
                            abstentions,
                            registry_version: snapshot.version(),
                            resolution: Resolution::FailClosed {
                                reason: describe_triggers(&triggers),
                            },
                            contested_axiom: contested,
                        })
                        .await;
                }
            }
        }
    }

    fn escalation_request(
        &self,
        judgment_id: &str,
        item: &Item,
        triggers: Vec<DissensusTrigger>,
        votes: &[Vote],
        action: EscalationAction,
        round: u32,
    ) -> EscalationRequest {
        EscalationRequest {
            id: EscalationRequest::escalation_id(judgment_id, round),
            judgment_id: judgment_id.to_string(),
            item_ref: item.id.clone(),
            triggers,
            disagreement_axis: disagreement_axis(votes, self.config.dissensus.disagreement_axis_len),
            action,
            round,
            fallback_verdict: Position::StrongNo,
            created_at: self.clock.now_ms(),
        }
    }

    async fn defer(&self, pending: StoredEscalation) -> Result<Submission, EngineError> {
        let request = pending.request.clone();
        info!(
            judgment_id = %request.judgment_id,
            escalation_id = %request.id,
            "Deferring judgment to an external decision-maker"
        );
        if let Some(store) = &self.store {
            store.put_escalation(&pending).await?;
        }
        lock(&self.pending).insert(request.id.clone(), pending);
        self.emit(EngineEvent::EscalationRequested {
            request: request.clone(),
        });
        Ok(Submission::Escalation(request))
    }

    async fn finalize(&self, v: Verdicts<'_>) -> Result<Submission, EngineError> {
        let judgment = Judgment::new(JudgmentParts {
            id: v.id.to_string(),
            item_ref: v.item.id.clone(),
            verdict: v.verdict,
            confidence: v.confidence,
            activation: v.activation,
            votes: v.votes,
            abstentions: v.abstentions,
            registry_version: v.registry_version,
            resolution: v.resolution,
            created_at: self.clock.now_ms(),
        })?;
        let entry = StoredJudgment {
            judgment: judgment.clone(),
            features: v.item.features.clone(),
            contested_axiom: v.contested_axiom,
        };
        if let Some(store) = &self.store {
            if !store.put_judgment(&entry).await? {
                if let Some(stored) = store.judgment(v.id).await? {
                    debug!(judgment_id = %v.id, "Judgment already stored; keeping the stored one");
                    let judgment = stored.judgment.clone();
                    lock(&self.ledger).insert(stored);
                    return Ok(Submission::Judgment(judgment));
                }
            }
        }
        lock(&self.ledger).insert(entry);

        info!(
            judgment_id = %judgment.id(),
            item_ref = %judgment.item_ref(),
            verdict = judgment.verdict().as_str(),
            confidence = judgment.confidence(),
            abstentions = judgment.abstentions().len(),
            "Judgment created"
        );
        self.emit(EngineEvent::JudgmentCreated {
            judgment_id: judgment.id().to_string(),
            item_ref: judgment.item_ref().to_string(),
            verdict: judgment.verdict(),
            confidence: judgment.confidence(),
            resolution: judgment.resolution().clone(),
            registry_version: judgment.registry_version(),
        });
        Ok(Submission::Judgment(judgment))
    }

    async fn resolve_escalation(
        &self,
        escalation_id: &str,
        decision: EscalationDecision,
    ) -> Result<Judgment, EngineError> {
        // Removing the entry claims it; a concurrent resolve sees it unknown.
        let pending = lock(&self.pending)
            .remove(escalation_id)
            .ok_or_else(|| EngineError::UnknownEscalation(escalation_id.to_string()))?;
        let confidence = pending
            .aggregation
            .as_ref()
            .map_or(PHI_INV_2, |a| a.collective_confidence);
        let activation = pending
            .aggregation
            .as_ref()
            .map_or(0.0, |a| a.activation);
        let (verdict, resolution) = match decision {
            EscalationDecision::Decide {
                verdict,
                decided_by,
            } => (verdict, Resolution::ExternalDecision { decided_by }),
            EscalationDecision::Expire => {
                warn!(escalation_id = %escalation_id, "Escalation expired; failing closed");
                (
                    pending.request.fallback_verdict,
                    Resolution::FailClosed {
                        reason: "escalation expired".to_string(),
                    },
                )
            }
        };
        let finalized = self
            .finalize(Verdicts {
                id: &pending.request.judgment_id,
                item: &pending.item,
                verdict,
                confidence,
                activation,
                votes: pending.votes.clone(),
                abstentions: pending.abstentions.clone(),
                registry_version: pending.registry_version,
                resolution,
                contested_axiom: pending.contested_axiom,
            })
            .await;
        let judgment = match finalized {
            Ok(Submission::Judgment(judgment)) => judgment,
            Ok(Submission::Escalation(request)) => return Err(EngineError::UnknownEscalation(request.id)),
            Err(e) => {
                lock(&self.pending).insert(escalation_id.to_string(), pending);
                return Err(e);
            }
        };
        if let Some(store) = &self.store {
            // A leftover row is dropped on restore once its judgment exists.
            if let Err(e) = store.remove_escalation(escalation_id).await {
                warn!(escalation_id = %escalation_id, error = %e, "Failed to clear resolved escalation");
            }
        }
        Ok(judgment)
    }

    /// Fail closed on every deferred escalation older than the external
    /// decision timeout.
    async fn expire_overdue_escalations(&self) -> Result<Vec<Judgment>, EngineError> {
        let Some(timeout_ms) = self.config.escalation.external_timeout_ms else {
            return Ok(Vec::new());
        };
        let timeout_ms = i64::try_from(timeout_ms).unwrap_or(i64::MAX);
        let now = self.clock.now_ms();
        let overdue: Vec<String> = lock(&self.pending)
            .values()
            .filter(|p| now.saturating_sub(p.request.created_at) >= timeout_ms)
            .map(|p| p.request.id.clone())
            .collect();
        let mut expired = Vec::with_capacity(overdue.len());
        for escalation_id in overdue {
            match self
                .resolve_escalation(&escalation_id, EscalationDecision::Expire)
                .await
            {
                Ok(judgment) => expired.push(judgment),
                Err(EngineError::UnknownEscalation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    // -------------------------------------------------------------------------
    // Outcomes
    // -------------------------------------------------------------------------

    /// Outcomes are processed one at a time by the worker. The outcome is
    /// consumed once calibration has absorbed it, both in memory and in the
    /// store, so a failure before that point leaves it retryable.
    async fn process_outcome(&self, outcome: Outcome) -> Result<(), EngineError> {
        let entry = {
            let ledger = lock(&self.ledger);
            if ledger.consumed.contains(&outcome.judgment_id) {
                warn!(judgment_id = %outcome.judgment_id, "Duplicate outcome ignored");
                return Ok(());
            }
            ledger
                .judgments
                .get(&outcome.judgment_id)
                .cloned()
                .ok_or_else(|| EngineError::UnknownJudgment(outcome.judgment_id.clone()))?
        };

        let observed = outcome.observed.value();
        let judgment = &entry.judgment;

        let profiles = lock(&self.calibration).preview_votes(judgment.votes(), observed);
        if let Some(store) = &self.store {
            if !store.apply_outcome(&outcome, &profiles).await? {
                warn!(judgment_id = %outcome.judgment_id, "Outcome already applied; ignored");
                lock(&self.ledger).consumed.insert(outcome.judgment_id.clone());
                return Ok(());
            }
        }
        let recalibration = {
            let mut calibration = lock(&self.calibration);
            calibration.merge_profiles(&profiles);
            calibration.record_prediction(judgment.confidence(), observed)
        };
        lock(&self.ledger).consumed.insert(outcome.judgment_id.clone());
        if let Some(signal) = recalibration {
            warn!(ece = signal.ece, samples = signal.samples, "Recalibration needed");
            self.emit(EngineEvent::RecalibrationNeeded {
                ece: signal.ece,
                samples: signal.samples,
            });
        }

        self.confirm_dimensions(judgment, observed).await?;

        let snapshot = self.snapshot().await?;
        let observation = ResidualObservation {
            judgment_id: judgment.id().to_string(),
            confidence: judgment.confidence(),
            observed,
            features: entry.features.clone(),
            contested_axiom: entry.contested_axiom,
        };
        let report = lock(&self.residual).observe(&observation, &snapshot);
        debug!(
            judgment_id = %judgment.id(),
            residual = report.residual,
            p_value = ?report.p_value,
            "Residual observed"
        );
        if let Some(store) = &self.store {
            store
                .put_residual(&ResidualPoint {
                    judgment_id: judgment.id().to_string(),
                    residual: report.residual,
                    features: observation.features,
                    observed_at: outcome.observed_at,
                })
                .await?;
        }
        if let Some(draft) = report.proposal {
            let opened = lock(&self.proposals).open(draft, &snapshot, self.clock.now_ms());
            if let Some(proposal) = opened {
                if let Some(store) = &self.store {
                    store.put_proposal(&proposal).await?;
                }
                info!(
                    proposal_id = %proposal.id,
                    formula = %proposal.proposed_formula,
                    axiom = %proposal.axiom,
                    p_value = proposal.statistical_significance,
                    "Dimension proposed"
                );
                self.emit(EngineEvent::DimensionProposed { proposal });
            }
        }

        if let Some(store) = &self.store {
            store.archive_outcome(&outcome.judgment_id).await?;
        }
        Ok(())
    }

    /// Count a confirmation for each discovered, unlocked dimension whose
    /// score direction matched the observed direction.
    async fn confirm_dimensions(&self, judgment: &Judgment, observed: f64) -> Result<(), EngineError> {
        let snapshot = self.snapshot().await?;
        let confirmed: Vec<String> = snapshot
            .iter()
            .filter(|d| d.is_discovered() && !d.locked)
            .filter(|d| {
                judgment
                    .dimension_scores()
                    .get(&d.id)
                    .is_some_and(|&score| (score >= 0.5) == (observed >= 0.5))
            })
            .map(|d| d.id.clone())
            .collect();
        if confirmed.is_empty() {
            return Ok(());
        }
        let at = self.clock.now_ms();
        let updated = self
            .write_registry(|tx| {
                confirmed
                    .iter()
                    .map(|id| tx.record_confirmation(id, at))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;
        for dim in updated.iter().filter(|d| d.locked) {
            info!(dimension = %dim.id, confirmations = dim.confirmations, "Dimension locked");
        }
        self.persist_registry().await
    }

    // -------------------------------------------------------------------------
    // Governance and administration
    // -------------------------------------------------------------------------

    async fn dimension_vote(
        &self,
        proposal_id: &str,
        agent_id: &str,
        approve: bool,
    ) -> Result<DimensionProposal, EngineError> {
        let eligible = self.panel_ids();
        let (before, mut proposal) = {
            let mut book = lock(&self.proposals);
            let before = book.get(proposal_id).cloned();
            (before, book.vote(proposal_id, agent_id, approve, &eligible)?)
        };

        match proposal.status {
            ProposalStatus::Pending => {}
            ProposalStatus::Approved => {
                let weight = self.config.governance.new_dimension_weight;
                let at = self.clock.now_ms();
                let registered = self
                    .write_registry(|tx| {
                        let def = dimension_def(&proposal, tx.view(), weight, at);
                        tx.register(def)
                    })
                    .await;
                let dimension = match registered {
                    Ok(dimension) => dimension,
                    Err(e) => {
                        warn!(
                            proposal_id = %proposal.id,
                            error = %e,
                            "Approved dimension could not be registered; vote reverted"
                        );
                        if let Some(before) = before {
                            lock(&self.proposals).reopen(before);
                        }
                        return Err(e);
                    }
                };
                let registered = lock(&self.proposals).mark_registered(proposal_id, &dimension.id);
                if let Some(updated) = registered {
                    proposal = updated;
                }
                self.persist_registry().await?;
                info!(
                    proposal_id = %proposal.id,
                    dimension = %dimension.id,
                    formula = %dimension.scoring_fn_ref,
                    "Dimension approved and registered"
                );
                self.emit(EngineEvent::DimensionApproved {
                    proposal_id: proposal.id.clone(),
                    dimension,
                });
            }
            ProposalStatus::Rejected => {
                info!(
                    proposal_id = %proposal.id,
                    formula = %proposal.proposed_formula,
                    rejections = proposal.rejections.len(),
                    "Dimension proposal rejected"
                );
                self.emit(EngineEvent::DimensionRejected {
                    proposal_id: proposal.id.clone(),
                    proposed_formula: proposal.proposed_formula.clone(),
                });
            }
        }
        if let Some(store) = &self.store {
            store.put_proposal(&proposal).await?;
        }
        Ok(proposal)
    }
}

#[async_trait::async_trait]
impl OutcomeHandler for EngineInner {
    async fn handle(&self, outcome: Outcome) {
        let judgment_id = outcome.judgment_id.clone();
        if let Err(e) = self.process_outcome(outcome).await {
            warn!(judgment_id = %judgment_id, error = %e, "Outcome processing failed");
        }
    }
}

fn is_cancelled(cancel_flag: Option<&AtomicBool>) -> bool {
    cancel_flag.is_some_and(|flag| flag.load(AtomicOrdering::Relaxed))
}

fn validate_item(item: &Item) -> Result<(), EngineError> {
    if item.id.trim().is_empty() {
        return Err(EngineError::InvalidRequest("item id must not be empty".into()));
    }
    if let Some((name, value)) = item
        .features
        .iter()
        .find(|(_, v)| !crate::phi::is_unit_interval(**v))
    {
        return Err(EngineError::InvalidRequest(format!(
            "feature {name} = {value} is outside [0, 1]"
        )));
    }
    Ok(())
}

fn describe_triggers(triggers: &[DissensusTrigger]) -> String {
    let parts: Vec<String> = triggers
        .iter()
        .map(|t| match t {
            DissensusTrigger::Split {
                approving_share,
                rejecting_share,
            } => format!("split {approving_share:.2}/{rejecting_share:.2}"),
            DissensusTrigger::Deadlock { activation } => format!("deadlock at {activation:+.3}"),
            DissensusTrigger::Veto { agent_id } => format!("veto by {agent_id}"),
        })
        .collect();
    format!("unresolved dissensus: {}", parts.join(", "))
}

// =============================================================================
// Public handle
// =============================================================================

pub struct JudgmentEngine {
    inner: Arc<EngineInner>,
    queue: OutcomeQueue,
    worker: OutcomeWorker,
}

impl JudgmentEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Default engine restored from `store`.
    pub async fn restore(store: Arc<dyn EngineStore>) -> Result<Self, EngineError> {
        EngineBuilder::new().restore(store).await
    }

    pub async fn submit_for_judgment(
        &self,
        item: &Item,
        context: &Context,
    ) -> Result<Submission, EngineError> {
        self.inner.submit(item, context, None).await
    }

    /// Like [`submit_for_judgment`](Self::submit_for_judgment), abandoning
    /// outstanding votes once `cancel_flag` is set.
    pub async fn submit_with_cancel(
        &self,
        item: &Item,
        context: &Context,
        cancel_flag: &AtomicBool,
    ) -> Result<Submission, EngineError> {
        self.inner.submit(item, context, Some(cancel_flag)).await
    }

    /// Queue an observed outcome. Processing happens in the background;
    /// use [`flush`](Self::flush) to wait for it.
    pub fn report_outcome(&self, judgment_id: &str, observed: ObservedOutcome) -> Result<(), EngineError> {
        if !observed.is_valid() {
            return Err(EngineError::InvalidRequest(format!(
                "observed outcome {observed:?} is outside [0, 1]"
            )));
        }
        self.enqueue(Outcome {
            judgment_id: judgment_id.to_string(),
            observed,
            observed_at: self.inner.clock.now_ms(),
        })
    }

    fn enqueue(&self, outcome: Outcome) -> Result<(), EngineError> {
        self.queue
            .report(outcome)
            .map_err(|_| EngineError::InvalidRequest("outcome queue is closed".into()))
    }

    /// Wait until every outcome reported so far has been processed.
    pub async fn flush(&self) -> Result<(), EngineError> {
        self.queue
            .flush()
            .await
            .map_err(|_| EngineError::InvalidRequest("outcome queue is closed".into()))
    }

    pub async fn dimension_vote(
        &self,
        proposal_id: &str,
        agent_id: &str,
        approve: bool,
    ) -> Result<DimensionProposal, EngineError> {
        self.inner.dimension_vote(proposal_id, agent_id, approve).await
    }

    pub async fn resolve_escalation(
        &self,
        escalation_id: &str,
        decision: EscalationDecision,
    ) -> Result<Judgment, EngineError> {
        self.inner.resolve_escalation(escalation_id, decision).await
    }

    /// Fail closed on deferred escalations older than
    /// `escalation.external_timeout_ms`. Also runs on restore.
    pub async fn expire_overdue_escalations(&self) -> Result<Vec<Judgment>, EngineError> {
        self.inner.expire_overdue_escalations().await
    }

    /// Administrative reset of one agent's track record.
    pub async fn reset_profile(&self, agent_id: &str) -> Result<AgentProfile, EngineError> {
        let known = self
            .inner
            .panel
            .iter()
            .chain(&self.inner.reserve)
            .any(|a| a.id() == agent_id);
        if !known {
            return Err(EngineError::UnknownAgent(agent_id.to_string()));
        }
        let profile = lock(&self.inner.calibration).reset_profile(agent_id);
        if let Some(store) = &self.inner.store {
            store.put_profiles(std::slice::from_ref(&profile)).await?;
        }
        info!(agent_id = %agent_id, "Agent profile reset");
        Ok(profile)
    }

    pub async fn set_dimension_weight(&self, dimension_id: &str, weight: f64) -> Result<Dimension, EngineError> {
        let dimension = self
            .inner
            .write_registry(|tx| tx.set_weight(dimension_id, weight))
            .await?;
        self.inner.persist_registry().await?;
        info!(dimension = %dimension.id, weight, "Dimension re-weighted");
        Ok(dimension)
    }

    pub fn registry(&self) -> &DimensionRegistry {
        &self.inner.registry
    }

    pub async fn snapshot(&self) -> Result<DimensionSnapshot, EngineError> {
        self.inner.snapshot().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn panel_ids(&self) -> Vec<String> {
        self.inner.panel.iter().map(|a| a.id().to_string()).collect()
    }

    pub fn judgment(&self, id: &str) -> Option<Judgment> {
        lock(&self.inner.ledger)
            .judgments
            .get(id)
            .map(|e| e.judgment.clone())
    }

    /// Every judgment in creation order.
    pub fn judgments(&self) -> Vec<Judgment> {
        let ledger = lock(&self.inner.ledger);
        ledger
            .order
            .iter()
            .filter_map(|id| ledger.judgments.get(id))
            .map(|e| e.judgment.clone())
            .collect()
    }

    pub fn is_outcome_consumed(&self, judgment_id: &str) -> bool {
        lock(&self.inner.ledger).consumed.contains(judgment_id)
    }

    pub fn profile(&self, agent_id: &str) -> Option<AgentProfile> {
        lock(&self.inner.calibration).profile(agent_id).cloned()
    }

    pub fn profiles(&self) -> Vec<AgentProfile> {
        lock(&self.inner.calibration).profiles().to_vec()
    }

    pub fn proposals(&self) -> Vec<DimensionProposal> {
        lock(&self.inner.proposals).all().to_vec()
    }

    pub fn pending_escalations(&self) -> Vec<EscalationRequest> {
        lock(&self.inner.pending)
            .values()
            .map(|p| p.request.clone())
            .collect()
    }

    pub fn circuit_state(&self, agent_id: &str) -> CircuitState {
        lock(&self.inner.breakers).state(agent_id)
    }

    pub fn residual_stats(&self) -> ResidualStats {
        lock(&self.inner.residual).stats()
    }

    pub fn calibration_error(&self) -> Option<f64> {
        lock(&self.inner.calibration).ece()
    }

    /// Drain the outcome queue and stop the worker.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        let Self { inner, queue, worker } = self;
        queue
            .flush()
            .await
            .map_err(|_| EngineError::InvalidRequest("outcome queue is closed".into()))?;
        drop(queue);
        drop(inner);
        worker.join().await.map_err(EngineError::InvalidRequest)
    }
}
