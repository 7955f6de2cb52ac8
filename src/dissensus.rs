//! Disagreement detection and escalation planning.
//!
//! Three triggers stop a vote from becoming a plain consensus judgment:
//! a weighted split between approving and rejecting groups, a near-zero
//! activation, and a `StrongNo` from a veto-capable agent. What happens next
//! is decided here as data; the engine carries it out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::{Position, Verdict, Vote};
use crate::config::{DissensusConfig, EscalationConfig};
use crate::consensus::Aggregation;
use crate::dimensions::{Axiom, DimensionSet};
use crate::phi::variance;

/// How a veto-capable agent's `StrongNo` is honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoMode {
    /// Final `StrongNo` judgment, whatever the other votes say.
    #[default]
    Absolute,
    /// Hand the decision to an external decision-maker.
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DissensusTrigger {
    Split {
        approving_share: f64,
        rejecting_share: f64,
    },
    Deadlock {
        activation: f64,
    },
    Veto {
        agent_id: String,
    },
}

/// Outcome of checking one round of votes.
#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    Consensus,
    Veto { agent_id: String },
    Dissensus(Vec<DissensusTrigger>),
}

/// First `StrongNo` cast by a veto-capable agent, in vote order.
pub fn find_veto<'a, F>(votes: &'a [Vote], is_veto_capable: F) -> Option<&'a Vote>
where
    F: Fn(&str) -> bool,
{
    votes
        .iter()
        .find(|v| v.position() == Position::StrongNo && is_veto_capable(v.agent_id()))
}

/// Split and deadlock triggers for an aggregation.
pub fn aggregate_triggers(config: &DissensusConfig, agg: &Aggregation) -> Vec<DissensusTrigger> {
    let mut triggers = Vec::new();
    if agg.approving_share >= config.split_share && agg.rejecting_share >= config.split_share {
        triggers.push(DissensusTrigger::Split {
            approving_share: agg.approving_share,
            rejecting_share: agg.rejecting_share,
        });
    }
    if agg.activation.abs() < config.deadlock_band {
        triggers.push(DissensusTrigger::Deadlock {
            activation: agg.activation,
        });
    }
    triggers
}

/// Classify one round. A veto is checked before the aggregate triggers.
pub fn assess<F>(
    config: &DissensusConfig,
    votes: &[Vote],
    agg: &Aggregation,
    is_veto_capable: F,
) -> Assessment
where
    F: Fn(&str) -> bool,
{
    if let Some(veto) = find_veto(votes, is_veto_capable) {
        let agent_id = veto.agent_id().to_string();
        return match config.veto_mode {
            VetoMode::Absolute => Assessment::Veto { agent_id },
            VetoMode::Escalate => Assessment::Dissensus(vec![DissensusTrigger::Veto { agent_id }]),
        };
    }
    let triggers = aggregate_triggers(config, agg);
    if triggers.is_empty() {
        Assessment::Consensus
    } else {
        Assessment::Dissensus(triggers)
    }
}

// =============================================================================
// Disagreement axis
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionVariance {
    pub dimension_id: String,
    pub variance: f64,
}

/// Per-dimension variance of scores across agents that scored it.
///
/// Dimensions scored by fewer than two agents are skipped. Sorted by
/// variance, highest first, ties by id.
pub fn dimension_variances(votes: &[Vote]) -> Vec<DimensionVariance> {
    let mut scores: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for vote in votes {
        for (dim, &score) in vote.dimension_scores() {
            scores.entry(dim.as_str()).or_default().push(score);
        }
    }
    let mut out: Vec<DimensionVariance> = scores
        .into_iter()
        .filter(|(_, s)| s.len() >= 2)
        .map(|(id, s)| DimensionVariance {
            dimension_id: id.to_string(),
            variance: variance(&s),
        })
        .collect();
    out.sort_by(|a, b| {
        b.variance
            .total_cmp(&a.variance)
            .then_with(|| a.dimension_id.cmp(&b.dimension_id))
    });
    out
}

/// The `len` dimensions agents disagreed on most.
pub fn disagreement_axis(votes: &[Vote], len: usize) -> Vec<DimensionVariance> {
    let mut all = dimension_variances(votes);
    all.truncate(len);
    all
}

/// Axiom whose dimensions carried the highest mean cross-agent variance.
///
/// Ties resolve to the earlier axiom in declaration order.
pub fn most_contested_axiom(votes: &[Vote], snapshot: &DimensionSet) -> Option<Axiom> {
    let mut sums: BTreeMap<Axiom, (f64, usize)> = BTreeMap::new();
    for dv in dimension_variances(votes) {
        if let Some(dim) = snapshot.get(&dv.dimension_id) {
            let entry = sums.entry(dim.axiom).or_insert((0.0, 0));
            entry.0 += dv.variance;
            entry.1 += 1;
        }
    }
    let mut best: Option<(Axiom, f64)> = None;
    for axiom in Axiom::ALL {
        if let Some(&(sum, n)) = sums.get(&axiom) {
            let mean = sum / n as f64;
            if best.map_or(true, |(_, b)| mean > b) {
                best = Some((axiom, mean));
            }
        }
    }
    best.map(|(axiom, _)| axiom)
}

// =============================================================================
// Escalation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationAction {
    RequestAdditionalVotes { requested: usize },
    DeferExternal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub id: String,
    /// Id the judgment will carry once resolved.
    pub judgment_id: String,
    pub item_ref: String,
    pub triggers: Vec<DissensusTrigger>,
    pub disagreement_axis: Vec<DimensionVariance>,
    pub action: EscalationAction,
    /// 1-based escalation round.
    pub round: u32,
    /// Verdict applied if the escalation is never resolved.
    pub fallback_verdict: Verdict,
    pub created_at: i64,
}

impl EscalationRequest {
    pub fn escalation_id(judgment_id: &str, round: u32) -> String {
        format!("esc-{}-{round}", &judgment_id[..judgment_id.len().min(16)])
    }
}

/// Tracks the extra-vote budget of one submission.
#[derive(Debug, Clone)]
pub struct EscalationBudget {
    max_rounds: u32,
    remaining_agents: usize,
    rounds_used: u32,
}

impl EscalationBudget {
    pub fn new(config: &EscalationConfig, reserve_size: usize) -> Self {
        Self {
            max_rounds: config.max_rounds,
            remaining_agents: config.max_additional_agents.min(reserve_size),
            rounds_used: 0,
        }
    }

    pub fn rounds_used(&self) -> u32 {
        self.rounds_used
    }

    pub fn is_exhausted(&self) -> bool {
        self.rounds_used >= self.max_rounds || self.remaining_agents == 0
    }

    /// Reserve agents to consult in the next round, spreading what is left
    /// evenly over the remaining rounds. `None` once exhausted.
    pub fn next_round(&mut self) -> Option<usize> {
        if self.is_exhausted() {
            return None;
        }
        let rounds_left = (self.max_rounds - self.rounds_used) as usize;
        let take = self.remaining_agents.div_ceil(rounds_left).max(1);
        self.remaining_agents -= take;
        self.rounds_used += 1;
        Some(take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(id: &str, position: Position, scores: &[(&str, f64)]) -> Vote {
        let scores = scores.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        Vote::new(id, position, 0.5, "", scores).unwrap()
    }

    #[test]
    fn axis_orders_by_variance() {
        let votes = vec![
            vote("a", Position::Yes, &[("x", 0.1), ("y", 0.5)]),
            vote("b", Position::No, &[("x", 0.9), ("y", 0.6)]),
        ];
        let axis = disagreement_axis(&votes, 1);
        assert_eq!(axis.len(), 1);
        assert_eq!(axis[0].dimension_id, "x");
    }

    #[test]
    fn budget_spreads_agents_over_rounds() {
        let cfg = EscalationConfig {
            max_rounds: 2,
            max_additional_agents: 3,
            defer_external: false,
            ..EscalationConfig::default()
        };
        let mut budget = EscalationBudget::new(&cfg, 5);
        assert_eq!(budget.next_round(), Some(2));
        assert_eq!(budget.next_round(), Some(1));
        assert_eq!(budget.next_round(), None);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn budget_is_bounded_by_reserve() {
        let cfg = EscalationConfig::default();
        let mut budget = EscalationBudget::new(&cfg, 0);
        assert!(budget.is_exhausted());
        assert_eq!(budget.next_round(), None);
    }
}
