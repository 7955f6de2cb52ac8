//! Dimension proposals and panel voting on them.
//!
//! A proposal passes once approvals reach `approve_quorum` of the eligible
//! panel, and fails once rejections make that unreachable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::GovernanceConfig;
use crate::dimensions::{Axiom, DimensionDef, DimensionSet};
use crate::judgment::hash_fields;
use crate::residual::ProposalDraft;
use crate::scoring::ScoringFormula;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionProposal {
    pub id: String,
    pub pattern_description: String,
    pub residual_magnitude: f64,
    /// p-value of the residual pattern.
    pub statistical_significance: f64,
    pub proposed_formula: String,
    pub axiom: Axiom,
    pub source_judgment: String,
    pub status: ProposalStatus,
    pub approvals: Vec<String>,
    pub rejections: Vec<String>,
    pub created_at: i64,
    /// Id of the registered dimension once approved.
    #[serde(default)]
    pub dimension_id: Option<String>,
}

impl DimensionProposal {
    fn has_voted(&self, agent_id: &str) -> bool {
        self.approvals.iter().chain(&self.rejections).any(|a| a == agent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GovernanceError {
    #[error("unknown proposal: {0}")]
    UnknownProposal(String),
    #[error("agent {0} is not on the voting panel")]
    UnknownAgent(String),
    #[error("agent {agent_id} already voted on proposal {proposal_id}")]
    DuplicateVote {
        proposal_id: String,
        agent_id: String,
    },
    #[error("proposal {0} is no longer pending")]
    ProposalClosed(String),
}

#[derive(Debug, Default)]
pub struct ProposalBook {
    config: GovernanceConfig,
    proposals: Vec<DimensionProposal>,
    index: HashMap<String, usize>,
}

impl ProposalBook {
    pub fn new(config: GovernanceConfig) -> Self {
        Self {
            config,
            proposals: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn with_proposals(config: GovernanceConfig, proposals: Vec<DimensionProposal>) -> Self {
        let mut book = Self::new(config);
        for proposal in proposals {
            book.insert(proposal);
        }
        book
    }

    fn insert(&mut self, proposal: DimensionProposal) {
        match self.index.get(&proposal.id) {
            Some(&slot) => self.proposals[slot] = proposal,
            None => {
                self.index.insert(proposal.id.clone(), self.proposals.len());
                self.proposals.push(proposal);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&DimensionProposal> {
        self.index.get(id).map(|&slot| &self.proposals[slot])
    }

    pub fn all(&self) -> &[DimensionProposal] {
        &self.proposals
    }

    pub fn pending(&self) -> impl Iterator<Item = &DimensionProposal> {
        self.proposals
            .iter()
            .filter(|p| p.status == ProposalStatus::Pending)
    }

    /// Open a proposal from a draft. `None` when the same formula is already
    /// pending or already read by a registered dimension.
    pub fn open(
        &mut self,
        draft: ProposalDraft,
        snapshot: &DimensionSet,
        at_ms: i64,
    ) -> Option<DimensionProposal> {
        if snapshot.has_scoring_ref(&draft.proposed_formula)
            || self
                .pending()
                .any(|p| p.proposed_formula == draft.proposed_formula)
        {
            return None;
        }
        let id = format!(
            "prop-{}",
            &hash_fields(&[&draft.source_judgment, &draft.proposed_formula])[..16]
        );
        if self.index.contains_key(&id) {
            return None;
        }
        let proposal = DimensionProposal {
            id,
            pattern_description: draft.pattern_description,
            residual_magnitude: draft.residual_magnitude,
            statistical_significance: draft.statistical_significance,
            proposed_formula: draft.proposed_formula,
            axiom: draft.axiom,
            source_judgment: draft.source_judgment,
            status: ProposalStatus::Pending,
            approvals: Vec::new(),
            rejections: Vec::new(),
            created_at: at_ms,
            dimension_id: None,
        };
        self.insert(proposal.clone());
        Some(proposal)
    }

    /// Record one panel vote and apply the quorum rule.
    pub fn vote(
        &mut self,
        proposal_id: &str,
        agent_id: &str,
        approve: bool,
        eligible: &[&str],
    ) -> Result<DimensionProposal, GovernanceError> {
        if !eligible.contains(&agent_id) {
            return Err(GovernanceError::UnknownAgent(agent_id.to_string()));
        }
        let slot = *self
            .index
            .get(proposal_id)
            .ok_or_else(|| GovernanceError::UnknownProposal(proposal_id.to_string()))?;
        let quorum = self.config.approve_quorum;
        let proposal = &mut self.proposals[slot];
        if proposal.status != ProposalStatus::Pending {
            return Err(GovernanceError::ProposalClosed(proposal_id.to_string()));
        }
        if proposal.has_voted(agent_id) {
            return Err(GovernanceError::DuplicateVote {
                proposal_id: proposal_id.to_string(),
                agent_id: agent_id.to_string(),
            });
        }
        if approve {
            proposal.approvals.push(agent_id.to_string());
        } else {
            proposal.rejections.push(agent_id.to_string());
        }

        let eligible = eligible.len().max(1) as f64;
        if proposal.approvals.len() as f64 / eligible >= quorum {
            proposal.status = ProposalStatus::Approved;
        } else if proposal.rejections.len() as f64 / eligible > 1.0 - quorum {
            proposal.status = ProposalStatus::Rejected;
        }
        Ok(proposal.clone())
    }

    /// Put a proposal back as it was before a vote whose effect could not be
    /// applied.
    pub fn reopen(&mut self, previous: DimensionProposal) {
        self.insert(previous);
    }

    /// Link an approved proposal to the dimension registered for it.
    pub fn mark_registered(&mut self, proposal_id: &str, dimension_id: &str) -> Option<DimensionProposal> {
        let slot = *self.index.get(proposal_id)?;
        self.proposals[slot].dimension_id = Some(dimension_id.to_string());
        Some(self.proposals[slot].clone())
    }
}

/// Definition registered when `proposal` is approved.
///
/// The id is the formula's feature (`low_<feature>` for inverse formulas),
/// suffixed when it collides with an existing dimension.
pub fn dimension_def(
    proposal: &DimensionProposal,
    snapshot: &DimensionSet,
    weight: f64,
    at_ms: i64,
) -> DimensionDef {
    let base = match ScoringFormula::parse(&proposal.proposed_formula) {
        Some(ScoringFormula::Inverse(f)) => format!("low_{f}"),
        Some(formula) => formula.feature().unwrap_or("residual").to_string(),
        None => "residual".to_string(),
    };
    let mut id = base.clone();
    let mut n = 2;
    while snapshot.get(&id).is_some() {
        id = format!("{base}_{n}");
        n += 1;
    }
    let mut def = DimensionDef::new(id, proposal.axiom, weight, proposal.proposed_formula.clone())
        .described(proposal.pattern_description.clone());
    def.discovered_at = Some(at_ms);
    def
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::DimensionRegistry;

    fn draft(formula: &str) -> ProposalDraft {
        ProposalDraft {
            pattern_description: "test".into(),
            residual_magnitude: 0.45,
            statistical_significance: 0.01,
            proposed_formula: formula.into(),
            axiom: Axiom::Culture,
            source_judgment: "j1".into(),
        }
    }

    #[test]
    fn duplicate_formula_is_not_reopened() {
        let registry = DimensionRegistry::bootstrap();
        let snap = registry.snapshot().unwrap();
        let mut book = ProposalBook::new(GovernanceConfig::default());
        assert!(book.open(draft("feature(humor)"), &snap, 0).is_some());
        assert!(book.open(draft("feature(humor)"), &snap, 1).is_none());
        // Already read by a bootstrap dimension.
        assert!(book.open(draft("feature(accuracy)"), &snap, 2).is_none());
    }

    #[test]
    fn quorum_of_eleven_needs_seven_approvals() {
        let registry = DimensionRegistry::bootstrap();
        let snap = registry.snapshot().unwrap();
        let mut book = ProposalBook::new(GovernanceConfig::default());
        let id = book.open(draft("feature(humor)"), &snap, 0).unwrap().id;
        let panel: Vec<String> = (0..11).map(|i| format!("a{i}")).collect();
        let eligible: Vec<&str> = panel.iter().map(String::as_str).collect();
        for agent in &eligible[..6] {
            let p = book.vote(&id, agent, true, &eligible).unwrap();
            assert_eq!(p.status, ProposalStatus::Pending);
        }
        let p = book.vote(&id, eligible[6], true, &eligible).unwrap();
        assert_eq!(p.status, ProposalStatus::Approved);
        assert_eq!(
            book.vote(&id, eligible[7], true, &eligible),
            Err(GovernanceError::ProposalClosed(id.clone()))
        );
    }

    #[test]
    fn five_rejections_of_eleven_reject() {
        let registry = DimensionRegistry::bootstrap();
        let snap = registry.snapshot().unwrap();
        let mut book = ProposalBook::new(GovernanceConfig::default());
        let id = book.open(draft("inverse(noise)"), &snap, 0).unwrap().id;
        let panel: Vec<String> = (0..11).map(|i| format!("a{i}")).collect();
        let eligible: Vec<&str> = panel.iter().map(String::as_str).collect();
        for agent in &eligible[..4] {
            book.vote(&id, agent, false, &eligible).unwrap();
        }
        assert!(matches!(
            book.vote(&id, eligible[0], true, &eligible),
            Err(GovernanceError::DuplicateVote { .. })
        ));
        let p = book.vote(&id, eligible[4], false, &eligible).unwrap();
        assert_eq!(p.status, ProposalStatus::Rejected);
        assert_eq!(dimension_def(&p, &snap, 0.38, 5).id, "low_noise");
    }

    #[test]
    fn reopened_proposal_accepts_the_vote_again() {
        let registry = DimensionRegistry::bootstrap();
        let snap = registry.snapshot().unwrap();
        let mut book = ProposalBook::new(GovernanceConfig::default());
        let id = book.open(draft("feature(humor)"), &snap, 0).unwrap().id;
        let eligible = ["a0"];
        let before = book.get(&id).cloned().unwrap();

        let p = book.vote(&id, "a0", true, &eligible).unwrap();
        assert_eq!(p.status, ProposalStatus::Approved);
        book.reopen(before);

        let p = book.get(&id).unwrap();
        assert_eq!(p.status, ProposalStatus::Pending);
        assert!(p.approvals.is_empty());
        assert_eq!(book.pending().count(), 1);
        let p = book.vote(&id, "a0", true, &eligible).unwrap();
        assert_eq!(p.status, ProposalStatus::Approved);
    }
}
