//! Weighted vote aggregation.
//!
//! Sequential and pure: votes are folded in the order given, so the same
//! votes and weights always produce bit-identical results.

use serde::{Deserialize, Serialize};

use crate::agent::{Position, Verdict, Vote};
use crate::phi::{bounded_sigmoid, clamp_confidence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AggregationError {
    #[error("no quorum: total effective vote weight is zero")]
    NoQuorum,
    #[error("{votes} votes but {weights} voting weights")]
    WeightMismatch { votes: usize, weights: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    /// Weighted mean of position values, in `[-1, 1]`.
    pub activation: f64,
    pub collective_confidence: f64,
    pub verdict: Verdict,
    /// Share of total weight cast for `StrongYes` or `Yes`.
    pub approving_share: f64,
    /// Share of total weight cast for `No` or `StrongNo`.
    pub rejecting_share: f64,
    pub total_weight: f64,
}

/// Effective weight of one vote.
pub fn effective_weight(vote: &Vote, voting_weight: f64) -> f64 {
    let w = vote.confidence() * voting_weight;
    if w.is_finite() && w > 0.0 {
        w
    } else {
        0.0
    }
}

/// Aggregate `votes`; `weights[i]` is the voting weight of `votes[i]`'s agent.
pub fn aggregate(votes: &[Vote], weights: &[f64]) -> Result<Aggregation, AggregationError> {
    if votes.len() != weights.len() {
        return Err(AggregationError::WeightMismatch {
            votes: votes.len(),
            weights: weights.len(),
        });
    }

    let mut total = 0.0;
    let mut signed = 0.0;
    let mut approving = 0.0;
    let mut rejecting = 0.0;
    for (vote, &voting_weight) in votes.iter().zip(weights) {
        let w = effective_weight(vote, voting_weight);
        total += w;
        signed += vote.position().value() * w;
        if vote.position().is_approving() {
            approving += w;
        } else {
            rejecting += w;
        }
    }

    if total <= 0.0 {
        return Err(AggregationError::NoQuorum);
    }

    let activation = (signed / total).clamp(-1.0, 1.0);
    Ok(Aggregation {
        activation,
        collective_confidence: clamp_confidence(bounded_sigmoid(activation)),
        verdict: Position::from_activation(activation),
        approving_share: approving / total,
        rejecting_share: rejecting / total,
        total_weight: total,
    })
}
