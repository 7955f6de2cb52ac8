//! The judgment record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::{Verdict, Vote};
use crate::phi::{check_confidence, PHI_INV_2};
use crate::scoring::{Context, Item};

/// How the verdict was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    Consensus,
    Veto { agent_id: String },
    /// Resolved after `rounds` rounds of additional votes.
    Escalated { rounds: u32 },
    FailClosed { reason: String },
    ExternalDecision { decided_by: String },
}

impl Resolution {
    /// Resolutions that impose `StrongNo` regardless of the votes.
    pub fn is_forced_rejection(&self) -> bool {
        matches!(self, Self::Veto { .. } | Self::FailClosed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("judgment confidence {value} exceeds the phi-inverse ceiling")]
pub struct ConfidenceBound {
    pub value: f64,
}

/// Field values for [`Judgment::new`].
#[derive(Debug, Clone)]
pub struct JudgmentParts {
    pub id: String,
    pub item_ref: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub activation: f64,
    pub votes: Vec<Vote>,
    pub abstentions: Vec<String>,
    pub registry_version: u64,
    pub resolution: Resolution,
    pub created_at: i64,
}

/// Final output of the engine for one item. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JudgmentRecord")]
pub struct Judgment {
    id: String,
    item_ref: String,
    verdict: Verdict,
    confidence: f64,
    activation: f64,
    votes: Vec<Vote>,
    abstentions: Vec<String>,
    dimension_scores: BTreeMap<String, f64>,
    registry_version: u64,
    resolution: Resolution,
    created_at: i64,
}

impl Judgment {
    /// Rejects a confidence above φ⁻¹. Forced rejections are capped at φ⁻².
    pub fn new(parts: JudgmentParts) -> Result<Self, ConfidenceBound> {
        let mut confidence = check_confidence(parts.confidence)
            .map_err(|value| ConfidenceBound { value })?;
        if parts.resolution.is_forced_rejection() {
            confidence = confidence.min(PHI_INV_2);
        }
        let dimension_scores = mean_dimension_scores(&parts.votes);
        Ok(Self {
            id: parts.id,
            item_ref: parts.item_ref,
            verdict: parts.verdict,
            confidence,
            activation: parts.activation,
            votes: parts.votes,
            abstentions: parts.abstentions,
            dimension_scores,
            registry_version: parts.registry_version,
            resolution: parts.resolution,
            created_at: parts.created_at,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn item_ref(&self) -> &str {
        &self.item_ref
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    /// Collective probability that the item is good, in `[0, φ⁻¹]`.
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn activation(&self) -> f64 {
        self.activation
    }

    pub fn votes(&self) -> &[Vote] {
        &self.votes
    }

    /// Agents that timed out or failed.
    pub fn abstentions(&self) -> &[String] {
        &self.abstentions
    }

    /// Mean score per dimension across the votes that scored it.
    pub fn dimension_scores(&self) -> &BTreeMap<String, f64> {
        &self.dimension_scores
    }

    pub fn registry_version(&self) -> u64 {
        self.registry_version
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }
}

fn mean_dimension_scores(votes: &[Vote]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for vote in votes {
        for (dim, &score) in vote.dimension_scores() {
            let entry = sums.entry(dim.clone()).or_insert((0.0, 0));
            entry.0 += score;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(dim, (sum, n))| (dim, sum / n as f64))
        .collect()
}

#[derive(Deserialize)]
struct JudgmentRecord {
    id: String,
    item_ref: String,
    verdict: Verdict,
    confidence: f64,
    activation: f64,
    votes: Vec<Vote>,
    #[serde(default)]
    abstentions: Vec<String>,
    registry_version: u64,
    resolution: Resolution,
    created_at: i64,
}

impl TryFrom<JudgmentRecord> for Judgment {
    type Error = ConfidenceBound;

    fn try_from(r: JudgmentRecord) -> Result<Self, Self::Error> {
        Judgment::new(JudgmentParts {
            id: r.id,
            item_ref: r.item_ref,
            verdict: r.verdict,
            confidence: r.confidence,
            activation: r.activation,
            votes: r.votes,
            abstentions: r.abstentions,
            registry_version: r.registry_version,
            resolution: r.resolution,
            created_at: r.created_at,
        })
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Deterministic judgment id over everything that shapes the result.
/// `agents` pairs each voting agent with its current voting weight, so a
/// recalibrated panel judges the same item afresh.
pub fn judgment_id(item: &Item, context: &Context, registry_version: u64, agents: &[(&str, f64)]) -> String {
    let features = serde_json::to_string(&item.features).unwrap_or_default();
    let context = serde_json::to_string(context).unwrap_or_default();
    let content_hash = hash_text(&item.content);
    let version = registry_version.to_string();
    let agents = agents
        .iter()
        .map(|(id, weight)| format!("{id}={:016x}", weight.to_bits()))
        .collect::<Vec<_>>()
        .join(",");
    hash_fields(&[&item.id, &content_hash, &features, &context, &version, &agents])
}

pub(crate) fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

pub(crate) fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Position;

    fn parts(confidence: f64, resolution: Resolution) -> JudgmentParts {
        JudgmentParts {
            id: "j".into(),
            item_ref: "item".into(),
            verdict: Position::StrongNo,
            confidence,
            activation: 0.4,
            votes: Vec::new(),
            abstentions: Vec::new(),
            registry_version: 1,
            resolution,
            created_at: 0,
        }
    }

    #[test]
    fn rejects_confidence_above_ceiling() {
        let err = Judgment::new(parts(0.7, Resolution::Consensus)).unwrap_err();
        assert_eq!(err.value, 0.7);
    }

    #[test]
    fn forced_rejection_caps_confidence() {
        let veto = Resolution::Veto {
            agent_id: "sentinel".into(),
        };
        let j = Judgment::new(parts(0.6, veto)).unwrap();
        assert!((j.confidence() - PHI_INV_2).abs() < 1e-12);
    }

    #[test]
    fn id_depends_on_registry_version() {
        let item = Item::new("a", "text").with_feature("accuracy", 0.5);
        let ctx = Context::new("code");
        let panel = [("x", 0.25), ("y", 0.25)];
        let a = judgment_id(&item, &ctx, 1, &panel);
        assert_eq!(a, judgment_id(&item, &ctx, 1, &panel));
        assert_ne!(a, judgment_id(&item, &ctx, 2, &panel));
    }

    #[test]
    fn id_depends_on_agent_weights() {
        let item = Item::new("a", "text");
        let ctx = Context::new("code");
        let a = judgment_id(&item, &ctx, 1, &[("x", 0.25), ("y", 0.25)]);
        assert_ne!(a, judgment_id(&item, &ctx, 1, &[("x", 0.25), ("y", 0.3)]));
    }
}
