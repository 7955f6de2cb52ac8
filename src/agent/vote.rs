//! Positions and votes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::phi::{check_confidence, is_unit_interval, PHI_INV, PHI_INV_2};

/// Score at or above which an agent votes `StrongYes`.
pub const STRONG_YES_SCORE: f64 = 0.82;

/// Activation thresholds on the signed range `[-1, 1]`.
pub const STRONG_ACTIVATION: f64 = 0.3;

/// A vote position, also used as the judgment verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Position {
    StrongYes,
    Yes,
    No,
    StrongNo,
}

/// Verdicts share the four-way scale with vote positions.
pub type Verdict = Position;

impl Position {
    /// Signed value used by the aggregator.
    pub fn value(self) -> f64 {
        match self {
            Self::StrongYes => 1.0,
            Self::Yes => 0.5,
            Self::No => -0.5,
            Self::StrongNo => -1.0,
        }
    }

    pub fn is_approving(self) -> bool {
        matches!(self, Self::StrongYes | Self::Yes)
    }

    /// Map an agent's raw score in `[0, 1]`.
    pub fn from_score(score: f64) -> Self {
        if score >= STRONG_YES_SCORE {
            Self::StrongYes
        } else if score >= PHI_INV {
            Self::Yes
        } else if score >= PHI_INV_2 {
            Self::No
        } else {
            Self::StrongNo
        }
    }

    /// Map an aggregate activation in `[-1, 1]`.
    pub fn from_activation(activation: f64) -> Self {
        if activation > STRONG_ACTIVATION {
            Self::StrongYes
        } else if activation > 0.0 {
            Self::Yes
        } else if activation > -STRONG_ACTIVATION {
            Self::No
        } else {
            Self::StrongNo
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrongYes => "STRONG_YES",
            Self::Yes => "YES",
            Self::No => "NO",
            Self::StrongNo => "STRONG_NO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STRONG_YES" => Some(Self::StrongYes),
            "YES" => Some(Self::Yes),
            "NO" => Some(Self::No),
            "STRONG_NO" => Some(Self::StrongNo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VoteError {
    #[error("vote confidence {0} exceeds the phi-inverse ceiling or is invalid")]
    ConfidenceBound(f64),
    #[error("dimension score for {dimension} is outside [0, 1]: {value}")]
    InvalidDimensionScore { dimension: String, value: f64 },
    #[error("agent id must not be empty")]
    EmptyAgentId,
}

/// One agent's independent judgment. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "VoteRecord")]
pub struct Vote {
    agent_id: String,
    position: Position,
    confidence: f64,
    reasoning: String,
    dimension_scores: BTreeMap<String, f64>,
}

impl Vote {
    pub fn new(
        agent_id: impl Into<String>,
        position: Position,
        confidence: f64,
        reasoning: impl Into<String>,
        dimension_scores: BTreeMap<String, f64>,
    ) -> Result<Self, VoteError> {
        let agent_id = agent_id.into();
        if agent_id.trim().is_empty() {
            return Err(VoteError::EmptyAgentId);
        }
        let confidence = check_confidence(confidence).map_err(VoteError::ConfidenceBound)?;
        for (dimension, &value) in &dimension_scores {
            if !is_unit_interval(value) {
                return Err(VoteError::InvalidDimensionScore {
                    dimension: dimension.clone(),
                    value,
                });
            }
        }
        Ok(Self {
            agent_id,
            position,
            confidence,
            reasoning: reasoning.into(),
            dimension_scores,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn dimension_scores(&self) -> &BTreeMap<String, f64> {
        &self.dimension_scores
    }
}

#[derive(Deserialize)]
struct VoteRecord {
    agent_id: String,
    position: Position,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    dimension_scores: BTreeMap<String, f64>,
}

impl TryFrom<VoteRecord> for Vote {
    type Error = VoteError;

    fn try_from(r: VoteRecord) -> Result<Self, Self::Error> {
        Vote::new(
            r.agent_id,
            r.position,
            r.confidence,
            r.reasoning,
            r.dimension_scores,
        )
    }
}
