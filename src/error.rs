//! Engine-level error taxonomy.

use crate::consensus::AggregationError;
use crate::dimensions::RegistryError;
use crate::events::EventError;
use crate::governance::GovernanceError;
use crate::judgment::ConfidenceBound;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no quorum: every vote carried zero weight")]
    NoQuorum,
    #[error("dimension registry locked by a write transaction")]
    DimensionRegistryLocked,
    #[error("confidence {value} exceeds the phi-inverse bound")]
    ConfidenceBound { value: f64 },
    #[error("judgment cancelled")]
    Cancelled,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown judgment: {0}")]
    UnknownJudgment(String),
    #[error("unknown proposal: {0}")]
    UnknownProposal(String),
    #[error("unknown escalation: {0}")]
    UnknownEscalation(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("agent {agent_id} already voted on proposal {proposal_id}")]
    DuplicateVote {
        proposal_id: String,
        agent_id: String,
    },
    #[error("proposal {0} is closed")]
    ProposalClosed(String),
    #[error("registry error: {0}")]
    Registry(RegistryError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("event error: {0}")]
    Event(#[from] EventError),
}

impl EngineError {
    /// Transient conditions a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoQuorum | Self::DimensionRegistryLocked)
    }

    /// Invariant violations. Processing must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfidenceBound { .. })
    }
}

impl From<AggregationError> for EngineError {
    fn from(err: AggregationError) -> Self {
        match err {
            AggregationError::NoQuorum => Self::NoQuorum,
            mismatch @ AggregationError::WeightMismatch { .. } => {
                Self::InvalidRequest(mismatch.to_string())
            }
        }
    }
}

impl From<ConfidenceBound> for EngineError {
    fn from(err: ConfidenceBound) -> Self {
        Self::ConfidenceBound { value: err.value }
    }
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Locked => Self::DimensionRegistryLocked,
            other => Self::Registry(other),
        }
    }
}

impl From<GovernanceError> for EngineError {
    fn from(err: GovernanceError) -> Self {
        match err {
            GovernanceError::UnknownProposal(id) => Self::UnknownProposal(id),
            GovernanceError::UnknownAgent(id) => Self::UnknownAgent(id),
            GovernanceError::DuplicateVote {
                proposal_id,
                agent_id,
            } => Self::DuplicateVote {
                proposal_id,
                agent_id,
            },
            GovernanceError::ProposalClosed(id) => Self::ProposalClosed(id),
        }
    }
}
