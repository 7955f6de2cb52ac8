//! Evaluator agents.
//!
//! An agent wraps a scorer with an identity and a voting policy. Agents are
//! evaluated concurrently by the engine and share no mutable state while
//! scoring.

pub mod panel;
pub mod scoring_agent;
pub mod vote;

use crate::dimensions::DimensionSet;
use crate::scoring::{Context, Item};

pub use panel::{configured_panel, default_panel, reserve_panel, SENTINEL_ID};
pub use scoring_agent::ScoringAgent;
pub use vote::{Position, Verdict, Vote, VoteError};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Failed(String),
    #[error("invalid vote: {0}")]
    InvalidVote(#[from] VoteError),
}

#[async_trait::async_trait]
pub trait EvaluatorAgent: Send + Sync {
    fn id(&self) -> &str;

    /// Veto-capable agents override aggregation when they vote `StrongNo`.
    fn is_veto_capable(&self) -> bool {
        false
    }

    /// Cast a vote against one consistent registry snapshot.
    async fn vote(
        &self,
        item: &Item,
        context: &Context,
        dimensions: &DimensionSet,
    ) -> Result<Vote, AgentError>;
}
