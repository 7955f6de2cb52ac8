#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use judgment_engine::agent::AgentError;
use judgment_engine::dimensions::DimensionSet;
use judgment_engine::{Context, EvaluatorAgent, Item, Position, Vote};

/// Agent that always casts the same vote, optionally after a delay.
pub struct FixedAgent {
    pub id: String,
    pub position: Position,
    pub confidence: f64,
    pub veto: bool,
    pub delay: Option<Duration>,
}

#[async_trait::async_trait]
impl EvaluatorAgent for FixedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_veto_capable(&self) -> bool {
        self.veto
    }

    async fn vote(
        &self,
        item: &Item,
        _context: &Context,
        _dimensions: &DimensionSet,
    ) -> Result<Vote, AgentError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scores: BTreeMap<String, f64> = item
            .features
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        Ok(Vote::new(
            self.id.clone(),
            self.position,
            self.confidence,
            "fixed",
            scores,
        )?)
    }
}

/// Agent whose every vote fails. Counts how often it was asked.
pub struct FailingAgent {
    pub id: String,
    pub calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl EvaluatorAgent for FailingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn vote(
        &self,
        _item: &Item,
        _context: &Context,
        _dimensions: &DimensionSet,
    ) -> Result<Vote, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::Failed("backend unavailable".into()))
    }
}

pub fn failing(id: &str, calls: Arc<AtomicUsize>) -> Arc<dyn EvaluatorAgent> {
    Arc::new(FailingAgent {
        id: id.to_string(),
        calls,
    })
}

pub fn fixed(id: &str, position: Position, confidence: f64) -> Arc<dyn EvaluatorAgent> {
    Arc::new(FixedAgent {
        id: id.to_string(),
        position,
        confidence,
        veto: false,
        delay: None,
    })
}

pub fn veto(id: &str, position: Position, confidence: f64) -> Arc<dyn EvaluatorAgent> {
    Arc::new(FixedAgent {
        id: id.to_string(),
        position,
        confidence,
        veto: true,
        delay: None,
    })
}

pub fn slow(id: &str, delay: Duration) -> Arc<dyn EvaluatorAgent> {
    Arc::new(FixedAgent {
        id: id.to_string(),
        position: Position::Yes,
        confidence: 0.5,
        veto: false,
        delay: Some(delay),
    })
}

pub fn vote(id: &str, position: Position, confidence: f64) -> Vote {
    Vote::new(id, position, confidence, "", BTreeMap::new()).unwrap()
}

/// Item whose every bootstrap feature has the same value.
pub fn uniform_item(id: &str, value: f64) -> Item {
    let features = [
        "accuracy",
        "candor",
        "congruence",
        "coherence",
        "simplicity",
        "completeness",
        "provenance",
        "reproducibility",
        "transparency",
        "relevance",
        "novelty",
        "alignment",
        "utility",
        "efficiency",
        "sustainability",
    ];
    features
        .iter()
        .fold(Item::new(id, "test item"), |item, f| item.with_feature(*f, value))
}
