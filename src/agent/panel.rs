//! Stock agent panels.
//!
//! The default panel is eleven agents, one veto-capable, each leaning on a
//! different axiom. The reserve panel supplies escalation votes.

use std::sync::Arc;

use crate::config::SelectionConfig;
use crate::dimensions::Axiom;
use crate::phi::{PHI, PHI_INV};
use crate::scoring::Scorer;
use crate::selection::TopKSelector;

use super::{EvaluatorAgent, ScoringAgent};

/// Agent id of the default panel's veto holder.
pub const SENTINEL_ID: &str = "sentinel";

pub fn default_panel(scorer: Arc<Scorer>) -> Vec<Arc<dyn EvaluatorAgent>> {
    configured_panel(scorer, &SelectionConfig::default())
}

/// Default panel with sparse-navigation settings applied.
pub fn configured_panel(
    scorer: Arc<Scorer>,
    selection: &SelectionConfig,
) -> Vec<Arc<dyn EvaluatorAgent>> {
    let agent = |id: &str| {
        ScoringAgent::new(id, scorer.clone()).with_expand_spread(selection.expand_spread)
    };
    let panel = vec![
        agent(SENTINEL_ID)
            .with_veto(true)
            .with_emphasis(Axiom::Fidelity, PHI)
            .with_emphasis(Axiom::Verification, PHI),
        agent("auditor").with_emphasis(Axiom::Verification, PHI),
        agent("architect").with_emphasis(Axiom::Proportion, PHI),
        agent("chronicler").with_emphasis(Axiom::Culture, PHI),
        agent("steward").with_emphasis(Axiom::Economy, PHI),
        agent("skeptic")
            .with_emphasis(Axiom::Fidelity, PHI)
            .with_emphasis(Axiom::Culture, PHI_INV),
        agent("cartographer")
            .with_emphasis(Axiom::Proportion, PHI)
            .with_emphasis(Axiom::Culture, PHI),
        agent("scout").with_emphasis(Axiom::Culture, PHI).with_emphasis(Axiom::Economy, PHI_INV),
        agent("analyst")
            .with_emphasis(Axiom::Verification, PHI)
            .with_emphasis(Axiom::Proportion, PHI_INV),
        agent("janitor")
            .with_emphasis(Axiom::Economy, PHI)
            .with_emphasis(Axiom::Proportion, PHI),
        agent("oracle").with_selector(Arc::new(TopKSelector::new(selection.top_k))),
    ];
    panel
        .into_iter()
        .map(|a| Arc::new(a) as Arc<dyn EvaluatorAgent>)
        .collect()
}

/// Agents consulted only when a judgment escalates.
pub fn reserve_panel(scorer: Arc<Scorer>) -> Vec<Arc<dyn EvaluatorAgent>> {
    [
        ("arbiter-fidelity", Axiom::Fidelity),
        ("arbiter-verification", Axiom::Verification),
        ("arbiter-economy", Axiom::Economy),
    ]
    .into_iter()
    .map(|(id, axiom)| {
        Arc::new(ScoringAgent::new(id, scorer.clone()).with_emphasis(axiom, PHI))
            as Arc<dyn EvaluatorAgent>
    })
    .collect()
}
