//! Scorer-backed evaluator agent.
//!
//! Scoring pipeline for one vote:
//! 1. Select dimensions (sparse selectors may pick a subset).
//! 2. Score each dimension; faults score 0 and are recorded in the reasoning.
//! 3. Axiom score = weighted geometric mean of its dimension scores.
//! 4. If a sparse selection leaves axiom scores spread wider than
//!    `expand_spread`, score the remaining active dimensions too.
//! 5. Raw score = weighted geometric mean of axiom scores (agent emphasis).
//! 6. Position from fixed thresholds; confidence clamped to φ⁻¹.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::warn;

use crate::dimensions::{Axiom, Dimension, DimensionSet};
use crate::phi::{clamp_confidence, std_dev, weighted_geometric_mean, PHI_INV_3};
use crate::scoring::{Context, Item, ScoreError, Scorer};
use crate::selection::{AllDimensions, DimensionSelector};

use super::vote::{Position, Vote};
use super::{AgentError, EvaluatorAgent};

/// Axiom-score spread beyond which a sparse selection is widened.
const DEFAULT_EXPAND_SPREAD: f64 = PHI_INV_3;

#[derive(Debug, Clone)]
pub struct ScoringAgent {
    id: String,
    veto: bool,
    emphasis: BTreeMap<Axiom, f64>,
    scorer: Arc<Scorer>,
    selector: Arc<dyn DimensionSelector>,
    expand_spread: f64,
}

/// Intermediate result of scoring, before a vote is built.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub dimension_scores: BTreeMap<String, f64>,
    pub axiom_scores: BTreeMap<Axiom, f64>,
    pub raw_score: f64,
    pub raw_confidence: f64,
    pub faults: Vec<ScoreError>,
    pub expanded: bool,
}

impl ScoringAgent {
    pub fn new(id: impl Into<String>, scorer: Arc<Scorer>) -> Self {
        Self {
            id: id.into(),
            veto: false,
            emphasis: BTreeMap::new(),
            scorer,
            selector: Arc::new(AllDimensions),
            expand_spread: DEFAULT_EXPAND_SPREAD,
        }
    }

    pub fn with_veto(mut self, veto: bool) -> Self {
        self.veto = veto;
        self
    }

    /// Weight of `axiom` in the raw score. Unset axioms weigh 1.0.
    pub fn with_emphasis(mut self, axiom: Axiom, weight: f64) -> Self {
        self.emphasis.insert(axiom, weight.max(0.0));
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn DimensionSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_expand_spread(mut self, spread: f64) -> Self {
        self.expand_spread = spread.max(0.0);
        self
    }

    fn emphasis_for(&self, axiom: Axiom) -> f64 {
        self.emphasis.get(&axiom).copied().unwrap_or(1.0)
    }

    /// Score `item` without building a vote. Deterministic.
    pub fn evaluate(&self, item: &Item, context: &Context, dimensions: &DimensionSet) -> Evaluation {
        let mut selected: Vec<&Dimension> = self.selector.select(dimensions, context);
        if selected.is_empty() {
            selected = dimensions.active().collect();
        }

        let mut scored: Vec<(&Dimension, f64)> = Vec::with_capacity(selected.len());
        let mut faults = Vec::new();
        for &dim in &selected {
            scored.push((dim, self.score_one(item, context, dim, &mut faults)));
        }

        let mut axiom_scores = axiom_scores_of(&scored);
        let mut expanded = false;
        if self.selector.is_sparse() && spread(&axiom_scores) > self.expand_spread {
            let seen: HashSet<&str> = selected.iter().map(|d| d.id.as_str()).collect();
            let rest: Vec<&Dimension> = dimensions
                .active()
                .filter(|d| !seen.contains(d.id.as_str()))
                .collect();
            if !rest.is_empty() {
                for dim in rest {
                    scored.push((dim, self.score_one(item, context, dim, &mut faults)));
                }
                scored.sort_by_key(|(d, _)| d.ordinal);
                axiom_scores = axiom_scores_of(&scored);
                expanded = true;
            }
        }

        let (values, weights): (Vec<f64>, Vec<f64>) = axiom_scores
            .iter()
            .map(|(&axiom, &score)| (score, self.emphasis_for(axiom)))
            .unzip();
        let raw_score = weighted_geometric_mean(&values, &weights);

        let evaluated = scored.len();
        let raw_confidence = if evaluated == 0 {
            0.0
        } else {
            let coverage = (evaluated - faults.len().min(evaluated)) as f64 / evaluated as f64;
            coverage * (1.0 - 2.0 * spread(&axiom_scores)).max(0.0)
        };

        let dimension_scores = scored
            .iter()
            .map(|(d, s)| (d.id.clone(), *s))
            .collect();

        Evaluation {
            dimension_scores,
            axiom_scores,
            raw_score,
            raw_confidence,
            faults,
            expanded,
        }
    }

    fn score_one(
        &self,
        item: &Item,
        context: &Context,
        dim: &Dimension,
        faults: &mut Vec<ScoreError>,
    ) -> f64 {
        match self.scorer.score(item, context, dim) {
            Ok(score) => score,
            Err(err) => {
                warn!(
                    agent_id = %self.id,
                    dimension = %dim.id,
                    error = %err,
                    "Dimension scorer fault; scoring 0"
                );
                faults.push(err);
                0.0
            }
        }
    }

    fn build_vote(&self, eval: Evaluation) -> Result<Vote, AgentError> {
        let position = Position::from_score(eval.raw_score);
        let confidence = clamp_confidence(eval.raw_confidence);
        let reasoning = reasoning(&eval, position);
        Ok(Vote::new(
            self.id.clone(),
            position,
            confidence,
            reasoning,
            eval.dimension_scores,
        )?)
    }
}

#[async_trait::async_trait]
impl EvaluatorAgent for ScoringAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_veto_capable(&self) -> bool {
        self.veto
    }

    async fn vote(
        &self,
        item: &Item,
        context: &Context,
        dimensions: &DimensionSet,
    ) -> Result<Vote, AgentError> {
        let eval = self.evaluate(item, context, dimensions);
        self.build_vote(eval)
    }
}

/// Weighted geometric mean per axiom over the scored dimensions.
fn axiom_scores_of(scored: &[(&Dimension, f64)]) -> BTreeMap<Axiom, f64> {
    let mut out = BTreeMap::new();
    for axiom in Axiom::ALL {
        let (values, weights): (Vec<f64>, Vec<f64>) = scored
            .iter()
            .filter(|(d, _)| d.axiom == axiom && d.is_active())
            .map(|(d, s)| (*s, d.weight))
            .unzip();
        if values.is_empty() {
            continue;
        }
        out.insert(axiom, weighted_geometric_mean(&values, &weights));
    }
    out
}

fn spread(axiom_scores: &BTreeMap<Axiom, f64>) -> f64 {
    let values: Vec<f64> = axiom_scores.values().copied().collect();
    std_dev(&values)
}

fn reasoning(eval: &Evaluation, position: Position) -> String {
    let mut out = String::new();
    let _ = write!(out, "{} score={:.3}", position.as_str(), eval.raw_score);
    if !eval.axiom_scores.is_empty() {
        out.push_str(" axioms[");
        for (i, (axiom, score)) in eval.axiom_scores.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{axiom}={score:.3}");
        }
        out.push(']');
    }
    if eval.expanded {
        out.push_str(" expanded");
    }
    if !eval.faults.is_empty() {
        out.push_str("; faults: ");
        for (i, fault) in eval.faults.iter().enumerate() {
            if i > 0 {
                out.push_str("; ");
            }
            let _ = write!(out, "{fault}");
        }
    }
    out
}
