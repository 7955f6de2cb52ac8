//! Items, contexts, and the per-dimension scoring functions.
//!
//! A dimension's `scoring_fn_ref` resolves first against custom scorers
//! registered on the [`Scorer`] by name, then as a formula over item features:
//!
//! | formula | score |
//! |---|---|
//! | `feature(x)` | `features[x]` |
//! | `inverse(x)` | `1 - features[x]` |
//! | `at_least(x, t)` | `1` if `features[x] >= t`, else `features[x] / t` |
//! | `constant(v)` | `v` |
//!
//! Scoring is pure: the same item, context and dimension always give the same
//! result. Anything outside `[0, 1]` is an error, never clamped here.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dimensions::{Axiom, Dimension};
use crate::phi::is_unit_interval;

// =============================================================================
// Inputs
// =============================================================================

/// The thing being judged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Stable reference, echoed as `Judgment::item_ref`.
    pub id: String,
    #[serde(default)]
    pub content: String,
    /// Normalized observations about the item, each expected in `[0, 1]`.
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
}

impl Item {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            features: BTreeMap::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features.insert(name.into(), value);
        self
    }

    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }
}

/// Circumstances of the judgment request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Free-form domain label (e.g. "code", "market").
    #[serde(default)]
    pub domain: String,
    /// Axioms the caller cares most about; selectors may favor them.
    #[serde(default)]
    pub focus: Vec<Axiom>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Context {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreError {
    #[error("dimension {dimension}: feature {feature} missing from item")]
    MissingFeature { dimension: String, feature: String },
    #[error("dimension {dimension}: score {value} outside [0, 1]")]
    OutOfRange { dimension: String, value: f64 },
    #[error("dimension {dimension}: unresolvable scoring reference {reference:?}")]
    UnknownScorer { dimension: String, reference: String },
    #[error("dimension {dimension}: scorer failed: {message}")]
    Failed { dimension: String, message: String },
}

// =============================================================================
// Formulas
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ScoringFormula {
    Feature(String),
    Inverse(String),
    AtLeast { feature: String, threshold: f64 },
    Constant(f64),
}

impl ScoringFormula {
    /// Parse `name(args)`. Returns `None` for anything else.
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        let open = reference.find('(')?;
        if !reference.ends_with(')') {
            return None;
        }
        let name = reference[..open].trim();
        let args: Vec<&str> = reference[open + 1..reference.len() - 1]
            .split(',')
            .map(str::trim)
            .collect();
        match (name, args.as_slice()) {
            ("feature", [f]) if valid_feature(f) => Some(Self::Feature(f.to_string())),
            ("inverse", [f]) if valid_feature(f) => Some(Self::Inverse(f.to_string())),
            ("at_least", [f, t]) if valid_feature(f) => {
                let threshold: f64 = t.parse().ok()?;
                if threshold > 0.0 && threshold <= 1.0 {
                    Some(Self::AtLeast {
                        feature: f.to_string(),
                        threshold,
                    })
                } else {
                    None
                }
            }
            ("constant", [v]) => v.parse().ok().map(Self::Constant),
            _ => None,
        }
    }

    /// Feature read by this formula, if any.
    pub fn feature(&self) -> Option<&str> {
        match self {
            Self::Feature(f) | Self::Inverse(f) => Some(f),
            Self::AtLeast { feature, .. } => Some(feature),
            Self::Constant(_) => None,
        }
    }

    fn evaluate(&self, dimension: &str, item: &Item) -> Result<f64, ScoreError> {
        let read = |feature: &str| {
            item.feature(feature).ok_or_else(|| ScoreError::MissingFeature {
                dimension: dimension.to_string(),
                feature: feature.to_string(),
            })
        };
        Ok(match self {
            Self::Feature(f) => read(f)?,
            Self::Inverse(f) => 1.0 - read(f)?,
            Self::AtLeast { feature, threshold } => {
                let v = read(feature)?;
                if v >= *threshold {
                    1.0
                } else {
                    v / threshold
                }
            }
            Self::Constant(v) => *v,
        })
    }
}

impl fmt::Display for ScoringFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feature(x) => write!(f, "feature({x})"),
            Self::Inverse(x) => write!(f, "inverse({x})"),
            Self::AtLeast { feature, threshold } => write!(f, "at_least({feature}, {threshold})"),
            Self::Constant(v) => write!(f, "constant({v})"),
        }
    }
}

fn valid_feature(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

// =============================================================================
// Scorer
// =============================================================================

/// Hand-written scoring function for a dimension.
///
/// Implementations must be deterministic and free of side effects.
pub trait DimensionScorer: Send + Sync {
    fn score(&self, item: &Item, context: &Context) -> Result<f64, String>;
}

impl<F> DimensionScorer for F
where
    F: Fn(&Item, &Context) -> Result<f64, String> + Send + Sync,
{
    fn score(&self, item: &Item, context: &Context) -> Result<f64, String> {
        self(item, context)
    }
}

/// Resolves `scoring_fn_ref`s and validates their output range.
#[derive(Clone, Default)]
pub struct Scorer {
    custom: HashMap<String, Arc<dyn DimensionScorer>>,
}

impl fmt::Debug for Scorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("Scorer").field("custom", &names).finish()
    }
}

impl Scorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scorer(mut self, name: impl Into<String>, scorer: Arc<dyn DimensionScorer>) -> Self {
        self.register(name, scorer);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, scorer: Arc<dyn DimensionScorer>) {
        self.custom.insert(name.into(), scorer);
    }

    /// True when `reference` names a custom scorer or parses as a formula.
    pub fn resolves(&self, reference: &str) -> bool {
        self.custom.contains_key(reference) || ScoringFormula::parse(reference).is_some()
    }

    /// Score one dimension. The result is always in `[0, 1]` when `Ok`.
    pub fn score(
        &self,
        item: &Item,
        context: &Context,
        dimension: &Dimension,
    ) -> Result<f64, ScoreError> {
        let reference = dimension.scoring_fn_ref.as_str();
        let raw = if let Some(custom) = self.custom.get(reference) {
            custom
                .score(item, context)
                .map_err(|message| ScoreError::Failed {
                    dimension: dimension.id.clone(),
                    message,
                })?
        } else if let Some(formula) = ScoringFormula::parse(reference) {
            formula.evaluate(&dimension.id, item)?
        } else {
            return Err(ScoreError::UnknownScorer {
                dimension: dimension.id.clone(),
                reference: reference.to_string(),
            });
        };

        if !is_unit_interval(raw) {
            return Err(ScoreError::OutOfRange {
                dimension: dimension.id.clone(),
                value: raw,
            });
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formulas_parse_and_display_round_trip() {
        for raw in ["feature(latency)", "inverse(cost)", "at_least(uptime, 0.9)", "constant(0.5)"] {
            let parsed = ScoringFormula::parse(raw).unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
        assert!(ScoringFormula::parse("feature()").is_none());
        assert!(ScoringFormula::parse("bogus(x)").is_none());
        assert!(ScoringFormula::parse("feature(x").is_none());
        assert!(ScoringFormula::parse("at_least(x, 0)").is_none());
    }

    #[test]
    fn feature_of_formula() {
        assert_eq!(
            ScoringFormula::parse("inverse(cost)").unwrap().feature(),
            Some("cost")
        );
        assert_eq!(ScoringFormula::parse("constant(1)").unwrap().feature(), None);
    }
}
