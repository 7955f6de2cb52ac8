//! Residual detection and dimension discovery.
//!
//! A residual is `observed − confidence` for a judged item once its outcome
//! is known. Small residuals are explained by the current dimensions. Large
//! ones accumulate in a rolling window; when they are statistically
//! significant and some item feature no current dimension reads tracks them,
//! the detector drafts a dimension proposal over that feature.
//!
//! State machine per observation:
//!
//! ```text
//! Idle → ComputeResidual → Idle                      (|r| < threshold)
//!                        → AnalyzePattern → Idle     (not significant / explained)
//!                                         → Propose
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::config::ResidualConfig;
use crate::dimensions::{Axiom, DimensionSet};
use crate::phi::{fibonacci, PHI_INV_2, PHI_INV_3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualState {
    Idle,
    ComputeResidual,
    AnalyzePattern,
    Propose,
}

// =============================================================================
// Significance
// =============================================================================

/// p-value for "these residuals have non-zero mean".
pub trait SignificanceTest: Send + Sync + fmt::Debug {
    /// `None` when there is not enough data to test.
    fn p_value(&self, samples: &[f64]) -> Option<f64>;
}

/// Two-sided one-sample Student-t test against a zero mean.
#[derive(Debug, Clone, Copy)]
pub struct StudentTTest {
    pub min_points: usize,
}

/// Identical samples only count as evidence once there are this many.
const ZERO_VARIANCE_MIN_POINTS: usize = fibonacci(6) as usize;

impl Default for StudentTTest {
    fn default() -> Self {
        Self {
            min_points: fibonacci(4) as usize,
        }
    }
}

impl SignificanceTest for StudentTTest {
    fn p_value(&self, samples: &[f64]) -> Option<f64> {
        let n = samples.len();
        if n < self.min_points.max(2) {
            return None;
        }
        let n_f = n as f64;
        let mean = samples.iter().sum::<f64>() / n_f;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n_f - 1.0);
        let sd = var.sqrt();
        if sd <= f64::EPSILON {
            if mean.abs() <= f64::EPSILON {
                return Some(1.0);
            }
            return (n >= ZERO_VARIANCE_MIN_POINTS).then_some(0.0);
        }
        let t = mean / (sd / n_f.sqrt());
        let dist = StudentsT::new(0.0, 1.0, n_f - 1.0).ok()?;
        Some((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
    }
}

/// Always reports the same p-value. For tests and dry runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedPValue(pub f64);

impl SignificanceTest for FixedPValue {
    fn p_value(&self, _samples: &[f64]) -> Option<f64> {
        Some(self.0)
    }
}

// =============================================================================
// Patterns
// =============================================================================

/// Shape of recent residual magnitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualPattern {
    /// Current magnitude far above the recent baseline.
    Spike,
    /// Several material residuals in a row.
    StableHigh,
    /// Magnitudes trending upward.
    Rising,
}

const SPIKE_SIGMA: f64 = 2.0;
const MIN_BASELINE_STD: f64 = 0.01;
const STABLE_HIGH_RUN: usize = fibonacci(5) as usize;
const RISING_SLOPE: f64 = PHI_INV_3;

fn classify(history: &VecDeque<f64>, consecutive_high: usize) -> Option<ResidualPattern> {
    let n = history.len();
    if n >= 3 {
        let (prev, current) = (history.iter().take(n - 1), history[n - 1]);
        let prev: Vec<f64> = prev.copied().collect();
        let mean = prev.iter().sum::<f64>() / prev.len() as f64;
        let std = (prev.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / prev.len() as f64).sqrt();
        let spike = if std >= MIN_BASELINE_STD {
            (current - mean) / std >= SPIKE_SIGMA
        } else {
            current - mean >= PHI_INV_2
        };
        if spike && current >= PHI_INV_2 {
            return Some(ResidualPattern::Spike);
        }
    }
    if consecutive_high >= STABLE_HIGH_RUN {
        return Some(ResidualPattern::StableHigh);
    }
    if n >= 6 {
        let mean_x = (n - 1) as f64 / 2.0;
        let mean_y = history.iter().sum::<f64>() / n as f64;
        let (mut num, mut den) = (0.0, 0.0);
        for (x, y) in history.iter().enumerate() {
            let dx = x as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        if den > 0.0 && num / den >= RISING_SLOPE {
            return Some(ResidualPattern::Rising);
        }
    }
    None
}

// =============================================================================
// Detector
// =============================================================================

/// One resolved judgment, as seen by the detector.
#[derive(Debug, Clone)]
pub struct ResidualObservation {
    pub judgment_id: String,
    pub confidence: f64,
    pub observed: f64,
    pub features: BTreeMap<String, f64>,
    /// Axiom with the highest cross-agent variance in the judgment.
    pub contested_axiom: Option<Axiom>,
}

/// Proposal drafted by the detector, before governance assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub pattern_description: String,
    pub residual_magnitude: f64,
    pub statistical_significance: f64,
    pub proposed_formula: String,
    pub axiom: Axiom,
    pub source_judgment: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResidualReport {
    pub residual: f64,
    pub transitions: Vec<ResidualState>,
    pub p_value: Option<f64>,
    pub pattern: Option<ResidualPattern>,
    pub proposal: Option<ProposalDraft>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResidualStats {
    pub observations: u64,
    pub material: u64,
    pub significant: u64,
    pub proposals: u64,
}

/// One observed residual as persisted for warm starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualPoint {
    pub judgment_id: String,
    pub residual: f64,
    pub features: BTreeMap<String, f64>,
    pub observed_at: i64,
}

#[derive(Debug, Clone)]
struct WindowPoint {
    residual: f64,
    features: BTreeMap<String, f64>,
}

#[derive(Debug)]
pub struct ResidualDetector {
    config: ResidualConfig,
    test: Box<dyn SignificanceTest>,
    window: VecDeque<WindowPoint>,
    magnitudes: VecDeque<f64>,
    consecutive_high: usize,
    stats: ResidualStats,
}

impl ResidualDetector {
    pub fn new(config: ResidualConfig) -> Self {
        let test = StudentTTest {
            min_points: config.min_points,
        };
        Self::with_test(config, Box::new(test))
    }

    pub fn with_test(config: ResidualConfig, test: Box<dyn SignificanceTest>) -> Self {
        Self {
            config,
            test,
            window: VecDeque::new(),
            magnitudes: VecDeque::new(),
            consecutive_high: 0,
            stats: ResidualStats::default(),
        }
    }

    pub fn stats(&self) -> ResidualStats {
        self.stats
    }

    /// Residuals currently held for pattern analysis.
    pub fn window(&self) -> Vec<f64> {
        self.window.iter().map(|p| p.residual).collect()
    }

    /// Replay persisted points, oldest first, without analysing them.
    /// Returns how many were loaded.
    pub fn warm_start(&mut self, points: &[ResidualPoint]) -> usize {
        for point in points {
            self.stats.observations += 1;
            self.push(point.residual, &point.features);
        }
        points.len()
    }

    /// Track one residual. Returns whether it was material.
    fn push(&mut self, residual: f64, features: &BTreeMap<String, f64>) -> bool {
        let magnitude = residual.abs();
        self.magnitudes.push_back(magnitude);
        while self.magnitudes.len() > self.config.window {
            self.magnitudes.pop_front();
        }
        if magnitude < self.config.threshold {
            self.consecutive_high = 0;
            return false;
        }
        self.stats.material += 1;
        self.consecutive_high += 1;
        self.window.push_back(WindowPoint {
            residual,
            features: features.clone(),
        });
        while self.window.len() > self.config.window {
            self.window.pop_front();
        }
        true
    }

    /// Run one observation through the state machine.
    pub fn observe(&mut self, obs: &ResidualObservation, snapshot: &DimensionSet) -> ResidualReport {
        self.stats.observations += 1;
        let residual = obs.observed - obs.confidence;
        let magnitude = residual.abs();
        let mut report = ResidualReport {
            residual,
            transitions: vec![ResidualState::ComputeResidual],
            p_value: None,
            pattern: None,
            proposal: None,
        };

        if !self.push(residual, &obs.features) {
            report.transitions.push(ResidualState::Idle);
            return report;
        }
        report.pattern = classify(&self.magnitudes, self.consecutive_high);
        report.transitions.push(ResidualState::AnalyzePattern);

        let signed: Vec<f64> = self.window.iter().map(|p| p.residual).collect();
        report.p_value = self.test.p_value(&signed);
        let significant = report.p_value.is_some_and(|p| p < self.config.alpha);
        if !significant {
            report.transitions.push(ResidualState::Idle);
            return report;
        }
        self.stats.significant += 1;

        let Some(attribution) = self.attribute(obs, residual, snapshot) else {
            tracing::debug!(
                judgment_id = %obs.judgment_id,
                residual,
                "Residual significant but explained by current dimensions"
            );
            report.transitions.push(ResidualState::Idle);
            return report;
        };

        let p_value = report.p_value.unwrap_or(1.0);
        let mut description = format!(
            "residual {residual:+.3} unexplained; {}",
            attribution.evidence
        );
        if let Some(pattern) = report.pattern {
            description.push_str(&format!("; pattern {pattern:?}").to_lowercase());
        }

        self.stats.proposals += 1;
        report.transitions.push(ResidualState::Propose);
        report.proposal = Some(ProposalDraft {
            pattern_description: description,
            residual_magnitude: magnitude,
            statistical_significance: p_value,
            proposed_formula: attribution.formula,
            axiom: obs.contested_axiom.unwrap_or(Axiom::ALL[0]),
            source_judgment: obs.judgment_id.clone(),
        });
        report
    }

    fn attribute(
        &self,
        obs: &ResidualObservation,
        residual: f64,
        snapshot: &DimensionSet,
    ) -> Option<Attribution> {
        let candidates: BTreeSet<&str> = obs
            .features
            .keys()
            .map(String::as_str)
            .filter(|f| !snapshot.covers_feature(f))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut best: Option<(&str, f64, usize)> = None;
        for &feature in &candidates {
            let (xs, ys): (Vec<f64>, Vec<f64>) = self
                .window
                .iter()
                .filter_map(|p| p.features.get(feature).map(|&x| (x, p.residual)))
                .unzip();
            if xs.len() < self.config.min_points.max(3) {
                continue;
            }
            let Some(r) = pearson(&xs, &ys) else { continue };
            if best.map_or(true, |(_, b, _)| r.abs() > b.abs()) {
                best = Some((feature, r, xs.len()));
            }
        }
        if let Some((feature, r, n)) = best {
            return Some(Attribution {
                formula: formula(feature, r > 0.0),
                evidence: format!("tracks feature {feature} (pearson {r:+.2} over {n} points)"),
            });
        }

        let mut salient: Option<(&str, f64)> = None;
        for &feature in &candidates {
            let value = obs.features[feature];
            let deviation = value - 0.5;
            if salient.map_or(true, |(_, d)| deviation.abs() > d.abs()) {
                salient = Some((feature, deviation));
            }
        }
        salient.map(|(feature, deviation)| Attribution {
            formula: formula(feature, deviation * residual >= 0.0),
            evidence: format!("most salient unread feature {feature} ({:+.2} from midpoint)", deviation),
        })
    }
}

struct Attribution {
    formula: String,
    evidence: String,
}

fn formula(feature: &str, positive: bool) -> String {
    if positive {
        format!("feature({feature})")
    } else {
        format!("inverse({feature})")
    }
}

/// Pearson correlation; `None` when either side has no variance.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    let mx = xs[..n].iter().sum::<f64>() / n as f64;
    let my = ys[..n].iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let dx = xs[i] - mx;
        let dy = ys[i] - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= f64::EPSILON || syy <= f64::EPSILON {
        return None;
    }
    Some(sxy / (sxx.sqrt() * syy.sqrt()))
}
