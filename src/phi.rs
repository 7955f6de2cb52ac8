//! Golden-ratio constants and the bounded arithmetic built on them.
//!
//! Every confidence value in the engine lives in `[0, φ⁻¹]`. The helpers here
//! are the only place that value is clamped; everywhere else a value above the
//! ceiling is treated as an invariant breach (see [`check_confidence`]).

/// φ = (1 + √5) / 2.
pub const PHI: f64 = 1.618_033_988_749_895;
/// φ⁻¹ = φ − 1 ≈ 0.618. Hard ceiling on every confidence value.
pub const PHI_INV: f64 = 0.618_033_988_749_895;
/// φ⁻² = 2 − φ ≈ 0.382. Material-significance floor for residuals.
pub const PHI_INV_2: f64 = 0.381_966_011_250_105;
/// φ⁻³ ≈ 0.236.
pub const PHI_INV_3: f64 = 0.236_067_977_499_790;

/// Maximum confidence any vote or judgment may carry.
pub const MAX_CONFIDENCE: f64 = PHI_INV;

/// Slack for float noise when checking the ceiling.
const BOUND_EPS: f64 = 1e-12;

/// Steepness of the bounded activation function.
const SIGMOID_GAIN: f64 = 3.0;

/// Fibonacci number F(n).
pub const fn fibonacci(n: u32) -> u64 {
    let mut a: u64 = 0;
    let mut b: u64 = 1;
    let mut i = 0;
    while i < n {
        let next = a + b;
        a = b;
        b = next;
        i += 1;
    }
    a
}

/// Clamp a raw confidence estimate into `[0, φ⁻¹]`.
///
/// This is the designated clamp step for agent confidences and the collective
/// confidence. NaN collapses to 0.
pub fn clamp_confidence(raw: f64) -> f64 {
    if raw.is_nan() {
        return 0.0;
    }
    raw.clamp(0.0, MAX_CONFIDENCE)
}

/// Returns `Err(value)` when `value` is not a valid confidence.
pub fn check_confidence(value: f64) -> Result<f64, f64> {
    if value.is_finite() && value >= 0.0 && value <= MAX_CONFIDENCE + BOUND_EPS {
        Ok(value.min(MAX_CONFIDENCE))
    } else {
        Err(value)
    }
}

/// True when `value` is a finite number in `[0, 1]`.
pub fn is_unit_interval(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// `1 / (1 + e^(-3a))`.
pub fn bounded_sigmoid(activation: f64) -> f64 {
    1.0 / (1.0 + (-SIGMOID_GAIN * activation).exp())
}

/// Geometric mean. Any value at or below zero drives the result to zero.
pub fn geometric_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let weights = vec![1.0; values.len()];
    weighted_geometric_mean(values, &weights)
}

/// `Π v_i^w_i ^ (1 / Σ w_i)`, ignoring entries with non-positive weight.
///
/// Returns 0 when any weighted value is non-positive or when the total weight
/// is zero. Weights need not sum to one.
pub fn weighted_geometric_mean(values: &[f64], weights: &[f64]) -> f64 {
    if values.is_empty() || values.len() != weights.len() {
        return 0.0;
    }
    let mut total_weight = 0.0;
    let mut log_sum = 0.0;
    for (&v, &w) in values.iter().zip(weights) {
        if !(w > 0.0) || !w.is_finite() {
            continue;
        }
        if !(v > 0.0) || !v.is_finite() {
            return 0.0;
        }
        total_weight += w;
        log_sum += w * v.ln();
    }
    if total_weight <= 0.0 {
        return 0.0;
    }
    (log_sum / total_weight).exp()
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.max(0.0).sqrt()
}

/// Population variance.
pub fn variance(values: &[f64]) -> f64 {
    let sd = std_dev(values);
    sd * sd
}
