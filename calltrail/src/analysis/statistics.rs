//! Population statistics for hot-node selection

// Counts and nanosecond totals are converted to f64 for the math
#![allow(clippy::cast_precision_loss)]

/// How many standard deviations a value must exceed to count as hot
pub const HOT_SIGMA: f64 = 3.0;

/// Arithmetic mean; 0 for no values.
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; 0 for no values.
#[must_use]
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let squares: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (squares / values.len() as f64).sqrt()
}

/// `3σ` of `values`, or `None` when σ is zero and nothing can stand out.
#[must_use]
pub fn hot_threshold(values: &[f64]) -> Option<f64> {
    let sigma = std_dev(values);
    (sigma > 0.0).then_some(sigma * HOT_SIGMA)
}

/// True when `value` exceeds `threshold`; an absent threshold never matches.
#[must_use]
pub fn exceeds(value: f64, threshold: Option<f64>) -> bool {
    threshold.is_some_and(|t| value > t)
}
