//! Window statistics over `f64` series. Every helper returns `None` when the
//! series is too short for the requested period.

/// Mean of the last `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Sample standard deviation (n - 1) of the last `period` values
pub fn stddev(values: &[f64], period: usize) -> Option<f64> {
    if period < 2 || values.len() < period {
        return None;
    }
    let mean = sma(values, period)?;
    let variance: f64 = values
        .iter()
        .rev()
        .take(period)
        .map(|v| (v - mean).powi(2))
        .sum::<f64>()
        / (period - 1) as f64;

    Some(variance.sqrt())
}

/// Mean and sample standard deviation of the whole series
pub fn mean_and_stddev(values: &[f64]) -> Option<(f64, f64)> {
    let n = values.len();
    Some((sma(values, n)?, stddev(values, n)?))
}

/// The `period` values ending at `end` inclusive, if all are defined
pub fn trailing_window(values: &[Option<f64>], end: usize, period: usize) -> Option<Vec<f64>> {
    if period == 0 || end >= values.len() || end + 1 < period {
        return None;
    }
    values[end + 1 - period..=end].iter().copied().collect()
}
