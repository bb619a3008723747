//! Statistical primitives for signal scoring. All functions are pure.

/// Highest leaderboard rank that still earns a rank score.
pub const MAX_SCORED_RANK: i64 = 200;

/// Z-score of `observed` against a baseline. A zero (or non-finite) stddev
/// yields 3.0 for any excess over the mean and 0.0 otherwise.
pub fn z_score(observed: f64, mean: f64, stddev: f64) -> f64 {
    if stddev <= 0.0 || !stddev.is_finite() {
        return if observed > mean { 3.0 } else { 0.0 };
    }
    (observed - mean) / stddev
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// `e^(-lambda * hours_ago)`; trades stamped in the future count as fresh.
pub fn time_decay_weight(timestamp: i64, now: i64, lambda: f64) -> f64 {
    let hours_ago = ((now - timestamp) as f64 / 3600.0).max(0.0);
    (-lambda * hours_ago).exp()
}

/// Herfindahl-Hirschman index over participant shares.
///
/// Input need not be normalised; negative entries count as zero. Result is
/// in `[0, 1]`, and 0 for an empty or all-zero input.
pub fn calculate_hhi(shares: &[f64]) -> f64 {
    let total: f64 = shares.iter().map(|s| s.max(0.0)).sum();
    if total <= 0.0 {
        return 0.0;
    }
    shares
        .iter()
        .map(|s| {
            let p = s.max(0.0) / total;
            p * p
        })
        .sum()
}

/// `100 * e^(-0.15 * (rank - 1))` for ranks 1..=200, else 0.
pub fn rank_score(rank: i64) -> f64 {
    if !(1..=MAX_SCORED_RANK).contains(&rank) {
        return 0.0;
    }
    100.0 * (-0.15 * (rank - 1) as f64).exp()
}

/// Probability-like conviction toward BUY; 0.5 means no lean.
pub fn direction_conviction(buy_volume: f64, sell_volume: f64) -> f64 {
    let ratio = (buy_volume.max(0.0) + 1.0) / (sell_volume.max(0.0) + 1.0);
    sigmoid(0.5 * ratio.ln())
}

/// Distance of the conviction from neutral, scaled to `[0, 1]`.
pub fn direction_strength(conviction: f64) -> f64 {
    ((conviction - 0.5).abs() * 2.0).clamp(0.0, 1.0)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}
