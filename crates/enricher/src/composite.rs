//! Hybrid composite confidence signal.
//!
//! A base score (statistical volume surprise plus rank-weighted participation)
//! is scaled by four bounded modifiers: recency, direction, concentration and
//! alignment. The result is clamped to `[0, 1]` and later turned into a
//! percentile across all active market/outcome pairs of a window.

use crate::stats;
use crate::tiers;
use common::types::Side;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const VOLUME_WEIGHT: f64 = 0.35;
const RANK_WEIGHT: f64 = 0.65;
/// Aggregate rank score at which the rank component saturates.
const RANK_SCORE_SATURATION: f64 = 75.0;

const RECENCY_RANGE: (f64, f64) = (0.6, 1.15);
const DIRECTION_RANGE: (f64, f64) = (0.5, 1.2);
const CONCENTRATION_RANGE: (f64, f64) = (0.7, 1.1);
const ALIGNMENT_RANGE: (f64, f64) = (0.5, 1.2);

/// Minority/majority top-trader volume above which the direction is treated as split.
const SPLIT_RATIO: f64 = 0.4;
const SPLIT_PENALTY: f64 = 0.3;

pub const UNUSUAL_Z: f64 = 2.0;
pub const CONCENTRATED_HHI: f64 = 0.25;

/// Fallback stddev cap when the baseline has fewer than two samples.
const MAX_FALLBACK_STDDEV: f64 = 50_000.0;
/// Relative spread below which a sample history counts as flat.
const MIN_SAMPLE_STDDEV: f64 = 1e-9;

fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    x.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    Exceptional,
    Strong,
    Moderate,
    Weak,
}

impl SignalQuality {
    pub fn from_confidence(raw: f64) -> Self {
        if raw >= 0.70 {
            Self::Exceptional
        } else if raw >= 0.50 {
            Self::Strong
        } else if raw >= 0.30 {
            Self::Moderate
        } else {
            Self::Weak
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exceptional => "exceptional",
            Self::Strong => "strong",
            Self::Moderate => "moderate",
            Self::Weak => "weak",
        }
    }
}

/// Historical volume distribution for one market/outcome/window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketBaseline {
    pub mean_volume: f64,
    pub stddev_volume: f64,
    pub mean_top_tier_volume: f64,
    pub stddev_top_tier_volume: f64,
    pub sample_count: usize,
}

impl MarketBaseline {
    /// Build from snapshot history. With fewer than two samples, or samples
    /// with no spread, the stddev is `min(mean * 0.5, 50_000)`.
    pub fn from_samples(total_volumes: &[f64], top_tier_volumes: &[f64]) -> Self {
        let spread = |values: &[f64]| {
            let m = stats::mean(values);
            let sd = if values.len() < 2 {
                0.0
            } else {
                stats::stddev(values)
            };
            // A flat history says nothing about how volume varies.
            let sd = if sd <= MIN_SAMPLE_STDDEV * m.abs().max(1.0) {
                (m * 0.5).min(MAX_FALLBACK_STDDEV)
            } else {
                sd
            };
            (m, sd)
        };
        let (mean_volume, stddev_volume) = spread(total_volumes);
        let (mean_top_tier_volume, stddev_top_tier_volume) = spread(top_tier_volumes);
        Self {
            mean_volume,
            stddev_volume,
            mean_top_tier_volume,
            stddev_top_tier_volume,
            sample_count: total_volumes.len().min(top_tier_volumes.len()),
        }
    }
}

/// Tier-weighted participant counts for the alignment modifier.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeightedCounts {
    pub buy: f64,
    pub sell: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CompositeSignalInput {
    pub total_volume: f64,
    pub top_tier_volume: f64,
    pub decayed_top_tier_volume: f64,
    pub baseline: MarketBaseline,
    /// Best leaderboard rank per wallet; wallets absent here are unranked.
    pub wallet_ranks: HashMap<String, i64>,
    pub wallet_volumes: HashMap<String, f64>,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub top_trader_buy_volume: f64,
    pub top_trader_sell_volume: f64,
    pub top_trader_buy_count: u32,
    pub top_trader_sell_count: u32,
    pub weighted_counts: Option<WeightedCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedSignalMetrics {
    pub z_score: f64,
    pub hhi: f64,
    pub rank_weighted_score: f64,
    pub decayed_top_tier_volume: f64,
    pub direction_conviction: f64,
    pub direction_strength: f64,
    pub dominant_side: Side,
    pub volume_component: f64,
    pub rank_component: f64,
    pub base_score: f64,
    pub recency_modifier: f64,
    pub direction_modifier: f64,
    pub concentration_modifier: f64,
    pub alignment_modifier: f64,
    pub modifier_product: f64,
    pub raw_confidence: f64,
    /// 0 until [`normalize_percentiles`] runs over the active set.
    pub percentile: u8,
    pub signal_quality: SignalQuality,
    pub is_unusual_activity: bool,
    pub is_concentrated: bool,
}

/// Map a `[0, 1]` sub-score onto `[min, max]` with 0.5 landing on 1.0.
pub fn to_modifier(sub: f64, min: f64, max: f64) -> f64 {
    let s = clamp01(sub);
    if s <= 0.5 {
        min + (1.0 - min) * (s / 0.5)
    } else {
        1.0 + (max - 1.0) * ((s - 0.5) / 0.5)
    }
}

/// Aggregate rank score: per-wallet rank score weighted by the wallet's share
/// of ranked volume, scaled by the ranked share of all volume.
pub fn aggregate_rank_score(input: &CompositeSignalInput) -> f64 {
    if input.total_volume <= 0.0 {
        return 0.0;
    }
    let ranked: Vec<(f64, f64)> = input
        .wallet_volumes
        .iter()
        .filter_map(|(wallet, vol)| {
            let score = stats::rank_score(*input.wallet_ranks.get(wallet)?);
            (score > 0.0 && *vol > 0.0).then_some((score, *vol))
        })
        .collect();
    let ranked_vol: f64 = ranked.iter().map(|(_, v)| v).sum();
    if ranked_vol <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = ranked.iter().map(|(s, v)| s * (v / ranked_vol)).sum();
    weighted * (ranked_vol / input.total_volume).min(1.0)
}

/// HHI sweet spot: moderate concentration scores best.
pub fn concentration_sub_score(hhi: f64) -> f64 {
    if hhi < 0.1 {
        0.3
    } else if hhi < 0.25 {
        0.3 + (hhi - 0.1) / 0.15 * 0.7
    } else if hhi <= 0.5 {
        1.0
    } else {
        clamp01(1.0 - (hhi - 0.5) / 0.5 * 0.7)
    }
}

fn recency_sub_score(input: &CompositeSignalInput) -> f64 {
    if input.top_tier_volume <= 0.0 {
        return 0.5;
    }
    clamp01(input.decayed_top_tier_volume / input.top_tier_volume)
}

/// Returns `(conviction, strength_after_split_penalty)`.
fn direction(input: &CompositeSignalInput) -> (f64, f64) {
    let top_total = input.top_trader_buy_volume + input.top_trader_sell_volume;
    let (buy, sell) = if top_total > 0.0 {
        (input.top_trader_buy_volume, input.top_trader_sell_volume)
    } else {
        (input.buy_volume, input.sell_volume)
    };
    let conviction = stats::direction_conviction(buy, sell);
    let mut strength = stats::direction_strength(conviction);

    let top_traders = input.top_trader_buy_count + input.top_trader_sell_count;
    if top_traders >= 2 && top_total > 0.0 {
        let majority = input
            .top_trader_buy_volume
            .max(input.top_trader_sell_volume);
        let minority = input
            .top_trader_buy_volume
            .min(input.top_trader_sell_volume);
        if majority > 0.0 && minority / majority > SPLIT_RATIO {
            strength *= SPLIT_PENALTY;
        }
    }
    (conviction, strength)
}

fn alignment_sub_score(input: &CompositeSignalInput) -> f64 {
    let counts = input.weighted_counts.unwrap_or_else(|| {
        let buy = f64::from(input.top_trader_buy_count);
        let sell = f64::from(input.top_trader_sell_count);
        WeightedCounts {
            buy,
            sell,
            total: buy + sell,
        }
    });
    let dominant = counts.buy.max(counts.sell);

    let engagement = clamp01((counts.total + 1.0).log2() / 15f64.log2());
    let count_alignment = if counts.total > 0.0 {
        clamp01(dominant / counts.total)
    } else {
        0.0
    };
    let cluster = clamp01((dominant + 1.0).log2() / 8f64.log2());

    let top_total = input.top_trader_buy_volume + input.top_trader_sell_volume;
    let volume_dominance = if top_total > 0.0 {
        input
            .top_trader_buy_volume
            .max(input.top_trader_sell_volume)
            / top_total
    } else {
        0.5
    };

    0.25 * (engagement + count_alignment + cluster + volume_dominance)
}

pub fn calculate(input: &CompositeSignalInput) -> EnhancedSignalMetrics {
    let z = stats::z_score(
        input.top_tier_volume,
        input.baseline.mean_top_tier_volume,
        input.baseline.stddev_top_tier_volume,
    );
    let volume_component = clamp01(stats::sigmoid(z - 2.0) * 1.8);

    let rank_weighted_score = aggregate_rank_score(input);
    let rank_component = clamp01(rank_weighted_score / RANK_SCORE_SATURATION);
    let base_score = VOLUME_WEIGHT * volume_component + RANK_WEIGHT * rank_component;

    let shares: Vec<f64> = input.wallet_volumes.values().copied().collect();
    let hhi = stats::calculate_hhi(&shares);

    let (conviction, strength) = direction(input);

    let recency_modifier = to_modifier(recency_sub_score(input), RECENCY_RANGE.0, RECENCY_RANGE.1);
    let direction_modifier = to_modifier(strength, DIRECTION_RANGE.0, DIRECTION_RANGE.1);
    let concentration_modifier = to_modifier(
        concentration_sub_score(hhi),
        CONCENTRATION_RANGE.0,
        CONCENTRATION_RANGE.1,
    );
    let alignment_modifier =
        to_modifier(alignment_sub_score(input), ALIGNMENT_RANGE.0, ALIGNMENT_RANGE.1);

    let modifier_product =
        recency_modifier * direction_modifier * concentration_modifier * alignment_modifier;
    let raw_confidence = clamp01(base_score * modifier_product);

    EnhancedSignalMetrics {
        z_score: z,
        hhi,
        rank_weighted_score,
        decayed_top_tier_volume: input.decayed_top_tier_volume,
        direction_conviction: conviction,
        direction_strength: strength,
        dominant_side: if conviction >= 0.5 { Side::Buy } else { Side::Sell },
        volume_component,
        rank_component,
        base_score,
        recency_modifier,
        direction_modifier,
        concentration_modifier,
        alignment_modifier,
        modifier_product,
        raw_confidence,
        percentile: 0,
        signal_quality: SignalQuality::from_confidence(raw_confidence),
        is_unusual_activity: z >= UNUSUAL_Z,
        is_concentrated: hhi >= CONCENTRATED_HHI,
    }
}

/// Percentile of each raw confidence within the set, in input order.
///
/// Stable ascending sort, then `round((i + 0.5) / n * 100)`; ties keep input order.
pub fn normalize_percentiles(raw: &[f64]) -> Vec<u8> {
    let n = raw.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| raw[a].total_cmp(&raw[b]));

    let mut out = vec![0u8; n];
    for (i, idx) in order.into_iter().enumerate() {
        let pct = ((i as f64 + 0.5) / n as f64 * 100.0).round();
        out[idx] = pct.clamp(0.0, 100.0) as u8;
    }
    out
}

pub fn apply_percentiles(metrics: &mut [EnhancedSignalMetrics]) {
    let raw: Vec<f64> = metrics.iter().map(|m| m.raw_confidence).collect();
    for (m, pct) in metrics.iter_mut().zip(normalize_percentiles(&raw)) {
        m.percentile = pct;
    }
}

/// Convenience for callers assembling counts from a rank map.
pub fn weighted_counts_from_ranks(buy_ranks: &[i64], sell_ranks: &[i64]) -> WeightedCounts {
    let buy = tiers::weighted_count(buy_ranks.iter().copied());
    let sell = tiers::weighted_count(sell_ranks.iter().copied());
    WeightedCounts {
        buy,
        sell,
        total: buy + sell,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Participant {
        wallet: &'static str,
        rank: Option<i64>,
        side: Side,
        value: f64,
    }

    /// Builds an input the way the aggregation job does: every trade is fresh.
    fn input_from(participants: &[Participant], baseline: MarketBaseline) -> CompositeSignalInput {
        let mut input = CompositeSignalInput {
            baseline,
            ..Default::default()
        };
        let mut buy_ranks = Vec::new();
        let mut sell_ranks = Vec::new();
        for p in participants {
            input.total_volume += p.value;
            *input.wallet_volumes.entry(p.wallet.to_string()).or_default() += p.value;
            match p.side {
                Side::Buy => input.buy_volume += p.value,
                Side::Sell => input.sell_volume += p.value,
            }
            let Some(rank) = p.rank.filter(|r| tiers::tier_of(*r).is_some()) else {
                continue;
            };
            input.wallet_ranks.insert(p.wallet.to_string(), rank);
            input.top_tier_volume += p.value;
            input.decayed_top_tier_volume += p.value;
            match p.side {
                Side::Buy => {
                    input.top_trader_buy_volume += p.value;
                    input.top_trader_buy_count += 1;
                    buy_ranks.push(rank);
                }
                Side::Sell => {
                    input.top_trader_sell_volume += p.value;
                    input.top_trader_sell_count += 1;
                    sell_ranks.push(rank);
                }
            }
        }
        input.weighted_counts = Some(weighted_counts_from_ranks(&buy_ranks, &sell_ranks));
        input
    }

    fn baseline(mean_top: f64, sd_top: f64) -> MarketBaseline {
        MarketBaseline {
            mean_volume: mean_top,
            stddev_volume: sd_top,
            mean_top_tier_volume: mean_top,
            stddev_top_tier_volume: sd_top,
            sample_count: 10,
        }
    }

    #[test]
    fn test_to_modifier_anchor_points() {
        assert!((to_modifier(0.0, 0.6, 1.15) - 0.6).abs() < 1e-12);
        assert!((to_modifier(0.5, 0.6, 1.15) - 1.0).abs() < 1e-12);
        assert!((to_modifier(1.0, 0.6, 1.15) - 1.15).abs() < 1e-12);
        assert!((to_modifier(7.0, 0.5, 1.2) - 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_concentration_sweet_spot() {
        assert_eq!(concentration_sub_score(0.05), 0.3);
        assert!((concentration_sub_score(0.25) - 1.0).abs() < 1e-12);
        assert!((concentration_sub_score(0.4) - 1.0).abs() < 1e-12);
        assert!((concentration_sub_score(1.0) - 0.3).abs() < 1e-12);
        assert!(concentration_sub_score(0.175) > 0.3 && concentration_sub_score(0.175) < 1.0);
    }

    #[test]
    fn test_baseline_fallback_stddev() {
        let b = MarketBaseline::from_samples(&[40_000.0], &[10_000.0]);
        assert!((b.stddev_volume - 20_000.0).abs() < 1e-9);
        assert!((b.stddev_top_tier_volume - 5_000.0).abs() < 1e-9);

        let big = MarketBaseline::from_samples(&[1_000_000.0], &[1_000_000.0]);
        assert!((big.stddev_volume - 50_000.0).abs() < 1e-9);

        let many = MarketBaseline::from_samples(&[10.0, 20.0, 30.0], &[1.0, 1.0, 1.0]);
        assert_eq!(many.sample_count, 3);
        assert!((many.stddev_volume - stats::stddev(&[10.0, 20.0, 30.0])).abs() < 1e-9);
        // Flat history falls back instead of collapsing to zero.
        assert!((many.stddev_top_tier_volume - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_flat_history_does_not_saturate_volume() {
        let baseline = MarketBaseline::from_samples(&[50_000.0; 3], &[50_000.0; 3]);
        let m = calculate(&CompositeSignalInput {
            total_volume: 51_000.0,
            top_tier_volume: 51_000.0,
            decayed_top_tier_volume: 51_000.0,
            baseline,
            buy_volume: 51_000.0,
            ..Default::default()
        });
        assert!(m.z_score < 0.1, "z = {}", m.z_score);
        assert!(!m.is_unusual_activity);
        assert!(m.volume_component < 0.5);
    }

    #[test]
    fn test_single_elite_whale_is_exceptional() {
        let input = input_from(
            &[Participant {
                wallet: "0xwhale",
                rank: Some(2),
                side: Side::Buy,
                value: 120_000.0,
            }],
            baseline(10_000.0, 5_000.0),
        );
        let m = calculate(&input);
        assert!((m.z_score - 22.0).abs() < 1e-9);
        assert!((m.volume_component - 1.0).abs() < 1e-12);
        assert!((m.rank_component - 1.0).abs() < 1e-12);
        assert!((m.recency_modifier - 1.15).abs() < 1e-12);
        assert!((m.concentration_modifier - 0.88).abs() < 1e-9);
        assert!((m.raw_confidence - 1.0).abs() < 1e-12);
        assert_eq!(m.signal_quality, SignalQuality::Exceptional);
        assert_eq!(m.dominant_side, Side::Buy);
        assert!(m.is_unusual_activity);
        assert!(m.is_concentrated);
    }

    #[test]
    fn test_split_direction_is_weak_and_below_aligned() {
        let split = [
            Participant { wallet: "0xb1", rank: Some(15), side: Side::Buy, value: 5_000.0 },
            Participant { wallet: "0xb2", rank: Some(25), side: Side::Buy, value: 5_000.0 },
            Participant { wallet: "0xb3", rank: Some(40), side: Side::Buy, value: 5_000.0 },
            Participant { wallet: "0xs1", rank: Some(18), side: Side::Sell, value: 5_000.0 },
            Participant { wallet: "0xs2", rank: Some(30), side: Side::Sell, value: 5_000.0 },
            Participant { wallet: "0xs3", rank: Some(45), side: Side::Sell, value: 5_000.0 },
        ];
        let m_split = calculate(&input_from(&split, baseline(20_000.0, 10_000.0)));
        assert!((m_split.z_score - 1.0).abs() < 1e-9);
        assert!(m_split.raw_confidence < 0.3, "got {}", m_split.raw_confidence);
        assert_eq!(m_split.signal_quality, SignalQuality::Weak);
        assert!((m_split.direction_modifier - 0.5).abs() < 1e-9);

        let aligned: Vec<Participant> = split
            .iter()
            .map(|p| Participant { side: Side::Buy, ..*p })
            .collect();
        let m_aligned = calculate(&input_from(&aligned, baseline(20_000.0, 10_000.0)));
        assert!(m_aligned.raw_confidence > m_split.raw_confidence);
    }

    #[test]
    fn test_elite_pair_beats_bronze_crowd() {
        let elite = [
            Participant { wallet: "0xe1", rank: Some(1), side: Side::Buy, value: 10_000.0 },
            Participant { wallet: "0xe2", rank: Some(2), side: Side::Buy, value: 10_000.0 },
        ];
        let wallets = [
            "0xc0", "0xc1", "0xc2", "0xc3", "0xc4", "0xc5", "0xc6", "0xc7", "0xc8", "0xc9",
        ];
        let crowd: Vec<Participant> = wallets
            .iter()
            .zip(101..)
            .map(|(w, rank)| Participant {
                wallet: w,
                rank: Some(rank),
                side: Side::Buy,
                value: 2_000.0,
            })
            .collect();

        let b = baseline(5_000.0, 2_000.0);
        let m_elite = calculate(&input_from(&elite, b));
        let m_crowd = calculate(&input_from(&crowd, b));

        assert!(m_elite.rank_component > 0.99);
        assert!(m_crowd.rank_component < 0.01);
        assert!(m_elite.raw_confidence > m_crowd.raw_confidence);
    }

    #[test]
    fn test_confidence_and_modifiers_stay_bounded() {
        let cases = [
            input_from(&[], MarketBaseline::default()),
            input_from(
                &[Participant { wallet: "0xa", rank: None, side: Side::Sell, value: 1e9 }],
                MarketBaseline::default(),
            ),
            input_from(
                &[
                    Participant { wallet: "0xa", rank: Some(1), side: Side::Buy, value: 1e7 },
                    Participant { wallet: "0xb", rank: Some(3), side: Side::Sell, value: 1.0 },
                ],
                baseline(1.0, 0.0),
            ),
        ];
        for input in &cases {
            let m = calculate(input);
            assert!((0.0..=1.0).contains(&m.raw_confidence));
            assert!((0.0..=1.0).contains(&m.base_score));
            assert!(m.modifier_product >= 0.105 && m.modifier_product <= 1.83);
        }
    }

    #[test]
    fn test_zero_volume_has_zero_rank_component() {
        let input = CompositeSignalInput::default();
        assert_eq!(aggregate_rank_score(&input), 0.0);
        let m = calculate(&input);
        assert_eq!(m.rank_component, 0.0);
        assert_eq!(m.hhi, 0.0);
    }

    #[test]
    fn test_unweighted_counts_are_default_for_alignment() {
        let mut input = input_from(
            &[
                Participant { wallet: "0xa", rank: Some(5), side: Side::Buy, value: 1_000.0 },
                Participant { wallet: "0xb", rank: Some(150), side: Side::Buy, value: 1_000.0 },
            ],
            baseline(1_000.0, 500.0),
        );
        let weighted = calculate(&input).alignment_modifier;
        input.weighted_counts = None;
        let unweighted = calculate(&input).alignment_modifier;
        // Two raw participants engage more than 1.1 weighted ones.
        assert!(unweighted > weighted);
    }

    #[test]
    fn test_percentiles() {
        assert_eq!(normalize_percentiles(&[0.4]), vec![50]);
        assert!(normalize_percentiles(&[]).is_empty());
        assert_eq!(normalize_percentiles(&[0.9, 0.1, 0.5, 0.3]), vec![88, 13, 63, 38]);
        // Ties keep input order.
        assert_eq!(normalize_percentiles(&[0.2, 0.2]), vec![25, 75]);
    }

    #[test]
    fn test_percentiles_preserve_order() {
        let raw = [0.12, 0.98, 0.45, 0.45, 0.0, 0.77, 0.3];
        let pct = normalize_percentiles(&raw);
        for i in 0..raw.len() {
            for j in 0..raw.len() {
                if raw[i] < raw[j] {
                    assert!(pct[i] < pct[j]);
                }
            }
        }
        assert!(pct.iter().all(|p| *p <= 100));
    }
}
