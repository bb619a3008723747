use common::types::{BookLevel, OrderBook, Side};
use serde::Serialize;
use std::cmp::Ordering;

/// How a trade of a given notional would have moved through the book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketImpact {
    pub levels_consumed: usize,
    pub is_sweeper: bool,
    pub book_exhausted: bool,
    pub best_price: f64,
    /// Price of the last level touched.
    pub absorption_price: f64,
    pub price_impact: f64,
    pub available_depth_usd: f64,
    pub vwap: f64,
}

/// Walk the side a taker of `side` consumes: asks ascending for BUY, bids
/// descending for SELL. Returns `None` when that side of the book is empty.
///
/// The trade is a sweeper when the book runs out before `value` is absorbed,
/// or when more than `max_levels` levels are needed.
pub fn analyze(book: &OrderBook, side: Side, value: f64, max_levels: usize) -> Option<MarketImpact> {
    let mut levels: Vec<&BookLevel> = match side {
        Side::Buy => book.asks.iter().collect(),
        Side::Sell => book.bids.iter().collect(),
    };
    levels.retain(|l| l.price > 0.0 && l.size > 0.0);
    match side {
        Side::Buy => levels.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal)),
        Side::Sell => levels.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(Ordering::Equal)),
    }
    let best_price = levels.first()?.price;

    let mut accumulated = 0.0;
    let mut weighted = 0.0;
    let mut consumed = 0;
    let mut absorption_price = best_price;
    let mut total_depth = 0.0;
    for level in &levels {
        let level_usd = level.price * level.size;
        total_depth += level_usd;
        if accumulated < value {
            let take = level_usd.min(value - accumulated);
            accumulated += take;
            weighted += level.price * take;
            consumed += 1;
            absorption_price = level.price;
        }
    }

    let book_exhausted = accumulated < value;
    let vwap = if accumulated > 0.0 {
        weighted / accumulated
    } else {
        best_price
    };
    Some(MarketImpact {
        levels_consumed: consumed,
        is_sweeper: book_exhausted || consumed > max_levels,
        book_exhausted,
        best_price,
        absorption_price,
        price_impact: (absorption_price - best_price).abs() / best_price,
        available_depth_usd: total_depth,
        vwap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::fakes::book;

    #[test]
    fn test_small_buy_stays_on_top_level() {
        let b = book(&[(0.49, 1000.0)], &[(0.52, 500.0), (0.50, 10_000.0)]);
        let impact = analyze(&b, Side::Buy, 2_000.0, 3).unwrap();
        assert_eq!(impact.levels_consumed, 1);
        assert_eq!(impact.best_price, 0.50);
        assert_eq!(impact.price_impact, 0.0);
        assert!(!impact.is_sweeper);
    }

    #[test]
    fn test_deep_buy_is_sweeper() {
        let asks = [(0.50, 100.0), (0.51, 100.0), (0.52, 100.0), (0.53, 100.0), (0.60, 10_000.0)];
        let impact = analyze(&book(&[], &asks), Side::Buy, 1_000.0, 3).unwrap();
        assert_eq!(impact.levels_consumed, 5);
        assert!(impact.is_sweeper);
        assert!(!impact.book_exhausted);
        assert!((impact.price_impact - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_exhausted_book_is_sweeper() {
        let impact = analyze(&book(&[(0.40, 100.0)], &[]), Side::Sell, 5_000.0, 3).unwrap();
        assert_eq!(impact.levels_consumed, 1);
        assert!(impact.book_exhausted);
        assert!(impact.is_sweeper);
    }

    #[test]
    fn test_sell_walks_bids_descending() {
        let bids = [(0.30, 10_000.0), (0.45, 1_000.0), (0.44, 1_000.0)];
        let impact = analyze(&book(&bids, &[]), Side::Sell, 800.0, 3).unwrap();
        assert_eq!(impact.best_price, 0.45);
        assert_eq!(impact.absorption_price, 0.44);
        assert_eq!(impact.levels_consumed, 2);
    }

    #[test]
    fn test_empty_side_has_no_impact() {
        assert!(analyze(&book(&[(0.4, 10.0)], &[]), Side::Buy, 100.0, 3).is_none());
    }
}
