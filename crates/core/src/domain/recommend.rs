use crate::domain::stock::{Recommendation, StockSnapshot, Technical};

/// Maps one snapshot to an action label.
///
/// Pure and total: every input gets a label, nothing is written anywhere.
/// The rules overlap (a stock can satisfy a weak-buy and a weak-sell
/// heuristic at the same time); the first matching rule wins, strong
/// rules before weak ones, so the order of the checks below is part of
/// the contract and must not be rearranged. Comparisons against NaN are
/// false, which routes malformed numeric input to the weaker branches
/// and ultimately to `Neutral` without any explicit NaN handling.
pub fn classify(s: &StockSnapshot) -> Recommendation {
    // A quote with no change at all is stale; every rule requires trading
    // activity, so short-circuit once instead of gating each rule.
    let traded = s.change_abs != 0.0 && s.change_pct != 0.0;
    if !traded {
        return Recommendation::Neutral;
    }

    let technicals_all = |t: Technical| {
        s.technical_day == t && s.technical_week == t && s.technical_month == t
    };
    let technicals_any = |t: Technical| {
        s.technical_day == t || s.technical_week == t || s.technical_month == t
    };

    // Strong buy: unanimous technicals, or high performance still below the
    // day's high on real volume, or negative-beta stock moving up hard.
    let strong_buy = technicals_all(Technical::StrongBuy)
        || (s.performance_day > 5.0
            && s.performance_month > 10.0
            && s.last < s.high * 0.95
            && s.avg_volume > 10_000.0)
        || (s.beta < 0.0 && s.change_pct > 2.0);
    if strong_buy {
        return Recommendation::StrongBuy;
    }

    // Strong sell: the mirror image.
    let strong_sell = technicals_all(Technical::StrongSell)
        || (s.performance_day < -5.0
            && s.performance_month < -10.0
            && s.last > s.low * 1.05
            && s.avg_volume > 10_000.0)
        || (s.beta > 1.0 && s.change_pct < -2.0);
    if strong_sell {
        return Recommendation::StrongSell;
    }

    let buy = technicals_any(Technical::Buy)
        || (s.performance_day > 0.0 && s.performance_month > 0.0 && s.last < s.high);
    if buy {
        return Recommendation::Buy;
    }

    let sell = technicals_any(Technical::Sell)
        || (s.performance_day < 0.0 && s.performance_month < 0.0 && s.last > s.low);
    if sell {
        return Recommendation::Sell;
    }

    Recommendation::Neutral
}

fn expected_profit_or_zero(s: &StockSnapshot) -> f64 {
    s.expected_profit.unwrap_or(0.0)
}

/// All stocks tied for the highest expected profit, best first.
///
/// A missing `expected_profit` counts as zero, so an unannotated batch
/// ties at zero and comes back whole. The sort is stable, so tied
/// leaders keep their input order. Input is not mutated.
pub fn top_buy_candidates(stocks: &[StockSnapshot]) -> Vec<StockSnapshot> {
    if stocks.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<StockSnapshot> = stocks.to_vec();
    sorted.sort_by(|a, b| {
        expected_profit_or_zero(b)
            .partial_cmp(&expected_profit_or_zero(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let top = expected_profit_or_zero(&sorted[0]);
    sorted
        .into_iter()
        .take_while(|s| expected_profit_or_zero(s) == top)
        .collect()
}

/// Held stocks whose day low has dropped below the purchase price.
///
/// A stop-loss-style screen: strictly below, so `low == purchase_price`
/// does not trigger. Snapshots without a purchase price (not held) are
/// skipped rather than faulted on. Input order is preserved.
pub fn top_sell_candidates(stocks: &[StockSnapshot]) -> Vec<StockSnapshot> {
    stocks
        .iter()
        .filter(|s| matches!(s.purchase_price, Some(p) if s.low < p))
        .cloned()
        .collect()
}
