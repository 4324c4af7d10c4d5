use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Categorical verdict the upstream feed attaches to each time horizon.
/// Produced by the provider, never computed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technical {
    Neutral,
    Buy,
    Sell,
    StrongBuy,
    StrongSell,
}

/// Discrete action label derived from a snapshot. Recomputed on every
/// refresh; the stored copy on a position row exists only to detect
/// changes worth notifying about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    StrongBuy,
    Buy,
    Neutral,
    Sell,
    StrongSell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Forecast {
    Up,
    Down,
    Stable,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::StrongBuy => "strong_buy",
            Recommendation::Buy => "buy",
            Recommendation::Neutral => "neutral",
            Recommendation::Sell => "sell",
            Recommendation::StrongSell => "strong_sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strong_buy" => Some(Recommendation::StrongBuy),
            "buy" => Some(Recommendation::Buy),
            "neutral" => Some(Recommendation::Neutral),
            "sell" => Some(Recommendation::Sell),
            "strong_sell" => Some(Recommendation::StrongSell),
            _ => None,
        }
    }
}

impl Forecast {
    pub fn as_str(&self) -> &'static str {
        match self {
            Forecast::Up => "up",
            Forecast::Down => "down",
            Forecast::Stable => "stable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Forecast::Up),
            "down" => Some(Forecast::Down),
            "stable" => Some(Forecast::Stable),
            _ => None,
        }
    }
}

/// One point-in-time record of a listed security.
///
/// Price/change/technical/performance/fundamental fields come straight
/// from the feed. The AI fields are absent until the annotator has run;
/// the position fields are absent unless the user holds the stock.
/// `amount` and `purchase_price` are meaningless without `position_key`
/// and must be ignored by P/L computation in that state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub id: String,
    pub name: String,
    pub symbol: String,

    pub last: f64,
    pub high: f64,
    pub low: f64,

    pub change_abs: f64,
    pub change_pct: f64,

    pub technical_day: Technical,
    pub technical_week: Technical,
    pub technical_month: Technical,
    pub technical_hour: Technical,

    pub performance_day: f64,
    pub performance_week: f64,
    pub performance_month: f64,
    pub performance_year: f64,
    pub performance_ytd: f64,
    pub performance_3y: f64,

    pub beta: f64,
    pub market_cap: f64,
    /// Display string from the feed, e.g. "26.60M".
    pub revenue: String,
    pub pe_ratio: f64,

    pub volume: f64,
    pub avg_volume: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_recommend: Option<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast: Option<Forecast>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_profit: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_key: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_recommend: Option<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_recommend: Option<Recommendation>,
}

impl StockSnapshot {
    /// Unrealized profit/loss of the held amount at the last price.
    /// `None` when the snapshot is not held or the product is not a
    /// finite number (renderers show "-").
    pub fn unrealized_pnl(&self) -> Option<f64> {
        self.position_key?;
        let amount = self.amount? as f64;
        let purchase_price = self.purchase_price?;
        let pnl = (self.last - purchase_price) * amount;
        if pnl.is_finite() {
            Some(pnl)
        } else {
            None
        }
    }
}

/// Annotator output for one stock, joined onto snapshots by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAnnotation {
    pub stock_id: String,
    pub recommend: Option<Recommendation>,
    pub forecast: Option<Forecast>,
    pub confidence_pct: Option<f64>,
    pub expected_profit: Option<f64>,
    pub generated_at: DateTime<Utc>,
}

impl StockSnapshot {
    pub fn apply_annotation(&mut self, a: &AiAnnotation) {
        self.ai_recommend = a.recommend;
        self.forecast = a.forecast;
        self.confidence_pct = a.confidence_pct;
        self.expected_profit = a.expected_profit;
    }
}
