use crate::domain::stock::{StockSnapshot, Technical};
use serde::{Deserialize, Serialize};

/// Envelope of the equities-by-country endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitiesResponse {
    pub data: Vec<EquityRecord>,
}

/// One equity row as the feed sends it. Field names are the provider's
/// PascalCase; unknown keys are ignored so upstream additions don't
/// break the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EquityRecord {
    pub id: String,
    pub name: String,
    pub symbol: String,

    pub last: f64,
    pub high: f64,
    pub low: f64,

    pub chg: f64,
    pub chg_pct: f64,

    pub technical_day: Technical,
    pub technical_week: Technical,
    pub technical_month: Technical,
    pub technical_hour: Technical,

    pub performance_day: f64,
    pub performance_week: f64,
    pub performance_month: f64,
    pub performance_year: f64,
    pub performance_ytd: f64,
    #[serde(rename = "Performance3Year")]
    pub performance_3year: f64,

    pub fundamental_beta: f64,
    pub fundamental_market_cap: f64,
    /// Pre-formatted by the provider, e.g. "26.60M".
    pub fundamental_revenue: String,
    pub fundamental_ratio: f64,

    pub volume: f64,
    pub avg_volume: f64,

    /// Unix seconds as a string, provider quirk.
    #[serde(default)]
    pub time: Option<String>,
}

impl EquityRecord {
    pub fn into_snapshot(self) -> StockSnapshot {
        StockSnapshot {
            id: self.id,
            name: self.name,
            symbol: self.symbol,
            last: self.last,
            high: self.high,
            low: self.low,
            change_abs: self.chg,
            change_pct: self.chg_pct,
            technical_day: self.technical_day,
            technical_week: self.technical_week,
            technical_month: self.technical_month,
            technical_hour: self.technical_hour,
            performance_day: self.performance_day,
            performance_week: self.performance_week,
            performance_month: self.performance_month,
            performance_year: self.performance_year,
            performance_ytd: self.performance_ytd,
            performance_3y: self.performance_3year,
            beta: self.fundamental_beta,
            market_cap: self.fundamental_market_cap,
            revenue: self.fundamental_revenue,
            pe_ratio: self.fundamental_ratio,
            volume: self.volume,
            avg_volume: self.avg_volume,
            ai_recommend: None,
            forecast: None,
            confidence_pct: None,
            expected_profit: None,
            amount: None,
            purchase_price: None,
            position_key: None,
            prev_recommend: None,
            current_recommend: None,
        }
    }
}
