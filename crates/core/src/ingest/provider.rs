use crate::config::Settings;
use crate::domain::stock::StockSnapshot;
use crate::ingest::types::{EquitiesResponse, EquityRecord};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PATH: &str = "/api/financialdata/assets/equitiesByCountry/default";
const DEFAULT_COUNTRY_ID: &str = "59";
const DEFAULT_RETRIES: u32 = 3;

// The feed returns every field it knows unless asked for a subset; ask
// for exactly what the snapshot model consumes.
const FIELDS_LIST: &str = "id,name,symbol,high,low,last,change,changePercent,volume,time,\
performanceDay,performanceWeek,performanceMonth,performanceYtd,performanceYear,performance3Year,\
technicalHour,technicalDay,technicalWeek,technicalMonth,avgVolume,\
fundamentalMarketCap,fundamentalRevenue,fundamentalRatio,fundamentalBeta";

#[async_trait::async_trait]
pub trait MarketDataClient: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Fetch the current batch of snapshots for the configured market.
    /// Also returns the raw response JSON for run-record persistence.
    async fn fetch_equities(&self) -> Result<(Vec<StockSnapshot>, Value)>;
}

#[derive(Debug, Clone)]
pub struct HttpJsonMarketData {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    path: String,
    country_id: String,
    retries: u32,
}

impl HttpJsonMarketData {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_market_data_base_url()?.to_string();
        let api_key = settings.market_data_api_key.clone();

        let timeout_secs = std::env::var("MARKET_DATA_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let retries = std::env::var("MARKET_DATA_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES);

        let path = std::env::var("MARKET_DATA_EQUITIES_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let country_id = std::env::var("MARKET_DATA_COUNTRY_ID")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_COUNTRY_ID.to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build market data http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            path,
            country_id,
            retries,
        })
    }

    fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("application/json"));
        if let Some(api_key) = &self.api_key {
            headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
        }
        Ok(headers)
    }

    async fn fetch_once(&self) -> Result<(Vec<StockSnapshot>, Value)> {
        let url = self.url();
        let headers = self.headers()?;

        let res = self
            .http
            .get(url)
            .headers(headers)
            .query(&[
                ("fields-list", FIELDS_LIST),
                ("country-id", self.country_id.as_str()),
            ])
            .send()
            .await
            .context("market data request failed")?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read market data response")?;
        let raw_json = serde_json::from_str::<Value>(&text)
            .with_context(|| format!("market data response is not valid JSON: {text}"))?;

        if !status.is_success() {
            anyhow::bail!("market data HTTP {status}: {raw_json}");
        }

        let parsed = serde_json::from_value::<EquitiesResponse>(raw_json.clone())
            .context("failed to parse market data response into EquitiesResponse")?;

        let mut snapshots = Vec::with_capacity(parsed.data.len());
        for record in parsed.data {
            validate_record(&record)?;
            snapshots.push(record.into_snapshot());
        }
        Ok((snapshots, raw_json))
    }
}

#[async_trait::async_trait]
impl MarketDataClient for HttpJsonMarketData {
    fn provider_name(&self) -> &'static str {
        "external_http_json"
    }

    async fn fetch_equities(&self) -> Result<(Vec<StockSnapshot>, Value)> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once().await {
                Ok(out) => return Ok(out),
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(attempt, ?backoff, error = %err, "market data fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn validate_record(record: &EquityRecord) -> Result<()> {
    anyhow::ensure!(!record.id.trim().is_empty(), "id must be non-empty");
    anyhow::ensure!(!record.name.trim().is_empty(), "name must be non-empty");
    anyhow::ensure!(
        !record.symbol.trim().is_empty(),
        "symbol must be non-empty"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stock::Technical;
    use serde_json::json;

    fn equity_json() -> Value {
        json!({
            "Id": "12949",
            "Name": "Rowad Tourism",
            "Symbol": "ROTO",
            "Last": 33.45,
            "High": 31.8,
            "Low": 31.78,
            "Chg": 0.5,
            "ChgPct": 1.52,
            "TechnicalDay": "buy",
            "TechnicalWeek": "neutral",
            "TechnicalMonth": "strong_buy",
            "TechnicalHour": "neutral",
            "PerformanceDay": 0.0,
            "PerformanceWeek": 0.0,
            "PerformanceMonth": 0.0,
            "PerformanceYear": 111.57,
            "PerformanceYtd": 10.51,
            "Performance3Year": -38.95,
            "FundamentalBeta": -0.145,
            "FundamentalMarketCap": 579080000.0,
            "FundamentalRevenue": "26.60M",
            "FundamentalRatio": -44.95,
            "Volume": 1047.0,
            "AvgVolume": 31929.0,
            "Time": "1728386219"
        })
    }

    #[test]
    fn parses_feed_shape_into_snapshot() {
        let v = json!({ "data": [equity_json()] });
        let parsed: EquitiesResponse = serde_json::from_value(v).unwrap();
        assert_eq!(parsed.data.len(), 1);

        let snapshot = parsed.data.into_iter().next().unwrap().into_snapshot();
        assert_eq!(snapshot.id, "12949");
        assert_eq!(snapshot.symbol, "ROTO");
        assert_eq!(snapshot.technical_day, Technical::Buy);
        assert_eq!(snapshot.technical_month, Technical::StrongBuy);
        assert_eq!(snapshot.change_abs, 0.5);
        assert_eq!(snapshot.performance_3y, -38.95);
        assert_eq!(snapshot.revenue, "26.60M");
        // Nothing annotated or held straight off the feed.
        assert!(snapshot.expected_profit.is_none());
        assert!(snapshot.position_key.is_none());
    }

    #[test]
    fn rejects_unknown_technical_labels() {
        let mut record = equity_json();
        record["TechnicalDay"] = json!("mega_buy");
        let v = json!({ "data": [record] });
        assert!(serde_json::from_value::<EquitiesResponse>(v).is_err());
    }

    #[test]
    fn rejects_blank_symbol() {
        let mut record = equity_json();
        record["Symbol"] = json!("  ");
        let parsed: EquityRecord = serde_json::from_value(record).unwrap();
        assert!(validate_record(&parsed).is_err());
    }
}
