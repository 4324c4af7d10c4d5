use crate::config::Settings;
use crate::domain::stock::{Recommendation, StockSnapshot};
use anyhow::Context;
use std::time::Duration;

const DEFAULT_TITLE: &str = "Recommendation alert";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Delivery sink for recommendation changes and explicit buy/sell
/// confirmations. Callers decide *when* to notify; implementations only
/// decide *how*.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        snapshot: &StockSnapshot,
        recommendation: Recommendation,
        title: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Body shared by all sinks: name, symbol, held amount, the new label,
/// and P/L formatted as "-" when the snapshot is not held.
pub fn message_body(snapshot: &StockSnapshot, recommendation: Recommendation) -> String {
    let amount = snapshot
        .amount
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    let pnl = snapshot
        .unrealized_pnl()
        .map(|v| format!("{v:.2}"))
        .unwrap_or_else(|| "-".to_string());

    format!(
        "stock: {}\nsymbol: {} -- amount: {}\nsuggested: {}\nprofit/loss: {}",
        snapshot.name,
        snapshot.symbol,
        amount,
        recommendation.as_str(),
        pnl
    )
}

/// Fallback sink: a structured log line. Always available, never fails.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        snapshot: &StockSnapshot,
        recommendation: Recommendation,
        title: Option<&str>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            title = title.unwrap_or(DEFAULT_TITLE),
            stock_id = %snapshot.id,
            symbol = %snapshot.symbol,
            recommendation = recommendation.as_str(),
            body = %message_body(snapshot, recommendation),
            "notification"
        );
        Ok(())
    }
}

/// JSON POST to a configured webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("failed to build webhook http client")?;
        Ok(Self { http, url })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        snapshot: &StockSnapshot,
        recommendation: Recommendation,
        title: Option<&str>,
    ) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "title": title.unwrap_or(DEFAULT_TITLE),
            "body": message_body(snapshot, recommendation),
            "stock_id": snapshot.id,
            "symbol": snapshot.symbol,
            "recommendation": recommendation.as_str(),
        });

        let res = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("webhook notification request failed")?;

        let status = res.status();
        anyhow::ensure!(status.is_success(), "webhook notification HTTP {status}");
        Ok(())
    }
}

/// Webhook when configured, log line otherwise.
pub fn from_settings(settings: &Settings) -> anyhow::Result<Box<dyn Notifier>> {
    match settings.notify_webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            Ok(Box::new(WebhookNotifier::new(url.trim().to_string())?))
        }
        _ => Ok(Box::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stock::Technical;

    fn snapshot() -> StockSnapshot {
        StockSnapshot {
            id: "12949".to_string(),
            name: "Rowad".to_string(),
            symbol: "ROTO".to_string(),
            last: 33.45,
            high: 34.0,
            low: 31.78,
            change_abs: 0.5,
            change_pct: 1.5,
            technical_day: Technical::Neutral,
            technical_week: Technical::Neutral,
            technical_month: Technical::Neutral,
            technical_hour: Technical::Neutral,
            performance_day: 0.0,
            performance_week: 0.0,
            performance_month: 0.0,
            performance_year: 0.0,
            performance_ytd: 0.0,
            performance_3y: 0.0,
            beta: 0.0,
            market_cap: 0.0,
            revenue: String::new(),
            pe_ratio: 0.0,
            volume: 0.0,
            avg_volume: 0.0,
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

    #[test]
    fn body_shows_dash_for_unheld_snapshot() {
        let body = message_body(&snapshot(), Recommendation::Buy);
        assert!(body.contains("amount: -"));
        assert!(body.contains("profit/loss: -"));
        assert!(body.contains("suggested: buy"));
    }

    #[test]
    fn body_shows_amount_and_pnl_for_held_snapshot() {
        let mut s = snapshot();
        s.position_key = Some(1);
        s.amount = Some(100);
        s.purchase_price = Some(30.0);
        let body = message_body(&s, Recommendation::Sell);
        assert!(body.contains("amount: 100"));
        assert!(body.contains("profit/loss: 345.00"));
    }
}
