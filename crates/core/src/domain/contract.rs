use crate::domain::stock::{AiAnnotation, Forecast, Recommendation};
use anyhow::{bail, ensure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What the annotator model actually emits: an array of per-stock
/// objects with display-style labels ("Strong Buy", "Hold") and a
/// confidence that may arrive as "85%" or as a bare number. Validation
/// converts the whole batch into domain values or fails it atomically;
/// a batch is never partially applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnnotationItem {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "AIRecommend", default)]
    pub ai_recommend: Option<String>,

    #[serde(rename = "Forecast", default)]
    pub forecast: Option<String>,

    #[serde(rename = "Confidence", default)]
    pub confidence: Option<ConfidenceValue>,

    #[serde(rename = "ExpectedProfit", default)]
    pub expected_profit: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfidenceValue {
    Number(f64),
    Text(String),
}

pub fn validate_and_into_annotations(
    items: Vec<LlmAnnotationItem>,
    generated_at: DateTime<Utc>,
) -> anyhow::Result<Vec<AiAnnotation>> {
    ensure!(!items.is_empty(), "annotation batch must be non-empty");

    let mut seen_ids = BTreeSet::<String>::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(item.validate_and_into_annotation(&mut seen_ids, generated_at)?);
    }
    Ok(out)
}

impl LlmAnnotationItem {
    fn validate_and_into_annotation(
        self,
        seen_ids: &mut BTreeSet<String>,
        generated_at: DateTime<Utc>,
    ) -> anyhow::Result<AiAnnotation> {
        let id = self.id.trim().to_string();
        ensure!(!id.is_empty(), "annotation id must be non-empty");
        ensure!(seen_ids.insert(id.clone()), "duplicate annotation id: {id}");

        let recommend = self
            .ai_recommend
            .as_deref()
            .map(parse_recommend_label)
            .transpose()?;
        let forecast = self
            .forecast
            .as_deref()
            .map(parse_forecast_label)
            .transpose()?;

        let confidence_pct = self.confidence.map(parse_confidence).transpose()?;
        if let Some(pct) = confidence_pct {
            ensure!(
                (0.0..=100.0).contains(&pct),
                "confidence must be between 0 and 100 (got {pct})"
            );
        }

        Ok(AiAnnotation {
            stock_id: id,
            recommend,
            forecast,
            confidence_pct,
            expected_profit: self.expected_profit,
            generated_at,
        })
    }
}

fn parse_recommend_label(s: &str) -> anyhow::Result<Recommendation> {
    match s.trim() {
        "Strong Buy" => Ok(Recommendation::StrongBuy),
        "Buy" => Ok(Recommendation::Buy),
        "Hold" => Ok(Recommendation::Neutral),
        "Sell" => Ok(Recommendation::Sell),
        "Strong Sell" => Ok(Recommendation::StrongSell),
        other => bail!("unknown recommendation label: {other:?}"),
    }
}

fn parse_forecast_label(s: &str) -> anyhow::Result<Forecast> {
    match s.trim() {
        "Up" => Ok(Forecast::Up),
        "Down" => Ok(Forecast::Down),
        "Stable" => Ok(Forecast::Stable),
        other => bail!("unknown forecast label: {other:?}"),
    }
}

fn parse_confidence(v: ConfidenceValue) -> anyhow::Result<f64> {
    match v {
        ConfidenceValue::Number(n) => Ok(n),
        ConfidenceValue::Text(s) => {
            let trimmed = s.trim().trim_end_matches('%').trim();
            trimmed
                .parse::<f64>()
                .map_err(|_| anyhow::anyhow!("confidence is not a percentage: {s:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn generated_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_display_labels_and_percent_confidence() {
        let items: Vec<LlmAnnotationItem> = serde_json::from_value(json!([
            {
                "Id": "12949",
                "AIRecommend": "Strong Buy",
                "Forecast": "Up",
                "Confidence": "85%",
                "ExpectedProfit": 5
            }
        ]))
        .unwrap();

        let out = validate_and_into_annotations(items, generated_at()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stock_id, "12949");
        assert_eq!(out[0].recommend, Some(Recommendation::StrongBuy));
        assert_eq!(out[0].forecast, Some(Forecast::Up));
        assert_eq!(out[0].confidence_pct, Some(85.0));
        assert_eq!(out[0].expected_profit, Some(5.0));
    }

    #[test]
    fn hold_maps_to_neutral() {
        let items: Vec<LlmAnnotationItem> = serde_json::from_value(json!([
            {"Id": "1", "AIRecommend": "Hold"}
        ]))
        .unwrap();
        let out = validate_and_into_annotations(items, generated_at()).unwrap();
        assert_eq!(out[0].recommend, Some(Recommendation::Neutral));
    }

    #[test]
    fn numeric_confidence_is_accepted() {
        let items: Vec<LlmAnnotationItem> = serde_json::from_value(json!([
            {"Id": "1", "Confidence": 62.5}
        ]))
        .unwrap();
        let out = validate_and_into_annotations(items, generated_at()).unwrap();
        assert_eq!(out[0].confidence_pct, Some(62.5));
    }

    #[test]
    fn rejects_unknown_labels() {
        let items: Vec<LlmAnnotationItem> = serde_json::from_value(json!([
            {"Id": "1", "AIRecommend": "Mega Buy"}
        ]))
        .unwrap();
        assert!(validate_and_into_annotations(items, generated_at()).is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let items: Vec<LlmAnnotationItem> = serde_json::from_value(json!([
            {"Id": "1"},
            {"Id": "1"}
        ]))
        .unwrap();
        assert!(validate_and_into_annotations(items, generated_at()).is_err());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let items: Vec<LlmAnnotationItem> = serde_json::from_value(json!([
            {"Id": "1", "Confidence": "140%"}
        ]))
        .unwrap();
        assert!(validate_and_into_annotations(items, generated_at()).is_err());
    }

    #[test]
    fn missing_optional_fields_stay_absent() {
        let items: Vec<LlmAnnotationItem> = serde_json::from_value(json!([
            {"Id": "1"}
        ]))
        .unwrap();
        let out = validate_and_into_annotations(items, generated_at()).unwrap();
        assert_eq!(out[0].recommend, None);
        assert_eq!(out[0].forecast, None);
        assert_eq!(out[0].confidence_pct, None);
        assert_eq!(out[0].expected_profit, None);
    }
}
