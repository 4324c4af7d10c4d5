use crate::domain::contract::{validate_and_into_annotations, LlmAnnotationItem};
use crate::domain::stock::AiAnnotation;
use anyhow::Context;
use chrono::{DateTime, Utc};

pub fn extract_json_array(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        // Remove Markdown fences (```json ... ``` or ``` ... ```).
        let mut inner = trimmed;
        if let Some(after_first) = inner.splitn(2, '\n').nth(1) {
            inner = after_first;
        }
        if let Some(end) = inner.rfind("```") {
            inner = &inner[..end];
        }
        return Some(inner.trim().to_string());
    }

    // Best-effort extraction: first '[' to last ']'.
    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    if end <= start {
        return None;
    }
    Some(trimmed[start..=end].trim().to_string())
}

pub fn parse_annotations(
    text: &str,
    generated_at: DateTime<Utc>,
) -> anyhow::Result<Vec<AiAnnotation>> {
    let json_str = extract_json_array(text).unwrap_or_else(|| text.trim().to_string());
    let items = serde_json::from_str::<Vec<LlmAnnotationItem>>(&json_str)
        .with_context(|| format!("annotator output is not a valid JSON array: {json_str}"))?;
    validate_and_into_annotations(items, generated_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stock::{Forecast, Recommendation};
    use chrono::TimeZone;
    use serde_json::json;

    fn generated_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap()
    }

    fn valid_batch_json() -> String {
        json!([
            {
                "Id": "12949",
                "AIRecommend": "Buy",
                "Forecast": "Up",
                "Confidence": "70%",
                "ExpectedProfit": 2.5
            },
            {
                "Id": "12950",
                "AIRecommend": "Strong Sell",
                "Forecast": "Down",
                "Confidence": "90%",
                "ExpectedProfit": -4.0
            }
        ])
        .to_string()
    }

    #[test]
    fn extract_handles_fenced_blocks() {
        let body = "[{\"Id\":\"1\"}]";
        let fenced = format!("```json\n{body}\n```\n");
        assert_eq!(extract_json_array(&fenced), Some(body.to_string()));
    }

    #[test]
    fn extract_falls_back_to_brackets() {
        let s = "Here you go: [{\"Id\":\"1\"}] hope that helps";
        assert_eq!(extract_json_array(s), Some("[{\"Id\":\"1\"}]".to_string()));
    }

    #[test]
    fn parse_accepts_valid_batch() {
        let out = parse_annotations(&valid_batch_json(), generated_at()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].stock_id, "12949");
        assert_eq!(out[0].recommend, Some(Recommendation::Buy));
        assert_eq!(out[1].forecast, Some(Forecast::Down));
        assert_eq!(out[1].expected_profit, Some(-4.0));
    }

    #[test]
    fn parse_accepts_fenced_batch() {
        let fenced = format!("```json\n{}\n```", valid_batch_json());
        let out = parse_annotations(&fenced, generated_at()).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn parse_rejects_a_bare_object() {
        let s = "{\"Id\": \"1\"}";
        assert!(parse_annotations(s, generated_at()).is_err());
    }

    #[test]
    fn parse_rejects_prose() {
        assert!(parse_annotations("I cannot help with that.", generated_at()).is_err());
    }
}
