use crate::config::Settings;
use crate::domain::stock::{AiAnnotation, StockSnapshot};
use crate::llm::error::AnnotatorDiagnosticsError;
use crate::llm::json;
use crate::llm::{AnnotateInput, AnnotatorClient, Provider};
use anyhow::Context;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

// One request covers this many stocks; larger batches degrade output
// validity faster than they save round trips.
const DEFAULT_CHUNK_SIZE: usize = 44;

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: Option<u32>,
    chunk_size: usize,
}

impl OpenAiClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_openai_api_key()?.to_string();
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let max_tokens = std::env::var("OPENAI_MAX_TOKENS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok());
        let chunk_size = std::env::var("OPENAI_CHUNK_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n >= 1)
            .unwrap_or(DEFAULT_CHUNK_SIZE);

        let timeout_secs = std::env::var("OPENAI_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            http,
            api_key,
            base_url,
            model,
            max_tokens,
            chunk_size,
        })
    }

    async fn create_chat(
        &self,
        req: ChatCompletionRequest,
    ) -> anyhow::Result<(Value, ChatCompletionResponse)> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))?,
        );

        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let res = self
            .http
            .post(url)
            .headers(headers)
            .json(&req)
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read OpenAI response body")?;
        if !status.is_success() {
            let raw_response_json = serde_json::from_str::<Value>(&text).ok();
            return Err(AnnotatorDiagnosticsError {
                provider: Provider::OpenAI,
                stage: "http",
                detail: format!("status={status}"),
                raw_output: Some(text),
                raw_response_json,
            }
            .into());
        }

        let raw_json = serde_json::from_str::<Value>(&text)
            .with_context(|| format!("failed to parse OpenAI response JSON: {text}"))?;
        let parsed = serde_json::from_value::<ChatCompletionResponse>(raw_json.clone())
            .context("failed to decode OpenAI response into ChatCompletionResponse")?;
        Ok((raw_json, parsed))
    }

    fn user_prompt(stocks: &[StockSnapshot]) -> String {
        let (header, rows) = normalize_for_prompt(stocks);

        format!(
            "You are a highly skilled stock market analyst with extensive knowledge of the Egyptian stock market. \
Analyze the following stock data and provide actionable insights.\n\n\
Tasks:\n\
1. Provide a recommendation for each stock: (\"Strong Buy\", \"Buy\", \"Hold\", \"Sell\", \"Strong Sell\").\n\
2. Predict the stock's performance for the next 3 days: (\"Up\", \"Down\", \"Stable\").\n\
3. Indicate your confidence in the recommendation and forecast as a percentage (e.g., \"85%\").\n\
4. Calculate the expected profit (or loss) for each stock over the next 3 days as a numeric price delta \
(e.g., 5 for an increase of 5 units, -3 for a decrease of 3 units).\n\n\
Output Format:\n\
Return the result as a JSON array formatted exactly as shown below:\n\
[\n\
  {{\n\
    \"Id\": \"stock_id\",\n\
    \"AIRecommend\": \"Strong Buy\",\n\
    \"Forecast\": \"Up\",\n\
    \"Confidence\": \"85%\",\n\
    \"ExpectedProfit\": 5\n\
  }}\n\
]\n\n\
Stock Data Input:\n\
- Header format:\n[ {} ]\n\
- Stock values:\n{}\n\n\
Return only the JSON array in your response. No additional explanations, text, or markdown.",
            serde_json::to_string(&header).unwrap_or_default(),
            serde_json::to_string(&rows).unwrap_or_default(),
        )
    }

    fn repair_prompt(previous_output: &str) -> String {
        format!(
            "Your previous message was NOT a valid JSON array.\n\n\
TASK: Output ONLY a single JSON array matching the schema and rules.\n\
- Do NOT include any markdown, prose, or code fences.\n\
- Do NOT include trailing commas or comments.\n\
- Use double quotes for all JSON strings.\n\
- Each element MUST include keys: Id, AIRecommend, Forecast, Confidence, ExpectedProfit.\n\
- AIRecommend MUST be one of: \"Strong Buy\", \"Buy\", \"Hold\", \"Sell\", \"Strong Sell\".\n\
- Forecast MUST be one of: \"Up\", \"Down\", \"Stable\".\n\
- Confidence MUST be a percentage string between \"0%\" and \"100%\".\n\n\
INVALID OUTPUT (for reference only; DO NOT copy verbatim):\n{previous_output}"
        )
    }

    fn response_text(res: &ChatCompletionResponse) -> anyhow::Result<String> {
        let content = res
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .map(str::trim)
            .unwrap_or_default();
        anyhow::ensure!(!content.is_empty(), "empty response from OpenAI");
        Ok(content.to_string())
    }

    async fn annotate_chunk(
        &self,
        chunk: &[StockSnapshot],
        generated_at: chrono::DateTime<Utc>,
    ) -> anyhow::Result<Vec<AiAnnotation>> {
        let make_req = |content: String| ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user",
                content,
            }],
            max_tokens: self.max_tokens,
            temperature: Some(0.0),
        };

        let (raw_json, res) = self.create_chat(make_req(Self::user_prompt(chunk))).await?;
        let text = Self::response_text(&res)?;

        match json::parse_annotations(&text, generated_at) {
            Ok(annotations) => Ok(annotations),
            Err(first_err) => {
                let mut last_err = first_err;
                let mut last_text = text;
                let mut last_raw_json = raw_json;

                // Repair attempts: 2
                for attempt in 1..=2u32 {
                    let (repair_raw_json, repair_res) = self
                        .create_chat(make_req(Self::repair_prompt(&last_text)))
                        .await?;
                    let repair_text = Self::response_text(&repair_res)?;
                    match json::parse_annotations(&repair_text, generated_at) {
                        Ok(annotations) => return Ok(annotations),
                        Err(err) => {
                            last_err = err;
                            last_text = repair_text;
                            last_raw_json = repair_raw_json;
                            tracing::warn!(
                                attempt,
                                error = %last_err,
                                "annotator output still invalid after repair attempt"
                            );
                        }
                    }
                }

                Err(AnnotatorDiagnosticsError {
                    provider: Provider::OpenAI,
                    stage: "parse_after_repair",
                    detail: format!("final_error={last_err}"),
                    raw_output: Some(last_text),
                    raw_response_json: Some(last_raw_json),
                }
                .into())
            }
        }
    }
}

#[async_trait::async_trait]
impl AnnotatorClient for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    async fn annotate(&self, input: AnnotateInput) -> anyhow::Result<Vec<AiAnnotation>> {
        let generated_at = Utc::now();
        let total = input.stocks.len();
        let chunks = input.stocks.chunks(self.chunk_size);

        let mut out = Vec::with_capacity(total);
        for (idx, chunk) in chunks.enumerate() {
            let annotations = self.annotate_chunk(chunk, generated_at).await?;
            out.extend(annotations);
            tracing::debug!(
                chunk = idx + 1,
                chunk_size = chunk.len(),
                annotated = out.len(),
                total,
                "annotator chunk done"
            );
        }
        Ok(out)
    }
}

/// Compact tabular form for the prompt: one header array plus one value
/// row per stock, in header order. Keeps the prompt far smaller than
/// repeating keys per object.
fn normalize_for_prompt(stocks: &[StockSnapshot]) -> (Vec<&'static str>, Vec<Vec<Value>>) {
    let header = vec![
        "Id",
        "Name",
        "Symbol",
        "Last",
        "High",
        "Low",
        "Volume",
        "AvgVolume",
        "PerformanceDay",
        "PerformanceWeek",
        "PerformanceMonth",
        "PerformanceYear",
        "PerformanceYtd",
        "FundamentalMarketCap",
        "FundamentalRevenue",
        "FundamentalBeta",
        "Chg",
        "ChgPct",
        "TechnicalDay",
        "TechnicalWeek",
        "TechnicalMonth",
        "TechnicalHour",
    ];

    let rows = stocks
        .iter()
        .map(|s| {
            vec![
                Value::from(s.id.as_str()),
                Value::from(s.name.as_str()),
                Value::from(s.symbol.as_str()),
                Value::from(s.last),
                Value::from(s.high),
                Value::from(s.low),
                Value::from(s.volume),
                Value::from(s.avg_volume),
                Value::from(s.performance_day),
                Value::from(s.performance_week),
                Value::from(s.performance_month),
                Value::from(s.performance_year),
                Value::from(s.performance_ytd),
                Value::from(s.market_cap),
                Value::from(s.revenue.as_str()),
                Value::from(s.beta),
                Value::from(s.change_abs),
                Value::from(s.change_pct),
                serde_json::to_value(s.technical_day).unwrap_or(Value::Null),
                serde_json::to_value(s.technical_week).unwrap_or(Value::Null),
                serde_json::to_value(s.technical_month).unwrap_or(Value::Null),
                serde_json::to_value(s.technical_hour).unwrap_or(Value::Null),
            ]
        })
        .collect();

    (header, rows)
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,

    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stock::Technical;
    use serde_json::json;

    fn snapshot(id: &str) -> StockSnapshot {
        StockSnapshot {
            id: id.to_string(),
            name: format!("Stock {id}"),
            symbol: format!("SYM{id}"),
            last: 10.0,
            high: 10.5,
            low: 9.5,
            change_abs: 0.2,
            change_pct: 2.0,
            technical_day: Technical::Buy,
            technical_week: Technical::Neutral,
            technical_month: Technical::Neutral,
            technical_hour: Technical::Neutral,
            performance_day: 1.0,
            performance_week: 2.0,
            performance_month: 3.0,
            performance_year: 4.0,
            performance_ytd: 5.0,
            performance_3y: 6.0,
            beta: 0.5,
            market_cap: 1.0e8,
            revenue: "26.60M".to_string(),
            pe_ratio: 12.0,
            volume: 1000.0,
            avg_volume: 20_000.0,
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
    fn prompt_rows_align_with_header() {
        let stocks = vec![snapshot("1"), snapshot("2")];
        let (header, rows) = normalize_for_prompt(&stocks);
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.len(), header.len());
        }
        assert_eq!(rows[0][0], Value::from("1"));
        // Technicals serialize to their wire labels.
        assert_eq!(rows[0][18], Value::from("buy"));
    }

    #[test]
    fn prompt_contains_ids_and_output_contract() {
        let stocks = vec![snapshot("12949")];
        let prompt = OpenAiClient::user_prompt(&stocks);
        assert!(prompt.contains("12949"));
        assert!(prompt.contains("\"AIRecommend\""));
        assert!(prompt.contains("JSON array"));
    }

    #[test]
    fn response_text_reads_first_choice() {
        let res: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [
                {"message": {"role": "assistant", "content": "  [ ]  "}, "finish_reason": "stop"}
            ]
        }))
        .unwrap();
        assert_eq!(OpenAiClient::response_text(&res).unwrap(), "[ ]");
    }

    #[test]
    fn response_text_rejects_empty_content() {
        let res: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [
                {"message": {"role": "assistant", "content": ""}}
            ]
        }))
        .unwrap();
        assert!(OpenAiClient::response_text(&res).is_err());
    }
}
