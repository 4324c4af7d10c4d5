pub mod error;
pub mod json;
pub mod openai;

use crate::domain::stock::{AiAnnotation, StockSnapshot};

#[derive(Debug, Clone)]
pub struct AnnotateInput {
    pub stocks: Vec<StockSnapshot>,
}

impl AnnotateInput {
    pub fn try_new(stocks: Vec<StockSnapshot>) -> anyhow::Result<Self> {
        anyhow::ensure!(!stocks.is_empty(), "annotate input must be non-empty");
        Ok(Self { stocks })
    }
}

#[derive(Debug, Clone)]
pub enum Provider {
    OpenAI,
}

#[async_trait::async_trait]
pub trait AnnotatorClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Annotate a batch of snapshots with recommendation, forecast,
    /// confidence and expected profit. Returns one annotation per stock
    /// the model chose to cover; callers join them back by id.
    async fn annotate(&self, input: AnnotateInput) -> anyhow::Result<Vec<AiAnnotation>>;
}
