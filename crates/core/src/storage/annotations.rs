use crate::domain::stock::{AiAnnotation, Forecast, Recommendation};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub async fn upsert_annotations_atomic(
    pool: &sqlx::PgPool,
    annotations: &[AiAnnotation],
    provider: &str,
) -> anyhow::Result<u64> {
    anyhow::ensure!(!annotations.is_empty(), "annotations must be non-empty");

    let mut tx = pool.begin().await.context("begin transaction failed")?;

    let mut affected: u64 = 0;
    let mut qb = sqlx::QueryBuilder::new(
        "INSERT INTO ai_annotations \
         (stock_id, recommend, forecast, confidence_pct, expected_profit, provider, generated_at) ",
    );
    qb.push_values(annotations, |mut b, a| {
        b.push_bind(a.stock_id.trim())
            .push_bind(a.recommend.map(|r| r.as_str()))
            .push_bind(a.forecast.map(|f| f.as_str()))
            .push_bind(a.confidence_pct)
            .push_bind(a.expected_profit)
            .push_bind(provider)
            .push_bind(a.generated_at);
    });
    qb.push(
        " ON CONFLICT (stock_id) DO UPDATE \
           SET recommend = EXCLUDED.recommend, forecast = EXCLUDED.forecast, \
               confidence_pct = EXCLUDED.confidence_pct, expected_profit = EXCLUDED.expected_profit, \
               provider = EXCLUDED.provider, generated_at = EXCLUDED.generated_at",
    );

    let res = qb
        .build()
        .persistent(false)
        .execute(&mut *tx)
        .await
        .context("upsert ai_annotations failed")?;
    affected += res.rows_affected();

    tx.commit().await.context("commit transaction failed")?;
    Ok(affected)
}

/// Latest annotation per stock, keyed by id for the merge step.
pub async fn load_annotations(
    pool: &sqlx::PgPool,
) -> anyhow::Result<HashMap<String, AiAnnotation>> {
    let rows = sqlx::query_as::<
        _,
        (
            String,
            Option<String>,
            Option<String>,
            Option<f64>,
            Option<f64>,
            DateTime<Utc>,
        ),
    >(
        "SELECT stock_id, recommend, forecast, confidence_pct, expected_profit, generated_at \
         FROM ai_annotations",
    )
    .persistent(false)
    .fetch_all(pool)
    .await
    .context("select ai_annotations failed")?;

    let mut out = HashMap::with_capacity(rows.len());
    for (stock_id, recommend, forecast, confidence_pct, expected_profit, generated_at) in rows {
        let annotation = AiAnnotation {
            stock_id: stock_id.clone(),
            recommend: recommend.as_deref().and_then(Recommendation::parse),
            forecast: forecast.as_deref().and_then(Forecast::parse),
            confidence_pct,
            expected_profit,
            generated_at,
        };
        out.insert(stock_id, annotation);
    }
    Ok(out)
}
