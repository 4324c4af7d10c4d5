use crate::domain::stock::StockSnapshot;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

pub async fn upsert_snapshots_atomic(
    pool: &sqlx::PgPool,
    snapshots: &[StockSnapshot],
    refreshed_at: DateTime<Utc>,
) -> anyhow::Result<u64> {
    anyhow::ensure!(!snapshots.is_empty(), "snapshots must be non-empty");

    let mut tx = pool.begin().await.context("begin transaction failed")?;

    // Batch the upsert to reduce round trips (critical for CI runners / remote DB).
    // Keep it transactional.
    let mut affected: u64 = 0;
    let chunk_size: usize = std::env::var("SNAPSHOT_UPSERT_BATCH")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(200);

    anyhow::ensure!(chunk_size >= 1, "SNAPSHOT_UPSERT_BATCH must be >= 1");

    let mut batch_idx: usize = 0;
    for chunk in snapshots.chunks(chunk_size) {
        batch_idx += 1;
        let t0 = std::time::Instant::now();
        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO stock_snapshots (stock_id, symbol, name, payload, refreshed_at) ",
        );
        qb.push_values(chunk, |mut b, snapshot| {
            // Feed values arrive as JSON numbers, so serialization cannot hit
            // non-finite floats.
            let payload = serde_json::to_value(snapshot).expect("snapshot serialize failed");
            b.push_bind(snapshot.id.trim())
                .push_bind(snapshot.symbol.trim())
                .push_bind(snapshot.name.trim())
                .push_bind(payload)
                .push_bind(refreshed_at);
        });
        qb.push(
            " ON CONFLICT (stock_id) DO UPDATE \
               SET symbol = EXCLUDED.symbol, name = EXCLUDED.name, \
                   payload = EXCLUDED.payload, refreshed_at = EXCLUDED.refreshed_at",
        );

        let res = qb
            .build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .context("batch upsert stock_snapshots failed")?;
        affected += res.rows_affected();

        tracing::debug!(
            batch_idx,
            batch_size = chunk.len(),
            elapsed_ms = t0.elapsed().as_millis(),
            "stock_snapshots batch upsert"
        );
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(affected)
}

pub async fn load_latest(pool: &sqlx::PgPool) -> anyhow::Result<Vec<StockSnapshot>> {
    let rows = sqlx::query_as::<_, (Value,)>(
        "SELECT payload FROM stock_snapshots ORDER BY symbol ASC, stock_id ASC",
    )
    .persistent(false)
    .fetch_all(pool)
    .await
    .context("select stock_snapshots failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for (payload,) in rows {
        let snapshot = serde_json::from_value::<StockSnapshot>(payload)
            .context("invalid snapshot payload in DB")?;
        out.push(snapshot);
    }
    Ok(out)
}

pub async fn record_refresh_run(
    pool: &sqlx::PgPool,
    provider: &str,
    status: &str,
    error: Option<&str>,
    snapshot_count: Option<i64>,
    raw_response: Option<Value>,
) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    let started_at: DateTime<Utc> = Utc::now();

    sqlx::query(
        "INSERT INTO refresh_runs (id, started_at, provider, status, error, snapshot_count, raw_response) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .persistent(false)
    .bind(id)
    .bind(started_at)
    .bind(provider)
    .bind(status)
    .bind(error)
    .bind(snapshot_count)
    .bind(raw_response)
    .execute(pool)
    .await
    .context("insert refresh_runs failed")?;

    Ok(id)
}
