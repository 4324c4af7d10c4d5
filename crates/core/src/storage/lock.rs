use anyhow::Context;

// Advisory locks are scoped to the Postgres session. This is used as a
// best-effort guard against concurrent refresh cycles from two workers
// pointed at the same database.
const LOCK_NAMESPACE: i64 = 0x4547_5854; // "EGXT" as hex-ish namespace.
const REFRESH_LOCK_KEY: i64 = LOCK_NAMESPACE ^ 0x1;

pub async fn try_acquire_refresh_lock(pool: &sqlx::PgPool) -> anyhow::Result<bool> {
    let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(REFRESH_LOCK_KEY)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to acquire advisory lock (key={REFRESH_LOCK_KEY})"))?;
    Ok(acquired.0)
}

pub async fn release_refresh_lock(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .persistent(false)
        .bind(REFRESH_LOCK_KEY)
        .execute(pool)
        .await
        .with_context(|| format!("failed to release advisory lock (key={REFRESH_LOCK_KEY})"))?;
    Ok(())
}
