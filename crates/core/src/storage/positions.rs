use crate::domain::stock::{Recommendation, StockSnapshot};
use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One recorded holding. The key is assigned by the caller at open time
/// (epoch milliseconds) and is the row's identity from then on.
#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub position_key: i64,
    pub user_id: Uuid,
    pub stock_id: String,
    pub symbol: String,
    pub name: String,
    pub amount: i64,
    pub purchase_price: f64,
    pub prev_recommend: Option<Recommendation>,
    pub current_recommend: Option<Recommendation>,
    pub opened_at: DateTime<Utc>,
}

type PositionRow = (
    i64,
    Uuid,
    String,
    String,
    String,
    i64,
    f64,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
);

const POSITION_COLUMNS: &str = "position_key, user_id, stock_id, symbol, name, amount, \
                                purchase_price, prev_recommend, current_recommend, opened_at";

impl PositionRecord {
    fn from_row(row: PositionRow) -> Self {
        let (
            position_key,
            user_id,
            stock_id,
            symbol,
            name,
            amount,
            purchase_price,
            prev_recommend,
            current_recommend,
            opened_at,
        ) = row;
        Self {
            position_key,
            user_id,
            stock_id,
            symbol,
            name,
            amount,
            purchase_price,
            prev_recommend: prev_recommend.as_deref().and_then(Recommendation::parse),
            current_recommend: current_recommend.as_deref().and_then(Recommendation::parse),
            opened_at,
        }
    }

    /// Overlays the holding onto the latest snapshot of the same stock,
    /// so ranking and P/L see live prices next to the recorded entry.
    pub fn overlay_on(&self, snapshot: &StockSnapshot) -> StockSnapshot {
        let mut out = snapshot.clone();
        out.amount = Some(self.amount);
        out.purchase_price = Some(self.purchase_price);
        out.position_key = Some(self.position_key);
        out.prev_recommend = self.prev_recommend;
        out.current_recommend = self.current_recommend;
        out
    }
}

pub async fn open_position(pool: &sqlx::PgPool, position: &PositionRecord) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO positions \
         (position_key, user_id, stock_id, symbol, name, amount, purchase_price, \
          prev_recommend, current_recommend, opened_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .persistent(false)
    .bind(position.position_key)
    .bind(position.user_id)
    .bind(&position.stock_id)
    .bind(&position.symbol)
    .bind(&position.name)
    .bind(position.amount)
    .bind(position.purchase_price)
    .bind(position.prev_recommend.map(|r| r.as_str()))
    .bind(position.current_recommend.map(|r| r.as_str()))
    .bind(position.opened_at)
    .execute(pool)
    .await
    .context("insert positions failed")?;

    Ok(())
}

pub async fn close_position(
    pool: &sqlx::PgPool,
    position_key: i64,
) -> anyhow::Result<Option<PositionRecord>> {
    let row = sqlx::query_as::<_, PositionRow>(&format!(
        "DELETE FROM positions WHERE position_key = $1 RETURNING {POSITION_COLUMNS}"
    ))
    .persistent(false)
    .bind(position_key)
    .fetch_optional(pool)
    .await
    .context("delete positions failed")?;

    Ok(row.map(PositionRecord::from_row))
}

pub async fn list_for_user(
    pool: &sqlx::PgPool,
    user_id: Uuid,
) -> anyhow::Result<Vec<PositionRecord>> {
    let rows = sqlx::query_as::<_, PositionRow>(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = $1 ORDER BY opened_at ASC"
    ))
    .persistent(false)
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("select positions for user failed")?;

    Ok(rows.into_iter().map(PositionRecord::from_row).collect())
}

pub async fn list_all(pool: &sqlx::PgPool) -> anyhow::Result<Vec<PositionRecord>> {
    let rows = sqlx::query_as::<_, PositionRow>(&format!(
        "SELECT {POSITION_COLUMNS} FROM positions ORDER BY opened_at ASC"
    ))
    .persistent(false)
    .fetch_all(pool)
    .await
    .context("select positions failed")?;

    Ok(rows.into_iter().map(PositionRecord::from_row).collect())
}

/// Single-field update used by the refresh loop: the stored current
/// value becomes the previous one, the fresh value takes its place.
pub async fn update_current_recommend(
    pool: &sqlx::PgPool,
    position_key: i64,
    recommend: Recommendation,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE positions \
         SET prev_recommend = current_recommend, current_recommend = $2 \
         WHERE position_key = $1",
    )
    .persistent(false)
    .bind(position_key)
    .bind(recommend.as_str())
    .execute(pool)
    .await
    .context("update positions.current_recommend failed")?;

    Ok(())
}
