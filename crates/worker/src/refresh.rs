use anyhow::Context;
use chrono::Utc;
use egx_core::domain::recommend::classify;
use egx_core::domain::stock::{AiAnnotation, Recommendation, StockSnapshot};
use egx_core::ingest::provider::MarketDataClient;
use egx_core::llm::{AnnotateInput, AnnotatorClient};
use egx_core::notify::Notifier;
use egx_core::storage;
use egx_core::storage::positions::PositionRecord;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct RefreshSummary {
    pub snapshot_count: usize,
    pub annotated: usize,
    pub position_count: usize,
    pub changed_positions: usize,
}

/// One held position whose freshly computed recommendation differs from
/// the persisted one. The snapshot carries the position overlay so the
/// notification body can show amount and P/L.
#[derive(Debug, Clone)]
pub struct RecommendChange {
    pub position_key: i64,
    pub fresh: Recommendation,
    pub snapshot: StockSnapshot,
}

pub fn merge_annotations(
    snapshots: &mut [StockSnapshot],
    annotations: &HashMap<String, AiAnnotation>,
) -> usize {
    let mut applied = 0;
    for snapshot in snapshots.iter_mut() {
        if let Some(annotation) = annotations.get(&snapshot.id) {
            snapshot.apply_annotation(annotation);
            applied += 1;
        }
    }
    applied
}

/// Recomputes the recommendation for every held position against the
/// fresh batch and keeps only the ones that actually changed. Positions
/// whose stock vanished from the feed are skipped; the next batch wins.
pub fn recommendation_changes(
    positions: &[PositionRecord],
    snapshots: &[StockSnapshot],
) -> Vec<RecommendChange> {
    let by_id: HashMap<&str, &StockSnapshot> =
        snapshots.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut out = Vec::new();
    for position in positions {
        let Some(snapshot) = by_id.get(position.stock_id.as_str()) else {
            continue;
        };
        let merged = position.overlay_on(snapshot);
        let fresh = classify(&merged);
        if position.current_recommend != Some(fresh) {
            out.push(RecommendChange {
                position_key: position.position_key,
                fresh,
                snapshot: merged,
            });
        }
    }
    out
}

pub async fn run_refresh_cycle(
    pool: &sqlx::PgPool,
    market: &dyn MarketDataClient,
    notifier: &dyn Notifier,
    dry_run: bool,
) -> anyhow::Result<RefreshSummary> {
    let refreshed_at = Utc::now();

    let (mut snapshots, _raw) = market
        .fetch_equities()
        .await
        .context("market data fetch failed")?;
    anyhow::ensure!(!snapshots.is_empty(), "market data returned no equities");

    let annotations = storage::annotations::load_annotations(pool).await?;
    let annotated = merge_annotations(&mut snapshots, &annotations);

    let positions = storage::positions::list_all(pool).await?;
    let changes = recommendation_changes(&positions, &snapshots);

    let summary = RefreshSummary {
        snapshot_count: snapshots.len(),
        annotated,
        position_count: positions.len(),
        changed_positions: changes.len(),
    };

    if dry_run {
        return Ok(summary);
    }

    storage::snapshots::upsert_snapshots_atomic(pool, &snapshots, refreshed_at).await?;

    for change in &changes {
        storage::positions::update_current_recommend(pool, change.position_key, change.fresh)
            .await?;
        // Notification delivery is best-effort; a dead sink must not
        // stall the refresh loop.
        if let Err(err) = notifier.notify(&change.snapshot, change.fresh, None).await {
            tracing::warn!(
                position_key = change.position_key,
                error = %err,
                "change notification failed"
            );
        }
    }

    Ok(summary)
}

/// Annotates the latest stored batch and persists the result, so
/// subsequent refresh cycles merge it in.
pub async fn run_annotation_pass(
    pool: &sqlx::PgPool,
    annotator: &dyn AnnotatorClient,
) -> anyhow::Result<usize> {
    let snapshots = storage::snapshots::load_latest(pool).await?;
    anyhow::ensure!(
        !snapshots.is_empty(),
        "no stored snapshots to annotate; run a refresh first"
    );

    let input = AnnotateInput::try_new(snapshots)?;
    let annotations = annotator.annotate(input).await?;
    anyhow::ensure!(!annotations.is_empty(), "annotator returned no annotations");

    let provider = format!("{:?}", annotator.provider()).to_lowercase();
    storage::annotations::upsert_annotations_atomic(pool, &annotations, &provider).await?;
    Ok(annotations.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use egx_core::domain::stock::{Forecast, Technical};
    use uuid::Uuid;

    fn snapshot(id: &str) -> StockSnapshot {
        StockSnapshot {
            id: id.to_string(),
            name: format!("Stock {id}"),
            symbol: format!("SYM{id}"),
            last: 10.0,
            high: 10.0,
            low: 10.0,
            change_abs: 1.0,
            change_pct: 1.0,
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
            beta: 0.5,
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

    fn position(key: i64, stock_id: &str, current: Option<Recommendation>) -> PositionRecord {
        PositionRecord {
            position_key: key,
            user_id: Uuid::nil(),
            stock_id: stock_id.to_string(),
            symbol: format!("SYM{stock_id}"),
            name: format!("Stock {stock_id}"),
            amount: 100,
            purchase_price: 9.0,
            prev_recommend: None,
            current_recommend: current,
            opened_at: Utc.with_ymd_and_hms(2026, 8, 2, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn merge_applies_matching_annotations_only() {
        let mut snapshots = vec![snapshot("1"), snapshot("2")];
        let mut annotations = HashMap::new();
        annotations.insert(
            "1".to_string(),
            AiAnnotation {
                stock_id: "1".to_string(),
                recommend: Some(Recommendation::Buy),
                forecast: Some(Forecast::Up),
                confidence_pct: Some(80.0),
                expected_profit: Some(2.0),
                generated_at: Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap(),
            },
        );

        let applied = merge_annotations(&mut snapshots, &annotations);
        assert_eq!(applied, 1);
        assert_eq!(snapshots[0].ai_recommend, Some(Recommendation::Buy));
        assert_eq!(snapshots[0].expected_profit, Some(2.0));
        assert_eq!(snapshots[1].ai_recommend, None);
    }

    #[test]
    fn detects_a_changed_recommendation() {
        // Neutral snapshot, position currently marked buy.
        let positions = vec![position(1, "1", Some(Recommendation::Buy))];
        let mut s = snapshot("1");
        s.change_abs = 0.0;
        s.change_pct = 0.0;

        let changes = recommendation_changes(&positions, &[s]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].fresh, Recommendation::Neutral);
        assert_eq!(changes[0].position_key, 1);
        // Overlay carried the holding into the notification snapshot.
        assert_eq!(changes[0].snapshot.amount, Some(100));
    }

    #[test]
    fn unchanged_recommendation_is_not_reported() {
        let positions = vec![position(1, "1", Some(Recommendation::Neutral))];
        let mut s = snapshot("1");
        s.change_abs = 0.0;
        s.change_pct = 0.0;

        assert!(recommendation_changes(&positions, &[s]).is_empty());
    }

    #[test]
    fn position_missing_from_feed_is_skipped() {
        let positions = vec![position(1, "gone", Some(Recommendation::Buy))];
        let snapshots = vec![snapshot("1")];
        assert!(recommendation_changes(&positions, &snapshots).is_empty());
    }

    #[test]
    fn unscored_position_gets_an_initial_recommendation() {
        let positions = vec![position(1, "1", None)];
        let changes = recommendation_changes(&positions, &[snapshot("1")]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].fresh, Recommendation::Neutral);
    }
}
