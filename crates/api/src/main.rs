use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use egx_core::domain::recommend::{classify, top_buy_candidates, top_sell_candidates};
use egx_core::domain::stock::{Recommendation, StockSnapshot};
use egx_core::notify::Notifier;
use egx_core::storage;
use egx_core::storage::positions::PositionRecord;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = egx_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match egx_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let notifier: Arc<dyn Notifier> = egx_core::notify::from_settings(&settings)?.into();

    let state = AppState { pool, notifier };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/stocks", get(get_stocks))
        .route("/stocks/top-buy", get(get_top_buy))
        .route("/users/:user_id/positions", get(get_positions))
        .route("/users/:user_id/positions/top-sell", get(get_top_sell))
        .route("/positions", post(open_position))
        .route("/positions/:position_key", delete(close_position))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    pool: Option<PgPool>,
    notifier: Arc<dyn Notifier>,
}

/// A snapshot plus its freshly computed recommendation. The label is
/// derived on read, never served from storage.
#[derive(Debug, Serialize)]
struct ApiStock {
    #[serde(flatten)]
    snapshot: StockSnapshot,
    recommendation: Recommendation,
}

#[derive(Debug, Serialize)]
struct ApiPosition {
    #[serde(flatten)]
    snapshot: StockSnapshot,
    recommendation: Recommendation,
    profit_loss: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OpenPositionRequest {
    user_id: Uuid,
    stock_id: String,
    amount: i64,
}

fn into_api_stock(snapshot: StockSnapshot) -> ApiStock {
    let recommendation = classify(&snapshot);
    ApiStock {
        snapshot,
        recommendation,
    }
}

fn into_api_position(snapshot: StockSnapshot) -> ApiPosition {
    let recommendation = classify(&snapshot);
    let profit_loss = snapshot.unrealized_pnl();
    ApiPosition {
        snapshot,
        recommendation,
        profit_loss,
    }
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Latest snapshots with stored annotations merged in by id.
async fn load_merged(pool: &PgPool) -> anyhow::Result<Vec<StockSnapshot>> {
    let mut snapshots = storage::snapshots::load_latest(pool).await?;
    let annotations = storage::annotations::load_annotations(pool).await?;
    for snapshot in snapshots.iter_mut() {
        if let Some(annotation) = annotations.get(&snapshot.id) {
            snapshot.apply_annotation(annotation);
        }
    }
    Ok(snapshots)
}

/// User positions overlaid on their latest snapshots. Positions whose
/// stock is missing from the stored batch are dropped from the view
/// until the next refresh brings the stock back.
async fn load_user_positions(pool: &PgPool, user_id: Uuid) -> anyhow::Result<Vec<StockSnapshot>> {
    let positions = storage::positions::list_for_user(pool, user_id).await?;
    let snapshots = load_merged(pool).await?;

    let mut out = Vec::with_capacity(positions.len());
    for position in &positions {
        match snapshots.iter().find(|s| s.id == position.stock_id) {
            Some(snapshot) => out.push(position.overlay_on(snapshot)),
            None => {
                tracing::warn!(
                    position_key = position.position_key,
                    stock_id = %position.stock_id,
                    "position has no stored snapshot; omitting from view"
                );
            }
        }
    }
    Ok(out)
}

async fn get_stocks(State(state): State<AppState>) -> Result<Json<Vec<ApiStock>>, StatusCode> {
    let Some(pool) = &state.pool else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let snapshots = load_merged(pool).await.map_err(internal_error)?;
    Ok(Json(snapshots.into_iter().map(into_api_stock).collect()))
}

async fn get_top_buy(State(state): State<AppState>) -> Result<Json<Vec<ApiStock>>, StatusCode> {
    let Some(pool) = &state.pool else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let snapshots = load_merged(pool).await.map_err(internal_error)?;
    let top = top_buy_candidates(&snapshots);
    Ok(Json(top.into_iter().map(into_api_stock).collect()))
}

async fn get_positions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ApiPosition>>, StatusCode> {
    let Some(pool) = &state.pool else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let user_id = Uuid::parse_str(&user_id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let merged = load_user_positions(pool, user_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(merged.into_iter().map(into_api_position).collect()))
}

async fn get_top_sell(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ApiPosition>>, StatusCode> {
    let Some(pool) = &state.pool else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let user_id = Uuid::parse_str(&user_id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let merged = load_user_positions(pool, user_id)
        .await
        .map_err(internal_error)?;
    let triggered = top_sell_candidates(&merged);
    Ok(Json(triggered.into_iter().map(into_api_position).collect()))
}

async fn open_position(
    State(state): State<AppState>,
    Json(req): Json<OpenPositionRequest>,
) -> Result<(StatusCode, Json<ApiPosition>), StatusCode> {
    let Some(pool) = &state.pool else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    if req.amount < 1 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let snapshots = load_merged(pool).await.map_err(internal_error)?;
    let snapshot = snapshots
        .into_iter()
        .find(|s| s.id == req.stock_id)
        .ok_or(StatusCode::NOT_FOUND)?;

    let recommend = classify(&snapshot);
    let position = PositionRecord {
        position_key: Utc::now().timestamp_millis(),
        user_id: req.user_id,
        stock_id: snapshot.id.clone(),
        symbol: snapshot.symbol.clone(),
        name: snapshot.name.clone(),
        amount: req.amount,
        purchase_price: snapshot.last,
        prev_recommend: Some(recommend),
        current_recommend: Some(recommend),
        opened_at: Utc::now(),
    };

    storage::positions::open_position(pool, &position)
        .await
        .map_err(internal_error)?;

    let merged = position.overlay_on(&snapshot);
    if let Err(err) = state
        .notifier
        .notify(&merged, recommend, Some("position opened"))
        .await
    {
        tracing::warn!(position_key = position.position_key, error = %err, "open notification failed");
    }

    Ok((StatusCode::CREATED, Json(into_api_position(merged))))
}

async fn close_position(
    State(state): State<AppState>,
    Path(position_key): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    let Some(pool) = &state.pool else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let closed = storage::positions::close_position(pool, position_key)
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let snapshots = load_merged(pool).await.map_err(internal_error)?;
    if let Some(snapshot) = snapshots.iter().find(|s| s.id == closed.stock_id) {
        let merged = closed.overlay_on(snapshot);
        let recommend = closed.current_recommend.unwrap_or_else(|| classify(&merged));
        if let Err(err) = state
            .notifier
            .notify(&merged, recommend, Some("position closed"))
            .await
        {
            tracing::warn!(position_key, error = %err, "close notification failed");
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &egx_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
