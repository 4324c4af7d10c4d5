use anyhow::Context;
use clap::Parser;
use egx_core::ingest::provider::{HttpJsonMarketData, MarketDataClient};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod refresh;

#[derive(Debug, Parser)]
#[command(name = "egx_worker")]
struct Args {
    /// Seconds between refresh cycles.
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,

    /// Run a single refresh cycle and exit.
    #[arg(long)]
    once: bool,

    /// Do everything except writing to the database.
    #[arg(long)]
    dry_run: bool,

    /// Run the LLM annotation pass after the first refresh.
    #[arg(long)]
    annotate: bool,

    /// Refresh even while the exchange is closed.
    #[arg(long)]
    ignore_market_hours: bool,
}

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

    let args = Args::parse();

    let market = HttpJsonMarketData::from_settings(&settings)?;
    let notifier = egx_core::notify::from_settings(&settings)?;

    let db_url = settings.require_database_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    egx_core::storage::migrate(&pool).await?;

    // Built lazily: OPENAI_API_KEY is only required when annotating.
    let annotator = if args.annotate {
        Some(egx_core::llm::openai::OpenAiClient::from_settings(
            &settings,
        )?)
    } else {
        None
    };

    let mut annotate_pending = args.annotate;
    loop {
        if !args.ignore_market_hours && !egx_core::time::egx_market::is_market_open(chrono::Utc::now())
        {
            tracing::debug!("market closed; skipping refresh tick");
        } else {
            run_guarded_cycle(&pool, &market, notifier.as_ref(), args.dry_run).await;

            if annotate_pending && !args.dry_run {
                annotate_pending = false;
                if let Some(annotator) = annotator.as_ref() {
                    match refresh::run_annotation_pass(&pool, annotator).await {
                        Ok(count) => {
                            tracing::info!(annotations = count, "annotation pass complete")
                        }
                        Err(err) => {
                            sentry_anyhow::capture_anyhow(&err);
                            tracing::error!(error = %err, "annotation pass failed");
                        }
                    }
                }
            }
        }

        if args.once {
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(args.interval_secs)) => {}
        }
    }

    Ok(())
}

async fn run_guarded_cycle(
    pool: &sqlx::PgPool,
    market: &HttpJsonMarketData,
    notifier: &dyn egx_core::notify::Notifier,
    dry_run: bool,
) {
    let provider = market.provider_name();
    let trading_date =
        match egx_core::time::egx_market::resolve_trading_date(None, chrono::Utc::now()) {
            Ok(date) => date,
            Err(err) => {
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "failed to resolve trading date");
                return;
            }
        };

    let acquired = match egx_core::storage::lock::try_acquire_refresh_lock(pool).await {
        Ok(acquired) => acquired,
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %err, "refresh lock acquisition failed");
            return;
        }
    };
    if !acquired {
        tracing::warn!("refresh lock not acquired; another run in progress");
        return;
    }

    match refresh::run_refresh_cycle(pool, market, notifier, dry_run).await {
        Ok(summary) => {
            if dry_run {
                tracing::info!(
                    dry_run = true,
                    %trading_date,
                    snapshots = summary.snapshot_count,
                    annotated = summary.annotated,
                    positions = summary.position_count,
                    changed = summary.changed_positions,
                    "refresh cycle (dry-run)"
                );
            } else {
                let raw = serde_json::json!({
                    "trading_date": trading_date,
                    "snapshots": summary.snapshot_count,
                    "annotated": summary.annotated,
                    "positions": summary.position_count,
                    "changed": summary.changed_positions,
                });
                if let Err(err) = egx_core::storage::snapshots::record_refresh_run(
                    pool,
                    provider,
                    "success",
                    None,
                    Some(summary.snapshot_count as i64),
                    Some(raw),
                )
                .await
                {
                    tracing::warn!(error = %err, "failed to record refresh run");
                }
                tracing::info!(
                    %trading_date,
                    snapshots = summary.snapshot_count,
                    annotated = summary.annotated,
                    positions = summary.position_count,
                    changed = summary.changed_positions,
                    "refresh cycle complete"
                );
            }
        }
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            if !dry_run {
                if let Err(record_err) = egx_core::storage::snapshots::record_refresh_run(
                    pool,
                    provider,
                    "error",
                    Some(&format!("{:#}", err)),
                    None,
                    None,
                )
                .await
                {
                    tracing::warn!(error = %record_err, "failed to record refresh run");
                }
            }
            tracing::error!(error = %err, "refresh cycle failed");
        }
    }

    let _ = egx_core::storage::lock::release_refresh_lock(pool).await;
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
