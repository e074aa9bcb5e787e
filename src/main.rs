//! Extraction service binary entrypoint.
//! Boots the Axum server: admin/observability routes, `/resolve`, `/metrics`.

use shuttle_axum::ShuttleAxum;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wishlist_extract::{
    api, metrics::Metrics, AppState, PipelineConfig, ProductResolver, RateLimiterService,
};

/// Compact logs filtered by `RUST_LOG`; `LOG_FORMAT=json` for structured
/// output. `try_init` because the Shuttle runtime may already have
/// installed a subscriber.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wishlist_extract=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer().compact()))
        .try_init();
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = PipelineConfig::load()?;
    info!(
        sources = ?config.sources.keys().collect::<Vec<_>>(),
        max_daily_cost = config.max_daily_cost,
        "pipeline config loaded"
    );

    let limiter = RateLimiterService::new(config);
    limiter.spawn_maintenance();

    let resolver = ProductResolver::from_env(&limiter);
    let metrics = Metrics::init(limiter.max_daily_cost())?;

    let router = api::router(AppState::new(limiter, resolver)).merge(metrics.router());

    Ok(router.into())
}
