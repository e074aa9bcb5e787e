use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::config::{SourceConfig, SourceConfigPatch};
use crate::error::ExtractError;
use crate::limiter::{RateLimiterService, SourceStats};
use crate::resolver::{ProductResolver, ResolvedProduct, ResolverOptions};

#[derive(Clone)]
pub struct AppState {
    pub limiter: RateLimiterService,
    pub resolver: Arc<ProductResolver>,
}

impl AppState {
    pub fn new(limiter: RateLimiterService, resolver: ProductResolver) -> Self {
        Self {
            limiter,
            resolver: Arc::new(resolver),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/resolve", post(resolve))
        .route("/admin/stats", get(all_stats))
        .route("/admin/stats/{source}", get(source_stats))
        .route("/admin/cost", get(cost))
        .route("/admin/queues", get(queues))
        .route("/admin/emergency", get(emergency).post(set_emergency))
        .route("/admin/config/{source}", get(source_config).patch(update_config))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// `ExtractError` as an HTTP response.
pub struct ApiError(pub ExtractError);

impl From<ExtractError> for ApiError {
    fn from(e: ExtractError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ExtractError::UnknownSource(_) => StatusCode::NOT_FOUND,
            ExtractError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            ExtractError::EmergencyStop { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveReq {
    url: String,
    #[serde(default)]
    accept_missing_price: Option<bool>,
}

async fn resolve(
    State(state): State<AppState>,
    Json(body): Json<ResolveReq>,
) -> Result<Json<ResolvedProduct>, ApiError> {
    let mut opts: ResolverOptions = state.resolver.options();
    if let Some(accept) = body.accept_missing_price {
        opts.accept_missing_price = accept;
    }
    let product = state.resolver.resolve_with(&body.url, opts).await?;
    Ok(Json(product))
}

async fn all_stats(State(state): State<AppState>) -> Json<BTreeMap<String, SourceStats>> {
    Json(state.limiter.all_stats())
}

async fn source_stats(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<SourceStats>, ApiError> {
    state
        .limiter
        .stats(&source)
        .map(Json)
        .ok_or(ApiError(ExtractError::UnknownSource(source)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CostOut {
    total_cost: f64,
    daily_spend: f64,
    max_daily_cost: f64,
    emergency_active: bool,
}

async fn cost(State(state): State<AppState>) -> Json<CostOut> {
    let l = &state.limiter;
    Json(CostOut {
        total_cost: l.total_cost(),
        daily_spend: l.daily_spend(),
        max_daily_cost: l.max_daily_cost(),
        emergency_active: l.is_emergency_active(),
    })
}

async fn queues(State(state): State<AppState>) -> Json<BTreeMap<String, usize>> {
    Json(state.limiter.queue_status())
}

#[derive(Serialize, Deserialize)]
struct EmergencyState {
    active: bool,
}

async fn emergency(State(state): State<AppState>) -> Json<EmergencyState> {
    Json(EmergencyState {
        active: state.limiter.is_emergency_active(),
    })
}

async fn set_emergency(
    State(state): State<AppState>,
    Json(body): Json<EmergencyState>,
) -> Json<EmergencyState> {
    state.limiter.set_emergency_stop(body.active);
    Json(EmergencyState {
        active: state.limiter.is_emergency_active(),
    })
}

async fn source_config(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<SourceConfig>, ApiError> {
    state
        .limiter
        .config(&source)
        .map(Json)
        .ok_or(ApiError(ExtractError::UnknownSource(source)))
}

async fn update_config(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Json(patch): Json<SourceConfigPatch>,
) -> Result<Json<SourceConfig>, ApiError> {
    let updated = state.limiter.update_config(&source, &patch)?;
    Ok(Json(updated))
}
