use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::core::{Conversion, ProviderStatus, RateSnapshot};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub uptime: String,
    pub providers: usize,
}

#[derive(Debug, Deserialize)]
pub struct RatesQuery {
    base: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConvertQuery {
    from: Option<String>,
    to: Option<String>,
    amount: Option<String>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthCheck> {
    let providers = state.engine.provider_status().len();
    let status = if providers == 0 { "degraded" } else { "healthy" };
    Json(HealthCheck {
        status: status.to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: format!("{}s", state.started_at.elapsed().as_secs()),
        providers,
    })
}

pub async fn get_rates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RatesQuery>,
) -> ApiResult<Json<RateSnapshot>> {
    let base = query
        .base
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| state.default_base.clone());
    rates_for(&state, &base).await
}

pub async fn get_rates_by_base(
    State(state): State<Arc<AppState>>,
    Path(base): Path<String>,
) -> ApiResult<Json<RateSnapshot>> {
    rates_for(&state, &base).await
}

async fn rates_for(state: &AppState, base: &str) -> ApiResult<Json<RateSnapshot>> {
    validate_currency(base)?;
    let ctx = state.request_context();
    let snapshot = state.engine.get_rates(&ctx, base).await?;
    Ok(Json(snapshot))
}

pub async fn convert(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConvertQuery>,
) -> ApiResult<Json<Conversion>> {
    let from = query
        .from
        .ok_or_else(|| ApiError::BadRequest("missing 'from' currency".to_string()))?;
    let to = query
        .to
        .ok_or_else(|| ApiError::BadRequest("missing 'to' currency".to_string()))?;
    let amount = match query.amount.as_deref() {
        None => 1.0,
        Some(raw) => raw
            .parse::<f64>()
            .ok()
            .filter(|a| a.is_finite())
            .ok_or_else(|| ApiError::BadRequest(format!("invalid amount: {raw}")))?,
    };
    validate_currency(&from)?;
    validate_currency(&to)?;

    let ctx = state.request_context();
    let conversion = state.engine.convert(&ctx, &from, &to, amount).await?;
    Ok(Json(conversion))
}

pub async fn providers(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderStatus>> {
    Json(state.engine.provider_status())
}

fn validate_currency(code: &str) -> ApiResult<()> {
    let code = code.trim();
    if code.is_empty() || code.len() > 10 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ApiError::BadRequest(format!("invalid currency code: {code}")));
    }
    Ok(())
}
