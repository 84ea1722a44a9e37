use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub db_ok: bool,
    pub timezone: String,
    pub currency: String,
    pub active_bookings: Option<i64>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let active_bookings: Option<i64> = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bookings
         WHERE status IN ('reserved', 'pending_payment', 'confirmed', 'paid')",
    )
    .fetch_one(&state.db)
    .await
    .ok();

    Json(HealthResponse {
        status: if active_bookings.is_some() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        db_ok: active_bookings.is_some(),
        timezone: state.settings.business_timezone.name().to_string(),
        currency: state.settings.currency.clone(),
        active_bookings,
    })
}
