use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;

use crate::availability::local_instant;
use crate::error::ApiError;
use crate::events::DomainEvent;
use crate::models::*;
use crate::{auth, AppState};

fn admin(headers: &HeaderMap, state: &AppState) -> Result<auth::Caller, ApiError> {
    auth::require_admin(headers, &state.settings.api_secret)
}

/// Local calendar day → UTC bounds in the business timezone.
fn local_day_bounds(
    state: &AppState,
    date: NaiveDate,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let tz = state.settings.business_timezone;
    let start = local_instant(tz, date, 0)
        .ok_or_else(|| ApiError::BadInput("date is not representable".into()))?;
    Ok((start, start + Duration::days(1)))
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadInput("date must be YYYY-MM-DD".into()))
}

/// GET /api/admin/bookings?date=|from=&to= — schedule overview. Without
/// filters, everything upcoming.
pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AdminBookingsQuery>,
) -> Result<Json<ApiResponse<Vec<BookingView>>>, ApiError> {
    admin(&headers, &state)?;

    let (select, group) = super::client::booking_view_select();
    let active = "b.status NOT IN ('cancelled', 'expired')";

    let bookings = if let Some(date) = &query.date {
        let (day_start, day_end) = local_day_bounds(&state, parse_date(date)?)?;
        let sql = format!(
            "{select} WHERE b.starts_at >= $1 AND b.starts_at < $2 AND {active}
             {group} ORDER BY b.starts_at ASC"
        );
        sqlx::query_as::<_, BookingView>(&sql)
            .bind(day_start)
            .bind(day_end)
            .fetch_all(&state.db)
            .await
    } else if let (Some(from), Some(to)) = (&query.from, &query.to) {
        let (range_start, _) = local_day_bounds(&state, parse_date(from)?)?;
        let (_, range_end) = local_day_bounds(&state, parse_date(to)?)?;
        let sql = format!(
            "{select} WHERE b.starts_at >= $1 AND b.starts_at < $2 AND {active}
             {group} ORDER BY b.starts_at ASC"
        );
        sqlx::query_as::<_, BookingView>(&sql)
            .bind(range_start)
            .bind(range_end)
            .fetch_all(&state.db)
            .await
    } else {
        let sql = format!(
            "{select} WHERE b.starts_at >= $1 AND {active}
             {group} ORDER BY b.starts_at ASC"
        );
        sqlx::query_as::<_, BookingView>(&sql)
            .bind(Utc::now())
            .fetch_all(&state.db)
            .await
    }?;

    Ok(Json(ApiResponse::success(bookings)))
}

/// POST /api/admin/bookings/{id}/done
pub async fn mark_done(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let caller = admin(&headers, &state)?;
    let booking = state.machine.mark_done(id, caller).await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// POST /api/admin/bookings/{id}/no-show
pub async fn mark_no_show(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let caller = admin(&headers, &state)?;
    let booking = state.machine.mark_no_show(id, caller).await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// POST /api/admin/bookings/{id}/cancel — bypasses client lock windows.
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let caller = admin(&headers, &state)?;
    let booking = state.machine.cancel(id, caller).await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// POST /api/admin/catalog/invalidate — drop the catalog and policy caches
/// after out-of-band catalog edits.
pub async fn invalidate_catalog(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<&'static str>>, ApiError> {
    admin(&headers, &state)?;
    state.catalog.invalidate().await;
    state.policy.invalidate().await;
    state.events.publish(DomainEvent::CatalogInvalidated);
    Ok(Json(ApiResponse::success("invalidated")))
}
