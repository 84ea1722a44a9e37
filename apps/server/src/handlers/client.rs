use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;

use crate::booking::HoldInput;
use crate::error::ApiError;
use crate::models::*;
use crate::{auth, pricing, AppState};

// ── Shared booking view query (used by admin.rs too) ──

const BOOKING_VIEW_SELECT: &str =
    "SELECT b.id, b.staff_id, s.name AS staff_name, b.client_id, b.status,
            b.starts_at, b.ends_at,
            COALESCE(string_agg(sv.name, ' + ' ORDER BY bs.position), '') AS service_names,
            b.final_minor, b.currency, b.payment_method, b.hold_expires_at,
            b.rating, b.reschedule_count
     FROM bookings b
     JOIN staff s ON s.id = b.staff_id
     LEFT JOIN booking_services bs ON bs.booking_id = b.id
     LEFT JOIN services sv ON sv.id = bs.service_id";

const BOOKING_VIEW_GROUP: &str = "GROUP BY b.id, s.name";

pub fn booking_view_select() -> (&'static str, &'static str) {
    (BOOKING_VIEW_SELECT, BOOKING_VIEW_GROUP)
}

// ── Helpers ──

fn caller(headers: &HeaderMap, state: &AppState) -> Result<auth::Caller, ApiError> {
    auth::require_caller(headers, &state.settings.api_secret)
}

/// Comma-separated id list from query strings ("1,2,3").
fn parse_id_list(raw: &str) -> Result<Vec<i64>, ApiError> {
    let ids: Vec<i64> = raw
        .split(',')
        .filter(|t| !t.trim().is_empty())
        .map(|t| {
            t.trim()
                .parse()
                .map_err(|_| ApiError::BadInput(format!("invalid service id: {t}")))
        })
        .collect::<Result<_, _>>()?;
    if ids.is_empty() {
        return Err(ApiError::BadInput("service_ids must not be empty".into()));
    }
    Ok(ids)
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadInput("date must be YYYY-MM-DD".into()))
}

// ── Catalog reads ──

/// GET /api/services — active services in display order.
pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Service>>>, ApiError> {
    let snap = state.catalog.snapshot().await?;
    Ok(Json(ApiResponse::success(snap.services.clone())))
}

/// GET /api/staff?service_ids=1,2 — staff, optionally only those able to
/// perform the whole bundle.
pub async fn list_staff(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StaffQuery>,
) -> Result<Json<ApiResponse<Vec<Staff>>>, ApiError> {
    let snap = state.catalog.snapshot().await?;
    let staff = match &query.service_ids {
        Some(raw) => {
            let ids = parse_id_list(raw)?;
            snap.resolve_bundle(&ids)?;
            snap.staff
                .iter()
                .filter(|s| snap.can_perform(s.id, &ids))
                .cloned()
                .collect()
        }
        None => snap.staff.clone(),
    };
    Ok(Json(ApiResponse::success(staff)))
}

// ── Availability ──

/// GET /api/availability/days?staff_id&year&month&service_ids
pub async fn available_days(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaysQuery>,
) -> Result<Json<ApiResponse<DaysResponse>>, ApiError> {
    let ids = parse_id_list(&query.service_ids)?;
    let days = state
        .availability
        .available_days(query.staff_id, query.year, query.month, &ids)
        .await?;
    Ok(Json(ApiResponse::success(DaysResponse {
        days,
        timezone: state.availability.timezone().name().to_string(),
    })))
}

/// GET /api/availability/slots?staff_id&date&service_ids
pub async fn slots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SlotsQuery>,
) -> Result<Json<ApiResponse<SlotsResponse>>, ApiError> {
    let ids = parse_id_list(&query.service_ids)?;
    let date = parse_date(&query.date)?;
    let slots = match query.staff_id {
        Some(staff_id) => state
            .availability
            .slots(staff_id, date, &ids)
            .await?
            .into_iter()
            .map(|start| SlotView { start, staff_id })
            .collect(),
        None => state.availability.slots_any(date, &ids).await?,
    };
    Ok(Json(ApiResponse::success(SlotsResponse {
        slots,
        timezone: state.availability.timezone().name().to_string(),
    })))
}

/// POST /api/quote — pricing snapshot without touching the schedule.
pub async fn quote(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QuoteRequest>,
) -> Result<Json<ApiResponse<PricingSnapshot>>, ApiError> {
    let snap = state.catalog.snapshot().await?;
    let policy = state.policy.current().await?;
    let snapshot = pricing::quote(
        &snap,
        &policy,
        &body.service_ids,
        body.staff_id,
        body.payment_method,
        &state.settings.currency,
    )?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// POST /api/slots/check — advisory availability probe for an exact start.
pub async fn check_slot(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CheckSlotRequest>,
) -> Result<Json<ApiResponse<CheckSlotResponse>>, ApiError> {
    let outcome = state
        .availability
        .check_slot(body.staff_id, body.start, &body.service_ids)
        .await?;
    Ok(Json(ApiResponse::success(CheckSlotResponse {
        available: outcome.available,
        conflict: outcome.conflict,
        reason: outcome.reason,
    })))
}

// ── Booking lifecycle ──

/// POST /api/bookings — place a hold.
pub async fn create_hold(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<HoldApiRequest>,
) -> Result<Json<ApiResponse<HoldResponse>>, ApiError> {
    let caller = caller(&headers, &state)?;
    let outcome = state
        .machine
        .hold(HoldInput {
            client_id: caller.subject,
            staff_id: body.staff_id,
            start: body.start,
            service_ids: body.service_ids,
            payment_method: body.payment_method,
        })
        .await?;
    let expires_at = outcome
        .booking
        .hold_expires_at
        .unwrap_or(outcome.booking.starts_at);
    Ok(Json(ApiResponse::success(HoldResponse {
        booking_id: outcome.booking.id,
        staff_id: outcome.booking.staff_id,
        expires_at,
        snapshot: outcome.snapshot,
    })))
}

/// POST /api/bookings/{id}/finalize
pub async fn finalize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<FinalizeRequest>,
) -> Result<Json<ApiResponse<FinalizeResponse>>, ApiError> {
    let caller = caller(&headers, &state)?;
    let outcome = state.machine.finalize(id, body.payment_method, caller).await?;
    Ok(Json(ApiResponse::success(FinalizeResponse {
        status: outcome.status,
        invoice_url: outcome.invoice_url,
    })))
}

/// POST /api/bookings/{id}/reschedule
pub async fn reschedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<RescheduleRequest>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let caller = caller(&headers, &state)?;
    let booking = state.machine.reschedule(id, body.new_start, caller).await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// DELETE /api/bookings/{id}
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Booking>>, ApiError> {
    let caller = caller(&headers, &state)?;
    let booking = state.machine.cancel(id, caller).await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// POST /api/bookings/{id}/rate
pub async fn rate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<RateRequest>,
) -> Result<Json<ApiResponse<&'static str>>, ApiError> {
    let caller = caller(&headers, &state)?;
    state.machine.rate(id, caller, body.rating).await?;
    Ok(Json(ApiResponse::success("rated")))
}

/// GET /api/bookings/my?mode=upcoming|history
pub async fn my_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<MyBookingsQuery>,
) -> Result<Json<ApiResponse<Vec<BookingView>>>, ApiError> {
    let caller = caller(&headers, &state)?;
    let now = Utc::now();

    let mode = query.mode.as_deref().unwrap_or("upcoming");
    let sql = match mode {
        "upcoming" => format!(
            "{BOOKING_VIEW_SELECT}
             WHERE b.client_id = $1 AND b.starts_at >= $2
               AND b.status NOT IN ('cancelled', 'expired', 'done', 'no_show')
             {BOOKING_VIEW_GROUP}
             ORDER BY b.starts_at ASC"
        ),
        "history" => format!(
            "{BOOKING_VIEW_SELECT}
             WHERE b.client_id = $1
               AND (b.starts_at < $2
                    OR b.status IN ('cancelled', 'expired', 'done', 'no_show'))
             {BOOKING_VIEW_GROUP}
             ORDER BY b.starts_at DESC"
        ),
        other => {
            return Err(ApiError::BadInput(format!("unknown mode: {other}")));
        }
    };

    let bookings = sqlx::query_as::<_, BookingView>(&sql)
        .bind(caller.subject)
        .bind(now)
        .fetch_all(&state.db)
        .await?;
    Ok(Json(ApiResponse::success(bookings)))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list("1,2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_id_list(" 7 ").unwrap(), vec![7]);
        assert_eq!(parse_id_list("5,,6").unwrap(), vec![5, 6]);
    }

    #[test]
    fn test_parse_id_list_rejects_garbage() {
        assert!(parse_id_list("a,b").is_err());
        assert!(parse_id_list("").is_err());
        assert!(parse_id_list(",").is_err());
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2026-06-10").unwrap(),
            NaiveDate::from_ymd_opt(2026, 6, 10).unwrap()
        );
        assert!(parse_date("10.06.2026").is_err());
        assert!(parse_date("2026-13-01").is_err());
    }
}
