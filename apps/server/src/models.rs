use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Status & payment enums ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "booking_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Reserved,
    PendingPayment,
    Confirmed,
    Paid,
    Done,
    NoShow,
    Cancelled,
    Expired,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::PendingPayment => "pending_payment",
            Self::Confirmed => "confirmed",
            Self::Paid => "paid",
            Self::Done => "done",
            Self::NoShow => "no_show",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Terminal states admit no further transitions (rating a done booking
    /// is not a transition).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired | Self::Done | Self::NoShow)
    }

    pub fn is_hold(self) -> bool {
        matches!(self, Self::Reserved | Self::PendingPayment)
    }

    /// Whether a booking in this state occupies its interval for
    /// availability and overlap checks. Holds count only while their expiry
    /// is in the future.
    pub fn blocks_slot(self, hold_expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Confirmed | Self::Paid | Self::Done => true,
            Self::Reserved | Self::PendingPayment => {
                hold_expires_at.is_some_and(|expiry| expiry > now)
            }
            Self::NoShow | Self::Cancelled | Self::Expired => false,
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Online,
}

// ── Database models ──

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub duration_min: i64,
    pub price_minor: i64,
    pub currency: String,
    pub is_active: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Staff {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkingWindow {
    pub staff_id: i64,
    pub weekday: i16,
    pub open_min: i32,
    pub close_min: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BreakWindow {
    pub staff_id: i64,
    pub weekday: i16,
    pub start_min: i32,
    pub end_min: i32,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Booking {
    pub id: i64,
    pub staff_id: i64,
    pub client_id: i64,
    pub status: BookingStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub original_minor: i64,
    pub discount_minor: i64,
    pub final_minor: i64,
    pub discount_percent: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub invoice_ref: Option<String>,
    pub invoice_url: Option<String>,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub rating: Option<i32>,
    pub reschedule_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn blocks_slot(&self, now: DateTime<Utc>) -> bool {
        self.status.blocks_slot(self.hold_expires_at, now)
    }

    pub fn snapshot(&self) -> PricingSnapshot {
        PricingSnapshot {
            original_minor: self.original_minor,
            discount_minor: self.discount_minor,
            final_minor: self.final_minor,
            discount_percent: self.discount_percent,
            currency: self.currency.clone(),
            duration_min: (self.ends_at - self.starts_at).num_minutes(),
            payment_method: self.payment_method,
        }
    }
}

/// Immutable price components bound to a booking at hold time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    pub original_minor: i64,
    pub discount_minor: i64,
    pub final_minor: i64,
    pub discount_percent: i64,
    pub currency: String,
    pub duration_min: i64,
    pub payment_method: PaymentMethod,
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct StaffQuery {
    pub service_ids: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    pub staff_id: Option<i64>,
    pub year: i32,
    pub month: u32,
    pub service_ids: String,
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    pub staff_id: Option<i64>,
    pub date: String,
    pub service_ids: String,
}

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub service_ids: Vec<i64>,
    pub staff_id: Option<i64>,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Deserialize)]
pub struct CheckSlotRequest {
    pub staff_id: Option<i64>,
    pub start: DateTime<Utc>,
    pub service_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HoldApiRequest {
    pub staff_id: Option<i64>,
    pub start: DateTime<Utc>,
    pub service_ids: Vec<i64>,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub new_start: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub rating: i32,
}

#[derive(Debug, Deserialize)]
pub struct MyBookingsQuery {
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdminBookingsQuery {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DaysResponse {
    pub days: Vec<u32>,
    pub timezone: String,
}

#[derive(Debug, Serialize)]
pub struct SlotView {
    pub start: DateTime<Utc>,
    pub staff_id: i64,
}

#[derive(Debug, Serialize)]
pub struct SlotsResponse {
    pub slots: Vec<SlotView>,
    pub timezone: String,
}

#[derive(Debug, Serialize)]
pub struct ConflictView {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CheckSlotResponse {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct HoldResponse {
    pub booking_id: i64,
    pub staff_id: i64,
    pub expires_at: DateTime<Utc>,
    pub snapshot: PricingSnapshot,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub status: BookingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_url: Option<String>,
}

/// Fully materialized booking row for list/detail responses.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct BookingView {
    pub id: i64,
    pub staff_id: i64,
    pub staff_name: String,
    pub client_id: i64,
    pub status: BookingStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub service_names: String,
    pub final_minor: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub hold_expires_at: Option<DateTime<Utc>>,
    pub rating: Option<i32>,
    pub reschedule_count: i64,
}

// ── Response envelope ──

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            tag: None,
        }
    }

    pub fn failure(tag: &'static str, msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
            tag: Some(tag),
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, h, 0, 0).unwrap()
    }

    #[test]
    fn test_terminal_states() {
        assert!(BookingStatus::Cancelled.is_terminal());
        assert!(BookingStatus::Expired.is_terminal());
        assert!(BookingStatus::Done.is_terminal());
        assert!(BookingStatus::NoShow.is_terminal());
        assert!(!BookingStatus::Reserved.is_terminal());
        assert!(!BookingStatus::PendingPayment.is_terminal());
        assert!(!BookingStatus::Confirmed.is_terminal());
        assert!(!BookingStatus::Paid.is_terminal());
    }

    #[test]
    fn test_confirmed_always_blocks() {
        assert!(BookingStatus::Confirmed.blocks_slot(None, at(12)));
        assert!(BookingStatus::Paid.blocks_slot(None, at(12)));
        assert!(BookingStatus::Done.blocks_slot(None, at(12)));
    }

    #[test]
    fn test_live_hold_blocks() {
        assert!(BookingStatus::Reserved.blocks_slot(Some(at(13)), at(12)));
        assert!(BookingStatus::PendingPayment.blocks_slot(Some(at(13)), at(12)));
    }

    #[test]
    fn test_lapsed_hold_does_not_block() {
        assert!(!BookingStatus::Reserved.blocks_slot(Some(at(11)), at(12)));
        assert!(!BookingStatus::Reserved.blocks_slot(None, at(12)));
    }

    #[test]
    fn test_terminal_never_blocks() {
        assert!(!BookingStatus::Cancelled.blocks_slot(Some(at(13)), at(12)));
        assert!(!BookingStatus::Expired.blocks_slot(Some(at(13)), at(12)));
        assert!(!BookingStatus::NoShow.blocks_slot(None, at(12)));
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(BookingStatus::PendingPayment.as_str(), "pending_payment");
        assert_eq!(BookingStatus::NoShow.as_str(), "no_show");
    }
}
