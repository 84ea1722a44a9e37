use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::auth::Role;
use crate::config::Settings;
use crate::error::ApiError;
use crate::models::{Booking, BookingStatus};

/// Booking policy value object. Loaded from the single-row `policies` table
/// through a TTL cache and handed to callers by value; never a global.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Policy {
    pub hold_ttl_minutes: i64,
    pub lead_time_minutes: i64,
    pub future_window_days: i64,
    pub reschedule_lock_hours: i64,
    pub cancel_lock_hours: i64,
    pub max_reschedules: i64,
    pub online_discount_percent: i64,
    pub online_enabled: bool,
    pub reminder_lead_minutes: Option<i64>,
    pub reminder_same_day_minutes: Option<i64>,
}

impl Policy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            hold_ttl_minutes: settings.hold_ttl_minutes,
            lead_time_minutes: settings.lead_time_minutes,
            future_window_days: settings.future_window_days,
            reschedule_lock_hours: settings.reschedule_lock_hours,
            cancel_lock_hours: settings.cancel_lock_hours,
            max_reschedules: settings.max_reschedules,
            online_discount_percent: settings.online_discount_percent,
            online_enabled: settings.online_enabled,
            reminder_lead_minutes: settings.reminder_lead_minutes,
            reminder_same_day_minutes: settings.reminder_same_day_minutes,
        }
    }

    pub fn hold_ttl(&self) -> Duration {
        Duration::minutes(self.hold_ttl_minutes.max(1))
    }

    /// Lead-time and horizon gate for a proposed start.
    pub fn can_start(&self, now: DateTime<Utc>, start: DateTime<Utc>) -> Result<(), ApiError> {
        if start < now + Duration::minutes(self.lead_time_minutes) {
            return Err(ApiError::LeadTimeBlocked {
                minutes: self.lead_time_minutes,
            });
        }
        if start > now + Duration::days(self.future_window_days) {
            return Err(ApiError::BeyondHorizon {
                days: self.future_window_days,
            });
        }
        Ok(())
    }

    pub fn can_reschedule(&self, now: DateTime<Utc>, booking: &Booking) -> Result<(), ApiError> {
        if booking.status.is_terminal() {
            return Err(ApiError::IllegalTransition {
                from: booking.status,
            });
        }
        if booking.reschedule_count >= self.max_reschedules {
            return Err(ApiError::TooManyReschedules);
        }
        if booking.starts_at - now < Duration::hours(self.reschedule_lock_hours) {
            return Err(ApiError::LockWindow {
                hours: self.reschedule_lock_hours,
            });
        }
        Ok(())
    }

    /// Cancellation gate. Staff and admin bypass the lock window.
    pub fn can_cancel(
        &self,
        now: DateTime<Utc>,
        booking: &Booking,
        by_role: Role,
    ) -> Result<(), ApiError> {
        if booking.status.is_terminal() {
            return Err(ApiError::IllegalTransition {
                from: booking.status,
            });
        }
        if by_role == Role::Client && booking.starts_at - now < Duration::hours(self.cancel_lock_hours)
        {
            return Err(ApiError::LockWindow {
                hours: self.cancel_lock_hours,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn test_default() -> Self {
        Self {
            hold_ttl_minutes: 15,
            lead_time_minutes: 0,
            future_window_days: 60,
            reschedule_lock_hours: 3,
            cancel_lock_hours: 3,
            max_reschedules: 3,
            online_discount_percent: 0,
            online_enabled: false,
            reminder_lead_minutes: None,
            reminder_same_day_minutes: None,
        }
    }
}

/// The booking lifecycle graph. Rating a done booking is not a transition
/// and is gated separately.
pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (Reserved, Confirmed)
            | (Reserved, PendingPayment)
            | (Reserved, Cancelled)
            | (Reserved, Expired)
            | (PendingPayment, Paid)
            | (PendingPayment, Cancelled)
            | (PendingPayment, Expired)
            | (Confirmed, Done)
            | (Confirmed, NoShow)
            | (Confirmed, Cancelled)
            | (Paid, Done)
            | (Paid, NoShow)
            | (Paid, Cancelled)
    )
}

// ── Store ──

/// Single-row policy storage behind a TTL cache. Seeded from the
/// environment at startup; invalidated together with the catalog.
pub struct PolicyStore {
    db: PgPool,
    fallback: Policy,
    ttl: std::time::Duration,
    cached: RwLock<Option<(Instant, Arc<Policy>)>>,
}

impl PolicyStore {
    pub fn new(db: PgPool, fallback: Policy, ttl: std::time::Duration) -> Self {
        Self {
            db,
            fallback,
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Insert the seed row when the table is empty.
    pub async fn seed(&self) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO policies (id, hold_ttl_minutes, lead_time_minutes, future_window_days,
                 reschedule_lock_hours, cancel_lock_hours, max_reschedules,
                 online_discount_percent, online_enabled,
                 reminder_lead_minutes, reminder_same_day_minutes)
             VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(self.fallback.hold_ttl_minutes)
        .bind(self.fallback.lead_time_minutes)
        .bind(self.fallback.future_window_days)
        .bind(self.fallback.reschedule_lock_hours)
        .bind(self.fallback.cancel_lock_hours)
        .bind(self.fallback.max_reschedules)
        .bind(self.fallback.online_discount_percent)
        .bind(self.fallback.online_enabled)
        .bind(self.fallback.reminder_lead_minutes)
        .bind(self.fallback.reminder_same_day_minutes)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn current(&self) -> Result<Arc<Policy>, ApiError> {
        {
            let guard = self.cached.read().await;
            if let Some((loaded_at, policy)) = guard.as_ref() {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(policy.clone());
                }
            }
        }

        let row = sqlx::query_as::<_, Policy>(
            "SELECT hold_ttl_minutes, lead_time_minutes, future_window_days,
                    reschedule_lock_hours, cancel_lock_hours, max_reschedules,
                    online_discount_percent, online_enabled,
                    reminder_lead_minutes, reminder_same_day_minutes
             FROM policies WHERE id = 1",
        )
        .fetch_optional(&self.db)
        .await?;

        let policy = Arc::new(row.unwrap_or_else(|| {
            tracing::warn!("policies row missing, using environment defaults");
            self.fallback.clone()
        }));
        *self.cached.write().await = Some((Instant::now(), policy.clone()));
        Ok(policy)
    }

    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentMethod;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, 12, 0, 0).unwrap()
    }

    fn make_booking(status: BookingStatus, starts_in_hours: i64, reschedules: i64) -> Booking {
        let starts_at = now() + Duration::hours(starts_in_hours);
        Booking {
            id: 1,
            staff_id: 1,
            client_id: 100,
            status,
            starts_at,
            ends_at: starts_at + Duration::minutes(60),
            original_minor: 80_000,
            discount_minor: 0,
            final_minor: 80_000,
            discount_percent: 0,
            currency: "UAH".into(),
            payment_method: PaymentMethod::Cash,
            invoice_ref: None,
            invoice_url: None,
            hold_expires_at: None,
            rating: None,
            reschedule_count: reschedules,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn test_can_start_ok() {
        let policy = Policy::test_default();
        assert!(policy.can_start(now(), now() + Duration::hours(2)).is_ok());
    }

    #[test]
    fn test_can_start_lead_time() {
        let policy = Policy {
            lead_time_minutes: 120,
            ..Policy::test_default()
        };
        let err = policy.can_start(now(), now() + Duration::minutes(90)).unwrap_err();
        assert!(matches!(err, ApiError::LeadTimeBlocked { minutes: 120 }));
        assert!(policy.can_start(now(), now() + Duration::minutes(120)).is_ok());
    }

    #[test]
    fn test_can_start_rejects_past() {
        let policy = Policy::test_default();
        let err = policy.can_start(now(), now() - Duration::minutes(1)).unwrap_err();
        assert!(matches!(err, ApiError::LeadTimeBlocked { .. }));
    }

    #[test]
    fn test_can_start_horizon() {
        let policy = Policy::test_default();
        let err = policy.can_start(now(), now() + Duration::days(61)).unwrap_err();
        assert!(matches!(err, ApiError::BeyondHorizon { days: 60 }));
        assert!(policy.can_start(now(), now() + Duration::days(60)).is_ok());
    }

    #[test]
    fn test_reschedule_inside_lock_window() {
        // booking 2h out, lock 3h → blocked; lock 1h → allowed
        let policy = Policy::test_default();
        let booking = make_booking(BookingStatus::Confirmed, 2, 0);
        assert!(matches!(
            policy.can_reschedule(now(), &booking).unwrap_err(),
            ApiError::LockWindow { hours: 3 }
        ));

        let relaxed = Policy {
            reschedule_lock_hours: 1,
            ..Policy::test_default()
        };
        assert!(relaxed.can_reschedule(now(), &booking).is_ok());
    }

    #[test]
    fn test_reschedule_terminal() {
        let policy = Policy::test_default();
        let booking = make_booking(BookingStatus::Cancelled, 10, 0);
        assert!(matches!(
            policy.can_reschedule(now(), &booking).unwrap_err(),
            ApiError::IllegalTransition { .. }
        ));
    }

    #[test]
    fn test_reschedule_counter_cap() {
        let policy = Policy::test_default();
        let booking = make_booking(BookingStatus::Confirmed, 10, 3);
        assert!(matches!(
            policy.can_reschedule(now(), &booking).unwrap_err(),
            ApiError::TooManyReschedules
        ));
    }

    #[test]
    fn test_cancel_lock_window_client_only() {
        let policy = Policy::test_default();
        let booking = make_booking(BookingStatus::Confirmed, 1, 0);
        assert!(matches!(
            policy.can_cancel(now(), &booking, Role::Client).unwrap_err(),
            ApiError::LockWindow { hours: 3 }
        ));
        assert!(policy.can_cancel(now(), &booking, Role::Staff).is_ok());
        assert!(policy.can_cancel(now(), &booking, Role::Admin).is_ok());
    }

    #[test]
    fn test_cancel_terminal() {
        let policy = Policy::test_default();
        let booking = make_booking(BookingStatus::Expired, 10, 0);
        assert!(matches!(
            policy.can_cancel(now(), &booking, Role::Admin).unwrap_err(),
            ApiError::IllegalTransition { .. }
        ));
    }

    #[test]
    fn test_transition_table_legal_edges() {
        use BookingStatus::*;
        assert!(can_transition(Reserved, Confirmed));
        assert!(can_transition(Reserved, PendingPayment));
        assert!(can_transition(Reserved, Expired));
        assert!(can_transition(PendingPayment, Paid));
        assert!(can_transition(PendingPayment, Expired));
        assert!(can_transition(Confirmed, Done));
        assert!(can_transition(Paid, NoShow));
        assert!(can_transition(Paid, Cancelled));
    }

    #[test]
    fn test_transition_table_rejects_regressions() {
        use BookingStatus::*;
        assert!(!can_transition(Confirmed, Reserved));
        assert!(!can_transition(Paid, PendingPayment));
        assert!(!can_transition(Done, Confirmed));
        assert!(!can_transition(Cancelled, Reserved));
        assert!(!can_transition(Expired, Confirmed));
        assert!(!can_transition(Reserved, Paid));
        assert!(!can_transition(Reserved, Done));
        assert!(!can_transition(PendingPayment, Confirmed));
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        use BookingStatus::*;
        for from in [Cancelled, Expired, Done, NoShow] {
            for to in [Reserved, PendingPayment, Confirmed, Paid, Done, NoShow, Cancelled, Expired]
            {
                assert!(!can_transition(from, to), "{from} → {to} must be illegal");
            }
        }
    }
}
