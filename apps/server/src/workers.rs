use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;

use crate::booking::BookingStateMachine;
use crate::error::ApiError;
use crate::events::{DomainEvent, EventBus};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub expire_interval: std::time::Duration,
    pub reminders_interval: std::time::Duration,
    pub reconcile_interval: std::time::Duration,
    pub reconcile_grace: Duration,
    pub reminder_leads: Vec<i64>,
    pub batch_size: i64,
}

/// Spawn the three periodic lifecycle tasks. Each sweep is idempotent and
/// uses bounded batches; the per-booking locks inside the state machine
/// make concurrent replicas safe.
pub fn spawn_workers(
    db: PgPool,
    machine: Arc<BookingStateMachine>,
    events: EventBus,
    config: WorkerConfig,
) {
    {
        let db = db.clone();
        let machine = machine.clone();
        let batch = config.batch_size;
        let period = config.expire_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = expire_once(&db, &machine, batch, Utc::now()).await {
                    tracing::error!(error = %e, "hold expirer sweep failed");
                }
            }
        });
    }

    if !config.reminder_leads.is_empty() {
        let db = db.clone();
        let leads = config.reminder_leads.clone();
        let batch = config.batch_size;
        let period = config.reminders_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut previous_tick = Utc::now();
            loop {
                interval.tick().await;
                let now = Utc::now();
                match remind_once(&db, &events, &leads, previous_tick, now, batch).await {
                    Ok(_) => previous_tick = now,
                    Err(e) => tracing::error!(error = %e, "reminder sweep failed"),
                }
            }
        });
    }

    {
        let machine = machine.clone();
        let grace = config.reconcile_grace;
        let batch = config.batch_size;
        let period = config.reconcile_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = reconcile_once(&db, &machine, grace, batch, Utc::now()).await {
                    tracing::error!(error = %e, "payment reconciler sweep failed");
                }
            }
        });
    }
}

/// Drive every overdue hold to EXPIRED through the state machine.
pub async fn expire_once(
    db: &PgPool,
    machine: &BookingStateMachine,
    batch_size: i64,
    now: DateTime<Utc>,
) -> Result<usize, ApiError> {
    let due: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM bookings
         WHERE status IN ('reserved', 'pending_payment') AND hold_expires_at <= $1
         ORDER BY hold_expires_at
         LIMIT $2",
    )
    .bind(now)
    .bind(batch_size)
    .fetch_all(db)
    .await?;

    let mut expired = 0;
    for booking_id in due {
        match machine.expire_if_due(booking_id, now).await {
            Ok(true) => expired += 1,
            Ok(false) => {} // lost the race to a finalize or a sibling worker
            Err(e) => tracing::error!(booking_id, error = %e, "failed to expire hold"),
        }
    }
    if expired > 0 {
        tracing::info!(expired, "expired overdue holds");
    }
    Ok(expired)
}

/// The reminder window for one lead: bookings whose start fell due since
/// the previous tick, i.e. `starts_at ∈ (prev + lead, now + lead]`.
pub fn reminder_window(
    previous_tick: DateTime<Utc>,
    now: DateTime<Utc>,
    lead_minutes: i64,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let lead = Duration::minutes(lead_minutes);
    (previous_tick + lead, now + lead)
}

pub fn reminder_key(booking_id: i64, lead_minutes: i64) -> String {
    format!("reminder:{booking_id}:{lead_minutes}")
}

/// Emit ReminderDue for confirmed/paid bookings entering a lead window.
/// The Notifier port deduplicates on the idempotency key, so overlapping
/// windows across replicas stay harmless.
pub async fn remind_once(
    db: &PgPool,
    events: &EventBus,
    leads: &[i64],
    previous_tick: DateTime<Utc>,
    now: DateTime<Utc>,
    batch_size: i64,
) -> Result<usize, ApiError> {
    let mut emitted = 0;
    for &lead_minutes in leads {
        let (window_start, window_end) = reminder_window(previous_tick, now, lead_minutes);
        let rows = sqlx::query_as::<_, (i64, i64, i64, DateTime<Utc>)>(
            "SELECT id, staff_id, client_id, starts_at FROM bookings
             WHERE status IN ('confirmed', 'paid') AND starts_at > $1 AND starts_at <= $2
             ORDER BY starts_at
             LIMIT $3",
        )
        .bind(window_start)
        .bind(window_end)
        .bind(batch_size)
        .fetch_all(db)
        .await?;

        for (booking_id, staff_id, client_id, starts_at) in rows {
            events.publish(DomainEvent::ReminderDue {
                booking_id,
                staff_id,
                client_id,
                starts_at,
                lead_minutes,
                idempotency_key: reminder_key(booking_id, lead_minutes),
            });
            emitted += 1;
        }
    }
    if emitted > 0 {
        tracing::debug!(emitted, "reminders dispatched");
    }
    Ok(emitted)
}

/// Poll the payments port for stale PENDING_PAYMENT bookings and settle
/// them either way.
pub async fn reconcile_once(
    db: &PgPool,
    machine: &BookingStateMachine,
    grace: Duration,
    batch_size: i64,
    now: DateTime<Utc>,
) -> Result<usize, ApiError> {
    let stale: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM bookings
         WHERE status = 'pending_payment' AND invoice_ref IS NOT NULL AND updated_at <= $1
         ORDER BY updated_at
         LIMIT $2",
    )
    .bind(now - grace)
    .bind(batch_size)
    .fetch_all(db)
    .await?;

    let mut settled = 0;
    for booking_id in stale {
        match machine.reconcile(booking_id).await {
            Ok(Some(state)) => {
                tracing::debug!(booking_id, ?state, "payment reconciled");
                settled += 1;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(booking_id, error = %e, "reconciliation failed"),
        }
    }
    Ok(settled)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_reminder_window_advances_with_ticks() {
        let (start, end) = reminder_window(at(12, 0), at(12, 1), 60);
        assert_eq!(start, at(13, 0));
        assert_eq!(end, at(13, 1));
    }

    #[test]
    fn test_adjacent_windows_do_not_overlap() {
        // window is (prev+lead, now+lead]: a booking falls in exactly one
        let (_, first_end) = reminder_window(at(12, 0), at(12, 1), 60);
        let (second_start, _) = reminder_window(at(12, 1), at(12, 2), 60);
        assert_eq!(first_end, second_start);
    }

    #[test]
    fn test_reminder_key_distinct_per_lead() {
        assert_ne!(reminder_key(5, 60), reminder_key(5, 1440));
        assert_ne!(reminder_key(5, 60), reminder_key(6, 60));
        assert_eq!(reminder_key(5, 60), reminder_key(5, 60));
    }
}
