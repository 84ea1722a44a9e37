use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;

use crate::auth::{Caller, Role};
use crate::availability::{AvailabilityEngine, Interval};
use crate::catalog::Catalog;
use crate::error::ApiError;
use crate::events::{CancelReason, DomainEvent, EventBus};
use crate::models::{Booking, BookingStatus, PaymentMethod, PricingSnapshot};
use crate::payments::{PaymentProvider, PaymentState};
use crate::policy::{can_transition, PolicyStore};
use crate::pricing;

type Tx<'a> = Transaction<'a, Postgres>;

/// Advisory-lock namespace for per-booking locks, distinct from the
/// per-staff slot-bucket keyspace (whose first key is a staff id).
const BOOKING_LOCK_NS: i32 = 0x0b0c;

/// Seconds per slot-lock bucket. One hour is wide enough that any two
/// intervals which could overlap share at least one bucket, because every
/// bucket an interval touches is locked.
const BUCKET_SECONDS: i64 = 3600;

pub struct HoldInput {
    pub client_id: i64,
    pub staff_id: Option<i64>,
    pub start: DateTime<Utc>,
    pub service_ids: Vec<i64>,
    pub payment_method: PaymentMethod,
}

pub struct HoldOutcome {
    pub booking: Booking,
    pub snapshot: PricingSnapshot,
}

pub struct FinalizeOutcome {
    pub status: BookingStatus,
    pub invoice_url: Option<String>,
}

/// Owns the booking lifecycle. Every mutation runs inside a single
/// transaction under advisory locks; domain events are published only
/// after the transaction commits.
pub struct BookingStateMachine {
    db: PgPool,
    catalog: Arc<Catalog>,
    policy: Arc<PolicyStore>,
    availability: Arc<AvailabilityEngine>,
    payments: Arc<dyn PaymentProvider>,
    events: EventBus,
    currency: String,
}

impl BookingStateMachine {
    pub fn new(
        db: PgPool,
        catalog: Arc<Catalog>,
        policy: Arc<PolicyStore>,
        availability: Arc<AvailabilityEngine>,
        payments: Arc<dyn PaymentProvider>,
        events: EventBus,
        currency: String,
    ) -> Self {
        Self {
            db,
            catalog,
            policy,
            availability,
            payments,
            events,
            currency,
        }
    }

    // ── Hold ──

    /// Reserve a slot. Serializes racing attempts on the same staff/hour
    /// through transaction-scoped advisory locks, then re-checks overlap
    /// inside the transaction before inserting.
    pub async fn hold(&self, input: HoldInput) -> Result<HoldOutcome, ApiError> {
        let now = Utc::now();
        let snap = self.catalog.snapshot().await?;
        let bundle = snap.resolve_bundle(&input.service_ids)?;
        let policy = self.policy.current().await?;

        let staff_id = match input.staff_id {
            Some(id) => {
                snap.staff_member(id).ok_or(ApiError::NotFound("staff member"))?;
                if !snap.can_perform(id, &input.service_ids) {
                    return Err(ApiError::NoSkillMatch);
                }
                id
            }
            None => {
                self.availability
                    .resolve_staff(input.start, &input.service_ids)
                    .await?
            }
        };

        policy.can_start(now, input.start)?;
        let snapshot = pricing::quote(
            &snap,
            &policy,
            &input.service_ids,
            Some(staff_id),
            input.payment_method,
            &self.currency,
        )?;
        let interval = Interval::new(
            input.start,
            input.start + Duration::minutes(snapshot.duration_min),
        );

        let mut tx = self.db.begin().await?;
        acquire_slot_locks(&mut tx, staff_id, interval).await?;

        if staff_conflict(&mut tx, staff_id, interval, None, now).await?.is_some() {
            return Err(ApiError::SlotUnavailable);
        }
        if client_conflict(&mut tx, input.client_id, interval, None, now).await? {
            return Err(ApiError::ClientBusy);
        }

        let hold_expires_at = now + policy.hold_ttl();
        let booking = sqlx::query_as::<_, Booking>(
            "INSERT INTO bookings (staff_id, client_id, status, starts_at, ends_at,
                 original_minor, discount_minor, final_minor, discount_percent,
                 currency, payment_method, hold_expires_at)
             VALUES ($1, $2, 'reserved', $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING *",
        )
        .bind(staff_id)
        .bind(input.client_id)
        .bind(interval.start)
        .bind(interval.end)
        .bind(snapshot.original_minor)
        .bind(snapshot.discount_minor)
        .bind(snapshot.final_minor)
        .bind(snapshot.discount_percent)
        .bind(&snapshot.currency)
        .bind(input.payment_method)
        .bind(hold_expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_overlap_violation)?;

        for (position, service) in bundle.iter().enumerate() {
            sqlx::query(
                "INSERT INTO booking_services (booking_id, service_id, position, price_minor)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(booking.id)
            .bind(service.id)
            .bind(position as i32)
            .bind(service.price_minor)
            .execute(&mut *tx)
            .await?;
        }

        let actor = format!("client:{}", input.client_id);
        audit(&mut tx, booking.id, None, BookingStatus::Reserved, Some("hold"), &actor).await?;
        tx.commit().await?;

        tracing::info!(
            booking_id = booking.id,
            staff_id,
            client_id = input.client_id,
            starts_at = %booking.starts_at,
            "booking held"
        );
        self.events.publish(DomainEvent::BookingHeld {
            booking_id: booking.id,
            staff_id,
            client_id: input.client_id,
            starts_at: booking.starts_at,
            ends_at: booking.ends_at,
            hold_expires_at,
            snapshot: snapshot.clone(),
        });

        Ok(HoldOutcome { booking, snapshot })
    }

    // ── Finalize ──

    /// Cash: RESERVED → CONFIRMED. Online: RESERVED → PENDING_PAYMENT plus
    /// an invoice from the payments port; on invoice failure the booking is
    /// cancelled rather than left ambiguous.
    pub async fn finalize(
        &self,
        booking_id: i64,
        method: PaymentMethod,
        caller: Caller,
    ) -> Result<FinalizeOutcome, ApiError> {
        let now = Utc::now();
        let policy = self.policy.current().await?;

        let mut tx = self.db.begin().await?;
        acquire_booking_lock(&mut tx, booking_id).await?;
        let booking = booking_for_update(&mut tx, booking_id).await?;
        check_ownership(&booking, &caller)?;

        if booking.status != BookingStatus::Reserved {
            return Err(ApiError::IllegalTransition {
                from: booking.status,
            });
        }

        // The hold may have lapsed before the expirer swept it. Someone
        // else could legitimately have taken the interval since.
        if !booking.hold_expires_at.is_some_and(|expiry| expiry > now) {
            let interval = Interval::new(booking.starts_at, booking.ends_at);
            acquire_slot_locks(&mut tx, booking.staff_id, interval).await?;
            if staff_conflict(&mut tx, booking.staff_id, interval, Some(booking.id), now)
                .await?
                .is_some()
            {
                let expired = set_status(&mut tx, booking.id, BookingStatus::Expired, true, now)
                    .await?;
                audit(
                    &mut tx,
                    booking.id,
                    Some(BookingStatus::Reserved),
                    BookingStatus::Expired,
                    Some("hold lapsed before finalize"),
                    "system",
                )
                .await?;
                tx.commit().await?;
                self.events.publish(DomainEvent::HoldExpired {
                    booking_id: expired.id,
                    staff_id: expired.staff_id,
                    client_id: expired.client_id,
                    starts_at: expired.starts_at,
                });
                return Err(ApiError::SlotUnavailable);
            }
        }

        // Switching the payment method at finalize re-prices the discount;
        // the snapshot freezes after this point.
        let (discount_minor, final_minor, discount_percent) = if method != booking.payment_method {
            pricing::reprice(booking.original_minor, &policy, method)
        } else {
            (
                booking.discount_minor,
                booking.final_minor,
                booking.discount_percent,
            )
        };

        let target = match method {
            PaymentMethod::Cash => BookingStatus::Confirmed,
            PaymentMethod::Online => BookingStatus::PendingPayment,
        };
        let clear_hold = method == PaymentMethod::Cash;
        let updated = sqlx::query_as::<_, Booking>(
            "UPDATE bookings
             SET status = $2, payment_method = $3, discount_minor = $4, final_minor = $5,
                 discount_percent = $6,
                 hold_expires_at = CASE WHEN $7 THEN NULL ELSE hold_expires_at END,
                 updated_at = $8
             WHERE id = $1
             RETURNING *",
        )
        .bind(booking.id)
        .bind(target)
        .bind(method)
        .bind(discount_minor)
        .bind(final_minor)
        .bind(discount_percent)
        .bind(clear_hold)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let reason = match method {
            PaymentMethod::Cash => "finalize:cash",
            PaymentMethod::Online => "finalize:online",
        };
        audit(
            &mut tx,
            updated.id,
            Some(BookingStatus::Reserved),
            target,
            Some(reason),
            &actor_label(&caller),
        )
        .await?;
        tx.commit().await?;

        match method {
            PaymentMethod::Cash => {
                tracing::info!(booking_id, "booking confirmed (cash)");
                self.events.publish(DomainEvent::BookingConfirmed {
                    booking_id: updated.id,
                    staff_id: updated.staff_id,
                    client_id: updated.client_id,
                    starts_at: updated.starts_at,
                    status: BookingStatus::Confirmed,
                    snapshot: updated.snapshot(),
                });
                Ok(FinalizeOutcome {
                    status: BookingStatus::Confirmed,
                    invoice_url: None,
                })
            }
            PaymentMethod::Online => {
                match self
                    .payments
                    .create_invoice(updated.id, updated.final_minor, &updated.currency)
                    .await
                {
                    Ok(invoice) => {
                        sqlx::query(
                            "UPDATE bookings SET invoice_ref = $2, invoice_url = $3, updated_at = $4
                             WHERE id = $1",
                        )
                        .bind(updated.id)
                        .bind(&invoice.invoice_ref)
                        .bind(&invoice.external_url)
                        .bind(Utc::now())
                        .execute(&self.db)
                        .await?;

                        self.events.publish(DomainEvent::InvoiceIssued {
                            booking_id: updated.id,
                            client_id: updated.client_id,
                            invoice_ref: invoice.invoice_ref,
                            invoice_url: invoice.external_url.clone(),
                            amount_minor: updated.final_minor,
                            currency: updated.currency.clone(),
                        });
                        Ok(FinalizeOutcome {
                            status: BookingStatus::PendingPayment,
                            invoice_url: Some(invoice.external_url),
                        })
                    }
                    Err(e) => {
                        tracing::error!(booking_id, error = %e, "invoice creation failed");
                        if let Err(cancel_err) = self
                            .cancel_by_system(updated.id, CancelReason::PaymentFailed)
                            .await
                        {
                            tracing::error!(
                                booking_id,
                                error = %cancel_err,
                                "failed to release booking after invoice failure"
                            );
                        }
                        Err(ApiError::PaymentInitFailed)
                    }
                }
            }
        }
    }

    // ── Payment settlement ──

    /// PENDING_PAYMENT → PAID on a verified payment. Idempotent: an
    /// already-paid booking returns `false`.
    pub async fn mark_paid(&self, booking_id: i64) -> Result<bool, ApiError> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        acquire_booking_lock(&mut tx, booking_id).await?;
        let booking = booking_for_update(&mut tx, booking_id).await?;

        if booking.status == BookingStatus::Paid {
            return Ok(false);
        }
        if booking.status != BookingStatus::PendingPayment {
            return Err(ApiError::IllegalTransition {
                from: booking.status,
            });
        }

        let updated = set_status(&mut tx, booking.id, BookingStatus::Paid, true, now).await?;
        audit(
            &mut tx,
            booking.id,
            Some(BookingStatus::PendingPayment),
            BookingStatus::Paid,
            Some("payment verified"),
            "system",
        )
        .await?;
        tx.commit().await?;

        tracing::info!(booking_id, "payment verified, booking paid");
        self.events.publish(DomainEvent::BookingConfirmed {
            booking_id: updated.id,
            staff_id: updated.staff_id,
            client_id: updated.client_id,
            starts_at: updated.starts_at,
            status: BookingStatus::Paid,
            snapshot: updated.snapshot(),
        });
        Ok(true)
    }

    /// Poll the payments port for a pending invoice and drive the booking
    /// to PAID or CANCELLED accordingly. Used by the reconciler.
    pub async fn reconcile(&self, booking_id: i64) -> Result<Option<PaymentState>, ApiError> {
        let invoice_ref: Option<String> = sqlx::query_scalar(
            "SELECT invoice_ref FROM bookings WHERE id = $1 AND status = 'pending_payment'",
        )
        .bind(booking_id)
        .fetch_optional(&self.db)
        .await?
        .flatten();
        let Some(invoice_ref) = invoice_ref else {
            return Ok(None);
        };

        let state = self
            .payments
            .verify_payment(&invoice_ref)
            .await
            .map_err(|e| {
                tracing::warn!(booking_id, error = %e, "payment verification failed");
                ApiError::PaymentVerificationFailed
            })?;

        match state {
            PaymentState::Paid => {
                self.mark_paid(booking_id).await?;
            }
            PaymentState::Failed | PaymentState::Cancelled => {
                self.cancel_by_system(booking_id, CancelReason::PaymentFailed)
                    .await?;
            }
            PaymentState::Pending => {}
        }
        Ok(Some(state))
    }

    // ── Reschedule ──

    /// Move a booking to a new start atomically, keeping bundle, staff,
    /// pricing and payment state. A reschedule to the current start is a
    /// data-level no-op.
    pub async fn reschedule(
        &self,
        booking_id: i64,
        new_start: DateTime<Utc>,
        caller: Caller,
    ) -> Result<Booking, ApiError> {
        let now = Utc::now();
        let policy = self.policy.current().await?;

        let mut tx = self.db.begin().await?;
        acquire_booking_lock(&mut tx, booking_id).await?;
        let booking = booking_for_update(&mut tx, booking_id).await?;
        check_ownership(&booking, &caller)?;

        if new_start == booking.starts_at {
            return Ok(booking);
        }
        policy.can_reschedule(now, &booking)?;

        let duration = booking.ends_at - booking.starts_at;
        let interval = Interval::new(new_start, new_start + duration);
        acquire_slot_locks(&mut tx, booking.staff_id, interval).await?;

        if staff_conflict(&mut tx, booking.staff_id, interval, Some(booking.id), now)
            .await?
            .is_some()
        {
            return Err(ApiError::SlotUnavailable);
        }
        if client_conflict(&mut tx, booking.client_id, interval, Some(booking.id), now).await? {
            return Err(ApiError::ClientBusy);
        }

        let updated = sqlx::query_as::<_, Booking>(
            "UPDATE bookings
             SET starts_at = $2, ends_at = $3, reschedule_count = reschedule_count + 1,
                 updated_at = $4
             WHERE id = $1
             RETURNING *",
        )
        .bind(booking.id)
        .bind(interval.start)
        .bind(interval.end)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_overlap_violation)?;

        audit(
            &mut tx,
            booking.id,
            Some(booking.status),
            booking.status,
            Some("reschedule"),
            &actor_label(&caller),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            booking_id,
            old_start = %booking.starts_at,
            new_start = %updated.starts_at,
            "booking rescheduled"
        );
        self.events.publish(DomainEvent::BookingRescheduled {
            booking_id: updated.id,
            staff_id: updated.staff_id,
            client_id: updated.client_id,
            old_start: booking.starts_at,
            new_start: updated.starts_at,
        });
        Ok(updated)
    }

    // ── Cancel ──

    pub async fn cancel(&self, booking_id: i64, caller: Caller) -> Result<Booking, ApiError> {
        let reason = if caller.is_privileged() {
            CancelReason::Admin
        } else {
            CancelReason::Client
        };
        self.do_cancel(booking_id, reason, Some(caller)).await
    }

    async fn cancel_by_system(
        &self,
        booking_id: i64,
        reason: CancelReason,
    ) -> Result<Booking, ApiError> {
        self.do_cancel(booking_id, reason, None).await
    }

    async fn do_cancel(
        &self,
        booking_id: i64,
        reason: CancelReason,
        enforce_policy_for: Option<Caller>,
    ) -> Result<Booking, ApiError> {
        let now = Utc::now();
        let policy = self.policy.current().await?;

        let mut tx = self.db.begin().await?;
        acquire_booking_lock(&mut tx, booking_id).await?;
        let booking = booking_for_update(&mut tx, booking_id).await?;

        let actor = match &enforce_policy_for {
            Some(caller) => {
                check_ownership(&booking, caller)?;
                policy.can_cancel(now, &booking, caller.role)?;
                actor_label(caller)
            }
            None => {
                if booking.status.is_terminal() {
                    // System retries (reconciler, invoice failure cleanup)
                    // land here; the booking is already settled.
                    return Ok(booking);
                }
                "system".to_string()
            }
        };

        let target = if reason == CancelReason::Expired {
            BookingStatus::Expired
        } else {
            BookingStatus::Cancelled
        };
        if !can_transition(booking.status, target) {
            return Err(ApiError::IllegalTransition {
                from: booking.status,
            });
        }

        let updated = set_status(&mut tx, booking.id, target, true, now).await?;
        audit(
            &mut tx,
            booking.id,
            Some(booking.status),
            target,
            Some(reason.as_str()),
            &actor,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(booking_id, reason = reason.as_str(), "booking cancelled");
        match reason {
            CancelReason::Expired => self.events.publish(DomainEvent::HoldExpired {
                booking_id: updated.id,
                staff_id: updated.staff_id,
                client_id: updated.client_id,
                starts_at: updated.starts_at,
            }),
            CancelReason::PaymentFailed => self.events.publish(DomainEvent::PaymentFailed {
                booking_id: updated.id,
                staff_id: updated.staff_id,
                client_id: updated.client_id,
                starts_at: updated.starts_at,
            }),
            _ => self.events.publish(DomainEvent::BookingCancelled {
                booking_id: updated.id,
                staff_id: updated.staff_id,
                client_id: updated.client_id,
                starts_at: updated.starts_at,
                reason,
                snapshot: updated.snapshot(),
            }),
        };
        Ok(updated)
    }

    /// Expire one overdue hold. Idempotent and safe across worker
    /// replicas: the per-booking lock serializes the transition, and a
    /// booking that moved on (finalized, cancelled, extended) is skipped.
    pub async fn expire_if_due(
        &self,
        booking_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, ApiError> {
        let mut tx = self.db.begin().await?;
        acquire_booking_lock(&mut tx, booking_id).await?;

        let booking = sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings WHERE id = $1 FOR UPDATE",
        )
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(booking) = booking else {
            return Ok(false);
        };
        if !booking.status.is_hold() || booking.blocks_slot(now) {
            return Ok(false);
        }

        let updated = set_status(&mut tx, booking.id, BookingStatus::Expired, true, now).await?;
        audit(
            &mut tx,
            booking.id,
            Some(booking.status),
            BookingStatus::Expired,
            Some("expired"),
            "system",
        )
        .await?;
        tx.commit().await?;

        tracing::info!(booking_id, "hold expired");
        self.events.publish(DomainEvent::HoldExpired {
            booking_id: updated.id,
            staff_id: updated.staff_id,
            client_id: updated.client_id,
            starts_at: updated.starts_at,
        });
        Ok(true)
    }

    // ── Terminal bookkeeping ──

    pub async fn mark_done(&self, booking_id: i64, caller: Caller) -> Result<Booking, ApiError> {
        self.close_out(booking_id, BookingStatus::Done, caller).await
    }

    pub async fn mark_no_show(&self, booking_id: i64, caller: Caller) -> Result<Booking, ApiError> {
        self.close_out(booking_id, BookingStatus::NoShow, caller).await
    }

    async fn close_out(
        &self,
        booking_id: i64,
        target: BookingStatus,
        caller: Caller,
    ) -> Result<Booking, ApiError> {
        if !caller.is_privileged() {
            return Err(ApiError::Forbidden);
        }
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        acquire_booking_lock(&mut tx, booking_id).await?;
        let booking = booking_for_update(&mut tx, booking_id).await?;

        if !can_transition(booking.status, target) {
            return Err(ApiError::IllegalTransition {
                from: booking.status,
            });
        }

        let updated = set_status(&mut tx, booking.id, target, false, now).await?;
        let reason = match target {
            BookingStatus::Done => "mark_done",
            _ => "mark_no_show",
        };
        audit(
            &mut tx,
            booking.id,
            Some(booking.status),
            target,
            Some(reason),
            &actor_label(&caller),
        )
        .await?;
        tx.commit().await?;

        let event = match target {
            BookingStatus::Done => DomainEvent::BookingDone {
                booking_id: updated.id,
                staff_id: updated.staff_id,
                client_id: updated.client_id,
            },
            _ => DomainEvent::BookingNoShow {
                booking_id: updated.id,
                staff_id: updated.staff_id,
                client_id: updated.client_id,
            },
        };
        self.events.publish(event);
        Ok(updated)
    }

    /// One-shot rating of a done booking. Submitting the same value again
    /// is a no-op; a different value is rejected.
    pub async fn rate(&self, booking_id: i64, caller: Caller, rating: i32) -> Result<(), ApiError> {
        if !(1..=5).contains(&rating) {
            return Err(ApiError::BadInput("rating must be between 1 and 5".into()));
        }

        let mut tx = self.db.begin().await?;
        acquire_booking_lock(&mut tx, booking_id).await?;
        let booking = booking_for_update(&mut tx, booking_id).await?;
        check_ownership(&booking, &caller)?;

        if booking.status != BookingStatus::Done {
            return Err(ApiError::IllegalTransition {
                from: booking.status,
            });
        }
        match booking.rating {
            Some(existing) if existing == rating => return Ok(()),
            Some(_) => return Err(ApiError::AlreadyRated),
            None => {}
        }

        sqlx::query("UPDATE bookings SET rating = $2, updated_at = $3 WHERE id = $1")
            .bind(booking.id)
            .bind(rating)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        audit(
            &mut tx,
            booking.id,
            Some(BookingStatus::Done),
            BookingStatus::Done,
            Some("rate"),
            &actor_label(&caller),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

// ── Lock protocol ──

/// Advisory-lock keys for a proposed interval: every hour bucket the
/// interval touches, keyed by staff. Locks are taken in ascending bucket
/// order so concurrent writers cannot deadlock.
fn slot_lock_keys(staff_id: i64, interval: Interval) -> Vec<(i32, i32)> {
    let k1 = staff_id.rem_euclid(i32::MAX as i64) as i32;
    let first = interval.start.timestamp().div_euclid(BUCKET_SECONDS);
    let last = (interval.end.timestamp() - 1).div_euclid(BUCKET_SECONDS);
    (first..=last)
        .map(|bucket| (k1, bucket.rem_euclid(i32::MAX as i64) as i32))
        .collect()
}

async fn acquire_slot_locks(
    tx: &mut Tx<'_>,
    staff_id: i64,
    interval: Interval,
) -> Result<(), ApiError> {
    for (k1, k2) in slot_lock_keys(staff_id, interval) {
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(k1)
            .bind(k2)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn acquire_booking_lock(tx: &mut Tx<'_>, booking_id: i64) -> Result<(), ApiError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(BOOKING_LOCK_NS)
        .bind(booking_id.rem_euclid(i32::MAX as i64) as i32)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ── Transaction helpers ──

async fn booking_for_update(tx: &mut Tx<'_>, booking_id: i64) -> Result<Booking, ApiError> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1 FOR UPDATE")
        .bind(booking_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ApiError::NotFound("booking"))
}

/// Occupied-interval probe inside the write transaction: any booking on
/// this staff whose `[start, end)` intersects the proposal and still
/// blocks the slot.
async fn staff_conflict(
    tx: &mut Tx<'_>,
    staff_id: i64,
    interval: Interval,
    exclude_booking: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Option<Interval>, ApiError> {
    let row = sqlx::query_as::<_, (DateTime<Utc>, DateTime<Utc>)>(
        "SELECT starts_at, ends_at FROM bookings
         WHERE staff_id = $1 AND starts_at < $2 AND ends_at > $3 AND id <> $4
           AND (status IN ('confirmed', 'paid', 'done')
                OR (status IN ('reserved', 'pending_payment') AND hold_expires_at > $5))
         ORDER BY starts_at
         LIMIT 1",
    )
    .bind(staff_id)
    .bind(interval.end)
    .bind(interval.start)
    .bind(exclude_booking.unwrap_or(-1))
    .bind(now)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|(start, end)| Interval::new(start, end)))
}

/// A client may not hold two overlapping active bookings, regardless of
/// staff.
async fn client_conflict(
    tx: &mut Tx<'_>,
    client_id: i64,
    interval: Interval,
    exclude_booking: Option<i64>,
    now: DateTime<Utc>,
) -> Result<bool, ApiError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (
             SELECT 1 FROM bookings
             WHERE client_id = $1 AND starts_at < $2 AND ends_at > $3 AND id <> $4
               AND (status IN ('confirmed', 'paid', 'done')
                    OR (status IN ('reserved', 'pending_payment') AND hold_expires_at > $5))
         )",
    )
    .bind(client_id)
    .bind(interval.end)
    .bind(interval.start)
    .bind(exclude_booking.unwrap_or(-1))
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(exists)
}

async fn set_status(
    tx: &mut Tx<'_>,
    booking_id: i64,
    status: BookingStatus,
    clear_hold: bool,
    now: DateTime<Utc>,
) -> Result<Booking, ApiError> {
    let booking = sqlx::query_as::<_, Booking>(
        "UPDATE bookings
         SET status = $2,
             hold_expires_at = CASE WHEN $3 THEN NULL ELSE hold_expires_at END,
             updated_at = $4
         WHERE id = $1
         RETURNING *",
    )
    .bind(booking_id)
    .bind(status)
    .bind(clear_hold)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(booking)
}

async fn audit(
    tx: &mut Tx<'_>,
    booking_id: i64,
    from: Option<BookingStatus>,
    to: BookingStatus,
    reason: Option<&str>,
    actor: &str,
) -> Result<(), ApiError> {
    sqlx::query(
        "INSERT INTO booking_events (booking_id, from_status, to_status, reason, actor)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(booking_id)
    .bind(from)
    .bind(to)
    .bind(reason)
    .bind(actor)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn check_ownership(booking: &Booking, caller: &Caller) -> Result<(), ApiError> {
    if caller.role == Role::Client && booking.client_id != caller.subject {
        // Do not reveal foreign bookings.
        return Err(ApiError::NotFound("booking"));
    }
    Ok(())
}

fn actor_label(caller: &Caller) -> String {
    format!("{}:{}", caller.role.as_str(), caller.subject)
}

/// The exclusion constraint is defense in depth behind the advisory
/// locks; a violation still surfaces as the domain conflict.
fn map_overlap_violation(e: sqlx::Error) -> ApiError {
    if let sqlx::Error::Database(db) = &e {
        if db.constraint() == Some("bookings_no_staff_overlap") {
            return ApiError::SlotUnavailable;
        }
    }
    ApiError::Store(e)
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
    fn test_single_bucket_within_hour() {
        let keys = slot_lock_keys(7, Interval::new(at(11, 0), at(11, 45)));
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_exact_hour_stays_in_one_bucket() {
        // [11:00, 12:00) must not touch the 12:00 bucket
        let keys = slot_lock_keys(7, Interval::new(at(11, 0), at(12, 0)));
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_interval_spanning_hours_locks_all_buckets() {
        let keys = slot_lock_keys(7, Interval::new(at(11, 30), at(13, 15)));
        assert_eq!(keys.len(), 3);
        assert!(keys.windows(2).all(|w| w[0].1 < w[1].1), "ascending order");
    }

    #[test]
    fn test_overlapping_intervals_share_a_bucket() {
        let a = slot_lock_keys(7, Interval::new(at(11, 30), at(12, 30)));
        let b = slot_lock_keys(7, Interval::new(at(12, 15), at(13, 0)));
        assert!(a.iter().any(|k| b.contains(k)));
    }

    #[test]
    fn test_different_staff_use_disjoint_keys() {
        let a = slot_lock_keys(1, Interval::new(at(11, 0), at(12, 0)));
        let b = slot_lock_keys(2, Interval::new(at(11, 0), at(12, 0)));
        assert!(a.iter().all(|k| !b.contains(k)));
    }

    #[test]
    fn test_booking_lock_namespace_distinct_from_staff_ids() {
        // Staff ids are small positive integers; the namespace constant
        // must not collide with plausible ones.
        assert!(BOOKING_LOCK_NS > 2500);
    }
}
