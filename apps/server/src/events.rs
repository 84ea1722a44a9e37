use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::models::{BookingStatus, PricingSnapshot};

/// Why a booking left the active set. Carried on cancellation events and
/// in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Client,
    Admin,
    Expired,
    PaymentFailed,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Admin => "admin",
            Self::Expired => "expired",
            Self::PaymentFailed => "payment_failed",
        }
    }
}

/// Typed domain events published by the state machine and the workers,
/// always after the originating transaction committed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    BookingHeld {
        booking_id: i64,
        staff_id: i64,
        client_id: i64,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        hold_expires_at: DateTime<Utc>,
        snapshot: PricingSnapshot,
    },
    BookingConfirmed {
        booking_id: i64,
        staff_id: i64,
        client_id: i64,
        starts_at: DateTime<Utc>,
        status: BookingStatus,
        snapshot: PricingSnapshot,
    },
    InvoiceIssued {
        booking_id: i64,
        client_id: i64,
        invoice_ref: String,
        invoice_url: String,
        amount_minor: i64,
        currency: String,
    },
    PaymentFailed {
        booking_id: i64,
        staff_id: i64,
        client_id: i64,
        starts_at: DateTime<Utc>,
    },
    BookingRescheduled {
        booking_id: i64,
        staff_id: i64,
        client_id: i64,
        old_start: DateTime<Utc>,
        new_start: DateTime<Utc>,
    },
    BookingCancelled {
        booking_id: i64,
        staff_id: i64,
        client_id: i64,
        starts_at: DateTime<Utc>,
        reason: CancelReason,
        snapshot: PricingSnapshot,
    },
    HoldExpired {
        booking_id: i64,
        staff_id: i64,
        client_id: i64,
        starts_at: DateTime<Utc>,
    },
    BookingDone {
        booking_id: i64,
        staff_id: i64,
        client_id: i64,
    },
    BookingNoShow {
        booking_id: i64,
        staff_id: i64,
        client_id: i64,
    },
    ReminderDue {
        booking_id: i64,
        staff_id: i64,
        client_id: i64,
        starts_at: DateTime<Utc>,
        lead_minutes: i64,
        idempotency_key: String,
    },
    CatalogInvalidated,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub correlation_id: u64,
    pub occurred_at: DateTime<Utc>,
    pub event: DomainEvent,
}

/// In-process typed fan-out over a broadcast channel. Delivery is
/// at-least-once within the process; subscribers must be idempotent and
/// tolerate lag (a lagging receiver drops the oldest events, not the bus).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event; correlation ids are monotonic in publish order.
    pub fn publish(&self, event: DomainEvent) -> u64 {
        let correlation_id = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = EventEnvelope {
            correlation_id,
            occurred_at: Utc::now(),
            event,
        };
        tracing::debug!(correlation_id, event = ?envelope.event, "event published");
        // No receivers is fine: events are observational.
        let _ = self.tx.send(envelope);
        correlation_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_event(id: i64) -> DomainEvent {
        DomainEvent::BookingDone {
            booking_id: id,
            staff_id: 1,
            client_id: 100,
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(dummy_event(1));
        bus.publish(dummy_event(2));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first.event, DomainEvent::BookingDone { booking_id: 1, .. }));
        assert!(matches!(second.event, DomainEvent::BookingDone { booking_id: 2, .. }));
    }

    #[tokio::test]
    async fn test_correlation_ids_monotonic() {
        let bus = EventBus::new(16);
        let a = bus.publish(dummy_event(1));
        let b = bus.publish(dummy_event(2));
        let c = bus.publish(dummy_event(3));
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(dummy_event(1)), 1);
    }

    #[tokio::test]
    async fn test_two_subscribers_both_receive() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(dummy_event(5));
        assert!(matches!(
            rx1.recv().await.unwrap().event,
            DomainEvent::BookingDone { booking_id: 5, .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap().event,
            DomainEvent::BookingDone { booking_id: 5, .. }
        ));
    }

    #[test]
    fn test_cancel_reason_labels() {
        assert_eq!(CancelReason::Client.as_str(), "client");
        assert_eq!(CancelReason::PaymentFailed.as_str(), "payment_failed");
    }
}
