use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::events::{CancelReason, DomainEvent, EventBus};

/// Who receives a message. Client subjects double as chat ids; the mapping
/// to an actual delivery channel is the adapter's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Client(i64),
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    BookingHeldAdmin,
    BookingConfirmedAdmin,
    BookingCancelledAdmin,
    BookingCancelledClient,
    HoldExpiredClient,
    PaymentFailedClient,
    ReminderClient,
}

impl Template {
    /// Render the message body from the context assembled by the event
    /// bridge. Missing fields degrade to "?" rather than dropping the
    /// notification.
    pub fn render(self, ctx: &serde_json::Value) -> String {
        let date = ctx["date"].as_str().unwrap_or("?");
        let time = ctx["time"].as_str().unwrap_or("?");
        let booking_id = ctx["booking_id"].as_i64().unwrap_or(0);
        match self {
            Self::BookingHeldAdmin => format!(
                "⏳ Новая бронь №{booking_id}\n📅 {date} в {time}\nОжидает подтверждения"
            ),
            Self::BookingConfirmedAdmin => format!(
                "📋 Запись №{booking_id} подтверждена\n📅 {date} в {time}"
            ),
            Self::BookingCancelledAdmin => format!(
                "❌ Отмена записи №{booking_id}\n📅 {date} в {time}"
            ),
            Self::BookingCancelledClient => format!(
                "😔 Ваша запись на {date} в {time} была отменена мастером."
            ),
            Self::HoldExpiredClient => format!(
                "⌛ Бронь №{booking_id} на {date} в {time} истекла. Выберите время заново."
            ),
            Self::PaymentFailedClient => format!(
                "💳 Оплата записи №{booking_id} не прошла, запись отменена."
            ),
            Self::ReminderClient => format!(
                "🔔 Напоминание: запись {date} в {time}."
            ),
        }
    }
}

/// Fire-and-forget notification port. Implementations must deduplicate by
/// idempotency key: workers and the event bus may deliver more than once.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        audience: Audience,
        template: Template,
        ctx: serde_json::Value,
        idempotency_key: &str,
    ) -> anyhow::Result<()>;
}

// ── Telegram adapter ──

const DEDUP_TTL: Duration = Duration::from_secs(24 * 3600);
const DEDUP_PRUNE_LEN: usize = 4096;

pub struct TelegramNotifier {
    http: reqwest::Client,
    bot_token: String,
    admin_chat_id: i64,
    seen: DashMap<String, Instant>,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, admin_chat_id: i64) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            admin_chat_id,
            seen: DashMap::new(),
        }
    }

    /// First sighting of the key wins; repeats within the TTL are dropped.
    fn first_sighting(&self, key: &str) -> bool {
        if self.seen.len() > DEDUP_PRUNE_LEN {
            let now = Instant::now();
            self.seen
                .retain(|_, at| now.duration_since(*at) < DEDUP_TTL);
        }
        match self.seen.entry(key.to_string()) {
            dashmap::Entry::Occupied(mut e) => {
                if e.get().elapsed() < DEDUP_TTL {
                    false
                } else {
                    *e.get_mut() = Instant::now();
                    true
                }
            }
            dashmap::Entry::Vacant(e) => {
                e.insert(Instant::now());
                true
            }
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(
        &self,
        audience: Audience,
        template: Template,
        ctx: serde_json::Value,
        idempotency_key: &str,
    ) -> anyhow::Result<()> {
        if !self.first_sighting(idempotency_key) {
            tracing::debug!(idempotency_key, "duplicate notification suppressed");
            return Ok(());
        }

        let chat_id = match audience {
            Audience::Client(id) => id,
            Audience::Admin => self.admin_chat_id,
        };
        let text = template.render(&ctx);

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML"
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("notifier delivery failed: {}", resp.status());
        }
        Ok(())
    }
}

/// No-op adapter used when no delivery channel is configured; keeps the
/// rest of the system oblivious.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(
        &self,
        audience: Audience,
        template: Template,
        _ctx: serde_json::Value,
        idempotency_key: &str,
    ) -> anyhow::Result<()> {
        tracing::debug!(?audience, ?template, idempotency_key, "notification dropped (no channel)");
        Ok(())
    }
}

// ── Bounded fire-and-forget queue ──

struct Job {
    audience: Audience,
    template: Template,
    ctx: serde_json::Value,
    key: String,
}

#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::Sender<Job>,
}

impl NotifierHandle {
    /// Enqueue without waiting. A full queue drops the message with a
    /// warning: notifications are best-effort by contract.
    pub fn dispatch(
        &self,
        audience: Audience,
        template: Template,
        ctx: serde_json::Value,
        key: String,
    ) {
        let job = Job {
            audience,
            template,
            ctx,
            key,
        };
        if self.tx.try_send(job).is_err() {
            tracing::warn!(
                error = %crate::error::ApiError::NotifierUnavailable,
                "notifier queue full, message dropped"
            );
        }
    }
}

pub fn spawn_notifier(notifier: Arc<dyn Notifier>) -> NotifierHandle {
    let (tx, mut rx) = mpsc::channel::<Job>(256);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if let Err(e) = notifier
                .send(job.audience, job.template, job.ctx, &job.key)
                .await
            {
                tracing::error!(key = %job.key, error = %e, "notification failed");
            }
        }
    });
    NotifierHandle { tx }
}

// ── Event bridge ──

/// Subscribes to the domain event stream and turns lifecycle events into
/// notifications: admin digests for new/confirmed/cancelled bookings, a
/// one-shot client notice on expiry, payment failure and admin
/// cancellation, and the due reminders.
pub fn spawn_event_bridge(bus: &EventBus, handle: NotifierHandle, tz: Tz) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let envelope = match rx.recv().await {
                Ok(envelope) => envelope,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "notification bridge lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            match envelope.event {
                DomainEvent::BookingHeld {
                    booking_id,
                    starts_at,
                    ..
                } => {
                    handle.dispatch(
                        Audience::Admin,
                        Template::BookingHeldAdmin,
                        local_ctx(booking_id, starts_at, tz),
                        format!("held:{booking_id}"),
                    );
                }
                DomainEvent::BookingConfirmed {
                    booking_id,
                    starts_at,
                    ..
                } => {
                    handle.dispatch(
                        Audience::Admin,
                        Template::BookingConfirmedAdmin,
                        local_ctx(booking_id, starts_at, tz),
                        format!("confirmed:{booking_id}"),
                    );
                }
                DomainEvent::BookingCancelled {
                    booking_id,
                    client_id,
                    starts_at,
                    reason,
                    ..
                } => {
                    handle.dispatch(
                        Audience::Admin,
                        Template::BookingCancelledAdmin,
                        local_ctx(booking_id, starts_at, tz),
                        format!("cancelled:{booking_id}"),
                    );
                    if reason == CancelReason::Admin {
                        handle.dispatch(
                            Audience::Client(client_id),
                            Template::BookingCancelledClient,
                            local_ctx(booking_id, starts_at, tz),
                            format!("cancelled-client:{booking_id}"),
                        );
                    }
                }
                DomainEvent::HoldExpired {
                    booking_id,
                    client_id,
                    starts_at,
                    ..
                } => {
                    handle.dispatch(
                        Audience::Client(client_id),
                        Template::HoldExpiredClient,
                        local_ctx(booking_id, starts_at, tz),
                        format!("expired:{booking_id}"),
                    );
                }
                DomainEvent::PaymentFailed {
                    booking_id,
                    client_id,
                    starts_at,
                    ..
                } => {
                    handle.dispatch(
                        Audience::Client(client_id),
                        Template::PaymentFailedClient,
                        local_ctx(booking_id, starts_at, tz),
                        format!("payment-failed:{booking_id}"),
                    );
                }
                DomainEvent::ReminderDue {
                    booking_id,
                    client_id,
                    starts_at,
                    idempotency_key,
                    ..
                } => {
                    handle.dispatch(
                        Audience::Client(client_id),
                        Template::ReminderClient,
                        local_ctx(booking_id, starts_at, tz),
                        idempotency_key,
                    );
                }
                _ => {}
            }
        }
    });
}

fn local_ctx(booking_id: i64, starts_at: DateTime<Utc>, tz: Tz) -> serde_json::Value {
    let local = starts_at.with_timezone(&tz);
    serde_json::json!({
        "booking_id": booking_id,
        "date": local.format("%d.%m.%Y").to_string(),
        "time": local.format("%H:%M").to_string(),
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_suppresses_repeats() {
        let notifier = TelegramNotifier::new("token".into(), 1);
        assert!(notifier.first_sighting("reminder:1:60"));
        assert!(!notifier.first_sighting("reminder:1:60"));
        assert!(notifier.first_sighting("reminder:1:1440"));
        assert!(notifier.first_sighting("reminder:2:60"));
    }

    #[test]
    fn test_render_falls_back_on_missing_fields() {
        let text = Template::ReminderClient.render(&serde_json::json!({}));
        assert!(text.contains('?'));
    }

    #[test]
    fn test_render_reminder_contains_local_time() {
        let tz: Tz = "Europe/Kyiv".parse().unwrap();
        let starts_at = "2026-06-10T06:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let ctx = local_ctx(7, starts_at, tz);
        let text = Template::ReminderClient.render(&ctx);
        assert!(text.contains("10.06.2026"));
        assert!(text.contains("09:00"));
    }

    #[tokio::test]
    async fn test_queue_delivers_to_notifier() {
        struct Probe(tokio::sync::mpsc::Sender<String>);

        #[async_trait]
        impl Notifier for Probe {
            async fn send(
                &self,
                _audience: Audience,
                _template: Template,
                _ctx: serde_json::Value,
                idempotency_key: &str,
            ) -> anyhow::Result<()> {
                self.0.send(idempotency_key.to_string()).await.ok();
                Ok(())
            }
        }

        let (probe_tx, mut probe_rx) = tokio::sync::mpsc::channel(4);
        let handle = spawn_notifier(Arc::new(Probe(probe_tx)));
        handle.dispatch(
            Audience::Admin,
            Template::BookingHeldAdmin,
            serde_json::json!({}),
            "job-1".into(),
        );
        assert_eq!(probe_rx.recv().await.unwrap(), "job-1");
    }
}
