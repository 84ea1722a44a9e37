mod auth;
mod availability;
mod booking;
mod catalog;
mod config;
mod db;
mod error;
mod events;
mod handlers;
mod models;
mod notifier;
mod payments;
mod policy;
mod pricing;
mod rate_limit;
mod workers;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing_subscriber::EnvFilter;

use crate::availability::AvailabilityEngine;
use crate::booking::BookingStateMachine;
use crate::catalog::Catalog;
use crate::config::Settings;
use crate::events::EventBus;
use crate::notifier::{NullNotifier, Notifier, TelegramNotifier};
use crate::payments::YooKassaProvider;
use crate::policy::{Policy, PolicyStore};
use crate::rate_limit::{RateLimiter, TierConfig};
use crate::workers::WorkerConfig;

pub struct AppState {
    pub db: sqlx::PgPool,
    pub settings: Settings,
    pub catalog: Arc<Catalog>,
    pub policy: Arc<PolicyStore>,
    pub availability: Arc<AvailabilityEngine>,
    pub machine: Arc<BookingStateMachine>,
    pub events: EventBus,
    pub started_at: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let settings = Settings::from_env()?;
    if settings.yookassa_shop_id.is_empty() {
        tracing::warn!("YOOKASSA_SHOP_ID not set, online payments will fail");
    }

    let pool = db::connect(&settings.database_url).await?;
    db::run_migrations(&pool).await?;

    let cache_ttl = Duration::from_secs(settings.settings_cache_ttl_seconds);
    let catalog = Arc::new(Catalog::new(pool.clone(), cache_ttl));
    let policy = Arc::new(PolicyStore::new(
        pool.clone(),
        Policy::from_settings(&settings),
        cache_ttl,
    ));
    policy.seed().await?;

    let events = EventBus::new(256);
    let availability = Arc::new(AvailabilityEngine::new(
        pool.clone(),
        catalog.clone(),
        policy.clone(),
        settings.business_timezone,
        settings.slot_grid_minutes,
    ));
    let payments = Arc::new(YooKassaProvider::new(
        settings.yookassa_shop_id.clone(),
        settings.yookassa_secret_key.clone(),
        settings.payment_return_url.clone(),
    ));
    let machine = Arc::new(BookingStateMachine::new(
        pool.clone(),
        catalog.clone(),
        policy.clone(),
        availability.clone(),
        payments,
        events.clone(),
        settings.currency.clone(),
    ));

    // Notification pipeline: domain events → bounded queue → channel adapter.
    let channel: Arc<dyn Notifier> = if settings.bot_token.is_empty() {
        tracing::warn!("BOT_TOKEN not set, notifications disabled");
        Arc::new(NullNotifier)
    } else {
        Arc::new(TelegramNotifier::new(
            settings.bot_token.clone(),
            settings.admin_chat_id,
        ))
    };
    let notifier_handle = notifier::spawn_notifier(channel);
    notifier::spawn_event_bridge(&events, notifier_handle, settings.business_timezone);

    workers::spawn_workers(
        pool.clone(),
        machine.clone(),
        events.clone(),
        WorkerConfig {
            expire_interval: Duration::from_secs(settings.expire_check_seconds),
            reminders_interval: Duration::from_secs(settings.reminders_check_seconds),
            reconcile_interval: Duration::from_secs(settings.reconcile_check_seconds),
            reconcile_grace: chrono::Duration::seconds(settings.reconcile_grace_seconds),
            reminder_leads: settings.reminder_leads(),
            batch_size: settings.worker_batch_size,
        },
    );

    let limiter = RateLimiter::new();
    limiter.add_tier(
        "public",
        TierConfig {
            max_requests: 60,
            window: Duration::from_secs(60),
        },
    );
    limiter.add_tier(
        "booking",
        TierConfig {
            max_requests: 10,
            window: Duration::from_secs(300),
        },
    );
    limiter.add_tier(
        "admin",
        TierConfig {
            max_requests: 120,
            window: Duration::from_secs(60),
        },
    );
    {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                limiter.cleanup();
            }
        });
    }

    let state = Arc::new(AppState {
        db: pool,
        settings: settings.clone(),
        catalog,
        policy,
        availability,
        machine,
        events,
        started_at: Instant::now(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let public = Router::new()
        .route("/api/services", get(handlers::client::list_services))
        .route("/api/staff", get(handlers::client::list_staff))
        .route("/api/availability/days", get(handlers::client::available_days))
        .route("/api/availability/slots", get(handlers::client::slots))
        .route("/api/quote", post(handlers::client::quote))
        .route("/api/slots/check", post(handlers::client::check_slot))
        .route_layer(middleware::from_fn_with_state(
            limiter.clone(),
            rate_limit::limit_public,
        ));

    let bookings = Router::new()
        .route("/api/bookings", post(handlers::client::create_hold))
        .route("/api/bookings/my", get(handlers::client::my_bookings))
        .route("/api/bookings/{id}", delete(handlers::client::cancel))
        .route("/api/bookings/{id}/finalize", post(handlers::client::finalize))
        .route("/api/bookings/{id}/reschedule", post(handlers::client::reschedule))
        .route("/api/bookings/{id}/rate", post(handlers::client::rate))
        .route_layer(middleware::from_fn_with_state(
            limiter.clone(),
            rate_limit::limit_booking,
        ));

    let admin = Router::new()
        .route("/api/admin/bookings", get(handlers::admin::list_bookings))
        .route("/api/admin/bookings/{id}/done", post(handlers::admin::mark_done))
        .route("/api/admin/bookings/{id}/no-show", post(handlers::admin::mark_no_show))
        .route("/api/admin/bookings/{id}/cancel", post(handlers::admin::cancel_booking))
        .route("/api/admin/catalog/invalidate", post(handlers::admin::invalidate_catalog))
        .route_layer(middleware::from_fn_with_state(
            limiter.clone(),
            rate_limit::limit_admin,
        ));

    let app = Router::new()
        .route("/api/health", get(handlers::health::health))
        .merge(public)
        .merge(bookings)
        .merge(admin)
        .layer(TimeoutLayer::new(Duration::from_secs(
            settings.request_timeout_seconds,
        )))
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    tracing::info!("booking server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
