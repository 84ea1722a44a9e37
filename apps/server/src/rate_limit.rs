use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::ApiResponse;

// ── Configuration ──

#[derive(Debug, Clone, Copy)]
pub struct TierConfig {
    /// Maximum requests allowed within the sliding window.
    pub max_requests: usize,
    /// Duration of the sliding window.
    pub window: Duration,
}

struct Tier {
    config: TierConfig,
    hits: DashMap<IpAddr, VecDeque<Instant>>,
}

impl Tier {
    fn check(&self, ip: IpAddr, now: Instant) -> Result<(), u64> {
        let mut entry = self.hits.entry(ip).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= self.config.window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if entry.len() >= self.config.max_requests {
            let oldest = entry.front().copied().unwrap_or(now);
            let retry_after = (oldest + self.config.window)
                .saturating_duration_since(now)
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        entry.push_back(now);
        Ok(())
    }
}

// ── Core rate limiter ──

/// In-memory per-IP limiter with named tiers and sliding windows.
#[derive(Clone)]
pub struct RateLimiter {
    tiers: Arc<DashMap<&'static str, Tier>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            tiers: Arc::new(DashMap::new()),
        }
    }

    pub fn add_tier(&self, name: &'static str, config: TierConfig) {
        self.tiers.insert(
            name,
            Tier {
                config,
                hits: DashMap::new(),
            },
        );
    }

    /// Returns `Err(retry_after_secs)` when the tier budget is exhausted.
    pub fn check(&self, tier: &'static str, ip: IpAddr) -> Result<(), u64> {
        match self.tiers.get(tier) {
            Some(t) => t.check(ip, Instant::now()),
            None => Ok(()),
        }
    }

    /// Drop IPs whose newest hit is older than twice the tier window.
    /// Called periodically from a background task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        for tier in self.tiers.iter() {
            let cutoff = tier.config.window * 2;
            tier.hits.retain(|_ip, hits| {
                hits.back()
                    .is_some_and(|last| now.duration_since(*last) < cutoff)
            });
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// ── IP extraction ──

/// Client IP from X-Forwarded-For (reverse proxy) or the socket address.
fn client_ip(req: &Request) -> IpAddr {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

fn too_many_requests(retry_after: u64) -> Response {
    let body = ApiResponse::<()>::failure(
        "RateLimited",
        format!("Too many requests. Try again in {} seconds", retry_after),
    );
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_after.to_string())],
        Json(body),
    )
        .into_response()
}

// ── Middleware (one per tier) ──

/// Read-only availability/catalog endpoints (60 req/min).
pub async fn limit_public(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    limiter
        .check("public", client_ip(&req))
        .map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

/// Booking mutations (strictest: 10 req/5min).
pub async fn limit_booking(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    limiter
        .check("booking", client_ip(&req))
        .map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

/// Admin endpoints (120 req/min).
pub async fn limit_admin(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    limiter
        .check("admin", client_ip(&req))
        .map_err(too_many_requests)?;
    Ok(next.run(req).await)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread::sleep;

    fn test_ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn limiter(max: usize, window: Duration) -> RateLimiter {
        let limiter = RateLimiter::new();
        limiter.add_tier(
            "test",
            TierConfig {
                max_requests: max,
                window,
            },
        );
        limiter
    }

    #[test]
    fn test_allows_under_limit() {
        let limiter = limiter(3, Duration::from_secs(60));
        let ip = test_ip(1);
        assert!(limiter.check("test", ip).is_ok());
        assert!(limiter.check("test", ip).is_ok());
        assert!(limiter.check("test", ip).is_ok());
    }

    #[test]
    fn test_rejects_over_limit() {
        let limiter = limiter(2, Duration::from_secs(60));
        let ip = test_ip(1);
        assert!(limiter.check("test", ip).is_ok());
        assert!(limiter.check("test", ip).is_ok());
        assert!(limiter.check("test", ip).is_err());
    }

    #[test]
    fn test_retry_after_bounded_by_window() {
        let limiter = limiter(1, Duration::from_secs(60));
        let ip = test_ip(1);
        limiter.check("test", ip).unwrap();
        let retry_after = limiter.check("test", ip).unwrap_err();
        assert!((1..=60).contains(&retry_after));
    }

    #[test]
    fn test_ips_are_independent() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.check("test", test_ip(1)).is_ok());
        assert!(limiter.check("test", test_ip(1)).is_err());
        assert!(limiter.check("test", test_ip(2)).is_ok());
    }

    #[test]
    fn test_unknown_tier_is_open() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("missing", test_ip(1)).is_ok());
    }

    #[test]
    fn test_window_expiry_allows_again() {
        let limiter = limiter(1, Duration::from_millis(80));
        let ip = test_ip(1);
        assert!(limiter.check("test", ip).is_ok());
        assert!(limiter.check("test", ip).is_err());

        sleep(Duration::from_millis(120));

        assert!(limiter.check("test", ip).is_ok());
    }

    #[test]
    fn test_cleanup_drops_stale_ips() {
        let limiter = limiter(10, Duration::from_millis(40));
        let ip = test_ip(1);
        limiter.check("test", ip).unwrap();

        sleep(Duration::from_millis(100));
        limiter.cleanup();

        let tier = limiter.tiers.get("test").unwrap();
        assert!(tier.hits.is_empty());
    }

    #[test]
    fn test_cleanup_keeps_active_ips() {
        let limiter = limiter(2, Duration::from_secs(60));
        let ip = test_ip(1);
        limiter.check("test", ip).unwrap();

        limiter.cleanup();

        limiter.check("test", ip).unwrap();
        assert!(limiter.check("test", ip).is_err());
    }
}
