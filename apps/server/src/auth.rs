use axum::http::{header, HeaderMap};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

/// Caller roles. Staff and admin may bypass client-side policy locks;
/// admin additionally unlocks the admin endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Staff,
    Admin,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "client" => Some(Self::Client),
            "staff" => Some(Self::Staff),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Staff => "staff",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub subject: i64,
    pub role: Role,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Staff | Role::Admin)
    }
}

/// Validates a signed caller token issued by the identity layer.
///
/// Token format: `v1.<subject>.<role>.<expiry_unix>.<hex sig>` where the
/// signature is HMAC-SHA256 over `v1.<subject>.<role>.<expiry_unix>`.
pub fn verify_token(token: &str, secret: &str, now_unix: i64) -> Option<Caller> {
    let mut parts = token.split('.');
    let version = parts.next()?;
    if version != "v1" {
        return None;
    }
    let subject_raw = parts.next()?;
    let role_raw = parts.next()?;
    let expiry_raw = parts.next()?;
    let sig_hex = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let subject: i64 = subject_raw.parse().ok()?;
    let role = Role::parse(role_raw)?;
    let expiry: i64 = expiry_raw.parse().ok()?;

    if expiry <= now_unix {
        tracing::warn!(subject, "caller token expired");
        return None;
    }

    let payload = format!("v1.{}.{}.{}", subject_raw, role_raw, expiry_raw);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());

    let sig = hex::decode(sig_hex).ok()?;
    if mac.verify_slice(&sig).is_err() {
        tracing::warn!(subject, "caller token signature mismatch");
        return None;
    }

    Some(Caller { subject, role })
}

/// Produce a signed token. The identity layer mints these out of process;
/// kept here so tokens can be issued from ops tooling and tests.
#[allow(dead_code)]
pub fn sign_token(subject: i64, role: Role, expiry_unix: i64, secret: &str) -> String {
    let payload = format!("v1.{}.{}.{}", subject, role.as_str(), expiry_unix);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());
    format!("{}.{}", payload, sig)
}

/// Extract and verify the caller from the Authorization header.
/// Header format: `Bearer <token>`.
pub fn require_caller(headers: &HeaderMap, secret: &str) -> Result<Caller, ApiError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let token = raw.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;
    verify_token(token, secret, chrono::Utc::now().timestamp()).ok_or(ApiError::Unauthorized)
}

pub fn require_admin(headers: &HeaderMap, secret: &str) -> Result<Caller, ApiError> {
    let caller = require_caller(headers, secret)?;
    if !caller.is_admin() {
        return Err(ApiError::Forbidden);
    }
    Ok(caller)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_round_trip() {
        let token = sign_token(42, Role::Client, 2_000_000_000, SECRET);
        let caller = verify_token(&token, SECRET, 1_000_000_000).unwrap();
        assert_eq!(caller.subject, 42);
        assert_eq!(caller.role, Role::Client);
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = sign_token(42, Role::Client, 1_000, SECRET);
        assert!(verify_token(&token, SECRET, 2_000).is_none());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = sign_token(42, Role::Client, 2_000_000_000, SECRET);
        assert!(verify_token(&token, "other-secret", 0).is_none());
    }

    #[test]
    fn test_tampered_subject_rejected() {
        let token = sign_token(42, Role::Client, 2_000_000_000, SECRET);
        let forged = token.replacen("v1.42.", "v1.43.", 1);
        assert!(verify_token(&forged, SECRET, 0).is_none());
    }

    #[test]
    fn test_tampered_role_rejected() {
        let token = sign_token(42, Role::Client, 2_000_000_000, SECRET);
        let forged = token.replacen(".client.", ".admin.", 1);
        assert!(verify_token(&forged, SECRET, 0).is_none());
    }

    #[test]
    fn test_admin_role_parses() {
        let token = sign_token(7, Role::Admin, 2_000_000_000, SECRET);
        let caller = verify_token(&token, SECRET, 0).unwrap();
        assert!(caller.is_admin());
        assert!(caller.is_privileged());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(verify_token("", SECRET, 0).is_none());
        assert!(verify_token("v2.1.client.99.aa", SECRET, 0).is_none());
        assert!(verify_token("v1.x.client.99.aa", SECRET, 0).is_none());
        assert!(verify_token("v1.1.boss.2000000000.aa", SECRET, 0).is_none());
    }
}
