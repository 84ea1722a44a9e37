use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::models::{ApiResponse, BookingStatus};

/// Domain error taxonomy. Every variant carries a stable tag that is
/// surfaced verbatim to API callers; messages are human-readable detail.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation
    #[error("{0}")]
    BadInput(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("staff member cannot perform the requested services")]
    NoSkillMatch,
    #[error("bundle mixes currencies")]
    MixedCurrency,

    // Policy
    #[error("start is within the minimum lead time of {minutes} minutes")]
    LeadTimeBlocked { minutes: i64 },
    #[error("start is beyond the {days}-day booking horizon")]
    BeyondHorizon { days: i64 },
    #[error("inside the {hours}-hour lock window before the appointment")]
    LockWindow { hours: i64 },
    #[error("reschedule limit reached")]
    TooManyReschedules,

    // Concurrency
    #[error("slot is no longer available")]
    SlotUnavailable,
    #[error("client already has a booking overlapping this time")]
    ClientBusy,
    #[error("operation is not allowed from status {from}")]
    IllegalTransition { from: BookingStatus },
    #[error("booking has already been rated")]
    AlreadyRated,

    // Auth
    #[error("missing or invalid credentials")]
    Unauthorized,
    #[error("insufficient role")]
    Forbidden,

    // External
    #[error("payment initialization failed")]
    PaymentInitFailed,
    #[error("payment verification failed")]
    PaymentVerificationFailed,
    #[error("notifier unavailable")]
    NotifierUnavailable,

    // Infrastructure
    #[error("request timed out")]
    Timeout,
    #[error("storage error")]
    Store(sqlx::Error),
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => Self::Timeout,
            other => Self::Store(other),
        }
    }
}

impl ApiError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "BadInput",
            Self::NotFound(_) => "NotFound",
            Self::NoSkillMatch => "NoSkillMatch",
            Self::MixedCurrency => "MixedCurrency",
            Self::LeadTimeBlocked { .. } => "LeadTimeBlocked",
            Self::BeyondHorizon { .. } => "BeyondHorizon",
            Self::LockWindow { .. } => "LockWindow",
            Self::TooManyReschedules => "TooManyReschedules",
            Self::SlotUnavailable => "SlotUnavailable",
            Self::ClientBusy => "ClientBusy",
            Self::IllegalTransition { .. } => "IllegalTransition",
            Self::AlreadyRated => "AlreadyRated",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::PaymentInitFailed => "PaymentInitFailed",
            Self::PaymentVerificationFailed => "PaymentVerificationFailed",
            Self::NotifierUnavailable => "NotifierUnavailable",
            Self::Timeout => "Timeout",
            Self::Store(_) => "StoreUnavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadInput(_) | Self::MixedCurrency => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::NoSkillMatch => StatusCode::NOT_FOUND,
            Self::LeadTimeBlocked { .. }
            | Self::BeyondHorizon { .. }
            | Self::LockWindow { .. }
            | Self::TooManyReschedules => StatusCode::UNPROCESSABLE_ENTITY,
            Self::SlotUnavailable
            | Self::ClientBusy
            | Self::IllegalTransition { .. }
            | Self::AlreadyRated => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::PaymentInitFailed
            | Self::PaymentVerificationFailed
            | Self::NotifierUnavailable => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Store(e) = &self {
            tracing::error!(error = %e, "storage error");
        }
        let body = ApiResponse::<()>::failure(self.tag(), self.to_string());
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(ApiError::SlotUnavailable.tag(), "SlotUnavailable");
        assert_eq!(ApiError::LeadTimeBlocked { minutes: 30 }.tag(), "LeadTimeBlocked");
        assert_eq!(ApiError::BeyondHorizon { days: 60 }.tag(), "BeyondHorizon");
        assert_eq!(ApiError::LockWindow { hours: 3 }.tag(), "LockWindow");
        assert_eq!(
            ApiError::IllegalTransition { from: BookingStatus::Done }.tag(),
            "IllegalTransition"
        );
    }

    #[test]
    fn test_conflict_statuses() {
        assert_eq!(ApiError::SlotUnavailable.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::AlreadyRated.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::ClientBusy.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_policy_statuses() {
        assert_eq!(
            ApiError::LockWindow { hours: 3 }.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ApiError::TooManyReschedules.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
