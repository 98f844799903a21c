//! Core error model.
//!
//! One enum covers every failure the core surfaces. Each kind carries a
//! frozen wire code and a retryability flag; internal context never crosses
//! the wire.

use crate::store::StoreError;
use mp_protocol::error_codes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid or expired token")]
    AuthInvalid,
    #[error("account is banned")]
    Banned,
    #[error("{0}")]
    Validation(String),
    #[error("already waiting in a queue")]
    AlreadyQueued,
    #[error("not waiting in any queue")]
    NotInQueue,
    #[error("already in an active session")]
    AlreadyInSession,
    #[error("no active session")]
    NotInSession,
    #[error("partner is unavailable")]
    PartnerUnavailable,
    #[error("shared store unavailable")]
    StoreUnavailable(#[source] StoreError),
    #[error("instance is over capacity")]
    Overloaded,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::AuthInvalid => error_codes::AUTH_INVALID,
            CoreError::Banned => error_codes::BANNED,
            CoreError::Validation(_) => error_codes::VALIDATION,
            CoreError::AlreadyQueued => error_codes::ALREADY_QUEUED,
            CoreError::NotInQueue => error_codes::NOT_IN_QUEUE,
            CoreError::AlreadyInSession => error_codes::ALREADY_IN_SESSION,
            CoreError::NotInSession => error_codes::NOT_IN_SESSION,
            CoreError::PartnerUnavailable => error_codes::PARTNER_UNAVAILABLE,
            CoreError::StoreUnavailable(_) => error_codes::STORE_UNAVAILABLE,
            CoreError::Overloaded => error_codes::OVERLOADED,
            CoreError::RateLimited => error_codes::RATE_LIMITED,
            CoreError::Internal(_) => error_codes::INTERNAL_ERROR,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::StoreUnavailable(_)
                | CoreError::Overloaded
                | CoreError::RateLimited
                | CoreError::Internal(_)
        )
    }

    /// Message safe to send to the client. Internal detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            CoreError::StoreUnavailable(_) => "temporary failure, try again".to_owned(),
            CoreError::Internal(_) => "internal error".to_owned(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => CoreError::StoreUnavailable(err),
            StoreError::Corrupt { .. } => CoreError::Internal(err.to_string()),
        }
    }
}
