//! Error types for campaign execution
//!
//! Dispatch errors are classified by recoverability:
//! - Transient: network issues, timeouts, rate limits, platform 5xx
//! - Terminal: bad target identifiers, withdrawn/duplicate invitations,
//!   rendered messages that violate a platform constraint

use thiserror::Error;

use crate::db::DbError;
use crate::identity::IdentityError;
use crate::renderer::ValidationError;

/// Failure of one external send or status operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    // Transient errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Platform request timed out")]
    Timeout,

    #[error("Platform rate limit exceeded")]
    RateLimited,

    #[error("Platform server error {status}: {message}")]
    Server { status: u16, message: String },

    // Terminal errors
    #[error("Invalid target identifier: {0}")]
    InvalidTarget(String),

    #[error("Prospect has no platform handle or profile URL")]
    MissingTarget,

    #[error("Campaign has no sequence step {0}")]
    MissingStep(u32),

    #[error("Invitation was withdrawn and cannot be sent again")]
    InvitationWithdrawn,

    #[error("An invitation to this person already exists")]
    DuplicateInvitation,

    #[error("Platform rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Whether a failed item may be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Terminal,
}

impl DispatchError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Network(_)
                | DispatchError::Timeout
                | DispatchError::RateLimited
                | DispatchError::Server { .. }
        )
    }

    pub fn failure_kind(&self) -> FailureKind {
        if self.is_retryable() {
            FailureKind::Transient
        } else {
            FailureKind::Terminal
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::Timeout
        } else {
            DispatchError::Network(err.to_string())
        }
    }
}

/// Errors surfaced by engine operations (activation, ticks, startup).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sending identity unavailable: {0}")]
    Identity(#[from] IdentityError),

    #[error("Platform client error: {0}")]
    Platform(#[from] DispatchError),
}
