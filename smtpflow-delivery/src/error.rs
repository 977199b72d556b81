//! Typed errors for the outbound pipeline.
//!
//! The front doors map these onto replies themselves:
//! - [`SubmissionError::QuotaExceeded`] is permanent (550 / HTTP 429)
//! - [`SubmissionError::Relay`] is always temporary, whatever the upstream
//!   said (451 / HTTP 502)
//! - [`SubmissionError::Store`] is temporary (451 / HTTP 503)
//! - [`SubmissionError::Malformed`] is the client's fault (550 / HTTP 400)

use std::time::Duration;

use smtpflow_store::StoreError;
use thiserror::Error;

/// Failure talking to the upstream relay. Never retried internally.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The upstream answered with a 5xx.
    #[error("Upstream rejected the message: {0}")]
    Rejected(String),

    /// Connection, TLS or 4xx failures.
    #[error("Upstream relay unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream relay did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Invalid envelope address {0:?}")]
    InvalidAddress(String),

    #[error("Relay transport misconfigured: {0}")]
    Configuration(String),
}

impl RelayError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::InvalidAddress(_))
    }
}

/// The submission cannot be turned into an outbound message.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("Invalid address {0:?}")]
    InvalidAddress(String),

    #[error("Message has no recipients")]
    NoRecipients,

    #[error("Unable to build message: {0}")]
    Build(String),
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Monthly limit reached ({used}/{limit})")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error(transparent)]
    Malformed(#[from] ComposeError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Quota storage unavailable: {0}")]
    Store(#[from] StoreError),
}
