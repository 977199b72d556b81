//! Error types for the smtpflow SMTP front door.
//!
//! This module provides typed error handling for connection handling, TLS
//! upgrades and the per-connection session loop.

use std::{io, time::Duration};

use smtpflow_common::error::ListenerError;
use thiserror::Error;

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error during connection operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection was already upgraded to TLS.
    #[error("Connection is already using TLS")]
    AlreadySecure,
}

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// I/O error during TLS operations, including a failed handshake.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load TLS certificate.
    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to load TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// A negotiated connection did not report its protocol parameters.
    #[error("TLS session is missing {0}")]
    ProtocolInfoMissing(String),

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Errors that end an SMTP session early.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("STARTTLS failed: {0}")]
    Tls(#[from] TlsError),

    /// The implicit TLS handshake did not finish in time.
    #[error("TLS handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Connection exceeded its maximum lifetime of {0:?}")]
    Lifetime(Duration),
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Connection(ConnectionError::Io(err))
    }
}

/// Errors that prevent the SMTP front door from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unable to load TLS material: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Specialized `Result` type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Specialized `Result` type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
