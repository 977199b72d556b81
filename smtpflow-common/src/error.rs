//! Errors shared by the network front doors.

use std::io;

use thiserror::Error;

/// Errors that can occur while running a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to socket address.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),

    /// The listener needs TLS material that was not configured.
    #[error("Listener on {0} requires a TLS certificate and key")]
    MissingTls(String),

    /// Shutdown signal received.
    #[error("Shutdown requested")]
    Shutdown,
}

impl ListenerError {
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::*;

    #[test]
    fn bind_failure_keeps_source() {
        let err = ListenerError::BindFailed {
            address: "0.0.0.0:587".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };

        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "Failed to bind to 0.0.0.0:587: address in use"
        );
        assert!(!err.is_shutdown());
    }

    #[test]
    fn missing_tls_display() {
        let err = ListenerError::MissingTls("0.0.0.0:465".to_string());
        assert_eq!(
            err.to_string(),
            "Listener on 0.0.0.0:465 requires a TLS certificate and key"
        );
        assert!(ListenerError::Shutdown.is_shutdown());
    }
}
