//! SMTP submission front door.
//!
//! Tenants authenticate with AUTH PLAIN or LOGIN, over STARTTLS or an
//! implicit TLS listener, and submit messages that are handed to an
//! [`SmtpTransactionHandler`]. The protocol itself is a pure state machine
//! ([`state`]) driven by a per-connection [`Session`].

pub mod auth;
pub mod command;
pub mod connection;
pub mod error;
pub mod fsm;
pub mod listener;
pub mod session;
pub mod session_state;
pub mod state;
pub mod transaction_handler;

use std::{net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use serde::Deserialize;
use smtpflow_common::{Signal, config::ServerTimeouts, error::ListenerError};
use tokio::sync::broadcast;

pub use crate::{
    connection::TlsContext,
    error::ServerError,
    listener::{Listener, ListenerConfig, ListenerMode},
    session::{Session, SessionConfig},
    state::State,
    transaction_handler::{ReceivedMessage, RelayHandler, SmtpTransactionHandler},
};

/// Default message size limit, 10 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmtpServerConfig {
    /// Name used in the greeting. Falls back to `$HOSTNAME`, then `localhost`.
    #[serde(default)]
    pub hostname: String,

    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub tls: Option<TlsContext>,

    #[serde(default)]
    pub timeouts: ServerTimeouts,

    /// 0 disables the limit.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Accept AUTH on plaintext connections. For local testing only.
    #[serde(default)]
    pub allow_insecure_auth: bool,
}

impl Default for SmtpServerConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            listeners: default_listeners(),
            tls: None,
            timeouts: ServerTimeouts::default(),
            max_message_size: default_max_message_size(),
            allow_insecure_auth: false,
        }
    }
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![
        ListenerConfig {
            socket: SocketAddr::from(([0, 0, 0, 0], 587)),
            mode: ListenerMode::StartTls,
        },
        ListenerConfig {
            socket: SocketAddr::from(([0, 0, 0, 0], 465)),
            mode: ListenerMode::Tls,
        },
    ]
}

const fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

/// Every configured listener, sharing one TLS acceptor and one handler.
pub struct SmtpServer {
    listeners: Vec<Listener>,
}

impl SmtpServer {
    /// Load the TLS material and bind every listener.
    pub async fn bind(
        config: &SmtpServerConfig,
        handler: Arc<dyn SmtpTransactionHandler>,
    ) -> Result<Self, ServerError> {
        let tls = config
            .tls
            .as_ref()
            .map(TlsContext::acceptor)
            .transpose()?;

        let session = Arc::new(
            SessionConfig::builder()
                .with_hostname(config.hostname.clone())
                .with_max_message_size(config.max_message_size)
                .with_insecure_auth(config.allow_insecure_auth)
                .with_timeouts(config.timeouts.clone())
                .with_tls(tls)
                .build(),
        );

        let mut listeners = Vec::with_capacity(config.listeners.len());
        for listener in &config.listeners {
            listeners.push(Listener::bind(listener, Arc::clone(&session), Arc::clone(&handler)).await?);
        }

        Ok(Self { listeners })
    }

    /// The bound addresses, in configuration order.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    pub async fn serve(self, shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        join_all(
            self.listeners
                .into_iter()
                .map(|listener| listener.serve(shutdown.resubscribe())),
        )
        .await
        .into_iter()
        .collect()
    }
}
