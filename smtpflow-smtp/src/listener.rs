use std::{io, net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use smtpflow_common::{Signal, error::ListenerError, internal, tracing};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use crate::{
    connection::Connection,
    error::SessionError,
    session::{Session, SessionConfig},
    transaction_handler::SmtpTransactionHandler,
};

/// How a listener secures its connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    /// Plaintext with STARTTLS offered, as on port 587.
    #[default]
    StartTls,
    /// TLS from the first byte, as on port 465 (RFC 8314).
    Tls,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub socket: SocketAddr,
    #[serde(default)]
    pub mode: ListenerMode,
}

pub struct Listener {
    socket: TcpListener,
    mode: ListenerMode,
    config: Arc<SessionConfig>,
    handler: Arc<dyn SmtpTransactionHandler>,
}

impl Listener {
    /// Bind the socket. An implicit TLS listener needs a certificate.
    pub async fn bind(
        listener: &ListenerConfig,
        config: Arc<SessionConfig>,
        handler: Arc<dyn SmtpTransactionHandler>,
    ) -> Result<Self, ListenerError> {
        if listener.mode == ListenerMode::Tls && config.tls.is_none() {
            return Err(ListenerError::MissingTls(listener.socket.to_string()));
        }

        let socket = TcpListener::bind(listener.socket)
            .await
            .map_err(|source| ListenerError::BindFailed {
                address: listener.socket.to_string(),
                source,
            })?;

        Ok(Self {
            socket,
            mode: listener.mode,
            config,
            handler,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Accept connections until shutdown, then wait for open sessions to
    /// finish. Sessions get the shutdown signal too and close with a `421`.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        let address = self.local_addr()?;
        internal!(level = INFO, "Serving SMTP on {address} ({:?})", self.mode);

        let mut sessions: Vec<JoinHandle<()>> = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        internal!(level = INFO, "SMTP Listener {address} Received Shutdown signal, finishing sessions ...");
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = self.socket.accept() => {
                    let (stream, peer) = match connection {
                        Ok(connection) => connection,
                        Err(err) => {
                            internal!(level = WARN, "{}", ListenerError::AcceptFailed(err));
                            continue;
                        }
                    };

                    tracing::debug!("Connection received on {address} from {peer}");
                    sessions.retain(|session| !session.is_finished());

                    let mode = self.mode;
                    let config = Arc::clone(&self.config);
                    let handler = Arc::clone(&self.handler);
                    let signal = shutdown.resubscribe();

                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = handle(stream, peer, mode, config, handler, signal).await {
                            internal!(level = ERROR, "Error: {err}");
                        }
                    }));
                }
            }
        }

        Ok(())
    }
}

async fn handle(
    stream: TcpStream,
    peer: SocketAddr,
    mode: ListenerMode,
    config: Arc<SessionConfig>,
    handler: Arc<dyn SmtpTransactionHandler>,
    signal: broadcast::Receiver<Signal>,
) -> Result<(), SessionError> {
    let connection = match (mode, config.tls.as_ref()) {
        (ListenerMode::Tls, Some(acceptor)) => {
            let timeout = config.timeouts.command();
            let (connection, info) =
                tokio::time::timeout(timeout, Connection::accept(stream, acceptor))
                    .await
                    .map_err(|_| SessionError::HandshakeTimeout(timeout))??;

            internal!(
                level = DEBUG,
                "TLS established with {peer} using {} {}",
                info.proto(),
                info.cipher()
            );
            connection
        }
        _ => Connection::plain(stream),
    };

    Session::create(connection, peer, config, handler)
        .run(signal)
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mode_defaults_to_starttls() {
        let config: ListenerConfig = ron::from_str("(socket: \"127.0.0.1:2525\")").unwrap();
        assert_eq!(config.mode, ListenerMode::StartTls);

        let config: ListenerConfig =
            ron::from_str("(socket: \"127.0.0.1:4650\", mode: tls)").unwrap();
        assert_eq!(config.mode, ListenerMode::Tls);
    }
}
