use std::{
    borrow::Cow,
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use smtpflow_common::{
    Signal, config::ServerTimeouts, internal, outgoing, status::Status, tracing,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    State, connection::Connection, error::SessionError, session_state::SessionState, state,
    transaction_handler::SmtpTransactionHandler,
};

// Submodules containing implementation details
mod events;
mod io;
mod response;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(PartialEq, Eq, Debug)]
pub enum Event {
    ConnectionClose,
    ConnectionKeepAlive,
}

#[derive(Debug, Default)]
pub struct Context {
    pub state: State,
    /// Message data received so far, dot-unstuffed.
    pub message: Vec<u8>,
    pub sent: bool,
    /// A reply decided outside of the state machine, overriding the default
    /// reply for the state.
    pub response: Option<(Status, Cow<'static, str>)>,
    /// The rest of an overlong command line is being discarded.
    pub skip_line: bool,
}

pub type Response = (Option<Vec<String>>, Event);

/// Progress through one DATA phase.
#[derive(Debug, Default)]
pub(crate) struct DataProgress {
    started: Option<Instant>,
    /// The previous chunk ended a line, so the next one starts a new line.
    line_start: bool,
    /// The size limit was exceeded; data is drained and discarded.
    overflow: bool,
}

impl DataProgress {
    fn start() -> Self {
        Self {
            started: Some(Instant::now()),
            line_start: true,
            overflow: false,
        }
    }
}

#[derive(Clone)]
pub struct SessionConfig {
    pub hostname: Arc<str>,
    /// Maximum message size in bytes, advertised via SIZE (RFC 1870).
    ///
    /// Checked against the declared SIZE on MAIL FROM and against the bytes
    /// actually received during DATA. 0 disables the limit.
    pub max_message_size: usize,
    pub allow_insecure_auth: bool,
    pub timeouts: ServerTimeouts,
    /// Present when a certificate is configured.
    pub tls: Option<TlsAcceptor>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("hostname", &self.hostname)
            .field("max_message_size", &self.max_message_size)
            .field("allow_insecure_auth", &self.allow_insecure_auth)
            .field("timeouts", &self.timeouts)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for `SessionConfig`
#[derive(Default)]
pub struct SessionConfigBuilder {
    hostname: String,
    max_message_size: usize,
    allow_insecure_auth: bool,
    timeouts: ServerTimeouts,
    tls: Option<TlsAcceptor>,
}

impl SessionConfigBuilder {
    /// The name used in the greeting and the EHLO reply
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    #[must_use]
    pub const fn with_insecure_auth(mut self, allow: bool) -> Self {
        self.allow_insecure_auth = allow;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsAcceptor>) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            hostname: if self.hostname.is_empty() {
                std::env::var("HOSTNAME")
                    .unwrap_or_else(|_| "localhost".to_string())
                    .into()
            } else {
                self.hostname.into()
            },
            max_message_size: self.max_message_size,
            allow_insecure_auth: self.allow_insecure_auth,
            timeouts: self.timeouts,
            tls: self.tls,
        }
    }
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    id: u64,
    peer: SocketAddr,
    pub(super) context: Context,
    pub(super) session_state: SessionState,
    pub(super) config: Arc<SessionConfig>,
    pub(super) handler: Arc<dyn SmtpTransactionHandler>,
    pub(super) connection: Connection<Stream>,
    pub(super) data: DataProgress,
    /// Start time for tracking connection lifetime
    start_time: Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn create(
        connection: Connection<Stream>,
        peer: SocketAddr,
        config: Arc<SessionConfig>,
        handler: Arc<dyn SmtpTransactionHandler>,
    ) -> Self {
        let session_state = SessionState {
            secure: connection.is_secure(),
            tls_available: config.tls.is_some(),
            allow_insecure_auth: config.allow_insecure_auth,
            max_message_size: config.max_message_size,
            ..SessionState::default()
        };

        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            context: Context::default(),
            session_state,
            config,
            handler,
            connection,
            data: DataProgress::default(),
            start_time: Instant::now(),
        }
    }

    /// Per-line timeout: RFC 5321 Section 4.5.3.2, with the DATA phase as a
    /// whole bounded as well.
    fn current_timeout(&self) -> Duration {
        let timeouts = &self.config.timeouts;

        match &self.context.state {
            State::Reading(_) => {
                let remaining = self.data.started.map_or(timeouts.data_termination(), |started| {
                    timeouts.data_termination().saturating_sub(started.elapsed())
                });
                timeouts.data_block().min(remaining)
            }
            _ => timeouts.command(),
        }
    }

    /// End the session after sending `response`, if any.
    fn close(&mut self, response: Option<(Status, Cow<'static, str>)>) {
        self.context.state = State::Close(state::Close);
        self.context.response = response;
        self.context.sent = false;
    }

    #[tracing::instrument(level = "debug", name = "session", skip_all, fields(peer = %self.peer, session = self.id))]
    pub async fn run(self, mut signal: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        internal!("Connected");

        async fn run_inner<Stream: AsyncRead + AsyncWrite + Unpin + Send>(
            mut session: Session<Stream>,
            signal: &mut broadcast::Receiver<Signal>,
        ) -> Result<(), SessionError> {
            loop {
                let max_duration = session.config.timeouts.connection();
                if session.start_time.elapsed() >= max_duration {
                    tracing::warn!(
                        peer = %session.peer,
                        max_secs = max_duration.as_secs(),
                        "Connection exceeded maximum lifetime, closing"
                    );
                    let reply = format!("{} 4.4.2 Connection lifetime exceeded", Status::Unavailable);
                    if let Err(err) = session.connection.send(&reply).await {
                        internal!(level = DEBUG, "{err}");
                    }
                    return Err(SessionError::Lifetime(max_duration));
                }

                let (response, ev) = session.response().await;

                session.context.response = None;
                session.context.sent = true;

                for response in response.unwrap_or_default() {
                    outgoing!("{response}");
                    session.connection.send(&response).await?;
                }

                if Event::ConnectionClose == ev {
                    return Ok(());
                } else if let Some(acceptor) = session.config.tls.clone()
                    && matches!(session.context.state, State::StartTls(_))
                {
                    let (connection, info) = session.connection.upgrade(&acceptor).await?;
                    session.connection = connection;
                    session.session_state.upgraded();
                    session.context = Context {
                        sent: true,
                        ..Default::default()
                    };

                    internal!(
                        level = DEBUG,
                        "Connection upgraded to {} using {}",
                        info.proto(),
                        info.cipher()
                    );
                } else {
                    session.handle_command_loop(signal).await?;
                }
            }
        }

        let result = run_inner(self, &mut signal).await;

        internal!("Connection closed");

        result
    }

    /// Wait for the next line with timeout and shutdown handling
    async fn handle_command_loop(
        &mut self,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let timeout = self.current_timeout();

        tokio::select! {
            _ = signal.recv() => {
                self.close(Some((Status::Unavailable, Cow::Borrowed("4.3.2 Server shutting down"))));
                Ok(())
            }
            result = tokio::time::timeout(timeout, self.receive()) => {
                match result {
                    Ok(Ok(true)) => {
                        internal!("Client closed the connection");
                        self.close(None);
                    }
                    Ok(Ok(false)) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(_) => {
                        tracing::warn!(
                            peer = %self.peer,
                            state = %self.context.state,
                            timeout_secs = timeout.as_secs(),
                            "Client connection timed out"
                        );

                        let reply = if matches!(self.context.state, State::Reading(_)) {
                            (Status::ActionUnavailable, Cow::Borrowed("4.4.2 Timeout waiting for data"))
                        } else {
                            (Status::Unavailable, Cow::Borrowed("4.4.2 Timeout, closing connection"))
                        };
                        self.close(Some(reply));
                    }
                }
                Ok(())
            }
        }
    }
}
