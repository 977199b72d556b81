//! SMTP session state for the finite state machine.
//!
//! Holds only what the FSM needs to make a pure transition: who the client
//! said it is, whether the channel is encrypted, who it authenticated as and
//! the open mail transaction. The connection policy the FSM consults (TLS
//! availability, insecure auth, size limit) is copied in at session start.

use smtpflow_store::TenantIdentity;

/// The open mail transaction, from MAIL FROM to the end of DATA.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// `None` for the null reverse-path.
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    /// The `SIZE` the client declared on MAIL FROM.
    pub declared_size: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Client identifier from EHLO/HELO command
    pub id: String,

    /// `true` if client sent EHLO (extended SMTP), `false` for HELO
    pub extended: bool,

    /// The channel is encrypted, by STARTTLS or an implicit TLS listener.
    pub secure: bool,

    /// A certificate is configured, so STARTTLS can be offered.
    pub tls_available: bool,

    /// Permit AUTH on a plaintext channel. Off outside of tests and local setups.
    pub allow_insecure_auth: bool,

    /// Maximum message size in bytes, 0 for unlimited.
    pub max_message_size: usize,

    /// The tenant this session authenticated as.
    pub tenant: Option<TenantIdentity>,

    pub transaction: Option<Envelope>,
}

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether EHLO or HELO has been received.
    #[must_use]
    pub fn is_greeted(&self) -> bool {
        !self.id.is_empty()
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.tenant.is_some()
    }

    /// AUTH is only offered and accepted over TLS, unless explicitly allowed.
    #[must_use]
    pub const fn auth_permitted(&self) -> bool {
        self.secure || self.allow_insecure_auth
    }

    #[must_use]
    pub const fn starttls_available(&self) -> bool {
        self.tls_available && !self.secure
    }

    /// Whether a SIZE declared on MAIL FROM is over the limit.
    #[must_use]
    pub const fn exceeds_size(&self, size: usize) -> bool {
        self.max_message_size > 0 && size > self.max_message_size
    }

    /// Clears the mail transaction, keeping greeting and authentication.
    /// Used for RSET, a new EHLO and after each completed message.
    pub fn reset_transaction(&mut self) {
        self.transaction = None;
    }

    pub fn take_transaction(&mut self) -> Option<Envelope> {
        self.transaction.take()
    }

    /// Forget everything learned over plaintext (RFC 3207 Section 4.2).
    pub fn upgraded(&mut self) {
        self.id.clear();
        self.extended = false;
        self.tenant = None;
        self.transaction = None;
        self.secure = true;
    }
}
