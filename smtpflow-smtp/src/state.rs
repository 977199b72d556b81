use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use smtpflow_common::status::Status;

use crate::{
    auth::{self, Credentials, Mechanism, SaslError},
    command::{Command, HeloVariant, MailParameters},
    session_state::{Envelope, SessionState},
};

// ============================================================================
// State Definitions
// ============================================================================

/// Initial connection state - client just connected, or just upgraded to TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect;

/// After successful EHLO command (extended SMTP)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ehlo {
    pub id: String,
}

/// After successful HELO command (basic SMTP)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Helo {
    pub id: String,
}

/// STARTTLS accepted, the handshake follows the `220` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTls;

/// A `334` challenge is outstanding; the next line is a SASL response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub mechanism: Mechanism,
    /// LOGIN only: the username from the first response.
    pub username: Option<String>,
}

impl AuthChallenge {
    /// The base64 text after `334 `.
    #[must_use]
    pub const fn prompt(&self) -> &'static str {
        match (self.mechanism, &self.username) {
            (Mechanism::Plain, _) => "",
            (Mechanism::Login, None) => auth::USERNAME_PROMPT,
            (Mechanism::Login, Some(_)) => auth::PASSWORD_PROMPT,
        }
    }
}

/// Credentials are complete and waiting to be checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    pub credentials: Credentials,
}

/// After MAIL FROM command (beginning of mail transaction)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailFrom;

/// After RCPT TO command (at least one recipient)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcptTo;

/// After DATA command (ready to receive message body)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Data;

/// Reading message data (after DATA command, before end-of-data marker)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading;

/// After end-of-data marker (.\r\n), message complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostDot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rset;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Noop;

/// A command was refused. The connection stays open and the session carries
/// on from where it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refused {
    pub status: Status,
    pub message: Cow<'static, str>,
}

/// Client issued QUIT command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quit;

/// Connection closing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Close;

// ============================================================================
// State Enum for Dynamic Dispatch
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Connect(Connect),
    Ehlo(Ehlo),
    Helo(Helo),
    StartTls(StartTls),
    AuthChallenge(AuthChallenge),
    AuthAttempt(AuthAttempt),
    MailFrom(MailFrom),
    RcptTo(RcptTo),
    Data(Data),
    Reading(Reading),
    PostDot(PostDot),
    Rset(Rset),
    Noop(Noop),
    Refused(Refused),
    Quit(Quit),
    Close(Close),
}

impl Default for State {
    fn default() -> Self {
        Self::Connect(Connect)
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Reading(_) | Self::PostDot(_) => "",
            Self::Connect(_) => "Connect",
            Self::Close(_) => "Close",
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
            Self::StartTls(_) => "STARTTLS",
            Self::AuthChallenge(_) | Self::AuthAttempt(_) => "AUTH",
            Self::MailFrom(_) => "MAIL",
            Self::RcptTo(_) => "RCPT",
            Self::Data(_) => "DATA",
            Self::Rset(_) => "RSET",
            Self::Noop(_) => "NOOP",
            Self::Refused(_) => "Refused",
            Self::Quit(_) => "QUIT",
        })
    }
}

impl State {
    fn refuse(status: Status, message: impl Into<Cow<'static, str>>) -> Self {
        Self::Refused(Refused {
            status,
            message: message.into(),
        })
    }

    /// Reply-only states pass straight back to the phase the session is in.
    const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Rset(_) | Self::Noop(_) | Self::Refused(_) | Self::AuthAttempt(_) | Self::PostDot(_)
        )
    }

    /// The resting state implied by the session state.
    #[must_use]
    pub fn resume(ctx: &SessionState) -> Self {
        match &ctx.transaction {
            Some(envelope) if !envelope.recipients.is_empty() => Self::RcptTo(RcptTo),
            Some(_) => Self::MailFrom(MailFrom),
            None if ctx.is_greeted() && ctx.extended => Self::Ehlo(Ehlo { id: ctx.id.clone() }),
            None if ctx.is_greeted() => Self::Helo(Helo { id: ctx.id.clone() }),
            None => Self::Connect(Connect),
        }
    }

    /// Transition from current state based on received command
    ///
    /// Pure: only the protocol state in `ctx` is touched. Checking
    /// credentials and submitting the message happen in the session once it
    /// sees [`State::AuthAttempt`] or [`State::PostDot`].
    #[must_use]
    pub fn transition_protocol(self, command: Command, ctx: &mut SessionState) -> Self {
        let state = if self.is_transient() {
            Self::resume(ctx)
        } else {
            self
        };

        match (state, command) {
            (_, Command::Quit) => Self::Quit(Quit),

            // SASL exchange
            (Self::AuthChallenge(challenge), Command::AuthResponse(response)) => {
                Self::continue_auth(challenge, &response)
            }
            (Self::AuthChallenge(_), _) => {
                Self::refuse(Status::ParameterError, "5.5.2 Expected authentication response")
            }

            (_, Command::Noop) => Self::Noop(Noop),

            // EHLO/HELO may be repeated and always abandons the transaction
            (_, Command::Helo(variant)) => {
                ctx.reset_transaction();
                match variant {
                    HeloVariant::Ehlo(id) => {
                        ctx.id.clone_from(&id);
                        ctx.extended = true;
                        Self::Ehlo(Ehlo { id })
                    }
                    HeloVariant::Helo(id) => {
                        ctx.id.clone_from(&id);
                        ctx.extended = false;
                        Self::Helo(Helo { id })
                    }
                }
            }

            (Self::Ehlo(_), Command::StartTls) if ctx.starttls_available() => {
                Self::StartTls(StartTls)
            }
            (state, Command::StartTls) => Self::refuse_starttls(&state, ctx),

            (_, Command::Auth { mechanism, initial }) => {
                Self::begin_auth(ctx, &mechanism, initial.as_deref())
            }

            (_, Command::MailFrom(sender, params)) => Self::mail_from(ctx, sender, &params),

            // Recipient collection; every recipient is accepted and the
            // upstream relay decides deliverability
            (Self::MailFrom(_) | Self::RcptTo(_), Command::RcptTo(recipient)) => {
                if let Some(envelope) = ctx.transaction.as_mut() {
                    envelope.recipients.push(recipient);
                }
                Self::RcptTo(RcptTo)
            }
            (_, Command::RcptTo(_)) => {
                Self::refuse(Status::InvalidCommandSequence, "5.5.1 Need MAIL before RCPT")
            }

            (Self::RcptTo(_), Command::Data) => Self::Data(Data),
            (Self::MailFrom(_), Command::Data) => {
                Self::refuse(Status::InvalidCommandSequence, "5.5.1 Need RCPT before DATA")
            }
            (_, Command::Data) if !ctx.is_authenticated() => {
                Self::refuse(Status::AuthRequired, "5.7.0 Authentication required")
            }
            (_, Command::Data) => {
                Self::refuse(Status::InvalidCommandSequence, "5.5.1 Need MAIL before DATA")
            }

            (_, Command::Rset) => {
                ctx.reset_transaction();
                Self::Rset(Rset)
            }

            (_, Command::NotImplemented(_)) => {
                Self::refuse(Status::NotImplemented, "5.5.1 Command not implemented")
            }
            (_, Command::Invalid(reason)) => {
                Self::refuse(Status::ParameterError, format!("5.5.4 {reason}"))
            }
            (_, Command::Unrecognized(_) | Command::AuthResponse(_)) => {
                Self::refuse(Status::SyntaxError, "5.5.2 Syntax error, command unrecognized")
            }
        }
    }

    fn refuse_starttls(state: &Self, ctx: &SessionState) -> Self {
        if ctx.secure {
            Self::refuse(Status::InvalidCommandSequence, "5.5.1 TLS already active")
        } else if !ctx.tls_available {
            Self::refuse(Status::TemporaryAuthFailure, "4.7.0 TLS not available")
        } else if matches!(state, Self::MailFrom(_) | Self::RcptTo(_)) {
            Self::refuse(
                Status::InvalidCommandSequence,
                "5.5.1 STARTTLS not allowed during a mail transaction",
            )
        } else {
            Self::refuse(Status::InvalidCommandSequence, "5.5.1 Send EHLO first")
        }
    }

    fn begin_auth(ctx: &SessionState, mechanism: &str, initial: Option<&str>) -> Self {
        if !ctx.is_greeted() {
            return Self::refuse(Status::InvalidCommandSequence, "5.5.1 Send EHLO first");
        }

        if ctx.is_authenticated() {
            return Self::refuse(Status::InvalidCommandSequence, "5.5.1 Already authenticated");
        }

        if ctx.transaction.is_some() {
            return Self::refuse(
                Status::InvalidCommandSequence,
                "5.5.1 AUTH not permitted during a mail transaction",
            );
        }

        if !ctx.auth_permitted() {
            return Self::refuse(
                Status::EncryptionRequired,
                "5.7.11 Must issue a STARTTLS command first",
            );
        }

        let mechanism = match mechanism.parse::<Mechanism>() {
            Ok(mechanism) => mechanism,
            Err(err) => return Self::sasl_failure(err),
        };

        match (mechanism, initial) {
            (Mechanism::Plain, Some(response)) => Self::attempt_plain(response),
            (Mechanism::Login, Some(response)) => match auth::decode_response(response) {
                Ok(username) => Self::AuthChallenge(AuthChallenge {
                    mechanism,
                    username: Some(username),
                }),
                Err(err) => Self::sasl_failure(err),
            },
            (mechanism, None) => Self::AuthChallenge(AuthChallenge {
                mechanism,
                username: None,
            }),
        }
    }

    fn continue_auth(challenge: AuthChallenge, response: &str) -> Self {
        match (challenge.mechanism, challenge.username) {
            (Mechanism::Plain, _) => Self::attempt_plain(response),
            (Mechanism::Login, None) => match auth::decode_response(response) {
                Ok(username) => Self::AuthChallenge(AuthChallenge {
                    mechanism: Mechanism::Login,
                    username: Some(username),
                }),
                Err(err) => Self::sasl_failure(err),
            },
            (Mechanism::Login, Some(username)) => match auth::decode_response(response) {
                Ok(secret) => Self::AuthAttempt(AuthAttempt {
                    credentials: Credentials { username, secret },
                }),
                Err(err) => Self::sasl_failure(err),
            },
        }
    }

    fn attempt_plain(response: &str) -> Self {
        auth::decode_plain(response).map_or_else(Self::sasl_failure, |credentials| {
            Self::AuthAttempt(AuthAttempt { credentials })
        })
    }

    fn sasl_failure(err: SaslError) -> Self {
        match err {
            SaslError::UnknownMechanism => Self::refuse(
                Status::ParameterNotImplemented,
                "5.5.4 Unrecognized authentication type",
            ),
            SaslError::Cancelled => {
                Self::refuse(Status::ParameterError, "5.7.0 Authentication cancelled")
            }
            SaslError::Encoding | SaslError::Malformed => {
                Self::refuse(Status::ParameterError, "5.5.2 Cannot decode response")
            }
        }
    }

    fn mail_from(ctx: &mut SessionState, sender: Option<String>, params: &MailParameters) -> Self {
        if !ctx.is_authenticated() {
            return Self::refuse(Status::AuthRequired, "5.7.0 Authentication required");
        }

        if ctx.transaction.is_some() {
            return Self::refuse(Status::InvalidCommandSequence, "5.5.1 Sender already specified");
        }

        let declared_size = params.size();
        if declared_size.is_some_and(|size| ctx.exceeds_size(size)) {
            return Self::refuse(
                Status::ExceededStorage,
                "5.3.4 Message size exceeds fixed maximum message size",
            );
        }

        ctx.transaction = Some(Envelope {
            sender,
            recipients: Vec::new(),
            declared_size,
        });

        Self::MailFrom(MailFrom)
    }

    /// Whether this state ends the connection once its reply is sent.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Quit(_) | Self::Close(_))
    }
}
