//! Business logic behind an SMTP session.
//!
//! The session drives the protocol; at the two points where the outside
//! world is involved, checking credentials and handing over a complete
//! message, it calls an [`SmtpTransactionHandler`].

use std::net::SocketAddr;

use async_trait::async_trait;
use smtpflow_delivery::{OutboundMessage, Receipt, Submission, SubmissionError, Submitter};
use smtpflow_store::{AuthError, CredentialStore, TenantIdentity};

use crate::auth::Credentials;

/// A message received over SMTP, ready to be submitted.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub tenant: TenantIdentity,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    /// The raw DATA, dot-unstuffed, without the terminating `.`.
    pub data: Vec<u8>,
    pub peer: SocketAddr,
}

#[async_trait]
pub trait SmtpTransactionHandler: Send + Sync {
    /// Resolve AUTH credentials to the tenant the session will act as.
    async fn authenticate(&self, credentials: &Credentials) -> Result<TenantIdentity, AuthError>;

    /// Take responsibility for a complete message.
    async fn handle_message(&self, message: ReceivedMessage) -> Result<Receipt, SubmissionError>;
}

/// Checks credentials against the [`CredentialStore`] and hands messages to
/// the shared [`Submitter`].
#[derive(Debug, Clone)]
pub struct RelayHandler {
    credentials: CredentialStore,
    submitter: Submitter,
}

impl RelayHandler {
    #[must_use]
    pub const fn new(credentials: CredentialStore, submitter: Submitter) -> Self {
        Self {
            credentials,
            submitter,
        }
    }
}

#[async_trait]
impl SmtpTransactionHandler for RelayHandler {
    async fn authenticate(&self, credentials: &Credentials) -> Result<TenantIdentity, AuthError> {
        self.credentials
            .resolve(&credentials.username, &credentials.secret)
            .await
    }

    async fn handle_message(&self, message: ReceivedMessage) -> Result<Receipt, SubmissionError> {
        let ReceivedMessage {
            tenant,
            sender,
            recipients,
            data,
            peer,
        } = message;

        let submission = Submission {
            tenant,
            sender,
            recipients,
            message: OutboundMessage::parse(&data),
            size: u64::try_from(data.len()).unwrap_or(u64::MAX),
            peer: Some(peer.ip()),
        };

        self.submitter.submit(submission).await
    }
}
