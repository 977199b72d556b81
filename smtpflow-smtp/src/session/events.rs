use std::borrow::Cow;

use smtpflow_common::{internal, status::Status, tracing};
use smtpflow_delivery::SubmissionError;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    State, auth::Credentials, session::Session, transaction_handler::ReceivedMessage,
};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// Do the work the state machine leaves to the session: checking
    /// credentials and submitting a finished message. The outcome is left in
    /// `context.response`.
    #[tracing::instrument(level = "trace", skip_all)]
    pub(super) async fn emit(&mut self) {
        let reply = match &self.context.state {
            State::AuthAttempt(attempt) => {
                let credentials = attempt.credentials.clone();
                self.authenticate(&credentials).await
            }
            State::PostDot(_) => self.submit().await,
            _ => return,
        };

        self.context.response = Some(reply);
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> (Status, Cow<'static, str>) {
        match self.handler.authenticate(credentials).await {
            Ok(tenant) => {
                internal!(level = INFO, "Authenticated as {}", tenant.username);
                self.session_state.tenant = Some(tenant);
                (
                    Status::AuthSuccessful,
                    Cow::Borrowed("2.7.0 Authentication successful"),
                )
            }
            Err(err) if err.is_rejection() => {
                tracing::warn!(username = %credentials.username, "Authentication failed: {err}");
                (
                    Status::AuthFailed,
                    Cow::Borrowed("5.7.8 Authentication credentials invalid"),
                )
            }
            Err(err) => {
                tracing::error!(username = %credentials.username, "Unable to check credentials: {err}");
                (
                    Status::TemporaryAuthFailure,
                    Cow::Borrowed("4.7.0 Temporary authentication failure"),
                )
            }
        }
    }

    async fn submit(&mut self) -> (Status, Cow<'static, str>) {
        let data = std::mem::take(&mut self.context.message);

        let (Some(envelope), Some(tenant)) = (
            self.session_state.take_transaction(),
            self.session_state.tenant.clone(),
        ) else {
            return (
                Status::InvalidCommandSequence,
                Cow::Borrowed("5.5.1 No mail transaction in progress"),
            );
        };

        let message = ReceivedMessage {
            tenant,
            sender: envelope.sender,
            recipients: envelope.recipients,
            data,
            peer: self.peer,
        };

        match self.handler.handle_message(message).await {
            Ok(receipt) => {
                internal!(
                    level = INFO,
                    "Accepted message {} ({} used this period)",
                    receipt.tracking_id,
                    receipt.quota_used
                );
                (
                    Status::Ok,
                    Cow::Owned(format!("2.0.0 Ok: queued as {}", receipt.tracking_id)),
                )
            }
            Err(SubmissionError::QuotaExceeded { used, limit }) => {
                internal!(level = INFO, "Monthly limit reached ({used}/{limit})");
                (
                    Status::Error,
                    Cow::Owned(format!("5.7.1 Monthly limit reached ({used}/{limit})")),
                )
            }
            Err(SubmissionError::Malformed(err)) => {
                internal!(level = INFO, "Rejected malformed message: {err}");
                (Status::Error, Cow::Owned(format!("5.6.0 {err}")))
            }
            Err(err) => {
                tracing::error!("Submission failed: {err}");
                (
                    Status::ActionUnavailable,
                    Cow::Borrowed("4.3.0 Message could not be relayed, try again later"),
                )
            }
        }
    }
}
