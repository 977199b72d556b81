use smtpflow_common::{status::Status, tracing};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    State,
    session::{Event, Response, Session},
};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// Format and return the response to send to the client
    ///
    /// All work happens in `emit()` first. A reply it, or the input handling,
    /// decided on takes precedence over the default reply for the state.
    #[tracing::instrument(level = "trace", skip_all, ret)]
    pub(super) async fn response(&mut self) -> Response {
        if self.context.sent {
            return (None, Event::ConnectionKeepAlive);
        }

        self.emit().await;

        if let Some((status, ref message)) = self.context.response {
            let event = if self.context.state.is_terminal() {
                Event::ConnectionClose
            } else {
                Event::ConnectionKeepAlive
            };

            return (Some(vec![format!("{status} {message}")]), event);
        }

        self.default_response()
    }

    fn default_response(&mut self) -> Response {
        let reply = |status: Status, text: &str| {
            (Some(vec![format!("{status} {text}")]), Event::ConnectionKeepAlive)
        };

        match &self.context.state {
            State::Connect(_) => reply(
                Status::ServiceReady,
                &format!("{} ESMTP smtpflow", self.config.hostname),
            ),
            State::Ehlo(_) => (Some(self.ehlo_response()), Event::ConnectionKeepAlive),
            State::Helo(_) => reply(Status::Ok, &*self.config.hostname),
            State::StartTls(_) => reply(Status::ServiceReady, "2.0.0 Ready to start TLS"),
            State::AuthChallenge(challenge) => reply(Status::AuthContinue, challenge.prompt()),
            State::MailFrom(_) => reply(Status::Ok, "2.1.0 Ok"),
            State::RcptTo(_) => reply(Status::Ok, "2.1.5 Ok"),
            State::Data(_) => {
                self.begin_data();
                reply(Status::StartMailInput, "End data with <CR><LF>.<CR><LF>")
            }
            State::Rset(_) | State::Noop(_) => reply(Status::Ok, "2.0.0 Ok"),
            State::Refused(refused) => reply(refused.status, &*refused.message),
            State::Quit(_) => (
                Some(vec![format!("{} 2.0.0 Bye", Status::GoodBye)]),
                Event::ConnectionClose,
            ),
            State::Close(_) => (None, Event::ConnectionClose),
            // AuthAttempt and PostDot are answered by emit(); Reading is silent
            State::AuthAttempt(_) | State::PostDot(_) | State::Reading(_) => {
                (None, Event::ConnectionKeepAlive)
            }
        }
    }

    /// The multi-line EHLO reply, keywords as they apply to this connection.
    fn ehlo_response(&self) -> Vec<String> {
        let mut lines = vec![
            self.config.hostname.to_string(),
            format!("SIZE {}", self.session_state.max_message_size),
            "8BITMIME".to_string(),
        ];

        if self.session_state.starttls_available() {
            lines.push("STARTTLS".to_string());
        }

        if self.session_state.auth_permitted() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }

        let last = lines.len() - 1;
        lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                let separator = if i == last { ' ' } else { '-' };
                format!("{}{separator}{line}", Status::Ok)
            })
            .collect()
    }
}
