use std::borrow::Cow;

use smtpflow_common::{
    incoming, internal, status::Status, tracing, traits::fsm::FiniteStateMachine,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{State, command::Command, error::SessionError, state};

use super::{Context, DataProgress, Session};

/// Longest command line accepted, CRLF included. Leaves room for AUTH PLAIN
/// initial responses, which RFC 4954 allows beyond the 512 octets of RFC 5321.
const MAX_COMMAND_LINE: usize = 4096;

/// Message data is read a line at a time, in pieces of at most this size.
const DATA_CHUNK: usize = 8192;

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// Receive and process the next line from the client
    ///
    /// Returns `Ok(true)` once the client has closed the connection.
    ///
    /// # Errors
    /// Returns `SessionError` on an I/O failure.
    #[tracing::instrument(level = "trace", skip_all, ret)]
    pub(super) async fn receive(&mut self) -> Result<bool, SessionError> {
        let reading = matches!(self.context.state, State::Reading(_));
        let limit = if reading { DATA_CHUNK } else { MAX_COMMAND_LINE };

        let mut line = Vec::with_capacity(256);
        if self.connection.read_line(&mut line, limit).await? == 0 {
            // Reading 0 bytes means the other side has closed the
            // connection or is done writing, then so are we.
            return Ok(true);
        }

        if reading {
            self.handle_data_reception(&line);
        } else {
            self.handle_command_reception(&line);
        }

        Ok(false)
    }

    fn refuse(&mut self, status: Status, message: impl Into<Cow<'static, str>>) {
        self.context = Context {
            state: State::Refused(state::Refused {
                status,
                message: message.into(),
            }),
            ..Context::default()
        };
    }

    /// Handle reception of message data (during DATA state)
    ///
    /// Each call sees one line, or one piece of a line longer than
    /// [`DATA_CHUNK`]. Transparency (RFC 5321 Section 4.5.2) only applies to
    /// the start of a line.
    fn handle_data_reception(&mut self, chunk: &[u8]) {
        let at_line_start = self.data.line_start;
        self.data.line_start = chunk.ends_with(b"\n");

        if at_line_start && (chunk == b".\r\n" || chunk == b".\n") {
            self.finish_data();
            return;
        }

        if self.data.overflow {
            return;
        }

        let content = if at_line_start && chunk.first() == Some(&b'.') {
            &chunk[1..]
        } else {
            chunk
        };

        let total = self.context.message.len().saturating_add(content.len());
        if self.session_state.exceeds_size(total) {
            internal!(
                level = WARN,
                "Message exceeds {} bytes, discarding the rest of the data",
                self.session_state.max_message_size
            );
            self.data.overflow = true;
            self.context.message = Vec::new();
            return;
        }

        self.context.message.extend_from_slice(content);
    }

    fn finish_data(&mut self) {
        let progress = std::mem::take(&mut self.data);

        if progress.overflow {
            self.session_state.reset_transaction();
            self.refuse(
                Status::ExceededStorage,
                "5.3.4 Message size exceeds fixed maximum message size",
            );
        } else {
            let message = std::mem::take(&mut self.context.message);
            self.context = Context {
                state: State::PostDot(state::PostDot),
                message,
                ..Context::default()
            };
        }
    }

    /// Start collecting message data after the `354` reply.
    pub(super) fn begin_data(&mut self) {
        self.context.state = State::Reading(state::Reading);
        self.data = DataProgress::start();

        // Pre-allocate based on the SIZE parameter, within the limit
        if let Some(declared) = self
            .session_state
            .transaction
            .as_ref()
            .and_then(|envelope| envelope.declared_size)
            && self.session_state.max_message_size > 0
            && !self.session_state.exceeds_size(declared)
        {
            self.context.message.reserve(declared);
        }
    }

    /// Handle reception of SMTP commands
    fn handle_command_reception(&mut self, line: &[u8]) {
        let complete = line.ends_with(b"\n");

        if self.context.skip_line {
            if complete {
                self.refuse(Status::SyntaxError, "5.5.2 Line too long");
            }
            return;
        }

        if !complete && line.len() >= MAX_COMMAND_LINE {
            internal!(level = DEBUG, "Command line exceeds {MAX_COMMAND_LINE} bytes");
            self.context.skip_line = true;
            return;
        }

        let command = if matches!(self.context.state, State::AuthChallenge(_)) {
            Command::AuthResponse(
                String::from_utf8_lossy(line)
                    .trim_end_matches(['\r', '\n'])
                    .to_string(),
            )
        } else {
            Command::try_from(line).unwrap_or_else(|e| e)
        };

        incoming!("{command}");

        let state = std::mem::take(&mut self.context.state);
        self.context = Context {
            state: state.transition(command, &mut self.session_state),
            ..Context::default()
        };

        tracing::debug!("Transitioned to {}", self.context.state);
    }
}
