//! Outbound side of smtpflow.
//!
//! Everything that happens to a message between a front door accepting it
//! and the sent record being written:
//! - parsing the submitted message ([`message`])
//! - inserting open and click tracking into HTML bodies ([`rewrite`])
//! - rebuilding the outbound MIME message ([`compose`])
//! - handing it to the upstream relay ([`relay`])
//! - orchestrating quota admission and recording ([`submission`])

pub mod compose;
mod error;
pub mod message;
pub mod relay;
pub mod rewrite;
pub mod submission;

pub use compose::{ComposeSettings, Composed};
pub use error::{ComposeError, RelayError, SubmissionError};
pub use message::{Attachment, Contact, OutboundMessage};
pub use relay::{Relay, RelayConfig, RelayEnvelope, RelaySecurity, SmtpRelay};
pub use rewrite::rewrite;
pub use submission::{Receipt, Submission, SubmissionSettings, Submitter};
