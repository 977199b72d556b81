//! Timeouts applied by the SMTP front door while receiving submissions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Server-side SMTP timeouts, in seconds.
///
/// The defaults follow the RFC 5321 recommendations for receiving servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// Waiting for the next command (EHLO, AUTH, MAIL FROM, RCPT TO, ...).
    #[serde(default = "defaults::command_secs")]
    pub command_secs: u64,

    /// Waiting for each line of message data after `354`.
    #[serde(default = "defaults::data_block_secs")]
    pub data_block_secs: u64,

    /// Upper bound on the whole DATA phase, from `354` to the final dot.
    #[serde(default = "defaults::data_termination_secs")]
    pub data_termination_secs: u64,

    /// Maximum lifetime of a single connection.
    #[serde(default = "defaults::connection_secs")]
    pub connection_secs: u64,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: defaults::command_secs(),
            data_block_secs: defaults::data_block_secs(),
            data_termination_secs: defaults::data_termination_secs(),
            connection_secs: defaults::connection_secs(),
        }
    }
}

impl ServerTimeouts {
    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub const fn data_block(&self) -> Duration {
        Duration::from_secs(self.data_block_secs)
    }

    #[must_use]
    pub const fn data_termination(&self) -> Duration {
        Duration::from_secs(self.data_termination_secs)
    }

    #[must_use]
    pub const fn connection(&self) -> Duration {
        Duration::from_secs(self.connection_secs)
    }
}

mod defaults {
    pub const fn command_secs() -> u64 {
        300 // 5 minutes
    }

    pub const fn data_block_secs() -> u64 {
        180 // 3 minutes
    }

    pub const fn data_termination_secs() -> u64 {
        600 // 10 minutes
    }

    pub const fn connection_secs() -> u64 {
        1800 // 30 minutes
    }
}
