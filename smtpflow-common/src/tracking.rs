//! Tracking identifiers.
//!
//! A tracking id is generated once per accepted submission and embedded in the
//! outbound message: in the `X-SMTPFlow-ID` header, in the bounce envelope
//! sender and in every open/click URL. Later events are correlated by it.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const BOUNCE_PREFIX: &str = "bounce+";
const MAX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidTrackingId {
    #[error("Tracking id is empty")]
    Empty,

    #[error("Tracking id is longer than {MAX_LEN} characters")]
    TooLong,

    #[error("Tracking id contains an invalid character {0:?}")]
    InvalidCharacter(char),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrackingId(String);

impl TrackingId {
    /// A fresh, never reused id: a v4 UUID in its 32 character hex form.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The envelope sender used when relaying, `bounce+{id}@{domain}`.
    #[must_use]
    pub fn bounce_address(&self, domain: &str) -> String {
        format!("{BOUNCE_PREFIX}{}@{domain}", self.0)
    }

    /// Recover the id from a bounce envelope address, with or without angle
    /// brackets.
    #[must_use]
    pub fn from_bounce_address(address: &str) -> Option<Self> {
        let address = address
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>');
        let (local, _domain) = address.rsplit_once('@')?;

        if local.len() <= BOUNCE_PREFIX.len()
            || !local[..BOUNCE_PREFIX.len()].eq_ignore_ascii_case(BOUNCE_PREFIX)
        {
            return None;
        }

        local[BOUNCE_PREFIX.len()..].parse().ok()
    }
}

impl FromStr for TrackingId {
    type Err = InvalidTrackingId;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Err(InvalidTrackingId::Empty);
        }

        if value.len() > MAX_LEN {
            return Err(InvalidTrackingId::TooLong);
        }

        if let Some(ch) = value
            .chars()
            .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_'))
        {
            return Err(InvalidTrackingId::InvalidCharacter(ch));
        }

        Ok(Self(value.to_owned()))
    }
}

impl TryFrom<String> for TrackingId {
    type Error = InvalidTrackingId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TrackingId> for String {
    fn from(value: TrackingId) -> Self {
        value.0
    }
}

impl AsRef<str> for TrackingId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
