//! SASL PLAIN (RFC 4616) and LOGIN decoding for `AUTH` (RFC 4954).
//!
//! Only decoding lives here. Whether a mechanism may be used on the current
//! connection is decided by the state machine, and the credentials are
//! checked by the transaction handler.

use core::fmt;
use std::str::FromStr;

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;

/// `Username:`, base64 encoded.
pub const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";

/// `Password:`, base64 encoded.
pub const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
}

impl FromStr for Mechanism {
    type Err = SaslError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("PLAIN") {
            Ok(Self::Plain)
        } else if value.eq_ignore_ascii_case("LOGIN") {
            Ok(Self::Login)
        } else {
            Err(SaslError::UnknownMechanism)
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SaslError {
    #[error("Unrecognized authentication type")]
    UnknownMechanism,

    #[error("Cannot decode response")]
    Encoding,

    #[error("Malformed credentials")]
    Malformed,

    /// The client answered a challenge with `*`.
    #[error("Authentication cancelled")]
    Cancelled,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Decode one base64 client response. `=` is the empty initial response.
pub fn decode_response(response: &str) -> Result<String, SaslError> {
    let response = response.trim();

    if response == "*" {
        return Err(SaslError::Cancelled);
    }

    if response == "=" {
        return Ok(String::new());
    }

    let bytes = STANDARD
        .decode(response)
        .map_err(|_| SaslError::Encoding)?;

    String::from_utf8(bytes).map_err(|_| SaslError::Encoding)
}

/// Decode a PLAIN response, `[authzid] NUL authcid NUL passwd`.
///
/// The authorization identity is ignored; a tenant can only act as itself.
pub fn decode_plain(response: &str) -> Result<Credentials, SaslError> {
    let decoded = decode_response(response)?;
    let mut parts = decoded.split('\0');

    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_authzid), Some(username), Some(secret), None) if !username.is_empty() => {
            Ok(Credentials {
                username: username.to_string(),
                secret: secret.to_string(),
            })
        }
        _ => Err(SaslError::Malformed),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode(value: &str) -> String {
        STANDARD.encode(value)
    }

    #[test]
    fn prompts_decode_to_labels() {
        assert_eq!(decode_response(USERNAME_PROMPT).unwrap(), "Username:");
        assert_eq!(decode_response(PASSWORD_PROMPT).unwrap(), "Password:");
    }

    #[test]
    fn plain_with_and_without_authzid() {
        let expected = Credentials {
            username: "acme".to_string(),
            secret: "hunter2".to_string(),
        };

        assert_eq!(decode_plain(&encode("\0acme\0hunter2")).unwrap(), expected);
        assert_eq!(
            decode_plain(&encode("admin\0acme\0hunter2")).unwrap(),
            expected
        );
    }

    #[test]
    fn plain_rejects_malformed_input() {
        assert_eq!(decode_plain("not base64!"), Err(SaslError::Encoding));
        assert_eq!(decode_plain(&encode("acme:hunter2")), Err(SaslError::Malformed));
        assert_eq!(decode_plain(&encode("\0\0hunter2")), Err(SaslError::Malformed));
        assert_eq!(decode_plain("="), Err(SaslError::Malformed));
        assert_eq!(decode_plain("*"), Err(SaslError::Cancelled));
    }

    #[test]
    fn mechanism_names() {
        assert_eq!("plain".parse::<Mechanism>(), Ok(Mechanism::Plain));
        assert_eq!("LOGIN".parse::<Mechanism>(), Ok(Mechanism::Login));
        assert_eq!(
            "CRAM-MD5".parse::<Mechanism>(),
            Err(SaslError::UnknownMechanism)
        );
    }

    #[test]
    fn debug_redacts_secret() {
        let credentials = decode_plain(&encode("\0acme\0hunter2")).unwrap();
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }
}
