use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use ahash::AHashMap;
use mailparse::MailAddr;

/// ESMTP parameters for MAIL FROM command (RFC 5321 Section 3.3).
///
/// Stores generic key-value parameters from the MAIL FROM command. The
/// relay only acts on `SIZE` (RFC 1870); `BODY` is accepted because
/// `8BITMIME` is advertised, everything else is carried along untouched.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct MailParameters {
    params: AHashMap<Cow<'static, str>, Option<String>>,
}

/// Normalize a parameter key, borrowing for the parameters we know about.
fn normalize_key(key: &str) -> Cow<'static, str> {
    let upper = key.to_ascii_uppercase();

    match upper.as_str() {
        "SIZE" => Cow::Borrowed("SIZE"),
        "BODY" => Cow::Borrowed("BODY"),
        "AUTH" => Cow::Borrowed("AUTH"),
        "RET" => Cow::Borrowed("RET"),
        "ENVID" => Cow::Borrowed("ENVID"),
        "SMTPUTF8" => Cow::Borrowed("SMTPUTF8"),
        _ => Cow::Owned(upper),
    }
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses parameter tokens in the form `KEY=VALUE` or `FLAG`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A parameter appears multiple times
    /// - SIZE parameter has an invalid value (non-numeric or zero)
    pub fn from_params_str(params_str: &str) -> Result<Self, String> {
        let mut params = Self::new();

        for token in params_str.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .map_or((token, None), |(key, value)| (key, Some(value)));
            let key = normalize_key(key);

            if params.params.contains_key(&key) {
                return Err(format!("Duplicate parameter '{key}' not allowed"));
            }

            if key == "SIZE" {
                match value.map(str::parse::<usize>) {
                    Some(Ok(0)) => return Err(String::from("SIZE=0 is not allowed")),
                    Some(Ok(_)) => {}
                    _ => return Err(format!("Invalid SIZE value: {}", value.unwrap_or(""))),
                }
            }

            params.params.insert(key, value.map(str::to_string));
        }

        Ok(params)
    }

    /// Gets a parameter value by key (case-insensitive).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(normalize_key(key).as_ref())?.as_deref()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(normalize_key(key).as_ref())
    }

    /// The declared message size, if the client sent one.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.params {
            if !first {
                f.write_str(" ")?;
            }
            first = false;

            match v {
                None => f.write_str(k)?,
                Some(val) => write!(f, "{k}={val}")?,
            }
        }
        Ok(())
    }
}

#[derive(PartialEq, PartialOrd, Eq, Hash, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    StartTls,
    /// `AUTH <mechanism> [initial-response]`. The mechanism is kept as sent,
    /// the state machine decides whether it is supported.
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// A line sent in answer to a `334` challenge.
    AuthResponse(String),
    /// `None` is the null reverse-path `<>` from
    /// [RFC-5321](https://www.ietf.org/rfc/rfc5321.txt).
    MailFrom(Option<String>, MailParameters),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    /// A verb we know but do not offer, answered with 502.
    NotImplemented(String),
    /// A known verb with unusable arguments, answered with 501.
    Invalid(String),
    /// Anything else, answered with 500.
    Unrecognized(String),
}

impl Command {
    /// Extract the SIZE parameter from a MAIL FROM command, if present.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::MailFrom(_, params) => params.size(),
            _ => None,
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(variant @ (HeloVariant::Ehlo(id) | HeloVariant::Helo(id))) => {
                write!(fmt, "{variant} {id}")
            }
            Self::MailFrom(sender, params) => {
                let sender = sender.as_deref().unwrap_or_default();
                if params.is_empty() {
                    write!(fmt, "MAIL FROM:<{sender}>")
                } else {
                    write!(fmt, "MAIL FROM:<{sender}> {params}")
                }
            }
            Self::RcptTo(rcpt) => write!(fmt, "RCPT TO:<{rcpt}>"),
            Self::Auth { mechanism, initial } => {
                if initial.is_some() {
                    write!(fmt, "AUTH {mechanism} <redacted>")
                } else {
                    write!(fmt, "AUTH {mechanism}")
                }
            }
            Self::AuthResponse(_) => fmt.write_str("<redacted>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::NotImplemented(s) | Self::Invalid(s) | Self::Unrecognized(s) => fmt.write_str(s),
        }
    }
}

/// Parse a reverse- or forward-path, with or without angle brackets.
///
/// `Ok(None)` is the null path `<>`.
fn parse_path(path: &str) -> Result<Option<String>, String> {
    let path = path.trim();

    if path == "<>" {
        return Ok(None);
    }

    let inner = path
        .strip_prefix('<')
        .and_then(|path| path.strip_suffix('>'))
        .unwrap_or(path);

    if inner.is_empty() {
        return Err(format!("Invalid address {path}"));
    }

    let addresses = mailparse::addrparse(inner).map_err(|err| err.to_string())?;

    match addresses.first() {
        Some(MailAddr::Single(info)) if addresses.len() == 1 && info.addr.contains('@') => {
            Ok(Some(info.addr.clone()))
        }
        _ => Err(format!("Invalid address {path}")),
    }
}

/// Verbs from RFC 5321 the relay recognises but does not implement.
const NOT_IMPLEMENTED: [&str; 6] = ["HELP", "VRFY", "EXPN", "TURN", "ETRN", "BDAT"];

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();
        let (verb, argument) = trimmed
            .split_once(char::is_whitespace)
            .map_or((trimmed, ""), |(verb, rest)| (verb, rest.trim()));

        if trimmed.len() >= 10 && trimmed[..10].eq_ignore_ascii_case("MAIL FROM:") {
            // Format: MAIL FROM:<addr> [param1=value1] [param2=value2] ...
            let rest = trimmed[10..].trim();
            let (addr, params) = rest
                .split_once(char::is_whitespace)
                .map_or((rest, ""), |(addr, params)| (addr, params));

            let mail_params = MailParameters::from_params_str(params).map_err(Self::Invalid)?;
            let sender = parse_path(addr).map_err(Self::Invalid)?;

            Ok(Self::MailFrom(sender, mail_params))
        } else if trimmed.len() >= 8 && trimmed[..8].eq_ignore_ascii_case("RCPT TO:") {
            let rest = trimmed[8..].trim();
            let addr = rest.split_whitespace().next().unwrap_or_default();

            match parse_path(addr) {
                Ok(Some(recipient)) => Ok(Self::RcptTo(recipient)),
                Ok(None) => Err(Self::Invalid(String::from("Null recipient not allowed"))),
                Err(err) => Err(Self::Invalid(err)),
            }
        } else if verb.eq_ignore_ascii_case("EHLO") || verb.eq_ignore_ascii_case("HELO") {
            if argument.is_empty() {
                Err(Self::Invalid(format!("Expected hostname in {trimmed}")))
            } else if verb.eq_ignore_ascii_case("EHLO") {
                Ok(Self::Helo(HeloVariant::Ehlo(argument.to_string())))
            } else {
                Ok(Self::Helo(HeloVariant::Helo(argument.to_string())))
            }
        } else if verb.eq_ignore_ascii_case("AUTH") {
            let mut parts = argument.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(mechanism), initial, None) => Ok(Self::Auth {
                    mechanism: mechanism.to_ascii_uppercase(),
                    initial: initial.map(str::to_string),
                }),
                _ => Err(Self::Invalid(String::from("Expected AUTH mechanism"))),
            }
        } else if verb.eq_ignore_ascii_case("MAIL") || verb.eq_ignore_ascii_case("RCPT") {
            Err(Self::Invalid(format!(
                "Syntax error in {} parameters",
                verb.to_ascii_uppercase()
            )))
        } else if !argument.is_empty() && !verb.eq_ignore_ascii_case("NOOP") {
            if NOT_IMPLEMENTED.iter().any(|v| verb.eq_ignore_ascii_case(v)) {
                Err(Self::NotImplemented(trimmed.to_owned()))
            } else if ["DATA", "QUIT", "RSET", "STARTTLS"]
                .iter()
                .any(|v| verb.eq_ignore_ascii_case(v))
            {
                Err(Self::Invalid(format!("{verb} does not take arguments")))
            } else {
                Err(Self::Unrecognized(trimmed.to_owned()))
            }
        } else if verb.eq_ignore_ascii_case("DATA") {
            Ok(Self::Data)
        } else if verb.eq_ignore_ascii_case("QUIT") {
            Ok(Self::Quit)
        } else if verb.eq_ignore_ascii_case("RSET") {
            Ok(Self::Rset)
        } else if verb.eq_ignore_ascii_case("NOOP") {
            Ok(Self::Noop)
        } else if verb.eq_ignore_ascii_case("STARTTLS") {
            Ok(Self::StartTls)
        } else if NOT_IMPLEMENTED.iter().any(|v| verb.eq_ignore_ascii_case(v)) {
            Err(Self::NotImplemented(trimmed.to_owned()))
        } else {
            Err(Self::Unrecognized(trimmed.to_owned()))
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Unrecognized("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}
