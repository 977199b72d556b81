//! Upstream submission.
//!
//! One pooled `lettre` transport is shared by every connection in the
//! process. The envelope sender is always the `bounce+{id}@` address so that
//! bounces can be correlated back to the message.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use lettre::{
    Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    address::Envelope,
    transport::smtp::{
        self, PoolConfig,
        authentication::Credentials,
        client::{Tls, TlsParameters},
        extension::ClientId,
    },
};
use serde::Deserialize;
use smtpflow_common::internal;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum RelaySecurity {
    /// Plaintext, for relays on a trusted network.
    None,
    #[default]
    StartTls,
    /// Implicit TLS from the first byte.
    Tls,
}

impl RelaySecurity {
    const fn default_port(self) -> u16 {
        match self {
            Self::None => 25,
            Self::StartTls => 587,
            Self::Tls => 465,
        }
    }
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_pool_size() -> u32 {
    10
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub security: RelaySecurity,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Domain of the bounce address, also used as the EHLO name.
    pub domain: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("host", &self.host)
            .field("port", &self.port())
            .field("security", &self.security)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("domain", &self.domain)
            .field("timeout_secs", &self.timeout_secs)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl RelayConfig {
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.security.default_port())
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Credentials are only used when both halves are present.
    fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some(Credentials::new(user.clone(), pass.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEnvelope {
    pub sender: String,
    pub recipients: Vec<String>,
}

#[async_trait]
pub trait Relay: Send + Sync + fmt::Debug {
    /// Hand one message to the upstream. No retries.
    async fn submit(&self, envelope: &RelayEnvelope, message: &[u8]) -> Result<(), RelayError>;
}

pub struct SmtpRelay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    endpoint: String,
}

impl fmt::Debug for SmtpRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpRelay")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl SmtpRelay {
    /// Build the pooled transport. No connection is made until first use.
    pub fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        let tls_parameters = || {
            TlsParameters::builder(config.host.clone())
                .dangerous_accept_invalid_certs(config.accept_invalid_certs)
                .build_rustls()
                .map_err(|err| RelayError::Configuration(err.to_string()))
        };

        let tls = match config.security {
            RelaySecurity::None => Tls::None,
            RelaySecurity::StartTls => Tls::Required(tls_parameters()?),
            RelaySecurity::Tls => Tls::Wrapper(tls_parameters()?),
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port())
            .tls(tls)
            .hello_name(ClientId::Domain(config.domain.clone()))
            .timeout(Some(config.timeout()))
            .pool_config(PoolConfig::new().max_size(config.pool_size.max(1)));

        if let Some(credentials) = config.credentials() {
            builder = builder.credentials(credentials);
        }

        Ok(Self {
            transport: builder.build(),
            endpoint: format!("{}:{}", config.host, config.port()),
        })
    }

    /// `host:port` of the upstream.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open a connection and say hello, to surface misconfiguration early.
    pub async fn verify(&self) -> Result<(), RelayError> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(RelayError::Unavailable(format!(
                "{} did not accept a connection",
                self.endpoint
            ))),
            Err(err) => Err(classify(err)),
        }
    }
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn submit(&self, envelope: &RelayEnvelope, message: &[u8]) -> Result<(), RelayError> {
        let sender = parse_address(&envelope.sender)?;
        let recipients = envelope
            .recipients
            .iter()
            .map(|recipient| parse_address(recipient))
            .collect::<Result<Vec<_>, _>>()?;
        let smtp_envelope = Envelope::new(Some(sender), recipients)
            .map_err(|err| RelayError::InvalidAddress(err.to_string()))?;

        let response = self
            .transport
            .send_raw(&smtp_envelope, message)
            .await
            .map_err(classify)?;

        internal!(
            level = DEBUG,
            "Upstream {} accepted message from {} with {}",
            self.endpoint,
            envelope.sender,
            response.code()
        );

        Ok(())
    }
}

fn parse_address(address: &str) -> Result<Address, RelayError> {
    address
        .parse()
        .map_err(|_| RelayError::InvalidAddress(address.to_owned()))
}

fn classify(err: smtp::Error) -> RelayError {
    if err.is_permanent() {
        RelayError::Rejected(err.to_string())
    } else {
        RelayError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(security: RelaySecurity) -> RelayConfig {
        RelayConfig {
            host: "smtp.upstream.test".into(),
            port: None,
            security,
            username: Some("relay-user".into()),
            password: Some("relay-pass".into()),
            accept_invalid_certs: false,
            domain: "bounces.test".into(),
            timeout_secs: default_timeout_secs(),
            pool_size: default_pool_size(),
        }
    }

    #[test]
    fn ports_follow_security_mode() {
        assert_eq!(config(RelaySecurity::None).port(), 25);
        assert_eq!(config(RelaySecurity::StartTls).port(), 587);
        assert_eq!(config(RelaySecurity::Tls).port(), 465);

        let mut custom = config(RelaySecurity::Tls);
        custom.port = Some(2465);
        assert_eq!(custom.port(), 2465);
    }

    #[test]
    fn credentials_need_both_halves() {
        assert!(config(RelaySecurity::None).credentials().is_some());

        let mut missing = config(RelaySecurity::None);
        missing.password = None;
        assert!(missing.credentials().is_none());

        let mut empty = config(RelaySecurity::None);
        empty.username = Some(String::new());
        assert!(empty.credentials().is_none());
    }

    #[test]
    fn debug_redacts_password() {
        let debug = format!("{:?}", config(RelaySecurity::StartTls));
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("relay-pass"));
    }

    #[test]
    fn deserializes_from_ron() {
        let config: RelayConfig = ron::from_str(
            r#"(host: "smtp.upstream.test", security: Tls, domain: "bounces.test", pool_size: 4)"#,
        )
        .unwrap();

        assert_eq!(config.security, RelaySecurity::Tls);
        assert_eq!(config.port(), 465);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.pool_size, 4);
        assert!(config.credentials().is_none());
    }

    #[tokio::test]
    async fn transport_builds_for_every_mode() {
        for security in [RelaySecurity::None, RelaySecurity::StartTls, RelaySecurity::Tls] {
            let relay = SmtpRelay::new(&config(security)).unwrap();
            assert!(format!("{relay:?}").contains("smtp.upstream.test"));
        }
    }
}
