//! HTTP front door configuration

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the tracking endpoints and the send API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpConfig {
    /// When disabled, the HTTP server will not start.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Address to bind the HTTP server
    ///
    /// Common values:
    /// - `0.0.0.0:3000` (IPv4 any address)
    /// - `[::]:3000` (IPv6 any address)
    /// - `127.0.0.1:3000` (localhost only, behind a reverse proxy)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Public base of the tracking URLs written into outbound messages.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Shared secret expected in `x-bounce-secret` on the bounce and spam
    /// webhooks. Without one every webhook call is rejected.
    #[serde(default)]
    pub bounce_secret: Option<String>,

    /// Take the client address from the first `X-Forwarded-For` entry.
    #[serde(default)]
    pub trust_proxy: bool,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Tracking events waiting to be recorded before new ones are dropped.
    #[serde(default = "default_dispatcher_capacity")]
    pub dispatcher_capacity: usize,
}

impl HttpConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

const fn default_enabled() -> bool {
    true
}

fn default_listen_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

const fn default_dispatcher_capacity() -> usize {
    1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen_address: default_listen_address(),
            base_url: default_base_url(),
            bounce_secret: None,
            trust_proxy: false,
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            dispatcher_capacity: default_dispatcher_capacity(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: HttpConfig = ron::from_str("()").unwrap();
        assert_eq!(config, HttpConfig::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.bounce_secret.is_none());
    }

    #[test]
    fn partial_config() {
        let config: HttpConfig = ron::from_str(
            r#"(listen_address: "127.0.0.1:8080", bounce_secret: Some("hunter2"), trust_proxy: true)"#,
        )
        .unwrap();

        assert_eq!(config.listen_address, "127.0.0.1:8080");
        assert_eq!(config.bounce_secret.as_deref(), Some("hunter2"));
        assert!(config.trust_proxy);
        assert_eq!(config.dispatcher_capacity, 1024);
    }
}
