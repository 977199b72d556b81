//! Who is on the other end of a request.

use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, header, request::Parts},
};
use smtpflow_store::ClientMetadata;

use crate::AppState;

/// Client address, user agent and referer of the current request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo(pub ClientMetadata);

impl FromRequestParts<AppState> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Ok(Self(metadata(&parts.headers, peer, state.trust_proxy)))
    }
}

#[must_use]
pub fn metadata(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy: bool) -> ClientMetadata {
    ClientMetadata {
        ip: client_ip(headers, peer, trust_proxy),
        user_agent: header_value(headers, header::USER_AGENT.as_str()),
        referer: header_value(headers, header::REFERER.as_str()),
    }
}

/// The socket peer, or the first `X-Forwarded-For` entry behind a trusted
/// proxy.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy: bool) -> Option<IpAddr> {
    if trust_proxy
        && let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse().ok())
    {
        return Some(forwarded);
    }

    peer
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}
