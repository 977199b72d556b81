//! Bearer authenticated HTTP API: send, usage and message status.

use axum::{
    Json,
    extract::{FromRequestParts, Path, State, rejection::JsonRejection},
    http::{header, request::Parts},
};
use serde::Deserialize;
use serde_json::{Value, json};
use smtpflow_common::tracking::TrackingId;
use smtpflow_delivery::{Contact, OutboundMessage, Submission};
use smtpflow_store::{AuthError, EventRecorder, TenantIdentity};

use crate::{
    AppState,
    client::ClientInfo,
    error::{ApiError, FieldError},
};

/// The tenant owning the bearer token of the request.
#[derive(Debug, Clone)]
pub struct Authenticated(pub TenantIdentity);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized)?;

        match state.credentials.resolve_bearer(token).await {
            Ok(tenant) => Ok(Self(tenant)),
            Err(AuthError::Rejected(reason)) => {
                tracing::debug!(?reason, "Bearer token rejected");
                Err(ApiError::Unauthorized)
            }
            Err(AuthError::Store(err)) => Err(ApiError::Store(err)),
        }
    }
}

/// `to` may be a single address or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(address) => vec![address],
            Self::Many(addresses) => addresses,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub to: Option<Recipients>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// A bare `local@domain` address.
fn is_address(address: &str) -> bool {
    address.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty()
            && !domain.is_empty()
            && !domain.contains('@')
            && !address
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | ',' | '"'))
    })
}

impl SendRequest {
    /// Validate every field, reporting all problems at once.
    pub fn into_message(
        self,
        default_from: &str,
    ) -> Result<(Vec<String>, OutboundMessage), Vec<FieldError>> {
        let mut errors = Vec::new();

        let recipients: Vec<String> = self
            .to
            .map(Recipients::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(|address| address.trim().to_string())
            .filter(|address| !address.is_empty())
            .collect();

        if recipients.is_empty() {
            errors.push(FieldError::new("to", "At least one recipient is required"));
        }
        for address in recipients.iter().filter(|address| !is_address(address)) {
            errors.push(FieldError::new("to", format!("Invalid address {address:?}")));
        }

        let subject = self.subject.unwrap_or_default();
        if subject.trim().is_empty() {
            errors.push(FieldError::new("subject", "Subject is required"));
        }

        if let Some(from) = self.from.as_deref()
            && !is_address(from.trim())
        {
            errors.push(FieldError::new("from", format!("Invalid address {from:?}")));
        }

        if let Some(reply_to) = self.reply_to.as_deref()
            && !is_address(reply_to.trim())
        {
            errors.push(FieldError::new(
                "reply_to",
                format!("Invalid address {reply_to:?}"),
            ));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let from = self
            .from
            .map_or_else(|| default_from.to_string(), |from| from.trim().to_string());

        let message = OutboundMessage {
            from: Some(Contact::new(from).with_name(self.from_name)),
            to: recipients.iter().map(Contact::new).collect(),
            reply_to: self.reply_to.map(|reply_to| Contact::new(reply_to.trim())),
            subject,
            text: self.text.filter(|text| !text.is_empty()),
            html: self.html.filter(|html| !html.is_empty()),
            ..OutboundMessage::default()
        };

        Ok((recipients, message))
    }
}

/// `POST /api/send`
pub async fn send(
    State(state): State<AppState>,
    Authenticated(tenant): Authenticated,
    ClientInfo(client): ClientInfo,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        ApiError::Validation(vec![FieldError::new("body", rejection.body_text())])
    })?;

    let size = request.html.as_ref().map_or(0, String::len) + request.text.as_ref().map_or(0, String::len);
    let default_from = format!(
        "{}@{}",
        tenant.username,
        state.submitter.settings().sender_domain
    );
    let (recipients, message) = request
        .into_message(&default_from)
        .map_err(ApiError::Validation)?;

    let receipt = state
        .submitter
        .submit(Submission {
            tenant,
            sender: None,
            recipients,
            message,
            size: u64::try_from(size).unwrap_or(u64::MAX),
            peer: client.ip,
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "email_id": receipt.message_id,
        "tracking_id": receipt.tracking_id,
        "sent_at": receipt.sent_at,
    })))
}

/// `GET /api/usage`
pub async fn usage(
    State(state): State<AppState>,
    Authenticated(tenant): Authenticated,
) -> Result<Json<Value>, ApiError> {
    let quota = state.submitter.quota();
    let (period, used) = quota.consumed(tenant.id).await?;

    Ok(Json(json!({
        "period": period.as_str(),
        "used": used,
        "limit": quota.effective_limit(tenant.limits.monthly),
        "daily_limit": tenant.limits.daily,
    })))
}

/// `GET /api/messages/{tracking_id}`
///
/// Messages of other tenants are reported as not found.
pub async fn message(
    State(state): State<AppState>,
    Authenticated(tenant): Authenticated,
    Path(tracking_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tracking_id = tracking_id
        .parse::<TrackingId>()
        .map_err(|_| ApiError::NotFound)?;

    let record = state
        .recorder
        .message(&tracking_id)
        .await?
        .filter(|record| record.tenant_id == tenant.id)
        .ok_or(ApiError::NotFound)?;
    let events = state.recorder.events(record.id).await?;

    Ok(Json(json!({
        "message": record,
        "events": events,
    })))
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn addresses() {
        assert!(is_address("bob@example.test"));
        assert!(!is_address("bob"));
        assert!(!is_address("@example.test"));
        assert!(!is_address("bob@"));
        assert!(!is_address("bob smith@example.test"));
        assert!(!is_address("a@b@c"));
    }

    #[test]
    fn single_recipient_and_default_from() {
        let request: SendRequest = serde_json::from_value(json!({
            "to": "bob@example.test",
            "subject": "Hi",
            "from_name": "Acme",
            "html": "<p>hello</p>",
        }))
        .unwrap();

        let (recipients, message) = request.into_message("acme@relay.test").unwrap();

        assert_eq!(recipients, ["bob@example.test"]);
        assert_eq!(
            message.from,
            Some(Contact::new("acme@relay.test").with_name(Some("Acme".into())))
        );
        assert_eq!(message.text, None);
        assert_eq!(message.html.as_deref(), Some("<p>hello</p>"));
    }

    #[test]
    fn every_problem_is_reported() {
        let request: SendRequest = serde_json::from_value(json!({
            "to": ["bob@example.test", "not-an-address"],
            "from": "nobody",
        }))
        .unwrap();

        let errors = request.into_message("acme@relay.test").unwrap_err();
        let fields: Vec<_> = errors.iter().map(|error| error.field).collect();

        assert_eq!(fields, ["to", "subject", "from"]);
    }
}
