//! Open pixel, click redirect and the bounce/spam webhooks.
//!
//! None of these wait for the recorder: the event is handed to the
//! [`EventDispatcher`](crate::EventDispatcher) and the response goes out
//! straight away.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use smtpflow_common::tracking::TrackingId;
use smtpflow_store::BounceType;
use subtle::ConstantTimeEq;

use crate::{AppState, ApiError, client::ClientInfo, dispatcher::TrackingEvent};

/// A transparent 1x1 GIF.
pub const PIXEL: [u8; 42] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x44, 0x00, 0x3b,
];

const SECRET_HEADER: &str = "x-bounce-secret";

/// `GET /t/open/{tracking_id}`
pub async fn open(
    State(state): State<AppState>,
    Path(tracking_id): Path<String>,
    ClientInfo(metadata): ClientInfo,
) -> Response {
    if let Ok(tracking_id) = tracking_id.parse::<TrackingId>() {
        state.dispatcher.dispatch(TrackingEvent::Open {
            tracking_id,
            metadata,
        });
    }

    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (
                header::CACHE_CONTROL,
                "no-store, no-cache, must-revalidate, proxy-revalidate",
            ),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        PIXEL.as_slice(),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct ClickQuery {
    url: Option<String>,
}

/// `GET /t/click/{tracking_id}?url=...`
///
/// The query string is percent-decoded once by the extractor, which undoes
/// the encoding applied when the link was rewritten.
pub async fn click(
    State(state): State<AppState>,
    Path(tracking_id): Path<String>,
    Query(query): Query<ClickQuery>,
    ClientInfo(metadata): ClientInfo,
) -> Response {
    let Some(url) = query.url.filter(|url| !url.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing url").into_response();
    };

    let Ok(location) = HeaderValue::from_str(&url) else {
        return (StatusCode::BAD_REQUEST, "Invalid url").into_response();
    };

    if let Ok(tracking_id) = tracking_id.parse::<TrackingId>() {
        state.dispatcher.dispatch(TrackingEvent::Click {
            tracking_id,
            url,
            metadata,
        });
    }

    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

/// Body of the bounce and spam webhooks.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    tracking_id: Option<String>,
    /// `bounce+{tracking_id}@...`, for callers that only have the envelope.
    #[serde(default)]
    bounce_address: Option<String>,
    #[serde(default)]
    bounce_type: Option<String>,
    #[serde(default)]
    bounce_message: Option<String>,
}

impl WebhookPayload {
    fn tracking_id(&self) -> Option<TrackingId> {
        self.tracking_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .and_then(|id| id.parse().ok())
            .or_else(|| {
                self.bounce_address
                    .as_deref()
                    .and_then(TrackingId::from_bounce_address)
            })
    }
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let (Some(expected), Some(given)) = (state.bounce_secret.as_deref(), headers.get(SECRET_HEADER))
    else {
        return false;
    };

    bool::from(given.as_bytes().ct_eq(expected.as_bytes()))
}

/// Check the secret before looking at the body, so an unauthorised caller
/// learns nothing about the payload format.
fn accept_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(TrackingId, WebhookPayload), ApiError> {
    if !authorized(state, headers) {
        tracing::warn!("Webhook call with a missing or wrong secret");
        return Err(ApiError::Unauthorized);
    }

    let payload: WebhookPayload = if body.is_empty() {
        WebhookPayload::default()
    } else {
        serde_json::from_slice(body).map_err(|_| ApiError::MissingTrackingId)?
    };

    let tracking_id = payload.tracking_id().ok_or(ApiError::MissingTrackingId)?;
    Ok((tracking_id, payload))
}

fn success() -> Response {
    Json(serde_json::json!({ "success": true })).into_response()
}

/// `POST /t/bounce`
pub async fn bounce(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match accept_webhook(&state, &headers, &body) {
        Ok((tracking_id, payload)) => {
            state.dispatcher.dispatch(TrackingEvent::Bounce {
                tracking_id,
                bounce_type: payload
                    .bounce_type
                    .as_deref()
                    .map_or(BounceType::Hard, BounceType::classify),
                message: payload.bounce_message.unwrap_or_default(),
            });
            success()
        }
        Err(err) => err.into_response(),
    }
}

/// `POST /t/spam`
pub async fn spam(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match accept_webhook(&state, &headers, &body) {
        Ok((tracking_id, _)) => {
            state.dispatcher.dispatch(TrackingEvent::Spam { tracking_id });
            success()
        }
        Err(err) => err.into_response(),
    }
}
