//! Message rows and the delivery event timeline.
//!
//! A message row is created once per accepted submission together with its
//! `sent` event. Engagement and delivery feedback only ever mutate the
//! denormalised flags of an existing row and append further events. Unknown
//! tracking ids are reported as [`Recorded::UnknownTracking`], never as an
//! error.

use std::{fmt, net::IpAddr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smtpflow_common::tracking::TrackingId;

use crate::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Bounced,
    Spam,
}

impl MessageStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Bounced => "bounced",
            Self::Spam => "spam",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "bounced" => Self::Bounced,
            "spam" => Self::Spam,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Sent,
    Opened,
    Clicked,
    Bounced,
    Spam,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Bounced => "bounced",
            Self::Spam => "spam",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "sent" => Self::Sent,
            "opened" => Self::Opened,
            "clicked" => Self::Clicked,
            "bounced" => Self::Bounced,
            "spam" => Self::Spam,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceType {
    #[default]
    Hard,
    Soft,
}

impl BounceType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        }
    }

    /// Webhook providers send free-form classifications; anything that is
    /// not recognisably soft counts as hard.
    #[must_use]
    pub fn classify(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "soft" | "transient" | "temporary" => Self::Soft,
            _ => Self::Hard,
        }
    }
}

/// What the remote party told us about itself when an event came in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

/// Everything needed to create the message row for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub tracking_id: TrackingId,
    pub tenant_id: TenantId,
    pub from_address: String,
    pub from_name: Option<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    pub size: u64,
    pub peer_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub tracking_id: TrackingId,
    pub tenant_id: TenantId,
    pub from_address: String,
    pub from_name: Option<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    pub size: u64,
    pub status: MessageStatus,
    pub peer_ip: Option<IpAddr>,
    pub created_at: DateTime<Utc>,
    pub opened: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub opened_count: u64,
    pub clicked: bool,
    pub clicked_at: Option<DateTime<Utc>>,
    pub click_count: u64,
    pub bounced_at: Option<DateTime<Utc>>,
    pub bounce_type: Option<BounceType>,
    pub bounce_message: Option<String>,
    pub spam_reported_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub(crate) fn new(id: MessageId, message: NewMessage, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            tracking_id: message.tracking_id,
            tenant_id: message.tenant_id,
            from_address: message.from_address,
            from_name: message.from_name,
            recipients: message.recipients,
            subject: message.subject,
            size: message.size,
            status: MessageStatus::Sent,
            peer_ip: message.peer_ip,
            created_at,
            opened: false,
            opened_at: None,
            opened_count: 0,
            clicked: false,
            clicked_at: None,
            click_count: 0,
            bounced_at: None,
            bounce_type: None,
            bounce_message: None,
            spam_reported_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryEvent {
    pub message_id: MessageId,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl DeliveryEvent {
    pub(crate) fn new(
        message_id: MessageId,
        kind: EventKind,
        at: DateTime<Utc>,
        metadata: Option<&ClientMetadata>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            message_id,
            kind,
            at,
            ip: metadata.and_then(|m| m.ip),
            user_agent: metadata.and_then(|m| m.user_agent.clone()),
            payload,
        }
    }
}

/// Outcome of a tracking-side recording call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Recorded,
    /// A terminal event (bounce, spam) was already stamped; nothing changed.
    AlreadyRecorded,
    UnknownTracking,
}

pub(crate) fn click_payload(url: &str, metadata: &ClientMetadata) -> serde_json::Value {
    serde_json::json!({
        "url": url,
        "referer": metadata.referer,
    })
}

pub(crate) fn open_payload(metadata: &ClientMetadata) -> Option<serde_json::Value> {
    metadata
        .referer
        .as_ref()
        .map(|referer| serde_json::json!({ "referer": referer }))
}

pub(crate) fn bounce_payload(bounce_type: BounceType, message: &str) -> serde_json::Value {
    serde_json::json!({
        "bounce_type": bounce_type.as_str(),
        "bounce_message": message,
    })
}

#[async_trait]
pub trait EventRecorder: Send + Sync + fmt::Debug {
    /// Create the message row and its `sent` event in one unit.
    async fn record_sent(&self, message: NewMessage) -> crate::Result<MessageId>;

    /// Stamp `opened_at` on the first call, count every call, append an event.
    async fn record_open(
        &self,
        tracking_id: &TrackingId,
        metadata: &ClientMetadata,
    ) -> crate::Result<Recorded>;

    /// As [`EventRecorder::record_open`] for `clicked_at` / `click_count`.
    async fn record_click(
        &self,
        tracking_id: &TrackingId,
        url: &str,
        metadata: &ClientMetadata,
    ) -> crate::Result<Recorded>;

    /// The first bounce wins; duplicates leave the row and timeline untouched.
    async fn record_bounce(
        &self,
        tracking_id: &TrackingId,
        bounce_type: BounceType,
        message: &str,
    ) -> crate::Result<Recorded>;

    /// The first complaint wins, like bounces.
    async fn record_spam_complaint(&self, tracking_id: &TrackingId) -> crate::Result<Recorded>;

    async fn message(&self, tracking_id: &TrackingId) -> crate::Result<Option<MessageRecord>>;

    /// The timeline of a message, oldest first.
    async fn events(&self, message_id: MessageId) -> crate::Result<Vec<DeliveryEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounce_classification() {
        assert_eq!(BounceType::classify("soft"), BounceType::Soft);
        assert_eq!(BounceType::classify(" Transient "), BounceType::Soft);
        assert_eq!(BounceType::classify("hard"), BounceType::Hard);
        assert_eq!(BounceType::classify("mailbox-full"), BounceType::Hard);
    }

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Bounced,
            MessageStatus::Spam,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("lost"), None);
        assert_eq!(EventKind::parse("clicked"), Some(EventKind::Clicked));
    }

    #[test]
    fn click_payload_carries_url_and_referer() {
        let metadata = ClientMetadata {
            referer: Some("https://webmail.test/".to_string()),
            ..ClientMetadata::default()
        };

        let payload = click_payload("https://example.com/a", &metadata);
        assert_eq!(payload["url"], "https://example.com/a");
        assert_eq!(payload["referer"], "https://webmail.test/");
        assert!(open_payload(&ClientMetadata::default()).is_none());
    }
}
