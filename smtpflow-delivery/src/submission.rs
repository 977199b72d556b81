//! One message through the pipeline: rewrite, admit, relay, record.
//!
//! Shared by the SMTP and HTTP front doors. Quota is consumed before the
//! relay call and never refunded; the sent record is written last.

use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use smtpflow_common::tracking::TrackingId;
use smtpflow_store::{Admission, EventRecorder, MessageId, NewMessage, Quota, TenantIdentity};
use tracing::{error, info, warn};

use crate::{
    compose::{self, ComposeSettings},
    error::{RelayError, SubmissionError},
    message::{Contact, OutboundMessage},
    relay::Relay,
    rewrite::rewrite,
};

#[derive(Debug, Clone)]
pub struct SubmissionSettings {
    pub compose: ComposeSettings,
    /// `{username}@{sender_domain}` is the From of last resort.
    pub sender_domain: String,
    pub relay_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub tenant: TenantIdentity,
    /// The envelope sender given by the client, if any.
    pub sender: Option<String>,
    /// Envelope recipients. Empty means "use the To and Cc headers".
    pub recipients: Vec<String>,
    pub message: OutboundMessage,
    pub size: u64,
    pub peer: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tracking_id: TrackingId,
    /// `None` when the message was relayed but the sent record failed.
    pub message_id: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
    /// Messages consumed this period, including this one.
    pub quota_used: u64,
}

#[derive(Debug, Clone)]
pub struct Submitter {
    quota: Quota,
    recorder: Arc<dyn EventRecorder>,
    relay: Arc<dyn Relay>,
    settings: Arc<SubmissionSettings>,
}

impl Submitter {
    pub fn new(
        quota: Quota,
        recorder: Arc<dyn EventRecorder>,
        relay: Arc<dyn Relay>,
        settings: SubmissionSettings,
    ) -> Self {
        Self {
            quota,
            recorder,
            relay,
            settings: Arc::new(settings),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SubmissionSettings {
        &self.settings
    }

    #[must_use]
    pub const fn quota(&self) -> &Quota {
        &self.quota
    }

    /// The visible From: the message's own From header, then the envelope
    /// sender, then an address derived from the tenant.
    #[must_use]
    pub fn visible_sender(
        &self,
        tenant: &TenantIdentity,
        sender: Option<&str>,
        message: &OutboundMessage,
    ) -> Contact {
        message
            .from
            .clone()
            .or_else(|| {
                sender
                    .map(|sender| sender.trim().trim_start_matches('<').trim_end_matches('>'))
                    .filter(|sender| !sender.is_empty())
                    .map(Contact::new)
            })
            .unwrap_or_else(|| {
                Contact::new(format!("{}@{}", tenant.username, self.settings.sender_domain))
            })
    }

    #[tracing::instrument(skip_all, fields(tenant = %submission.tenant.id))]
    pub async fn submit(&self, submission: Submission) -> Result<Receipt, SubmissionError> {
        let Submission {
            tenant,
            sender,
            recipients,
            mut message,
            size,
            peer,
        } = submission;

        let tracking_id = TrackingId::generate();

        if let Some(html) = message.html.take() {
            message.html = Some(rewrite(
                &html,
                &tracking_id,
                &self.settings.compose.base_url,
            ));
        }

        let from = self.visible_sender(&tenant, sender.as_deref(), &message);
        let composed = compose::compose(
            &message,
            &from,
            &recipients,
            &tracking_id,
            &self.settings.compose,
        )?;

        let quota_used = match self.quota.admit(tenant.id, tenant.limits.monthly).await? {
            Admission::Admitted { count } => count,
            Admission::QuotaExceeded { used, limit } => {
                return Err(SubmissionError::QuotaExceeded { used, limit });
            }
        };

        let relayed = tokio::time::timeout(
            self.settings.relay_timeout,
            self.relay.submit(&composed.envelope, &composed.message),
        )
        .await
        .unwrap_or_else(|_| Err(RelayError::Timeout(self.settings.relay_timeout)));

        if let Err(err) = relayed {
            warn!(
                %tracking_id,
                quota_consumed = true,
                upstream_rejected = err.is_permanent(),
                error = %err,
                "Relay failed after quota admission"
            );
            return Err(err.into());
        }

        let sent_at = Utc::now();
        let record = NewMessage {
            tracking_id: tracking_id.clone(),
            tenant_id: tenant.id,
            from_address: from.email,
            from_name: from.name,
            recipients: composed.envelope.recipients,
            subject: message.subject,
            size,
            peer_ip: peer,
        };

        let message_id = match self.recorder.record_sent(record).await {
            Ok(message_id) => Some(message_id),
            Err(err) => {
                error!(
                    %tracking_id,
                    error = %err,
                    "Message relayed but the sent record could not be written"
                );
                None
            }
        };

        info!(%tracking_id, quota_used, "Message relayed");

        Ok(Receipt {
            tracking_id,
            message_id,
            sent_at,
            quota_used,
        })
    }
}
