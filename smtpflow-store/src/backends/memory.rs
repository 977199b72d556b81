use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use smtpflow_common::tracking::TrackingId;

use crate::{
    events::{
        self, BounceType, ClientMetadata, DeliveryEvent, EventKind, EventRecorder, MessageId,
        MessageRecord, MessageStatus, NewMessage, Recorded,
    },
    quota::{Admission, PeriodKey, QuotaLedger},
    tenant::{Tenant, TenantDirectory, TenantId},
};

#[derive(Debug, Default)]
struct Inner {
    tenants: HashMap<String, Tenant>,
    usage: HashMap<(TenantId, PeriodKey), u64>,
    messages: Vec<MessageRecord>,
    by_tracking: HashMap<TrackingId, usize>,
    events: Vec<DeliveryEvent>,
}

impl Inner {
    fn message_mut(&mut self, tracking_id: &TrackingId) -> Option<&mut MessageRecord> {
        let index = *self.by_tracking.get(tracking_id)?;
        self.messages.get_mut(index)
    }
}

/// In-memory store implementing every storage trait.
///
/// A single mutex guards all state, so every operation, including the quota
/// check-and-increment, is atomic within the process. Use the SQLite backend
/// when more than one relay process shares a quota.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tenant(self, tenant: Tenant) -> Self {
        self.insert_tenant(tenant);
        self
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.inner.lock().tenants.insert(tenant.username.clone(), tenant);
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }
}

#[async_trait]
impl TenantDirectory for MemoryStore {
    async fn by_username(&self, username: &str) -> crate::Result<Option<Tenant>> {
        Ok(self.inner.lock().tenants.get(username).cloned())
    }

    async fn by_token_digest(&self, digest: &str) -> crate::Result<Option<Tenant>> {
        Ok(self
            .inner
            .lock()
            .tenants
            .values()
            .find(|tenant| {
                tenant
                    .api_token_digest
                    .as_deref()
                    .is_some_and(|stored| stored.eq_ignore_ascii_case(digest))
            })
            .cloned())
    }
}

#[async_trait]
impl QuotaLedger for MemoryStore {
    async fn admit_in(
        &self,
        tenant: TenantId,
        period: &PeriodKey,
        limit: u64,
    ) -> crate::Result<Admission> {
        let mut inner = self.inner.lock();
        let consumed = inner.usage.entry((tenant, period.clone())).or_default();

        if *consumed >= limit {
            return Ok(Admission::QuotaExceeded {
                used: *consumed,
                limit,
            });
        }

        *consumed += 1;
        Ok(Admission::Admitted { count: *consumed })
    }

    async fn consumed(&self, tenant: TenantId, period: &PeriodKey) -> crate::Result<u64> {
        Ok(self
            .inner
            .lock()
            .usage
            .get(&(tenant, period.clone()))
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventRecorder for MemoryStore {
    async fn record_sent(&self, message: NewMessage) -> crate::Result<MessageId> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let index = inner.messages.len();
        let id = MessageId(i64::try_from(index).unwrap_or(i64::MAX) + 1);
        let tracking_id = message.tracking_id.clone();

        inner.messages.push(MessageRecord::new(id, message, now));
        inner.by_tracking.insert(tracking_id, index);
        inner
            .events
            .push(DeliveryEvent::new(id, EventKind::Sent, now, None, None));

        Ok(id)
    }

    async fn record_open(
        &self,
        tracking_id: &TrackingId,
        metadata: &ClientMetadata,
    ) -> crate::Result<Recorded> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let Some(message) = inner.message_mut(tracking_id) else {
            return Ok(Recorded::UnknownTracking);
        };

        message.opened = true;
        message.opened_at.get_or_insert(now);
        message.opened_count += 1;
        let id = message.id;

        inner.events.push(DeliveryEvent::new(
            id,
            EventKind::Opened,
            now,
            Some(metadata),
            events::open_payload(metadata),
        ));

        Ok(Recorded::Recorded)
    }

    async fn record_click(
        &self,
        tracking_id: &TrackingId,
        url: &str,
        metadata: &ClientMetadata,
    ) -> crate::Result<Recorded> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let Some(message) = inner.message_mut(tracking_id) else {
            return Ok(Recorded::UnknownTracking);
        };

        message.clicked = true;
        message.clicked_at.get_or_insert(now);
        message.click_count += 1;
        let id = message.id;

        inner.events.push(DeliveryEvent::new(
            id,
            EventKind::Clicked,
            now,
            Some(metadata),
            Some(events::click_payload(url, metadata)),
        ));

        Ok(Recorded::Recorded)
    }

    async fn record_bounce(
        &self,
        tracking_id: &TrackingId,
        bounce_type: BounceType,
        reason: &str,
    ) -> crate::Result<Recorded> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let Some(message) = inner.message_mut(tracking_id) else {
            return Ok(Recorded::UnknownTracking);
        };

        if message.bounced_at.is_some() {
            return Ok(Recorded::AlreadyRecorded);
        }

        message.status = MessageStatus::Bounced;
        message.bounced_at = Some(now);
        message.bounce_type = Some(bounce_type);
        message.bounce_message = Some(reason.to_owned());
        let id = message.id;

        inner.events.push(DeliveryEvent::new(
            id,
            EventKind::Bounced,
            now,
            None,
            Some(events::bounce_payload(bounce_type, reason)),
        ));

        Ok(Recorded::Recorded)
    }

    async fn record_spam_complaint(&self, tracking_id: &TrackingId) -> crate::Result<Recorded> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let Some(message) = inner.message_mut(tracking_id) else {
            return Ok(Recorded::UnknownTracking);
        };

        if message.spam_reported_at.is_some() {
            return Ok(Recorded::AlreadyRecorded);
        }

        message.status = MessageStatus::Spam;
        message.spam_reported_at = Some(now);
        let id = message.id;

        inner
            .events
            .push(DeliveryEvent::new(id, EventKind::Spam, now, None, None));

        Ok(Recorded::Recorded)
    }

    async fn message(&self, tracking_id: &TrackingId) -> crate::Result<Option<MessageRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_tracking
            .get(tracking_id)
            .and_then(|index| inner.messages.get(*index))
            .cloned())
    }

    async fn events(&self, message_id: MessageId) -> crate::Result<Vec<DeliveryEvent>> {
        Ok(self
            .inner
            .lock()
            .events
            .iter()
            .filter(|event| event.message_id == message_id)
            .cloned()
            .collect())
    }
}
