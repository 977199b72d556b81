use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use smtpflow_common::tracking::TrackingId;
use tokio::sync::Notify;

use super::memory::MemoryStore;
use crate::{
    events::{
        BounceType, ClientMetadata, DeliveryEvent, EventRecorder, MessageId, MessageRecord,
        NewMessage, Recorded,
    },
    quota::{Admission, PeriodKey, QuotaLedger},
    tenant::{Tenant, TenantDirectory, TenantId},
};

/// Memory store that lets tests wait for recording done by detached tasks.
#[derive(Debug, Clone, Default)]
pub struct TestStore {
    inner: MemoryStore,
    notify: Arc<Notify>,
}

impl TestStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tenant(self, tenant: Tenant) -> Self {
        self.inner.insert_tenant(tenant);
        self
    }

    #[must_use]
    pub const fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.inner.event_count()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.message_count()
    }

    /// Wait until at least `expected` events were appended.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn wait_for_events(&self, expected: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.inner.event_count() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    fn notify<T>(&self, result: crate::Result<T>) -> crate::Result<T> {
        self.notify.notify_waiters();
        result
    }
}

#[async_trait]
impl TenantDirectory for TestStore {
    async fn by_username(&self, username: &str) -> crate::Result<Option<Tenant>> {
        self.inner.by_username(username).await
    }

    async fn by_token_digest(&self, digest: &str) -> crate::Result<Option<Tenant>> {
        self.inner.by_token_digest(digest).await
    }
}

#[async_trait]
impl QuotaLedger for TestStore {
    async fn admit_in(
        &self,
        tenant: TenantId,
        period: &PeriodKey,
        limit: u64,
    ) -> crate::Result<Admission> {
        self.inner.admit_in(tenant, period, limit).await
    }

    async fn consumed(&self, tenant: TenantId, period: &PeriodKey) -> crate::Result<u64> {
        self.inner.consumed(tenant, period).await
    }
}

#[async_trait]
impl EventRecorder for TestStore {
    async fn record_sent(&self, message: NewMessage) -> crate::Result<MessageId> {
        let result = self.inner.record_sent(message).await;
        self.notify(result)
    }

    async fn record_open(
        &self,
        tracking_id: &TrackingId,
        metadata: &ClientMetadata,
    ) -> crate::Result<Recorded> {
        let result = self.inner.record_open(tracking_id, metadata).await;
        self.notify(result)
    }

    async fn record_click(
        &self,
        tracking_id: &TrackingId,
        url: &str,
        metadata: &ClientMetadata,
    ) -> crate::Result<Recorded> {
        let result = self.inner.record_click(tracking_id, url, metadata).await;
        self.notify(result)
    }

    async fn record_bounce(
        &self,
        tracking_id: &TrackingId,
        bounce_type: BounceType,
        message: &str,
    ) -> crate::Result<Recorded> {
        let result = self
            .inner
            .record_bounce(tracking_id, bounce_type, message)
            .await;
        self.notify(result)
    }

    async fn record_spam_complaint(&self, tracking_id: &TrackingId) -> crate::Result<Recorded> {
        let result = self.inner.record_spam_complaint(tracking_id).await;
        self.notify(result)
    }

    async fn message(&self, tracking_id: &TrackingId) -> crate::Result<Option<MessageRecord>> {
        self.inner.message(tracking_id).await
    }

    async fn events(&self, message_id: MessageId) -> crate::Result<Vec<DeliveryEvent>> {
        self.inner.events(message_id).await
    }
}
