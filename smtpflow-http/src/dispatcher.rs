//! Detached recording of tracking events.
//!
//! Handlers answer immediately and hand the event to a bounded queue; a
//! single worker drains it into the [`EventRecorder`]. When the queue is
//! full the event is dropped with a warning. Recorder errors are logged and
//! dropped as well.

use std::sync::Arc;

use smtpflow_common::{Signal, internal, tracking::TrackingId};
use smtpflow_store::{BounceType, ClientMetadata, EventRecorder, Recorded};
use tokio::sync::{
    broadcast,
    mpsc::{self, error::TrySendError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingEvent {
    Open {
        tracking_id: TrackingId,
        metadata: ClientMetadata,
    },
    Click {
        tracking_id: TrackingId,
        url: String,
        metadata: ClientMetadata,
    },
    Bounce {
        tracking_id: TrackingId,
        bounce_type: BounceType,
        message: String,
    },
    Spam {
        tracking_id: TrackingId,
    },
}

impl TrackingEvent {
    const fn tracking_id(&self) -> &TrackingId {
        match self {
            Self::Open { tracking_id, .. }
            | Self::Click { tracking_id, .. }
            | Self::Bounce { tracking_id, .. }
            | Self::Spam { tracking_id } => tracking_id,
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Click { .. } => "click",
            Self::Bounce { .. } => "bounce",
            Self::Spam { .. } => "spam",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: mpsc::Sender<TrackingEvent>,
}

impl EventDispatcher {
    /// The dispatcher and the worker that must be spawned to drain it.
    #[must_use]
    pub fn new(recorder: Arc<dyn EventRecorder>, capacity: usize) -> (Self, DispatchWorker) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, DispatchWorker { receiver, recorder })
    }

    /// Queue an event without waiting. Returns whether it was queued.
    pub fn dispatch(&self, event: TrackingEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    tracking_id = %event.tracking_id(),
                    kind = event.kind(),
                    "Tracking queue is full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                tracing::warn!(
                    tracking_id = %event.tracking_id(),
                    kind = event.kind(),
                    "Tracking worker has stopped, dropping event"
                );
                false
            }
        }
    }
}

pub struct DispatchWorker {
    receiver: mpsc::Receiver<TrackingEvent>,
    recorder: Arc<dyn EventRecorder>,
}

impl DispatchWorker {
    /// Record events until shutdown, then record whatever is still queued.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) {
        loop {
            tokio::select! {
                event = self.receiver.recv() => match event {
                    Some(event) => self.record(event).await,
                    None => break,
                },
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "Tracking worker received shutdown signal, draining queue ...");
                        self.receiver.close();
                        while let Some(event) = self.receiver.recv().await {
                            self.record(event).await;
                        }
                        break;
                    }
                }
            }
        }

        internal!(level = DEBUG, "Tracking worker stopped");
    }

    async fn record(&self, event: TrackingEvent) {
        let result = match &event {
            TrackingEvent::Open {
                tracking_id,
                metadata,
            } => self.recorder.record_open(tracking_id, metadata).await,
            TrackingEvent::Click {
                tracking_id,
                url,
                metadata,
            } => self.recorder.record_click(tracking_id, url, metadata).await,
            TrackingEvent::Bounce {
                tracking_id,
                bounce_type,
                message,
            } => {
                self.recorder
                    .record_bounce(tracking_id, *bounce_type, message)
                    .await
            }
            TrackingEvent::Spam { tracking_id } => {
                self.recorder.record_spam_complaint(tracking_id).await
            }
        };

        match result {
            Ok(Recorded::Recorded) => {
                tracing::debug!(tracking_id = %event.tracking_id(), kind = event.kind(), "Recorded");
            }
            Ok(Recorded::AlreadyRecorded) => {
                tracing::debug!(tracking_id = %event.tracking_id(), kind = event.kind(), "Already recorded");
            }
            Ok(Recorded::UnknownTracking) => {
                tracing::debug!(tracking_id = %event.tracking_id(), kind = event.kind(), "Unknown tracking id");
            }
            Err(err) => {
                tracing::warn!(
                    tracking_id = %event.tracking_id(),
                    kind = event.kind(),
                    "Unable to record tracking event: {err}"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use smtpflow_store::{
        AccountStatus, MemoryStore, NewMessage, PlanLimits, Tenant, TenantId, TestStore,
    };

    use super::*;

    fn sent(tracking_id: &TrackingId) -> NewMessage {
        NewMessage {
            tracking_id: tracking_id.clone(),
            tenant_id: TenantId(1),
            from_address: "alice@example.test".into(),
            from_name: None,
            recipients: vec!["bob@example.test".into()],
            subject: "Hello".into(),
            size: 10,
            peer_ip: None,
        }
    }

    async fn store_with_message() -> (MemoryStore, TrackingId) {
        let store = MemoryStore::new().with_tenant(Tenant {
            id: TenantId(1),
            username: "acme".into(),
            secret: "s3cret".into(),
            status: AccountStatus::Active,
            limits: PlanLimits::default(),
            api_token_digest: None,
        });
        let tracking_id = TrackingId::generate();
        store.record_sent(sent(&tracking_id)).await.unwrap();

        (store, tracking_id)
    }

    #[tokio::test]
    async fn running_worker_records_in_the_background() {
        let store = TestStore::new();
        let tracking_id = TrackingId::generate();
        store.record_sent(sent(&tracking_id)).await.unwrap();

        let (dispatcher, worker) = EventDispatcher::new(Arc::new(store.clone()), 8);
        let (_shutdown, signal) = broadcast::channel(1);
        tokio::spawn(worker.run(signal));

        assert!(dispatcher.dispatch(TrackingEvent::Click {
            tracking_id: tracking_id.clone(),
            url: "http://example.com".into(),
            metadata: ClientMetadata::default(),
        }));

        assert!(store.wait_for_events(2, Duration::from_secs(5)).await);
        let record = store.message(&tracking_id).await.unwrap().unwrap();
        assert_eq!(record.click_count, 1);
    }

    #[tokio::test]
    async fn queued_events_are_recorded_on_shutdown() {
        let (store, tracking_id) = store_with_message().await;
        let (dispatcher, worker) = EventDispatcher::new(Arc::new(store.clone()), 8);
        let (shutdown, signal) = broadcast::channel(1);

        for _ in 0..3 {
            assert!(dispatcher.dispatch(TrackingEvent::Open {
                tracking_id: tracking_id.clone(),
                metadata: ClientMetadata::default(),
            }));
        }

        shutdown.send(Signal::Shutdown).unwrap();
        worker.run(signal).await;

        let record = store.message(&tracking_id).await.unwrap().unwrap();
        assert_eq!(record.opened_count, 3);
    }

    #[tokio::test]
    async fn full_queue_drops_events() {
        let (store, tracking_id) = store_with_message().await;
        let (dispatcher, _worker) = EventDispatcher::new(Arc::new(store), 1);

        let event = TrackingEvent::Spam { tracking_id };
        assert!(dispatcher.dispatch(event.clone()));
        assert!(!dispatcher.dispatch(event));
    }

    #[tokio::test]
    async fn stopped_worker_drops_events() {
        let (store, tracking_id) = store_with_message().await;
        let (dispatcher, worker) = EventDispatcher::new(Arc::new(store), 1);
        drop(worker);

        assert!(!dispatcher.dispatch(TrackingEvent::Spam { tracking_id }));
    }
}
