#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use pretty_assertions::assert_eq;
use smtpflow_common::tracking::TrackingId;
use smtpflow_store::{
    AccountStatus, Admission, BounceType, ClientMetadata, CredentialStore, EventKind,
    EventRecorder, MessageStatus, NewMessage, PeriodKey, PlanLimits, QuotaLedger, Recorded,
    SqliteStore, Tenant, TenantId, credentials::token_digest,
};

fn new_message(tracking_id: &TrackingId) -> NewMessage {
    NewMessage {
        tracking_id: tracking_id.clone(),
        tenant_id: TenantId(1),
        from_address: "news@acme.test".to_string(),
        from_name: None,
        recipients: vec!["a@example.com".to_string(), "b@example.com".to_string()],
        subject: "Launch".to_string(),
        size: 2048,
        peer_ip: Some("192.0.2.10".parse().unwrap()),
    }
}

#[tokio::test]
async fn admissions_from_two_handles_share_one_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");

    // Two independent pools on one file stand in for two relay processes.
    let first = Arc::new(SqliteStore::open(&path, 4).unwrap());
    let second = Arc::new(SqliteStore::open(&path, 4).unwrap());
    let period = PeriodKey::current();

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let store = if i % 2 == 0 {
                Arc::clone(&first)
            } else {
                Arc::clone(&second)
            };
            let period = period.clone();
            tokio::spawn(async move { store.admit_in(TenantId(5), &period, 13).await })
        })
        .collect();

    let mut admitted = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            Admission::Admitted { .. } => admitted += 1,
            Admission::QuotaExceeded { used, limit } => {
                assert_eq!((used, limit), (13, 13));
                rejected += 1;
            }
        }
    }

    assert_eq!(admitted, 13);
    assert_eq!(rejected, 27);
    assert_eq!(first.consumed(TenantId(5), &period).await.unwrap(), 13);
}

#[tokio::test]
async fn zero_limit_creates_no_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("relay.db"), 2).unwrap();
    let period = PeriodKey::current();

    assert_eq!(
        store.admit_in(TenantId(1), &period, 0).await.unwrap(),
        Admission::QuotaExceeded { used: 0, limit: 0 }
    );
    assert_eq!(store.consumed(TenantId(1), &period).await.unwrap(), 0);
}

#[tokio::test]
async fn message_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("relay.db"), 2).unwrap();
    let tracking_id = TrackingId::generate();

    let id = store.record_sent(new_message(&tracking_id)).await.unwrap();

    let metadata = ClientMetadata {
        ip: Some("198.51.100.7".parse().unwrap()),
        user_agent: Some("Mail/1.0".to_string()),
        referer: None,
    };
    for _ in 0..3 {
        assert_eq!(
            store.record_open(&tracking_id, &metadata).await.unwrap(),
            Recorded::Recorded
        );
    }
    let after_opens = store.message(&tracking_id).await.unwrap().unwrap();

    store
        .record_click(&tracking_id, "https://example.com/pricing", &metadata)
        .await
        .unwrap();
    store.record_open(&tracking_id, &metadata).await.unwrap();

    assert_eq!(
        store
            .record_bounce(&tracking_id, BounceType::Soft, "452 mailbox full")
            .await
            .unwrap(),
        Recorded::Recorded
    );
    assert_eq!(
        store
            .record_bounce(&tracking_id, BounceType::Hard, "550 gone")
            .await
            .unwrap(),
        Recorded::AlreadyRecorded
    );

    let message = store.message(&tracking_id).await.unwrap().unwrap();
    assert_eq!(message.id, id);
    assert_eq!(message.recipients.len(), 2);
    assert_eq!(message.peer_ip, Some("192.0.2.10".parse().unwrap()));
    assert!(message.opened);
    assert_eq!(message.opened_count, 4);
    assert_eq!(message.opened_at, after_opens.opened_at);
    assert_eq!(message.click_count, 1);
    assert_eq!(message.status, MessageStatus::Bounced);
    assert_eq!(message.bounce_type, Some(BounceType::Soft));
    assert_eq!(message.bounce_message.as_deref(), Some("452 mailbox full"));

    let events = store.events(id).await.unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Sent,
            EventKind::Opened,
            EventKind::Opened,
            EventKind::Opened,
            EventKind::Clicked,
            EventKind::Opened,
            EventKind::Bounced,
        ]
    );
    assert_eq!(events[4].payload.as_ref().unwrap()["url"], "https://example.com/pricing");
    assert_eq!(events[1].user_agent.as_deref(), Some("Mail/1.0"));
}

#[tokio::test]
async fn unknown_tracking_ids_leave_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("relay.db"), 2).unwrap();
    let unknown = TrackingId::generate();

    assert_eq!(
        store
            .record_open(&unknown, &ClientMetadata::default())
            .await
            .unwrap(),
        Recorded::UnknownTracking
    );
    assert_eq!(
        store
            .record_click(&unknown, "https://example.com", &ClientMetadata::default())
            .await
            .unwrap(),
        Recorded::UnknownTracking
    );
    assert_eq!(
        store
            .record_bounce(&unknown, BounceType::Hard, "")
            .await
            .unwrap(),
        Recorded::UnknownTracking
    );
    assert_eq!(
        store.record_spam_complaint(&unknown).await.unwrap(),
        Recorded::UnknownTracking
    );
    assert!(store.message(&unknown).await.unwrap().is_none());
}

#[tokio::test]
async fn tenants_resolve_with_plan_limits() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("relay.db"), 2).unwrap());

    store
        .upsert_tenant(Tenant {
            id: TenantId(42),
            username: "acme".to_string(),
            secret: "s3cret".to_string(),
            status: AccountStatus::Active,
            limits: PlanLimits {
                monthly: Some(250),
                daily: Some(20),
            },
            api_token_digest: Some(token_digest("token-1")),
        })
        .await
        .unwrap();

    let credentials = CredentialStore::new(store.clone());
    let identity = credentials.resolve("acme", "s3cret").await.unwrap();
    assert_eq!(identity.id, TenantId(42));
    assert_eq!(identity.limits.monthly, Some(250));
    assert_eq!(identity.limits.daily, Some(20));

    assert_eq!(
        credentials.resolve_bearer("token-1").await.unwrap().id,
        TenantId(42)
    );
    assert!(credentials.resolve("acme", "S3CRET").await.is_err());
}

#[tokio::test]
async fn reprovisioning_reuses_the_plan_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    let store = Arc::new(SqliteStore::open(&path, 2).unwrap());

    let tenant = |monthly: Option<u64>| Tenant {
        id: TenantId(9),
        username: "globex".to_string(),
        secret: "pw".to_string(),
        status: AccountStatus::Active,
        limits: PlanLimits {
            monthly,
            daily: None,
        },
        api_token_digest: None,
    };
    let plans = || {
        rusqlite::Connection::open(&path)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM plans", [], |row| row.get::<_, i64>(0))
            .unwrap()
    };
    let monthly = |store: Arc<SqliteStore>| async move {
        CredentialStore::new(store)
            .resolve("globex", "pw")
            .await
            .unwrap()
            .limits
            .monthly
    };

    store.upsert_tenant(tenant(Some(10))).await.unwrap();
    store.upsert_tenant(tenant(Some(10))).await.unwrap();
    store.upsert_tenant(tenant(Some(30))).await.unwrap();

    assert_eq!(plans(), 1);
    assert_eq!(monthly(store.clone()).await, Some(30));

    store.upsert_tenant(tenant(None)).await.unwrap();

    assert_eq!(plans(), 0);
    assert_eq!(monthly(store.clone()).await, None);
}
