//! SQLite backend.
//!
//! Every operation runs on the blocking pool against a pooled connection.
//! Mutations run in `IMMEDIATE` transactions so that concurrent writers, in
//! this process or another one sharing the file, are serialised by SQLite's
//! own locking rather than by anything held in memory here.

mod pool;

use std::{net::IpAddr, path::Path};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use smtpflow_common::tracking::TrackingId;
use tracing::info;

pub use self::pool::SqliteConnectionManager;
use crate::{
    StoreError,
    events::{
        self, BounceType, ClientMetadata, DeliveryEvent, EventKind, EventRecorder, MessageId,
        MessageRecord, MessageStatus, NewMessage, Recorded,
    },
    quota::{Admission, PeriodKey, QuotaLedger},
    tenant::{AccountStatus, PlanLimits, Tenant, TenantDirectory, TenantId},
};

const SCHEMA: &str = include_str!("schema.sql");

/// Count one more message unless the period already reached the ceiling.
/// Returns no row when the ceiling was hit.
const ADMIT: &str = concat!(
    "INSERT INTO quota_periods (tenant_id, period, consumed) VALUES (?1, ?2, 1) ",
    "ON CONFLICT (tenant_id, period) DO UPDATE SET consumed = consumed + 1 ",
    "WHERE quota_periods.consumed < ?3 ",
    "RETURNING consumed"
);

const CONSUMED: &str = "SELECT consumed FROM quota_periods WHERE tenant_id = ?1 AND period = ?2";

const TENANT_COLUMNS: &str = concat!(
    "SELECT t.id, t.username, t.secret, t.status, p.monthly_limit, p.daily_limit, ",
    "t.api_token_digest FROM tenants t LEFT JOIN plans p ON p.id = t.plan_id "
);

const MESSAGE_COLUMNS: &str = concat!(
    "SELECT id, tracking_id, tenant_id, from_address, from_name, recipients, subject, ",
    "size_bytes, status, peer_ip, created_at, opened, opened_at, opened_count, clicked, ",
    "clicked_at, click_count, bounced_at, bounce_type, bounce_message, spam_reported_at ",
    "FROM messages "
);

const INSERT_EVENT: &str = concat!(
    "INSERT INTO delivery_events (message_id, event_type, occurred_at, ip, user_agent, payload) ",
    "VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
);

/// The tenant's plan, unless another tenant is on it too.
const OWNED_PLAN: &str = concat!(
    "SELECT t.plan_id FROM tenants t WHERE t.id = ?1 AND t.plan_id IS NOT NULL ",
    "AND NOT EXISTS (SELECT 1 FROM tenants o WHERE o.plan_id = t.plan_id AND o.id <> t.id)"
);

fn plan_name(tenant: &Tenant) -> String {
    format!("{}-plan", tenant.username)
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// Fixed-width so that timestamps order correctly as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string()
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and make sure the
    /// schema exists.
    ///
    /// # Errors
    /// If the file cannot be opened or the schema cannot be created.
    pub fn open(path: impl AsRef<Path>, max_connections: u32) -> crate::Result<Self> {
        let path = path.as_ref();
        let pool = Pool::builder()
            .max_size(max_connections.max(1))
            .build(SqliteConnectionManager::file(path))?;

        pool.get()?.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "Opened SQLite store");

        Ok(Self { pool })
    }

    async fn spawn_worker<F, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&mut Connection) -> crate::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    /// Insert or replace a tenant. Its limits live in a plan row owned by
    /// that tenant alone, which is updated in place on later calls and
    /// removed once the tenant falls back to the default limits. Plans shared
    /// with other tenants are never modified.
    ///
    /// # Errors
    /// Storage failures.
    pub async fn upsert_tenant(&self, tenant: Tenant) -> crate::Result<()> {
        self.spawn_worker(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let owned_plan: Option<i64> = tx
                .query_row(OWNED_PLAN, [tenant.id.0], |row| row.get(0))
                .optional()?;

            let limits = (
                tenant.limits.monthly.map(to_sql_int),
                tenant.limits.daily.map(to_sql_int),
            );
            let plan_id = match (tenant.limits == PlanLimits::default(), owned_plan) {
                (true, _) => None,
                (false, Some(plan_id)) => {
                    tx.execute(
                        "UPDATE plans SET name = ?2, monthly_limit = ?3, daily_limit = ?4 WHERE id = ?1",
                        params![plan_id, plan_name(&tenant), limits.0, limits.1],
                    )?;
                    Some(plan_id)
                }
                (false, None) => {
                    tx.execute(
                        "INSERT INTO plans (name, monthly_limit, daily_limit) VALUES (?1, ?2, ?3)",
                        params![plan_name(&tenant), limits.0, limits.1],
                    )?;
                    Some(tx.last_insert_rowid())
                }
            };

            tx.execute(
                concat!(
                    "INSERT INTO tenants (id, username, secret, status, plan_id, api_token_digest) ",
                    "VALUES (?1, ?2, ?3, ?4, ?5, ?6) ",
                    "ON CONFLICT (id) DO UPDATE SET username = excluded.username, ",
                    "secret = excluded.secret, status = excluded.status, ",
                    "plan_id = excluded.plan_id, api_token_digest = excluded.api_token_digest"
                ),
                params![
                    tenant.id.0,
                    tenant.username,
                    tenant.secret,
                    tenant.status.as_str(),
                    plan_id,
                    tenant.api_token_digest,
                ],
            )?;

            if let Some(stale) = owned_plan.filter(|owned| plan_id != Some(*owned)) {
                tx.execute("DELETE FROM plans WHERE id = ?1", [stale])?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn tenant_where(&self, clause: &'static str, value: String) -> crate::Result<Option<Tenant>> {
        self.spawn_worker(move |conn| {
            let tenant = conn
                .query_row(&format!("{TENANT_COLUMNS}{clause}"), [value], tenant_from_row)
                .optional()?;
            Ok(tenant)
        })
        .await
    }

    /// Run `update` (which must `RETURNING id`) for a tracking id and append
    /// an event when it touched a row.
    async fn stamp(
        &self,
        tracking_id: &TrackingId,
        update: &'static str,
        args: Vec<Option<String>>,
        event: PendingEvent,
    ) -> crate::Result<Recorded> {
        let tracking_id = tracking_id.as_str().to_owned();

        self.spawn_worker(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut values: Vec<Option<String>> = vec![Some(tracking_id.clone())];
            values.extend(args);

            let touched: Option<i64> = tx
                .query_row(update, rusqlite::params_from_iter(values.iter()), |row| {
                    row.get(0)
                })
                .optional()?;

            let outcome = match touched {
                Some(message_id) => {
                    event.insert(&tx, message_id)?;
                    Recorded::Recorded
                }
                None => {
                    let exists = tx
                        .query_row(
                            "SELECT 1 FROM messages WHERE tracking_id = ?1",
                            [&tracking_id],
                            |_| Ok(()),
                        )
                        .optional()?
                        .is_some();

                    if exists {
                        Recorded::AlreadyRecorded
                    } else {
                        Recorded::UnknownTracking
                    }
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }
}

/// An event row waiting for the id of the message it belongs to.
struct PendingEvent {
    kind: EventKind,
    at: DateTime<Utc>,
    ip: Option<String>,
    user_agent: Option<String>,
    payload: Option<String>,
}

impl PendingEvent {
    fn new(
        kind: EventKind,
        at: DateTime<Utc>,
        metadata: Option<&ClientMetadata>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            kind,
            at,
            ip: metadata.and_then(|m| m.ip).map(|ip| ip.to_string()),
            user_agent: metadata.and_then(|m| m.user_agent.clone()),
            payload: payload.map(|p| p.to_string()),
        }
    }

    fn insert(self, conn: &Connection, message_id: i64) -> rusqlite::Result<()> {
        conn.execute(
            INSERT_EVENT,
            params![
                message_id,
                self.kind.as_str(),
                timestamp(self.at),
                self.ip,
                self.user_agent,
                self.payload
            ],
        )?;
        Ok(())
    }
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: TenantId(row.get(0)?),
        username: row.get(1)?,
        secret: row.get(2)?,
        status: AccountStatus::from_db(&row.get::<_, String>(3)?),
        limits: PlanLimits {
            monthly: row.get::<_, Option<i64>>(4)?.map(from_sql_int),
            daily: row.get::<_, Option<i64>>(5)?.map(from_sql_int),
        },
        api_token_digest: row.get(6)?,
    })
}

/// Raw columns of a message row, validated into a [`MessageRecord`] outside
/// of rusqlite's row callback.
struct MessageRow {
    id: i64,
    tracking_id: String,
    tenant_id: i64,
    from_address: String,
    from_name: Option<String>,
    recipients: String,
    subject: String,
    size: i64,
    status: String,
    peer_ip: Option<String>,
    created_at: DateTime<Utc>,
    opened: bool,
    opened_at: Option<DateTime<Utc>>,
    opened_count: i64,
    clicked: bool,
    clicked_at: Option<DateTime<Utc>>,
    click_count: i64,
    bounced_at: Option<DateTime<Utc>>,
    bounce_type: Option<String>,
    bounce_message: Option<String>,
    spam_reported_at: Option<DateTime<Utc>>,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tracking_id: row.get(1)?,
            tenant_id: row.get(2)?,
            from_address: row.get(3)?,
            from_name: row.get(4)?,
            recipients: row.get(5)?,
            subject: row.get(6)?,
            size: row.get(7)?,
            status: row.get(8)?,
            peer_ip: row.get(9)?,
            created_at: row.get(10)?,
            opened: row.get(11)?,
            opened_at: row.get(12)?,
            opened_count: row.get(13)?,
            clicked: row.get(14)?,
            clicked_at: row.get(15)?,
            click_count: row.get(16)?,
            bounced_at: row.get(17)?,
            bounce_type: row.get(18)?,
            bounce_message: row.get(19)?,
            spam_reported_at: row.get(20)?,
        })
    }

    fn into_record(self) -> crate::Result<MessageRecord> {
        let tracking_id = self
            .tracking_id
            .parse()
            .map_err(|e| StoreError::Corrupted(format!("message {}: {e}", self.id)))?;
        let status = MessageStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Corrupted(format!(
                "message {}: '{}' is not a message status",
                self.id, self.status
            ))
        })?;

        Ok(MessageRecord {
            id: MessageId(self.id),
            tracking_id,
            tenant_id: TenantId(self.tenant_id),
            from_address: self.from_address,
            from_name: self.from_name,
            recipients: serde_json::from_str(&self.recipients)?,
            subject: self.subject,
            size: from_sql_int(self.size),
            status,
            peer_ip: self.peer_ip.and_then(|ip| ip.parse::<IpAddr>().ok()),
            created_at: self.created_at,
            opened: self.opened,
            opened_at: self.opened_at,
            opened_count: from_sql_int(self.opened_count),
            clicked: self.clicked,
            clicked_at: self.clicked_at,
            click_count: from_sql_int(self.click_count),
            bounced_at: self.bounced_at,
            bounce_type: self.bounce_type.as_deref().map(BounceType::classify),
            bounce_message: self.bounce_message,
            spam_reported_at: self.spam_reported_at,
        })
    }
}

#[async_trait]
impl TenantDirectory for SqliteStore {
    async fn by_username(&self, username: &str) -> crate::Result<Option<Tenant>> {
        self.tenant_where("WHERE t.username = ?1", username.to_owned())
            .await
    }

    async fn by_token_digest(&self, digest: &str) -> crate::Result<Option<Tenant>> {
        self.tenant_where("WHERE t.api_token_digest = ?1", digest.to_ascii_lowercase())
            .await
    }
}

#[async_trait]
impl QuotaLedger for SqliteStore {
    async fn admit_in(
        &self,
        tenant: TenantId,
        period: &PeriodKey,
        limit: u64,
    ) -> crate::Result<Admission> {
        let period = period.as_str().to_owned();

        self.spawn_worker(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let admitted: Option<i64> = if limit == 0 {
                None
            } else {
                tx.query_row(ADMIT, params![tenant.0, period, to_sql_int(limit)], |row| {
                    row.get(0)
                })
                .optional()?
            };

            let admission = match admitted {
                Some(count) => Admission::Admitted {
                    count: from_sql_int(count),
                },
                None => {
                    let used: Option<i64> = tx
                        .query_row(CONSUMED, params![tenant.0, period], |row| row.get(0))
                        .optional()?;
                    Admission::QuotaExceeded {
                        used: used.map(from_sql_int).unwrap_or_default(),
                        limit,
                    }
                }
            };

            tx.commit()?;
            Ok(admission)
        })
        .await
    }

    async fn consumed(&self, tenant: TenantId, period: &PeriodKey) -> crate::Result<u64> {
        let period = period.as_str().to_owned();

        self.spawn_worker(move |conn| {
            let used: Option<i64> = conn
                .query_row(CONSUMED, params![tenant.0, period], |row| row.get(0))
                .optional()?;
            Ok(used.map(from_sql_int).unwrap_or_default())
        })
        .await
    }
}

#[async_trait]
impl EventRecorder for SqliteStore {
    async fn record_sent(&self, message: NewMessage) -> crate::Result<MessageId> {
        let recipients = serde_json::to_string(&message.recipients)?;

        self.spawn_worker(move |conn| {
            let now = Utc::now();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                concat!(
                    "INSERT INTO messages (tracking_id, tenant_id, from_address, from_name, ",
                    "recipients, subject, size_bytes, status, peer_ip, created_at) ",
                    "VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'sent', ?8, ?9)"
                ),
                params![
                    message.tracking_id.as_str(),
                    message.tenant_id.0,
                    message.from_address,
                    message.from_name,
                    recipients,
                    message.subject,
                    to_sql_int(message.size),
                    message.peer_ip.map(|ip| ip.to_string()),
                    timestamp(now),
                ],
            )?;
            let id = tx.last_insert_rowid();

            PendingEvent::new(EventKind::Sent, now, None, None).insert(&tx, id)?;
            tx.commit()?;

            Ok(MessageId(id))
        })
        .await
    }

    async fn record_open(
        &self,
        tracking_id: &TrackingId,
        metadata: &ClientMetadata,
    ) -> crate::Result<Recorded> {
        let now = Utc::now();
        self.stamp(
            tracking_id,
            concat!(
                "UPDATE messages SET opened = 1, opened_at = COALESCE(opened_at, ?2), ",
                "opened_count = opened_count + 1 WHERE tracking_id = ?1 RETURNING id"
            ),
            vec![Some(timestamp(now))],
            PendingEvent::new(
                EventKind::Opened,
                now,
                Some(metadata),
                events::open_payload(metadata),
            ),
        )
        .await
    }

    async fn record_click(
        &self,
        tracking_id: &TrackingId,
        url: &str,
        metadata: &ClientMetadata,
    ) -> crate::Result<Recorded> {
        let now = Utc::now();
        self.stamp(
            tracking_id,
            concat!(
                "UPDATE messages SET clicked = 1, clicked_at = COALESCE(clicked_at, ?2), ",
                "click_count = click_count + 1 WHERE tracking_id = ?1 RETURNING id"
            ),
            vec![Some(timestamp(now))],
            PendingEvent::new(
                EventKind::Clicked,
                now,
                Some(metadata),
                Some(events::click_payload(url, metadata)),
            ),
        )
        .await
    }

    async fn record_bounce(
        &self,
        tracking_id: &TrackingId,
        bounce_type: BounceType,
        reason: &str,
    ) -> crate::Result<Recorded> {
        let now = Utc::now();
        self.stamp(
            tracking_id,
            concat!(
                "UPDATE messages SET status = 'bounced', bounced_at = ?2, bounce_type = ?3, ",
                "bounce_message = ?4 WHERE tracking_id = ?1 AND bounced_at IS NULL RETURNING id"
            ),
            vec![
                Some(timestamp(now)),
                Some(bounce_type.as_str().to_owned()),
                Some(reason.to_owned()),
            ],
            PendingEvent::new(
                EventKind::Bounced,
                now,
                None,
                Some(events::bounce_payload(bounce_type, reason)),
            ),
        )
        .await
    }

    async fn record_spam_complaint(&self, tracking_id: &TrackingId) -> crate::Result<Recorded> {
        let now = Utc::now();
        self.stamp(
            tracking_id,
            concat!(
                "UPDATE messages SET status = 'spam', spam_reported_at = ?2 ",
                "WHERE tracking_id = ?1 AND spam_reported_at IS NULL RETURNING id"
            ),
            vec![Some(timestamp(now))],
            PendingEvent::new(EventKind::Spam, now, None, None),
        )
        .await
    }

    async fn message(&self, tracking_id: &TrackingId) -> crate::Result<Option<MessageRecord>> {
        let tracking_id = tracking_id.as_str().to_owned();

        let row = self
            .spawn_worker(move |conn| {
                let row = conn
                    .query_row(
                        &format!("{MESSAGE_COLUMNS}WHERE tracking_id = ?1"),
                        [tracking_id],
                        MessageRow::from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        row.map(MessageRow::into_record).transpose()
    }

    async fn events(&self, message_id: MessageId) -> crate::Result<Vec<DeliveryEvent>> {
        self.spawn_worker(move |conn| {
            let mut stmt = conn.prepare_cached(concat!(
                "SELECT event_type, occurred_at, ip, user_agent, payload FROM delivery_events ",
                "WHERE message_id = ?1 ORDER BY occurred_at, id"
            ))?;

            let rows = stmt
                .query_map([message_id.0], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, DateTime<Utc>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(kind, at, ip, user_agent, payload)| {
                    let kind = EventKind::parse(&kind).ok_or_else(|| {
                        StoreError::Corrupted(format!("'{kind}' is not an event type"))
                    })?;

                    Ok(DeliveryEvent {
                        message_id,
                        kind,
                        at,
                        ip: ip.and_then(|ip| ip.parse().ok()),
                        user_agent,
                        payload: payload.as_deref().map(serde_json::from_str).transpose()?,
                    })
                })
                .collect()
        })
        .await
    }
}
