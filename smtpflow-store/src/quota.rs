//! Per-tenant monthly sending quota.
//!
//! The check against the limit and the increment are one storage-level
//! operation in every backend. No counts are cached in process between
//! admissions, so several relay processes can share one ledger.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::tenant::TenantId;

/// Limit applied when the tenant's plan does not set one.
pub const DEFAULT_MONTHLY_LIMIT: u64 = 1000;

/// A UTC calendar month, rendered `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodKey(String);

impl PeriodKey {
    #[must_use]
    pub fn current() -> Self {
        Self::containing(Utc::now())
    }

    #[must_use]
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self(format!("{:04}-{:02}", at.year(), at.month()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The message was counted; `count` is the consumed total including it.
    Admitted { count: u64 },
    /// Nothing was counted.
    QuotaExceeded { used: u64, limit: u64 },
}

impl Admission {
    #[must_use]
    pub const fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Storage of `(tenant, period) -> consumed` counters.
#[async_trait]
pub trait QuotaLedger: Send + Sync + fmt::Debug {
    /// Increment the counter if, and only if, it is currently below `limit`.
    async fn admit_in(
        &self,
        tenant: TenantId,
        period: &PeriodKey,
        limit: u64,
    ) -> crate::Result<Admission>;

    /// The consumed count, zero when the period has no row yet.
    async fn consumed(&self, tenant: TenantId, period: &PeriodKey) -> crate::Result<u64>;
}

/// Admission policy on top of a [`QuotaLedger`]: picks the current period and
/// falls back to the default limit for plans without one.
#[derive(Debug, Clone)]
pub struct Quota {
    ledger: Arc<dyn QuotaLedger>,
    default_limit: u64,
}

impl Quota {
    pub fn new(ledger: Arc<dyn QuotaLedger>, default_limit: u64) -> Self {
        Self {
            ledger,
            default_limit,
        }
    }

    #[must_use]
    pub fn effective_limit(&self, plan_limit: Option<u64>) -> u64 {
        plan_limit.unwrap_or(self.default_limit)
    }

    /// Atomically admit one message for `tenant` in the current month.
    ///
    /// # Errors
    /// Only storage failures; an exhausted quota is an [`Admission`].
    pub async fn admit(&self, tenant: TenantId, plan_limit: Option<u64>) -> crate::Result<Admission> {
        let period = PeriodKey::current();
        let limit = self.effective_limit(plan_limit);
        let admission = self.ledger.admit_in(tenant, &period, limit).await?;

        match admission {
            Admission::Admitted { count } => {
                debug!(%tenant, %period, count, limit, "Quota admitted");
            }
            Admission::QuotaExceeded { used, limit } => {
                warn!(%tenant, %period, used, limit, "Quota exceeded");
            }
        }

        Ok(admission)
    }

    /// # Errors
    /// Storage failures.
    pub async fn consumed(&self, tenant: TenantId) -> crate::Result<(PeriodKey, u64)> {
        let period = PeriodKey::current();
        let used = self.ledger.consumed(tenant, &period).await?;
        Ok((period, used))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backends::MemoryStore;

    #[test]
    fn period_key_is_calendar_month() {
        let at = Utc.with_ymd_and_hms(2026, 3, 31, 23, 59, 59).unwrap();
        assert_eq!(PeriodKey::containing(at).as_str(), "2026-03");

        let next = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(PeriodKey::containing(next).to_string(), "2026-04");
    }

    #[test]
    fn default_limit_applies_without_plan_limit() {
        let quota = Quota::new(Arc::new(MemoryStore::new()), DEFAULT_MONTHLY_LIMIT);
        assert_eq!(quota.effective_limit(None), 1000);
        assert_eq!(quota.effective_limit(Some(3)), 3);
    }

    #[tokio::test]
    async fn admit_stops_at_limit() {
        let quota = Quota::new(Arc::new(MemoryStore::new()), 2);
        let tenant = TenantId(9);

        assert_eq!(
            quota.admit(tenant, None).await.unwrap(),
            Admission::Admitted { count: 1 }
        );
        assert_eq!(
            quota.admit(tenant, None).await.unwrap(),
            Admission::Admitted { count: 2 }
        );
        assert_eq!(
            quota.admit(tenant, None).await.unwrap(),
            Admission::QuotaExceeded { used: 2, limit: 2 }
        );

        assert_eq!(quota.consumed(tenant).await.unwrap().1, 2);
    }

    #[tokio::test]
    async fn new_period_starts_at_zero() {
        let store = MemoryStore::new();
        let tenant = TenantId(1);
        let march = PeriodKey("2026-03".to_string());
        let april = PeriodKey("2026-04".to_string());

        assert!(store.admit_in(tenant, &march, 1).await.unwrap().is_admitted());
        assert!(!store.admit_in(tenant, &march, 1).await.unwrap().is_admitted());
        assert!(store.admit_in(tenant, &april, 1).await.unwrap().is_admitted());
        assert_eq!(store.consumed(tenant, &march).await.unwrap(), 1);
    }
}
