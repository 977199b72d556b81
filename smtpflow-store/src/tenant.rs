//! Tenant records as exposed by the external account service.
//!
//! The relay never writes tenants; it only reads them through a
//! [`TenantDirectory`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    Suspended,
}

impl AccountStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }

    /// Anything that is not explicitly active is treated as suspended.
    #[must_use]
    pub fn from_db(value: &str) -> Self {
        if value.eq_ignore_ascii_case("active") {
            Self::Active
        } else {
            Self::Suspended
        }
    }
}

/// Limits of the plan a tenant is subscribed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    #[serde(default)]
    pub monthly: Option<u64>,

    /// Reported to the tenant, not enforced.
    #[serde(default)]
    pub daily: Option<u64>,
}

/// A tenant as stored by the account service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub username: String,
    pub secret: String,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub limits: PlanLimits,
    /// SHA-256 hex digest of the tenant's API token, if one was issued.
    #[serde(default)]
    pub api_token_digest: Option<String>,
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("status", &self.status)
            .field("limits", &self.limits)
            .field("api_token_digest", &self.api_token_digest.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The authenticated identity a session or API request acts as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantIdentity {
    pub id: TenantId,
    pub username: String,
    pub limits: PlanLimits,
}

impl From<&Tenant> for TenantIdentity {
    fn from(tenant: &Tenant) -> Self {
        Self {
            id: tenant.id,
            username: tenant.username.clone(),
            limits: tenant.limits,
        }
    }
}

/// Read access to tenant and plan records.
#[async_trait]
pub trait TenantDirectory: Send + Sync + fmt::Debug {
    async fn by_username(&self, username: &str) -> crate::Result<Option<Tenant>>;

    async fn by_token_digest(&self, digest: &str) -> crate::Result<Option<Tenant>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let tenant = Tenant {
            id: TenantId(7),
            username: "acme".to_string(),
            secret: "hunter2".to_string(),
            status: AccountStatus::Active,
            limits: PlanLimits::default(),
            api_token_digest: Some("abcd".to_string()),
        };

        let debug = format!("{tenant:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("abcd"));
        assert!(debug.contains("acme"));
    }

    #[test]
    fn unknown_status_is_not_active() {
        assert_eq!(AccountStatus::from_db("ACTIVE"), AccountStatus::Active);
        assert_eq!(AccountStatus::from_db("pending"), AccountStatus::Suspended);
        assert_eq!(AccountStatus::Suspended.as_str(), "suspended");
    }
}
