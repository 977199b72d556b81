//! Credential resolution for SMTP AUTH and the HTTP send API.
//!
//! SMTP clients present a username and an opaque sending secret. API clients
//! present a bearer token which is stored only as its SHA-256 digest, so the
//! two credentials live in distinct namespaces but resolve to the same
//! [`TenantIdentity`].

use std::sync::Arc;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::{
    StoreError,
    tenant::{AccountStatus, Tenant, TenantDirectory, TenantIdentity},
};

/// Why a credential was refused. Only ever logged, never shown to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    UnknownUser,
    SecretMismatch,
    Inactive,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication failed")]
    Rejected(AuthFailure),

    #[error("Credential lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Compared against when the username is unknown, so unknown users and wrong
/// secrets take the same path.
const DUMMY_SECRET: &[u8] = b"smtpflow-unknown-user-placeholder";

#[derive(Debug, Clone)]
pub struct CredentialStore {
    directory: Arc<dyn TenantDirectory>,
}

impl CredentialStore {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self { directory }
    }

    /// Resolve an SMTP username/secret pair.
    ///
    /// # Errors
    /// [`AuthError::Rejected`] when the user is unknown, the secret does not
    /// match or the account is not active; [`AuthError::Store`] when the
    /// directory could not be queried.
    pub async fn resolve(&self, username: &str, secret: &str) -> Result<TenantIdentity, AuthError> {
        let tenant = self.directory.by_username(username).await?;

        let Some(tenant) = tenant else {
            let _ = DUMMY_SECRET.ct_eq(secret.as_bytes());
            debug!(username, "Rejecting credentials for unknown user");
            return Err(AuthError::Rejected(AuthFailure::UnknownUser));
        };

        if !bool::from(tenant.secret.as_bytes().ct_eq(secret.as_bytes())) {
            debug!(username, tenant = %tenant.id, "Rejecting credentials with mismatched secret");
            return Err(AuthError::Rejected(AuthFailure::SecretMismatch));
        }

        Self::active(&tenant)
    }

    /// Resolve a bearer token presented to the HTTP API.
    ///
    /// # Errors
    /// As [`CredentialStore::resolve`].
    pub async fn resolve_bearer(&self, token: &str) -> Result<TenantIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Rejected(AuthFailure::UnknownUser));
        }

        let digest = token_digest(token);
        let Some(tenant) = self.directory.by_token_digest(&digest).await? else {
            debug!("Rejecting unknown API token");
            return Err(AuthError::Rejected(AuthFailure::UnknownUser));
        };

        Self::active(&tenant)
    }

    fn active(tenant: &Tenant) -> Result<TenantIdentity, AuthError> {
        if tenant.status == AccountStatus::Active {
            Ok(TenantIdentity::from(tenant))
        } else {
            debug!(tenant = %tenant.id, status = tenant.status.as_str(), "Rejecting inactive tenant");
            Err(AuthError::Rejected(AuthFailure::Inactive))
        }
    }
}

/// The digest under which an API token is stored: lowercase hex SHA-256.
#[must_use]
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        backends::MemoryStore,
        tenant::{PlanLimits, TenantId},
    };

    fn store() -> CredentialStore {
        let memory = MemoryStore::new()
            .with_tenant(Tenant {
                id: TenantId(1),
                username: "acme".to_string(),
                secret: "s3cret".to_string(),
                status: AccountStatus::Active,
                limits: PlanLimits {
                    monthly: Some(500),
                    daily: None,
                },
                api_token_digest: Some(token_digest("api-token")),
            })
            .with_tenant(Tenant {
                id: TenantId(2),
                username: "frozen".to_string(),
                secret: "s3cret".to_string(),
                status: AccountStatus::Suspended,
                limits: PlanLimits::default(),
                api_token_digest: Some(token_digest("frozen-token")),
            });

        CredentialStore::new(Arc::new(memory))
    }

    #[test]
    fn digest_matches_sha256sum() {
        assert_eq!(
            token_digest("password"),
            "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8"
        );
    }

    #[tokio::test]
    async fn resolves_active_tenant() {
        let identity = store().resolve("acme", "s3cret").await.unwrap();
        assert_eq!(identity.id, TenantId(1));
        assert_eq!(identity.limits.monthly, Some(500));
    }

    #[tokio::test]
    async fn rejects_bad_credentials() {
        let store = store();

        let err = store.resolve("acme", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected(AuthFailure::SecretMismatch)));

        let err = store.resolve("nobody", "s3cret").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected(AuthFailure::UnknownUser)));

        let err = store.resolve("frozen", "s3cret").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected(AuthFailure::Inactive)));
        assert!(err.is_rejection());
        assert_eq!(err.to_string(), "Authentication failed");
    }

    #[tokio::test]
    async fn bearer_tokens_resolve_by_digest() {
        let store = store();

        assert_eq!(
            store.resolve_bearer("api-token").await.unwrap().username,
            "acme"
        );
        assert!(store.resolve_bearer("s3cret").await.is_err());
        assert!(store.resolve_bearer("").await.is_err());
        assert!(matches!(
            store.resolve_bearer("frozen-token").await,
            Err(AuthError::Rejected(AuthFailure::Inactive))
        ));
    }
}
