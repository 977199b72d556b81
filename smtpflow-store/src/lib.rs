pub mod backends;
pub mod credentials;
pub mod error;
pub mod events;
pub mod quota;
pub mod tenant;

pub use backends::{MemoryStore, SqliteStore, TestStore};
pub use credentials::{AuthError, AuthFailure, CredentialStore};
pub use error::{Result, StoreError};
pub use events::{
    BounceType, ClientMetadata, DeliveryEvent, EventKind, EventRecorder, MessageId,
    MessageRecord, MessageStatus, NewMessage, Recorded,
};
pub use quota::{Admission, PeriodKey, Quota, QuotaLedger};
pub use tenant::{AccountStatus, PlanLimits, Tenant, TenantDirectory, TenantId, TenantIdentity};
