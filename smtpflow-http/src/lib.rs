//! HTTP front door for smtpflow
//!
//! # Endpoints
//!
//! - **`GET /t/open/{tracking_id}`** - open pixel, always a 1x1 GIF
//! - **`GET /t/click/{tracking_id}?url=`** - click redirect
//! - **`POST /t/bounce`**, **`POST /t/spam`** - provider webhooks, guarded by
//!   the `x-bounce-secret` header
//! - **`POST /api/send`** - submit a message with a bearer token
//! - **`GET /api/usage`** - consumption for the current period
//! - **`GET /api/messages/{tracking_id}`** - status and events of a message
//! - **`GET /health`**
//!
//! Tracking events are recorded by a detached [`DispatchWorker`], so the
//! tracking endpoints never wait on storage.

use std::sync::Arc;

use smtpflow_delivery::Submitter;
use smtpflow_store::{CredentialStore, EventRecorder};

pub mod api;
pub mod client;
mod config;
pub mod dispatcher;
mod error;
mod server;
pub mod tracking;

pub use config::HttpConfig;
pub use dispatcher::{DispatchWorker, EventDispatcher, TrackingEvent};
pub use error::{ApiError, FieldError, HttpError};
pub use server::{HttpServer, router};

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub credentials: CredentialStore,
    pub submitter: Submitter,
    pub recorder: Arc<dyn EventRecorder>,
    pub dispatcher: EventDispatcher,
    pub bounce_secret: Option<Arc<str>>,
    pub trust_proxy: bool,
}

impl AppState {
    /// State for `config`. The returned worker must be spawned for tracking
    /// events to be recorded.
    #[must_use]
    pub fn new(
        config: &HttpConfig,
        credentials: CredentialStore,
        submitter: Submitter,
        recorder: Arc<dyn EventRecorder>,
    ) -> (Self, DispatchWorker) {
        let (dispatcher, worker) =
            EventDispatcher::new(Arc::clone(&recorder), config.dispatcher_capacity);

        let state = Self {
            credentials,
            submitter,
            recorder,
            dispatcher,
            bounce_secret: config
                .bounce_secret
                .as_deref()
                .filter(|secret| !secret.is_empty())
                .map(Arc::from),
            trust_proxy: config.trust_proxy,
        };

        (state, worker)
    }
}
