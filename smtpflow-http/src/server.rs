//! HTTP front door server

use std::net::SocketAddr;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use smtpflow_common::Signal;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

use crate::{AppState, HttpConfig, HttpError, api, tracking};

/// Every route of the front door, bound to `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/send", post(api::send))
        .route("/api/usage", get(api::usage))
        .route("/api/messages/{tracking_id}", get(api::message))
        .route("/t/open/{tracking_id}", get(tracking::open))
        .route("/t/click/{tracking_id}", get(tracking::click))
        .route("/t/bounce", post(tracking::bounce))
        .route("/t/spam", post(tracking::spam))
        .with_state(state)
}

/// Tracking endpoints, webhooks and the send API on one listener.
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// Bind the listener and build the router.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the configured address fails.
    pub async fn new(config: &HttpConfig, state: AppState) -> Result<Self, HttpError> {
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|e| HttpError::BindError {
                address: config.listen_address.clone(),
                source: e,
            })?;

        tracing::info!(
            address = %config.listen_address,
            "HTTP server bound successfully"
        );

        let router = router(state).layer(
            ServiceBuilder::new()
                .layer(TimeoutLayer::new(config.request_timeout()))
                .layer(DefaultBodyLimit::max(config.max_body_bytes)),
        );

        Ok(Self { listener, router })
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Serve requests until a shutdown signal is received
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a runtime error.
    pub async fn serve(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), HttpError> {
        tracing::info!("HTTP server starting");

        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server received shutdown signal");
        })
        .await
        .map_err(|e| HttpError::ServerError(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
