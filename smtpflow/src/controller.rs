use std::{
    net::SocketAddr,
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use smtpflow_common::{Signal, internal, logging};
use smtpflow_delivery::{ComposeSettings, Relay, SmtpRelay, SubmissionSettings, Submitter};
use smtpflow_http::{AppState, DispatchWorker, HttpServer};
use smtpflow_smtp::{RelayHandler, SmtpServer, SmtpTransactionHandler};
use smtpflow_store::{
    CredentialStore, EventRecorder, MemoryStore, Quota, QuotaLedger, SqliteStore,
    TenantDirectory,
};
use tokio::sync::broadcast;

use crate::config::{Config, StoreConfig};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// An unreachable relay is not fatal; submissions fail with 451 until it
/// comes back.
async fn verify_upstream(relay: Arc<SmtpRelay>) {
    match relay.verify().await {
        Ok(()) => internal!(level = INFO, "Upstream relay {} is reachable", relay.endpoint()),
        Err(err) => internal!(
            level = WARN,
            "Upstream relay {} failed verification: {err}",
            relay.endpoint()
        ),
    }
}

/// One backend seen through each of the store traits.
struct Stores {
    tenants: Arc<dyn TenantDirectory>,
    ledger: Arc<dyn QuotaLedger>,
    recorder: Arc<dyn EventRecorder>,
}

impl Stores {
    fn shared<S>(store: S) -> Self
    where
        S: TenantDirectory + QuotaLedger + EventRecorder + 'static,
    {
        let store = Arc::new(store);

        Self {
            tenants: Arc::clone(&store) as Arc<dyn TenantDirectory>,
            ledger: Arc::clone(&store) as Arc<dyn QuotaLedger>,
            recorder: store as Arc<dyn EventRecorder>,
        }
    }

    async fn open(config: &StoreConfig) -> anyhow::Result<Self> {
        match config {
            StoreConfig::Memory { tenants } => {
                let store = MemoryStore::new();
                for tenant in tenants {
                    store.insert_tenant(tenant.clone());
                }

                internal!(
                    level = WARN,
                    "Using the in-memory store with {} tenants, nothing will survive a restart",
                    tenants.len()
                );
                Ok(Self::shared(store))
            }
            StoreConfig::Sqlite {
                path,
                pool_size,
                tenants,
            } => {
                let store = SqliteStore::open(path, *pool_size)
                    .with_context(|| format!("Unable to open {}", path.display()))?;

                for tenant in tenants {
                    let username = tenant.username.clone();
                    store
                        .upsert_tenant(tenant.clone())
                        .await
                        .with_context(|| format!("Unable to provision tenant {username}"))?;
                }

                internal!(
                    level = INFO,
                    "Using SQLite store at {} ({} tenants from configuration)",
                    path.display(),
                    tenants.len()
                );
                Ok(Self::shared(store))
            }
        }
    }
}

/// The whole relay: stores, upstream relay, SMTP listeners and the HTTP
/// front door.
#[derive(Debug)]
pub struct Smtpflow {
    config: Config,
}

impl Smtpflow {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Open the store, configure the relay and bind every listener.
    ///
    /// # Errors
    ///
    /// This function will return an error if the store cannot be opened, the
    /// relay is misconfigured, or a listener cannot be bound.
    pub async fn bind(self) -> anyhow::Result<Bound> {
        let Config {
            smtp,
            http,
            relay,
            store,
            quota,
        } = self.config;

        let stores = Stores::open(&store).await?;
        let credentials = CredentialStore::new(stores.tenants);

        let upstream =
            Arc::new(SmtpRelay::new(&relay).context("Unable to configure the upstream relay")?);
        tokio::spawn(verify_upstream(Arc::clone(&upstream)));

        let submitter = Submitter::new(
            Quota::new(stores.ledger, quota.default_monthly_limit),
            Arc::clone(&stores.recorder),
            upstream as Arc<dyn Relay>,
            SubmissionSettings {
                compose: ComposeSettings {
                    base_url: http.base_url.clone(),
                    bounce_domain: relay.domain.clone(),
                },
                sender_domain: relay.domain.clone(),
                relay_timeout: relay.timeout(),
            },
        );

        let handler: Arc<dyn SmtpTransactionHandler> =
            Arc::new(RelayHandler::new(credentials.clone(), submitter.clone()));
        let smtp = SmtpServer::bind(&smtp, handler)
            .await
            .context("Unable to start the SMTP listeners")?;

        let (state, worker) = AppState::new(&http, credentials, submitter, stores.recorder);
        let http = if http.enabled {
            Some(HttpServer::new(&http, state).await?)
        } else {
            internal!(level = INFO, "HTTP front door disabled");
            None
        };

        Ok(Bound { smtp, http, worker })
    }

    /// Run this controller, and everything it controls, until SIGINT or
    /// SIGTERM.
    ///
    /// # Errors
    ///
    /// This function will return an error if any component fails to start.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        internal!(level = INFO, "Controller running");

        let bound = self.bind().await?;

        let ret = tokio::select! {
            r = bound.serve(&SHUTDOWN_BROADCAST) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}

/// Everything bound and ready to serve.
pub struct Bound {
    smtp: SmtpServer,
    http: Option<HttpServer>,
    worker: DispatchWorker,
}

impl Bound {
    #[must_use]
    pub fn smtp_addrs(&self) -> Vec<SocketAddr> {
        self.smtp.local_addrs()
    }

    #[must_use]
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(HttpServer::local_addr)
    }

    /// Serve until `shutdown` carries [`Signal::Shutdown`]. Every component
    /// is subscribed before this returns, so a signal sent afterwards is
    /// never missed.
    pub fn serve(
        self,
        shutdown: &broadcast::Sender<Signal>,
    ) -> impl Future<Output = anyhow::Result<()>> + use<> {
        let smtp = self.smtp.serve(shutdown.subscribe());
        let worker = self.worker.run(shutdown.subscribe());
        let http_signal = shutdown.subscribe();
        let http = self.http;

        async move {
            let http = async move {
                match http {
                    Some(server) => server.serve(http_signal).await.map_err(anyhow::Error::from),
                    None => Ok(()),
                }
            };

            let (smtp, http, ()) = tokio::join!(smtp, http, worker);
            smtp?;
            http?;

            internal!(level = INFO, "All front doors stopped");
            Ok(())
        }
    }
}
