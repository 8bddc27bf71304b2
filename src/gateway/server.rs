//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info, warn};

use super::gate::TrustGate;
use super::router::{AppState, create_router};
use crate::cert::{ValidationCache, WebPkiChainValidator};
use crate::config::Config;
use crate::forward::Dispatcher;
use crate::{Error, Result};

/// Upper bound on how often expired verdicts are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Certificate gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared request state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway
    ///
    /// Validates the configuration and decodes the trusted CA, so a bad CA
    /// fails here rather than on the first request.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(ValidationCache::new(
            Arc::new(WebPkiChainValidator::new()),
            &config.cache,
        ));
        let gate = Arc::new(TrustGate::from_config(&config.gate, Arc::clone(&cache))?);
        let dispatcher = Arc::new(Dispatcher::new(&config.forwarding)?);

        let state = Arc::new(AppState {
            dispatcher,
            gate,
            cache,
        });

        Ok(Self { config, state })
    }

    /// The HTTP service, without a listener
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("CERTGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            targets = ?self.config.forwarding.targets,
            change_origin = self.config.forwarding.change_origin,
            "Forwarding"
        );

        if let Some(ca) = self.state.gate.ca() {
            info!(
                ca = %ca.subject(),
                header = %self.config.gate.client_cert_header,
                verified_header = %self.config.gate.verified_header,
                "CLIENT CERTIFICATE VERIFICATION enabled"
            );
        } else {
            warn!("CLIENT CERTIFICATE VERIFICATION disabled - all requests are forwarded unchecked");
        }

        if self.config.cache.enabled {
            info!(
                ttl = ?self.config.cache.ttl,
                max_entries = self.config.cache.max_entries,
                "Verdict cache enabled"
            );
        }
        info!(excluded = ?self.config.gate.excluded_paths, "Unverified paths");
        info!("============================================================");

        // Sweep expired verdicts in the background
        if self.config.cache.enabled {
            let cache = Arc::clone(&self.state.cache);
            let period = self
                .config
                .cache
                .ttl
                .clamp(Duration::from_secs(1), SWEEP_INTERVAL);
            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            cache.evict_expired();
                            debug!(size = cache.stats().size, "Swept verdict cache");
                        }
                        _ = shutdown_rx.recv() => {
                            break;
                        }
                    }
                }
            });
        }

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
