use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, routing::get};
use storefront_auth::{AuthState, SessionOrchestrator, SystemClock, router};
use storefront_auth_postgres::PostgresAuthStorage;
use tokio::{sync::watch, task::JoinHandle};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

use crate::config::{AppConfig, StorageBackend};

pub struct StorefrontServer {
    addr: SocketAddr,
    app: Router,
    orchestrator: Arc<SessionOrchestrator>,
    purge_interval: Duration,
    shutdown_grace: Duration,
}

pub fn build_app(cfg: &AppConfig, orchestrator: Arc<SessionOrchestrator>) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    router(AuthState::new(orchestrator))
        .route("/readyz", get(readyz))
        // Middleware stack (order: compression/trace -> body limit)
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri().path(),
                        http.status_code = tracing::field::Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record("http.status_code", res.status().as_u16());
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

async fn readyz() -> &'static str {
    "ready"
}

/// Builds the session orchestrator over the configured storage backend.
pub async fn build_orchestrator(cfg: &AppConfig) -> anyhow::Result<Arc<SessionOrchestrator>> {
    let orchestrator = match cfg.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory auth storage; sessions are lost on restart");
            SessionOrchestrator::in_memory(cfg.auth.clone()).await?
        }
        StorageBackend::Postgres => {
            let pg = cfg
                .storage
                .postgres
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("storage.postgres section is missing"))?;
            let storage = PostgresAuthStorage::connect(&pg.url, pg.pool_size).await?;
            if pg.run_migrations {
                storage.migrate().await?;
            }
            SessionOrchestrator::new(storage.stores(), Arc::new(SystemClock), cfg.auth.clone())
                .await?
        }
    };
    Ok(Arc::new(orchestrator))
}

/// Runs [`SessionOrchestrator::purge`] every `interval` until `stop` flips.
pub fn spawn_purge_task(
    orchestrator: Arc<SessionOrchestrator>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match orchestrator.purge(orchestrator.now()).await {
                        Ok(report) => tracing::debug!(
                            revocations = report.revocations,
                            sessions = report.sessions,
                            verification_tokens = report.verification_tokens,
                            "purge completed"
                        ),
                        Err(e) => tracing::warn!(error = %e, "purge failed"),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("purge task stopped");
    })
}

pub struct ServerBuilder {
    config: AppConfig,
    orchestrator: Option<Arc<SessionOrchestrator>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            orchestrator: None,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Uses an existing orchestrator instead of building one from the
    /// storage configuration.
    pub fn with_orchestrator(mut self, orchestrator: Arc<SessionOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub async fn build(self) -> anyhow::Result<StorefrontServer> {
        let orchestrator = match self.orchestrator {
            Some(o) => o,
            None => build_orchestrator(&self.config).await?,
        };
        let app = build_app(&self.config, Arc::clone(&orchestrator));
        Ok(StorefrontServer {
            addr: self.config.addr(),
            app,
            orchestrator,
            purge_interval: self.config.auth.revocation.purge_interval,
            shutdown_grace: self.config.server.shutdown_grace,
        })
    }
}

impl StorefrontServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn app(&self) -> Router {
        self.app.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        let purge = spawn_purge_task(Arc::clone(&self.orchestrator), self.purge_interval, stop_rx);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        let _ = stop_tx.send(true);
        if tokio::time::timeout(self.shutdown_grace, purge).await.is_err() {
            tracing::warn!("purge task did not stop within the shutdown grace period");
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
