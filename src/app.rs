//! Application assembly and serving.

use arc_swap::ArcSwap;
use axum::extract::ConnectInfo;
use std::sync::Arc;
use std::time::Duration;

use veil_core::config::{Config, RouterConfig, RouterWatcher};
use veil_core::crypto::Encryptor;
use veil_core::keys::ApiKeyStore;
use veil_core::kv::KvStore;
use veil_core::rate_limit::IpRateLimiter;
use veil_core::vault::Vault;
use veil_core::webhook::{WebhookDestination, WebhookDispatcher};
use veil_detector::{Detector, DetectorConfig, Sensitivity};
use veil_guard::audit::SkillAuditor;
use veil_guard::injection::ThreatLevel;
use veil_guard::{CanaryStore, OutputGuardrail, PromptGuard, SessionTracker};
use veil_provider::{ProviderRouter, UpstreamClient};
use veil_server::AppState;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub struct Application {
    state: AppState,
    app_router: axum::Router,
    listen_addr: String,
    tls: Option<(String, String)>,
    _router_watcher: Option<RouterWatcher>,
}

impl Application {
    /// Load configuration, connect backing services, and assemble the
    /// pipeline. Configuration errors here are fatal.
    pub async fn build(listen_addr_override: Option<String>) -> anyhow::Result<Self> {
        let mut config = Config::from_env()?;
        if let Some(listen_addr) = listen_addr_override {
            config.listen_addr = listen_addr;
        }

        let sensitivity: Sensitivity = config
            .sensitivity
            .parse()
            .map_err(|e: String| anyhow::anyhow!("VEIL_SENSITIVITY: {e}"))?;
        let block_threshold: ThreatLevel = config
            .block_threshold
            .parse()
            .map_err(|e: String| anyhow::anyhow!("VEIL_BLOCK_THRESHOLD: {e}"))?;

        let kv = Arc::new(
            KvStore::connect(config.redis_addr.as_deref(), config.redis_password.as_deref())
                .await,
        );

        let encryptor = match &config.encryption_key {
            Some(key) => Some(Encryptor::new(key)?),
            None => None,
        };
        let vault = Arc::new(Vault::new(
            kv.clone(),
            encryptor,
            Duration::from_secs(config.session_ttl_secs),
        ));

        let detector = Arc::new(Detector::new(DetectorConfig {
            sensitivity,
            allow_list: config.allow_list.clone(),
            block_list: config.block_list.clone(),
        }));

        let canaries = Arc::new(CanaryStore::new());
        let guard = Arc::new(PromptGuard::new(block_threshold, canaries.clone()));
        let tracker = Arc::new(SessionTracker::new(config.session_max_rpm));
        let guardrail = Arc::new(OutputGuardrail::new(
            Vec::new(),
            Vec::new(),
            config.max_output_tokens,
        ));
        let limiter = Arc::new(IpRateLimiter::new(
            config.rate_limit_per_min,
            Duration::from_secs(60),
        ));

        let webhooks = build_webhooks(&config);

        // Router mode when a router config is present; direct otherwise.
        let (router, router_watcher) = match &config.router_config {
            Some(path) => {
                let router_config = RouterConfig::load(path)?;
                tracing::info!(
                    providers = router_config.providers.len(),
                    routes = router_config.routes.len(),
                    "router mode enabled"
                );
                let router = Arc::new(ProviderRouter::new(&router_config));

                let swap = Arc::new(ArcSwap::from_pointee(router_config));
                let reload_router = router.clone();
                let watcher = RouterWatcher::start(path.clone(), swap, move |new_config| {
                    reload_router.update_from_config(new_config);
                })?;
                (Some(router), Some(watcher))
            }
            None => {
                tracing::info!(
                    target = config.target_url.as_deref().unwrap_or_default(),
                    "single-target mode"
                );
                (None, None)
            }
        };

        let tls = config
            .tls_cert
            .clone()
            .zip(config.tls_key.clone());
        let listen_addr = config.listen_addr.clone();

        let state = AppState {
            config: Arc::new(config),
            detector,
            vault,
            keys: Arc::new(ApiKeyStore::new(kv)),
            guard,
            canaries,
            tracker,
            guardrail,
            auditor: Arc::new(SkillAuditor::new()),
            limiter,
            webhooks,
            upstream: Arc::new(UpstreamClient::new()),
            router,
        };
        let app_router = veil_server::build_router(state.clone());

        Ok(Self {
            state,
            app_router,
            listen_addr,
            tls,
            _router_watcher: router_watcher,
        })
    }

    /// Serve until SIGINT/SIGTERM, drain with a deadline, then release
    /// background resources.
    pub async fn serve(self) -> anyhow::Result<()> {
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = tx.send(true);
        });

        match &self.tls {
            Some((cert, key)) => {
                serve_tls(
                    &self.listen_addr,
                    cert,
                    key,
                    self.app_router.clone(),
                    rx.clone(),
                )
                .await?;
            }
            None => {
                serve_http(&self.listen_addr, self.app_router.clone(), rx.clone()).await?;
            }
        }

        // Server drained; stop side channels, dispatcher drains its queue.
        if let Some(webhooks) = &self.state.webhooks {
            webhooks.close().await;
        }
        self.state.limiter.close();
        self.state.tracker.close();

        tracing::info!("server shut down");
        Ok(())
    }
}

fn build_webhooks(config: &Config) -> Option<Arc<WebhookDispatcher>> {
    let mut destinations = Vec::new();
    if let Some(url) = &config.webhook_url {
        destinations.push(WebhookDestination::generic(
            url.clone(),
            config.webhook_secret.clone(),
        ));
    }
    if let Some(url) = &config.slack_webhook_url {
        destinations.push(WebhookDestination::slack(url.clone()));
    }
    if let Some(url) = &config.discord_webhook_url {
        destinations.push(WebhookDestination::discord(url.clone()));
    }
    if destinations.is_empty() {
        return None;
    }
    Some(Arc::new(WebhookDispatcher::new(
        destinations,
        reqwest::Client::new(),
    )))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn serve_http(
    addr: &str,
    app_router: axum::Router,
    rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!("starting HTTP server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let mut graceful_rx = rx.clone();
    let graceful = async move {
        let _ = graceful_rx.wait_for(|v| *v).await;
    };

    let mut deadline_rx = rx;
    let deadline = async move {
        let _ = deadline_rx.wait_for(|v| *v).await;
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
    };

    let server = axum::serve(
        listener,
        app_router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(graceful);

    tokio::select! {
        result = server => result?,
        () = deadline => {
            tracing::warn!("shutdown deadline reached, dropping open connections");
        }
    }
    Ok(())
}

async fn serve_tls(
    addr: &str,
    cert_path: &str,
    key_path: &str,
    app_router: axum::Router,
    mut rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    use rustls_pki_types::pem::PemObject;
    use rustls_pki_types::{CertificateDer, PrivateKeyDer};

    let certs: Vec<CertificateDer<'static>> =
        CertificateDer::pem_file_iter(cert_path)?.collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_file(key_path)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    tracing::info!("starting HTTPS server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = result?;
                let acceptor = tls_acceptor.clone();
                let router = app_router.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let io = hyper_util::rt::TokioIo::new(tls_stream);
                            let service = hyper::service::service_fn(
                                move |req: hyper::Request<hyper::body::Incoming>| {
                                    let router = router.clone();
                                    async move {
                                        let (parts, body) = req.into_parts();
                                        let body = axum::body::Body::new(body);
                                        let mut req = axum::http::Request::from_parts(parts, body);
                                        req.extensions_mut().insert(ConnectInfo(peer_addr));
                                        Ok::<_, std::convert::Infallible>(
                                            tower::ServiceExt::oneshot(router, req)
                                                .await
                                                .expect("infallible"),
                                        )
                                    }
                                },
                            );
                            if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                                hyper_util::rt::TokioExecutor::new(),
                            )
                            .serve_connection(io, service)
                            .await
                            {
                                tracing::debug!("TLS connection error from {peer_addr}: {e}");
                            }
                        }
                        Err(e) => tracing::debug!("TLS accept error from {peer_addr}: {e}"),
                    }
                });
            }
            _ = rx.wait_for(|v| *v) => {
                tracing::info!("stopping TLS listener, draining connections");
                break;
            }
        }
    }

    tokio::time::sleep(Duration::from_secs(1).min(SHUTDOWN_DEADLINE)).await;
    Ok(())
}
