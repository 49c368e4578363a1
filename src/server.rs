//! Proxy server lifecycle
//!
//! A [`Proxy`] owns the TLS listener on `127.0.0.1:<port>` and the shared
//! handler state. It is configured once after construction, started in the
//! background and shut down gracefully by the caller or by SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use parking_lot::RwLock;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::divert::DivertDriver;
use crate::error::{Error, Result};
use crate::handler::{ProxyState, proxy_handler};
use crate::kubeconfig::KubeconfigHandler;
use crate::labels::sanitize_name;
use crate::port::{LISTEN_ADDR, PortGetter, allocate_port, generate_token, redact};
use crate::transport::{ClusterConfig, KubeTransportFactory, TransportFactory};

/// Certificate served by the proxy, trusted by the written kubeconfig.
pub const CERTIFICATE_PEM: &str = include_str!("../certs/localhost.crt");

const PRIVATE_KEY_PEM: &str = include_str!("../certs/localhost.key");

/// Host the port is reserved on.
const BIND_HOST: &str = "localhost";

/// Lifecycle of a [`Proxy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Settings generated when the proxy is created.
#[derive(Clone)]
pub struct ProxyConfig {
    port: u16,
    token: String,
}

impl ProxyConfig {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Session token clients must present.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("port", &self.port)
            .field("token", &redact(&self.token))
            .finish()
    }
}

/// Intercepting proxy in front of the Kubernetes API server.
pub struct Proxy {
    config: ProxyConfig,
    state: ProxyState,
    tls: RustlsConfig,
    handle: Handle,
    phase: Arc<RwLock<Phase>>,
    server: Option<JoinHandle<()>>,
    signals: Option<JoinHandle<()>>,
}

impl Proxy {
    /// Creates a proxy for the cluster resolved by `kubeconfig`.
    pub async fn from_kubeconfig(kubeconfig: &impl KubeconfigHandler) -> Result<Self> {
        let cluster = kubeconfig.read().await?;
        Self::new(cluster)
    }

    /// Creates a proxy forwarding to `cluster`.
    pub fn new(cluster: ClusterConfig) -> Result<Self> {
        Self::with_parts(cluster, allocate_port, Arc::new(KubeTransportFactory))
    }

    /// Creates a proxy with an explicit port allocator and transport factory.
    ///
    /// # Errors
    /// Fails when no port can be reserved, the default transport cannot be
    /// built or the embedded certificate cannot be loaded.
    pub fn with_parts(
        cluster: ClusterConfig,
        port_getter: PortGetter,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let port = port_getter(BIND_HOST)
            .inspect_err(|e| warn!(error = %e, "could not find a free port"))?;
        let token = generate_token();
        let tls = tls_config()?;
        let state = ProxyState::new(token.clone(), cluster, factory)?;

        debug!(port, token = %redact(&token), "created proxy");

        Ok(Self {
            config: ProxyConfig { port, token },
            state,
            tls,
            handle: Handle::new(),
            phase: Arc::new(RwLock::new(Phase::Created)),
            server: None,
            signals: None,
        })
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn token(&self) -> &str {
        &self.config.token
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    /// Sets the owner name stamped on resources, sanitized into a label value.
    pub fn set_name(&self, name: &str) {
        let name = sanitize_name(name);
        self.state
            .update_translator(|translator| translator.clone().with_name(name));
    }

    /// Sets the divert driver applied to workloads and VirtualServices.
    pub fn set_divert(&self, driver: Arc<dyn DivertDriver>) {
        self.state
            .update_translator(|translator| translator.clone().with_divert(driver));
    }

    /// Marks resources as deployed from a sample repository.
    pub fn set_sample_repository(&self, sample_repository: bool) {
        self.state.update_translator(|translator| {
            translator
                .clone()
                .with_sample_repository(sample_repository)
        });
    }

    /// Starts serving in the background. Calling it again has no effect.
    ///
    /// Serve failures are logged, not returned.
    pub fn start(&mut self) {
        if self.server.is_some() {
            return;
        }
        *self.phase.write() = Phase::Starting;

        let addr = SocketAddr::from((LISTEN_ADDR, self.config.port));
        let router = Router::new()
            .fallback(proxy_handler)
            .with_state(self.state.clone())
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http());

        let server = axum_server::bind_rustls(addr, self.tls.clone()).handle(self.handle.clone());
        let phase = self.phase.clone();
        self.server = Some(tokio::spawn(async move {
            if let Err(e) = server.serve(router.into_make_service()).await {
                error!(%addr, error = %e, "proxy server failed");
            }
            *phase.write() = Phase::Stopped;
        }));

        let handle = self.handle.clone();
        let phase = self.phase.clone();
        tokio::spawn(async move {
            if let Some(addr) = handle.listening().await {
                info!(%addr, "proxy listening");
                mark_running(&phase);
            }
        });

        self.signals = Some(tokio::spawn(watch_signals(self.handle.clone())));
    }

    /// Resolves to the bound address once the listener is up, `None` if the
    /// proxy was not started or failed to bind.
    pub async fn listening(&self) -> Option<SocketAddr> {
        self.server.as_ref()?;
        let addr = self.handle.listening().await?;
        mark_running(&self.phase);
        Some(addr)
    }

    /// Stops accepting connections and waits up to `timeout` for in-flight
    /// requests. Does nothing if the proxy was never started.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        let Some(server) = self.server.take() else {
            debug!("proxy not started, nothing to shut down");
            return Ok(());
        };

        *self.phase.write() = Phase::ShuttingDown;
        self.handle.graceful_shutdown(Some(timeout));
        if let Some(signals) = self.signals.take() {
            signals.abort();
        }

        server
            .await
            .map_err(|e| Error::Internal(format!("proxy server task failed: {e}")))?;
        *self.phase.write() = Phase::Stopped;
        info!(port = self.config.port, "proxy stopped");
        Ok(())
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if self.server.is_some() {
            self.handle.shutdown();
        }
        if let Some(signals) = self.signals.take() {
            signals.abort();
        }
    }
}

fn mark_running(phase: &RwLock<Phase>) {
    let mut phase = phase.write();
    if *phase == Phase::Starting {
        *phase = Phase::Running;
    }
}

fn tls_config() -> Result<RustlsConfig> {
    let certs = CertificateDer::pem_slice_iter(CERTIFICATE_PEM.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Certificate(e.to_string()))?;
    let key = PrivateKeyDer::from_pem_slice(PRIVATE_KEY_PEM.as_bytes())
        .map_err(|e| Error::Certificate(e.to_string()))?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::Certificate(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Certificate(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

async fn watch_signals(handle: Handle) {
    shutdown_signal().await;
    info!("termination signal received, closing proxy");
    handle.shutdown();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
