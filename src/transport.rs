//! Upstream transports
//!
//! The proxy talks to the real API server through a [`RoundTrip`] built by a
//! [`TransportFactory`] from the resolved cluster configuration. Two flavours
//! are needed per proxy lifetime: the default one (HTTP/2 allowed) shared by
//! all regular requests, and an HTTP/1.1-only one for SPDY upgrades, since
//! `exec`, `attach` and `port-forward` streams cannot run over HTTP/2.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::{Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use kube::client::ConfigExt;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Resolved upstream cluster configuration.
///
/// Wraps a [`kube::Config`] and keeps the bearer token in plain form so the
/// request handler can swap it into outbound requests.
#[derive(Clone)]
pub struct ClusterConfig {
    config: kube::Config,
    bearer_token: Option<String>,
}

impl ClusterConfig {
    /// Wraps a resolved client configuration.
    ///
    /// The bearer token is the user's inline `token`, falling back to the
    /// contents of `tokenFile`.
    pub fn new(config: kube::Config) -> Self {
        let inline = config
            .auth_info
            .token
            .as_ref()
            .map(|token| token.expose_secret().to_string());

        let bearer_token = inline
            .or_else(|| {
                let path = config.auth_info.token_file.as_ref()?;
                match std::fs::read_to_string(path) {
                    Ok(token) => Some(token.trim().to_string()),
                    Err(e) => {
                        warn!(path = %path, error = %e, "could not read token file");
                        None
                    }
                }
            })
            .filter(|token| !token.is_empty());

        Self {
            config,
            bearer_token,
        }
    }

    /// Overrides the upstream bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.bearer_token = (!token.is_empty()).then_some(token);
        self
    }

    /// API server URL.
    pub fn host(&self) -> &Uri {
        &self.config.cluster_url
    }

    /// Bearer token to present upstream, if the user authenticates with one.
    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    /// Underlying client configuration.
    pub fn kube_config(&self) -> &kube::Config {
        &self.config
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("host", &self.config.cluster_url)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A single request/response exchange with the API server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoundTrip: Send + Sync {
    /// Sends `request` (absolute URI) upstream and returns the response.
    async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>>;
}

/// Builds upstream transports from a cluster configuration.
#[cfg_attr(test, mockall::automock)]
pub trait TransportFactory: Send + Sync {
    /// Builds a transport; `disable_http2` restricts ALPN to `http/1.1`.
    fn build(&self, cluster: &ClusterConfig, disable_http2: bool) -> Result<Arc<dyn RoundTrip>>;
}

type HttpsClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Transport backed by a pooled hyper client using the cluster's TLS settings.
#[derive(Clone)]
pub struct HyperTransport {
    client: HttpsClient,
}

#[async_trait]
impl RoundTrip for HyperTransport {
    async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        Ok(response.map(Body::new))
    }
}

/// Default [`TransportFactory`] deriving TLS (CA, client certificates) from
/// the kube configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeTransportFactory;

impl TransportFactory for KubeTransportFactory {
    fn build(&self, cluster: &ClusterConfig, disable_http2: bool) -> Result<Arc<dyn RoundTrip>> {
        // work on a copy, the caller's configuration stays untouched
        let config = cluster.kube_config().clone();

        let mut tls = config
            .rustls_client_config()
            .map_err(|e| Error::TransportConstruction(e.to_string()))?;
        // ALPN is decided by the connector builder below
        tls.alpn_protocols.clear();

        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1();
        let connector = if disable_http2 {
            builder.build()
        } else {
            builder.enable_http2().build()
        };

        debug!(host = %config.cluster_url, disable_http2, "built upstream transport");

        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Arc::new(HyperTransport { client }))
    }
}
