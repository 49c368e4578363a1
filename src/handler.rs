//! Request handling
//!
//! Every inbound request goes through the same pass:
//! - the session token is checked and swapped for the upstream credential
//! - SPDY upgrades get a dedicated HTTP/1.1-only transport
//! - resource bodies of `PUT`/`POST` (and server-side apply) are translated,
//!   as JSON or as protobuf depending on `Content-Type`
//! - the request is forwarded and upgraded connections are spliced together

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, Version};
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::translate::Translator;
use crate::transport::{ClusterConfig, RoundTrip, TransportFactory};

// ============================================================================
// Constants
// ============================================================================

/// Maximum request body buffered for translation (64 MiB)
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Content type of server-side apply patches, which carry a full object
const APPLY_PATCH_CONTENT_TYPE: &str = "application/apply-patch+yaml";

/// Content type of protobuf-encoded resources
const PROTOBUF_CONTENT_TYPE: &str = "application/vnd.kubernetes.protobuf";

/// Headers meaningful only for a single connection
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// ============================================================================
// State
// ============================================================================

/// Shared state of the request handler.
#[derive(Clone)]
pub struct ProxyState {
    token: Arc<str>,
    cluster: Arc<ClusterConfig>,
    transport: Arc<dyn RoundTrip>,
    factory: Arc<dyn TransportFactory>,
    translator: Arc<RwLock<Arc<Translator>>>,
}

impl ProxyState {
    /// Builds the handler state and its default (HTTP/2 capable) transport.
    pub fn new(
        token: impl Into<Arc<str>>,
        cluster: ClusterConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let transport = factory.build(&cluster, false)?;
        Ok(Self {
            token: token.into(),
            cluster: Arc::new(cluster),
            transport,
            factory,
            translator: Arc::new(RwLock::new(Arc::new(Translator::new("")))),
        })
    }

    /// Current translator.
    pub fn translator(&self) -> Arc<Translator> {
        self.translator.read().clone()
    }

    /// Replaces the translator with the result of `update`.
    pub fn update_translator(&self, update: impl FnOnce(&Translator) -> Translator) {
        let mut translator = self.translator.write();
        *translator = Arc::new(update(&translator));
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Authenticates, rewrites and forwards one request to the API server.
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    mut request: Request<Body>,
) -> Result<Response> {
    authorize(request.headers(), &state.token)?;

    let transport = if is_spdy_request(request.headers()) {
        debug!(path = %request.uri().path(), "SPDY upgrade, using HTTP/1.1 transport");
        state
            .factory
            .build(&state.cluster, true)
            .inspect_err(|e| warn!(error = %e, "could not build SPDY transport"))?
    } else {
        state.transport.clone()
    };

    let upgrade = is_upgrade_request(request.headers());
    let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

    let (mut parts, body) = request.into_parts();
    debug!(method = %parts.method, uri = %parts.uri, "forwarding request");

    let body = if let Some(format) = body_format(&parts.method, &parts.headers) {
        let bytes = axum::body::to_bytes(body, MAX_BODY_SIZE)
            .await
            .map_err(|e| Error::BodyRead(e.to_string()))
            .inspect_err(|e| warn!(error = %e, "could not read request body"))?;

        if bytes.is_empty() {
            Body::from(bytes)
        } else {
            let translator = state.translator();
            let translated = match format {
                BodyFormat::Json => translator.translate_or_passthrough(bytes),
                BodyFormat::Protobuf => translator.translate_protobuf_or_passthrough(bytes),
            };
            parts
                .headers
                .insert(CONTENT_LENGTH, HeaderValue::from(translated.len()));
            parts.headers.remove(TRANSFER_ENCODING);
            Body::from(translated)
        }
    } else {
        body
    };

    prepare_upstream_headers(&mut parts.headers, upgrade);
    set_upstream_credentials(&mut parts.headers, state.cluster.bearer_token())?;
    parts.uri = upstream_uri(state.cluster.host(), &parts.uri)?;
    if let Some(authority) = parts.uri.authority() {
        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|e| Error::Internal(e.to_string()))?;
        parts.headers.insert(HOST, host);
    }
    parts.version = Version::HTTP_11;

    let mut response = transport
        .round_trip(Request::from_parts(parts, body))
        .await
        .inspect_err(|e| warn!(error = %e, "upstream request failed"))?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(tunnel(client_upgrade, upstream_upgrade));
        }
        return Ok(response);
    }

    strip_hop_by_hop(response.headers_mut());
    Ok(response)
}

fn authorize(headers: &HeaderMap, token: &str) -> Result<()> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(presented) if presented == token => Ok(()),
        Some(_) => Err(Error::Unauthorized("invalid session token".to_string())),
        None => Err(Error::Unauthorized("missing session token".to_string())),
    }
}

/// Whether the request upgrades to SPDY (`exec`, `attach`, `port-forward`).
pub fn is_spdy_request(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().starts_with("spdy/"))
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Encoding of a request body that carries a full resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyFormat {
    Json,
    Protobuf,
}

/// Which translation applies to the request body, if any.
fn body_format(method: &Method, headers: &HeaderMap) -> Option<BodyFormat> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match *method {
        Method::PUT | Method::POST if content_type.starts_with(PROTOBUF_CONTENT_TYPE) => {
            Some(BodyFormat::Protobuf)
        }
        Method::PUT | Method::POST => Some(BodyFormat::Json),
        Method::PATCH if content_type.starts_with(APPLY_PATCH_CONTENT_TYPE) => {
            Some(BodyFormat::Json)
        }
        _ => None,
    }
}

/// Drops hop-by-hop headers, keeping `Connection`/`Upgrade` for upgrades.
fn prepare_upstream_headers(headers: &mut HeaderMap, upgrade: bool) {
    let kept = upgrade.then(|| (headers.get(CONNECTION).cloned(), headers.get(UPGRADE).cloned()));

    strip_hop_by_hop(headers);

    if let Some((connection, protocol)) = kept {
        if let Some(connection) = connection {
            headers.insert(CONNECTION, connection);
        }
        if let Some(protocol) = protocol {
            headers.insert(UPGRADE, protocol);
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Replaces the session token with the upstream bearer token, if any.
fn set_upstream_credentials(headers: &mut HeaderMap, bearer_token: Option<&str>) -> Result<()> {
    headers.remove(AUTHORIZATION);
    if let Some(token) = bearer_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::Internal(format!("invalid upstream token: {e}")))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(())
}

/// Joins the API server URL (which may carry a path prefix) with the request path.
fn upstream_uri(host: &Uri, request: &Uri) -> Result<Uri> {
    let prefix = host.path().trim_end_matches('/');
    let path_and_query = request
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Uri::builder().path_and_query(format!("{prefix}{path_and_query}"));
    if let Some(scheme) = host.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = host.authority() {
        builder = builder.authority(authority.clone());
    }

    builder
        .build()
        .map_err(|e| Error::Internal(format!("invalid upstream uri: {e}")))
}

async fn tunnel(client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match futures::future::try_join(client, upstream).await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(error = %e, "connection upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(sent, received, "upgraded connection closed"),
        Err(e) => debug!(error = %e, "upgraded connection ended"),
    }
}
