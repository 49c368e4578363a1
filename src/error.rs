//! Error types for the proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Hint shown when the local host name cannot be resolved.
pub const LOCALHOST_HINT: &str =
    "Review your configuration to make sure 'localhost' is resolved correctly";

/// Error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bind host could not be resolved, so no port can be reserved
    #[error("could not find available ports: {source}")]
    PortUnavailable {
        /// Resolver failure
        #[source]
        source: std::io::Error,
        /// User-actionable remediation
        hint: &'static str,
    },

    /// Any other failure while reserving a local port
    #[error("could not find a free port to start proxy server: {0}")]
    Port(#[source] std::io::Error),

    /// The upstream kubeconfig could not be loaded or resolved
    #[error("could not read kubeconfig: {0}")]
    KubeconfigRead(String),

    /// The temporary kubeconfig could not be written
    #[error("could not write kubeconfig: {0}")]
    KubeconfigWrite(String),

    /// The embedded certificate pair is malformed
    #[error("could not load proxy certificate: {0}")]
    Certificate(String),

    /// Request did not carry the session token
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Building the upstream transport failed
    #[error("could not build upstream transport: {0}")]
    TransportConstruction(String),

    /// Reading the inbound request body failed
    #[error("could not read the request body: {0}")]
    BodyRead(String),

    /// Rewriting a resource body failed; never returned to clients
    #[error("could not translate resource: {0}")]
    Translation(String),

    /// The API server could not be reached
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Remediation hint for errors the user can act on.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::PortUnavailable { hint, .. } => Some(hint),
            _ => None,
        }
    }

    /// Whether the error is caused by the user's environment rather than a bug.
    pub fn is_user_error(&self) -> bool {
        self.hint().is_some()
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // kubectl renders Status objects as readable errors
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.to_string(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<kube::config::KubeconfigError> for Error {
    fn from(e: kube::config::KubeconfigError) -> Self {
        Error::KubeconfigRead(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Translation(e.to_string())
    }
}
