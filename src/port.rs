use std::net::{Ipv4Addr, TcpListener, ToSocketAddrs};

use tracing::debug;

use crate::error::{Error, LOCALHOST_HINT, Result};

/// Address the proxy listens on, and therefore where ports are reserved.
pub(crate) const LISTEN_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Signature of the function used to reserve the proxy port, injectable for tests.
pub type PortGetter = fn(&str) -> Result<u16>;

/// Finds a free TCP port on `host`.
///
/// The host is resolved first so that a resolver failure is reported as
/// [`Error::PortUnavailable`] (with a hint) instead of a plain socket error.
/// The port itself is reserved on the IPv4 loopback the proxy serves from,
/// whichever family `host` resolved to first. The listener is released before returning, so the port is only very likely
/// to still be free when the caller binds it.
pub fn allocate_port(host: &str) -> Result<u16> {
    let addrs: Vec<_> = (host, 0)
        .to_socket_addrs()
        .map_err(|source| Error::PortUnavailable {
            source,
            hint: LOCALHOST_HINT,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(Error::PortUnavailable {
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for host '{host}'"),
            ),
            hint: LOCALHOST_HINT,
        });
    }

    let listener = TcpListener::bind((LISTEN_ADDR, 0)).map_err(Error::Port)?;
    let port = listener.local_addr().map_err(Error::Port)?.port();
    drop(listener);

    debug!(host, port, "found available port");
    Ok(port)
}

/// Generates the session token clients must present to the proxy.
pub fn generate_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shortened form of a token, safe to print in logs.
pub(crate) fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{prefix}…")
}
