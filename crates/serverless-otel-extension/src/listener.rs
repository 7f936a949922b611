//! TCP listener setup shared by the two local HTTP servers.

use crate::config::ListenerConfig;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpSocket};

/// Hostname Lambda resolves to the execution environment.
pub const SANDBOX_HOSTNAME: &str = "sandbox.localdomain";

/// Resolves the configured host and binds a listener with the configured backlog.
///
/// # Errors
///
/// Returns an error if the host cannot be resolved or the address cannot be bound.
pub async fn bind(config: &ListenerConfig) -> io::Result<TcpListener> {
    let addr = resolve(&config.host, config.port).await?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;

    socket.listen(config.backlog)
}

async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("host {host} did not resolve to any address"),
            )
        })
}

/// Returns the URI other processes in the execution environment use to reach
/// a listener bound at `addr`.
///
/// A listener bound to an unspecified address is advertised through the
/// Lambda sandbox hostname when running inside Lambda
/// (`AWS_LAMBDA_FUNCTION_NAME` is set) and through loopback otherwise.
pub fn destination_uri(addr: SocketAddr) -> String {
    if !addr.ip().is_unspecified() {
        return format!("http://{addr}/");
    }

    if std::env::var("AWS_LAMBDA_FUNCTION_NAME").is_ok() {
        format!("http://{}:{}/", SANDBOX_HOSTNAME, addr.port())
    } else {
        format!("http://{}/", SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()))
    }
}
