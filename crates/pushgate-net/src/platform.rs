//! Socket setup for the two transport backends.
//!
//! [`TransportBackend::Portable`] binds with the runtime's default listener.
//! [`TransportBackend::Native`] builds the socket by hand so it can enable
//! address/port reuse, dual-stack IPv6 and a deeper accept backlog. Accepted
//! streams get the same [`SocketConfig`] either way.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

pub use pushgate_config::TransportBackend;

/// Accept backlog used by the native backend.
pub const NATIVE_BACKLOG: i32 = 1024;

/// TCP options applied to every accepted connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm for lower latency. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Keepalive idle time before the first probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

/// Apply socket configuration to an accepted [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Bind a listener at `addr` using the selected backend.
///
/// Must be called from within a tokio runtime.
pub async fn bind_listener(
    addr: SocketAddr,
    backend: TransportBackend,
) -> std::io::Result<TcpListener> {
    match backend {
        TransportBackend::Portable => TcpListener::bind(addr).await,
        TransportBackend::Native => native_listener(addr),
    }
}

fn native_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;

    // Dual-stack: accept IPv4 clients on an IPv6 wildcard socket.
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(NATIVE_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Resolve the configured host and port into a bind address.
///
/// An empty host binds every IPv4 interface.
pub fn resolve_bind_address(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    let host = host.trim();
    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("host {host} resolved to no addresses"),
        )
    })
}
