//! Socket setup for the reliable stream and the datagram channel.
//!
//! [`SocketConfig`] carries the options applied to every socket the transport
//! opens: `TCP_NODELAY` and keepalive on streams, `SO_REUSEADDR` on listeners and
//! a larger receive buffer on the datagram socket.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Socket options applied to every socket the transport opens.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm for lower latency. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// How long a stream idles before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Enable `SO_REUSEADDR` on server sockets. Default: true except on Windows.
    pub reuse_addr: bool,
    /// `SO_RCVBUF` for the datagram socket. Default: 256 KiB.
    pub udp_recv_buffer: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            reuse_addr: !cfg!(target_os = "windows"),
            udp_recv_buffer: 256 * 1024,
        }
    }
}

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    }
}

/// Apply stream options to a connected [`TcpStream`].
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

/// Create the server's listening socket.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    TcpListener::from_std(socket.into())
}

/// Create a datagram socket bound to `addr`.
pub fn create_datagram_socket(
    addr: SocketAddr,
    config: &SocketConfig,
) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    // Best effort; some platforms cap the buffer below the request.
    let _ = socket.set_recv_buffer_size(config.udp_recv_buffer);

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}

/// The datagram address a peer should advertise in its `connect` packet.
///
/// A socket bound to the unspecified address reports `0.0.0.0`, which the
/// server cannot reply to, so the stream's local ip is substituted.
pub fn advertised_endpoint(udp_local: SocketAddr, stream_local: SocketAddr) -> SocketAddr {
    if udp_local.ip().is_unspecified() {
        SocketAddr::new(stream_local.ip(), udp_local.port())
    } else {
        udp_local
    }
}

/// Unspecified address of the same family as `peer`, for binding a client socket.
pub fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    let ip: IpAddr = if peer.is_ipv6() {
        std::net::Ipv6Addr::UNSPECIFIED.into()
    } else {
        std::net::Ipv4Addr::UNSPECIFIED.into()
    };
    SocketAddr::new(ip, 0)
}
