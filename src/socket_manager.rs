//! Platform-aware UDP socket creation, binding and send/receive with the
//! "port delta" adjustment used to colocate both proxy endpoints on one test
//! host.
//!
//! Linux binds to a named interface via `SO_BINDTODEVICE`; every other
//! platform has no such facility and must be given an IP address instead —
//! this asymmetry is a genuine platform capability gap, not an oversight,
//! and is preserved rather than papered over (§4.2).

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("invalid interface for this platform: {0}")]
    Interface(String),
    #[error("failed to bind socket: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to send datagram: {0}")]
    Send(#[source] io::Error),
    #[error("failed to receive datagram: {0}")]
    Receive(#[source] io::Error),
    #[error("socket operation timed out")]
    Timeout,
}

/// A configured-but-not-yet-bound socket. Created by [`UnboundSocket::create`];
/// becomes a usable [`SocketManager`] once [`UnboundSocket::bind_with_delta`]
/// picks a concrete local port.
pub struct UnboundSocket {
    raw: Socket,
    src_iface: String,
    dst_iface: String,
    timeout: Duration,
}

impl UnboundSocket {
    /// Build and configure a UDP socket for `src_iface` talking toward
    /// `dst_iface`, with address reuse and (if `broadcast`) `SO_BROADCAST`
    /// enabled, and a receive timeout of `timeout`.
    pub fn create(
        src_iface: &str,
        dst_iface: &str,
        broadcast: bool,
        timeout: Duration,
    ) -> Result<UnboundSocket, SocketError> {
        validate_interface(src_iface)?;
        validate_interface(dst_iface)?;

        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(SocketError::Bind)?;
        raw.set_reuse_address(true).map_err(SocketError::Bind)?;
        if broadcast {
            raw.set_broadcast(true).map_err(SocketError::Bind)?;
        }

        #[cfg(target_os = "linux")]
        if !is_valid_ip(src_iface) {
            raw.bind_device(Some(src_iface.as_bytes()))
                .map_err(SocketError::Bind)?;
        }

        Ok(UnboundSocket {
            raw,
            src_iface: src_iface.to_owned(),
            dst_iface: dst_iface.to_owned(),
            timeout,
        })
    }

    /// Bind to `port + delta` if source and destination are the same host,
    /// `port` otherwise. On platforms that bind by IP, binds to the
    /// configured source address; on Linux (already filtered by
    /// `SO_BINDTODEVICE`) binds the wildcard address.
    pub fn bind_with_delta(self, port: u16, delta: i32) -> Result<SocketManager, SocketError> {
        let adjusted_port = if are_same_machines(&self.src_iface, &self.dst_iface) {
            (i32::from(port) + delta).clamp(0, i32::from(u16::MAX)) as u16
        } else {
            port
        };
        let bind_addr = bind_address(&self.src_iface, adjusted_port)?;
        self.raw
            .bind(&bind_addr.into())
            .map_err(SocketError::Bind)?;
        self.raw.set_nonblocking(true).map_err(SocketError::Bind)?;

        let std_socket: std::net::UdpSocket = self.raw.into();
        let socket = UdpSocket::from_std(std_socket).map_err(SocketError::Bind)?;

        Ok(SocketManager {
            socket,
            src_iface: self.src_iface,
            dst_iface: self.dst_iface,
            timeout: self.timeout,
        })
    }
}

/// A bound UDP socket, ready to send and receive.
pub struct SocketManager {
    socket: UdpSocket,
    src_iface: String,
    dst_iface: String,
    timeout: Duration,
}

impl SocketManager {
    /// Send `data` to `destination:port+delta` (same-host) or
    /// `destination:port` (cross-host).
    pub async fn send_with_delta(
        &self,
        data: &[u8],
        destination: IpAddr,
        port: u16,
        delta: i32,
    ) -> Result<(), SocketError> {
        let adjusted_port = if are_same_machines(&self.src_iface, &self.dst_iface) {
            (i32::from(port) + delta).clamp(0, i32::from(u16::MAX)) as u16
        } else {
            port
        };
        self.socket
            .send_to(data, SocketAddr::new(destination, adjusted_port))
            .await
            .map(|_| ())
            .map_err(SocketError::Send)
    }

    /// Receive the next datagram, honoring the configured timeout.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        match tokio::time::timeout(self.timeout, self.socket.recv_from(buf)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(SocketError::Receive(e)),
            Err(_) => Err(SocketError::Timeout),
        }
    }
}

/// Two interface specifiers refer to the same host when they're literally
/// equal or both resolve to a loopback address.
pub fn are_same_machines(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    const LOOPBACK: [&str; 3] = ["127.0.0.1", "localhost", "::1"];
    LOOPBACK.contains(&a) && LOOPBACK.contains(&b)
}

fn is_valid_ip(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// On Linux, interface filtering already happened via `SO_BINDTODEVICE`, so
/// bind the wildcard address; elsewhere `src_iface` must already be an IP
/// (enforced by [`validate_interface`]).
#[cfg(target_os = "linux")]
fn bind_address(_src_iface: &str, port: u16) -> Result<SocketAddr, SocketError> {
    Ok(SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port))
}

#[cfg(not(target_os = "linux"))]
fn bind_address(src_iface: &str, port: u16) -> Result<SocketAddr, SocketError> {
    let ip: IpAddr = src_iface
        .parse()
        .map_err(|_| SocketError::Interface(src_iface.to_owned()))?;
    Ok(SocketAddr::new(ip, port))
}

fn validate_interface(iface: &str) -> Result<(), SocketError> {
    #[cfg(not(target_os = "linux"))]
    if !is_valid_ip(iface) {
        return Err(SocketError::Interface(format!(
            "this platform requires an IP address, got interface name: {iface}"
        )));
    }
    let _ = iface;
    Ok(())
}
