//! UDP transport used by the resolver to talk to its nameservers

use std::cmp::max;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Datagram I/O as seen by the resolver
///
/// `recv_from` waits at most `timeout` and returns `Ok(None)` when nothing
/// arrived in that time.
pub trait Transport: Send + Sync {
    fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// Unconnected UDP sockets on ephemeral ports, one per address family
///
/// The IPv6 socket is optional. On a host without IPv6 the transport still
/// works and sends to IPv6 nameservers simply fail.
pub struct UdpTransport {
    v4: UdpSocket,
    v6: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn bind() -> io::Result<UdpTransport> {
        let v4 = UdpSocket::bind(("0.0.0.0", 0)).map_err(|e| {
            log::error!("Failed to bind resolver UDP socket: {}", e);
            e
        })?;

        let v6 = match UdpSocket::bind(("::", 0)) {
            Ok(socket) => {
                socket.set_nonblocking(true)?;
                Some(socket)
            }
            Err(e) => {
                log::info!("IPv6 socket unavailable, IPv6 nameservers will be ignored: {}", e);
                None
            }
        };

        if let Ok(local_addr) = v4.local_addr() {
            log::debug!("resolver transport bound to port {}", local_addr.port());
        }

        Ok(UdpTransport { v4, v6 })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.v4.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<usize> {
        match dest {
            SocketAddr::V4(_) => self.v4.send_to(payload, dest),
            SocketAddr::V6(_) => match self.v6 {
                Some(ref socket) => socket.send_to(payload, dest),
                None => Err(io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    "no IPv6 socket for nameserver",
                )),
            },
        }
    }

    fn recv_from(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, SocketAddr)>> {
        if let Some(ref socket) = self.v6 {
            match socket.recv_from(buf) {
                Ok(received) => return Ok(Some(received)),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        // a zero read timeout is rejected by the socket layer
        self.v4
            .set_read_timeout(Some(max(timeout, Duration::from_millis(1))))?;

        match self.v4.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => Ok(None),
            // ICMP port unreachable from an earlier send, on some platforms
            Err(ref e) if e.kind() == ErrorKind::ConnectionReset => {
                log::debug!("ignoring connection reset on resolver socket");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
