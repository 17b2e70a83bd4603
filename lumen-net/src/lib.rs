//! Non-blocking UDP transport adapter (`spec.md` §4.3, §6.2).
//!
//! Engines never see blocking semantics or `io::Error` directly: every
//! fallible operation here collapses to a small outcome enum, and would-block
//! is just "nothing happened this tick" rather than an error.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use derive_more::Deref;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

/// Opaque identity of a remote peer, sufficient for equality comparison and
/// for sending a reply (`spec.md` §3).
///
/// Derefs to the underlying [`SocketAddr`] so callers can reach
/// `.ip()`/`.port()` directly without going through [`Endpoint::addr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compares two endpoints for identity. A free function mirroring
/// `spec.md`'s `endpoint_equal`, though `Endpoint` also derives `PartialEq`
/// directly — both exist so callers can use whichever reads better.
pub fn endpoint_equal(a: Endpoint, b: Endpoint) -> bool {
    a == b
}

/// Failures that can only happen at construction time (bind refused,
/// hostname unresolvable) — never returned from the non-blocking hot path.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to resolve host {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("host {0}:{1} resolved to no addresses")]
    NoAddresses(String, u16),
}

/// Outcome of a send attempt. Never blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(usize),
    WouldBlock,
    /// `send` was called with no peer set via `set_peer`/`resolve_and_connect`.
    NoPeer,
    Fatal,
}

/// Outcome of a receive attempt. Never blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    Received(usize, Endpoint),
    WouldBlock,
    Fatal,
}

/// The narrow contract engines rely on (`spec.md` §4.3).
pub trait Transport {
    fn bind_any() -> Result<Self, TransportError>
    where
        Self: Sized;

    fn bind_port(port: u16) -> Result<Self, TransportError>
    where
        Self: Sized;

    /// Resolves `host:port` and records it as the default peer for
    /// connectionless `send`. Returns the resolved endpoint.
    fn resolve_and_connect(&mut self, host: &str, port: u16) -> Result<Endpoint, TransportError>;

    fn set_peer(&mut self, endpoint: Endpoint);
    fn clear_peer(&mut self);

    /// Sends to the peer set by `set_peer`/`resolve_and_connect`.
    fn send(&mut self, bytes: &[u8]) -> SendOutcome;
    fn send_to(&mut self, bytes: &[u8], endpoint: Endpoint) -> SendOutcome;
    fn recv_from(&mut self, buf: &mut [u8]) -> RecvOutcome;

    fn local_endpoint(&self) -> io::Result<Endpoint>;
}

/// Production [`Transport`] backed by a non-blocking `std::net::UdpSocket`.
///
/// Binding prefers a dual-stack IPv6 socket (v4-mapped addresses accepted)
/// and falls back to IPv4-only when dual-stack binding isn't available on
/// the platform — an acceptable build variant per `spec.md` §6.2.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Option<Endpoint>,
}

impl UdpTransport {
    fn from_std(socket: UdpSocket) -> Result<Self, TransportError> {
        socket.set_nonblocking(true).map_err(TransportError::Bind)?;
        Ok(Self { socket, peer: None })
    }

    fn bind_dual_stack(port: u16) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        // Best-effort: some platforms refuse to clear IPV6_V6ONLY, in which
        // case we fall back to a v4-only bind below.
        let _ = socket.set_only_v6(false);
        let addr: SocketAddr = (std::net::Ipv6Addr::UNSPECIFIED, port).into();
        socket.bind(&addr.into())?;
        Ok(socket.into())
    }

    fn bind_v4(port: u16) -> io::Result<UdpSocket> {
        UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, port))
    }
}

impl Transport for UdpTransport {
    fn bind_any() -> Result<Self, TransportError> {
        Self::bind_port(0)
    }

    fn bind_port(port: u16) -> Result<Self, TransportError> {
        match Self::bind_dual_stack(port) {
            Ok(socket) => {
                debug!(port, "bound dual-stack UDP socket");
                Self::from_std(socket)
            }
            Err(dual_stack_err) => {
                warn!(
                    port,
                    error = %dual_stack_err,
                    "dual-stack bind failed, falling back to IPv4-only"
                );
                let socket = Self::bind_v4(port).map_err(TransportError::Bind)?;
                Self::from_std(socket)
            }
        }
    }

    fn resolve_and_connect(&mut self, host: &str, port: u16) -> Result<Endpoint, TransportError> {
        let resolved = (host, port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                host: host.to_string(),
                port,
                source,
            })?
            .next()
            .ok_or_else(|| TransportError::NoAddresses(host.to_string(), port))?;

        let endpoint = Endpoint::new(resolved);
        self.set_peer(endpoint);
        Ok(endpoint)
    }

    fn set_peer(&mut self, endpoint: Endpoint) {
        self.peer = Some(endpoint);
    }

    fn clear_peer(&mut self) {
        self.peer = None;
    }

    fn send(&mut self, bytes: &[u8]) -> SendOutcome {
        let Some(peer) = self.peer else {
            return SendOutcome::NoPeer;
        };
        self.send_to(bytes, peer)
    }

    fn send_to(&mut self, bytes: &[u8], endpoint: Endpoint) -> SendOutcome {
        match self.socket.send_to(bytes, endpoint.addr()) {
            Ok(n) => SendOutcome::Sent(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => SendOutcome::WouldBlock,
            Err(e) => {
                warn!(error = %e, %endpoint, "send_to failed");
                SendOutcome::Fatal
            }
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> RecvOutcome {
        match self.socket.recv_from(buf) {
            Ok((n, addr)) => RecvOutcome::Received(n, Endpoint::new(addr)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => RecvOutcome::WouldBlock,
            Err(e) => {
                warn!(error = %e, "recv_from failed");
                RecvOutcome::Fatal
            }
        }
    }

    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.socket.local_addr().map(Endpoint::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_any_picks_a_free_port() {
        let t = UdpTransport::bind_any().unwrap();
        let ep = t.local_endpoint().unwrap();
        assert_ne!(ep.addr().port(), 0);
    }

    #[test]
    fn send_without_peer_is_no_peer() {
        let mut t = UdpTransport::bind_any().unwrap();
        assert_eq!(t.send(b"hi"), SendOutcome::NoPeer);
    }

    #[test]
    fn recv_without_data_would_block() {
        let mut t = UdpTransport::bind_any().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(t.recv_from(&mut buf), RecvOutcome::WouldBlock);
    }

    #[test]
    fn loopback_round_trip() {
        let mut a = UdpTransport::bind_any().unwrap();
        let mut b = UdpTransport::bind_any().unwrap();
        let b_ep = b.local_endpoint().unwrap();

        assert_eq!(a.send_to(b"hello", b_ep), SendOutcome::Sent(5));

        let mut buf = [0u8; 16];
        // Loopback delivery is effectively synchronous, but allow a couple
        // of retries to absorb scheduler noise.
        let mut outcome = b.recv_from(&mut buf);
        for _ in 0..50 {
            if !matches!(outcome, RecvOutcome::WouldBlock) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
            outcome = b.recv_from(&mut buf);
        }
        match outcome {
            RecvOutcome::Received(n, from) => {
                assert_eq!(&buf[..n], b"hello");
                assert_eq!(from, a.local_endpoint().unwrap());
            }
            other => panic!("expected a received datagram, got {other:?}"),
        }
    }

    #[test]
    fn endpoint_equal_matches_partial_eq() {
        let a: Endpoint = "127.0.0.1:1234".parse::<SocketAddr>().unwrap().into();
        let b: Endpoint = "127.0.0.1:1234".parse::<SocketAddr>().unwrap().into();
        let c: Endpoint = "127.0.0.1:1235".parse::<SocketAddr>().unwrap().into();
        assert!(endpoint_equal(a, b));
        assert!(!endpoint_equal(a, c));
    }
}
