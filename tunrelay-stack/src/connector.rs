//! Outbound socket creation
//!
//! The engines never open sockets themselves; they ask a [`Connector`]. The
//! [`SystemConnector`] opens real non-blocking sockets and exempts each one
//! from tunnel capture before it connects, either through a host-supplied
//! protect callback (Android `VpnService.protect`) or by binding it to the
//! physical interface.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Host callback that exempts a socket from the tunnel. Returns false on failure.
pub type ProtectCallback = Arc<dyn Fn(&Socket) -> bool + Send + Sync>;

/// Outcome of a non-blocking TCP connect.
#[derive(Debug)]
pub enum TcpConnect {
    /// Connected synchronously (typically loopback).
    Connected(TcpStream),
    /// Handshake in flight; completion is signalled by write readiness.
    Pending(TcpStream),
}

pub trait Connector: Send + Sync + 'static {
    /// Start a TCP connect without waiting for it. Called inside a Tokio runtime.
    fn connect_tcp(&self, destination: SocketAddrV4) -> io::Result<TcpConnect>;

    /// Open a UDP socket connected to `destination`.
    fn connect_udp(&self, destination: SocketAddrV4) -> io::Result<UdpSocket>;
}

#[derive(Clone, Default)]
pub struct SystemConnector {
    protect: Option<ProtectCallback>,
    bind_interface: Option<String>,
}

impl SystemConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protect(mut self, protect: ProtectCallback) -> Self {
        self.protect = Some(protect);
        self
    }

    /// Bind outbound sockets to a named interface (`SO_BINDTODEVICE`).
    pub fn with_bind_interface(mut self, interface: impl Into<String>) -> Self {
        self.bind_interface = Some(interface.into());
        self
    }

    fn exempt(&self, socket: &Socket) -> io::Result<()> {
        if let Some(protect) = &self.protect {
            if !protect(socket) {
                warn!("Failed to protect outbound socket");
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "socket protect failed"));
            }
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(interface) = &self.bind_interface {
            socket.bind_device(Some(interface.as_bytes()))?;
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        if let Some(interface) = &self.bind_interface {
            debug!("Interface binding to {} not supported on this platform", interface);
        }

        Ok(())
    }
}

impl std::fmt::Debug for SystemConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemConnector")
            .field("protect", &self.protect.is_some())
            .field("bind_interface", &self.bind_interface)
            .finish()
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}

impl Connector for SystemConnector {
    fn connect_tcp(&self, destination: SocketAddrV4) -> io::Result<TcpConnect> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        self.exempt(&socket)?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        let pending = match socket.connect(&SocketAddr::V4(destination).into()) {
            Ok(()) => false,
            Err(e) if connect_in_progress(&e) => true,
            Err(e) => return Err(e),
        };

        let stream = TcpStream::from_std(socket.into())?;
        debug!("TCP connect to {} ({})", destination, if pending { "pending" } else { "immediate" });
        Ok(if pending {
            TcpConnect::Pending(stream)
        } else {
            TcpConnect::Connected(stream)
        })
    }

    fn connect_udp(&self, destination: SocketAddrV4) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        self.exempt(&socket)?;
        socket.connect(&SocketAddr::V4(destination).into())?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }
}

/// Shut both directions of a stream down, ignoring errors.
pub(crate) fn shutdown_quietly(stream: &TcpStream) {
    let _ = SockRef::from(stream).shutdown(std::net::Shutdown::Both);
}
