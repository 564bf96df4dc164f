//! Shared test fixtures

mod property_tests;

use crate::connector::{Connector, TcpConnect};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddrV4, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Connector that sends every flow to loopback instead of its real
/// destination.
#[derive(Clone)]
pub(crate) struct LoopbackConnector {
    tcp_target: SocketAddrV4,
    udp_target: Option<SocketAddrV4>,
    pending: bool,
    listener: Arc<Mutex<Option<StdTcpListener>>>,
    udp_opened: Arc<AtomicUsize>,
}

impl LoopbackConnector {
    pub(crate) fn new() -> Self {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let tcp_target = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            other => panic!("unexpected listener address {}", other),
        };
        Self {
            tcp_target,
            udp_target: None,
            pending: false,
            listener: Arc::new(Mutex::new(Some(listener))),
            udp_opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// TCP connects go to a port nobody listens on.
    pub(crate) fn refusing() -> Self {
        let closed = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let closed_addr = match closed.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            other => panic!("unexpected listener address {}", other),
        };
        drop(closed);
        Self {
            tcp_target: closed_addr,
            ..Self::new()
        }
    }

    /// Report connected streams as still connecting.
    pub(crate) fn pending(mut self) -> Self {
        self.pending = true;
        self
    }

    pub(crate) fn with_udp_target(mut self, target: SocketAddrV4) -> Self {
        self.udp_target = Some(target);
        self
    }

    pub(crate) fn failing_udp(mut self) -> Self {
        self.udp_target = None;
        self
    }

    pub(crate) fn take_tcp_listener(&self) -> TcpListener {
        let listener = self.listener.lock().take().expect("listener already taken");
        listener.set_nonblocking(true).unwrap();
        TcpListener::from_std(listener).unwrap()
    }

    pub(crate) fn udp_sockets_opened(&self) -> usize {
        self.udp_opened.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackConnector {
    fn connect_tcp(&self, _destination: SocketAddrV4) -> io::Result<TcpConnect> {
        let stream = StdTcpStream::connect(self.tcp_target)?;
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream)?;
        if self.pending {
            Ok(TcpConnect::Pending(stream))
        } else {
            Ok(TcpConnect::Connected(stream))
        }
    }

    fn connect_udp(&self, _destination: SocketAddrV4) -> io::Result<UdpSocket> {
        let target = self
            .udp_target
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no udp target"))?;
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        socket.connect(target)?;
        socket.set_nonblocking(true)?;
        self.udp_opened.fetch_add(1, Ordering::SeqCst);
        UdpSocket::from_std(socket)
    }
}

/// Spawn a UDP server that echoes every datagram back to its sender.
pub(crate) async fn udp_echo_server() -> SocketAddrV4 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = match socket.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        other => panic!("unexpected socket address {}", other),
    };
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            if socket.send_to(&buf[..n], peer).await.is_err() {
                break;
            }
        }
    });
    addr
}

/// Abort `stream` so the peer sees an RST instead of a FIN.
pub(crate) fn reset_connection(stream: TcpStream) {
    socket2::SockRef::from(&stream)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(stream);
}

/// A loopback UDP port with nothing bound to it.
pub(crate) fn closed_udp_port() -> SocketAddrV4 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    match socket.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        other => panic!("unexpected socket address {}", other),
    }
}
