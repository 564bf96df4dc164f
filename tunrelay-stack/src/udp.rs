//! UDP engine
//!
//! Stateless datagram relay. The first datagram of a flow opens a connected
//! outbound socket which is cached by flow key and reused for every later
//! datagram; replies are wrapped with the flow's reply template and written
//! back to the device.

use crate::connector::Connector;
use crate::flow::{FlowKey, FlowTable};
use crate::packet::{Packet, MAX_PACKET_SIZE, UDP_REPLY_HEADER_SIZE};
use crate::pool::BufferPool;
use crate::selector::{Interest, Selectable, SelectedKey, SelectionKey, Selector, SelectorEvents};
use crate::stats::RelayStats;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// A cached outbound datagram socket.
pub struct UdpFlow {
    key: FlowKey,
    socket: UdpSocket,
    /// First datagram of the flow with source and destination swapped.
    template: Mutex<Packet>,
    selection: OnceLock<SelectionKey>,
    closed: AtomicBool,
}

impl UdpFlow {
    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn attach(&self, key: SelectionKey) {
        if self.selection.set(key).is_ok() && self.is_closed() {
            self.deregister();
        }
    }

    fn deregister(&self) {
        if let Some(key) = self.selection.get() {
            key.cancel();
        }
    }

    fn rearm(&self) {
        if let Some(key) = self.selection.get() {
            key.set_interest(Some(Interest::Read));
        }
    }

    /// Stop watching the socket; it closes once the last reference drops.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.deregister();
        true
    }
}

impl Selectable for UdpFlow {
    fn poll_ready(&self, cx: &mut Context<'_>, interest: Interest) -> Poll<io::Result<()>> {
        match interest {
            Interest::Read => self.socket.poll_recv_ready(cx),
            Interest::Connect => Poll::Ready(Ok(())),
        }
    }
}

impl fmt::Debug for UdpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpFlow")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) struct UdpEngine {
    table: Mutex<FlowTable<FlowKey, Arc<UdpFlow>>>,
    selector: Selector<UdpFlow>,
    pool: Arc<BufferPool>,
    stats: Arc<RelayStats>,
    connector: Arc<dyn Connector>,
    to_device: mpsc::UnboundedSender<BytesMut>,
}

impl UdpEngine {
    pub fn new(
        max_sockets: usize,
        pool: Arc<BufferPool>,
        stats: Arc<RelayStats>,
        connector: Arc<dyn Connector>,
        to_device: mpsc::UnboundedSender<BytesMut>,
    ) -> (Self, SelectorEvents<UdpFlow>) {
        let (selector, events) = Selector::new();
        let evict_stats = stats.clone();
        let table = FlowTable::new(max_sockets, move |key: FlowKey, flow: Arc<UdpFlow>| {
            debug!("Evicting UDP flow {}", key);
            if flow.close() {
                evict_stats.record_udp_closed();
            }
        });

        let engine = Self {
            table: Mutex::new(table),
            selector,
            pool,
            stats,
            connector,
            to_device,
        };
        (engine, events)
    }

    pub fn flow(&self, key: &FlowKey) -> Option<Arc<UdpFlow>> {
        self.table.lock().peek(key).cloned()
    }

    pub fn socket_count(&self) -> usize {
        self.table.lock().len()
    }

    fn release(&self, packet: &mut Packet) {
        if let Some(buf) = packet.take_backing() {
            self.pool.release(buf);
        }
    }

    fn teardown(&self, flow: &Arc<UdpFlow>) {
        self.table.lock().remove_if(&flow.key, |resident| Arc::ptr_eq(resident, flow));
        if flow.close() {
            debug!("UDP flow {} closed", flow.key);
            self.stats.record_udp_closed();
        }
    }

    pub fn shutdown(&self) {
        self.selector.close();
        let drained = self.table.lock().drain();
        for (_, flow) in drained {
            if flow.close() {
                self.stats.record_udp_closed();
            }
        }
    }

    fn open_flow(&self, key: FlowKey, packet: &Packet) -> io::Result<Arc<UdpFlow>> {
        let socket = self.connector.connect_udp(key.destination)?;
        let mut template = packet.to_template();
        template.swap_source_and_destination();

        let flow = Arc::new(UdpFlow {
            key,
            socket,
            template: Mutex::new(template),
            selection: OnceLock::new(),
            closed: AtomicBool::new(false),
        });

        self.table.lock().put(key, flow.clone());
        self.stats.record_udp_opened();
        flow.attach(self.selector.register(flow.clone(), Some(Interest::Read)));
        debug!("UDP flow {} opened", key);
        Ok(flow)
    }

    // --- device -> network ---

    pub async fn run_output(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Packet>, cancel: CancellationToken) {
        info!("UDP output worker started");
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.handle_outbound(packet) => {}
            }
        }
        info!("UDP output worker stopped");
    }

    pub async fn handle_outbound(&self, mut packet: Packet) {
        let Some(key) = FlowKey::from_packet(&packet).filter(|_| packet.is_udp()) else {
            self.release(&mut packet);
            return;
        };

        let cached = self.table.lock().get(&key).cloned();
        let flow = match cached {
            Some(flow) => flow,
            None => match self.open_flow(key, &packet) {
                Ok(flow) => flow,
                Err(e) => {
                    debug!("UDP connect to {} failed: {}", key.destination, e);
                    self.stats.record_dropped();
                    self.release(&mut packet);
                    return;
                }
            },
        };

        match flow.socket.send(packet.payload()).await {
            Ok(n) => {
                trace!("UDP flow {} sent {} bytes", key, n);
                self.stats.record_to_network(n);
            }
            Err(e) => {
                warn!("UDP flow {} send failed: {}", key, e);
                self.teardown(&flow);
            }
        }
        self.release(&mut packet);
    }

    // --- network -> device ---

    pub async fn run_input(self: Arc<Self>, mut events: SelectorEvents<UdpFlow>, cancel: CancellationToken) {
        info!("UDP input worker started");
        loop {
            let ready = tokio::select! {
                _ = cancel.cancelled() => break,
                ready = events.select() => match ready {
                    Some(ready) => ready,
                    None => break,
                },
            };
            for key in ready {
                self.handle_ready(key);
            }
        }
        info!("UDP input worker stopped");
    }

    pub fn handle_ready(&self, key: SelectedKey<UdpFlow>) {
        let flow = key.attachment;
        if flow.is_closed() {
            return;
        }

        let mut buf = self.pool.acquire();
        buf.resize(self.pool.buffer_size().min(MAX_PACKET_SIZE), 0);

        match flow.socket.try_recv(&mut buf[UDP_REPLY_HEADER_SIZE..]) {
            Ok(n) => {
                flow.template.lock().update_udp_buffer(&mut buf, n);
                trace!("UDP flow {} relayed {} bytes to device", flow.key, n);
                self.stats.record_from_network(n);
                if let Err(e) = self.to_device.send(buf) {
                    self.pool.release(e.0);
                }
                flow.rearm();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.pool.release(buf);
                flow.rearm();
            }
            Err(e) => {
                // typically ICMP port unreachable surfacing as ECONNREFUSED
                debug!("UDP flow {} receive failed: {}", flow.key, e);
                self.pool.release(buf);
                self.teardown(&flow);
            }
        }
    }
}
