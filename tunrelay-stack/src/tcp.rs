//! TCP engine
//!
//! Terminates every TCP connection the device opens through the tunnel and
//! relays it over an outbound socket. Each connection is tracked by a
//! [`Tcb`] through a restricted state machine:
//!
//! ```text
//!   SYN (connect pending) ─> SynSent ──connect ok──┐
//!   SYN (connected)  ─────────────────────────> SynReceived ──ACK──> Established
//!                                                                       │
//!       device FIN while reading ─> CloseWait ──remote EOF──┐           │
//!       remote EOF / device FIN otherwise ──────────────> LastAck <─────┘
//!                                                            │
//!                                              ACK of our FIN └─> removed
//! ```
//!
//! The output worker handles segments coming from the device; the input
//! worker handles readiness of the outbound sockets. Both mutate a record
//! under its own lock. The flow table lock is never held together with a
//! record lock.

use crate::connector::{shutdown_quietly, Connector, TcpConnect};
use crate::flow::{FlowKey, FlowTable};
use crate::packet::{Packet, TcpFlags, TcpHeader, MAX_PACKET_SIZE, TCP_REPLY_HEADER_SIZE};
use crate::pool::BufferPool;
use crate::selector::{Interest, Selectable, SelectedKey, SelectionKey, Selector, SelectorEvents};
use crate::stats::RelayStats;
use bytes::BytesMut;
use parking_lot::Mutex;
use rand::Rng;
use socket2::SockRef;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Largest initial sequence number handed out.
const MAX_INITIAL_SEQUENCE: u32 = i16::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpStatus {
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
}

impl fmt::Display for TcpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpStatus::SynSent => "SYN_SENT",
            TcpStatus::SynReceived => "SYN_RECEIVED",
            TcpStatus::Established => "ESTABLISHED",
            TcpStatus::CloseWait => "CLOSE_WAIT",
            TcpStatus::LastAck => "LAST_ACK",
        };
        f.write_str(name)
    }
}

/// Mutable part of a [`Tcb`], guarded by the record's lock.
#[derive(Debug)]
struct TcbState {
    my_sequence: u32,
    their_sequence: u32,
    my_acknowledgement: u32,
    their_acknowledgement: u32,
    status: TcpStatus,
    waiting_for_network_data: bool,
    /// Captured SYN with source and destination swapped.
    template: Packet,
}

impl TcbState {
    fn reply(&mut self, buf: &mut BytesMut, flags: TcpFlags, payload_size: usize) {
        let (seq, ack) = (self.my_sequence, self.my_acknowledgement);
        self.template.update_tcp_buffer(buf, flags, seq, ack, payload_size);
    }

    fn reset(&mut self, buf: &mut BytesMut, ack: u32) {
        let seq = self.my_sequence;
        self.template.update_tcp_buffer(buf, TcpFlags::rst_ack(), seq, ack, 0);
    }
}

/// Copy of a record's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbSnapshot {
    pub status: TcpStatus,
    pub my_sequence: u32,
    pub their_sequence: u32,
    pub my_acknowledgement: u32,
    pub their_acknowledgement: u32,
    pub waiting_for_network_data: bool,
}

/// TCP connection record.
pub struct Tcb {
    key: FlowKey,
    stream: TcpStream,
    state: Mutex<TcbState>,
    selection: OnceLock<SelectionKey>,
    closed: AtomicBool,
}

impl Tcb {
    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn status(&self) -> TcpStatus {
        self.state.lock().status
    }

    pub fn snapshot(&self) -> TcbSnapshot {
        let st = self.state.lock();
        TcbSnapshot {
            status: st.status,
            my_sequence: st.my_sequence,
            their_sequence: st.their_sequence,
            my_acknowledgement: st.my_acknowledgement,
            their_acknowledgement: st.their_acknowledgement,
            waiting_for_network_data: st.waiting_for_network_data,
        }
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

    fn set_interest(&self, interest: Option<Interest>) {
        if let Some(key) = self.selection.get() {
            key.set_interest(interest);
        }
    }

    /// Deregister and shut the outbound socket. Returns true on the first call.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.deregister();
        shutdown_quietly(&self.stream);
        true
    }
}

impl Selectable for Tcb {
    fn poll_ready(&self, cx: &mut Context<'_>, interest: Interest) -> Poll<io::Result<()>> {
        match interest {
            Interest::Connect => self.stream.poll_write_ready(cx),
            Interest::Read => self.stream.poll_read_ready(cx),
        }
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_fully(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub(crate) struct TcpEngine {
    table: Mutex<FlowTable<FlowKey, Arc<Tcb>>>,
    selector: Selector<Tcb>,
    pool: Arc<BufferPool>,
    stats: Arc<RelayStats>,
    connector: Arc<dyn Connector>,
    to_device: mpsc::UnboundedSender<BytesMut>,
}

impl TcpEngine {
    pub fn new(
        max_connections: usize,
        pool: Arc<BufferPool>,
        stats: Arc<RelayStats>,
        connector: Arc<dyn Connector>,
        to_device: mpsc::UnboundedSender<BytesMut>,
    ) -> (Self, SelectorEvents<Tcb>) {
        let (selector, events) = Selector::new();
        let evict_stats = stats.clone();
        let table = FlowTable::new(max_connections, move |key: FlowKey, tcb: Arc<Tcb>| {
            debug!("Evicting TCP flow {}", key);
            if tcb.close() {
                evict_stats.record_tcp_closed();
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

    pub fn flow(&self, key: &FlowKey) -> Option<Arc<Tcb>> {
        self.table.lock().peek(key).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.table.lock().len()
    }

    fn enqueue(&self, buf: BytesMut) {
        if let Err(e) = self.to_device.send(buf) {
            self.pool.release(e.0);
        }
    }

    fn release(&self, packet: &mut Packet) {
        if let Some(buf) = packet.take_backing() {
            self.pool.release(buf);
        }
    }

    fn reply_buffer(&self, packet: &mut Packet) -> BytesMut {
        packet.take_backing().unwrap_or_else(|| self.pool.acquire())
    }

    /// Remove the record if it is still the resident one, then close it.
    fn teardown(&self, tcb: &Arc<Tcb>) {
        self.table.lock().remove_if(&tcb.key, |resident| Arc::ptr_eq(resident, tcb));
        if tcb.close() {
            debug!("TCP flow {} closed", tcb.key);
            self.stats.record_tcp_closed();
        }
    }

    /// Close every connection and stop all watchers.
    pub fn shutdown(&self) {
        self.selector.close();
        let drained = self.table.lock().drain();
        for (_, tcb) in drained {
            if tcb.close() {
                self.stats.record_tcp_closed();
            }
        }
    }

    // --- device -> network ---

    pub async fn run_output(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Packet>, cancel: CancellationToken) {
        info!("TCP output worker started");
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
        info!("TCP output worker stopped");
    }

    pub async fn handle_outbound(&self, mut packet: Packet) {
        let (Some(key), Some(tcp)) = (FlowKey::from_packet(&packet), packet.tcp().cloned()) else {
            self.release(&mut packet);
            return;
        };
        trace!("TCP out {}: {}", key, tcp);

        let existing = self.table.lock().get(&key).cloned();
        match existing {
            None if tcp.flags.syn => self.initialize_connection(key, packet, &tcp),
            None => self.reset_unknown(packet, &tcp),
            Some(tcb) if tcp.flags.syn => self.process_duplicate_syn(&tcb, packet, &tcp),
            Some(tcb) if tcp.flags.rst => {
                debug!("Device reset TCP flow {}", key);
                self.release(&mut packet);
                self.teardown(&tcb);
            }
            Some(tcb) if tcp.flags.fin => self.process_fin(&tcb, packet, &tcp).await,
            Some(tcb) if tcp.flags.ack => self.process_ack(&tcb, packet, &tcp).await,
            Some(_) => self.release(&mut packet),
        }
    }

    fn initialize_connection(&self, key: FlowKey, mut packet: Packet, syn: &TcpHeader) {
        let mut buf = self.reply_buffer(&mut packet);
        let mut template = packet;
        template.swap_source_and_destination();

        let connect = match self.connector.connect_tcp(key.destination) {
            Ok(connect) => connect,
            Err(e) => {
                warn!("TCP connect to {} failed: {}", key.destination, e);
                template.update_tcp_buffer(
                    &mut buf,
                    TcpFlags::rst_ack(),
                    0,
                    syn.sequence_number.wrapping_add(1),
                    0,
                );
                self.stats.record_reset();
                self.enqueue(buf);
                return;
            }
        };
        let (stream, pending) = match connect {
            TcpConnect::Connected(stream) => (stream, false),
            TcpConnect::Pending(stream) => (stream, true),
        };

        let state = TcbState {
            my_sequence: rand::thread_rng().gen_range(0..=MAX_INITIAL_SEQUENCE),
            their_sequence: syn.sequence_number,
            my_acknowledgement: syn.sequence_number.wrapping_add(1),
            their_acknowledgement: syn.acknowledgement_number,
            status: if pending { TcpStatus::SynSent } else { TcpStatus::SynReceived },
            waiting_for_network_data: false,
            template,
        };
        let tcb = Arc::new(Tcb {
            key,
            stream,
            state: Mutex::new(state),
            selection: OnceLock::new(),
            closed: AtomicBool::new(false),
        });

        self.table.lock().put(key, tcb.clone());
        self.stats.record_tcp_opened();
        let interest = pending.then_some(Interest::Connect);
        tcb.attach(self.selector.register(tcb.clone(), interest));

        if pending {
            debug!("TCP flow {} connecting", key);
            self.pool.release(buf);
            return;
        }

        {
            let mut st = tcb.state.lock();
            st.reply(&mut buf, TcpFlags::syn_ack(), 0);
            st.my_sequence = st.my_sequence.wrapping_add(1);
        }
        debug!("TCP flow {} connected", key);
        self.enqueue(buf);
    }

    fn reset_unknown(&self, mut packet: Packet, tcp: &TcpHeader) {
        trace!("No TCP flow for {}, resetting", packet.destination());
        let mut buf = self.reply_buffer(&mut packet);
        packet.swap_source_and_destination();
        packet.update_tcp_buffer(
            &mut buf,
            TcpFlags::rst_ack(),
            tcp.acknowledgement_number,
            tcp.sequence_number.wrapping_add(1),
            0,
        );
        self.stats.record_reset();
        self.enqueue(buf);
    }

    fn process_duplicate_syn(&self, tcb: &Arc<Tcb>, mut packet: Packet, syn: &TcpHeader) {
        let mut buf = self.reply_buffer(&mut packet);
        {
            let mut st = tcb.state.lock();
            if st.status == TcpStatus::SynSent {
                st.my_acknowledgement = syn.sequence_number.wrapping_add(1);
                drop(st);
                self.pool.release(buf);
                return;
            }
            let ack = st.my_acknowledgement.wrapping_add(1);
            st.reset(&mut buf, ack);
        }
        debug!("Duplicate SYN on TCP flow {}, resetting", tcb.key);
        self.stats.record_reset();
        self.teardown(tcb);
        self.enqueue(buf);
    }

    async fn forward(&self, tcb: &Arc<Tcb>, payload: &[u8]) -> io::Result<()> {
        write_fully(&tcb.stream, payload).await?;
        self.stats.record_to_network(payload.len());
        Ok(())
    }

    fn reset_after_write_error(&self, tcb: &Arc<Tcb>, mut buf: BytesMut, payload_len: usize, e: io::Error) {
        warn!("TCP flow {} write failed: {}", tcb.key, e);
        {
            let mut st = tcb.state.lock();
            let ack = st.my_acknowledgement.wrapping_add(payload_len as u32);
            st.reset(&mut buf, ack);
        }
        self.stats.record_reset();
        self.teardown(tcb);
        self.enqueue(buf);
    }

    async fn process_fin(&self, tcb: &Arc<Tcb>, mut packet: Packet, fin: &TcpHeader) {
        let payload_len = packet.payload_len();
        if payload_len > 0 {
            if let Err(e) = self.forward(tcb, packet.payload()).await {
                let buf = self.reply_buffer(&mut packet);
                self.reset_after_write_error(tcb, buf, payload_len, e);
                return;
            }
        }
        let mut buf = self.reply_buffer(&mut packet);

        let (finished, status) = {
            let mut st = tcb.state.lock();
            st.my_acknowledgement = fin.sequence_number.wrapping_add(payload_len as u32).wrapping_add(1);
            st.their_acknowledgement = fin.acknowledgement_number;

            let finished = if st.status == TcpStatus::LastAck {
                // our FIN is already out; acknowledge theirs and finish
                st.reply(&mut buf, TcpFlags::ack_only(), 0);
                true
            } else if st.waiting_for_network_data {
                st.reply(&mut buf, TcpFlags::ack_only(), 0);
                st.status = TcpStatus::CloseWait;
                false
            } else {
                st.reply(&mut buf, TcpFlags::fin_ack(), 0);
                st.my_sequence = st.my_sequence.wrapping_add(1);
                st.status = TcpStatus::LastAck;
                false
            };
            (finished, st.status)
        };

        if finished {
            debug!("TCP flow {} finished by device FIN", tcb.key);
            self.teardown(tcb);
        } else {
            debug!("TCP flow {} device FIN, now {}", tcb.key, status);
            if status == TcpStatus::CloseWait {
                // half close towards the remote
                let _ = SockRef::from(&tcb.stream).shutdown(Shutdown::Write);
            }
        }
        self.enqueue(buf);
    }

    async fn process_ack(&self, tcb: &Arc<Tcb>, mut packet: Packet, ack: &TcpHeader) {
        let payload_len = packet.payload_len();

        {
            let mut st = tcb.state.lock();
            let status = st.status;
            match status {
                TcpStatus::SynReceived => {
                    st.status = TcpStatus::Established;
                    st.waiting_for_network_data = true;
                    tcb.set_interest(Some(Interest::Read));
                    debug!("TCP flow {} established", tcb.key);
                }
                TcpStatus::LastAck if ack.acknowledgement_number == st.my_sequence => {
                    drop(st);
                    self.release(&mut packet);
                    self.teardown(tcb);
                    return;
                }
                _ => {}
            }

            if payload_len == 0 {
                drop(st);
                self.release(&mut packet);
                return;
            }

            if !st.waiting_for_network_data && st.status != TcpStatus::LastAck {
                st.waiting_for_network_data = true;
                tcb.set_interest(Some(Interest::Read));
            }
        }

        if let Err(e) = self.forward(tcb, packet.payload()).await {
            let buf = self.reply_buffer(&mut packet);
            self.reset_after_write_error(tcb, buf, payload_len, e);
            return;
        }

        let mut buf = self.reply_buffer(&mut packet);
        {
            let mut st = tcb.state.lock();
            st.my_acknowledgement = ack.sequence_number.wrapping_add(payload_len as u32);
            st.their_acknowledgement = ack.acknowledgement_number;
            st.reply(&mut buf, TcpFlags::ack_only(), 0);
        }
        self.enqueue(buf);
    }

    // --- network -> device ---

    pub async fn run_input(self: Arc<Self>, mut events: SelectorEvents<Tcb>, cancel: CancellationToken) {
        info!("TCP input worker started");
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
        info!("TCP input worker stopped");
    }

    pub fn handle_ready(&self, key: SelectedKey<Tcb>) {
        let tcb = key.attachment;
        if tcb.is_closed() {
            return;
        }
        match key.interest {
            Interest::Connect => self.finish_connect(&tcb, key.result),
            Interest::Read => self.read_from_network(&tcb),
        }
    }

    fn finish_connect(&self, tcb: &Arc<Tcb>, readiness: io::Result<()>) {
        let failure = match readiness {
            Err(e) => Some(e),
            Ok(()) => match tcb.stream.take_error() {
                Ok(Some(e)) | Err(e) => Some(e),
                Ok(None) => tcb.stream.peer_addr().err(),
            },
        };

        let mut buf = self.pool.acquire();
        if let Some(e) = failure {
            warn!("TCP connect to {} failed: {}", tcb.key.destination, e);
            {
                let mut st = tcb.state.lock();
                let ack = st.my_acknowledgement;
                st.template.update_tcp_buffer(&mut buf, TcpFlags::rst_ack(), 0, ack, 0);
            }
            self.stats.record_reset();
            self.teardown(tcb);
            self.enqueue(buf);
            return;
        }

        {
            let mut st = tcb.state.lock();
            if st.status != TcpStatus::SynSent {
                drop(st);
                self.pool.release(buf);
                return;
            }
            st.status = TcpStatus::SynReceived;
            st.reply(&mut buf, TcpFlags::syn_ack(), 0);
            st.my_sequence = st.my_sequence.wrapping_add(1);
        }
        tcb.set_interest(None);
        debug!("TCP flow {} connected", tcb.key);
        self.enqueue(buf);
    }

    fn read_from_network(&self, tcb: &Arc<Tcb>) {
        let mut buf = self.pool.acquire();
        buf.resize(self.pool.buffer_size().min(MAX_PACKET_SIZE), 0);

        match tcb.stream.try_read(&mut buf[TCP_REPLY_HEADER_SIZE..]) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.pool.release(buf);
                tcb.set_interest(Some(Interest::Read));
            }
            Err(e) => {
                warn!("TCP flow {} read failed: {}", tcb.key, e);
                {
                    let mut st = tcb.state.lock();
                    let ack = st.my_acknowledgement;
                    st.reset(&mut buf, ack);
                }
                self.stats.record_reset();
                self.teardown(tcb);
                self.enqueue(buf);
            }
            Ok(0) => {
                tcb.set_interest(None);
                let sent_fin = {
                    let mut st = tcb.state.lock();
                    st.waiting_for_network_data = false;
                    if st.status == TcpStatus::LastAck {
                        false
                    } else {
                        st.reply(&mut buf, TcpFlags::fin_ack(), 0);
                        st.my_sequence = st.my_sequence.wrapping_add(1);
                        st.status = TcpStatus::LastAck;
                        true
                    }
                };
                debug!("TCP flow {} remote closed", tcb.key);
                if sent_fin {
                    self.enqueue(buf);
                } else {
                    self.pool.release(buf);
                }
            }
            Ok(n) => {
                {
                    let mut st = tcb.state.lock();
                    st.reply(&mut buf, TcpFlags::psh_ack(), n);
                    st.my_sequence = st.my_sequence.wrapping_add(n as u32);
                }
                trace!("TCP flow {} relayed {} bytes to device", tcb.key, n);
                self.stats.record_from_network(n);
                self.enqueue(buf);
                tcb.set_interest(Some(Interest::Read));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_ipv4_tcp;
    use crate::packet::IP4_HEADER_SIZE;
    use crate::tests::{reset_connection, LoopbackConnector};
    use std::net::SocketAddrV4;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn device() -> SocketAddrV4 {
        "10.0.0.2:5000".parse().unwrap()
    }

    fn remote() -> SocketAddrV4 {
        "93.184.216.34:80".parse().unwrap()
    }

    fn key() -> FlowKey {
        FlowKey::new(remote(), 5000)
    }

    fn segment(flags: TcpFlags, seq: u32, ack: u32, payload: &[u8]) -> Packet {
        Packet::from_buffer(build_ipv4_tcp(device(), remote(), flags, seq, ack, payload))
            .map_err(|(e, _)| e)
            .unwrap()
    }

    struct Harness {
        engine: Arc<TcpEngine>,
        events: SelectorEvents<Tcb>,
        replies: mpsc::UnboundedReceiver<BytesMut>,
        listener: TcpListener,
    }

    impl Harness {
        async fn new(connector: LoopbackConnector, capacity: usize) -> Self {
            Self::with_pool(connector, capacity, BufferPool::default()).await
        }

        async fn with_pool(connector: LoopbackConnector, capacity: usize, pool: BufferPool) -> Self {
            let (to_device, replies) = mpsc::unbounded_channel();
            let (engine, events) = TcpEngine::new(
                capacity,
                Arc::new(pool),
                Arc::new(RelayStats::new()),
                Arc::new(connector.clone()),
                to_device,
            );
            Self {
                engine: Arc::new(engine),
                events,
                replies,
                listener: connector.take_tcp_listener(),
            }
        }

        async fn immediate() -> Self {
            Self::new(LoopbackConnector::new(), 50).await
        }

        fn reply(&mut self) -> Packet {
            let buf = self.replies.try_recv().expect("expected a reply");
            Packet::from_buffer(buf).map_err(|(e, _)| e).unwrap()
        }

        fn no_reply(&mut self) {
            assert!(self.replies.try_recv().is_err(), "unexpected reply");
        }

        async fn next_event(&mut self) -> SelectedKey<Tcb> {
            let mut ready = tokio::time::timeout(Duration::from_secs(2), self.events.select())
                .await
                .expect("selector timed out")
                .unwrap();
            ready.remove(0)
        }

        /// SYN + handshake ACK, returns the relay's sequence number after SYN|ACK.
        async fn establish(&mut self) -> u32 {
            self.engine.handle_outbound(segment(TcpFlags::syn_only(), 1000, 0, &[])).await;
            let syn_ack = self.reply();
            let iss = syn_ack.tcp().unwrap().sequence_number;
            self.engine
                .handle_outbound(segment(TcpFlags::ack_only(), 1001, iss.wrapping_add(1), &[]))
                .await;
            iss.wrapping_add(1)
        }
    }

    #[tokio::test]
    async fn test_syn_with_immediate_connect() {
        let mut h = Harness::immediate().await;
        h.engine.handle_outbound(segment(TcpFlags::syn_only(), 1000, 0, &[])).await;

        let reply = h.reply();
        let tcp = reply.tcp().unwrap();
        assert_eq!(tcp.flags, TcpFlags::syn_ack());
        assert_eq!(tcp.acknowledgement_number, 1001);
        assert!(tcp.sequence_number <= MAX_INITIAL_SEQUENCE);
        assert_eq!(reply.source(), remote());
        assert_eq!(reply.destination(), device());
        h.no_reply();

        let snap = h.engine.flow(&key()).unwrap().snapshot();
        assert_eq!(snap.status, TcpStatus::SynReceived);
        assert_eq!(snap.my_sequence, tcp.sequence_number.wrapping_add(1));
        assert_eq!(snap.their_sequence, 1000);
        assert_eq!(snap.my_acknowledgement, 1001);
    }

    #[tokio::test]
    async fn test_handshake_then_fin_before_data() {
        let mut h = Harness::immediate().await;
        h.engine.handle_outbound(segment(TcpFlags::syn_only(), 1000, 0, &[])).await;
        let iss = h.reply().tcp().unwrap().sequence_number;

        // FIN while nothing is expected from the network
        h.engine
            .handle_outbound(segment(TcpFlags::fin_ack(), 1001, iss + 1, &[]))
            .await;
        let fin = h.reply();
        assert_eq!(fin.tcp().unwrap().flags, TcpFlags::fin_ack());
        assert_eq!(fin.tcp().unwrap().acknowledgement_number, 1002);
        assert_eq!(h.engine.flow(&key()).unwrap().status(), TcpStatus::LastAck);

        h.engine
            .handle_outbound(segment(TcpFlags::ack_only(), 1002, iss + 2, &[]))
            .await;
        h.no_reply();
        assert!(h.engine.flow(&key()).is_none());
        assert_eq!(h.engine.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_ack_establishes_and_relays_payload() {
        let mut h = Harness::immediate().await;
        let my_seq = h.establish().await;
        let (mut server, _) = h.listener.accept().await.unwrap();
        let tcb = h.engine.flow(&key()).unwrap();
        assert_eq!(tcb.status(), TcpStatus::Established);
        assert!(tcb.snapshot().waiting_for_network_data);
        h.no_reply();

        h.engine
            .handle_outbound(segment(TcpFlags::psh_ack(), 1001, my_seq, b"GET / HTTP/1.0\r\n\r\n"))
            .await;
        let ack = h.reply();
        assert_eq!(ack.tcp().unwrap().flags, TcpFlags::ack_only());
        assert_eq!(ack.tcp().unwrap().acknowledgement_number, 1001 + 18);

        let mut request = [0u8; 18];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"GET / HTTP/1.0\r\n\r\n");

        server.write_all(b"HTTP/1.0 200 OK\r\n").await.unwrap();
        let event = h.next_event().await;
        assert_eq!(event.interest, Interest::Read);
        h.engine.handle_ready(event);

        let data = h.reply();
        let tcp = data.tcp().unwrap();
        assert_eq!(tcp.flags, TcpFlags::psh_ack());
        assert_eq!(tcp.sequence_number, my_seq);
        assert_eq!(tcp.acknowledgement_number, 1019);
        assert_eq!(data.payload(), b"HTTP/1.0 200 OK\r\n");
        assert_eq!(tcb.snapshot().my_sequence, my_seq + 17);
    }

    #[tokio::test]
    async fn test_remote_close_sends_fin_and_final_ack_removes() {
        let mut h = Harness::immediate().await;
        let my_seq = h.establish().await;
        let (server, _) = h.listener.accept().await.unwrap();
        drop(server);

        let event = h.next_event().await;
        h.engine.handle_ready(event);
        let fin = h.reply();
        assert_eq!(fin.tcp().unwrap().flags, TcpFlags::fin_ack());
        assert_eq!(fin.tcp().unwrap().sequence_number, my_seq);
        let tcb = h.engine.flow(&key()).unwrap();
        assert_eq!(tcb.status(), TcpStatus::LastAck);
        assert!(!tcb.snapshot().waiting_for_network_data);

        // an ACK that does not cover our FIN keeps the record
        h.engine
            .handle_outbound(segment(TcpFlags::ack_only(), 1001, my_seq, &[]))
            .await;
        assert!(h.engine.flow(&key()).is_some());

        h.engine
            .handle_outbound(segment(TcpFlags::ack_only(), 1001, my_seq + 1, &[]))
            .await;
        assert!(h.engine.flow(&key()).is_none());
        assert!(tcb.is_closed());
    }

    #[tokio::test]
    async fn test_device_fin_while_reading_enters_close_wait() {
        let mut h = Harness::immediate().await;
        let my_seq = h.establish().await;
        let (mut server, _) = h.listener.accept().await.unwrap();

        h.engine
            .handle_outbound(segment(TcpFlags::fin_ack(), 1001, my_seq, &[]))
            .await;
        let ack = h.reply();
        assert_eq!(ack.tcp().unwrap().flags, TcpFlags::ack_only());
        assert_eq!(ack.tcp().unwrap().acknowledgement_number, 1002);
        assert_eq!(h.engine.flow(&key()).unwrap().status(), TcpStatus::CloseWait);

        // the remote sees our half close and finishes its side
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        drop(server);

        let event = h.next_event().await;
        h.engine.handle_ready(event);
        let fin = h.reply();
        assert_eq!(fin.tcp().unwrap().flags, TcpFlags::fin_ack());
        assert_eq!(h.engine.flow(&key()).unwrap().status(), TcpStatus::LastAck);
    }

    #[tokio::test]
    async fn test_non_syn_without_flow_is_reset() {
        let mut h = Harness::immediate().await;
        h.engine
            .handle_outbound(segment(TcpFlags::ack_only(), 77, 500, &[]))
            .await;
        let rst = h.reply();
        let tcp = rst.tcp().unwrap();
        assert!(tcp.flags.rst);
        assert_eq!(tcp.acknowledgement_number, 78);
        assert_eq!(tcp.sequence_number, 500);
        assert_eq!(h.engine.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_syn_outside_syn_sent_resets() {
        let mut h = Harness::immediate().await;
        h.engine.handle_outbound(segment(TcpFlags::syn_only(), 1000, 0, &[])).await;
        let _ = h.reply();

        h.engine.handle_outbound(segment(TcpFlags::syn_only(), 1000, 0, &[])).await;
        let rst = h.reply();
        assert!(rst.tcp().unwrap().flags.rst);
        assert_eq!(rst.tcp().unwrap().acknowledgement_number, 1002);
        assert!(h.engine.flow(&key()).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_syn_while_connecting_updates_ack_only() {
        let mut h = Harness::new(LoopbackConnector::new().pending(), 50).await;
        h.engine.handle_outbound(segment(TcpFlags::syn_only(), 1000, 0, &[])).await;
        h.no_reply();
        let tcb = h.engine.flow(&key()).unwrap();
        let before = tcb.snapshot();
        assert_eq!(before.status, TcpStatus::SynSent);

        h.engine.handle_outbound(segment(TcpFlags::syn_only(), 2000, 0, &[])).await;
        h.no_reply();
        let after = tcb.snapshot();
        assert_eq!(after.status, TcpStatus::SynSent);
        assert_eq!(after.my_acknowledgement, 2001);
        assert_eq!(after.my_sequence, before.my_sequence);
        assert_eq!(after.their_sequence, before.their_sequence);

        // connect completion produces the SYN|ACK
        let event = h.next_event().await;
        assert_eq!(event.interest, Interest::Connect);
        h.engine.handle_ready(event);
        let syn_ack = h.reply();
        assert_eq!(syn_ack.tcp().unwrap().flags, TcpFlags::syn_ack());
        assert_eq!(syn_ack.tcp().unwrap().acknowledgement_number, 2001);
        assert_eq!(tcb.status(), TcpStatus::SynReceived);
        assert_eq!(tcb.snapshot().my_sequence, before.my_sequence.wrapping_add(1));
    }

    #[tokio::test]
    async fn test_connect_refused_resets_without_record() {
        let mut h = Harness::new(LoopbackConnector::refusing(), 50).await;
        h.engine.handle_outbound(segment(TcpFlags::syn_only(), 1000, 0, &[])).await;
        let rst = h.reply();
        assert!(rst.tcp().unwrap().flags.rst);
        assert_eq!(rst.tcp().unwrap().acknowledgement_number, 1001);
        assert_eq!(h.engine.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_device_rst_tears_down() {
        let mut h = Harness::immediate().await;
        let my_seq = h.establish().await;
        let tcb = h.engine.flow(&key()).unwrap();
        h.engine
            .handle_outbound(segment(TcpFlags::rst_only(), 1001, my_seq, &[]))
            .await;
        h.no_reply();
        assert!(h.engine.flow(&key()).is_none());
        assert!(tcb.is_closed());
    }

    #[tokio::test]
    async fn test_eviction_closes_oldest_flow() {
        let mut h = Harness::new(LoopbackConnector::new(), 1).await;
        h.engine.handle_outbound(segment(TcpFlags::syn_only(), 1, 0, &[])).await;
        let first = h.engine.flow(&key()).unwrap();

        let other = Packet::from_buffer(build_ipv4_tcp(
            "10.0.0.2:5001".parse().unwrap(),
            remote(),
            TcpFlags::syn_only(),
            1,
            0,
            &[],
        ))
        .map_err(|(e, _)| e)
        .unwrap();
        h.engine.handle_outbound(other).await;

        assert_eq!(h.engine.connection_count(), 1);
        assert!(first.is_closed());
        assert!(h.engine.flow(&FlowKey::new(remote(), 5001)).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let mut h = Harness::immediate().await;
        h.establish().await;
        let tcb = h.engine.flow(&key()).unwrap();
        h.engine.shutdown();
        assert!(tcb.is_closed());
        assert_eq!(h.engine.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_async_connect_failure_resets() {
        let mut h = Harness::new(LoopbackConnector::new().pending(), 50).await;
        h.engine.handle_outbound(segment(TcpFlags::syn_only(), 1000, 0, &[])).await;
        h.no_reply();
        let tcb = h.engine.flow(&key()).unwrap();

        let (server, _) = h.listener.accept().await.unwrap();
        reset_connection(server);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let event = h.next_event().await;
        assert_eq!(event.interest, Interest::Connect);
        h.engine.handle_ready(event);

        let rst = h.reply();
        let tcp = rst.tcp().unwrap();
        assert_eq!(tcp.flags, TcpFlags::rst_ack());
        assert_eq!(tcp.sequence_number, 0);
        assert_eq!(tcp.acknowledgement_number, 1001);
        h.no_reply();
        assert!(h.engine.flow(&key()).is_none());
        assert!(tcb.is_closed());
    }

    #[tokio::test]
    async fn test_write_failure_resets() {
        let mut h = Harness::immediate().await;
        let my_seq = h.establish().await;
        let (server, _) = h.listener.accept().await.unwrap();
        let tcb = h.engine.flow(&key()).unwrap();
        reset_connection(server);
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.engine
            .handle_outbound(segment(TcpFlags::psh_ack(), 1001, my_seq, b"hello"))
            .await;
        let rst = h.reply();
        let tcp = rst.tcp().unwrap();
        assert_eq!(tcp.flags, TcpFlags::rst_ack());
        assert_eq!(tcp.sequence_number, my_seq);
        assert_eq!(tcp.acknowledgement_number, 1006);
        h.no_reply();
        assert!(h.engine.flow(&key()).is_none());
        assert!(tcb.is_closed());
    }

    #[tokio::test]
    async fn test_read_error_resets() {
        let mut h = Harness::immediate().await;
        let my_seq = h.establish().await;
        let (server, _) = h.listener.accept().await.unwrap();
        let tcb = h.engine.flow(&key()).unwrap();
        reset_connection(server);

        let event = h.next_event().await;
        assert_eq!(event.interest, Interest::Read);
        h.engine.handle_ready(event);

        let rst = h.reply();
        let tcp = rst.tcp().unwrap();
        assert_eq!(tcp.flags, TcpFlags::rst_ack());
        assert_eq!(tcp.sequence_number, my_seq);
        assert_eq!(tcp.acknowledgement_number, 1001);
        assert!(h.engine.flow(&key()).is_none());
        assert!(tcb.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_pool_reads_fit_ipv4_length() {
        let mut h = Harness::with_pool(LoopbackConnector::new(), 50, BufferPool::new(100_000)).await;
        h.establish().await;
        let (mut server, _) = h.listener.accept().await.unwrap();

        server.write_all(&vec![7u8; 70_000]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let event = h.next_event().await;
        h.engine.handle_ready(event);

        let buf = h.replies.try_recv().unwrap();
        assert!(buf.len() <= MAX_PACKET_SIZE);
        let total_length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        assert_eq!(total_length, buf.len());
        assert!(buf.len() > IP4_HEADER_SIZE);
    }
}
