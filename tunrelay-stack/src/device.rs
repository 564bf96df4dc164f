//! Tunnel device abstraction and the device pump
//!
//! The pump is the only task that touches the tunnel device. It reads one
//! datagram at a time, parses it and fans it out to the TCP or UDP output
//! queue, and in the same loop writes back whatever the input workers put on
//! the shared to-device queue.

use crate::error::RelayError;
use crate::packet::{Packet, Transport};
use crate::pool::BufferPool;
use crate::stats::RelayStats;
use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Packet-oriented tunnel interface. Dropping it closes it.
pub trait TunDevice: Send + Sync + 'static {
    /// Read one datagram into `buf`, returning its length.
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Write one complete datagram.
    fn send(&self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// In-process tunnel backed by channels.
///
/// Useful for embedding the relay behind a device that is driven elsewhere,
/// and for tests.
#[derive(Debug)]
pub struct MemoryDevice {
    inbound: Mutex<mpsc::UnboundedReceiver<BytesMut>>,
    outbound: mpsc::UnboundedSender<BytesMut>,
}

/// The application side of a [`MemoryDevice`].
#[derive(Debug)]
pub struct MemoryDeviceHandle {
    to_relay: mpsc::UnboundedSender<BytesMut>,
    from_relay: mpsc::UnboundedReceiver<BytesMut>,
}

impl MemoryDevice {
    pub fn pair() -> (MemoryDevice, MemoryDeviceHandle) {
        let (to_relay, inbound) = mpsc::unbounded_channel();
        let (outbound, from_relay) = mpsc::unbounded_channel();
        (
            MemoryDevice {
                inbound: Mutex::new(inbound),
                outbound,
            },
            MemoryDeviceHandle { to_relay, from_relay },
        )
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, RelayError::DeviceClosed)
}

impl TunDevice for MemoryDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self.inbound.lock().await.recv().await.ok_or_else(closed)?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.send(BytesMut::from(buf)).map_err(|_| closed())?;
        Ok(buf.len())
    }
}

impl MemoryDeviceHandle {
    /// Deliver a datagram as if the OS had written it into the tunnel.
    pub fn inject(&self, packet: BytesMut) -> Result<(), RelayError> {
        self.to_relay.send(packet).map_err(|_| RelayError::DeviceClosed)
    }

    /// Next datagram the relay wrote to the tunnel.
    pub async fn next_packet(&mut self) -> Option<BytesMut> {
        self.from_relay.recv().await
    }

    pub fn try_next_packet(&mut self) -> Option<BytesMut> {
        self.from_relay.try_recv().ok()
    }
}

pub(crate) struct DevicePump<D> {
    pub device: D,
    pub pool: Arc<BufferPool>,
    pub stats: Arc<RelayStats>,
    pub tcp_out: mpsc::UnboundedSender<Packet>,
    pub udp_out: mpsc::UnboundedSender<Packet>,
    pub to_device: mpsc::UnboundedReceiver<BytesMut>,
}

impl<D: TunDevice> DevicePump<D> {
    fn read_buffer(&self) -> BytesMut {
        let mut buf = self.pool.acquire();
        buf.resize(self.pool.buffer_size(), 0);
        buf
    }

    /// Pump until cancelled. A device error cancels the whole relay.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Device pump started");
        let mut read_buf = self.read_buffer();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outgoing = self.to_device.recv() => {
                    let Some(buf) = outgoing else {
                        debug!("To-device queue closed");
                        break;
                    };
                    if let Err(e) = self.device.send(&buf).await {
                        error!("Tunnel write error: {}", e);
                        cancel.cancel();
                        break;
                    }
                    trace!("Wrote {} bytes to tunnel", buf.len());
                    self.stats.record_to_device(buf.len());
                    self.pool.release(buf);
                }
                read = self.device.recv(&mut read_buf) => {
                    match read {
                        Ok(0) => {}
                        Ok(n) => {
                            read_buf.truncate(n);
                            let fresh = self.read_buffer();
                            let buf = std::mem::replace(&mut read_buf, fresh);
                            self.route(buf);
                        }
                        Err(e) => {
                            error!("Tunnel read error: {}", e);
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        }

        self.pool.release(read_buf);
        info!("Device pump stopped");
    }

    fn route(&self, buf: BytesMut) {
        self.stats.record_from_device(buf.len());

        let packet = match Packet::from_buffer(buf) {
            Ok(packet) => packet,
            Err((e, buf)) => {
                trace!("Dropping malformed packet: {}", e);
                self.stats.record_invalid();
                self.pool.release(buf);
                return;
            }
        };

        trace!("Tunnel -> {}", packet);
        let queued = match packet.transport {
            Transport::Tcp(_) => {
                self.stats.record_tcp();
                self.tcp_out.send(packet).map_err(|e| e.0)
            }
            Transport::Udp(_) => {
                self.stats.record_udp();
                self.udp_out.send(packet).map_err(|e| e.0)
            }
            Transport::Other => {
                trace!("Dropping unsupported protocol {}", packet.ip.protocol);
                Err(packet)
            }
        };

        if let Err(mut packet) = queued {
            self.stats.record_dropped();
            if let Some(buf) = packet.take_backing() {
                self.pool.release(buf);
            }
        }
    }
}
