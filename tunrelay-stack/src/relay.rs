//! Relay lifecycle
//!
//! [`Relay::start`] wires the device pump and the four engine workers
//! together and returns a [`RelayHandle`]. The handle is the only way to
//! observe or stop a running relay, so several relays can coexist in one
//! process.

use crate::config::RelayConfig;
use crate::connector::{Connector, SystemConnector};
use crate::device::{DevicePump, TunDevice};
use crate::error::Result;
use crate::flow::FlowKey;
use crate::pool::BufferPool;
use crate::stats::{RelayStats, StatsSnapshot};
use crate::tcp::{TcbSnapshot, TcpEngine};
use crate::udp::UdpEngine;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Relay;

impl Relay {
    /// Start relaying between `device` and the real network.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<D: TunDevice>(
        config: &RelayConfig,
        device: D,
        connector: Arc<dyn Connector>,
    ) -> Result<RelayHandle> {
        config.validate()?;

        let pool = Arc::new(BufferPool::new(config.buffer_size));
        let stats = Arc::new(RelayStats::new());
        let cancel = CancellationToken::new();

        let (to_device_tx, to_device_rx) = mpsc::unbounded_channel();
        let (tcp_out_tx, tcp_out_rx) = mpsc::unbounded_channel();
        let (udp_out_tx, udp_out_rx) = mpsc::unbounded_channel();

        let (tcp, tcp_events) = TcpEngine::new(
            config.tcp.max_connections,
            pool.clone(),
            stats.clone(),
            connector.clone(),
            to_device_tx.clone(),
        );
        let (udp, udp_events) = UdpEngine::new(
            config.udp.max_sockets,
            pool.clone(),
            stats.clone(),
            connector,
            to_device_tx,
        );
        let tcp = Arc::new(tcp);
        let udp = Arc::new(udp);

        let pump = DevicePump {
            device,
            pool: pool.clone(),
            stats: stats.clone(),
            tcp_out: tcp_out_tx,
            udp_out: udp_out_tx,
            to_device: to_device_rx,
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(pump.run(cancel.clone()));
        tasks.spawn(tcp.clone().run_output(tcp_out_rx, cancel.clone()));
        tasks.spawn(tcp.clone().run_input(tcp_events, cancel.clone()));
        tasks.spawn(udp.clone().run_output(udp_out_rx, cancel.clone()));
        tasks.spawn(udp.clone().run_input(udp_events, cancel.clone()));

        info!(
            "Relay started (tcp={}, udp={}, buffer={})",
            config.tcp.max_connections, config.udp.max_sockets, config.buffer_size
        );

        Ok(RelayHandle {
            cancel,
            tasks,
            tcp,
            udp,
            pool,
            stats,
        })
    }

    /// Start with the plain system connector.
    pub fn start_default<D: TunDevice>(config: &RelayConfig, device: D) -> Result<RelayHandle> {
        Self::start(config, device, Arc::new(SystemConnector::new()))
    }
}

/// Fluent construction of a relay.
pub struct RelayBuilder {
    config: RelayConfig,
    connector: Option<Arc<dyn Connector>>,
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
            connector: None,
        }
    }

    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.tcp.max_connections = max;
        self
    }

    pub fn max_udp_sockets(mut self, max: usize) -> Self {
        self.config.udp.max_sockets = max;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn start<D: TunDevice>(self, device: D) -> Result<RelayHandle> {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(SystemConnector::new()));
        Relay::start(&self.config, device, connector)
    }
}

/// Owner's handle on a running relay. Dropping it aborts the workers and
/// closes every outbound socket.
pub struct RelayHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    tcp: Arc<TcpEngine>,
    udp: Arc<UdpEngine>,
    pool: Arc<BufferPool>,
    stats: Arc<RelayStats>,
}

impl RelayHandle {
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolves once the relay stops on its own (tunnel failure) or is asked to.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        let (allocated, reused) = self.pool.counters();
        snapshot.buffers_allocated = allocated;
        snapshot.buffers_reused = reused;
        snapshot
    }

    pub fn tcp_connection_count(&self) -> usize {
        self.tcp.connection_count()
    }

    pub fn udp_socket_count(&self) -> usize {
        self.udp.socket_count()
    }

    pub fn tcp_flow(&self, key: &FlowKey) -> Option<TcbSnapshot> {
        self.tcp.flow(key).map(|tcb| tcb.snapshot())
    }

    /// Cancel every worker, wait for them, then close all sockets and
    /// drop the buffer pool. The tunnel device is closed with the pump.
    pub async fn stop(mut self) {
        info!("Stopping relay");
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Relay worker ended abnormally: {}", e);
            }
        }
        self.tcp.shutdown();
        self.udp.shutdown();
        self.pool.clear();
        info!("Relay stopped");
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        // watchers hold their records, so close them here rather than
        // waiting for the engines to be dropped
        self.tcp.shutdown();
        self.udp.shutdown();
        self.pool.clear();
    }
}
