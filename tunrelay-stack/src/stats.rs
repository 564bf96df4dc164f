//! Relay-wide counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RelayStats {
    start_time: Instant,

    // Tunnel side
    pub packets_from_device: AtomicU64,
    pub packets_to_device: AtomicU64,
    pub bytes_from_device: AtomicU64,
    pub bytes_to_device: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_invalid: AtomicU64,

    // Protocol
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,

    // Flows
    pub tcp_connections_total: AtomicU64,
    pub tcp_connections_active: AtomicU64,
    pub tcp_resets_sent: AtomicU64,
    pub udp_sockets_total: AtomicU64,
    pub udp_sockets_active: AtomicU64,

    // Network side
    pub bytes_to_network: AtomicU64,
    pub bytes_from_network: AtomicU64,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_from_device: AtomicU64::new(0),
            packets_to_device: AtomicU64::new(0),
            bytes_from_device: AtomicU64::new(0),
            bytes_to_device: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            packets_invalid: AtomicU64::new(0),
            tcp_packets: AtomicU64::new(0),
            udp_packets: AtomicU64::new(0),
            tcp_connections_total: AtomicU64::new(0),
            tcp_connections_active: AtomicU64::new(0),
            tcp_resets_sent: AtomicU64::new(0),
            udp_sockets_total: AtomicU64::new(0),
            udp_sockets_active: AtomicU64::new(0),
            bytes_to_network: AtomicU64::new(0),
            bytes_from_network: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_from_device(&self, bytes: usize) {
        self.packets_from_device.fetch_add(1, Ordering::Relaxed);
        self.bytes_from_device.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_to_device(&self, bytes: usize) {
        self.packets_to_device.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_device.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.packets_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp(&self) {
        self.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_opened(&self) {
        self.tcp_connections_total.fetch_add(1, Ordering::Relaxed);
        self.tcp_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_closed(&self) {
        self.tcp_connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.tcp_resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_opened(&self) {
        self.udp_sockets_total.fetch_add(1, Ordering::Relaxed);
        self.udp_sockets_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_closed(&self) {
        self.udp_sockets_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_to_network(&self, bytes: usize) {
        self.bytes_to_network.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_from_network(&self, bytes: usize) {
        self.bytes_from_network.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            packets_from_device: self.packets_from_device.load(Ordering::Relaxed),
            packets_to_device: self.packets_to_device.load(Ordering::Relaxed),
            bytes_from_device: self.bytes_from_device.load(Ordering::Relaxed),
            bytes_to_device: self.bytes_to_device.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_invalid: self.packets_invalid.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            tcp_connections_total: self.tcp_connections_total.load(Ordering::Relaxed),
            tcp_connections_active: self.tcp_connections_active.load(Ordering::Relaxed),
            tcp_resets_sent: self.tcp_resets_sent.load(Ordering::Relaxed),
            udp_sockets_total: self.udp_sockets_total.load(Ordering::Relaxed),
            udp_sockets_active: self.udp_sockets_active.load(Ordering::Relaxed),
            bytes_to_network: self.bytes_to_network.load(Ordering::Relaxed),
            bytes_from_network: self.bytes_from_network.load(Ordering::Relaxed),
            buffers_allocated: 0,
            buffers_reused: 0,
        }
    }
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub packets_from_device: u64,
    pub packets_to_device: u64,
    pub bytes_from_device: u64,
    pub bytes_to_device: u64,
    pub packets_dropped: u64,
    pub packets_invalid: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub tcp_connections_total: u64,
    pub tcp_connections_active: u64,
    pub tcp_resets_sent: u64,
    pub udp_sockets_total: u64,
    pub udp_sockets_active: u64,
    pub bytes_to_network: u64,
    pub bytes_from_network: u64,
    pub buffers_allocated: u64,
    pub buffers_reused: u64,
}

impl StatsSnapshot {
    pub fn active_flows(&self) -> u64 {
        self.tcp_connections_active + self.udp_sockets_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_counters() {
        let stats = RelayStats::new();
        stats.record_tcp_opened();
        stats.record_tcp_opened();
        stats.record_tcp_closed();
        stats.record_udp_opened();

        let snap = stats.snapshot();
        assert_eq!(snap.tcp_connections_total, 2);
        assert_eq!(snap.tcp_connections_active, 1);
        assert_eq!(snap.active_flows(), 2);
    }

    #[test]
    fn test_device_counters() {
        let stats = RelayStats::new();
        stats.record_from_device(60);
        stats.record_to_device(40);
        stats.record_to_device(1500);
        let snap = stats.snapshot();
        assert_eq!(snap.packets_from_device, 1);
        assert_eq!(snap.bytes_to_device, 1540);
        assert_eq!(snap.packets_to_device, 2);
    }
}
