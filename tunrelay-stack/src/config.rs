//! Relay configuration

use crate::error::{RelayError, Result};
use crate::packet::{MAX_PACKET_SIZE, TCP_REPLY_HEADER_SIZE};
use crate::pool::BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    /// Size of every pooled packet buffer.
    pub buffer_size: usize,
    pub tun: TunConfig,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            buffer_size: BUFFER_SIZE,
            tun: TunConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Connection records kept before the least recently used one is evicted.
    pub max_connections: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self { max_connections: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Outbound datagram sockets cached by flow.
    pub max_sockets: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self { max_sockets: 50 }
    }
}

/// Tunnel interface settings, consumed by the host that creates the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    /// Routes sent through the tunnel, in CIDR notation.
    pub routes: Vec<String>,
    pub dns: Vec<Ipv4Addr>,
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "tunrelay0".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 2),
            prefix_len: 32,
            routes: vec!["0.0.0.0/0".to_string()],
            dns: vec![Ipv4Addr::new(8, 8, 8, 8)],
            mtu: 1500,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tcp.max_connections == 0 {
            return Err(RelayError::Config("tcp.max_connections must be at least 1".into()));
        }
        if self.udp.max_sockets == 0 {
            return Err(RelayError::Config("udp.max_sockets must be at least 1".into()));
        }
        if self.buffer_size <= TCP_REPLY_HEADER_SIZE {
            return Err(RelayError::Config(format!(
                "buffer_size {} leaves no room for payload",
                self.buffer_size
            )));
        }
        if self.buffer_size > MAX_PACKET_SIZE {
            return Err(RelayError::Config(format!(
                "buffer_size {} exceeds the largest IPv4 packet ({})",
                self.buffer_size, MAX_PACKET_SIZE
            )));
        }
        if self.tun.prefix_len > 32 {
            return Err(RelayError::Config(format!("invalid prefix length {}", self.tun.prefix_len)));
        }
        for route in &self.tun.routes {
            parse_cidr(route)?;
        }
        Ok(())
    }
}

/// Parse `a.b.c.d/len`.
pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = s
        .split_once('/')
        .ok_or_else(|| RelayError::Config(format!("route {} is not in CIDR notation", s)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| RelayError::Config(format!("invalid route address {}", addr)))?;
    let len: u8 = len
        .parse()
        .ok()
        .filter(|l| *l <= 32)
        .ok_or_else(|| RelayError::Config(format!("invalid route prefix {}", len)))?;
    Ok((addr, len))
}
