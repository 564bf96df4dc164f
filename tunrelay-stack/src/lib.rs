//! tunrelay - user-space TCP/UDP relay behind a TUN device
//!
//! Every IPv4 datagram the operating system routes into the tunnel is
//! parsed and handed to a per-protocol engine. Each TCP connection and UDP
//! flow the device opens is terminated here and re-originated as an
//! ordinary socket to the real destination; replies are wrapped back into
//! hand-built IPv4 datagrams and written to the tunnel. There is no
//! retransmission, windowing or congestion control on the tunnel side.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                      TUN Device                             |
//! +-------------------------------------------------------------+
//!            | read                          ^ write
//!            v                               |
//! +-------------------------------------------------------------+
//! |                     Device Pump                             |
//! |  (parse, route by protocol, drain the to-device queue)      |
//! +-------------------------------------------------------------+
//!        | tcp queue        | udp queue          ^ to-device queue
//!        v                  v                    |
//! +----------------+ +----------------+          |
//! | TCP Engine     | | UDP Engine     |----------+
//! | output / input | | output / input |
//! +----------------+ +----------------+
//!        |   ^              |   ^
//!        v   | Selector     v   | Selector
//! +-------------------------------------------------------------+
//! |            Real sockets (via Connector)                     |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use tunrelay_stack::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (device, _tunnel) = MemoryDevice::pair();
//!     let relay = RelayBuilder::new().max_connections(100).start(device)?;
//!     // ...
//!     relay.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod device;
pub mod error;
pub mod flow;
pub mod packet;
pub mod pool;
pub mod relay;
pub mod selector;
pub mod stats;
pub mod tcp;
pub mod udp;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use config::{RelayConfig, TcpConfig, TunConfig, UdpConfig};
pub use connector::{Connector, ProtectCallback, SystemConnector, TcpConnect};
pub use device::{MemoryDevice, MemoryDeviceHandle, TunDevice};
pub use error::{RelayError, Result};
pub use flow::{FlowKey, FlowTable};
pub use packet::{build_ipv4_tcp, build_ipv4_udp, Packet, TcpFlags};
pub use pool::BufferPool;
pub use relay::{Relay, RelayBuilder, RelayHandle};
pub use stats::{RelayStats, StatsSnapshot};
pub use tcp::{TcbSnapshot, TcpStatus};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::RelayConfig;
    pub use crate::device::{MemoryDevice, TunDevice};
    pub use crate::error::{RelayError, Result};
    pub use crate::relay::{Relay, RelayBuilder, RelayHandle};
    pub use crate::stats::StatsSnapshot;
}
