//! IPv4/TCP/UDP codec
//!
//! [`Packet::parse`] decodes the fixed 20-byte IPv4 header and the transport
//! header that follows it. A parsed packet that is turned into a reply
//! template (see [`Packet::swap_source_and_destination`]) is then used to
//! stamp headers onto outgoing buffers with [`Packet::update_tcp_buffer`] and
//! [`Packet::update_udp_buffer`], which also recompute every checksum.

use crate::error::{RelayError, Result};
use bytes::BytesMut;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

pub const IP4_HEADER_SIZE: usize = 20;
pub const TCP_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

/// Header space reserved in front of TCP payloads.
pub const TCP_REPLY_HEADER_SIZE: usize = IP4_HEADER_SIZE + TCP_HEADER_SIZE;
/// Header space reserved in front of UDP payloads.
pub const UDP_REPLY_HEADER_SIZE: usize = IP4_HEADER_SIZE + UDP_HEADER_SIZE;
/// Largest datagram an IPv4 total length can describe.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const DEFAULT_TTL: u8 = 64;
const DONT_FRAGMENT: u16 = 0x4000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn syn_only() -> Self {
        Self { syn: true, ..Default::default() }
    }
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
            urg: b & 0x20 != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        flags
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.fin, "FIN"),
            (self.syn, "SYN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
            (self.ack, "ACK"),
            (self.urg, "URG"),
        ];
        let mut first = true;
        for (set, name) in names {
            if set {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in 32-bit words.
    pub ihl: u8,
    pub type_of_service: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    fn new(source: Ipv4Addr, destination: Ipv4Addr, protocol: u8) -> Self {
        Self {
            version: 4,
            ihl: 5,
            type_of_service: 0,
            total_length: 0,
            identification: 0,
            flags_fragment: DONT_FRAGMENT,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            source,
            destination,
        }
    }

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < IP4_HEADER_SIZE {
            return Err(RelayError::PacketTooShort {
                expected: IP4_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let version = data[0] >> 4;
        if version != 4 {
            return Err(RelayError::InvalidIpVersion(version));
        }
        let ihl = data[0] & 0x0F;
        if ihl < 5 {
            return Err(RelayError::InvalidPacket(format!("IPv4 header length {} words", ihl)));
        }
        if ihl > 5 {
            return Err(RelayError::Unsupported("IPv4 options".into()));
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]);
        if (total_length as usize) < IP4_HEADER_SIZE {
            return Err(RelayError::InvalidPacket(format!("IPv4 total length {}", total_length)));
        }

        Ok(Self {
            version,
            ihl,
            type_of_service: data[1],
            total_length,
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags_fragment: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    fn write(&self, out: &mut [u8]) {
        out[0] = (self.version << 4) | (self.ihl & 0x0F);
        out[1] = self.type_of_service;
        out[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        out[12..16].copy_from_slice(&self.source.octets());
        out[16..20].copy_from_slice(&self.destination.octets());
    }
}

impl fmt::Display for Ipv4Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPv4 {} -> {} proto={} len={} ttl={} id={} csum={:#06x}",
            self.source,
            self.destination,
            self.protocol,
            self.total_length,
            self.ttl,
            self.identification,
            self.checksum
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgement_number: u32,
    /// Header length in 32-bit words.
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
}

impl TcpHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TCP_HEADER_SIZE {
            return Err(RelayError::PacketTooShort {
                expected: TCP_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(RelayError::InvalidPacket(format!("TCP data offset {}", data_offset)));
        }
        let header_len = data_offset as usize * 4;
        if data.len() < header_len {
            return Err(RelayError::PacketTooShort {
                expected: header_len,
                actual: data.len(),
            });
        }

        Ok(Self {
            source_port: u16::from_be_bytes([data[0], data[1]]),
            destination_port: u16::from_be_bytes([data[2], data[3]]),
            sequence_number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            acknowledgement_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset,
            flags: TcpFlags::from_byte(data[13]),
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_pointer: u16::from_be_bytes([data[18], data[19]]),
        })
    }

    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }

    fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.sequence_number.to_be_bytes());
        out[8..12].copy_from_slice(&self.acknowledgement_number.to_be_bytes());
        out[12] = self.data_offset << 4;
        out[13] = self.flags.to_byte();
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());
    }
}

impl fmt::Display for TcpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TCP {} -> {} [{}] seq={} ack={} win={}",
            self.source_port,
            self.destination_port,
            self.flags,
            self.sequence_number,
            self.acknowledgement_number,
            self.window
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < UDP_HEADER_SIZE {
            return Err(RelayError::PacketTooShort {
                expected: UDP_HEADER_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            source_port: u16::from_be_bytes([data[0], data[1]]),
            destination_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6..8].copy_from_slice(&self.checksum.to_be_bytes());
    }
}

impl fmt::Display for UdpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UDP {} -> {} len={}",
            self.source_port, self.destination_port, self.length
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    /// Any protocol the relay does not terminate.
    Other,
}

/// A decoded datagram, optionally still attached to the buffer it came from.
#[derive(Debug, Clone)]
pub struct Packet {
    pub ip: Ipv4Header,
    pub transport: Transport,
    header_len: usize,
    payload_len: usize,
    backing: Option<BytesMut>,
}

impl Packet {
    /// Decode the headers at the start of `data`.
    ///
    /// The payload is bounded by the IPv4 total length, or by the bytes
    /// actually present when the datagram was truncated on read.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let ip = Ipv4Header::parse(data)?;
        let end = (ip.total_length as usize).min(data.len());
        let ip_len = ip.header_len();
        let segment = &data[ip_len..end];

        let (transport, transport_len) = match ip.protocol {
            IPPROTO_TCP => {
                let tcp = TcpHeader::parse(segment)?;
                let len = tcp.header_len();
                (Transport::Tcp(tcp), len)
            }
            IPPROTO_UDP => (Transport::Udp(UdpHeader::parse(segment)?), UDP_HEADER_SIZE),
            _ => (Transport::Other, 0),
        };

        let header_len = ip_len + transport_len;
        Ok(Self {
            ip,
            transport,
            header_len,
            payload_len: end - header_len,
            backing: None,
        })
    }

    /// Parse `buf` and keep it as the packet's backing store.
    pub fn from_buffer(buf: BytesMut) -> std::result::Result<Self, (RelayError, BytesMut)> {
        match Self::parse(&buf) {
            Ok(mut packet) => {
                packet.backing = Some(buf);
                Ok(packet)
            }
            Err(e) => Err((e, buf)),
        }
    }

    /// Fresh TCP template between two endpoints, used for locally built packets.
    pub fn tcp_template(source: SocketAddrV4, destination: SocketAddrV4) -> Self {
        Self {
            ip: Ipv4Header::new(*source.ip(), *destination.ip(), IPPROTO_TCP),
            transport: Transport::Tcp(TcpHeader {
                source_port: source.port(),
                destination_port: destination.port(),
                sequence_number: 0,
                acknowledgement_number: 0,
                data_offset: 5,
                flags: TcpFlags::default(),
                window: u16::MAX,
                checksum: 0,
                urgent_pointer: 0,
            }),
            header_len: TCP_REPLY_HEADER_SIZE,
            payload_len: 0,
            backing: None,
        }
    }

    /// Fresh UDP template between two endpoints.
    pub fn udp_template(source: SocketAddrV4, destination: SocketAddrV4) -> Self {
        Self {
            ip: Ipv4Header::new(*source.ip(), *destination.ip(), IPPROTO_UDP),
            transport: Transport::Udp(UdpHeader {
                source_port: source.port(),
                destination_port: destination.port(),
                length: UDP_HEADER_SIZE as u16,
                checksum: 0,
            }),
            header_len: UDP_REPLY_HEADER_SIZE,
            payload_len: 0,
            backing: None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self.transport, Transport::Tcp(_))
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.transport, Transport::Udp(_))
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        match &self.transport {
            Transport::Udp(udp) => Some(udp),
            _ => None,
        }
    }

    fn ports(&self) -> (u16, u16) {
        match &self.transport {
            Transport::Tcp(tcp) => (tcp.source_port, tcp.destination_port),
            Transport::Udp(udp) => (udp.source_port, udp.destination_port),
            Transport::Other => (0, 0),
        }
    }

    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.source, self.ports().0)
    }

    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.destination, self.ports().1)
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Payload bytes, empty once the backing buffer has been taken.
    pub fn payload(&self) -> &[u8] {
        match &self.backing {
            Some(buf) => &buf[self.header_len..self.header_len + self.payload_len],
            None => &[],
        }
    }

    /// Header-only copy, detached from any buffer.
    pub fn to_template(&self) -> Self {
        Self {
            ip: self.ip.clone(),
            transport: self.transport.clone(),
            header_len: self.header_len,
            payload_len: 0,
            backing: None,
        }
    }

    /// Detach the backing buffer so it can be released to the pool.
    pub fn take_backing(&mut self) -> Option<BytesMut> {
        self.backing.take()
    }

    /// Turn a captured packet around so it addresses the original sender.
    pub fn swap_source_and_destination(&mut self) {
        std::mem::swap(&mut self.ip.source, &mut self.ip.destination);
        match &mut self.transport {
            Transport::Tcp(tcp) => std::mem::swap(&mut tcp.source_port, &mut tcp.destination_port),
            Transport::Udp(udp) => std::mem::swap(&mut udp.source_port, &mut udp.destination_port),
            Transport::Other => {}
        }
    }

    /// Stamp this template's headers onto `buf` as a TCP segment.
    ///
    /// `buf` must hold `payload_size` payload bytes starting at
    /// [`TCP_REPLY_HEADER_SIZE`]; it is resized to exactly header plus payload.
    /// Options from the captured packet are never echoed.
    pub fn update_tcp_buffer(
        &mut self,
        buf: &mut BytesMut,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        payload_size: usize,
    ) {
        let Transport::Tcp(tcp) = &mut self.transport else {
            return;
        };
        let total = TCP_REPLY_HEADER_SIZE + payload_size;
        buf.resize(total, 0);

        self.ip.ihl = 5;
        self.ip.total_length = total as u16;
        self.ip.checksum = 0;
        tcp.flags = flags;
        tcp.sequence_number = seq;
        tcp.acknowledgement_number = ack;
        tcp.data_offset = 5;
        tcp.checksum = 0;

        self.ip.write(&mut buf[..IP4_HEADER_SIZE]);
        tcp.write(&mut buf[IP4_HEADER_SIZE..TCP_REPLY_HEADER_SIZE]);

        tcp.checksum = pseudo_header_checksum(
            self.ip.source,
            self.ip.destination,
            IPPROTO_TCP,
            &buf[IP4_HEADER_SIZE..total],
        );
        buf[IP4_HEADER_SIZE + 16..IP4_HEADER_SIZE + 18].copy_from_slice(&tcp.checksum.to_be_bytes());

        self.ip.checksum = checksum(&buf[..IP4_HEADER_SIZE]);
        buf[10..12].copy_from_slice(&self.ip.checksum.to_be_bytes());

        self.header_len = TCP_REPLY_HEADER_SIZE;
        self.payload_len = payload_size;
    }

    /// Stamp this template's headers onto `buf` as a UDP datagram.
    ///
    /// The UDP checksum is left zero, which IPv4 receivers accept as "not
    /// computed".
    pub fn update_udp_buffer(&mut self, buf: &mut BytesMut, payload_size: usize) {
        let Transport::Udp(udp) = &mut self.transport else {
            return;
        };
        let total = UDP_REPLY_HEADER_SIZE + payload_size;
        buf.resize(total, 0);

        self.ip.ihl = 5;
        self.ip.total_length = total as u16;
        self.ip.checksum = 0;
        udp.length = (UDP_HEADER_SIZE + payload_size) as u16;
        udp.checksum = 0;

        self.ip.write(&mut buf[..IP4_HEADER_SIZE]);
        udp.write(&mut buf[IP4_HEADER_SIZE..UDP_REPLY_HEADER_SIZE]);

        self.ip.checksum = checksum(&buf[..IP4_HEADER_SIZE]);
        buf[10..12].copy_from_slice(&self.ip.checksum.to_be_bytes());

        self.header_len = UDP_REPLY_HEADER_SIZE;
        self.payload_len = payload_size;
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip)?;
        match &self.transport {
            Transport::Tcp(tcp) => write!(f, " / {}", tcp)?,
            Transport::Udp(udp) => write!(f, " / {}", udp)?,
            Transport::Other => {}
        }
        write!(f, " payload={}", self.payload_len)
    }
}

/// Build a complete IPv4/TCP datagram.
pub fn build_ipv4_tcp(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(TCP_REPLY_HEADER_SIZE + payload.len());
    buf.resize(TCP_REPLY_HEADER_SIZE, 0);
    buf.extend_from_slice(payload);
    Packet::tcp_template(source, destination).update_tcp_buffer(&mut buf, flags, seq, ack, payload.len());
    buf
}

/// Build a complete IPv4/UDP datagram.
pub fn build_ipv4_udp(source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(UDP_REPLY_HEADER_SIZE + payload.len());
    buf.resize(UDP_REPLY_HEADER_SIZE, 0);
    buf.extend_from_slice(payload);
    Packet::udp_template(source, destination).update_udp_buffer(&mut buf, payload.len());
    buf
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// One's-complement checksum over `data`, as used by the IPv4 header.
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(0, data))
}

/// Transport checksum including the IPv4 pseudo-header.
pub fn pseudo_header_checksum(source: Ipv4Addr, destination: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = sum_words(0, &source.octets());
    sum = sum_words(sum, &destination.octets());
    sum = sum.wrapping_add(protocol as u32);
    sum = sum.wrapping_add(segment.len() as u32);
    fold(sum_words(sum, segment))
}
