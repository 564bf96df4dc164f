//! Property tests for header construction and the flow table.
//!
//! smoltcp is used only as an independent checksum reference.

use crate::flow::FlowTable;
use crate::packet::{build_ipv4_tcp, build_ipv4_udp, checksum, Packet, TcpFlags, IP4_HEADER_SIZE};
use parking_lot::Mutex;
use proptest::prelude::*;
use smoltcp::wire::{IpAddress, Ipv4Address, Ipv4Packet, TcpPacket};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

fn addr() -> impl Strategy<Value = SocketAddrV4> {
    (any::<[u8; 4]>(), any::<u16>()).prop_map(|(ip, port)| SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

fn smol(ip: &Ipv4Addr) -> IpAddress {
    IpAddress::Ipv4(Ipv4Address::from_bytes(&ip.octets()))
}

proptest! {
    #[test]
    fn tcp_checksums_match_reference(
        src in addr(),
        dst in addr(),
        flags in any::<u8>(),
        seq in any::<u32>(),
        ack in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let buf = build_ipv4_tcp(src, dst, TcpFlags::from_byte(flags), seq, ack, &payload);

        let ip = Ipv4Packet::new_checked(&buf[..]).unwrap();
        prop_assert!(ip.verify_checksum());
        prop_assert_eq!(checksum(&buf[..IP4_HEADER_SIZE]), 0);

        let tcp = TcpPacket::new_checked(&buf[IP4_HEADER_SIZE..]).unwrap();
        prop_assert!(tcp.verify_checksum(&smol(src.ip()), &smol(dst.ip())));
        prop_assert_eq!(tcp.seq_number().0 as u32, seq);
        prop_assert_eq!(tcp.ack_number().0 as u32, ack);
    }

    #[test]
    fn corrupted_ip_header_fails_checksum(
        src in addr(),
        dst in addr(),
        index in 0usize..IP4_HEADER_SIZE,
        flip in 1u8..=255,
    ) {
        let mut buf = build_ipv4_udp(src, dst, b"payload");
        buf[index] ^= flip;
        prop_assert_ne!(checksum(&buf[..IP4_HEADER_SIZE]), 0);
    }

    #[test]
    fn parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..128)) {
        let _ = Packet::parse(&data);
    }

    #[test]
    fn flow_table_stays_bounded(
        capacity in 1usize..16,
        keys in proptest::collection::vec(0u16..64, 0..200),
    ) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = evicted.clone();
        let mut table = FlowTable::new(capacity, move |k: u16, _v: ()| sink.lock().push(k));

        for key in &keys {
            table.put(*key, ());
            prop_assert!(table.len() <= capacity);
        }

        let mut distinct = keys.clone();
        distinct.sort_unstable();
        distinct.dedup();
        let evicted = evicted.lock();
        prop_assert_eq!(table.len(), distinct.len().min(capacity));
        for key in evicted.iter() {
            prop_assert!(distinct.contains(key));
        }
    }
}
