//! Ethernet/IPv4/UDP frame helpers for replies that bypass smoltcp.

use smoltcp::wire::{EthernetAddress, EthernetFrame, PrettyPrinter};
use std::net::Ipv4Addr;

pub const ETH_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

/// Build an ethernet header.
pub fn build_eth_header(dst: EthernetAddress, src: EthernetAddress, ethertype: u16) -> [u8; 14] {
    let mut hdr = [0u8; ETH_HEADER_LEN];
    hdr[0..6].copy_from_slice(dst.as_bytes());
    hdr[6..12].copy_from_slice(src.as_bytes());
    hdr[12..14].copy_from_slice(&ethertype.to_be_bytes());
    hdr
}

/// Internet checksum over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    finalize_checksum(sum_be_words(data))
}

/// TCP/UDP checksum including the IPv4 pseudo-header.
pub fn tcp_udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut sum = sum_be_words(&src.octets()) + sum_be_words(&dst.octets());
    sum += proto as u64;
    sum += segment.len() as u64;
    sum += sum_be_words(segment);
    let cksum = finalize_checksum(sum);
    // An all-zero UDP checksum means "none".
    if cksum == 0 && proto == IP_PROTO_UDP {
        0xffff
    } else {
        cksum
    }
}

fn finalize_checksum(mut sum: u64) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn sum_be_words(data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u64 = chunks
        .by_ref()
        .map(|w| u16::from_be_bytes([w[0], w[1]]) as u64)
        .sum();
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u64;
    }
    sum
}

/// Build an IPv4 header with the don't-fragment bit set.
pub fn build_ip_header(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload_len: usize) -> [u8; 20] {
    let total_len = (IPV4_HEADER_LEN + payload_len) as u16;
    let mut hdr = [0u8; IPV4_HEADER_LEN];
    hdr[0] = 0x45;
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[6..8].copy_from_slice(&[0x40, 0]);
    hdr[8] = 64;
    hdr[9] = proto;
    hdr[12..16].copy_from_slice(&src.octets());
    hdr[16..20].copy_from_slice(&dst.octets());

    let cksum = checksum(&hdr);
    hdr[10..12].copy_from_slice(&cksum.to_be_bytes());
    hdr
}

/// Addressing of a UDP datagram wrapped into an Ethernet frame.
#[derive(Debug, Clone, Copy)]
pub struct UdpFrameAddrs {
    pub src_mac: EthernetAddress,
    pub dst_mac: EthernetAddress,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Build a complete Ethernet + IPv4 + UDP frame around `data`.
pub fn build_udp_frame(addrs: &UdpFrameAddrs, data: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + data.len();
    let mut udp = Vec::with_capacity(udp_len);
    udp.extend_from_slice(&addrs.src_port.to_be_bytes());
    udp.extend_from_slice(&addrs.dst_port.to_be_bytes());
    udp.extend_from_slice(&(udp_len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(data);

    let cksum = tcp_udp_checksum(addrs.src_ip, addrs.dst_ip, IP_PROTO_UDP, &udp);
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    let ip = build_ip_header(addrs.src_ip, addrs.dst_ip, IP_PROTO_UDP, udp_len);
    let eth = build_eth_header(addrs.dst_mac, addrs.src_mac, ETHERTYPE_IPV4);

    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + IPV4_HEADER_LEN + udp_len);
    frame.extend_from_slice(&eth);
    frame.extend_from_slice(&ip);
    frame.extend_from_slice(&udp);
    frame
}

/// Destination MAC of a frame, if it is long enough to have one.
pub fn dst_mac(frame: &[u8]) -> Option<EthernetAddress> {
    frame.get(0..6).map(EthernetAddress::from_bytes)
}

/// Source MAC of a frame, if it is long enough to have one.
pub fn src_mac(frame: &[u8]) -> Option<EthernetAddress> {
    frame.get(6..12).map(EthernetAddress::from_bytes)
}

/// Formats a MAC as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(mac: &EthernetAddress) -> String {
    let b = mac.as_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

/// Decoded one-line rendering of a frame for debug logs.
pub fn pretty(frame: &[u8]) -> String {
    PrettyPrinter::<EthernetFrame<&[u8]>>::new("", &frame).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{EthernetFrame, Ipv4Packet, UdpPacket};

    #[test]
    fn test_checksum_of_valid_header_is_zero() {
        let hdr = build_ip_header(
            Ipv4Addr::new(192, 168, 127, 1),
            Ipv4Addr::new(192, 168, 127, 2),
            IP_PROTO_UDP,
            12,
        );
        assert_eq!(checksum(&hdr), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0xff]), !0xff00u16);
    }

    #[test]
    fn test_build_udp_frame_parses() {
        let addrs = UdpFrameAddrs {
            src_mac: EthernetAddress([2, 0, 0, 0, 0, 1]),
            dst_mac: EthernetAddress([2, 0, 0, 0, 0, 2]),
            src_ip: Ipv4Addr::new(192, 168, 127, 1),
            dst_ip: Ipv4Addr::new(192, 168, 127, 2),
            src_port: 53,
            dst_port: 40000,
        };
        let frame = build_udp_frame(&addrs, b"hello");

        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.dst_addr(), addrs.dst_mac);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert!(ip.verify_checksum());
        assert_eq!(ip.dst_addr(), addrs.dst_ip);
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert!(udp.verify_checksum(&addrs.src_ip.into(), &addrs.dst_ip.into()));
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.payload(), b"hello");
    }
}
