//! ARP replies for the gateway's virtual addresses.

use crate::eth::{build_eth_header, ETHERTYPE_ARP, ETH_HEADER_LEN};
use smoltcp::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetAddress};
use std::net::Ipv4Addr;

/// Sender of an ARP packet, used to learn neighbors.
pub fn sender(payload: &[u8]) -> Option<(Ipv4Addr, EthernetAddress)> {
    let arp = ArpPacket::new_checked(payload).ok()?;
    match ArpRepr::parse(&arp).ok()? {
        ArpRepr::EthernetIpv4 {
            source_hardware_addr,
            source_protocol_addr,
            ..
        } => Some((source_protocol_addr, source_hardware_addr)),
        _ => None,
    }
}

/// Answers an ARP request for one of `virtual_ips` with the gateway MAC.
pub fn reply_for_virtual_ip(
    payload: &[u8],
    gateway_mac: EthernetAddress,
    virtual_ips: &[Ipv4Addr],
) -> Option<Vec<u8>> {
    let arp = ArpPacket::new_checked(payload).ok()?;
    let ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr,
        source_protocol_addr,
        target_protocol_addr,
        ..
    } = ArpRepr::parse(&arp).ok()?
    else {
        return None;
    };
    if !virtual_ips.contains(&target_protocol_addr) {
        return None;
    }

    tracing::debug!(ip = %target_protocol_addr, "ARP request for virtual IP");

    let reply = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: gateway_mac,
        source_protocol_addr: target_protocol_addr,
        target_hardware_addr: source_hardware_addr,
        target_protocol_addr: source_protocol_addr,
    };
    let mut frame = vec![0u8; ETH_HEADER_LEN + reply.buffer_len()];
    frame[..ETH_HEADER_LEN].copy_from_slice(&build_eth_header(source_hardware_addr, gateway_mac, ETHERTYPE_ARP));
    reply.emit(&mut ArpPacket::new_unchecked(&mut frame[ETH_HEADER_LEN..]));
    Some(frame)
}
